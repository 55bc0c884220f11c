//! The building blocks of the single-shot detector.

mod common;
pub mod anchor;
pub mod box_coder;
pub mod config;
pub mod loss;
pub mod matcher;
pub mod model;
pub mod observer;
pub mod post_processing;
pub mod profiling;
pub mod target_assigner;

pub use config::SsdConfig;
pub use model::{DetectionOutput, GroundTruth, PredictionOutput, SsdMetaArch};
