//! Export and inference of trained single-shot detectors.

mod common;
pub mod config;
pub mod decoder;
pub mod exporter;
pub mod input;
pub mod label_map;
pub mod runner;

pub use config::Config;
pub use exporter::{export_inference_graph, Signature};
pub use input::InputType;
pub use label_map::LabelMap;
pub use runner::{InferenceRunner, RunnerInput};
