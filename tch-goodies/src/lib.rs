//! Tensor utilities shared by the detection crates.

pub mod box_list;
mod common;
pub mod nms;
pub mod tensor;

pub use box_list::*;
pub use nms::*;
pub use tensor::*;
