//! The detector model and its components.

mod box_predictor;
mod class_predictor;
mod conv;
mod feature_extractor;
mod image_resizer;
mod meta_arch;
mod output;
mod simple_conv;
mod two_stream;

pub use box_predictor::*;
pub use class_predictor::*;
pub use conv::*;
pub use feature_extractor::*;
pub use image_resizer::*;
pub use meta_arch::*;
pub use output::*;
pub use simple_conv::*;
pub use two_stream::*;
