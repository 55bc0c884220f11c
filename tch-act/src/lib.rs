#[cfg(feature = "tch")]
pub use impls::*;
#[cfg(feature = "tch")]
mod impls;

#[cfg(feature = "tch")]
pub use r#trait::*;
#[cfg(feature = "tch")]
mod r#trait;

/// Activation functions applied after convolutions of the detection heads
/// and feature extractors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Activation {
    Linear,
    Relu,
    Relu6,
    Leaky,
    Logistic,
    Swish,
    Elu,
    Tanh,
}

impl Default for Activation {
    fn default() -> Self {
        Self::Relu6
    }
}
