use crate::{impls, Activation};
use tch::{nn::Module, Tensor};

pub trait TensorActivationExt {
    fn activation(&self, act: Activation) -> Tensor;

    /// ReLU clipped at 6.
    fn relu6(&self) -> Tensor;

    /// Swish activation function.
    fn swish(&self) -> Tensor;
}

impl TensorActivationExt for Tensor {
    fn activation(&self, act: Activation) -> Tensor {
        act.forward(self)
    }

    fn relu6(&self) -> Tensor {
        impls::relu6(self)
    }

    fn swish(&self) -> Tensor {
        impls::swish(self)
    }
}
