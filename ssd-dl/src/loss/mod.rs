//! Loss functions of the detection heads.

mod classification;
mod hard_example_miner;
mod localization;
mod ssd_loss;

pub use classification::*;
pub use hard_example_miner::*;
pub use localization::*;
pub use ssd_loss::*;

use crate::common::*;

/// Check that predictions and targets agree in shape and that the weights
/// match their two leading dimensions.
fn check_shapes(prediction: &Tensor, target: &Tensor, weights: &Tensor) -> Result<()> {
    let pred_size = prediction.f_size_of_rank(3, "prediction")?;
    ensure!(
        target.size() == pred_size,
        "prediction and target shapes differ: {:?} vs {:?}",
        pred_size,
        target.size()
    );
    ensure!(
        weights.size() == pred_size[..2],
        "weights must have shape {:?}, but get {:?}",
        &pred_size[..2],
        weights.size()
    );
    Ok(())
}

/// Per-entry sigmoid cross entropy computed from logits.
fn sigmoid_cross_entropy_with_logits(logits: &Tensor, labels: &Tensor) -> Tensor {
    logits.clamp_min(0.0) - logits * labels + (-logits.abs()).exp().log1p()
}

/// Zero out the entries of `losses` whose weight is zero.
fn mask_zero_weights(losses: Tensor, weights: &Tensor) -> Tensor {
    losses.masked_fill(&weights.eq(0.0), 0.0)
}
