use super::{check_shapes, mask_zero_weights, sigmoid_cross_entropy_with_logits};
use crate::common::*;

/// Anchor-wise classification loss.
pub trait ClassificationLoss: Debug + Send + Sync {
    /// Unweighted per-entry loss of `[B, A, C + 1]` logits and targets.
    fn entrywise_loss(&self, prediction: &Tensor, target: &Tensor) -> Tensor;

    /// Weighted `[B, A]` loss summed over classes. Anchors of zero weight
    /// contribute zero.
    fn forward(&self, prediction: &Tensor, target: &Tensor, weights: &Tensor) -> Result<Tensor> {
        check_shapes(prediction, target, weights)?;
        let losses = self
            .entrywise_loss(prediction, &target.to_kind(prediction.kind()))
            .sum_dim_intlist(&[2], false, Kind::Float)
            * weights;
        Ok(mask_zero_weights(losses, weights))
    }
}

/// Independent sigmoid cross entropy per class.
#[derive(Debug, Clone, Default)]
pub struct WeightedSigmoidClassificationLoss;

impl ClassificationLoss for WeightedSigmoidClassificationLoss {
    fn entrywise_loss(&self, prediction: &Tensor, target: &Tensor) -> Tensor {
        sigmoid_cross_entropy_with_logits(prediction, target)
    }
}

/// Softmax cross entropy over classes. The logits are divided by
/// `logit_scale` first.
#[derive(Debug, Clone)]
pub struct WeightedSoftmaxClassificationLoss {
    logit_scale: f64,
}

impl WeightedSoftmaxClassificationLoss {
    pub fn new(logit_scale: f64) -> Result<Self> {
        ensure!(logit_scale > 0.0, "logit_scale must be positive");
        Ok(Self { logit_scale })
    }
}

impl ClassificationLoss for WeightedSoftmaxClassificationLoss {
    fn entrywise_loss(&self, prediction: &Tensor, target: &Tensor) -> Tensor {
        let log_probs = (prediction / self.logit_scale).log_softmax(2, Kind::Float);
        -(target * log_probs)
    }
}

/// Sigmoid cross entropy down-weighting well classified entries.
#[derive(Debug, Clone)]
pub struct SigmoidFocalClassificationLoss {
    gamma: f64,
    alpha: Option<f64>,
}

impl SigmoidFocalClassificationLoss {
    pub fn new(gamma: f64, alpha: Option<f64>) -> Result<Self> {
        ensure!(gamma >= 0.0, "gamma must be non-negative");
        if let Some(alpha) = alpha {
            ensure!(
                (0.0..=1.0).contains(&alpha),
                "alpha must be in range [0, 1]"
            );
        }
        Ok(Self { gamma, alpha })
    }
}

impl Default for SigmoidFocalClassificationLoss {
    fn default() -> Self {
        Self {
            gamma: 2.0,
            alpha: Some(0.25),
        }
    }
}

impl ClassificationLoss for SigmoidFocalClassificationLoss {
    fn entrywise_loss(&self, prediction: &Tensor, target: &Tensor) -> Tensor {
        let cross_entropy = sigmoid_cross_entropy_with_logits(prediction, target);
        let probs = prediction.sigmoid();
        let p_t = target * &probs + (1.0 - target) * (1.0 - &probs);

        // (1 - p_t)^gamma, computed in log space
        let modulating_factor = if self.gamma == 0.0 {
            Tensor::ones_like(&p_t)
        } else {
            ((1.0 - p_t).clamp_min(1e-12).log() * self.gamma).exp()
        };
        let focal = modulating_factor * cross_entropy;

        match self.alpha {
            Some(alpha) => (target * alpha + (1.0 - target) * (1.0 - alpha)) * focal,
            None => focal,
        }
    }
}

/// Whether bootstrapped targets use raw probabilities or thresholded ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapType {
    Soft,
    Hard,
}

/// Sigmoid cross entropy against a blend of the targets and the model's own
/// predictions.
#[derive(Debug, Clone)]
pub struct BootstrappedSigmoidClassificationLoss {
    alpha: f64,
    bootstrap_type: BootstrapType,
}

impl BootstrappedSigmoidClassificationLoss {
    pub fn new(alpha: f64, bootstrap_type: BootstrapType) -> Result<Self> {
        ensure!(
            (0.0..=1.0).contains(&alpha),
            "alpha must be in range [0, 1]"
        );
        Ok(Self {
            alpha,
            bootstrap_type,
        })
    }
}

impl ClassificationLoss for BootstrappedSigmoidClassificationLoss {
    fn entrywise_loss(&self, prediction: &Tensor, target: &Tensor) -> Tensor {
        let probs = prediction.sigmoid();
        let predicted = match self.bootstrap_type {
            BootstrapType::Soft => probs,
            BootstrapType::Hard => probs.gt(0.5).to_kind(prediction.kind()),
        };
        let bootstrap_target = target * self.alpha + predicted * (1.0 - self.alpha);
        sigmoid_cross_entropy_with_logits(prediction, &bootstrap_target)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClassificationLossConfig {
    WeightedSigmoid,
    WeightedSoftmax {
        #[serde(default = "default_logit_scale")]
        logit_scale: R64,
    },
    SigmoidFocal {
        #[serde(default = "default_gamma")]
        gamma: R64,
        #[serde(default = "default_alpha")]
        alpha: Option<R64>,
    },
    BootstrappedSigmoid {
        alpha: R64,
        bootstrap_type: BootstrapType,
    },
}

fn default_logit_scale() -> R64 {
    r64(1.0)
}

fn default_gamma() -> R64 {
    r64(2.0)
}

fn default_alpha() -> Option<R64> {
    Some(r64(0.25))
}

impl Default for ClassificationLossConfig {
    fn default() -> Self {
        Self::WeightedSigmoid
    }
}

impl ClassificationLossConfig {
    pub fn build(&self) -> Result<Box<dyn ClassificationLoss>> {
        let loss: Box<dyn ClassificationLoss> = match *self {
            Self::WeightedSigmoid => Box::new(WeightedSigmoidClassificationLoss),
            Self::WeightedSoftmax { logit_scale } => {
                Box::new(WeightedSoftmaxClassificationLoss::new(logit_scale.raw())?)
            }
            Self::SigmoidFocal { gamma, alpha } => Box::new(SigmoidFocalClassificationLoss::new(
                gamma.raw(),
                alpha.map(|alpha| alpha.raw()),
            )?),
            Self::BootstrappedSigmoid {
                alpha,
                bootstrap_type,
            } => Box::new(BootstrappedSigmoidClassificationLoss::new(
                alpha.raw(),
                bootstrap_type,
            )?),
        };
        Ok(loss)
    }
}
