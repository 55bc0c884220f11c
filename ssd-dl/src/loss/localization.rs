use super::{check_shapes, mask_zero_weights};
use crate::common::*;

/// Anchor-wise box regression loss.
pub trait LocalizationLoss: Debug + Send + Sync {
    /// Unweighted per-anchor loss of `[B, A, code_size]` inputs, of shape
    /// `[B, A]`.
    fn anchorwise_loss(&self, prediction: &Tensor, target: &Tensor) -> Tensor;

    /// Weighted `[B, A]` loss.
    ///
    /// With `ignore_nan_targets`, NaN target entries are replaced by the
    /// prediction and contribute zero. Anchors of zero weight always
    /// contribute zero.
    fn forward(
        &self,
        prediction: &Tensor,
        target: &Tensor,
        weights: &Tensor,
        ignore_nan_targets: bool,
    ) -> Result<Tensor> {
        check_shapes(prediction, target, weights)?;

        let target = if ignore_nan_targets {
            let nan_mask = target.isnan();
            target.masked_fill(&nan_mask, 0.0)
                + prediction.masked_fill(&nan_mask.logical_not(), 0.0)
        } else {
            target.shallow_clone()
        };

        let losses = self.anchorwise_loss(prediction, &target) * weights;
        Ok(mask_zero_weights(losses, weights))
    }
}

/// Smooth L1 (Huber) loss summed over the code dimension.
#[derive(Debug, Clone, Default)]
pub struct WeightedSmoothL1LocalizationLoss;

impl LocalizationLoss for WeightedSmoothL1LocalizationLoss {
    fn anchorwise_loss(&self, prediction: &Tensor, target: &Tensor) -> Tensor {
        let abs_diff = (prediction - target).abs();
        let quadratic = abs_diff.clamp_max(1.0);
        let linear = &abs_diff - &quadratic;
        (&quadratic * &quadratic * 0.5 + linear).sum_dim_intlist(&[2], false, Kind::Float)
    }
}

/// Half of the squared L2 norm of the difference.
#[derive(Debug, Clone, Default)]
pub struct WeightedL2LocalizationLoss;

impl LocalizationLoss for WeightedL2LocalizationLoss {
    fn anchorwise_loss(&self, prediction: &Tensor, target: &Tensor) -> Tensor {
        let diff = prediction - target;
        (&diff * &diff * 0.5).sum_dim_intlist(&[2], false, Kind::Float)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalizationLossConfig {
    WeightedSmoothL1,
    WeightedL2,
}

impl Default for LocalizationLossConfig {
    fn default() -> Self {
        Self::WeightedSmoothL1
    }
}

impl LocalizationLossConfig {
    pub fn build(&self) -> Box<dyn LocalizationLoss> {
        match self {
            Self::WeightedSmoothL1 => Box::new(WeightedSmoothL1LocalizationLoss),
            Self::WeightedL2 => Box::new(WeightedL2LocalizationLoss),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn smooth_l1_loss() {
        let prediction = Tensor::of_slice(&[2.0f32, 2.0, 0.5, 0.0, 0.0, 0.0, 0.0, 0.0])
            .view([1, 2, 4]);
        let target = Tensor::zeros(&[1, 2, 4], (Kind::Float, Device::Cpu));
        let weights = Tensor::of_slice(&[2.0f32, 1.0]).view([1, 2]);

        let losses = WeightedSmoothL1LocalizationLoss
            .forward(&prediction, &target, &weights, false)
            .unwrap();
        let losses = Vec::<f32>::from(&losses.view([-1]));
        // 1.5 + 1.5 + 0.125
        assert_abs_diff_eq!(losses[0], 2.0 * 3.125, epsilon = 1e-6);
        assert_abs_diff_eq!(losses[1], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn l2_loss() {
        let prediction = Tensor::of_slice(&[1.0f32, 2.0, 0.0, 0.0]).view([1, 1, 4]);
        let target = Tensor::zeros(&[1, 1, 4], (Kind::Float, Device::Cpu));
        let weights = Tensor::ones(&[1, 1], (Kind::Float, Device::Cpu));
        let losses = WeightedL2LocalizationLoss
            .forward(&prediction, &target, &weights, false)
            .unwrap();
        assert_abs_diff_eq!(f64::from(losses.sum(Kind::Float)), 2.5, epsilon = 1e-6);
    }

    #[test]
    fn nan_targets_and_zero_weights_contribute_nothing() {
        let prediction = Tensor::of_slice(&[0.5f32, 0.5, 0.5, 0.5, 3.0, 3.0, 3.0, 3.0])
            .view([1, 2, 4]);
        let target = Tensor::of_slice(&[f32::NAN, 0.5, 0.5, 0.5, f32::NAN, 0.0, 0.0, 0.0])
            .view([1, 2, 4]);
        let weights = Tensor::of_slice(&[1.0f32, 0.0]).view([1, 2]);

        let losses = WeightedSmoothL1LocalizationLoss
            .forward(&prediction, &target, &weights, true)
            .unwrap();
        let losses = Vec::<f32>::from(&losses.view([-1]));
        assert_eq!(losses, vec![0.0, 0.0]);
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let prediction = Tensor::zeros(&[1, 2, 4], (Kind::Float, Device::Cpu));
        let target = Tensor::zeros(&[1, 3, 4], (Kind::Float, Device::Cpu));
        let weights = Tensor::zeros(&[1, 2], (Kind::Float, Device::Cpu));
        let err = WeightedSmoothL1LocalizationLoss
            .forward(&prediction, &target, &weights, true)
            .unwrap_err();
        assert!(format!("{}", err).contains("[1, 2, 4]"));
    }
}
