use super::{
    ClassificationLoss, ClassificationLossConfig, HardExampleMiner, HardExampleMinerInit,
    LocalizationLoss, LocalizationLossConfig,
};
use crate::common::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    pub localization: LocalizationLossConfig,
    pub classification: ClassificationLossConfig,
    pub image_level: ClassificationLossConfig,
    pub localization_weight: R64,
    pub classification_weight: R64,
    pub image_level_weight: R64,
    pub hard_example_miner: Option<HardExampleMinerInit>,
    /// Divide the anchor losses by the number of matched anchors.
    pub normalize_loss_by_num_matches: bool,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            localization: LocalizationLossConfig::WeightedSmoothL1,
            classification: ClassificationLossConfig::WeightedSigmoid,
            image_level: ClassificationLossConfig::WeightedSigmoid,
            localization_weight: r64(1.0),
            classification_weight: r64(1.0),
            image_level_weight: r64(1.0),
            hard_example_miner: None,
            normalize_loss_by_num_matches: true,
        }
    }
}

impl LossConfig {
    pub fn build(&self) -> Result<SsdLoss> {
        let Self {
            localization,
            ref classification,
            ref image_level,
            localization_weight,
            classification_weight,
            image_level_weight,
            ref hard_example_miner,
            normalize_loss_by_num_matches,
        } = *self;

        ensure!(
            localization_weight >= 0.0 && classification_weight >= 0.0 && image_level_weight >= 0.0,
            "loss weights must be non-negative"
        );

        Ok(SsdLoss {
            localization: localization.build(),
            classification: classification.build()?,
            image_level: image_level.build()?,
            localization_weight: localization_weight.raw(),
            classification_weight: classification_weight.raw(),
            image_level_weight: image_level_weight.raw(),
            hard_example_miner: hard_example_miner
                .as_ref()
                .map(|init| init.build())
                .transpose()?,
            normalize_loss_by_num_matches,
        })
    }
}

/// The loss components of the detector and how they are combined.
#[derive(Debug)]
pub struct SsdLoss {
    localization: Box<dyn LocalizationLoss>,
    classification: Box<dyn ClassificationLoss>,
    image_level: Box<dyn ClassificationLoss>,
    localization_weight: f64,
    classification_weight: f64,
    image_level_weight: f64,
    hard_example_miner: Option<HardExampleMiner>,
    normalize_loss_by_num_matches: bool,
}

/// The scalar losses of a batch.
#[derive(Debug, TensorLike)]
pub struct LossOutput {
    pub localization_loss: Tensor,
    pub classification_loss: Tensor,
    pub classification_loss_in_image_level: Tensor,
}

impl LossOutput {
    pub fn total_loss(&self) -> Tensor {
        &self.localization_loss
            + &self.classification_loss
            + &self.classification_loss_in_image_level
    }
}

impl SsdLoss {
    pub fn hard_example_miner(&self) -> Option<&HardExampleMiner> {
        self.hard_example_miner.as_ref()
    }

    /// Weighted `[B, A]` localization losses. NaN targets are ignored.
    pub fn localization_losses(
        &self,
        prediction: &Tensor,
        target: &Tensor,
        weights: &Tensor,
    ) -> Result<Tensor> {
        self.localization.forward(prediction, target, weights, true)
    }

    /// Weighted `[B, A]` classification losses.
    pub fn classification_losses(
        &self,
        prediction: &Tensor,
        target: &Tensor,
        weights: &Tensor,
    ) -> Result<Tensor> {
        self.classification.forward(prediction, target, weights)
    }

    /// Unweighted `[B]` image level losses of `[B, C + 1]` logits.
    pub fn image_level_losses(&self, prediction: &Tensor, target: &Tensor) -> Result<Tensor> {
        let (batch_size, num_classes) = prediction.size2()?;
        ensure!(
            target.size() == [batch_size, num_classes],
            "image level prediction and target shapes differ: {:?} vs {:?}",
            prediction.size(),
            target.size()
        );
        let weights = Tensor::ones(&[batch_size, 1], (Kind::Float, prediction.device()));
        let losses = self.image_level.forward(
            &prediction.view([batch_size, 1, num_classes]),
            &target.view([batch_size, 1, num_classes]),
            &weights,
        )?;
        Ok(losses.view([batch_size]))
    }

    /// Normalize and weight the summed losses.
    pub fn combine(
        &self,
        localization_loss: Tensor,
        classification_loss: Tensor,
        image_level_loss: Tensor,
        num_matches: i64,
    ) -> LossOutput {
        let normalizer = if self.normalize_loss_by_num_matches {
            num_matches.max(1) as f64
        } else {
            1.0
        };

        LossOutput {
            localization_loss: localization_loss * (self.localization_weight / normalizer),
            classification_loss: classification_loss * (self.classification_weight / normalizer),
            classification_loss_in_image_level: image_level_loss * self.image_level_weight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn combine_normalizes_anchor_losses_only() {
        let loss = LossConfig {
            localization_weight: r64(2.0),
            image_level_weight: r64(0.5),
            ..Default::default()
        }
        .build()
        .unwrap();

        let output = loss.combine(
            Tensor::from(8.0f32),
            Tensor::from(4.0f32),
            Tensor::from(6.0f32),
            4,
        );
        assert_abs_diff_eq!(f64::from(&output.localization_loss), 4.0, epsilon = 1e-6);
        assert_abs_diff_eq!(f64::from(&output.classification_loss), 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(
            f64::from(&output.classification_loss_in_image_level),
            3.0,
            epsilon = 1e-6
        );
        assert_abs_diff_eq!(f64::from(output.total_loss()), 8.0, epsilon = 1e-6);
    }

    #[test]
    fn zero_matches_normalize_by_one() {
        let loss = LossConfig::default().build().unwrap();
        let output = loss.combine(
            Tensor::from(3.0f32),
            Tensor::from(5.0f32),
            Tensor::from(0.0f32),
            0,
        );
        assert_abs_diff_eq!(f64::from(&output.localization_loss), 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(f64::from(&output.classification_loss), 5.0, epsilon = 1e-6);
    }

    #[test]
    fn image_level_losses() {
        let loss = LossConfig::default().build().unwrap();
        let prediction = Tensor::of_slice(&[0f32, 0.0, 0.0, 100.0]).view([2, 2]);
        let target = Tensor::of_slice(&[0f32, 1.0, 0.0, 1.0]).view([2, 2]);
        let losses = loss.image_level_losses(&prediction, &target).unwrap();
        let losses = Vec::<f32>::from(&losses);
        assert_abs_diff_eq!(losses[0] as f64, 2.0 * 2f64.ln(), epsilon = 1e-5);
        assert_abs_diff_eq!(losses[1] as f64, 2f64.ln(), epsilon = 1e-5);
    }
}
