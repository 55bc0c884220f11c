use crate::{common::*, matcher::Match, observer::SummaryObserver};
use tch_goodies::non_max_suppression;

/// The per-anchor loss used to rank examples for mining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MinerLossType {
    /// Weighted sum of both losses.
    Both,
    Cls,
    Loc,
}

impl Default for MinerLossType {
    fn default() -> Self {
        Self::Both
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardExampleMinerInit {
    /// The maximum number of examples per image. Unset keeps every
    /// surviving example.
    pub num_hard_examples: Option<usize>,
    pub iou_threshold: R64,
    pub loss_type: MinerLossType,
    pub cls_loss_weight: R64,
    pub loc_loss_weight: R64,
    /// Caps the negatives to this multiple of the positives.
    pub max_negatives_per_positive: Option<R64>,
    pub min_negatives_per_image: usize,
}

impl Default for HardExampleMinerInit {
    fn default() -> Self {
        Self {
            num_hard_examples: Some(64),
            iou_threshold: r64(0.7),
            loss_type: MinerLossType::Both,
            cls_loss_weight: r64(0.05),
            loc_loss_weight: r64(0.06),
            max_negatives_per_positive: None,
            min_negatives_per_image: 0,
        }
    }
}

impl HardExampleMinerInit {
    pub fn build(&self) -> Result<HardExampleMiner> {
        let Self {
            num_hard_examples,
            iou_threshold,
            loss_type,
            cls_loss_weight,
            loc_loss_weight,
            max_negatives_per_positive,
            min_negatives_per_image,
        } = *self;

        ensure!(
            (0.0..=1.0).contains(&iou_threshold.raw()),
            "iou_threshold must be in range [0, 1], but get {}",
            iou_threshold
        );
        ensure!(
            cls_loss_weight >= 0.0 && loc_loss_weight >= 0.0,
            "loss weights must be non-negative"
        );
        if let Some(ratio) = max_negatives_per_positive {
            ensure!(
                ratio >= 0.0,
                "max_negatives_per_positive must be non-negative"
            );
        }

        Ok(HardExampleMiner {
            num_hard_examples,
            iou_threshold: iou_threshold.raw(),
            loss_type,
            cls_loss_weight: cls_loss_weight.raw(),
            loc_loss_weight: loc_loss_weight.raw(),
            max_negatives_per_positive: max_negatives_per_positive.map(|ratio| ratio.raw()),
            min_negatives_per_image: min_negatives_per_image as i64,
        })
    }
}

/// Selects the hardest anchors per image by running NMS over the decoded
/// boxes scored by their losses.
#[derive(Debug, Clone)]
pub struct HardExampleMiner {
    num_hard_examples: Option<usize>,
    iou_threshold: f64,
    loss_type: MinerLossType,
    cls_loss_weight: f64,
    loc_loss_weight: f64,
    max_negatives_per_positive: Option<f64>,
    min_negatives_per_image: i64,
}

/// The mined losses with per-image selection statistics.
#[derive(Debug, TensorLike)]
pub struct MinedLosses {
    /// Scalar sum of the selected localization losses.
    pub location_loss: Tensor,
    /// Scalar sum of the selected classification losses.
    pub cls_loss: Tensor,
    /// Per-image counts, present when the negative ratio is capped.
    #[tensor_like(clone)]
    pub num_positives: Vec<i64>,
    #[tensor_like(clone)]
    pub num_negatives: Vec<i64>,
}

impl MinedLosses {
    pub fn summarize(&self, observer: &dyn SummaryObserver) {
        if self.num_positives.is_empty() {
            return;
        }
        let mean = |values: &[i64]| values.iter().sum::<i64>() as f64 / values.len() as f64;
        observer.scalar(
            "HardExampleMiner/NumPositives",
            mean(&self.num_positives),
        );
        observer.scalar(
            "HardExampleMiner/NumNegatives",
            mean(&self.num_negatives),
        );
    }
}

impl HardExampleMiner {
    /// Mine the `[B, A]` losses.
    ///
    /// `decoded_boxes` holds the predicted boxes of each image. The negative
    /// ratio is capped only when `matches` is non-empty.
    pub fn forward(
        &self,
        location_losses: &Tensor,
        cls_losses: &Tensor,
        decoded_boxes: &[BoxList],
        matches: &[Match],
    ) -> Result<MinedLosses> {
        let (batch_size, num_anchors) = location_losses.size2()?;
        ensure!(
            cls_losses.size() == [batch_size, num_anchors],
            "classification losses must have shape [{}, {}], but get {:?}",
            batch_size,
            num_anchors,
            cls_losses.size()
        );
        ensure!(
            decoded_boxes.len() == batch_size as usize,
            "expect {} decoded box lists, but get {}",
            batch_size,
            decoded_boxes.len()
        );
        ensure!(
            matches.is_empty() || matches.len() == batch_size as usize,
            "expect {} matches, but get {}",
            batch_size,
            matches.len()
        );

        let mut mined_location_losses = vec![];
        let mut mined_cls_losses = vec![];
        let mut num_positives = vec![];
        let mut num_negatives = vec![];

        for (index, boxes) in decoded_boxes.iter().enumerate() {
            let index_ = index as i64;
            let location_loss = location_losses.select(0, index_);
            let cls_loss = cls_losses.select(0, index_);

            let image_losses = match self.loss_type {
                MinerLossType::Cls => cls_loss.detach(),
                MinerLossType::Loc => location_loss.detach(),
                MinerLossType::Both => {
                    cls_loss.detach() * self.cls_loss_weight
                        + location_loss.detach() * self.loc_loss_weight
                }
            };
            let max_output_size = self
                .num_hard_examples
                .unwrap_or_else(|| boxes.num_boxes() as usize);
            let mut selected =
                non_max_suppression(boxes, &image_losses, self.iou_threshold, max_output_size)?;

            if let (Some(ratio), Some(matches)) =
                (self.max_negatives_per_positive, matches.get(index))
            {
                let (subsampled, positives, negatives) =
                    self.subsample_selection(&selected, matches, ratio)?;
                selected = subsampled;
                num_positives.push(positives);
                num_negatives.push(negatives);
            }

            mined_location_losses.push(location_loss.index_select(0, &selected).sum(Kind::Float));
            mined_cls_losses.push(cls_loss.index_select(0, &selected).sum(Kind::Float));
        }

        Ok(MinedLosses {
            location_loss: Tensor::f_stack(&mined_location_losses, 0)?.sum(Kind::Float),
            cls_loss: Tensor::f_stack(&mined_cls_losses, 0)?.sum(Kind::Float),
            num_positives,
            num_negatives,
        })
    }

    /// Keep every selected positive and, in selection order, the selected
    /// examples until the count of unmatched ones exceeds the cap.
    fn subsample_selection(
        &self,
        indices: &Tensor,
        matches: &Match,
        max_negatives_per_positive: f64,
    ) -> Result<(Tensor, i64, i64)> {
        let positives = matches
            .matched_column_indicator()
            .f_index_select(0, indices)?;
        let negatives = matches
            .unmatched_column_indicator()
            .f_index_select(0, indices)?;

        let num_positives = i64::from(positives.sum(Kind::Int64));
        let max_negatives = self
            .min_negatives_per_image
            .max((max_negatives_per_positive * num_positives as f64) as i64);

        let within_cap = negatives
            .to_kind(Kind::Int64)
            .cumsum(0, Kind::Int64)
            .le(max_negatives);
        let keep = positives.logical_or(&within_cap).nonzero().view([-1]);
        let num_negatives = keep.size()[0] - num_positives;

        Ok((indices.index_select(0, &keep), num_positives, num_negatives))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn disjoint_boxes(num_boxes: i64) -> BoxList {
        let coords: Vec<f32> = (0..num_boxes)
            .flat_map(|index| {
                let offset = index as f32 * 2.0;
                vec![offset, offset, offset + 1.0, offset + 1.0]
            })
            .collect();
        BoxList::new(Tensor::of_slice(&coords).view([-1, 4])).unwrap()
    }

    #[test]
    fn select_hardest_classification_losses() {
        let miner = HardExampleMinerInit {
            num_hard_examples: Some(2),
            loss_type: MinerLossType::Cls,
            ..Default::default()
        }
        .build()
        .unwrap();

        let location_losses = Tensor::of_slice(&[1f32, 2.0, 3.0, 4.0]).view([1, 4]);
        let cls_losses = Tensor::of_slice(&[0.1f32, 0.9, 0.5, 0.2]).view([1, 4]);
        let mined = miner
            .forward(&location_losses, &cls_losses, &[disjoint_boxes(4)], &[])
            .unwrap();

        assert_abs_diff_eq!(f64::from(&mined.cls_loss), 1.4, epsilon = 1e-6);
        assert_abs_diff_eq!(f64::from(&mined.location_loss), 5.0, epsilon = 1e-6);
        assert!(mined.num_positives.is_empty());
    }

    #[test]
    fn overlapping_boxes_are_mined_once() {
        let miner = HardExampleMinerInit {
            num_hard_examples: None,
            loss_type: MinerLossType::Loc,
            ..Default::default()
        }
        .build()
        .unwrap();

        let boxes = BoxList::new(
            Tensor::of_slice(&[0f32, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0])
                .view([3, 4]),
        )
        .unwrap();
        let location_losses = Tensor::of_slice(&[1f32, 2.0, 3.0]).view([1, 3]);
        let cls_losses = Tensor::zeros(&[1, 3], (Kind::Float, Device::Cpu));
        let mined = miner
            .forward(&location_losses, &cls_losses, &[boxes], &[])
            .unwrap();

        assert_abs_diff_eq!(f64::from(&mined.location_loss), 5.0, epsilon = 1e-6);
    }

    #[test]
    fn cap_negatives_per_positive() {
        let miner = HardExampleMinerInit {
            num_hard_examples: None,
            loss_type: MinerLossType::Cls,
            max_negatives_per_positive: Some(r64(1.0)),
            ..Default::default()
        }
        .build()
        .unwrap();

        let location_losses = Tensor::zeros(&[1, 5], (Kind::Float, Device::Cpu));
        let cls_losses = Tensor::of_slice(&[5f32, 4.0, 3.0, 2.0, 1.0]).view([1, 5]);
        let matches = Match::new(Tensor::of_slice(&[-1i64, 0, -1, -1, 1])).unwrap();
        let mined = miner
            .forward(&location_losses, &cls_losses, &[disjoint_boxes(5)], &[matches])
            .unwrap();

        // anchors 0, 1, 2 and 4 are kept: two positives and two negatives
        assert_abs_diff_eq!(f64::from(&mined.cls_loss), 13.0, epsilon = 1e-6);
        assert_eq!(mined.num_positives, vec![2]);
        assert_eq!(mined.num_negatives, vec![2]);
    }

    #[test]
    fn min_negatives_per_image() {
        let miner = HardExampleMinerInit {
            num_hard_examples: None,
            loss_type: MinerLossType::Cls,
            max_negatives_per_positive: Some(r64(3.0)),
            min_negatives_per_image: 1,
            ..Default::default()
        }
        .build()
        .unwrap();

        let location_losses = Tensor::zeros(&[1, 3], (Kind::Float, Device::Cpu));
        let cls_losses = Tensor::of_slice(&[3f32, 2.0, 1.0]).view([1, 3]);
        let matches = Match::new(Tensor::of_slice(&[-1i64, -1, -1])).unwrap();
        let mined = miner
            .forward(&location_losses, &cls_losses, &[disjoint_boxes(3)], &[matches])
            .unwrap();

        assert_abs_diff_eq!(f64::from(&mined.cls_loss), 3.0, epsilon = 1e-6);
        assert_eq!(mined.num_positives, vec![0]);
        assert_eq!(mined.num_negatives, vec![1]);
    }

    #[test]
    fn mismatched_batch_is_an_error() {
        let miner = HardExampleMinerInit::default().build().unwrap();
        let losses = Tensor::zeros(&[2, 3], (Kind::Float, Device::Cpu));
        assert!(miner
            .forward(&losses, &losses, &[disjoint_boxes(3)], &[])
            .is_err());
    }
}
