//! Per-anchor classification and regression targets.

use crate::{
    box_coder::BoxCoder,
    common::*,
    matcher::{Match, Matcher, RegionSimilarity},
};

pub struct TargetAssignerInit {
    pub similarity: RegionSimilarity,
    pub matcher: Box<dyn Matcher>,
    pub box_coder: Arc<dyn BoxCoder>,
    pub positive_class_weight: f64,
    pub negative_class_weight: f64,
    /// The class target of unmatched and ignored anchors. Defaults to the
    /// one-hot background label, background 1 and every class 0.
    pub unmatched_cls_target: Option<Tensor>,
}

impl TargetAssignerInit {
    pub fn new(matcher: Box<dyn Matcher>, box_coder: Arc<dyn BoxCoder>) -> Self {
        Self {
            similarity: RegionSimilarity::Iou,
            matcher,
            box_coder,
            positive_class_weight: 1.0,
            negative_class_weight: 1.0,
            unmatched_cls_target: None,
        }
    }

    pub fn build(self) -> Result<TargetAssigner> {
        let Self {
            similarity,
            matcher,
            box_coder,
            positive_class_weight,
            negative_class_weight,
            unmatched_cls_target,
        } = self;

        ensure!(
            positive_class_weight >= 0.0 && negative_class_weight >= 0.0,
            "class weights must be non-negative, but get positive={} and negative={}",
            positive_class_weight,
            negative_class_weight
        );

        Ok(TargetAssigner {
            similarity,
            matcher,
            box_coder,
            positive_class_weight,
            negative_class_weight,
            unmatched_cls_target,
        })
    }
}

/// Assigns groundtruth to anchors through a similarity, a matcher and a box
/// coder.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct TargetAssigner {
    similarity: RegionSimilarity,
    matcher: Box<dyn Matcher>,
    box_coder: Arc<dyn BoxCoder>,
    positive_class_weight: f64,
    negative_class_weight: f64,
    #[derivative(Debug = "ignore")]
    unmatched_cls_target: Option<Tensor>,
}

/// Targets of one image.
#[derive(Debug, TensorLike)]
pub struct AssignedTargets {
    /// `[A, C + 1]`
    pub cls_targets: Tensor,
    /// `[A]`
    pub cls_weights: Tensor,
    /// `[A, code_size]`
    pub reg_targets: Tensor,
    /// `[A]`
    pub reg_weights: Tensor,
    /// `[C + 1]`
    pub image_level_cls_targets: Tensor,
    pub matches: Match,
}

/// Targets stacked over a batch.
#[derive(Debug, TensorLike)]
pub struct BatchTargets {
    /// `[B, A, C + 1]`
    pub cls_targets: Tensor,
    /// `[B, A]`
    pub cls_weights: Tensor,
    /// `[B, A, code_size]`
    pub reg_targets: Tensor,
    /// `[B, A]`
    pub reg_weights: Tensor,
    /// `[B, C + 1]`
    pub image_level_cls_targets: Tensor,
    pub matches: Vec<Match>,
}

impl TargetAssigner {
    pub fn box_coder(&self) -> &dyn BoxCoder {
        self.box_coder.as_ref()
    }

    /// Assign targets of one image.
    ///
    /// `groundtruth_labels` has shape `[G, C + 1]` and
    /// `groundtruth_image_level_labels` has shape `[C + 1]`. Groundtruth
    /// keypoints are taken from the keypoints field of `groundtruth_boxes`.
    pub fn assign(
        &self,
        anchors: &BoxList,
        groundtruth_boxes: &BoxList,
        groundtruth_labels: &Tensor,
        groundtruth_image_level_labels: &Tensor,
    ) -> Result<AssignedTargets> {
        let num_gt_boxes = groundtruth_boxes.num_boxes();
        let label_size = groundtruth_labels.size();
        ensure!(
            label_size.len() >= 2 && label_size[0] == num_gt_boxes,
            "groundtruth labels must have shape [{}, ...], but get {:?}",
            num_gt_boxes,
            label_size
        );
        groundtruth_image_level_labels
            .f_size_of_rank(1, "groundtruth_image_level_labels")?;

        let device = anchors.device();
        let unmatched_cls_target = match &self.unmatched_cls_target {
            Some(target) => target.to_device(device),
            None => background_label(&label_size[1..], groundtruth_labels.kind(), device)?,
        };
        ensure!(
            unmatched_cls_target.size() == label_size[1..],
            "unmatched_cls_target must have shape {:?}, but get {:?}",
            &label_size[1..],
            unmatched_cls_target.size()
        );

        let similarity = self.similarity.compare(groundtruth_boxes, anchors);
        let matches = self.matcher.match_columns(&similarity)?;
        ensure!(
            matches.num_columns() == anchors.num_boxes(),
            "the matcher returns {} columns, but there are {} anchors",
            matches.num_columns(),
            anchors.num_boxes()
        );

        let reg_targets = self.create_regression_targets(anchors, groundtruth_boxes, &matches)?;
        let cls_targets = matches.gather_based_on_match(
            groundtruth_labels,
            &unmatched_cls_target,
            &unmatched_cls_target,
        )?;
        let reg_weights = matches.matched_column_indicator().to_kind(Kind::Float);
        let cls_weights = reg_weights.shallow_clone() * self.positive_class_weight
            + matches.unmatched_column_indicator().to_kind(Kind::Float)
                * self.negative_class_weight;

        Ok(AssignedTargets {
            cls_targets,
            cls_weights,
            reg_targets,
            reg_weights,
            image_level_cls_targets: groundtruth_image_level_labels.to_device(device),
            matches,
        })
    }

    fn create_regression_targets(
        &self,
        anchors: &BoxList,
        groundtruth_boxes: &BoxList,
        matches: &Match,
    ) -> Result<Tensor> {
        let device = anchors.device();
        let zero_box = Tensor::zeros(&[4], (Kind::Float, device));
        let matched_boxes = matches.gather_based_on_match(
            &groundtruth_boxes.boxes().to_kind(Kind::Float),
            &zero_box,
            &zero_box,
        )?;
        let mut matched_gt = BoxList::new(matched_boxes)?;

        if let Some(keypoints) = groundtruth_boxes.field(fields::KEYPOINTS) {
            let keypoints = keypoints.to_kind(Kind::Float);
            let zero_keypoints = Tensor::zeros(&keypoints.size()[1..], (Kind::Float, device));
            let matched_keypoints =
                matches.gather_based_on_match(&keypoints, &zero_keypoints, &zero_keypoints)?;
            matched_gt.add_field(fields::KEYPOINTS, matched_keypoints)?;
        }

        let encoded = self.box_coder.encode(&matched_gt, anchors)?;
        let unmatched = matches.unmatched_or_ignored_column_indicator().unsqueeze(1);
        Ok(encoded.masked_fill(&unmatched, 0.0))
    }

    /// Assign targets image by image and stack the results.
    pub fn batch_assign(
        &self,
        anchors: &BoxList,
        groundtruth_boxes_list: &[BoxList],
        groundtruth_labels_list: &[Tensor],
        groundtruth_image_level_labels_list: &[Tensor],
    ) -> Result<BatchTargets> {
        let batch_size = groundtruth_boxes_list.len();
        ensure!(
            groundtruth_labels_list.len() == batch_size
                && groundtruth_image_level_labels_list.len() == batch_size,
            "groundtruth lists must have the same length, but get {} boxes, {} labels and {} \
             image level labels",
            batch_size,
            groundtruth_labels_list.len(),
            groundtruth_image_level_labels_list.len()
        );
        ensure!(batch_size > 0, "the batch must not be empty");

        let (
            cls_targets,
            cls_weights,
            reg_targets,
            reg_weights,
            image_level_cls_targets,
            matches,
        ) = izip!(
            groundtruth_boxes_list,
            groundtruth_labels_list,
            groundtruth_image_level_labels_list
        )
        .map(|(boxes, labels, image_level_labels)| -> Result<_> {
            let AssignedTargets {
                cls_targets,
                cls_weights,
                reg_targets,
                reg_weights,
                image_level_cls_targets,
                matches,
            } = self.assign(anchors, boxes, labels, image_level_labels)?;
            Ok((
                cls_targets,
                cls_weights,
                reg_targets,
                reg_weights,
                image_level_cls_targets,
                matches,
            ))
        })
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .unzip_n_vec();

        Ok(BatchTargets {
            cls_targets: Tensor::f_stack(&cls_targets, 0)?,
            cls_weights: Tensor::f_stack(&cls_weights, 0)?,
            reg_targets: Tensor::f_stack(&reg_targets, 0)?,
            reg_weights: Tensor::f_stack(&reg_weights, 0)?,
            image_level_cls_targets: Tensor::f_stack(&image_level_cls_targets, 0)?,
            matches,
        })
    }
}

/// A label shaped `shape` with 1 at the first background entry and 0
/// elsewhere.
pub fn background_label(shape: &[i64], kind: Kind, device: Device) -> Result<Tensor> {
    ensure!(
        !shape.is_empty() && shape[0] > 0,
        "the label shape must have a non-empty leading dimension, but get {:?}",
        shape
    );
    let label = Tensor::zeros(shape, (kind, device));
    let _ = label.narrow(0, 0, 1).fill_(1.0);
    Ok(label)
}
