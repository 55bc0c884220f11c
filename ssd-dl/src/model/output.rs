//! Payloads passed between the stages of the detector.

use crate::common::*;

pub const BOX_ENCODINGS: &str = "box_encodings";
pub const CLASS_PREDICTIONS_WITH_BACKGROUND: &str = "class_predictions_with_background";
pub const CLASS_PREDICTIONS_IN_IMAGE_LEVEL: &str = "class_predictions_in_image_level";
pub const ANCHORS: &str = "anchors";
/// Feature maps are stored under `feature_maps/<index>`.
pub const FEATURE_MAPS_PREFIX: &str = "feature_maps/";

pub const DETECTION_BOXES: &str = "detection_boxes";
pub const DETECTION_SCORES: &str = "detection_scores";
pub const DETECTION_CLASSES: &str = "detection_classes";
pub const NUM_DETECTIONS: &str = "num_detections";
pub const DETECTION_SCORES_IN_IMAGE_LEVEL: &str = "detection_scores_in_image_level";
pub const DETECTION_CLASSES_IN_IMAGE_LEVEL: &str = "detection_classes_in_image_level";
pub const DETECTION_KEYPOINTS: &str = "detection_keypoints";
pub const DETECTION_MASKS: &str = "detection_masks";

/// The raw outputs of the detector heads together with the anchors they
/// were predicted on.
#[derive(Debug, Getters)]
pub struct PredictionOutput {
    /// `[B, A, code_size]`
    #[get = "pub"]
    box_encodings: Tensor,
    /// `[B, A, C + 1]` logits including background at index 0.
    #[get = "pub"]
    class_predictions_with_background: Tensor,
    /// `[B, C + 1]` logits.
    #[get = "pub"]
    class_predictions_in_image_level: Tensor,
    #[get = "pub"]
    feature_maps: Vec<Tensor>,
    /// The `A` anchors of this forward pass.
    #[get = "pub"]
    anchors: BoxList,
}

impl PredictionOutput {
    pub fn new(
        box_encodings: Tensor,
        class_predictions_with_background: Tensor,
        class_predictions_in_image_level: Tensor,
        feature_maps: Vec<Tensor>,
        anchors: BoxList,
    ) -> Result<Self> {
        let (batch_size, num_anchors, _code_size) = box_encodings.size3()?;
        let (cls_batch_size, cls_num_anchors, num_classes_with_bg) =
            class_predictions_with_background.size3()?;
        ensure!(
            (cls_batch_size, cls_num_anchors) == (batch_size, num_anchors),
            "box encodings and class predictions disagree: {:?} vs {:?}",
            box_encodings.size(),
            class_predictions_with_background.size()
        );
        ensure!(
            num_classes_with_bg >= 2,
            "class predictions must include background and at least one class, but get {:?}",
            class_predictions_with_background.size()
        );
        ensure!(
            class_predictions_in_image_level.size() == [batch_size, num_classes_with_bg],
            "image level class predictions must have shape [{}, {}], but get {:?}",
            batch_size,
            num_classes_with_bg,
            class_predictions_in_image_level.size()
        );
        ensure!(
            anchors.num_boxes() == num_anchors,
            "mismatch between the number of anchors and predictions: {} vs {}",
            anchors.num_boxes(),
            num_anchors
        );

        Ok(Self {
            box_encodings,
            class_predictions_with_background,
            class_predictions_in_image_level,
            feature_maps,
            anchors,
        })
    }

    /// Build from named tensors. Anchors are given as an `[A, 4]` tensor.
    pub fn from_named_tensors(mut tensors: IndexMap<String, Tensor>) -> Result<Self> {
        let mut take = |key: &str| {
            tensors
                .remove(key)
                .ok_or_else(|| format_err!("the prediction is missing the '{}' entry", key))
        };
        let box_encodings = take(BOX_ENCODINGS)?;
        let class_predictions_with_background = take(CLASS_PREDICTIONS_WITH_BACKGROUND)?;
        let class_predictions_in_image_level = take(CLASS_PREDICTIONS_IN_IMAGE_LEVEL)?;
        let anchors = BoxList::new(take(ANCHORS)?)?;

        let mut feature_maps: Vec<(usize, Tensor)> = tensors
            .into_iter()
            .filter_map(|(key, tensor)| {
                let index = key.strip_prefix(FEATURE_MAPS_PREFIX)?;
                Some((index.to_string(), tensor))
            })
            .map(|(index, tensor)| -> Result<_> {
                let index: usize = index
                    .parse()
                    .with_context(|| format!("invalid feature map key '{}'", index))?;
                Ok((index, tensor))
            })
            .try_collect()?;
        feature_maps.sort_by_key(|(index, _)| *index);

        Self::new(
            box_encodings,
            class_predictions_with_background,
            class_predictions_in_image_level,
            feature_maps.into_iter().map(|(_, tensor)| tensor).collect(),
            anchors,
        )
    }

    pub fn batch_size(&self) -> i64 {
        self.box_encodings.size()[0]
    }

    pub fn num_anchors(&self) -> i64 {
        self.box_encodings.size()[1]
    }

    /// The number of classes excluding background.
    pub fn num_classes(&self) -> i64 {
        self.class_predictions_with_background.size()[2] - 1
    }
}

/// Post-processed detections, padded to the maximum number of detections.
#[derive(Debug, TensorLike)]
pub struct DetectionOutput {
    /// `[B, M, 4]`
    pub detection_boxes: Tensor,
    /// `[B, M]`
    pub detection_scores: Tensor,
    /// `[B, M]` float labels. Valid entries start at 1, padding is 0.
    pub detection_classes: Tensor,
    /// `[B]` float
    pub num_detections: Tensor,
    /// `[B]`
    pub detection_scores_in_image_level: Tensor,
    /// `[B]` int64 indices into the classes including background.
    pub detection_classes_in_image_level: Tensor,
    /// `[B, M, K, 2]`
    pub detection_keypoints: Option<Tensor>,
}

impl DetectionOutput {
    pub fn into_named_tensors(self) -> IndexMap<String, Tensor> {
        let Self {
            detection_boxes,
            detection_scores,
            detection_classes,
            num_detections,
            detection_scores_in_image_level,
            detection_classes_in_image_level,
            detection_keypoints,
        } = self;

        let mut tensors: IndexMap<String, Tensor> = vec![
            (DETECTION_BOXES, detection_boxes),
            (DETECTION_SCORES, detection_scores),
            (DETECTION_CLASSES, detection_classes),
            (NUM_DETECTIONS, num_detections),
            (DETECTION_SCORES_IN_IMAGE_LEVEL, detection_scores_in_image_level),
            (DETECTION_CLASSES_IN_IMAGE_LEVEL, detection_classes_in_image_level),
        ]
        .into_iter()
        .map(|(key, tensor)| (key.to_string(), tensor))
        .collect();
        if let Some(keypoints) = detection_keypoints {
            tensors.insert(DETECTION_KEYPOINTS.into(), keypoints);
        }
        tensors
    }
}

/// Per-image groundtruth of a batch.
#[derive(Debug, Getters)]
pub struct GroundTruth {
    /// `[G_i, 4]` normalized boxes.
    #[get = "pub"]
    boxes: Vec<Tensor>,
    /// `[G_i, C]` one-hot or k-hot classes without background.
    #[get = "pub"]
    classes: Vec<Tensor>,
    /// `[C]` k-hot image-level classes without background.
    #[get = "pub"]
    image_level_classes: Vec<Tensor>,
    /// `[G_i, K, 2]`
    #[get = "pub"]
    keypoints: Option<Vec<Tensor>>,
}

impl GroundTruth {
    pub fn new(
        boxes: Vec<Tensor>,
        classes: Vec<Tensor>,
        image_level_classes: Vec<Tensor>,
        keypoints: Option<Vec<Tensor>>,
    ) -> Result<Self> {
        let batch_size = boxes.len();
        ensure!(batch_size > 0, "the groundtruth batch must not be empty");
        ensure!(
            classes.len() == batch_size && image_level_classes.len() == batch_size,
            "expect {} images of classes, but get {} and {} image level",
            batch_size,
            classes.len(),
            image_level_classes.len()
        );
        if let Some(keypoints) = &keypoints {
            ensure!(
                keypoints.len() == batch_size,
                "expect {} images of keypoints, but get {}",
                batch_size,
                keypoints.len()
            );
        }

        let num_classes = classes[0].size().get(1).copied().unwrap_or(0);
        ensure!(num_classes > 0, "groundtruth classes must have shape [num_boxes, num_classes]");

        for (index, (image_boxes, image_classes, image_level)) in
            izip!(&boxes, &classes, &image_level_classes).enumerate()
        {
            let (num_boxes, _) = image_boxes.size2()?;
            ensure!(
                image_boxes.size() == [num_boxes, 4],
                "boxes of image {} must have shape [num_boxes, 4], but get {:?}",
                index,
                image_boxes.size()
            );
            ensure!(
                image_classes.size() == [num_boxes, num_classes],
                "classes of image {} must have shape [{}, {}], but get {:?}",
                index,
                num_boxes,
                num_classes,
                image_classes.size()
            );
            ensure!(
                image_level.size() == [num_classes],
                "image level classes of image {} must have shape [{}], but get {:?}",
                index,
                num_classes,
                image_level.size()
            );
            if let Some(keypoints) = &keypoints {
                let size = keypoints[index].size();
                ensure!(
                    size.len() == 3 && size[0] == num_boxes && size[2] == 2,
                    "keypoints of image {} must have shape [{}, num_keypoints, 2], but get {:?}",
                    index,
                    num_boxes,
                    size
                );
            }
        }

        Ok(Self {
            boxes,
            classes,
            image_level_classes,
            keypoints,
        })
    }

    /// Build from zero-based class indices. `labels` holds one `[G_i]`
    /// tensor per image and `image_level_labels` the `[L_i]` classes present
    /// in each image.
    pub fn from_label_ids(
        boxes: Vec<Tensor>,
        labels: &[Tensor],
        image_level_labels: &[Tensor],
        num_classes: i64,
    ) -> Result<Self> {
        ensure!(num_classes > 0, "num_classes must be positive");
        let check_range = |ids: &Tensor| -> Result<Tensor> {
            let ids = ids.to_kind(Kind::Int64);
            if ids.numel() > 0 {
                let (min, max) = (i64::from(ids.min()), i64::from(ids.max()));
                ensure!(
                    min >= 0 && max < num_classes,
                    "class ids must be in range [0, {}), but get range [{}, {}]",
                    num_classes,
                    min,
                    max
                );
            }
            Ok(ids)
        };

        let classes: Vec<_> = labels
            .iter()
            .map(|ids| -> Result<_> {
                let ids = check_range(ids)?;
                Ok(ids.f_one_hot(num_classes)?.to_kind(Kind::Float))
            })
            .try_collect()?;
        let image_level_classes: Vec<_> = image_level_labels
            .iter()
            .map(|ids| -> Result<_> {
                let ids = check_range(ids)?;
                let khot = Tensor::zeros(&[num_classes], (Kind::Float, ids.device()))
                    .f_index_fill(0, &ids, 1.0)?;
                Ok(khot)
            })
            .try_collect()?;

        Self::new(boxes, classes, image_level_classes, None)
    }

    pub fn batch_size(&self) -> usize {
        self.boxes.len()
    }

    /// The number of classes excluding background.
    pub fn num_classes(&self) -> i64 {
        self.classes[0].size()[1]
    }
}
