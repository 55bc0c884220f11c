use crate::common::*;
use tch_goodies::non_max_suppression;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchMultiClassNonMaxSuppressionInit {
    /// Boxes scoring at or below this value are dropped.
    pub score_thresh: R64,
    pub iou_thresh: R64,
    pub max_detections_per_class: usize,
    pub max_total_detections: usize,
    /// Express the surviving boxes relative to the clip window.
    pub change_coordinate_frame: bool,
}

impl Default for BatchMultiClassNonMaxSuppressionInit {
    fn default() -> Self {
        Self {
            score_thresh: r64(0.0),
            iou_thresh: r64(0.6),
            max_detections_per_class: 100,
            max_total_detections: 100,
            change_coordinate_frame: false,
        }
    }
}

impl BatchMultiClassNonMaxSuppressionInit {
    pub fn build(&self) -> Result<BatchMultiClassNonMaxSuppression> {
        let Self {
            score_thresh,
            iou_thresh,
            max_detections_per_class,
            max_total_detections,
            change_coordinate_frame,
        } = *self;

        ensure!(
            (0.0..=1.0).contains(&iou_thresh.raw()),
            "iou_thresh must be in range [0, 1], but get {}",
            iou_thresh
        );
        ensure!(
            max_detections_per_class > 0 && max_total_detections > 0,
            "max_detections_per_class and max_total_detections must be positive"
        );

        Ok(BatchMultiClassNonMaxSuppression {
            score_thresh: score_thresh.raw(),
            iou_thresh: iou_thresh.raw(),
            max_detections_per_class,
            max_total_detections,
            change_coordinate_frame,
        })
    }
}

/// Per-class NMS followed by a merge of all classes.
#[derive(Debug, Clone)]
pub struct BatchMultiClassNonMaxSuppression {
    score_thresh: f64,
    iou_thresh: f64,
    max_detections_per_class: usize,
    max_total_detections: usize,
    change_coordinate_frame: bool,
}

/// Detections padded to `max_total_detections` per image.
#[derive(Debug)]
pub struct NmsOutput {
    /// `[B, M, 4]`
    pub boxes: Tensor,
    /// `[B, M]`
    pub scores: Tensor,
    /// `[B, M]` zero-based float class indices.
    pub classes: Tensor,
    /// Additional per-box fields, each `[B, M, ...]`.
    pub additional_fields: IndexMap<String, Tensor>,
    /// `[B]` int64 count of valid entries.
    pub num_detections: Tensor,
}

impl BatchMultiClassNonMaxSuppression {
    pub fn max_total_detections(&self) -> i64 {
        self.max_total_detections as i64
    }

    /// Run NMS on a batch.
    ///
    /// `boxes` has shape `[B, A, q, 4]` where `q` is 1 (boxes shared by all
    /// classes) or `C`. `scores` has shape `[B, A, C]`. Each additional
    /// field has shape `[B, A, ...]`.
    pub fn forward(
        &self,
        boxes: &Tensor,
        scores: &Tensor,
        clip_window: Option<[f64; 4]>,
        additional_fields: &IndexMap<String, Tensor>,
    ) -> Result<NmsOutput> {
        let (batch_size, num_anchors, _q, num_coords) = boxes.size4()?;
        ensure!(
            num_coords == 4,
            "boxes must have shape [batch, anchors, q, 4], but get {:?}",
            boxes.size()
        );
        let (score_batch_size, score_num_anchors, _num_classes) = scores.size3()?;
        ensure!(
            (score_batch_size, score_num_anchors) == (batch_size, num_anchors),
            "boxes and scores disagree in leading dimensions: {:?} vs {:?}",
            boxes.size(),
            scores.size()
        );
        for (name, field) in additional_fields {
            let size = field.size();
            ensure!(
                size.len() >= 2 && size[..2] == [batch_size, num_anchors],
                "the field '{}' must have shape [{}, {}, ...], but get {:?}",
                name,
                batch_size,
                num_anchors,
                size
            );
        }

        let max_total = self.max_total_detections as i64;
        let mut boxes_list = vec![];
        let mut scores_list = vec![];
        let mut classes_list = vec![];
        let mut fields_list: IndexMap<String, Vec<Tensor>> = additional_fields
            .keys()
            .map(|name| (name.clone(), vec![]))
            .collect();
        let mut num_detections = vec![];

        for index in 0..batch_size {
            let image_fields: IndexMap<_, _> = additional_fields
                .iter()
                .map(|(name, field)| (name.clone(), field.select(0, index)))
                .collect();
            let detections = self.multiclass(
                &boxes.select(0, index),
                &scores.select(0, index),
                clip_window,
                &image_fields,
            )?;

            num_detections.push(detections.num_boxes());
            boxes_list.push(pad_leading_dim(detections.boxes(), max_total)?);
            scores_list.push(pad_leading_dim(detections.get_field(fields::SCORES)?, max_total)?);
            classes_list.push(pad_leading_dim(
                detections.get_field(fields::CLASSES)?,
                max_total,
            )?);
            for (name, tensors) in &mut fields_list {
                tensors.push(pad_leading_dim(detections.get_field(name)?, max_total)?);
            }
        }

        let additional_fields: IndexMap<_, _> = fields_list
            .into_iter()
            .map(|(name, tensors)| -> Result<_> { Ok((name, Tensor::f_stack(&tensors, 0)?)) })
            .try_collect()?;

        Ok(NmsOutput {
            boxes: Tensor::f_stack(&boxes_list, 0)?,
            scores: Tensor::f_stack(&scores_list, 0)?,
            classes: Tensor::f_stack(&classes_list, 0)?,
            additional_fields,
            num_detections: Tensor::of_slice(&num_detections).to_device(boxes.device()),
        })
    }

    /// Run NMS on one image of `[A, q, 4]` boxes and `[A, C]` scores.
    ///
    /// Returns at most `max_total_detections` boxes sorted by descending
    /// score, with `scores`, `classes` and the additional fields attached.
    /// On equal scores the earlier class and then the earlier anchor come
    /// first.
    pub fn multiclass(
        &self,
        boxes: &Tensor,
        scores: &Tensor,
        clip_window: Option<[f64; 4]>,
        additional_fields: &IndexMap<String, Tensor>,
    ) -> Result<BoxList> {
        let (num_anchors, q, num_coords) = boxes.size3()?;
        let (num_scores, num_classes) = scores.size2()?;
        ensure!(num_coords == 4, "boxes must have 4 coordinates");
        ensure!(
            num_scores == num_anchors,
            "expect {} rows of scores, but get {}",
            num_anchors,
            num_scores
        );
        ensure!(num_classes > 0, "scores must have at least one class");
        ensure!(
            q == 1 || q == num_classes,
            "the box dimension must be 1 or the number of classes {}, but get {}",
            num_classes,
            q
        );
        let device = boxes.device();

        let per_class: Vec<_> = (0..num_classes)
            .map(|class| -> Result<_> {
                let box_index = if q == 1 { 0 } else { class };
                let mut candidates = BoxList::new(boxes.select(1, box_index))?;
                candidates.add_field(fields::SCORES, scores.select(1, class))?;
                for (name, field) in additional_fields {
                    candidates.add_field(name.clone(), field.shallow_clone())?;
                }

                let mut candidates = candidates
                    .boolean_mask(&candidates.get_field(fields::SCORES)?.gt(self.score_thresh))?;
                if let Some(window) = clip_window {
                    candidates = candidates.clip_to_window(window, true)?;
                    if self.change_coordinate_frame {
                        candidates = candidates.change_coordinate_frame(window)?;
                    }
                }

                let keep = non_max_suppression(
                    &candidates,
                    candidates.get_field(fields::SCORES)?,
                    self.iou_thresh,
                    self.max_detections_per_class,
                )?;
                let mut selected = candidates.gather(&keep)?;
                let classes = Tensor::full(
                    &[selected.num_boxes()],
                    class as f64,
                    (Kind::Float, device),
                );
                selected.add_field(fields::CLASSES, classes)?;
                Ok(selected)
            })
            .try_collect()?;

        let merged = BoxList::concatenate(&per_class)?;
        let merged_scores = Vec::<f32>::from(
            &merged
                .get_field(fields::SCORES)?
                .to_kind(Kind::Float)
                .to_device(Device::Cpu),
        );
        let mut order: Vec<i64> = (0..merged_scores.len() as i64).collect();
        // stable sort keeps class order and then anchor order on ties
        order.sort_by(|&lhs, &rhs| {
            merged_scores[rhs as usize]
                .partial_cmp(&merged_scores[lhs as usize])
                .unwrap_or(Ordering::Equal)
        });
        order.truncate(self.max_total_detections);

        merged.gather(&Tensor::of_slice(&order).to_device(device))
    }
}

/// Zero-pad the leading dimension of a tensor up to `size`.
fn pad_leading_dim(tensor: &Tensor, size: i64) -> Result<Tensor> {
    let mut shape = tensor.size();
    ensure!(
        !shape.is_empty() && shape[0] <= size,
        "cannot pad shape {:?} to {} rows",
        shape,
        size
    );
    if shape[0] == size {
        return Ok(tensor.shallow_clone());
    }
    shape[0] = size - shape[0];
    let padding = Tensor::f_zeros(&shape, (tensor.kind(), tensor.device()))?;
    let padded = Tensor::f_cat(&[tensor.shallow_clone(), padding], 0)?;
    Ok(padded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn nms(max_total_detections: usize) -> BatchMultiClassNonMaxSuppression {
        BatchMultiClassNonMaxSuppressionInit {
            score_thresh: r64(0.05),
            iou_thresh: r64(0.5),
            max_detections_per_class: 10,
            max_total_detections,
            change_coordinate_frame: false,
        }
        .build()
        .unwrap()
    }

    fn inputs() -> (Tensor, Tensor) {
        let boxes = Tensor::of_slice(&[
            0.0f32, 0.0, 0.5, 0.5, //
            0.0, 0.05, 0.5, 0.55, //
            0.5, 0.5, 1.0, 1.0, //
            0.0, 0.5, 0.5, 1.0,
        ])
        .view([4, 1, 4]);
        let scores = Tensor::of_slice(&[
            0.9f32, 0.1, //
            0.8, 0.7, //
            0.3, 0.6, //
            0.01, 0.0,
        ])
        .view([4, 2]);
        (boxes, scores)
    }

    #[test]
    fn multiclass_nms() {
        let (boxes, scores) = inputs();
        let detections = nms(10)
            .multiclass(&boxes, &scores, None, &IndexMap::new())
            .unwrap();

        assert_eq!(detections.num_boxes(), 4);
        let scores = Vec::<f32>::from(detections.get_field(fields::SCORES).unwrap());
        let classes = Vec::<f32>::from(detections.get_field(fields::CLASSES).unwrap());
        assert_eq!(scores, vec![0.9, 0.7, 0.6, 0.3]);
        assert_eq!(classes, vec![0.0, 1.0, 1.0, 0.0]);
        assert_eq!(
            Vec::<f32>::from(&detections.boxes().view([-1])),
            vec![
                0.0, 0.0, 0.5, 0.5, //
                0.0, 0.05, 0.5, 0.55, //
                0.5, 0.5, 1.0, 1.0, //
                0.5, 0.5, 1.0, 1.0,
            ]
        );
    }

    #[test]
    fn truncate_to_max_total_detections() {
        let (boxes, scores) = inputs();
        let detections = nms(3)
            .multiclass(&boxes, &scores, None, &IndexMap::new())
            .unwrap();
        let scores = Vec::<f32>::from(detections.get_field(fields::SCORES).unwrap());
        assert_eq!(scores, vec![0.9, 0.7, 0.6]);
    }

    #[test]
    fn ties_prefer_earlier_class() {
        let boxes = Tensor::of_slice(&[0.0f32, 0.0, 0.5, 0.5]).view([1, 1, 4]);
        let scores = Tensor::of_slice(&[0.5f32, 0.5, 0.5]).view([1, 3]);
        let detections = nms(10)
            .multiclass(&boxes, &scores, None, &IndexMap::new())
            .unwrap();
        let classes = Vec::<f32>::from(detections.get_field(fields::CLASSES).unwrap());
        assert_eq!(classes, vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn per_class_boxes() {
        let boxes = Tensor::of_slice(&[
            0.0f32, 0.0, 0.5, 0.5, 0.5, 0.5, 1.0, 1.0, //
        ])
        .view([1, 2, 4]);
        let scores = Tensor::of_slice(&[0.4f32, 0.8]).view([1, 2]);
        let detections = nms(10)
            .multiclass(&boxes, &scores, None, &IndexMap::new())
            .unwrap();
        assert_eq!(
            Vec::<f32>::from(&detections.boxes().view([-1])),
            vec![0.5, 0.5, 1.0, 1.0, 0.0, 0.0, 0.5, 0.5]
        );
    }

    #[test]
    fn clip_and_change_coordinate_frame() {
        let nms = BatchMultiClassNonMaxSuppressionInit {
            change_coordinate_frame: true,
            ..Default::default()
        }
        .build()
        .unwrap();
        let boxes = Tensor::of_slice(&[
            0.25f32, 0.25, 0.75, 1.5, //
            2.0, 2.0, 3.0, 3.0,
        ])
        .view([2, 1, 4]);
        let scores = Tensor::of_slice(&[0.9f32, 0.8]).view([2, 1]);
        let detections = nms
            .multiclass(&boxes, &scores, Some([0.0, 0.0, 0.5, 1.0]), &IndexMap::new())
            .unwrap();

        // the second box lies outside the window
        assert_eq!(detections.num_boxes(), 1);
        let coords = Vec::<f32>::from(&detections.boxes().view([-1]));
        for (&actual, expect) in coords.iter().zip([0.5, 0.25, 1.0, 1.0]) {
            assert_abs_diff_eq!(actual, expect, epsilon = 1e-6);
        }
    }

    #[test]
    fn batch_nms_pads_outputs() {
        let (boxes, scores) = inputs();
        let boxes = Tensor::stack(&[&boxes, &boxes.zeros_like()], 0);
        let scores = Tensor::stack(&[&scores, &scores.zeros_like()], 0);
        let keypoints = Tensor::ones(&[2, 4, 3, 2], (Kind::Float, Device::Cpu));
        let mut additional_fields = IndexMap::new();
        additional_fields.insert(fields::KEYPOINTS.to_string(), keypoints);

        let output = nms(6)
            .forward(&boxes, &scores, Some([0.0, 0.0, 1.0, 1.0]), &additional_fields)
            .unwrap();

        assert_eq!(output.boxes.size(), vec![2, 6, 4]);
        assert_eq!(output.scores.size(), vec![2, 6]);
        assert_eq!(output.classes.size(), vec![2, 6]);
        assert_eq!(output.additional_fields[fields::KEYPOINTS].size(), vec![2, 6, 3, 2]);
        assert_eq!(Vec::<i64>::from(&output.num_detections), vec![4, 0]);

        let first_scores = Vec::<f32>::from(&output.scores.select(0, 0));
        assert_eq!(first_scores, vec![0.9, 0.7, 0.6, 0.3, 0.0, 0.0]);
        let keypoint_sum = f64::from(output.additional_fields[fields::KEYPOINTS].sum(Kind::Float));
        assert_abs_diff_eq!(keypoint_sum, 4.0 * 3.0 * 2.0, epsilon = 1e-6);
    }
}
