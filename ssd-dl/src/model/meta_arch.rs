//! The SSD meta-architecture tying the components together.

use super::{
    box_predictor::BoxPredictor,
    class_predictor::ClassPredictor,
    feature_extractor::{is_float_kind, FeatureExtractor},
    image_resizer::ImageResizer,
    output::{DetectionOutput, GroundTruth, PredictionOutput},
};
use crate::{
    anchor::AnchorGenerator,
    common::*,
    loss::{LossOutput, SsdLoss},
    matcher::Match,
    observer::{summarize_cdf, SummaryObserver},
    post_processing::{BatchMultiClassNonMaxSuppression, NmsOutput, ScoreConverter},
    profiling::Timing,
    target_assigner::{BatchTargets, TargetAssigner},
};

/// The variable scope of the feature extractor.
pub const FEATURE_EXTRACTOR_SCOPE: &str = "feature_extractor";

/// The clip window applied to decoded boxes in normalized coordinates.
const CLIP_WINDOW: [f64; 4] = [0.0, 0.0, 1.0, 1.0];

pub struct SsdMetaArchInit {
    pub num_classes: i64,
    pub image_resizer: ImageResizer,
    pub feature_extractor: Box<dyn FeatureExtractor>,
    pub anchor_generator: Box<dyn AnchorGenerator>,
    pub box_predictor: Box<dyn BoxPredictor>,
    pub class_predictor: Box<dyn ClassPredictor>,
    pub image_level_feature_map_index: usize,
    pub target_assigner: TargetAssigner,
    pub loss: SsdLoss,
    pub non_max_suppression: BatchMultiClassNonMaxSuppression,
    pub score_converter: ScoreConverter,
}

impl SsdMetaArchInit {
    pub fn build(self) -> Result<SsdMetaArch> {
        let Self {
            num_classes,
            image_resizer,
            feature_extractor,
            anchor_generator,
            box_predictor,
            class_predictor,
            image_level_feature_map_index,
            target_assigner,
            loss,
            non_max_suppression,
            score_converter,
        } = self;

        ensure!(num_classes > 0, "num_classes must be positive");
        ensure!(
            box_predictor.num_classes() == num_classes,
            "the box predictor has {} classes, but the model has {}",
            box_predictor.num_classes(),
            num_classes
        );
        let num_feature_maps = feature_extractor.feature_map_channels().len();
        let num_anchor_layers = anchor_generator.num_anchors_per_location().len();
        ensure!(
            num_feature_maps == num_anchor_layers,
            "the feature extractor produces {} feature maps, but the anchor generator expects {}",
            num_feature_maps,
            num_anchor_layers
        );
        ensure!(
            image_level_feature_map_index < num_feature_maps,
            "the image level feature map index {} is out of range of {} feature maps",
            image_level_feature_map_index,
            num_feature_maps
        );

        Ok(SsdMetaArch {
            num_classes,
            image_resizer,
            feature_extractor,
            anchor_generator,
            box_predictor,
            class_predictor,
            image_level_feature_map_index,
            target_assigner,
            loss,
            non_max_suppression,
            score_converter,
            observer: None,
        })
    }
}

/// A single-shot detector with an image-level classification head.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct SsdMetaArch {
    num_classes: i64,
    image_resizer: ImageResizer,
    feature_extractor: Box<dyn FeatureExtractor>,
    anchor_generator: Box<dyn AnchorGenerator>,
    box_predictor: Box<dyn BoxPredictor>,
    class_predictor: Box<dyn ClassPredictor>,
    image_level_feature_map_index: usize,
    target_assigner: TargetAssigner,
    loss: SsdLoss,
    non_max_suppression: BatchMultiClassNonMaxSuppression,
    score_converter: ScoreConverter,
    #[derivative(Debug = "ignore")]
    observer: Option<Arc<dyn SummaryObserver>>,
}

impl SsdMetaArch {
    /// Emit training summaries to the observer.
    pub fn with_observer(mut self, observer: Arc<dyn SummaryObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// The number of classes excluding background.
    pub fn num_classes(&self) -> i64 {
        self.num_classes
    }

    pub fn max_detections(&self) -> i64 {
        self.non_max_suppression.max_total_detections()
    }

    /// The `[height, width]` images are resized to.
    pub fn image_size(&self) -> [i64; 2] {
        self.image_resizer.size()
    }

    pub fn feature_extractor(&self) -> &dyn FeatureExtractor {
        self.feature_extractor.as_ref()
    }

    /// Resize and normalize a `[B, 3, H, W]` float image batch in pixel
    /// values, and the optional `[B, 1, h, w]` secondary input.
    pub fn preprocess(
        &self,
        inputs: &Tensor,
        secondary: Option<&Tensor>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        ensure!(
            is_float_kind(inputs.kind()),
            "preprocess expects a float tensor, but get {:?}",
            inputs.kind()
        );
        inputs.f_size_of_rank(4, "inputs")?;
        let resized = self.image_resizer.resize(inputs)?;
        let preprocessed = self.feature_extractor.preprocess(&resized, false)?;

        let secondary = secondary
            .map(|secondary| -> Result<_> {
                ensure!(
                    is_float_kind(secondary.kind()),
                    "preprocess expects a float secondary tensor, but get {:?}",
                    secondary.kind()
                );
                secondary.f_size_of_rank(4, "secondary inputs")?;
                let resized = self.image_resizer.resize_secondary(secondary)?;
                self.feature_extractor.preprocess(&resized, false)
            })
            .transpose()?;

        Ok((preprocessed, secondary))
    }

    /// Run the backbone and the heads, and generate the anchors of this pass.
    pub fn predict(
        &self,
        preprocessed_inputs: &Tensor,
        preprocessed_secondary: Option<&Tensor>,
        train: bool,
    ) -> Result<PredictionOutput> {
        let (_, _, im_height, im_width) = preprocessed_inputs.size4()?;
        let (feature_maps, aux_features) = self.feature_extractor.extract_features(
            preprocessed_inputs,
            preprocessed_secondary,
            train,
        )?;

        let num_anchors_per_location = self.anchor_generator.num_anchors_per_location();
        ensure!(
            feature_maps.len() == num_anchors_per_location.len(),
            "the number of feature maps must match the number of anchor layers: {} vs {}",
            feature_maps.len(),
            num_anchors_per_location.len()
        );

        let feature_map_shapes: Vec<_> = feature_maps
            .iter()
            .map(|feature_map| -> Result<_> {
                let (_, _, height, width) = feature_map.size4()?;
                Ok((height, width))
            })
            .try_collect()?;
        let anchors = self.anchor_generator.generate(
            &feature_map_shapes,
            im_height,
            im_width,
            preprocessed_inputs.device(),
        )?;

        let (box_encodings, class_predictions) = izip!(&feature_maps, num_anchors_per_location)
            .enumerate()
            .map(|(index, (feature_map, num_anchors))| -> Result<_> {
                let predictions = self.box_predictor.predict(
                    feature_map,
                    aux_features.as_ref(),
                    num_anchors,
                    index,
                    train,
                )?;
                let size = predictions.box_encodings.size();
                ensure!(
                    size.len() == 4 && size[2] == 1,
                    "box encodings from the box predictor must have shape \
                     [batch_size, num_anchors, 1, code_size], but get {:?}",
                    size
                );
                Ok((
                    predictions.box_encodings.select(2, 0),
                    predictions.class_predictions_with_background,
                ))
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .unzip_n_vec();

        let box_encodings = Tensor::f_cat(&box_encodings, 1)?;
        let class_predictions_with_background = Tensor::f_cat(&class_predictions, 1)?;
        let num_predictions = box_encodings.size()[1];
        ensure!(
            num_predictions == anchors.num_boxes(),
            "mismatch between the number of anchors and predictions: {} vs {}",
            anchors.num_boxes(),
            num_predictions
        );

        let image_level_map = feature_maps
            .get(self.image_level_feature_map_index)
            .ok_or_else(|| {
                format_err!(
                    "the image level feature map index {} is out of range of {} feature maps",
                    self.image_level_feature_map_index,
                    feature_maps.len()
                )
            })?;
        let class_predictions_in_image_level =
            self.class_predictor
                .predict(image_level_map, aux_features.as_ref(), train)?;

        PredictionOutput::new(
            box_encodings,
            class_predictions_with_background,
            class_predictions_in_image_level,
            feature_maps,
            anchors,
        )
    }

    /// Decode `[B, A, code_size]` box encodings against the anchors into
    /// `[B, A, 4]` boxes and, for keypoint coders, `[B, A, K, 2]` keypoints.
    pub fn batch_decode(
        &self,
        box_encodings: &Tensor,
        anchors: &BoxList,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (batch_size, num_anchors, code_size) = box_encodings.size3()?;
        ensure!(
            num_anchors == anchors.num_boxes(),
            "expect encodings of {} anchors, but get {}",
            anchors.num_boxes(),
            num_anchors
        );

        let tiled_anchors = BoxList::new(
            anchors
                .boxes()
                .f_tile_batch(batch_size)?
                .view([batch_size * num_anchors, 4]),
        )?;
        let decoded = self
            .target_assigner
            .box_coder()
            .decode(&box_encodings.reshape(&[-1, code_size]), &tiled_anchors)?;

        let boxes = decoded.boxes().view([batch_size, num_anchors, 4]);
        let keypoints = decoded
            .field(fields::KEYPOINTS)
            .map(|keypoints| keypoints.view([batch_size, num_anchors, -1, 2]));
        Ok((boxes, keypoints))
    }

    /// Convert predictions into detections. Runs without gradient tracking.
    pub fn postprocess(&self, prediction: &PredictionOutput) -> Result<DetectionOutput> {
        tch::no_grad(|| self.postprocess_impl(prediction))
    }

    fn postprocess_impl(&self, prediction: &PredictionOutput) -> Result<DetectionOutput> {
        let mut timing = Timing::new("postprocess");

        let (detection_boxes, detection_keypoints) =
            self.batch_decode(prediction.box_encodings(), prediction.anchors())?;
        timing.add_event("decode");

        let class_predictions = prediction.class_predictions_with_background();
        let (batch_size, _, num_classes_with_bg) = class_predictions.size3()?;
        let num_classes = num_classes_with_bg - 1;
        ensure!(
            num_classes == self.num_classes,
            "expect predictions of {} classes, but get {}",
            self.num_classes,
            num_classes
        );
        let detection_scores = self
            .score_converter
            .convert(&class_predictions.narrow(2, 1, num_classes));

        let image_level_scores = self
            .score_converter
            .convert(prediction.class_predictions_in_image_level());
        let detection_classes_in_image_level = image_level_scores.argmax(1, false);
        let detection_scores_in_image_level = image_level_scores
            .gather(1, &detection_classes_in_image_level.unsqueeze(1), false)
            .view([batch_size]);
        timing.add_event("convert_scores");

        let mut additional_fields = IndexMap::new();
        if let Some(keypoints) = detection_keypoints {
            additional_fields.insert(fields::KEYPOINTS.to_string(), keypoints);
        }
        let NmsOutput {
            boxes,
            scores,
            classes,
            mut additional_fields,
            num_detections,
        } = self.non_max_suppression.forward(
            &detection_boxes.unsqueeze(2),
            &detection_scores,
            Some(CLIP_WINDOW),
            &additional_fields,
        )?;
        timing.add_event("nms");

        // labels start at 1, padded entries stay 0
        let max_detections = classes.size()[1];
        let valid = Tensor::arange(max_detections, (Kind::Int64, classes.device()))
            .unsqueeze(0)
            .lt_tensor(&num_detections.unsqueeze(1));
        let detection_classes = &classes + valid.to_kind(classes.kind());

        timing.report();

        Ok(DetectionOutput {
            detection_boxes: boxes,
            detection_scores: scores,
            detection_classes,
            num_detections: num_detections.to_kind(Kind::Float),
            detection_scores_in_image_level,
            detection_classes_in_image_level,
            detection_keypoints: additional_fields.remove(fields::KEYPOINTS),
        })
    }

    /// Compute the training losses of a prediction.
    pub fn loss(
        &self,
        prediction: &PredictionOutput,
        groundtruth: &GroundTruth,
    ) -> Result<LossOutput> {
        let mut timing = Timing::new("loss");

        ensure!(
            groundtruth.batch_size() as i64 == prediction.batch_size(),
            "expect groundtruth of {} images, but get {}",
            prediction.batch_size(),
            groundtruth.batch_size()
        );
        ensure!(
            groundtruth.num_classes() == self.num_classes,
            "expect groundtruth of {} classes, but get {}",
            self.num_classes,
            groundtruth.num_classes()
        );

        let targets = self.assign_targets(prediction.anchors(), groundtruth)?;
        timing.add_event("assign_targets");

        if let Some(observer) = &self.observer {
            summarize_input(observer.as_ref(), groundtruth, &targets.matches);
        }
        let num_matches: i64 = targets
            .matches
            .iter()
            .map(|matches| matches.num_matched_columns())
            .sum();

        let location_losses = self.loss.localization_losses(
            prediction.box_encodings(),
            &targets.reg_targets,
            &targets.reg_weights,
        )?;
        let cls_losses = self.loss.classification_losses(
            prediction.class_predictions_with_background(),
            &targets.cls_targets,
            &targets.cls_weights,
        )?;
        let image_level_losses = self.loss.image_level_losses(
            prediction.class_predictions_in_image_level(),
            &targets.image_level_cls_targets,
        )?;
        timing.add_event("compute_losses");

        let (localization_loss, classification_loss) = match self.loss.hard_example_miner() {
            Some(miner) => {
                let (decoded_boxes, _) = self.batch_decode(
                    &prediction.box_encodings().detach(),
                    prediction.anchors(),
                )?;
                let decoded_boxes: Vec<_> = decoded_boxes
                    .unzip_first()
                    .unwrap_or_default()
                    .into_iter()
                    .map(BoxList::new)
                    .try_collect()?;
                let mined = miner.forward(
                    &location_losses,
                    &cls_losses,
                    &decoded_boxes,
                    &targets.matches,
                )?;
                if let Some(observer) = &self.observer {
                    mined.summarize(observer.as_ref());
                }
                (mined.location_loss, mined.cls_loss)
            }
            None => {
                if let Some(observer) = &self.observer {
                    summarize_anchor_classification_loss(
                        observer.as_ref(),
                        &targets.cls_targets,
                        &cls_losses,
                    );
                }
                (
                    location_losses.sum(Kind::Float),
                    cls_losses.sum(Kind::Float),
                )
            }
        };
        timing.add_event("hard_example_mining");

        let output = self.loss.combine(
            localization_loss,
            classification_loss,
            image_level_losses.sum(Kind::Float),
            num_matches,
        );
        timing.report();

        Ok(output)
    }

    /// Pad the groundtruth with the background class and assign targets.
    fn assign_targets(&self, anchors: &BoxList, groundtruth: &GroundTruth) -> Result<BatchTargets> {
        let device = anchors.device();

        let boxes: Vec<_> = groundtruth
            .boxes()
            .iter()
            .enumerate()
            .map(|(index, boxes)| -> Result<_> {
                let mut boxes = BoxList::new(boxes.to_device(device))?;
                if let Some(keypoints) = groundtruth.keypoints() {
                    boxes.add_field(fields::KEYPOINTS, keypoints[index].to_device(device))?;
                }
                Ok(boxes)
            })
            .try_collect()?;
        let labels: Vec<_> = groundtruth
            .classes()
            .iter()
            .map(|classes| -> Result<_> {
                let classes = classes.to_device(device).to_kind(Kind::Float);
                let background = Tensor::zeros(&[classes.size()[0], 1], (Kind::Float, device));
                Ok(Tensor::f_cat(&[background, classes], 1)?)
            })
            .try_collect()?;
        let image_level_labels: Vec<_> = groundtruth
            .image_level_classes()
            .iter()
            .map(|classes| -> Result<_> {
                let classes = classes.to_device(device).to_kind(Kind::Float);
                let background = Tensor::zeros(&[1], (Kind::Float, device));
                Ok(Tensor::f_cat(&[background, classes], 0)?)
            })
            .try_collect()?;

        self.target_assigner
            .batch_assign(anchors, &boxes, &labels, &image_level_labels)
    }

    /// The feature extractor variables to restore from a checkpoint, keyed
    /// by checkpoint name.
    ///
    /// Classification checkpoints name the variables without the extractor
    /// scope, so it is stripped unless `from_detection_checkpoint` is set.
    pub fn restore_map(
        &self,
        vs: &nn::VarStore,
        from_detection_checkpoint: bool,
    ) -> IndexMap<String, Tensor> {
        let mut variables: Vec<_> = vs
            .variables()
            .into_iter()
            .filter_map(|(name, tensor)| {
                let stripped = strip_scope(&name, FEATURE_EXTRACTOR_SCOPE)?.to_string();
                let key = if from_detection_checkpoint {
                    name
                } else {
                    stripped
                };
                Some((key, tensor))
            })
            .collect();
        variables.sort_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs));
        debug!(
            "restoring {} variables of the '{}' feature extractor",
            variables.len(),
            self.feature_extractor.name()
        );
        variables.into_iter().collect()
    }
}

/// The part of a variable name after the `scope` component, if present.
fn strip_scope<'a>(name: &'a str, scope: &str) -> Option<&'a str> {
    let mut offset = 0;
    for component in name.split('.') {
        offset += component.len() + 1;
        if component == scope {
            return name.get(offset..).filter(|rest| !rest.is_empty());
        }
    }
    None
}

fn summarize_input(observer: &dyn SummaryObserver, groundtruth: &GroundTruth, matches: &[Match]) {
    let mean = |values: Vec<i64>| values.iter().sum::<i64>() as f64 / values.len().max(1) as f64;
    observer.scalar(
        "Input/AvgNumGroundtruthBoxesPerImage",
        mean(groundtruth.boxes().iter().map(|boxes| boxes.size()[0]).collect()),
    );
    observer.scalar(
        "Input/AvgNumPositiveAnchorsPerImage",
        mean(matches.iter().map(Match::num_matched_columns).collect()),
    );
    observer.scalar(
        "Input/AvgNumNegativeAnchorsPerImage",
        mean(matches.iter().map(Match::num_unmatched_columns).collect()),
    );
    observer.scalar(
        "Input/AvgNumIgnoredAnchorsPerImage",
        mean(matches.iter().map(Match::num_ignored_columns).collect()),
    );
}

/// Report the distributions of classification losses on positive and
/// negative anchors.
fn summarize_anchor_classification_loss(
    observer: &dyn SummaryObserver,
    cls_targets: &Tensor,
    cls_losses: &Tensor,
) {
    let class_ids = cls_targets.argmax(2, false).view([-1]);
    let losses = cls_losses.detach().view([-1]);
    summarize_cdf(
        observer,
        "PositiveAnchorLossCDF",
        &losses.masked_select(&class_ids.gt(0)),
    );
    summarize_cdf(
        observer,
        "NegativeAnchorLossCDF",
        &losses.masked_select(&class_ids.eq(0)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::SsdConfig,
        loss::HardExampleMinerInit,
        model::{FeatureExtractorConfig, ImageResizerConfig},
        observer::{MemoryObserver, Summary},
        post_processing::{BatchMultiClassNonMaxSuppressionInit, PostProcessingConfig},
    };
    use approx::assert_abs_diff_eq;

    fn config() -> SsdConfig {
        SsdConfig {
            num_classes: 2,
            feature_extractor: FeatureExtractorConfig {
                depth_multiplier: r64(0.125),
                min_depth: 8,
                ..Default::default()
            },
            image_resizer: ImageResizerConfig {
                height: 64,
                width: 64,
            },
            post_processing: PostProcessingConfig {
                nms: BatchMultiClassNonMaxSuppressionInit {
                    score_thresh: r64(0.5),
                    max_total_detections: 5,
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Four disjoint anchors with zero box encodings.
    fn fixed_prediction(background_logit: f32) -> PredictionOutput {
        let anchors = BoxList::new(
            Tensor::of_slice(&[
                0.0f32, 0.0, 0.5, 0.5, //
                0.0, 0.5, 0.5, 1.0, //
                0.5, 0.0, 1.0, 0.5, //
                0.5, 0.5, 1.0, 1.0,
            ])
            .view([4, 4]),
        )
        .unwrap();
        let b = background_logit;
        let class_predictions = Tensor::of_slice(&[
            b, 5.0, -5.0, //
            b, -5.0, -5.0, //
            b, -5.0, 3.0, //
            b, -5.0, -5.0,
        ])
        .view([1, 4, 3]);
        PredictionOutput::new(
            Tensor::zeros(&[1, 4, 4], (Kind::Float, Device::Cpu)),
            class_predictions,
            Tensor::of_slice(&[0f32, 3.0, 1.0]).view([1, 3]),
            vec![],
            anchors,
        )
        .unwrap()
    }

    #[test]
    fn postprocess_offsets_labels_and_drops_background() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = config().build(&vs.root()).unwrap();
        let detections = model.postprocess(&fixed_prediction(10.0)).unwrap();

        assert_eq!(detections.detection_boxes.size(), vec![1, 5, 4]);
        assert_eq!(Vec::<f32>::from(&detections.num_detections), vec![2.0]);
        assert_eq!(
            Vec::<f32>::from(&detections.detection_classes.view([-1])),
            vec![1.0, 2.0, 0.0, 0.0, 0.0]
        );
        let scores = Vec::<f32>::from(&detections.detection_scores.view([-1]));
        assert_abs_diff_eq!(scores[0], 1.0 / (1.0 + (-5.0f32).exp()), epsilon = 1e-6);
        assert_abs_diff_eq!(scores[1], 1.0 / (1.0 + (-3.0f32).exp()), epsilon = 1e-6);
        assert_eq!(&scores[2..], &[0.0, 0.0, 0.0]);
        assert_eq!(
            Vec::<f32>::from(&detections.detection_boxes.select(1, 0).view([-1])),
            vec![0.0, 0.0, 0.5, 0.5]
        );
        assert!(detections.detection_keypoints.is_none());

        assert_eq!(
            Vec::<i64>::from(&detections.detection_classes_in_image_level),
            vec![1]
        );
        assert_abs_diff_eq!(
            f64::from(detections.detection_scores_in_image_level.i(0)),
            1.0 / (1.0 + (-3.0f64).exp()),
            epsilon = 1e-6
        );
    }

    #[test]
    fn postprocess_rejects_wrong_number_of_classes() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = SsdConfig {
            num_classes: 3,
            ..config()
        }
        .build(&vs.root())
        .unwrap();
        assert!(model.postprocess(&fixed_prediction(0.0)).is_err());
    }

    #[test]
    fn predict_and_postprocess() {
        tch::manual_seed(7);
        let vs = nn::VarStore::new(Device::Cpu);
        let model = config().build(&vs.root()).unwrap();

        let images = Tensor::rand(&[2, 3, 80, 96], (Kind::Float, Device::Cpu)) * 255.0;
        let (preprocessed, secondary) = model.preprocess(&images, None).unwrap();
        assert_eq!(preprocessed.size(), vec![2, 3, 64, 64]);
        assert!(secondary.is_none());

        let prediction = model.predict(&preprocessed, None, false).unwrap();
        // 32x32x3 + (16x16 + 8x8 + 4x4 + 2x2 + 1) x 6
        let num_anchors = 32 * 32 * 3 + (16 * 16 + 8 * 8 + 4 * 4 + 2 * 2 + 1) * 6;
        assert_eq!(prediction.num_anchors(), num_anchors);
        assert_eq!(prediction.box_encodings().size(), vec![2, num_anchors, 4]);
        assert_eq!(
            prediction.class_predictions_with_background().size(),
            vec![2, num_anchors, 3]
        );
        assert_eq!(
            prediction.class_predictions_in_image_level().size(),
            vec![2, 3]
        );
        assert_eq!(prediction.feature_maps().len(), 6);

        let detections = model.postprocess(&prediction).unwrap();
        let num_detections = Vec::<f32>::from(&detections.num_detections);
        assert!(num_detections.iter().all(|&num| num <= 5.0));
        for (index, &num) in num_detections.iter().enumerate() {
            let scores = Vec::<f32>::from(&detections.detection_scores.select(0, index as i64));
            assert!(scores[..num as usize]
                .iter()
                .tuple_windows()
                .all(|(lhs, rhs)| lhs >= rhs));
        }
    }

    #[test]
    fn preprocess_rejects_integer_inputs() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = config().build(&vs.root()).unwrap();
        let images = Tensor::zeros(&[1, 3, 64, 64], (Kind::Uint8, Device::Cpu));
        assert!(model.preprocess(&images, None).is_err());
    }

    #[test]
    fn loss_with_observer() {
        tch::manual_seed(11);
        let vs = nn::VarStore::new(Device::Cpu);
        let observer = Arc::new(MemoryObserver::new());
        let model = config()
            .build(&vs.root())
            .unwrap()
            .with_observer(observer.clone());

        let images = Tensor::rand(&[2, 3, 64, 64], (Kind::Float, Device::Cpu)) * 255.0;
        let (preprocessed, _) = model.preprocess(&images, None).unwrap();
        let prediction = model.predict(&preprocessed, None, true).unwrap();

        let groundtruth = GroundTruth::from_label_ids(
            vec![
                Tensor::of_slice(&[0.1f32, 0.1, 0.6, 0.5]).view([1, 4]),
                Tensor::zeros(&[0, 4], (Kind::Float, Device::Cpu)),
            ],
            &[
                Tensor::of_slice(&[1i64]),
                Tensor::zeros(&[0], (Kind::Int64, Device::Cpu)),
            ],
            &[Tensor::of_slice(&[1i64]), Tensor::of_slice(&[0i64])],
            2,
        )
        .unwrap();

        let losses = model.loss(&prediction, &groundtruth).unwrap();
        for loss in [
            &losses.localization_loss,
            &losses.classification_loss,
            &losses.classification_loss_in_image_level,
        ] {
            let value = f64::from(loss);
            assert!(value.is_finite() && value >= 0.0);
        }
        losses.total_loss().backward();

        let summaries = observer.take();
        let tags: Vec<_> = summaries.iter().map(|(tag, _)| tag.as_str()).collect();
        assert_eq!(
            tags,
            vec![
                "Input/AvgNumGroundtruthBoxesPerImage",
                "Input/AvgNumPositiveAnchorsPerImage",
                "Input/AvgNumNegativeAnchorsPerImage",
                "Input/AvgNumIgnoredAnchorsPerImage",
                "PositiveAnchorLossCDF",
                "NegativeAnchorLossCDF",
            ]
        );
        assert_eq!(summaries[0].1, Summary::Scalar(0.5));
    }

    #[test]
    fn loss_with_hard_example_miner() {
        tch::manual_seed(13);
        let vs = nn::VarStore::new(Device::Cpu);
        let mut config = config();
        config.loss.hard_example_miner = Some(HardExampleMinerInit {
            max_negatives_per_positive: Some(r64(3.0)),
            ..Default::default()
        });
        let observer = Arc::new(MemoryObserver::new());
        let model = config
            .build(&vs.root())
            .unwrap()
            .with_observer(observer.clone());

        let images = Tensor::rand(&[1, 3, 64, 64], (Kind::Float, Device::Cpu)) * 255.0;
        let (preprocessed, _) = model.preprocess(&images, None).unwrap();
        let prediction = model.predict(&preprocessed, None, true).unwrap();
        let groundtruth = GroundTruth::from_label_ids(
            vec![Tensor::of_slice(&[0.2f32, 0.2, 0.7, 0.7]).view([1, 4])],
            &[Tensor::of_slice(&[0i64])],
            &[Tensor::of_slice(&[0i64])],
            2,
        )
        .unwrap();

        let losses = model.loss(&prediction, &groundtruth).unwrap();
        assert!(f64::from(&losses.classification_loss).is_finite());
        let tags: Vec<_> = observer.take().into_iter().map(|(tag, _)| tag).collect();
        assert!(tags.contains(&"HardExampleMiner/NumPositives".to_string()));
        assert!(!tags.contains(&"PositiveAnchorLossCDF".to_string()));
    }

    #[test]
    fn loss_rejects_mismatched_groundtruth() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = config().build(&vs.root()).unwrap();
        let prediction = fixed_prediction(0.0);
        let groundtruth = GroundTruth::from_label_ids(
            vec![Tensor::of_slice(&[0.2f32, 0.2, 0.7, 0.7]).view([1, 4])],
            &[Tensor::of_slice(&[0i64])],
            &[Tensor::of_slice(&[0i64])],
            3,
        )
        .unwrap();
        assert!(model.loss(&prediction, &groundtruth).is_err());
    }

    /// A 10x10 grid of disjoint anchors.
    fn grid_anchors() -> BoxList {
        let coords: Vec<f32> = (0..10)
            .cartesian_product(0..10)
            .flat_map(|(row, col)| {
                let (y, x) = (row as f32 / 10.0, col as f32 / 10.0);
                [y, x, y + 0.1, x + 0.1]
            })
            .collect();
        BoxList::new(Tensor::of_slice(&coords).view([100, 4])).unwrap()
    }

    #[test]
    fn assign_targets_pads_background_class() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = SsdConfig {
            num_classes: 5,
            ..config()
        }
        .build(&vs.root())
        .unwrap();

        let groundtruth = GroundTruth::from_label_ids(
            vec![Tensor::of_slice(&[0.2f32, 0.3, 0.3, 0.4]).view([1, 4])],
            &[Tensor::of_slice(&[2i64])],
            &[Tensor::of_slice(&[2i64])],
            5,
        )
        .unwrap();
        let targets = model.assign_targets(&grid_anchors(), &groundtruth).unwrap();

        assert_eq!(targets.cls_targets.size(), vec![1, 100, 6]);
        assert_eq!(targets.matches[0].num_matched_columns(), 1);
        // the groundtruth covers the anchor at row 2 and column 3
        assert_eq!(
            Vec::<f32>::from(&targets.cls_targets.i((0, 23))),
            vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0]
        );
        assert_eq!(
            Vec::<f32>::from(&targets.image_level_cls_targets.i(0)),
            vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0]
        );
        assert_abs_diff_eq!(
            f64::from(targets.cls_targets.i((0, .., 0)).sum(Kind::Float)),
            99.0
        );
    }

    #[test]
    fn assign_targets_without_groundtruth() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = config().build(&vs.root()).unwrap();

        let groundtruth = GroundTruth::from_label_ids(
            vec![Tensor::zeros(&[0, 4], (Kind::Float, Device::Cpu))],
            &[Tensor::zeros(&[0], (Kind::Int64, Device::Cpu))],
            &[Tensor::zeros(&[0], (Kind::Int64, Device::Cpu))],
            2,
        )
        .unwrap();
        let targets = model.assign_targets(&grid_anchors(), &groundtruth).unwrap();

        assert_eq!(targets.matches[0].num_unmatched_columns(), 100);
        assert_eq!(targets.matches[0].num_matched_columns(), 0);
        assert_eq!(Vec::<f32>::from(&targets.cls_weights.view([-1])), vec![1.0; 100]);
        assert_eq!(Vec::<f32>::from(&targets.reg_weights.view([-1])), vec![0.0; 100]);
        assert_eq!(
            Vec::<f32>::from(&targets.cls_targets.i((0, .., 0))),
            vec![1.0; 100]
        );
        assert_abs_diff_eq!(
            f64::from(targets.cls_targets.i((0, .., 1..)).sum(Kind::Float)),
            0.0
        );
    }

    #[test]
    fn restore_map_strips_extractor_scope() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = config().build(&vs.root()).unwrap();

        let detection = model.restore_map(&vs, true);
        let classification = model.restore_map(&vs, false);
        assert!(!detection.is_empty());
        assert_eq!(detection.len(), classification.len());
        assert!(detection
            .keys()
            .all(|name| name.starts_with("feature_extractor.")));
        assert!(classification
            .keys()
            .all(|name| !name.starts_with("feature_extractor.")));
        assert!(classification.contains_key("layer_0.conv.weight"));
    }

    #[test]
    fn strip_scope_components() {
        assert_eq!(strip_scope("feature_extractor.a.b", "feature_extractor"), Some("a.b"));
        assert_eq!(strip_scope("model.feature_extractor.a", "feature_extractor"), Some("a"));
        assert_eq!(strip_scope("my_feature_extractor.a", "feature_extractor"), None);
        assert_eq!(strip_scope("box_predictor.a", "feature_extractor"), None);
    }
}
