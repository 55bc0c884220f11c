//! The serialized form of the whole detector.

use crate::{
    anchor::AnchorGeneratorConfig,
    box_coder::BoxCoderConfig,
    common::*,
    loss::LossConfig,
    matcher::{MatcherConfig, RegionSimilarity},
    model::{
        ClassPredictorConfig, ConvolutionalBoxPredictorConfig, ConvolutionalBoxPredictorInit,
        FeatureExtractorConfig, FeatureExtractorRegistry, ImageLevelClassPredictorInit,
        ImageResizerConfig, SsdMetaArch, SsdMetaArchInit, FEATURE_EXTRACTOR_SCOPE,
    },
    post_processing::PostProcessingConfig,
    target_assigner::{background_label, TargetAssignerInit},
};

/// The detector configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SsdConfig {
    /// The number of classes excluding background.
    pub num_classes: i64,
    pub feature_extractor: FeatureExtractorConfig,
    pub image_resizer: ImageResizerConfig,
    pub anchor_generator: AnchorGeneratorConfig,
    pub box_coder: BoxCoderConfig,
    pub matcher: MatcherConfig,
    pub similarity: RegionSimilarity,
    pub positive_class_weight: R64,
    pub negative_class_weight: R64,
    pub box_predictor: ConvolutionalBoxPredictorConfig,
    pub class_predictor: ClassPredictorConfig,
    pub loss: LossConfig,
    pub post_processing: PostProcessingConfig,
}

impl Default for SsdConfig {
    fn default() -> Self {
        Self {
            num_classes: 90,
            feature_extractor: Default::default(),
            image_resizer: Default::default(),
            anchor_generator: Default::default(),
            box_coder: Default::default(),
            matcher: Default::default(),
            similarity: Default::default(),
            positive_class_weight: r64(1.0),
            negative_class_weight: r64(1.0),
            box_predictor: Default::default(),
            class_predictor: Default::default(),
            loss: Default::default(),
            post_processing: Default::default(),
        }
    }
}

impl SsdConfig {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file '{}'", path.display()))?;
        let config = json5::from_str(&text)
            .with_context(|| format!("unable to parse config file '{}'", path.display()))?;
        Ok(config)
    }

    /// Build the detector with the default feature extractors.
    pub fn build(&self, path: &nn::Path) -> Result<SsdMetaArch> {
        self.build_with_registry(path, &FeatureExtractorRegistry::default())
    }

    /// Build the detector, looking up the feature extractor in `registry`.
    pub fn build_with_registry(
        &self,
        path: &nn::Path,
        registry: &FeatureExtractorRegistry,
    ) -> Result<SsdMetaArch> {
        let Self {
            num_classes,
            ref feature_extractor,
            ref image_resizer,
            ref anchor_generator,
            ref box_coder,
            ref matcher,
            similarity,
            positive_class_weight,
            negative_class_weight,
            ref box_predictor,
            ref class_predictor,
            ref loss,
            ref post_processing,
        } = *self;

        ensure!(
            num_classes > 0,
            "num_classes must be positive, but get {}",
            num_classes
        );

        let feature_extractor =
            registry.build(&(path / FEATURE_EXTRACTOR_SCOPE), feature_extractor)?;
        let image_resizer = image_resizer.build(feature_extractor.secondary_input_size())?;
        let anchor_generator = anchor_generator.build()?;
        let box_coder = box_coder.build()?;
        let code_size = box_coder.code_size();

        let feature_map_channels = feature_extractor.feature_map_channels();
        let aux_channels = feature_extractor.aux_channels();
        let box_predictor = ConvolutionalBoxPredictorInit {
            num_classes,
            code_size,
            feature_map_channels: feature_map_channels.clone(),
            aux_channels,
            num_anchors_per_location: anchor_generator.num_anchors_per_location(),
            config: box_predictor.clone(),
        }
        .build(&(path / "box_predictor"))?;

        let image_level_feature_map_index = class_predictor.feature_map_index;
        let in_channels = *feature_map_channels
            .get(image_level_feature_map_index)
            .ok_or_else(|| {
                format_err!(
                    "the image level feature map index {} is out of range of {} feature maps",
                    image_level_feature_map_index,
                    feature_map_channels.len()
                )
            })?;
        let class_predictor = ImageLevelClassPredictorInit {
            num_classes,
            in_channels,
            aux_channels,
            use_dropout: class_predictor.use_dropout,
            dropout_keep_prob: class_predictor.dropout_keep_prob.raw(),
        }
        .build(&(path / "class_predictor"))?;

        let target_assigner = TargetAssignerInit {
            similarity,
            positive_class_weight: positive_class_weight.raw(),
            negative_class_weight: negative_class_weight.raw(),
            unmatched_cls_target: Some(background_label(
                &[num_classes + 1],
                Kind::Float,
                path.device(),
            )?),
            ..TargetAssignerInit::new(matcher.build()?, box_coder)
        }
        .build()?;
        let (non_max_suppression, score_converter) = post_processing.build()?;

        info!(
            "build '{}' detector with {} classes and {} feature maps",
            feature_extractor.name(),
            num_classes,
            feature_map_channels.len()
        );

        SsdMetaArchInit {
            num_classes,
            image_resizer,
            feature_extractor,
            anchor_generator,
            box_predictor: Box::new(box_predictor),
            class_predictor: Box::new(class_predictor),
            image_level_feature_map_index,
            target_assigner,
            loss: loss.build()?,
            non_max_suppression,
            score_converter,
        }
        .build()
    }
}
