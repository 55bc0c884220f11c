//! Backbones producing the multi-resolution feature maps.

use super::{simple_conv::SsdSimpleConvFeatureExtractor, two_stream::SsdTwoStreamFeatureExtractor};
use crate::common::*;

/// The smallest input height and width a feature extractor accepts.
pub const MIN_INPUT_SIZE: i64 = 33;

/// Turns a preprocessed image batch, and optionally a secondary input, into
/// feature maps.
pub trait FeatureExtractor: Debug + Send {
    fn name(&self) -> &str;

    /// Map `[B, C, H, W]` pixel values in `[0, 255]` to `[-1, 1]`. Inputs
    /// that are already normalized pass through.
    fn preprocess(&self, inputs: &Tensor, normalized: bool) -> Result<Tensor> {
        ensure!(
            is_float_kind(inputs.kind()),
            "preprocess expects a float tensor, but get {:?}",
            inputs.kind()
        );
        if normalized {
            Ok(inputs.shallow_clone())
        } else {
            Ok(inputs * (2.0 / 255.0) - 1.0)
        }
    }

    /// Returns the `[B, C_i, H_i, W_i]` feature maps and the optional `[B, D]`
    /// auxiliary features derived from `secondary`.
    fn extract_features(
        &self,
        primary: &Tensor,
        secondary: Option<&Tensor>,
        train: bool,
    ) -> Result<(Vec<Tensor>, Option<Tensor>)>;

    /// The channels of each feature map.
    fn feature_map_channels(&self) -> Vec<i64>;

    /// The size of the auxiliary features, or zero if there are none.
    fn aux_channels(&self) -> i64 {
        0
    }

    /// The `[height, width]` the secondary input is resized to, if any.
    fn secondary_input_size(&self) -> Option<[i64; 2]> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureExtractorConfig {
    /// The registry name of the extractor.
    #[serde(rename = "type")]
    pub name: String,
    pub depth_multiplier: R64,
    pub min_depth: i64,
    /// Zero-pad the input height and width up to a multiple of this value.
    pub pad_to_multiple: i64,
    /// The depths of the feature maps before the multiplier applies.
    pub layer_depths: Vec<i64>,
    pub batch_norm: bool,
    pub activation: Activation,
    /// `[height, width]` of the secondary input.
    pub secondary_input_size: [i64; 2],
}

impl Default for FeatureExtractorConfig {
    fn default() -> Self {
        Self {
            name: SsdSimpleConvFeatureExtractor::NAME.into(),
            depth_multiplier: r64(1.0),
            min_depth: 16,
            pad_to_multiple: 1,
            layer_depths: vec![64, 128, 256, 256, 128, 128],
            batch_norm: true,
            activation: Activation::Relu6,
            secondary_input_size: [20, 9],
        }
    }
}

impl FeatureExtractorConfig {
    /// Scale a layer depth by the multiplier, bounded below by `min_depth`.
    pub fn depth(&self, depth: i64) -> i64 {
        ((depth as f64 * self.depth_multiplier.raw()) as i64).max(self.min_depth)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        ensure!(
            self.depth_multiplier > 0.0,
            "depth_multiplier must be positive, but get {}",
            self.depth_multiplier
        );
        ensure!(self.min_depth > 0, "min_depth must be positive");
        ensure!(self.pad_to_multiple > 0, "pad_to_multiple must be positive");
        ensure!(
            !self.layer_depths.is_empty(),
            "layer_depths must not be empty"
        );
        Ok(())
    }
}

/// Builds a feature extractor under a variable path.
pub type FeatureExtractorBuilder =
    fn(&nn::Path, &FeatureExtractorConfig) -> Result<Box<dyn FeatureExtractor>>;

/// Maps extractor names to their builders.
#[derive(Debug, Clone)]
pub struct FeatureExtractorRegistry {
    builders: IndexMap<String, FeatureExtractorBuilder>,
}

impl Default for FeatureExtractorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.builders.insert(
            SsdSimpleConvFeatureExtractor::NAME.into(),
            SsdSimpleConvFeatureExtractor::boxed,
        );
        registry.builders.insert(
            SsdTwoStreamFeatureExtractor::NAME.into(),
            SsdTwoStreamFeatureExtractor::boxed,
        );
        registry
    }
}

impl FeatureExtractorRegistry {
    /// A registry without any extractor.
    pub fn empty() -> Self {
        Self {
            builders: IndexMap::new(),
        }
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        builder: FeatureExtractorBuilder,
    ) -> Result<()> {
        let name = name.into();
        ensure!(
            !self.builders.contains_key(&name),
            "the feature extractor '{}' is already registered",
            name
        );
        self.builders.insert(name, builder);
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.builders.keys().map(|name| name.as_str())
    }

    pub fn build(
        &self,
        path: &nn::Path,
        config: &FeatureExtractorConfig,
    ) -> Result<Box<dyn FeatureExtractor>> {
        let builder = self.builders.get(&config.name).ok_or_else(|| {
            format_err!(
                "unknown feature extractor '{}', the available extractors are {:?}",
                config.name,
                self.names().collect::<Vec<_>>()
            )
        })?;
        config.validate()?;
        builder(path, config)
    }
}

pub(crate) fn is_float_kind(kind: Kind) -> bool {
    matches!(
        kind,
        Kind::Half | Kind::Float | Kind::Double | Kind::BFloat16
    )
}

/// Check the input size and apply `pad_to_multiple`.
pub(crate) fn prepare_inputs(inputs: &Tensor, pad_to_multiple: i64) -> Result<Tensor> {
    let size = inputs.f_size_of_rank(4, "inputs")?;
    let (height, width) = (size[2], size[3]);
    ensure!(
        height >= MIN_INPUT_SIZE && width >= MIN_INPUT_SIZE,
        "image size must be at least {}x{}, but get {}x{}",
        MIN_INPUT_SIZE,
        MIN_INPUT_SIZE,
        height,
        width
    );
    if pad_to_multiple > 1 {
        inputs.f_pad_to_multiple(pad_to_multiple)
    } else {
        Ok(inputs.shallow_clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn registry_builds_by_name() {
        let vs = nn::VarStore::new(Device::Cpu);
        let registry = FeatureExtractorRegistry::default();
        assert_eq!(
            registry.names().collect::<Vec<_>>(),
            vec!["ssd_simple_conv", "ssd_two_stream"]
        );

        let config = FeatureExtractorConfig {
            name: "ssd_two_stream".into(),
            ..Default::default()
        };
        let extractor = registry.build(&vs.root(), &config).unwrap();
        assert_eq!(extractor.name(), "ssd_two_stream");

        let config = FeatureExtractorConfig {
            name: "inception_v3".into(),
            ..Default::default()
        };
        let err = registry.build(&vs.root(), &config).unwrap_err();
        assert!(format!("{}", err).contains("inception_v3"));
    }

    #[test]
    fn register_rejects_duplicates() {
        let mut registry = FeatureExtractorRegistry::default();
        let result = registry.register("ssd_simple_conv", SsdSimpleConvFeatureExtractor::boxed);
        assert!(result.is_err());
        assert!(registry
            .register("ssd_custom", SsdSimpleConvFeatureExtractor::boxed)
            .is_ok());
    }

    #[test]
    fn depth_is_scaled_and_bounded() {
        let config = FeatureExtractorConfig {
            depth_multiplier: r64(0.25),
            min_depth: 16,
            ..Default::default()
        };
        assert_eq!(config.depth(256), 64);
        assert_eq!(config.depth(32), 16);
    }

    #[test]
    fn preprocess_maps_pixels_to_unit_range() {
        let vs = nn::VarStore::new(Device::Cpu);
        let extractor = FeatureExtractorRegistry::default()
            .build(&vs.root(), &Default::default())
            .unwrap();
        let inputs = Tensor::of_slice(&[0f32, 127.5, 255.0]).view([1, 1, 1, 3]);
        let outputs = Vec::<f32>::from(&extractor.preprocess(&inputs, false).unwrap().view([-1]));
        for (actual, expect) in outputs.into_iter().zip([-1.0, 0.0, 1.0]) {
            assert_abs_diff_eq!(actual, expect, epsilon = 1e-6);
        }

        let kept = extractor.preprocess(&inputs, true).unwrap();
        assert_eq!(Vec::<f32>::from(&kept.view([-1])), vec![0.0, 127.5, 255.0]);

        let ints = Tensor::of_slice(&[0u8, 255]).view([1, 1, 1, 2]);
        assert!(extractor.preprocess(&ints, false).is_err());
    }

    #[test]
    fn reject_small_inputs() {
        let inputs = Tensor::zeros(&[1, 3, 32, 64], (Kind::Float, Device::Cpu));
        assert!(prepare_inputs(&inputs, 1).is_err());

        let inputs = Tensor::zeros(&[1, 3, 33, 35], (Kind::Float, Device::Cpu));
        assert_eq!(prepare_inputs(&inputs, 8).unwrap().size(), vec![1, 3, 40, 40]);
    }
}
