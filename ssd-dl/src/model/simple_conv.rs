use super::{
    conv::{ConvBn2D, ConvBn2DInit},
    feature_extractor::{prepare_inputs, FeatureExtractor, FeatureExtractorConfig},
};
use crate::common::*;

/// A tower of stride-2 convolutions, one feature map per layer.
#[derive(Debug)]
pub(crate) struct ImageTower {
    layers: Vec<(ConvBn2D, ConvBn2D)>,
    pad_to_multiple: i64,
}

impl ImageTower {
    pub fn new(path: &nn::Path, config: &FeatureExtractorConfig) -> Result<Self> {
        let mut in_c = 3;
        let layers: Vec<_> = config
            .layer_depths
            .iter()
            .enumerate()
            .map(|(index, &depth)| -> Result<_> {
                let depth = config.depth(depth);
                let path = path / format!("layer_{}", index);
                let reduce = ConvBn2DInit {
                    batch_norm: config.batch_norm,
                    activation: config.activation,
                    ..ConvBn2DInit::new(in_c, (depth / 2).max(config.min_depth), 1)
                }
                .build(&path / "reduce")?;
                let conv = ConvBn2DInit {
                    stride: 2,
                    batch_norm: config.batch_norm,
                    activation: config.activation,
                    ..ConvBn2DInit::new(reduce.out_channels(), depth, 3)
                }
                .build(&path / "conv")?;
                in_c = depth;
                Ok((reduce, conv))
            })
            .try_collect()?;

        Ok(Self {
            layers,
            pad_to_multiple: config.pad_to_multiple,
        })
    }

    pub fn channels(&self) -> Vec<i64> {
        self.layers
            .iter()
            .map(|(_, conv)| conv.out_channels())
            .collect()
    }

    pub fn forward_t(&self, inputs: &Tensor, train: bool) -> Result<Vec<Tensor>> {
        let mut xs = prepare_inputs(inputs, self.pad_to_multiple)?;
        let feature_maps = self
            .layers
            .iter()
            .map(|(reduce, conv)| {
                xs = conv.forward_t(&reduce.forward_t(&xs, train), train);
                xs.shallow_clone()
            })
            .collect();
        Ok(feature_maps)
    }
}

/// The image-only extractor.
#[derive(Debug)]
pub struct SsdSimpleConvFeatureExtractor {
    tower: ImageTower,
}

impl SsdSimpleConvFeatureExtractor {
    pub const NAME: &'static str = "ssd_simple_conv";

    pub fn new(path: &nn::Path, config: &FeatureExtractorConfig) -> Result<Self> {
        Ok(Self {
            tower: ImageTower::new(path, config)?,
        })
    }

    pub fn boxed(
        path: &nn::Path,
        config: &FeatureExtractorConfig,
    ) -> Result<Box<dyn FeatureExtractor>> {
        Ok(Box::new(Self::new(path, config)?))
    }
}

impl FeatureExtractor for SsdSimpleConvFeatureExtractor {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn extract_features(
        &self,
        primary: &Tensor,
        _secondary: Option<&Tensor>,
        train: bool,
    ) -> Result<(Vec<Tensor>, Option<Tensor>)> {
        Ok((self.tower.forward_t(primary, train)?, None))
    }

    fn feature_map_channels(&self) -> Vec<i64> {
        self.tower.channels()
    }
}
