use super::{
    conv::{ConvBn2D, ConvBn2DInit, Padding},
    feature_extractor::{is_float_kind, FeatureExtractor, FeatureExtractorConfig},
    simple_conv::ImageTower,
};
use crate::common::*;

/// Turns a `[B, 1, H, W]` spectrogram-like input into a `[B, D]` vector.
#[derive(Debug)]
struct AudioNet {
    conv1: ConvBn2D,
    conv2: ConvBn2D,
    fc: ConvBn2D,
    projection: ConvBn2D,
    input_size: [i64; 2],
}

impl AudioNet {
    fn new(path: &nn::Path, config: &FeatureExtractorConfig) -> Result<Self> {
        let [height, width] = config.secondary_input_size;
        ensure!(
            height > 8 && width > 4,
            "the secondary input must be larger than 8x4, but get {}x{}",
            height,
            width
        );

        let valid = |in_c, out_c, ksize: [i64; 2]| ConvBn2DInit {
            ksize,
            padding: Padding::Valid,
            batch_norm: config.batch_norm,
            activation: config.activation,
            ..ConvBn2DInit::new(in_c, out_c, 1)
        };

        let conv1 = valid(1, config.depth(32), [5, 3]).build(path / "conv1")?;
        let conv2 = valid(conv1.out_channels(), config.depth(128), [5, 3]).build(path / "conv2")?;
        // two 5x3 valid convolutions remove 8 rows and 4 columns
        let fc = valid(conv2.out_channels(), config.depth(2048), [height - 8, width - 4])
            .build(path / "fc")?;
        let projection = valid(fc.out_channels(), config.depth(256), [1, 1])
            .build(path / "projection")?;

        Ok(Self {
            conv1,
            conv2,
            fc,
            projection,
            input_size: [height, width],
        })
    }

    fn forward_t(&self, inputs: &Tensor, train: bool) -> Result<Tensor> {
        let size = inputs.f_size_of_rank(4, "secondary inputs")?;
        ensure!(
            is_float_kind(inputs.kind()),
            "secondary inputs must be float, but get {:?}",
            inputs.kind()
        );
        ensure!(
            size[1] == 1 && size[2..] == self.input_size,
            "secondary inputs must have shape [batch, 1, {}, {}], but get {:?}",
            self.input_size[0],
            self.input_size[1],
            size
        );

        let xs = self.conv1.forward_t(inputs, train);
        let xs = self.conv2.forward_t(&xs, train);
        let xs = self.fc.forward_t(&xs, train);
        let xs = self.projection.forward_t(&xs, train);
        Ok(xs.flatten(1, -1))
    }
}

/// The image tower together with an audio net for the secondary input.
#[derive(Debug)]
pub struct SsdTwoStreamFeatureExtractor {
    tower: ImageTower,
    audio: AudioNet,
}

impl SsdTwoStreamFeatureExtractor {
    pub const NAME: &'static str = "ssd_two_stream";

    pub fn new(path: &nn::Path, config: &FeatureExtractorConfig) -> Result<Self> {
        Ok(Self {
            tower: ImageTower::new(path, config)?,
            audio: AudioNet::new(&(path / "audio"), config)?,
        })
    }

    pub fn boxed(
        path: &nn::Path,
        config: &FeatureExtractorConfig,
    ) -> Result<Box<dyn FeatureExtractor>> {
        Ok(Box::new(Self::new(path, config)?))
    }
}

impl FeatureExtractor for SsdTwoStreamFeatureExtractor {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn extract_features(
        &self,
        primary: &Tensor,
        secondary: Option<&Tensor>,
        train: bool,
    ) -> Result<(Vec<Tensor>, Option<Tensor>)> {
        let secondary = secondary
            .ok_or_else(|| format_err!("the '{}' extractor requires a secondary input", Self::NAME))?;
        let feature_maps = self.tower.forward_t(primary, train)?;
        let aux = self.audio.forward_t(secondary, train)?;

        let batch_size = primary.size()[0];
        ensure!(
            aux.size()[0] == batch_size,
            "the primary and secondary batch sizes differ: {} vs {}",
            batch_size,
            aux.size()[0]
        );
        Ok((feature_maps, Some(aux)))
    }

    fn feature_map_channels(&self) -> Vec<i64> {
        self.tower.channels()
    }

    fn aux_channels(&self) -> i64 {
        self.audio.projection.out_channels()
    }

    fn secondary_input_size(&self) -> Option<[i64; 2]> {
        Some(self.audio.input_size)
    }
}
