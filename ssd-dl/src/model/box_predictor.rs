//! Per-feature-map box and class heads.

use super::conv::{ConvBn2D, ConvBn2DInit};
use crate::common::*;

/// The predictions of one feature map.
#[derive(Debug, TensorLike)]
pub struct BoxPredictions {
    /// `[B, A_i, 1, code_size]`
    pub box_encodings: Tensor,
    /// `[B, A_i, C + 1]`
    pub class_predictions_with_background: Tensor,
}

pub trait BoxPredictor: Debug + Send {
    /// The number of classes excluding background.
    fn num_classes(&self) -> i64;

    /// Predict boxes and class logits on the `index`-th feature map. Anchors
    /// are ordered by row, then column, then anchor at the location.
    fn predict(
        &self,
        feature_map: &Tensor,
        aux_features: Option<&Tensor>,
        num_anchors_per_location: i64,
        index: usize,
        train: bool,
    ) -> Result<BoxPredictions>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvolutionalBoxPredictorConfig {
    pub kernel_size: i64,
    /// Channels of an optional 1x1 layer before the heads. Zero disables it.
    pub depth: i64,
    pub use_dropout: bool,
    pub dropout_keep_prob: R64,
    pub apply_sigmoid_to_scores: bool,
}

impl Default for ConvolutionalBoxPredictorConfig {
    fn default() -> Self {
        Self {
            kernel_size: 3,
            depth: 0,
            use_dropout: false,
            dropout_keep_prob: r64(0.8),
            apply_sigmoid_to_scores: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConvolutionalBoxPredictorInit {
    pub num_classes: i64,
    pub code_size: i64,
    pub feature_map_channels: Vec<i64>,
    pub aux_channels: i64,
    pub num_anchors_per_location: Vec<i64>,
    pub config: ConvolutionalBoxPredictorConfig,
}

impl ConvolutionalBoxPredictorInit {
    pub fn build(self, path: &nn::Path) -> Result<ConvolutionalBoxPredictor> {
        let Self {
            num_classes,
            code_size,
            feature_map_channels,
            aux_channels,
            num_anchors_per_location,
            config:
                ConvolutionalBoxPredictorConfig {
                    kernel_size,
                    depth,
                    use_dropout,
                    dropout_keep_prob,
                    apply_sigmoid_to_scores,
                },
        } = self;

        ensure!(num_classes > 0, "num_classes must be positive");
        ensure!(code_size > 0, "code_size must be positive");
        ensure!(aux_channels >= 0, "aux_channels must be non-negative");
        ensure!(depth >= 0, "depth must be non-negative");
        ensure!(
            dropout_keep_prob > 0.0 && dropout_keep_prob <= 1.0,
            "dropout_keep_prob must be in range (0, 1], but get {}",
            dropout_keep_prob
        );
        ensure!(
            feature_map_channels.len() == num_anchors_per_location.len(),
            "expect one anchor count per feature map, but get {} feature maps and {} counts",
            feature_map_channels.len(),
            num_anchors_per_location.len()
        );

        let heads: Vec<_> = izip!(feature_map_channels, num_anchors_per_location)
            .enumerate()
            .map(|(index, (in_c, num_anchors))| -> Result<_> {
                let path = path / format!("box_predictor_{}", index);
                let in_c = in_c + aux_channels;
                let hidden = (depth > 0)
                    .then(|| {
                        ConvBn2DInit {
                            activation: Activation::Relu6,
                            ..ConvBn2DInit::new(in_c, depth, 1)
                        }
                        .build(&path / "hidden")
                    })
                    .transpose()?;
                let head_in_c = if depth > 0 { depth } else { in_c };
                let linear = |out_c| ConvBn2DInit {
                    activation: Activation::Linear,
                    ..ConvBn2DInit::new(head_in_c, out_c, kernel_size)
                };
                let box_encoder =
                    linear(num_anchors * code_size).build(&path / "box_encodings")?;
                let class_predictor = linear(num_anchors * (num_classes + 1))
                    .build(&path / "class_predictions")?;

                Ok(ConvolutionalHead {
                    hidden,
                    box_encoder,
                    class_predictor,
                    num_anchors,
                })
            })
            .try_collect()?;

        Ok(ConvolutionalBoxPredictor {
            num_classes,
            code_size,
            heads,
            dropout: use_dropout.then(|| 1.0 - dropout_keep_prob.raw()),
            apply_sigmoid_to_scores,
        })
    }
}

#[derive(Debug)]
struct ConvolutionalHead {
    hidden: Option<ConvBn2D>,
    box_encoder: ConvBn2D,
    class_predictor: ConvBn2D,
    num_anchors: i64,
}

/// Convolutional box and class heads with one set of weights per feature map.
#[derive(Debug)]
pub struct ConvolutionalBoxPredictor {
    num_classes: i64,
    code_size: i64,
    heads: Vec<ConvolutionalHead>,
    dropout: Option<f64>,
    apply_sigmoid_to_scores: bool,
}

impl BoxPredictor for ConvolutionalBoxPredictor {
    fn num_classes(&self) -> i64 {
        self.num_classes
    }

    fn predict(
        &self,
        feature_map: &Tensor,
        aux_features: Option<&Tensor>,
        num_anchors_per_location: i64,
        index: usize,
        train: bool,
    ) -> Result<BoxPredictions> {
        let head = self.heads.get(index).ok_or_else(|| {
            format_err!(
                "the feature map index {} is out of range, the predictor has {} heads",
                index,
                self.heads.len()
            )
        })?;
        ensure!(
            head.num_anchors == num_anchors_per_location,
            "the head {} predicts {} anchors per location, but get {}",
            index,
            head.num_anchors,
            num_anchors_per_location
        );

        let (batch_size, _, height, width) = feature_map.size4()?;
        let xs = match aux_features {
            Some(aux) => {
                let tiled = tile_aux_features(aux, batch_size, height, width)?;
                Tensor::f_cat(&[feature_map.shallow_clone(), tiled], 1)?
            }
            None => feature_map.shallow_clone(),
        };
        let xs = match &head.hidden {
            Some(hidden) => hidden.forward_t(&xs, train),
            None => xs,
        };
        let xs = match self.dropout {
            Some(prob) => xs.dropout(prob, train),
            None => xs,
        };

        let num_anchors = height * width * head.num_anchors;
        let box_encodings = head
            .box_encoder
            .forward_t(&xs, train)
            .permute(&[0, 2, 3, 1])
            .contiguous()
            .view([batch_size, num_anchors, 1, self.code_size]);
        let class_predictions_with_background = head
            .class_predictor
            .forward_t(&xs, train)
            .permute(&[0, 2, 3, 1])
            .contiguous()
            .view([batch_size, num_anchors, self.num_classes + 1]);
        let class_predictions_with_background = if self.apply_sigmoid_to_scores {
            class_predictions_with_background.sigmoid()
        } else {
            class_predictions_with_background
        };

        Ok(BoxPredictions {
            box_encodings,
            class_predictions_with_background,
        })
    }
}

/// Repeat `[B, D]` features over an `height` x `width` grid.
pub(crate) fn tile_aux_features(
    aux: &Tensor,
    batch_size: i64,
    height: i64,
    width: i64,
) -> Result<Tensor> {
    let (aux_batch_size, channels) = aux.size2()?;
    ensure!(
        aux_batch_size == batch_size,
        "auxiliary features must have batch size {}, but get {}",
        batch_size,
        aux_batch_size
    );
    let tiled = aux
        .view([batch_size, channels, 1, 1])
        .f_expand(&[batch_size, channels, height, width], false)?;
    Ok(tiled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn predictor(
        vs: &nn::VarStore,
        aux_channels: i64,
        config: ConvolutionalBoxPredictorConfig,
    ) -> ConvolutionalBoxPredictor {
        ConvolutionalBoxPredictorInit {
            num_classes: 4,
            code_size: 4,
            feature_map_channels: vec![8, 16],
            aux_channels,
            num_anchors_per_location: vec![3, 6],
            config,
        }
        .build(&vs.root())
        .unwrap()
    }

    #[test]
    fn prediction_shapes() {
        let vs = nn::VarStore::new(Device::Cpu);
        let predictor = predictor(&vs, 0, Default::default());

        let feature_map = Tensor::rand(&[2, 16, 3, 5], (Kind::Float, Device::Cpu));
        let predictions = predictor
            .predict(&feature_map, None, 6, 1, false)
            .unwrap();
        assert_eq!(predictions.box_encodings.size(), vec![2, 90, 1, 4]);
        assert_eq!(
            predictions.class_predictions_with_background.size(),
            vec![2, 90, 5]
        );

        assert!(predictor.predict(&feature_map, None, 3, 1, false).is_err());
        assert!(predictor.predict(&feature_map, None, 6, 2, false).is_err());
    }

    #[test]
    fn aux_features_and_sigmoid() {
        let vs = nn::VarStore::new(Device::Cpu);
        let predictor = predictor(
            &vs,
            7,
            ConvolutionalBoxPredictorConfig {
                depth: 12,
                use_dropout: true,
                apply_sigmoid_to_scores: true,
                ..Default::default()
            },
        );

        let feature_map = Tensor::rand(&[2, 8, 4, 4], (Kind::Float, Device::Cpu));
        let aux = Tensor::rand(&[2, 7], (Kind::Float, Device::Cpu));
        let predictions = predictor
            .predict(&feature_map, Some(&aux), 3, 0, true)
            .unwrap();
        let scores = &predictions.class_predictions_with_background;
        assert_eq!(scores.size(), vec![2, 48, 5]);
        assert!(bool::from(scores.ge(0.0).logical_and(&scores.le(1.0)).all()));
    }

    #[test]
    fn tile_aux() {
        let aux = Tensor::of_slice(&[1f32, 2.0]).view([1, 2]);
        let tiled = tile_aux_features(&aux, 1, 2, 3).unwrap();
        assert_eq!(tiled.size(), vec![1, 2, 2, 3]);
        assert_eq!(
            Vec::<f32>::from(&tiled.contiguous().view([-1])),
            vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0]
        );
        assert!(tile_aux_features(&aux, 2, 2, 3).is_err());
    }
}
