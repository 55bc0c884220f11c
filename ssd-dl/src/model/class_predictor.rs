use crate::common::*;

/// Predicts image-level class logits from one feature map.
pub trait ClassPredictor: Debug + Send {
    /// Returns `[B, C + 1]` logits.
    fn predict(
        &self,
        feature_map: &Tensor,
        aux_features: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassPredictorConfig {
    /// The feature map the image-level classes are predicted from.
    pub feature_map_index: usize,
    pub use_dropout: bool,
    pub dropout_keep_prob: R64,
}

impl Default for ClassPredictorConfig {
    fn default() -> Self {
        Self {
            feature_map_index: 5,
            use_dropout: false,
            dropout_keep_prob: r64(0.8),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageLevelClassPredictorInit {
    pub num_classes: i64,
    pub in_channels: i64,
    pub aux_channels: i64,
    pub use_dropout: bool,
    pub dropout_keep_prob: f64,
}

impl ImageLevelClassPredictorInit {
    pub fn build(self, path: &nn::Path) -> Result<ImageLevelClassPredictor> {
        let Self {
            num_classes,
            in_channels,
            aux_channels,
            use_dropout,
            dropout_keep_prob,
        } = self;

        ensure!(num_classes > 0, "num_classes must be positive");
        ensure!(
            in_channels > 0 && aux_channels >= 0,
            "invalid input channels {} and auxiliary channels {}",
            in_channels,
            aux_channels
        );
        ensure!(
            dropout_keep_prob > 0.0 && dropout_keep_prob <= 1.0,
            "dropout_keep_prob must be in range (0, 1], but get {}",
            dropout_keep_prob
        );

        let linear = nn::linear(
            path / "logits",
            in_channels + aux_channels,
            num_classes + 1,
            Default::default(),
        );

        Ok(ImageLevelClassPredictor {
            linear,
            in_channels,
            aux_channels,
            dropout: use_dropout.then(|| 1.0 - dropout_keep_prob),
        })
    }
}

/// Global average pooling followed by a linear layer.
#[derive(Debug)]
pub struct ImageLevelClassPredictor {
    linear: nn::Linear,
    in_channels: i64,
    aux_channels: i64,
    dropout: Option<f64>,
}

impl ClassPredictor for ImageLevelClassPredictor {
    fn predict(
        &self,
        feature_map: &Tensor,
        aux_features: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (_, channels, _, _) = feature_map.size4()?;
        ensure!(
            channels == self.in_channels,
            "expect a feature map of {} channels, but get {}",
            self.in_channels,
            channels
        );

        let pooled = feature_map.mean_dim(&[2, 3], false, Kind::Float);
        let xs = match (aux_features, self.aux_channels) {
            (Some(aux), aux_channels) if aux_channels > 0 => {
                Tensor::f_cat(&[pooled, aux.to_kind(Kind::Float)], 1)?
            }
            (None, 0) => pooled,
            (aux, aux_channels) => bail!(
                "expect {} auxiliary channels, but get {:?}",
                aux_channels,
                aux.map(|aux| aux.size())
            ),
        };
        let xs = match self.dropout {
            Some(prob) => xs.dropout(prob, train),
            None => xs,
        };
        Ok(xs.apply(&self.linear))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_level_logits() {
        let vs = nn::VarStore::new(Device::Cpu);
        let predictor = ImageLevelClassPredictorInit {
            num_classes: 3,
            in_channels: 8,
            aux_channels: 5,
            use_dropout: false,
            dropout_keep_prob: 1.0,
        }
        .build(&vs.root())
        .unwrap();

        let feature_map = Tensor::rand(&[2, 8, 1, 1], (Kind::Float, Device::Cpu));
        let aux = Tensor::rand(&[2, 5], (Kind::Float, Device::Cpu));
        let logits = predictor.predict(&feature_map, Some(&aux), false).unwrap();
        assert_eq!(logits.size(), vec![2, 4]);

        assert!(predictor.predict(&feature_map, None, false).is_err());
        let wrong = Tensor::rand(&[2, 4, 1, 1], (Kind::Float, Device::Cpu));
        assert!(predictor.predict(&wrong, Some(&aux), false).is_err());
    }
}
