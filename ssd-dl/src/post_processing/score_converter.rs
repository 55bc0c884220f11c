use crate::common::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreConverterKind {
    Identity,
    Sigmoid,
    Softmax,
}

/// Converts logits to scores after dividing by the logit scale.
#[derive(Debug, Clone, Copy)]
pub struct ScoreConverter {
    kind: ScoreConverterKind,
    logit_scale: f64,
}

impl ScoreConverter {
    pub fn new(kind: ScoreConverterKind, logit_scale: f64) -> Result<Self> {
        ensure!(
            logit_scale > 0.0,
            "logit_scale must be positive, but get {}",
            logit_scale
        );
        Ok(Self { kind, logit_scale })
    }

    pub fn kind(&self) -> ScoreConverterKind {
        self.kind
    }

    /// Convert logits. Softmax normalizes over the last dimension.
    pub fn convert(&self, logits: &Tensor) -> Tensor {
        let scaled = logits / self.logit_scale;
        match self.kind {
            ScoreConverterKind::Identity => scaled,
            ScoreConverterKind::Sigmoid => scaled.sigmoid(),
            ScoreConverterKind::Softmax => scaled.softmax(-1, Kind::Float),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn convert_scores() {
        let logits = Tensor::of_slice(&[0f32, 2.0]).view([1, 2]);

        let identity = ScoreConverter::new(ScoreConverterKind::Identity, 2.0).unwrap();
        assert_eq!(Vec::<f32>::from(&identity.convert(&logits).view([-1])), vec![0.0, 1.0]);

        let sigmoid = ScoreConverter::new(ScoreConverterKind::Sigmoid, 1.0).unwrap();
        let scores = Vec::<f32>::from(&sigmoid.convert(&logits).view([-1]));
        assert_abs_diff_eq!(scores[0], 0.5, epsilon = 1e-6);

        let softmax = ScoreConverter::new(ScoreConverterKind::Softmax, 1.0).unwrap();
        let scores = softmax.convert(&logits);
        assert_abs_diff_eq!(f64::from(scores.sum(Kind::Float)), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn reject_non_positive_logit_scale() {
        assert!(ScoreConverter::new(ScoreConverterKind::Sigmoid, 0.0).is_err());
    }
}
