//! Conversion of raw predictions into detections.

mod multiclass_nms;
mod score_converter;

pub use multiclass_nms::*;
pub use score_converter::*;

use crate::common::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessingConfig {
    pub nms: BatchMultiClassNonMaxSuppressionInit,
    pub score_converter: ScoreConverterKind,
    pub logit_scale: R64,
}

impl Default for PostProcessingConfig {
    fn default() -> Self {
        Self {
            nms: Default::default(),
            score_converter: ScoreConverterKind::Sigmoid,
            logit_scale: r64(1.0),
        }
    }
}

impl PostProcessingConfig {
    pub fn build(&self) -> Result<(BatchMultiClassNonMaxSuppression, ScoreConverter)> {
        let nms = self.nms.build()?;
        let score_converter = ScoreConverter::new(self.score_converter, self.logit_scale.raw())?;
        Ok((nms, score_converter))
    }
}
