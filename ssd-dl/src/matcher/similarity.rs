use crate::common::*;
use tch_goodies::{pairwise_ioa, pairwise_iou, pairwise_sq_dist};

/// Pairwise similarity between two box lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionSimilarity {
    Iou,
    /// Intersection over the area of the second list's boxes.
    Ioa,
    /// Negated squared distance between box coordinate vectors.
    NegSqDist,
}

impl Default for RegionSimilarity {
    fn default() -> Self {
        Self::Iou
    }
}

impl RegionSimilarity {
    /// Returns the `[N, M]` similarity of `lhs` rows against `rhs` columns.
    pub fn compare(&self, lhs: &BoxList, rhs: &BoxList) -> Tensor {
        match self {
            Self::Iou => pairwise_iou(lhs, rhs),
            Self::Ioa => pairwise_ioa(lhs, rhs),
            Self::NegSqDist => -pairwise_sq_dist(lhs, rhs),
        }
    }
}
