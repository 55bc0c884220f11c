//! Matching between groundtruth rows and anchor columns.

mod argmax;
mod bipartite;
mod similarity;

pub use argmax::*;
pub use bipartite::*;
pub use similarity::*;

use crate::common::*;

/// Marks an anchor column as matched to no groundtruth.
pub const UNMATCHED: i64 = -1;
/// Marks an anchor column to be ignored by the losses.
pub const IGNORED: i64 = -2;

/// The per-anchor matching result.
///
/// Each entry is a groundtruth row index, [UNMATCHED] or [IGNORED].
#[derive(Debug, TensorLike)]
pub struct Match {
    match_results: Tensor,
}

impl Match {
    pub fn new(match_results: Tensor) -> Result<Self> {
        match_results.f_size_of_rank(1, "match_results")?;
        ensure!(
            match_results.kind() == Kind::Int64,
            "match_results must be an int64 tensor, but get {:?}",
            match_results.kind()
        );
        Ok(Self { match_results })
    }

    pub fn match_results(&self) -> &Tensor {
        &self.match_results
    }

    pub fn num_columns(&self) -> i64 {
        self.match_results.size()[0]
    }

    pub fn matched_column_indicator(&self) -> Tensor {
        self.match_results.ge(0)
    }

    pub fn unmatched_column_indicator(&self) -> Tensor {
        self.match_results.eq(UNMATCHED)
    }

    pub fn ignored_column_indicator(&self) -> Tensor {
        self.match_results.eq(IGNORED)
    }

    /// Indicator of columns that are either unmatched or ignored.
    pub fn unmatched_or_ignored_column_indicator(&self) -> Tensor {
        self.match_results.lt(0)
    }

    pub fn matched_column_indices(&self) -> Tensor {
        self.matched_column_indicator().nonzero().view([-1])
    }

    pub fn unmatched_column_indices(&self) -> Tensor {
        self.unmatched_column_indicator().nonzero().view([-1])
    }

    pub fn ignored_column_indices(&self) -> Tensor {
        self.ignored_column_indicator().nonzero().view([-1])
    }

    /// Groundtruth row indices of the matched columns, in column order.
    pub fn matched_row_indices(&self) -> Tensor {
        self.match_results
            .index_select(0, &self.matched_column_indices())
    }

    pub fn num_matched_columns(&self) -> i64 {
        i64::from(self.matched_column_indicator().sum(Kind::Int64))
    }

    pub fn num_unmatched_columns(&self) -> i64 {
        i64::from(self.unmatched_column_indicator().sum(Kind::Int64))
    }

    pub fn num_ignored_columns(&self) -> i64 {
        i64::from(self.ignored_column_indicator().sum(Kind::Int64))
    }

    /// Gather rows of `input` by the match, producing one row per column.
    ///
    /// Matched columns take `input[row]`. Unmatched and ignored columns take
    /// `unmatched_value` and `ignored_value`, whose shapes must equal the
    /// trailing shape of `input`.
    pub fn gather_based_on_match(
        &self,
        input: &Tensor,
        unmatched_value: &Tensor,
        ignored_value: &Tensor,
    ) -> Result<Tensor> {
        let input_size = input.size();
        ensure!(!input_size.is_empty(), "input must have at least one dimension");
        let trailing = &input_size[1..];
        ensure!(
            unmatched_value.size() == trailing && ignored_value.size() == trailing,
            "unmatched and ignored values must have shape {:?}, but get {:?} and {:?}",
            trailing,
            unmatched_value.size(),
            ignored_value.size()
        );

        let device = input.device();
        let kind = input.kind();
        let table = Tensor::f_cat(
            &[
                ignored_value.to_device(device).to_kind(kind).unsqueeze(0),
                unmatched_value.to_device(device).to_kind(kind).unsqueeze(0),
                input.shallow_clone(),
            ],
            0,
        )?;
        // IGNORED maps to row 0, UNMATCHED to row 1, and row r to r + 2
        let gather_indices = (self.match_results.to_device(device) - IGNORED).clamp_min(0);
        let gathered = table.f_index_select(0, &gather_indices)?;
        Ok(gathered)
    }
}

/// Matches similarity rows (groundtruth) to columns (anchors).
pub trait Matcher: Debug + Send + Sync {
    /// Match a `[G, A]` similarity matrix. With `G = 0` every column is
    /// [UNMATCHED].
    fn match_columns(&self, similarity: &Tensor) -> Result<Match>;
}

/// Selects and parameterizes a [Matcher].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MatcherConfig {
    ArgMax {
        #[serde(default = "default_matched_threshold")]
        matched_threshold: Option<R64>,
        #[serde(default)]
        unmatched_threshold: Option<R64>,
        #[serde(default = "default_true")]
        negatives_lower_than_unmatched: bool,
        #[serde(default)]
        force_match_for_each_row: bool,
    },
    Bipartite,
}

fn default_matched_threshold() -> Option<R64> {
    Some(r64(0.5))
}

fn default_true() -> bool {
    true
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self::ArgMax {
            matched_threshold: default_matched_threshold(),
            unmatched_threshold: None,
            negatives_lower_than_unmatched: true,
            force_match_for_each_row: false,
        }
    }
}

impl MatcherConfig {
    pub fn build(&self) -> Result<Box<dyn Matcher>> {
        let matcher: Box<dyn Matcher> = match *self {
            Self::ArgMax {
                matched_threshold,
                unmatched_threshold,
                negatives_lower_than_unmatched,
                force_match_for_each_row,
            } => Box::new(
                ArgMaxMatcherInit {
                    matched_threshold: matched_threshold.map(|v| v.raw()),
                    unmatched_threshold: unmatched_threshold.map(|v| v.raw()),
                    negatives_lower_than_unmatched,
                    force_match_for_each_row,
                }
                .build()?,
            ),
            Self::Bipartite => Box::new(BipartiteMatcher),
        };
        Ok(matcher)
    }
}

fn empty_match(num_columns: i64, device: Device) -> Result<Match> {
    Match::new(Tensor::full(
        &[num_columns],
        UNMATCHED,
        (Kind::Int64, device),
    ))
}
