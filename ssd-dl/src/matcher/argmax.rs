use super::{empty_match, Match, Matcher, IGNORED, UNMATCHED};
use crate::common::*;

#[derive(Debug, Clone)]
pub struct ArgMaxMatcherInit {
    /// Columns whose best similarity reaches this value are matched. If
    /// `None`, every column is matched to its best row.
    pub matched_threshold: Option<f64>,
    /// Defaults to `matched_threshold`.
    pub unmatched_threshold: Option<f64>,
    /// Columns below `unmatched_threshold` are unmatched and those in between
    /// are ignored. Swaps the two roles when unset.
    pub negatives_lower_than_unmatched: bool,
    /// Ensure every row is matched to at least its best column.
    pub force_match_for_each_row: bool,
}

impl Default for ArgMaxMatcherInit {
    fn default() -> Self {
        Self {
            matched_threshold: Some(0.5),
            unmatched_threshold: None,
            negatives_lower_than_unmatched: true,
            force_match_for_each_row: false,
        }
    }
}

impl ArgMaxMatcherInit {
    pub fn build(self) -> Result<ArgMaxMatcher> {
        let Self {
            matched_threshold,
            unmatched_threshold,
            negatives_lower_than_unmatched,
            force_match_for_each_row,
        } = self;

        let thresholds = match (matched_threshold, unmatched_threshold) {
            (None, None) => None,
            (None, Some(_)) => {
                bail!("unmatched_threshold requires matched_threshold to be set")
            }
            (Some(matched), unmatched) => {
                let unmatched = unmatched.unwrap_or(matched);
                ensure!(
                    matched >= unmatched,
                    "matched_threshold {} must be greater than or equal to unmatched_threshold {}",
                    matched,
                    unmatched
                );
                ensure!(
                    negatives_lower_than_unmatched || matched != unmatched,
                    "matched_threshold and unmatched_threshold must differ when negatives are \
                     between the thresholds"
                );
                Some((matched, unmatched))
            }
        };

        Ok(ArgMaxMatcher {
            thresholds,
            negatives_lower_than_unmatched,
            force_match_for_each_row,
        })
    }
}

/// Matches each column to the row with the highest similarity, subject to
/// thresholds.
#[derive(Debug, Clone)]
pub struct ArgMaxMatcher {
    thresholds: Option<(f64, f64)>,
    negatives_lower_than_unmatched: bool,
    force_match_for_each_row: bool,
}

impl Matcher for ArgMaxMatcher {
    fn match_columns(&self, similarity: &Tensor) -> Result<Match> {
        let (num_rows, num_columns) = similarity.size2()?;
        let device = similarity.device();

        if num_rows == 0 {
            return empty_match(num_columns, device);
        }
        if num_columns == 0 {
            return Match::new(Tensor::zeros(&[0], (Kind::Int64, device)));
        }

        let similarity = similarity.detach();
        let mut matches = similarity.argmax(0, false);

        if let Some((matched_threshold, unmatched_threshold)) = self.thresholds {
            let matched_vals = similarity.amax(&[0], false);
            let below_unmatched = matched_vals.lt(unmatched_threshold);
            let between = matched_vals
                .ge(unmatched_threshold)
                .logical_and(&matched_vals.lt(matched_threshold));

            let (below_value, between_value) = if self.negatives_lower_than_unmatched {
                (UNMATCHED, IGNORED)
            } else {
                (IGNORED, UNMATCHED)
            };
            matches = matches
                .masked_fill(&below_unmatched, below_value)
                .masked_fill(&between, between_value);
        }

        if self.force_match_for_each_row {
            let best_columns = Vec::<i64>::from(&similarity.argmax(1, false).to_device(Device::Cpu));
            let mut forced = Vec::<i64>::from(&matches.to_device(Device::Cpu));
            let mut is_forced = vec![false; num_columns as usize];

            // the first row claiming a column wins
            for (row, &column) in best_columns.iter().enumerate() {
                let column = column as usize;
                if !is_forced[column] {
                    is_forced[column] = true;
                    forced[column] = row as i64;
                }
            }
            matches = Tensor::of_slice(&forced).to_device(device);
        }

        Match::new(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn similarity(values: &[f32], num_rows: i64) -> Tensor {
        Tensor::of_slice(values).view([num_rows, -1])
    }

    fn results(matches: &Match) -> Vec<i64> {
        Vec::<i64>::from(matches.match_results())
    }

    #[test]
    fn match_without_thresholds() {
        let matcher = ArgMaxMatcherInit {
            matched_threshold: None,
            ..Default::default()
        }
        .build()
        .unwrap();
        let sim = similarity(&[1.0, 1.0, 1.0, 3.0, 1.0, 2.0, 2.0, -1.0, 2.0, 0.0, 4.0, 0.0], 2);
        let matches = matcher.match_columns(&sim).unwrap();
        assert_eq!(results(&matches), vec![1, 0, 1, 0, 1, 0]);
    }

    #[test]
    fn match_with_thresholds() {
        let matcher = ArgMaxMatcherInit {
            matched_threshold: Some(3.0),
            unmatched_threshold: Some(2.0),
            ..Default::default()
        }
        .build()
        .unwrap();
        let sim = similarity(&[1.0, 1.0, 1.0, 3.0, 1.0, 2.0, 2.0, -1.0, 2.0, 0.0, 4.0, 0.0], 2);
        let matches = matcher.match_columns(&sim).unwrap();
        assert_eq!(results(&matches), vec![-2, -1, -2, 0, 1, -2]);
    }

    #[test]
    fn negatives_between_thresholds() {
        let matcher = ArgMaxMatcherInit {
            matched_threshold: Some(3.0),
            unmatched_threshold: Some(2.0),
            negatives_lower_than_unmatched: false,
            ..Default::default()
        }
        .build()
        .unwrap();
        let sim = similarity(&[1.0, 1.0, 1.0, 3.0, 1.0, 2.0, 2.0, -1.0, 2.0, 0.0, 4.0, 0.0], 2);
        let matches = matcher.match_columns(&sim).unwrap();
        assert_eq!(results(&matches), vec![-1, -2, -1, 0, 1, -1]);
    }

    #[test]
    fn force_match_for_each_row() {
        let matcher = ArgMaxMatcherInit {
            matched_threshold: Some(0.5),
            force_match_for_each_row: true,
            ..Default::default()
        }
        .build()
        .unwrap();
        let sim = similarity(&[0.9, 0.1, 0.0, 0.2, 0.3, 0.4], 2);
        let matches = matcher.match_columns(&sim).unwrap();
        assert_eq!(results(&matches), vec![0, -1, 1]);
    }

    #[test]
    fn no_rows_leaves_every_column_unmatched() {
        let matcher = ArgMaxMatcherInit::default().build().unwrap();
        let sim = Tensor::zeros(&[0, 4], (Kind::Float, Device::Cpu));
        let matches = matcher.match_columns(&sim).unwrap();
        assert_eq!(results(&matches), vec![-1; 4]);
    }

    #[test]
    fn invalid_thresholds() {
        assert!(ArgMaxMatcherInit {
            matched_threshold: Some(0.3),
            unmatched_threshold: Some(0.5),
            ..Default::default()
        }
        .build()
        .is_err());

        assert!(ArgMaxMatcherInit {
            matched_threshold: None,
            unmatched_threshold: Some(0.5),
            ..Default::default()
        }
        .build()
        .is_err());

        assert!(ArgMaxMatcherInit {
            matched_threshold: Some(0.5),
            unmatched_threshold: Some(0.5),
            negatives_lower_than_unmatched: false,
            ..Default::default()
        }
        .build()
        .is_err());
    }
}
