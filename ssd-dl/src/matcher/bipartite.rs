use super::{empty_match, Match, Matcher, UNMATCHED};
use crate::common::*;

/// Greedy one-to-one matching.
///
/// Repeatedly pairs the unused row and column with the highest remaining
/// similarity. Pairs with non-positive similarity are never matched.
#[derive(Debug, Clone, Default)]
pub struct BipartiteMatcher;

impl Matcher for BipartiteMatcher {
    fn match_columns(&self, similarity: &Tensor) -> Result<Match> {
        let (num_rows, num_columns) = similarity.size2()?;
        let device = similarity.device();

        if num_rows == 0 {
            return empty_match(num_columns, device);
        }

        let values = Vec::<f32>::from(
            &similarity
                .detach()
                .to_kind(Kind::Float)
                .to_device(Device::Cpu)
                .view([-1]),
        );
        let num_rows = num_rows as usize;
        let num_columns = num_columns as usize;

        let mut row_used = vec![false; num_rows];
        let mut matches = vec![UNMATCHED; num_columns];

        for _ in 0..num_rows.min(num_columns) {
            let best = (0..num_rows)
                .filter(|&row| !row_used[row])
                .flat_map(|row| {
                    (0..num_columns)
                        .filter(|&col| matches[col] == UNMATCHED)
                        .map(move |col| (row, col))
                })
                .map(|(row, col)| (row, col, values[row * num_columns + col]))
                .filter(|&(_, _, value)| value > 0.0)
                // first pair wins on ties
                .fold(None, |best: Option<(usize, usize, f32)>, candidate| match best {
                    Some(best) if best.2 >= candidate.2 => Some(best),
                    _ => Some(candidate),
                });

            let (row, col, _) = match best {
                Some(best) => best,
                None => break,
            };
            row_used[row] = true;
            matches[col] = row as i64;
        }

        Match::new(Tensor::of_slice(&matches).to_device(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greedy_matching() {
        let similarity = Tensor::of_slice(&[0.50f32, 0.1, 0.8, 0.15, 0.2, 0.35]).view([2, 3]);
        let matches = BipartiteMatcher.match_columns(&similarity).unwrap();
        assert_eq!(Vec::<i64>::from(matches.match_results()), vec![-1, 1, 0]);
    }

    #[test]
    fn more_rows_than_columns() {
        let similarity = Tensor::of_slice(&[0.9f32, 0.8, 0.7]).view([3, 1]);
        let matches = BipartiteMatcher.match_columns(&similarity).unwrap();
        assert_eq!(Vec::<i64>::from(matches.match_results()), vec![0]);
    }

    #[test]
    fn zero_similarity_is_not_matched() {
        let similarity = Tensor::zeros(&[2, 2], (Kind::Float, Device::Cpu));
        let matches = BipartiteMatcher.match_columns(&similarity).unwrap();
        assert_eq!(Vec::<i64>::from(matches.match_results()), vec![-1, -1]);
    }
}
