//! Receivers of training summaries.

use crate::common::*;

/// Receives scalar and distribution summaries emitted during loss
/// computation.
pub trait SummaryObserver: Send + Sync {
    fn scalar(&self, tag: &str, value: f64);

    /// A distribution given as values sorted in ascending order.
    fn cdf(&self, tag: &str, sorted_values: &[f32]);
}

/// Writes summaries to the log at info level.
#[derive(Debug, Clone, Default)]
pub struct LogObserver;

impl SummaryObserver for LogObserver {
    fn scalar(&self, tag: &str, value: f64) {
        info!("{}: {}", tag, value);
    }

    fn cdf(&self, tag: &str, sorted_values: &[f32]) {
        if sorted_values.is_empty() {
            info!("{}: empty", tag);
            return;
        }
        let quantile = |q: f64| {
            let index = ((sorted_values.len() - 1) as f64 * q).round() as usize;
            sorted_values[index]
        };
        info!(
            "{}: count={} p10={} p50={} p90={} max={}",
            tag,
            sorted_values.len(),
            quantile(0.1),
            quantile(0.5),
            quantile(0.9),
            quantile(1.0)
        );
    }
}

/// A summary kept by [MemoryObserver].
#[derive(Debug, Clone, PartialEq)]
pub enum Summary {
    Scalar(f64),
    Cdf(Vec<f32>),
}

/// Keeps every summary in memory until taken.
#[derive(Debug, Default)]
pub struct MemoryObserver {
    summaries: Mutex<Vec<(String, Summary)>>,
}

impl MemoryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the recorded summaries in emission order.
    pub fn take(&self) -> Vec<(String, Summary)> {
        let mut summaries = self
            .summaries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *summaries)
    }

    fn push(&self, tag: &str, summary: Summary) {
        self.summaries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((tag.to_string(), summary));
    }
}

impl SummaryObserver for MemoryObserver {
    fn scalar(&self, tag: &str, value: f64) {
        self.push(tag, Summary::Scalar(value));
    }

    fn cdf(&self, tag: &str, sorted_values: &[f32]) {
        self.push(tag, Summary::Cdf(sorted_values.to_vec()));
    }
}

/// Emit the distribution of the values of a 1D tensor.
pub fn summarize_cdf(observer: &dyn SummaryObserver, tag: &str, values: &Tensor) {
    let mut values = Vec::<f32>::from(
        &values
            .detach()
            .to_kind(Kind::Float)
            .to_device(Device::Cpu)
            .view([-1]),
    );
    values.sort_by(|lhs, rhs| lhs.partial_cmp(rhs).unwrap_or(Ordering::Equal));
    observer.cdf(tag, &values);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_observer_records_in_order() {
        let observer = MemoryObserver::new();
        observer.scalar("a", 1.0);
        summarize_cdf(&observer, "b", &Tensor::of_slice(&[3f32, 1.0, 2.0]));

        let summaries = observer.take();
        assert_eq!(
            summaries,
            vec![
                ("a".to_string(), Summary::Scalar(1.0)),
                ("b".to_string(), Summary::Cdf(vec![1.0, 2.0, 3.0])),
            ]
        );
        assert!(observer.take().is_empty());
    }
}
