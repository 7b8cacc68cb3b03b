//! Reduction of sample series.

use average::Variance;
use serde::Serialize;

/// Count, mean and population standard deviation of a sample series.
///
/// The mean and standard deviation of an empty series are undefined and are
/// `None` here. Renderers decide how to present that.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    /// Number of samples
    pub count: u64,
    /// Arithmetic mean
    pub mean: Option<f64>,
    /// Population standard deviation
    pub std_dev: Option<f64>,
}

impl Summary {
    /// Summarize `samples`.
    #[must_use]
    pub fn of(samples: &[u64]) -> Self {
        if samples.is_empty() {
            return Self {
                count: 0,
                mean: None,
                std_dev: None,
            };
        }
        let variance: Variance = samples.iter().map(|s| *s as f64).collect();
        Self {
            count: samples.len() as u64,
            mean: Some(variance.mean()),
            std_dev: Some(variance.population_variance().sqrt()),
        }
    }
}
