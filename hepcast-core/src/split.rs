//! Chronological train/test partition.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{FeatureRow, ForecastError, Result};

/// Earliest rows for training, the remainder for testing. Order is kept.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainTestSplit {
    pub train: Vec<FeatureRow>,
    pub test: Vec<FeatureRow>,
}

/// Period boundaries of a split, for reports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SplitSummary {
    pub train_periods: usize,
    pub test_periods: usize,
    pub train_start: NaiveDate,
    pub train_end: NaiveDate,
    pub test_start: NaiveDate,
    pub test_end: NaiveDate,
}

impl TrainTestSplit {
    pub fn summary(&self) -> Option<SplitSummary> {
        Some(SplitSummary {
            train_periods: self.train.len(),
            test_periods: self.test.len(),
            train_start: self.train.first()?.period,
            train_end: self.train.last()?.period,
            test_start: self.test.first()?.period,
            test_end: self.test.last()?.period,
        })
    }

    pub fn test_actuals(&self) -> Vec<f64> {
        self.test.iter().map(|row| row.patient_count).collect()
    }
}

/// Number of training rows for `n` periods: `ceil(ratio * n)`.
pub fn train_len(n: usize, ratio: f64) -> usize {
    // The epsilon keeps exact products such as 0.8 * 10 from rounding up.
    ((ratio * n as f64) - 1e-9).ceil().max(0.0) as usize
}

/// Split `rows` into the earliest `ceil(ratio * n)` periods and the rest.
///
/// Fails when fewer than `min_periods` rows are given or when the test side
/// would be empty.
pub fn chronological_split(
    rows: &[FeatureRow],
    ratio: f64,
    min_periods: usize,
) -> Result<TrainTestSplit> {
    let n = rows.len();
    if n < min_periods {
        return Err(ForecastError::InsufficientData {
            required: min_periods,
            actual: n,
        });
    }

    let cut = train_len(n, ratio);
    if cut == 0 || cut >= n {
        return Err(ForecastError::InsufficientData {
            required: n + 1,
            actual: n,
        });
    }

    tracing::debug!(train = cut, test = n - cut, "chronological split");
    Ok(TrainTestSplit {
        train: rows[..cut].to_vec(),
        test: rows[cut..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_training_share_up() {
        assert_eq!(train_len(96, 0.8), 77);
        assert_eq!(train_len(10, 0.8), 8);
        assert_eq!(train_len(12, 0.8), 10);
        assert_eq!(train_len(13, 0.5), 7);
    }
}
