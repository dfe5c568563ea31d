//! Forecast accuracy metrics and model ranking.

use std::cmp::Ordering;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::pipeline::{ModelResult, SelectedModel};
use crate::{ForecastError, ModelKind, Result};

/// Test-period error metrics for one model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Metrics {
    pub mse: f64,
    pub rmse: f64,
    pub mae: f64,
    /// Mean absolute percentage error in percent, over non-zero actuals.
    /// `None` when every actual is zero.
    pub mape: Option<f64>,
    /// Periods left out of MAPE because the actual count was zero.
    pub mape_excluded: usize,
}

/// Exported metric row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub period_start: NaiveDate,
    #[serde(rename = "MSE")]
    pub mse: f64,
    #[serde(rename = "RMSE")]
    pub rmse: f64,
    #[serde(rename = "MAE")]
    pub mae: f64,
    #[serde(rename = "MAPE")]
    pub mape: Option<f64>,
    pub model_identifier: ModelKind,
}

/// Score predictions against actual counts.
pub fn evaluate(actual: &[f64], predicted: &[f64]) -> Result<Metrics> {
    if actual.is_empty() || actual.len() != predicted.len() {
        return Err(ForecastError::InsufficientData {
            required: actual.len().max(1),
            actual: predicted.len(),
        });
    }

    let n = actual.len() as f64;
    let errors: Vec<f64> = actual.iter().zip(predicted).map(|(a, p)| a - p).collect();
    let mse = errors.iter().map(|e| e * e).sum::<f64>() / n;
    let mae = errors.iter().map(|e| e.abs()).sum::<f64>() / n;

    let percentages: Vec<f64> = actual
        .iter()
        .zip(&errors)
        .filter(|(a, _)| **a != 0.0)
        .map(|(a, e)| (e / a).abs())
        .collect();
    let mape = if percentages.is_empty() {
        None
    } else {
        Some(100.0 * percentages.iter().sum::<f64>() / percentages.len() as f64)
    };

    Ok(Metrics {
        mse,
        rmse: mse.sqrt(),
        mae,
        mape,
        mape_excluded: actual.len() - percentages.len(),
    })
}

fn compare(a: &ModelResult, b: &ModelResult) -> Ordering {
    a.metrics
        .rmse
        .total_cmp(&b.metrics.rmse)
        .then(a.metrics.mae.total_cmp(&b.metrics.mae))
        .then(a.order.cmp(&b.order))
}

/// Indices of `results` from best to worst: RMSE, then MAE, then
/// declaration order.
pub fn rank(results: &[ModelResult]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..results.len()).collect();
    order.sort_by(|&a, &b| compare(&results[a], &results[b]));
    order
}

/// Pick the best-ranked result.
pub fn select_best(results: &[ModelResult]) -> Result<SelectedModel> {
    let best = results
        .iter()
        .min_by(|a, b| compare(a, b))
        .ok_or(ForecastError::NoTrainedModel)?;
    tracing::info!(
        model = %best.model,
        rmse = best.metrics.rmse,
        mae = best.metrics.mae,
        "selected best model"
    );
    Ok(SelectedModel::from_result(best.clone()))
}

/// Trailing error over a window of rows that have an actual value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RollingError {
    pub mae: Option<f64>,
    pub rmse: Option<f64>,
}

/// Rolling MAE and RMSE per row over the last `window` rows.
///
/// Rows without an actual are skipped inside each window; a window with no
/// actuals yields `None`.
pub fn rolling_errors(actual: &[Option<f64>], predicted: &[f64], window: usize) -> Vec<RollingError> {
    let window = window.max(1);
    let errors: Vec<Option<f64>> = actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| a.map(|a| (a - p).abs()))
        .collect();

    (0..errors.len())
        .map(|end| {
            let start = (end + 1).saturating_sub(window);
            let present: Vec<f64> = errors[start..=end].iter().flatten().copied().collect();
            if present.is_empty() {
                return RollingError {
                    mae: None,
                    rmse: None,
                };
            }
            let n = present.len() as f64;
            RollingError {
                mae: Some(present.iter().sum::<f64>() / n),
                rmse: Some((present.iter().map(|e| e * e).sum::<f64>() / n).sqrt()),
            }
        })
        .collect()
}
