//! Ordinary least squares on a trend plus one seasonal harmonic.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{check_finite, FittedModel, ModelKind, Trainer};
use crate::{FeatureRow, ForecastError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LinearConfig {
    /// Include the sine/cosine month terms.
    pub seasonal: bool,
}

impl Default for LinearConfig {
    fn default() -> Self {
        Self { seasonal: true }
    }
}

pub struct LinearTrainer {
    config: LinearConfig,
}

impl LinearTrainer {
    pub fn new(config: LinearConfig) -> Self {
        Self { config }
    }

    fn n_params(&self) -> usize {
        if self.config.seasonal {
            4
        } else {
            2
        }
    }
}

/// `count = b0 + b1 * index (+ b2 * sin + b3 * cos)`.
#[derive(Debug, Clone)]
pub struct LinearTrend {
    coefficients: Vec<f64>,
    seasonal: bool,
}

fn design(row: &FeatureRow, seasonal: bool) -> Vec<f64> {
    let mut x = vec![1.0, row.index as f64];
    if seasonal {
        x.push(row.calendar.month_sin);
        x.push(row.calendar.month_cos);
    }
    x
}

impl Trainer for LinearTrainer {
    fn kind(&self) -> ModelKind {
        ModelKind::LinearTrend
    }

    fn min_history(&self) -> usize {
        self.n_params()
    }

    fn fit(&self, train: &[FeatureRow]) -> Result<Arc<dyn FittedModel>> {
        if train.len() < self.min_history() {
            return Err(ForecastError::InsufficientHistory {
                model: self.kind().to_string(),
                required: self.min_history(),
                actual: train.len(),
            });
        }

        let p = self.n_params();
        let mut xtx = vec![vec![0.0; p]; p];
        let mut xty = vec![0.0; p];
        for row in train {
            let x = design(row, self.config.seasonal);
            for i in 0..p {
                xty[i] += x[i] * row.patient_count;
                for j in 0..p {
                    xtx[i][j] += x[i] * x[j];
                }
            }
        }

        let coefficients = solve(xtx, xty)
            .ok_or_else(|| ForecastError::training(self.kind(), "normal equations are singular"))?;
        check_finite(self.kind(), &coefficients)?;

        tracing::debug!(?coefficients, "fitted linear trend");
        Ok(Arc::new(LinearTrend {
            coefficients,
            seasonal: self.config.seasonal,
        }))
    }
}

impl FittedModel for LinearTrend {
    fn kind(&self) -> ModelKind {
        ModelKind::LinearTrend
    }

    fn predict(&self, inputs: &[FeatureRow]) -> Result<Vec<f64>> {
        Ok(inputs
            .iter()
            .map(|row| {
                design(row, self.seasonal)
                    .iter()
                    .zip(&self.coefficients)
                    .map(|(x, b)| x * b)
                    .sum()
            })
            .collect())
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "intercept": self.coefficients[0],
            "slope": self.coefficients[1],
            "seasonal": self.coefficients.get(2..).map(<[f64]>::to_vec).unwrap_or_default(),
        })
    }
}

/// Gaussian elimination with partial pivoting. `None` when singular.
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Some(x)
}
