//! Model trainers behind one fit/predict interface.
//!
//! Each [`ModelKind`] builds a [`Trainer`]; fitting returns an immutable
//! [`FittedModel`] shared by reference. The evaluator and forecaster only
//! ever see the traits.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{FeatureRow, ForecastError, PipelineConfig, Result};

mod boosting;
mod linear;
mod recurrent;
mod tree;

pub use boosting::{BoostingConfig, BoostedTrees, BoostingTrainer};
pub use linear::{LinearConfig, LinearTrend, LinearTrainer};
pub use recurrent::{RecurrentConfig, RecurrentNetwork, RecurrentTrainer};
pub use tree::{GainParams, GrowthStrategy, SplitFinding};

/// Fits a model on chronologically ordered training rows.
pub trait Trainer: Send + Sync {
    fn kind(&self) -> ModelKind;

    /// Fewest training periods this trainer accepts.
    fn min_history(&self) -> usize;

    fn fit(&self, train: &[FeatureRow]) -> Result<Arc<dyn FittedModel>>;
}

/// A trained, read-only model.
pub trait FittedModel: Send + Sync + fmt::Debug {
    fn kind(&self) -> ModelKind;

    /// Predict the patient count for each input row.
    fn predict(&self, inputs: &[FeatureRow]) -> Result<Vec<f64>>;

    /// Fitted parameters for reports.
    fn parameters(&self) -> serde_json::Value;
}

/// Tag for each supported model family.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    LinearTrend,
    GradientBoosting,
    LeafwiseBoosting,
    Recurrent,
}

impl ModelKind {
    pub const ALL: [ModelKind; 4] = [
        ModelKind::LinearTrend,
        ModelKind::GradientBoosting,
        ModelKind::LeafwiseBoosting,
        ModelKind::Recurrent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::LinearTrend => "linear_trend",
            ModelKind::GradientBoosting => "gradient_boosting",
            ModelKind::LeafwiseBoosting => "leafwise_boosting",
            ModelKind::Recurrent => "recurrent",
        }
    }

    /// Trainer configured from the matching section of `config`.
    pub fn trainer(&self, config: &PipelineConfig) -> Box<dyn Trainer> {
        match self {
            ModelKind::LinearTrend => Box::new(LinearTrainer::new(config.linear.clone())),
            ModelKind::GradientBoosting => Box::new(BoostingTrainer::new(
                *self,
                config.gradient_boosting.clone(),
                config.seed,
            )),
            ModelKind::LeafwiseBoosting => Box::new(BoostingTrainer::new(
                *self,
                config.leafwise_boosting.clone(),
                config.seed,
            )),
            ModelKind::Recurrent => {
                Box::new(RecurrentTrainer::new(config.recurrent.clone(), config.seed))
            }
        }
    }

    /// Count lags this model reads from each row.
    pub fn lags_needed(&self, config: &PipelineConfig) -> usize {
        match self {
            ModelKind::LinearTrend => 0,
            ModelKind::GradientBoosting => config.gradient_boosting.lags,
            ModelKind::LeafwiseBoosting => config.leafwise_boosting.lags,
            ModelKind::Recurrent => config.recurrent.lookback,
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Tree-model input vector: trend, calendar, covariates, lags, rolling mean.
pub(crate) fn tabular_inputs(row: &FeatureRow, lags: usize) -> Option<Vec<f64>> {
    let mut x = Vec::with_capacity(4 + crate::Covariates::LEN + lags + 1);
    x.push(row.index as f64);
    x.push(row.calendar.month_sin);
    x.push(row.calendar.month_cos);
    x.push(row.calendar.quarter as f64);
    x.extend(row.covariates.as_array());
    x.extend(row.lag_window(lags)?);
    if lags > 0 {
        x.push(row.rolling_mean?);
    }
    Some(x)
}

/// Keep rows whose inputs are complete, paired with their targets.
pub(crate) fn usable_rows(
    rows: &[FeatureRow],
    inputs: impl Fn(&FeatureRow) -> Option<Vec<f64>>,
) -> (Vec<Vec<f64>>, Vec<f64>) {
    rows.iter()
        .filter_map(|row| inputs(row).map(|x| (x, row.patient_count)))
        .unzip()
}

pub(crate) fn missing_lags(model: ModelKind, required: usize, row: &FeatureRow) -> ForecastError {
    let available = row.lags.iter().take_while(|lag| lag.is_some()).count();
    ForecastError::InsufficientHistory {
        model: model.to_string(),
        required,
        actual: available,
    }
}

pub(crate) fn check_finite(model: ModelKind, values: &[f64]) -> Result<()> {
    match values.iter().position(|v| !v.is_finite()) {
        Some(at) => Err(ForecastError::training(
            model,
            format!("non-finite value at position {at}"),
        )),
        None => Ok(()),
    }
}
