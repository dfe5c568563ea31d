//! Recursive multi-step forecasting with residual-based intervals.

use std::collections::VecDeque;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::pipeline::SelectedModel;
use crate::{FeatureRow, ForecastError, Result};

const Z_80: f64 = 1.2815515655446004;
const Z_95: f64 = 1.959963984540054;

/// Longest accepted horizon: one hundred years of months.
pub const MAX_HORIZON_MONTHS: usize = 1200;

/// One forecast month with nested prediction intervals.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ForecastPoint {
    pub date: NaiveDate,
    pub predicted_median: f64,
    pub pi80_low: f64,
    pub pi80_high: f64,
    pub pi95_low: f64,
    pub pi95_high: f64,
}

impl ForecastPoint {
    pub fn width_80(&self) -> f64 {
        self.pi80_high - self.pi80_low
    }

    pub fn width_95(&self) -> f64 {
        self.pi95_high - self.pi95_low
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ForecastSettings {
    /// Floor on the residual scale, in cases.
    pub min_sigma: f64,
    pub rolling_window: usize,
}

impl Default for ForecastSettings {
    fn default() -> Self {
        Self {
            min_sigma: 0.5,
            rolling_window: 3,
        }
    }
}

/// Projects the selected model forward.
#[derive(Debug, Clone, Default)]
pub struct Forecaster {
    settings: ForecastSettings,
    selected: Option<SelectedModel>,
}

impl Forecaster {
    pub fn new(settings: ForecastSettings) -> Self {
        Self {
            settings,
            selected: None,
        }
    }

    pub fn with_model(mut self, selected: SelectedModel) -> Self {
        self.selected = Some(selected);
        self
    }

    /// Residual scale used for the intervals.
    pub fn sigma(&self) -> Result<f64> {
        let selected = self.selected.as_ref().ok_or(ForecastError::NoTrainedModel)?;
        let rmse = selected.result.metrics.rmse;
        Ok(if rmse.is_finite() {
            rmse.max(self.settings.min_sigma)
        } else {
            self.settings.min_sigma
        })
    }

    /// Forecast `horizon` months after the last row of `history`.
    ///
    /// Each step predicts from a row built out of the rolling count buffer,
    /// then pushes its own prediction into the buffer. Interval half-widths
    /// are `z * sigma * sqrt(step)`.
    pub fn forecast(&self, history: &[FeatureRow], horizon: usize) -> Result<Vec<ForecastPoint>> {
        let selected = self.selected.as_ref().ok_or(ForecastError::NoTrainedModel)?;
        if horizon > MAX_HORIZON_MONTHS {
            return Err(ForecastError::InvalidConfig(format!(
                "horizon tối đa {MAX_HORIZON_MONTHS} tháng, nhận được {horizon}"
            )));
        }
        let sigma = self.sigma()?;
        let Some(last) = history.last() else {
            return Err(ForecastError::InsufficientData {
                required: 1,
                actual: 0,
            });
        };

        let capacity = last.lags.len().max(self.settings.rolling_window).max(1);
        let mut buffer: VecDeque<f64> = history
            .iter()
            .rev()
            .take(capacity)
            .rev()
            .map(|row| row.patient_count)
            .collect();

        let mut previous = last.clone();
        let mut points = Vec::with_capacity(horizon);
        for step in 1..=horizon {
            let mut next = previous.successor(&buffer, self.settings.rolling_window);
            let prediction = selected
                .artifact
                .predict(std::slice::from_ref(&next))?
                .first()
                .copied()
                .ok_or_else(|| {
                    ForecastError::training(selected.result.model, "empty prediction")
                })?;
            if !prediction.is_finite() {
                return Err(ForecastError::training(
                    selected.result.model,
                    format!("non-finite forecast at {}", next.period),
                ));
            }

            let spread = sigma * (step as f64).sqrt();
            points.push(ForecastPoint {
                date: next.period,
                predicted_median: prediction,
                pi80_low: prediction - Z_80 * spread,
                pi80_high: prediction + Z_80 * spread,
                pi95_low: prediction - Z_95 * spread,
                pi95_high: prediction + Z_95 * spread,
            });

            buffer.push_back(prediction);
            if buffer.len() > capacity {
                buffer.pop_front();
            }
            next.patient_count = prediction;
            previous = next;
        }

        tracing::info!(
            model = %selected.result.model,
            horizon,
            sigma,
            "forecast generated"
        );
        Ok(points)
    }
}
