//! Elman recurrent network over a fixed lookback window of counts.

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{check_finite, missing_lags, FittedModel, ModelKind, Trainer};
use crate::{FeatureRow, ForecastError, Result};

/// Fewest complete windows the network trains on.
const MIN_SEQUENCES: usize = 8;
const GRAD_CLIP: f64 = 5.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecurrentConfig {
    /// Periods fed to the network per prediction.
    pub lookback: usize,
    pub hidden: usize,
    pub epochs: usize,
    pub learning_rate: f64,
}

impl Default for RecurrentConfig {
    fn default() -> Self {
        Self {
            lookback: 6,
            hidden: 8,
            epochs: 200,
            learning_rate: 0.01,
        }
    }
}

pub struct RecurrentTrainer {
    config: RecurrentConfig,
    seed: u64,
}

impl RecurrentTrainer {
    pub fn new(config: RecurrentConfig, seed: u64) -> Self {
        Self { config, seed }
    }
}

#[derive(Debug, Clone, Serialize)]
struct Weights {
    w_in: Vec<f64>,
    w_rec: Vec<Vec<f64>>,
    b_hidden: Vec<f64>,
    w_out: Vec<f64>,
    b_out: f64,
}

impl Weights {
    fn init(hidden: usize, rng: &mut ChaCha8Rng) -> Self {
        let scale = 1.0 / (hidden as f64).sqrt();
        let draw = |rng: &mut ChaCha8Rng| rng.gen_range(-scale..scale);
        Self {
            w_in: (0..hidden).map(|_| draw(rng)).collect(),
            w_rec: (0..hidden)
                .map(|_| (0..hidden).map(|_| draw(rng)).collect())
                .collect(),
            b_hidden: vec![0.0; hidden],
            w_out: (0..hidden).map(|_| draw(rng)).collect(),
            b_out: 0.0,
        }
    }

    fn zeros_like(&self) -> Self {
        let hidden = self.w_in.len();
        Self {
            w_in: vec![0.0; hidden],
            w_rec: vec![vec![0.0; hidden]; hidden],
            b_hidden: vec![0.0; hidden],
            w_out: vec![0.0; hidden],
            b_out: 0.0,
        }
    }

    /// Hidden states `h_0..h_L`, with `h_0 = 0`.
    fn forward(&self, sequence: &[f64]) -> Vec<Vec<f64>> {
        let hidden = self.w_in.len();
        let mut states = Vec::with_capacity(sequence.len() + 1);
        states.push(vec![0.0; hidden]);
        for &input in sequence {
            let prev = &states[states.len() - 1];
            let next: Vec<f64> = (0..hidden)
                .map(|i| {
                    let recurrent: f64 = self.w_rec[i].iter().zip(prev).map(|(w, h)| w * h).sum();
                    (self.w_in[i] * input + recurrent + self.b_hidden[i]).tanh()
                })
                .collect();
            states.push(next);
        }
        states
    }

    fn output(&self, last: &[f64]) -> f64 {
        self.w_out.iter().zip(last).map(|(w, h)| w * h).sum::<f64>() + self.b_out
    }

    /// Backpropagation through time for one window; returns the gradient.
    fn gradient(&self, sequence: &[f64], target: f64) -> Weights {
        let states = self.forward(sequence);
        let hidden = self.w_in.len();
        let last = &states[sequence.len()];
        let d_out = self.output(last) - target;

        let mut grad = self.zeros_like();
        grad.b_out = d_out;
        for i in 0..hidden {
            grad.w_out[i] = d_out * last[i];
        }

        let mut d_hidden: Vec<f64> = self.w_out.iter().map(|w| d_out * w).collect();
        for t in (1..=sequence.len()).rev() {
            let d_pre: Vec<f64> = (0..hidden)
                .map(|i| d_hidden[i] * (1.0 - states[t][i] * states[t][i]))
                .collect();
            for i in 0..hidden {
                grad.w_in[i] += d_pre[i] * sequence[t - 1];
                grad.b_hidden[i] += d_pre[i];
                for j in 0..hidden {
                    grad.w_rec[i][j] += d_pre[i] * states[t - 1][j];
                }
            }
            d_hidden = (0..hidden)
                .map(|j| (0..hidden).map(|i| self.w_rec[i][j] * d_pre[i]).sum())
                .collect();
        }
        grad
    }

    fn norm(&self) -> f64 {
        let sum: f64 = self.w_in.iter().map(|v| v * v).sum::<f64>()
            + self.w_rec.iter().flatten().map(|v| v * v).sum::<f64>()
            + self.b_hidden.iter().map(|v| v * v).sum::<f64>()
            + self.w_out.iter().map(|v| v * v).sum::<f64>()
            + self.b_out * self.b_out;
        sum.sqrt()
    }

    fn step(&mut self, grad: &Weights, rate: f64) {
        let norm = grad.norm();
        let scale = if norm > GRAD_CLIP { rate * GRAD_CLIP / norm } else { rate };
        for (w, g) in self.w_in.iter_mut().zip(&grad.w_in) {
            *w -= scale * g;
        }
        for (row, grow) in self.w_rec.iter_mut().zip(&grad.w_rec) {
            for (w, g) in row.iter_mut().zip(grow) {
                *w -= scale * g;
            }
        }
        for (w, g) in self.b_hidden.iter_mut().zip(&grad.b_hidden) {
            *w -= scale * g;
        }
        for (w, g) in self.w_out.iter_mut().zip(&grad.w_out) {
            *w -= scale * g;
        }
        self.b_out -= scale * grad.b_out;
    }
}

/// Trained network plus the scaling of its training counts.
#[derive(Debug, Clone)]
pub struct RecurrentNetwork {
    weights: Weights,
    lookback: usize,
    mean: f64,
    scale: f64,
    epochs: usize,
}

impl RecurrentNetwork {
    /// Oldest-first normalized window ending just before `row`.
    fn window(&self, row: &FeatureRow) -> Option<Vec<f64>> {
        let mut lags = row.lag_window(self.lookback)?;
        lags.reverse();
        Some(lags.iter().map(|v| (v - self.mean) / self.scale).collect())
    }
}

impl Trainer for RecurrentTrainer {
    fn kind(&self) -> ModelKind {
        ModelKind::Recurrent
    }

    /// Counted on the training slice, whether or not its first rows already
    /// carry a full lookback from earlier periods.
    fn min_history(&self) -> usize {
        self.config.lookback + MIN_SEQUENCES
    }

    fn fit(&self, train: &[FeatureRow]) -> Result<Arc<dyn FittedModel>> {
        let cfg = &self.config;
        if cfg.lookback == 0 || cfg.hidden == 0 || cfg.learning_rate <= 0.0 {
            return Err(ForecastError::InvalidConfig(
                "recurrent: lookback, hidden and learning_rate must be positive".to_string(),
            ));
        }

        let complete: Vec<&FeatureRow> = train
            .iter()
            .filter(|row| row.lag_window(cfg.lookback).is_some())
            .collect();
        if train.len() < self.min_history() || complete.len() < MIN_SEQUENCES {
            return Err(ForecastError::InsufficientHistory {
                model: self.kind().to_string(),
                required: self.min_history(),
                actual: train.len(),
            });
        }

        let counts: Vec<f64> = train.iter().map(|row| row.patient_count).collect();
        let mean = counts.iter().sum::<f64>() / counts.len() as f64;
        let variance =
            counts.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / counts.len() as f64;
        let scale = variance.sqrt().max(1.0);

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed ^ ModelKind::Recurrent as u64);
        let mut network = RecurrentNetwork {
            weights: Weights::init(cfg.hidden, &mut rng),
            lookback: cfg.lookback,
            mean,
            scale,
            epochs: cfg.epochs,
        };

        let samples: Vec<(Vec<f64>, f64)> = complete
            .iter()
            .filter_map(|row| {
                let window = network.window(row)?;
                Some((window, (row.patient_count - mean) / scale))
            })
            .collect();

        for _ in 0..cfg.epochs {
            for (window, target) in &samples {
                let grad = network.weights.gradient(window, *target);
                network.weights.step(&grad, cfg.learning_rate);
            }
        }

        let fitted = network.predict_rows(&complete)?;
        check_finite(self.kind(), &fitted)?;

        tracing::debug!(
            sequences = samples.len(),
            epochs = cfg.epochs,
            "fitted recurrent network"
        );
        Ok(Arc::new(network))
    }
}

impl RecurrentNetwork {
    fn predict_rows(&self, rows: &[&FeatureRow]) -> Result<Vec<f64>> {
        rows.iter()
            .map(|row| {
                let window = self
                    .window(row)
                    .ok_or_else(|| missing_lags(ModelKind::Recurrent, self.lookback, row))?;
                let states = self.weights.forward(&window);
                Ok(self.weights.output(&states[window.len()]) * self.scale + self.mean)
            })
            .collect()
    }
}

impl FittedModel for RecurrentNetwork {
    fn kind(&self) -> ModelKind {
        ModelKind::Recurrent
    }

    fn predict(&self, inputs: &[FeatureRow]) -> Result<Vec<f64>> {
        let rows: Vec<&FeatureRow> = inputs.iter().collect();
        self.predict_rows(&rows)
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "lookback": self.lookback,
            "hidden": self.weights.w_in.len(),
            "epochs": self.epochs,
            "count_mean": self.mean,
            "count_scale": self.scale,
            "weights": self.weights,
        })
    }
}
