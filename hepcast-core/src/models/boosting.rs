//! Gradient-boosted regression trees on squared error.
//!
//! Both boosting models share this trainer; they differ in growth strategy
//! and split search.

use std::sync::Arc;

use rand::seq::index::sample;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::tree::{grow_tree, GainParams, GrowthStrategy, RegressionTree, SplitCandidates, SplitFinding};
use super::{check_finite, missing_lags, tabular_inputs, usable_rows, FittedModel, ModelKind, Trainer};
use crate::{FeatureRow, ForecastError, Result};

/// Fewest complete training rows a booster accepts.
const MIN_BOOSTING_ROWS: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BoostingConfig {
    pub n_rounds: usize,
    pub learning_rate: f64,
    /// Count lags used as inputs.
    pub lags: usize,
    /// Share of rows sampled per round, without replacement.
    pub subsample: f64,
    pub growth: GrowthStrategy,
    pub split_finding: SplitFinding,
    pub gain: GainParams,
}

impl BoostingConfig {
    /// Level-wise trees with exact split search.
    pub fn depth_wise() -> Self {
        Self {
            n_rounds: 200,
            learning_rate: 0.05,
            lags: 3,
            subsample: 0.8,
            growth: GrowthStrategy::DepthWise { max_depth: 3 },
            split_finding: SplitFinding::Exact,
            gain: GainParams::default(),
        }
    }

    /// Best-first trees with histogram split search.
    pub fn leaf_wise() -> Self {
        Self {
            n_rounds: 200,
            learning_rate: 0.05,
            lags: 3,
            subsample: 1.0,
            growth: GrowthStrategy::LeafWise { max_leaves: 8 },
            split_finding: SplitFinding::Histogram { max_bins: 32 },
            gain: GainParams::default(),
        }
    }
}

impl Default for BoostingConfig {
    fn default() -> Self {
        Self::depth_wise()
    }
}

pub struct BoostingTrainer {
    kind: ModelKind,
    config: BoostingConfig,
    seed: u64,
}

impl BoostingTrainer {
    pub fn new(kind: ModelKind, config: BoostingConfig, seed: u64) -> Self {
        Self { kind, config, seed }
    }
}

#[derive(Debug, Clone)]
pub struct BoostedTrees {
    kind: ModelKind,
    lags: usize,
    base_score: f64,
    trees: Vec<RegressionTree>,
    train_rmse: f64,
}

impl Trainer for BoostingTrainer {
    fn kind(&self) -> ModelKind {
        self.kind
    }

    /// Lagged rows need `lags` earlier periods before the first usable one.
    /// Enforced on the training slice itself, even when its first rows carry
    /// lags from periods before it.
    fn min_history(&self) -> usize {
        self.config.lags + MIN_BOOSTING_ROWS
    }

    fn fit(&self, train: &[FeatureRow]) -> Result<Arc<dyn FittedModel>> {
        let cfg = &self.config;
        if !(cfg.subsample > 0.0 && cfg.subsample <= 1.0) || cfg.learning_rate <= 0.0 {
            return Err(ForecastError::InvalidConfig(format!(
                "{}: subsample must be in (0, 1] and learning_rate positive",
                self.kind
            )));
        }

        let (x, y) = usable_rows(train, |row| tabular_inputs(row, cfg.lags));
        if train.len() < self.min_history() || x.len() < MIN_BOOSTING_ROWS {
            return Err(ForecastError::InsufficientHistory {
                model: self.kind.to_string(),
                required: self.min_history(),
                actual: train.len(),
            });
        }

        let n = y.len();
        let base_score = y.iter().sum::<f64>() / n as f64;
        let mut predictions = vec![base_score; n];
        let hess = vec![1.0; n];
        let candidates = SplitCandidates::new(&x, cfg.split_finding);
        let sample_size = ((n as f64 * cfg.subsample).round() as usize).clamp(1, n);
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed ^ self.kind as u64);
        let mut trees = Vec::with_capacity(cfg.n_rounds);

        for _ in 0..cfg.n_rounds {
            let grad: Vec<f64> = predictions.iter().zip(&y).map(|(p, t)| p - t).collect();
            let mut rows: Vec<usize> = if sample_size == n {
                (0..n).collect()
            } else {
                sample(&mut rng, n, sample_size).into_vec()
            };
            rows.sort_unstable();

            let tree = grow_tree(
                &x,
                &grad,
                &hess,
                rows,
                &candidates,
                &cfg.gain,
                cfg.growth,
                cfg.learning_rate,
            );
            for (p, row) in predictions.iter_mut().zip(&x) {
                *p += tree.predict(row);
            }
            trees.push(tree);
        }

        check_finite(self.kind, &predictions)?;
        let train_rmse = (predictions
            .iter()
            .zip(&y)
            .map(|(p, t)| (p - t).powi(2))
            .sum::<f64>()
            / n as f64)
            .sqrt();

        tracing::debug!(
            model = %self.kind,
            rows = n,
            trees = trees.len(),
            train_rmse,
            "fitted boosted trees"
        );
        Ok(Arc::new(BoostedTrees {
            kind: self.kind,
            lags: cfg.lags,
            base_score,
            trees,
            train_rmse,
        }))
    }
}

impl FittedModel for BoostedTrees {
    fn kind(&self) -> ModelKind {
        self.kind
    }

    fn predict(&self, inputs: &[FeatureRow]) -> Result<Vec<f64>> {
        inputs
            .iter()
            .map(|row| {
                let x = tabular_inputs(row, self.lags)
                    .ok_or_else(|| missing_lags(self.kind, self.lags, row))?;
                Ok(self.base_score + self.trees.iter().map(|t| t.predict(&x)).sum::<f64>())
            })
            .collect()
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "base_score": self.base_score,
            "trees": self.trees.len(),
            "leaves": self.trees.iter().map(RegressionTree::n_leaves).sum::<usize>(),
            "lags": self.lags,
            "train_rmse": self.train_rmse,
        })
    }
}
