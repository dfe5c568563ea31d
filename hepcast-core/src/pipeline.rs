//! End-to-end run: features, split, training, selection and forecast.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::evaluate::{evaluate, rank, select_best, MetricSample, Metrics};
use crate::features::build_feature_table;
use crate::forecast::{ForecastPoint, Forecaster};
use crate::models::{check_finite, FittedModel, ModelKind, Trainer};
use crate::split::{chronological_split, SplitSummary, TrainTestSplit};
use crate::{FeatureRow, ForecastError, PatientRecord, PipelineConfig, Result, CRATE_VERSION};

/// Audit metadata attached to every output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lineage {
    /// `<model>@<crate version>`.
    pub model_version: String,
    /// SHA-256 of the feature table the model saw.
    pub dataset_snapshot: String,
    /// SHA-256 of the serialized configuration.
    pub config_digest: String,
    pub trained_at: DateTime<Utc>,
}

/// Shared identifiers for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    pub dataset_snapshot: String,
    pub config_digest: String,
    pub trained_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(rows: &[FeatureRow], config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            dataset_snapshot: digest(rows)?,
            config_digest: digest(config)?,
            trained_at: Utc::now(),
        })
    }

    pub fn lineage(&self, model: ModelKind) -> Lineage {
        Lineage {
            model_version: format!("{model}@{CRATE_VERSION}"),
            dataset_snapshot: self.dataset_snapshot.clone(),
            config_digest: self.config_digest.clone(),
            trained_at: self.trained_at,
        }
    }

    /// Stable identifier for this data and configuration.
    pub fn job_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.dataset_snapshot.as_bytes());
        hasher.update(self.config_digest.as_bytes());
        let hash = hex::encode(hasher.finalize());
        format!("job-{}", &hash[..16])
    }
}

fn digest<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value).map_err(|err| ForecastError::Parse(err.to_string()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// One trained and scored model. Never modified after creation.
#[derive(Debug, Clone)]
pub struct ModelResult {
    pub model: ModelKind,
    /// Position in the configured candidate list.
    pub order: usize,
    pub artifact: Arc<dyn FittedModel>,
    pub test_periods: Vec<NaiveDate>,
    pub actuals: Vec<f64>,
    pub predictions: Vec<f64>,
    /// `actual - predicted` per test period.
    pub residuals: Vec<f64>,
    pub metrics: Metrics,
    pub lineage: Lineage,
}

impl ModelResult {
    pub fn metric_sample(&self) -> MetricSample {
        MetricSample {
            period_start: self.test_periods.first().copied().unwrap_or(NaiveDate::MIN),
            mse: self.metrics.mse,
            rmse: self.metrics.rmse,
            mae: self.metrics.mae,
            mape: self.metrics.mape,
            model_identifier: self.model,
        }
    }

    fn report(&self, rank: usize) -> ModelReport {
        ModelReport {
            model: self.model,
            rank,
            parameters: self.artifact.parameters(),
            metrics: self.metric_sample(),
            mape_excluded: self.metrics.mape_excluded,
            test_predictions: self
                .test_periods
                .iter()
                .zip(&self.actuals)
                .zip(&self.predictions)
                .map(|((&period, &actual), &predicted)| PredictionSample {
                    period,
                    actual,
                    predicted,
                })
                .collect(),
            lineage: self.lineage.clone(),
        }
    }
}

/// The evaluator's choice, handed explicitly to the forecaster.
#[derive(Debug, Clone)]
pub struct SelectedModel {
    pub result: ModelResult,
    /// Artifact used for forecasting; a refit replaces the test-time one.
    pub artifact: Arc<dyn FittedModel>,
    pub refit: bool,
}

impl SelectedModel {
    pub fn from_result(result: ModelResult) -> Self {
        Self {
            artifact: Arc::clone(&result.artifact),
            result,
            refit: false,
        }
    }

    pub fn with_artifact(self, artifact: Arc<dyn FittedModel>) -> Self {
        Self {
            artifact,
            refit: true,
            ..self
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictionSample {
    pub period: NaiveDate,
    pub actual: f64,
    pub predicted: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelReport {
    pub model: ModelKind,
    /// 1 is best.
    pub rank: usize,
    pub parameters: serde_json::Value,
    pub metrics: MetricSample,
    pub mape_excluded: usize,
    pub test_predictions: Vec<PredictionSample>,
    pub lineage: Lineage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingFailureReport {
    pub model: ModelKind,
    pub error: String,
}

/// Everything a run produces, ready for JSON export.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineReport {
    pub job_id: String,
    pub dataset_snapshot: String,
    pub trained_at: DateTime<Utc>,
    pub config: PipelineConfig,
    pub split: SplitSummary,
    pub models: Vec<ModelReport>,
    pub failures: Vec<TrainingFailureReport>,
    pub selected_model: ModelKind,
    /// Whether the forecast came from a model refit on every period.
    pub refit: bool,
    pub forecast: Vec<ForecastPoint>,
}

impl PipelineReport {
    pub fn metric_samples(&self) -> Vec<MetricSample> {
        self.models.iter().map(|m| m.metrics.clone()).collect()
    }
}

/// Successful results and isolated failures of one training round.
#[derive(Debug, Default)]
pub struct TrainingOutcome {
    pub results: Vec<ModelResult>,
    pub failures: Vec<TrainingFailureReport>,
}

/// Fit and score every trainer on the same split.
///
/// A failing trainer is logged and recorded; the others still run.
pub fn train_candidates(
    trainers: &[Box<dyn Trainer>],
    split: &TrainTestSplit,
    context: &RunContext,
) -> TrainingOutcome {
    #[cfg(feature = "parallel")]
    let outcomes: Vec<(ModelKind, Result<ModelResult>)> = trainers
        .par_iter()
        .enumerate()
        .map(|(order, trainer)| {
            let result = train_one(trainer.as_ref(), order, split, context);
            (trainer.kind(), result)
        })
        .collect();
    #[cfg(not(feature = "parallel"))]
    let outcomes: Vec<(ModelKind, Result<ModelResult>)> = trainers
        .iter()
        .enumerate()
        .map(|(order, trainer)| {
            let result = train_one(trainer.as_ref(), order, split, context);
            (trainer.kind(), result)
        })
        .collect();

    let mut outcome = TrainingOutcome::default();
    for (model, result) in outcomes {
        match result {
            Ok(result) => outcome.results.push(result),
            Err(err) => {
                tracing::warn!(%model, error = %err, "model training failed");
                outcome.failures.push(TrainingFailureReport {
                    model,
                    error: err.to_string(),
                });
            }
        }
    }
    outcome
}

fn train_one(
    trainer: &dyn Trainer,
    order: usize,
    split: &TrainTestSplit,
    context: &RunContext,
) -> Result<ModelResult> {
    let model = trainer.kind();
    let artifact = trainer.fit(&split.train)?;
    let predictions = artifact.predict(&split.test)?;
    check_finite(model, &predictions)?;

    let actuals = split.test_actuals();
    let metrics =
        evaluate(&actuals, &predictions).map_err(|err| ForecastError::training(model, err))?;
    let residuals = actuals.iter().zip(&predictions).map(|(a, p)| a - p).collect();

    tracing::debug!(%model, rmse = metrics.rmse, mae = metrics.mae, "model scored");
    Ok(ModelResult {
        model,
        order,
        artifact,
        test_periods: split.test.iter().map(|row| row.period).collect(),
        actuals,
        predictions,
        residuals,
        metrics,
        lineage: context.lineage(model),
    })
}

/// Run the whole pipeline on cleaned records.
pub fn run_pipeline(records: &[PatientRecord], config: &PipelineConfig) -> Result<PipelineReport> {
    config.validate()?;
    let trainers: Vec<Box<dyn Trainer>> = config
        .models
        .iter()
        .map(|kind| kind.trainer(config))
        .collect();
    run_with_trainers(records, config, &trainers)
}

/// Run the pipeline with caller-supplied trainers in place of `config.models`.
///
/// A trainer's position in `trainers` is its declaration order.
pub fn run_with_trainers(
    records: &[PatientRecord],
    config: &PipelineConfig,
    trainers: &[Box<dyn Trainer>],
) -> Result<PipelineReport> {
    config.validate()?;

    let mut rows = build_feature_table(records, &config.features)?;
    if let Some(window) = &config.training_window {
        rows.retain(|row| window.contains(row.period));
        tracing::info!(periods = rows.len(), "applied training window");
    }

    let split = chronological_split(&rows, config.train_ratio, config.min_periods)?;
    let summary = split.summary().ok_or(ForecastError::InsufficientData {
        required: config.min_periods,
        actual: rows.len(),
    })?;
    let context = RunContext::new(&rows, config)?;

    let outcome = train_candidates(trainers, &split, &context);
    tracing::info!(
        succeeded = outcome.results.len(),
        failed = outcome.failures.len(),
        "training finished"
    );

    let mut selected = select_best(&outcome.results)?;
    if config.refit_on_full_history {
        let trainer = &trainers[selected.result.order];
        match trainer.fit(&rows) {
            Ok(artifact) => selected = selected.with_artifact(artifact),
            Err(err) => tracing::warn!(
                model = %selected.result.model,
                error = %err,
                "refit on full history failed; forecasting with the train-only model"
            ),
        }
    }

    let selected_model = selected.result.model;
    let refit = selected.refit;
    let forecast = Forecaster::new(config.forecast_settings())
        .with_model(selected)
        .forecast(&rows, config.horizon)?;

    let ranking = rank(&outcome.results);
    let models: Vec<ModelReport> = ranking
        .iter()
        .enumerate()
        .map(|(position, &index)| outcome.results[index].report(position + 1))
        .collect();

    Ok(PipelineReport {
        job_id: context.job_id(),
        dataset_snapshot: context.dataset_snapshot,
        trained_at: context.trained_at,
        config: config.clone(),
        split: summary,
        models,
        failures: outcome.failures,
        selected_model,
        refit,
        forecast,
    })
}
