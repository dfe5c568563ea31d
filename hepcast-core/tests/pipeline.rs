use std::sync::Arc;

use chrono::{Days, Months, NaiveDate};
use hepcast_core::pipeline::{train_candidates, RunContext};
use hepcast_core::{
    build_feature_table, chronological_split, run_pipeline, run_with_trainers, select_best,
    FeatureConfig, FeatureRow, FittedModel, ForecastError, ForecastSettings, Forecaster, Gender,
    ModelKind, PatientRecord, PipelineConfig, Trainer, TrainingWindow, MAX_HORIZON_MONTHS,
};

fn start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2015, 1, 1).unwrap()
}

/// `counts[m]` registrations in month `m`, spread over the month.
fn cohort(counts: &[usize]) -> Vec<PatientRecord> {
    let mut records = Vec::new();
    for (month, &count) in counts.iter().enumerate() {
        let first = start().checked_add_months(Months::new(month as u32)).unwrap();
        for i in 0..count {
            records.push(PatientRecord {
                patient_hash: format!("sha256:{month:04}{i:04}"),
                registration_date: first.checked_add_days(Days::new((i % 28) as u64)).unwrap(),
                age: 25.0 + (i % 40) as f64,
                gender: if i % 2 == 0 { Gender::Male } else { Gender::Female },
                viral_load: 500.0 + 10.0 * i as f64,
                alt_level: 30.0 + (month % 7) as f64,
                follow_up_months: 6.0,
                lost_to_follow_up: i % 9 == 0,
            });
        }
    }
    records
}

fn seasonal_counts(months: usize) -> Vec<usize> {
    (0..months)
        .map(|m| {
            let angle = 2.0 * std::f64::consts::PI * (m % 12) as f64 / 12.0;
            (30.0 + 0.4 * m as f64 + 8.0 * angle.sin()).round() as usize
        })
        .collect()
}

#[test]
fn ninety_six_periods_split_into_77_and_19() {
    let rows = build_feature_table(&cohort(&[3; 96]), &FeatureConfig::default()).unwrap();
    assert_eq!(rows.len(), 96);

    let split = chronological_split(&rows, 0.8, 12).unwrap();
    assert_eq!(split.train.len(), 77);
    assert_eq!(split.test.len(), 19);
    let last_train = split.train.last().unwrap().period;
    assert!(split.test.iter().all(|row| row.period > last_train));
}

#[test]
fn linear_growth_is_recovered_exactly() {
    let counts: Vec<usize> = (0..48).map(|t| 60 + 5 * t).collect();
    let config = PipelineConfig {
        models: vec![ModelKind::LinearTrend],
        horizon: 12,
        ..PipelineConfig::default()
    };
    let report = run_pipeline(&cohort(&counts), &config).unwrap();

    let linear = &report.models[0];
    assert_eq!(linear.model, ModelKind::LinearTrend);
    assert!(linear.metrics.rmse < 1e-6, "rmse {}", linear.metrics.rmse);
    assert!(report.refit);

    for (step, point) in report.forecast.iter().enumerate() {
        let expected = 60.0 + 5.0 * (48 + step) as f64;
        assert!((point.predicted_median - expected).abs() < 1e-5);
    }
}

#[test]
fn five_year_forecast_has_widening_nested_intervals() {
    let report = run_pipeline(&cohort(&seasonal_counts(72)), &PipelineConfig::default()).unwrap();
    assert_eq!(report.forecast.len(), 60);
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(report.models.len(), 4);

    let first = report.forecast[0].date;
    assert_eq!(first, start().checked_add_months(Months::new(72)).unwrap());

    for pair in report.forecast.windows(2) {
        assert!(pair[1].width_80() >= pair[0].width_80());
        assert!(pair[1].width_95() >= pair[0].width_95());
        assert!(pair[1].date > pair[0].date);
    }
    for point in &report.forecast {
        assert!(point.pi95_low < point.pi80_low);
        assert!(point.pi80_low < point.predicted_median);
        assert!(point.predicted_median < point.pi80_high);
        assert!(point.pi80_high < point.pi95_high);
    }
}

#[test]
fn ranking_orders_models_by_rmse() {
    let report = run_pipeline(&cohort(&seasonal_counts(60)), &PipelineConfig::default()).unwrap();
    let ranks: Vec<usize> = report.models.iter().map(|m| m.rank).collect();
    assert_eq!(ranks, vec![1, 2, 3, 4]);
    for pair in report.models.windows(2) {
        assert!(pair[0].metrics.rmse <= pair[1].metrics.rmse);
    }
    assert_eq!(report.selected_model, report.models[0].model);
    assert_eq!(report.metric_samples().len(), 4);
}

#[test]
fn repeated_runs_are_identical() {
    let records = cohort(&seasonal_counts(60));
    let config = PipelineConfig::default();
    let a = run_pipeline(&records, &config).unwrap();
    let b = run_pipeline(&records, &config).unwrap();

    assert_eq!(a.job_id, b.job_id);
    assert_eq!(a.dataset_snapshot, b.dataset_snapshot);
    assert_eq!(a.forecast, b.forecast);
    assert_eq!(a.selected_model, b.selected_model);
    for (x, y) in a.models.iter().zip(&b.models) {
        assert_eq!(x.metrics, y.metrics);
        assert_eq!(x.parameters, y.parameters);
        assert_eq!(x.test_predictions, y.test_predictions);
    }
}

#[test]
fn lineage_is_attached_to_every_model() {
    let report = run_pipeline(&cohort(&seasonal_counts(48)), &PipelineConfig::default()).unwrap();
    assert!(report.job_id.starts_with("job-"));
    assert_eq!(report.job_id.len(), "job-".len() + 16);
    for model in &report.models {
        assert_eq!(model.lineage.dataset_snapshot, report.dataset_snapshot);
        assert_eq!(model.lineage.trained_at, report.trained_at);
        assert_eq!(
            model.lineage.model_version,
            format!("{}@{}", model.model, hepcast_core::CRATE_VERSION)
        );
    }
}

struct FailingTrainer;

impl Trainer for FailingTrainer {
    fn kind(&self) -> ModelKind {
        ModelKind::Recurrent
    }

    fn min_history(&self) -> usize {
        1
    }

    fn fit(&self, _train: &[FeatureRow]) -> hepcast_core::Result<Arc<dyn FittedModel>> {
        Err(ForecastError::training(self.kind(), "diverged"))
    }
}

#[test]
fn a_failing_trainer_does_not_stop_the_others() {
    let config = PipelineConfig::default();
    let rows = build_feature_table(&cohort(&seasonal_counts(36)), &config.features).unwrap();
    let split = chronological_split(&rows, config.train_ratio, config.min_periods).unwrap();
    let context = RunContext::new(&rows, &config).unwrap();

    let trainers: Vec<Box<dyn Trainer>> = vec![
        Box::new(FailingTrainer),
        ModelKind::LinearTrend.trainer(&config),
    ];
    let outcome = train_candidates(&trainers, &split, &context);

    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.results[0].model, ModelKind::LinearTrend);
    assert_eq!(outcome.results[0].order, 1);
    assert_eq!(outcome.failures.len(), 1);
    assert!(outcome.failures[0].error.contains("diverged"));
    assert!(select_best(&outcome.results).is_ok());
}

#[test]
fn no_successful_model_means_no_forecast() {
    let mut config = PipelineConfig {
        models: vec![ModelKind::Recurrent],
        ..PipelineConfig::default()
    };
    config.recurrent.lookback = 12;
    let err = run_pipeline(&cohort(&seasonal_counts(14)), &config).unwrap_err();
    assert_eq!(err, ForecastError::NoTrainedModel);

    assert_eq!(select_best(&[]).unwrap_err(), ForecastError::NoTrainedModel);

    let rows = build_feature_table(&cohort(&[2, 3]), &FeatureConfig::default()).unwrap();
    assert_eq!(
        Forecaster::new(ForecastSettings::default())
            .forecast(&rows, 3)
            .unwrap_err(),
        ForecastError::NoTrainedModel
    );
}

#[test]
fn too_few_periods_is_insufficient_data() {
    let err = run_pipeline(&cohort(&[5; 8]), &PipelineConfig::default()).unwrap_err();
    assert_eq!(
        err,
        ForecastError::InsufficientData {
            required: 12,
            actual: 8
        }
    );
    assert!(matches!(
        run_pipeline(&[], &PipelineConfig::default()),
        Err(ForecastError::InsufficientData { .. })
    ));
}

#[test]
fn training_window_limits_the_history() {
    let config = PipelineConfig {
        models: vec![ModelKind::LinearTrend],
        horizon: 3,
        training_window: Some(TrainingWindow {
            start: NaiveDate::from_ymd_opt(2017, 1, 15),
            end: None,
        }),
        ..PipelineConfig::default()
    };
    let report = run_pipeline(&cohort(&seasonal_counts(48)), &config).unwrap();
    assert_eq!(report.split.train_start, NaiveDate::from_ymd_opt(2017, 1, 1).unwrap());
    assert_eq!(report.split.train_periods + report.split.test_periods, 24);
}

#[test]
fn zero_count_months_do_not_break_mape() {
    let mut counts = seasonal_counts(40);
    for month in [33, 36, 39] {
        counts[month] = 0;
    }
    counts[39] = 4;
    let config = PipelineConfig {
        models: vec![ModelKind::LinearTrend],
        horizon: 6,
        ..PipelineConfig::default()
    };
    let report = run_pipeline(&cohort(&counts), &config).unwrap();
    let linear = &report.models[0];
    assert_eq!(linear.mape_excluded, 2);
    assert!(linear.metrics.mape.is_some_and(f64::is_finite));
}

/// Linear trainer that refuses more than `limit` periods.
struct CappedLinear {
    limit: usize,
}

impl Trainer for CappedLinear {
    fn kind(&self) -> ModelKind {
        ModelKind::LinearTrend
    }

    fn min_history(&self) -> usize {
        4
    }

    fn fit(&self, train: &[FeatureRow]) -> hepcast_core::Result<Arc<dyn FittedModel>> {
        if train.len() > self.limit {
            return Err(ForecastError::training(self.kind(), "too much history"));
        }
        ModelKind::LinearTrend.trainer(&PipelineConfig::default()).fit(train)
    }
}

#[test]
fn failed_refit_falls_back_to_the_train_only_model() {
    let config = PipelineConfig {
        models: vec![ModelKind::LinearTrend],
        horizon: 6,
        ..PipelineConfig::default()
    };
    let records = cohort(&seasonal_counts(36));
    let trainers: Vec<Box<dyn Trainer>> = vec![Box::new(CappedLinear { limit: 29 })];

    let report = run_with_trainers(&records, &config, &trainers).unwrap();
    assert_eq!(report.split.train_periods, 29);
    assert!(!report.refit);
    assert_eq!(report.selected_model, ModelKind::LinearTrend);
    assert_eq!(report.forecast.len(), 6);
    assert!(report.failures.is_empty());

    let refit = run_pipeline(&records, &config).unwrap();
    assert!(refit.refit);
    assert_ne!(refit.forecast, report.forecast);
}

#[test]
fn forecaster_edge_horizons_and_history() {
    let config = PipelineConfig {
        models: vec![ModelKind::LinearTrend],
        ..PipelineConfig::default()
    };
    let rows = build_feature_table(&cohort(&seasonal_counts(30)), &config.features).unwrap();
    let split = chronological_split(&rows, config.train_ratio, config.min_periods).unwrap();
    let context = RunContext::new(&rows, &config).unwrap();
    let trainers = vec![ModelKind::LinearTrend.trainer(&config)];
    let outcome = train_candidates(&trainers, &split, &context);
    let selected = select_best(&outcome.results).unwrap();
    let forecaster = Forecaster::new(config.forecast_settings()).with_model(selected);

    assert_eq!(forecaster.forecast(&rows, 0).unwrap(), Vec::new());
    assert!(matches!(
        forecaster.forecast(&[], 3),
        Err(ForecastError::InsufficientData { actual: 0, .. })
    ));
    assert!(matches!(
        forecaster.forecast(&rows, MAX_HORIZON_MONTHS + 1),
        Err(ForecastError::InvalidConfig(_))
    ));
    assert_eq!(forecaster.forecast(&rows, 2).unwrap().len(), 2);
}
