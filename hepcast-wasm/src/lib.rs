//! Bridge WASM <-> JavaScript để chạy dự báo ngay trên trình duyệt.

use hepcast_core::{
    run_pipeline, ForecastError, ImputationPolicy, ModelKind, PipelineConfig, PipelineReport,
};
use hepcast_records::{clean_records, load_records_value, read_monthly_forecast_csv};
use serde::{Deserialize, Serialize};
use serde_wasm_bindgen::{from_value, Serializer};
use wasm_bindgen::prelude::*;

/// Cấu hình một phần từ JS; trường nào vắng mặt giữ giá trị mặc định.
#[derive(Debug, Default, Deserialize)]
struct JsPipelineConfig {
    #[serde(default)]
    imputation: Option<ImputationPolicy>,
    #[serde(default)]
    train_ratio: Option<f64>,
    #[serde(default)]
    min_periods: Option<usize>,
    #[serde(default)]
    horizon: Option<usize>,
    #[serde(default)]
    models: Option<Vec<ModelKind>>,
    #[serde(default)]
    seed: Option<u64>,
    #[serde(default)]
    refit_on_full_history: Option<bool>,
    #[serde(default)]
    min_interval_sigma: Option<f64>,
    #[serde(default)]
    lag_count: Option<usize>,
    #[serde(default)]
    rolling_window: Option<usize>,
}

impl From<JsPipelineConfig> for PipelineConfig {
    fn from(cfg: JsPipelineConfig) -> Self {
        let mut base = PipelineConfig::default();
        if let Some(policy) = cfg.imputation {
            base.imputation = policy;
        }
        if let Some(ratio) = cfg.train_ratio {
            base.train_ratio = ratio;
        }
        if let Some(periods) = cfg.min_periods {
            base.min_periods = periods;
        }
        if let Some(horizon) = cfg.horizon {
            base.horizon = horizon;
        }
        if let Some(models) = cfg.models {
            base.models = models;
        }
        if let Some(seed) = cfg.seed {
            base.seed = seed;
        }
        if let Some(refit) = cfg.refit_on_full_history {
            base.refit_on_full_history = refit;
        }
        if let Some(sigma) = cfg.min_interval_sigma {
            base.min_interval_sigma = sigma;
        }
        if let Some(lags) = cfg.lag_count {
            base.features.lag_count = lags;
        }
        if let Some(window) = cfg.rolling_window {
            base.features.rolling_window = window;
        }
        base
    }
}

/// Làm sạch mảng JSON bản ghi bệnh nhân rồi chạy toàn bộ pipeline.
#[wasm_bindgen]
pub fn run_forecast(records: JsValue, config: Option<JsValue>) -> Result<JsValue, JsValue> {
    #[cfg(target_arch = "wasm32")]
    console_error_panic_hook::set_once();

    let records = from_value::<serde_json::Value>(records)
        .map_err(|err| JsValue::from_str(&format!("Không đọc được bản ghi bệnh nhân: {err}")))?;

    let cfg = match config {
        Some(js_cfg) => {
            let cfg: JsPipelineConfig = from_value(js_cfg)
                .map_err(|err| JsValue::from_str(&format!("Không đọc được config: {err}")))?;
            PipelineConfig::from(cfg)
        }
        None => PipelineConfig::default(),
    };

    let report = forecast_from_value(&records, &cfg)
        .map_err(|err| JsValue::from_str(&format_forecast_error(err)))?;
    to_js(&report)
}

/// Chuẩn hoá CSV dự báo để vẽ biểu đồ, tự nhận diện cột.
#[wasm_bindgen]
pub fn normalize_forecast_csv(text: &str) -> Result<JsValue, JsValue> {
    #[cfg(target_arch = "wasm32")]
    console_error_panic_hook::set_once();

    let rows = read_monthly_forecast_csv(text.as_bytes())
        .map_err(|err| JsValue::from_str(&format_forecast_error(err)))?;
    to_js(&rows)
}

fn forecast_from_value(
    records: &serde_json::Value,
    cfg: &PipelineConfig,
) -> Result<PipelineReport, ForecastError> {
    let raw = load_records_value(records)?;
    let cleaned = clean_records(&raw, cfg.imputation)?;
    run_pipeline(&cleaned, cfg)
}

// Plain objects instead of JS `Map`s for nested JSON values.
fn to_js<T: Serialize + ?Sized>(value: &T) -> Result<JsValue, JsValue> {
    value
        .serialize(&Serializer::json_compatible())
        .map_err(|err| JsValue::from_str(&format!("Không serialize được kết quả: {err}")))
}

fn format_forecast_error(err: ForecastError) -> String {
    format!("Forecast error: {err}")
}
