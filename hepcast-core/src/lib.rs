//! Kiểu dữ liệu lõi và pipeline dự báo số ca viêm gan B theo tháng.
//!
//! Dữ liệu đi một chiều: [`PatientRecord`] đã làm sạch được gom thành
//! [`FeatureRow`] theo tháng, chia theo thời gian, huấn luyện trên từng mô
//! hình đã cấu hình và chấm điểm; mô hình tốt nhất dự báo cho cả horizon.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub mod evaluate;
pub mod features;
pub mod forecast;
pub mod models;
pub mod pipeline;
pub mod split;

pub use evaluate::{evaluate, rank, rolling_errors, select_best, Metrics, MetricSample, RollingError};
pub use features::{build_feature_table, CalendarFeatures, Covariates, FeatureRow};
pub use forecast::{ForecastPoint, ForecastSettings, Forecaster, MAX_HORIZON_MONTHS};
pub use models::{
    BoostingConfig, FittedModel, GrowthStrategy, LinearConfig, ModelKind, RecurrentConfig,
    SplitFinding, Trainer,
};
pub use pipeline::{
    run_pipeline, run_with_trainers, Lineage, ModelReport, ModelResult, PipelineReport,
    SelectedModel,
};
pub use split::{chronological_split, TrainTestSplit};

/// Phiên bản ghi vào metadata lineage.
pub const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Alias `Result` dùng chung cho pipeline.
pub type Result<T> = std::result::Result<T, ForecastError>;

/// Một lượt đăng ký bệnh nhân đã làm sạch.
///
/// Chỉ bộ làm sạch và bộ dựng đặc trưng dùng tới; các bước sau chỉ làm việc
/// với số liệu gộp theo tháng.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatientRecord {
    /// Digest `sha256:<hex>` của mã bệnh nhân gốc.
    pub patient_hash: String,
    pub registration_date: NaiveDate,
    pub age: f64,
    pub gender: Gender,
    /// HBV DNA, IU/mL.
    pub viral_load: f64,
    /// Men gan ALT, U/L.
    pub alt_level: f64,
    pub follow_up_months: f64,
    pub lost_to_follow_up: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    Unknown,
}

/// Cách xử lý khi thiếu trường số lâm sàng.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ImputationPolicy {
    /// Báo lỗi ở bản ghi đầu tiên thiếu tuổi, tải lượng virus, ALT hoặc thời gian theo dõi.
    Reject,
    /// Thay bằng trung bình của trường trong cùng tháng, nếu không có thì
    /// lấy trung bình toàn bộ bản ghi.
    #[default]
    PeriodMean,
}

/// Cấu hình bảng đặc trưng theo tháng.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeatureConfig {
    /// Số độ trễ (lag) lưu trên mỗi dòng.
    pub lag_count: usize,
    /// Số tháng trước được lấy trung bình cho `rolling_mean`.
    pub rolling_window: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            lag_count: 12,
            rolling_window: 3,
        }
    }
}

/// Khoảng tháng (tính cả hai đầu) giới hạn dữ liệu huấn luyện.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TrainingWindow {
    #[serde(default)]
    pub start: Option<NaiveDate>,
    #[serde(default)]
    pub end: Option<NaiveDate>,
}

impl TrainingWindow {
    pub fn contains(&self, period: NaiveDate) -> bool {
        let after_start = self
            .start
            .map_or(true, |start| period >= features::month_start(start));
        let before_end = self
            .end
            .map_or(true, |end| period <= features::month_start(end));
        after_start && before_end
    }
}

/// Cấu hình đầy đủ cho một lần chạy pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub imputation: ImputationPolicy,
    pub features: FeatureConfig,
    /// Tỉ lệ số tháng dành cho huấn luyện, làm tròn lên.
    pub train_ratio: f64,
    /// Số tháng tối thiểu để chia train/test.
    pub min_periods: usize,
    /// Số tháng cần dự báo, tối đa [`MAX_HORIZON_MONTHS`].
    pub horizon: usize,
    /// Các mô hình ứng viên theo thứ tự khai báo (tiêu chí hoà cuối cùng khi xếp hạng).
    pub models: Vec<ModelKind>,
    pub seed: u64,
    /// Huấn luyện lại mô hình thắng trên toàn bộ lịch sử trước khi dự báo.
    pub refit_on_full_history: bool,
    /// Cận dưới của độ lệch phần dư dùng cho khoảng dự báo, tính theo số ca.
    pub min_interval_sigma: f64,
    pub training_window: Option<TrainingWindow>,
    pub linear: LinearConfig,
    pub gradient_boosting: BoostingConfig,
    pub leafwise_boosting: BoostingConfig,
    pub recurrent: RecurrentConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            imputation: ImputationPolicy::default(),
            features: FeatureConfig::default(),
            train_ratio: 0.8,
            min_periods: 12,
            horizon: 60,
            models: ModelKind::ALL.to_vec(),
            seed: 42,
            refit_on_full_history: true,
            min_interval_sigma: 0.5,
            training_window: None,
            linear: LinearConfig::default(),
            gradient_boosting: BoostingConfig::depth_wise(),
            leafwise_boosting: BoostingConfig::leaf_wise(),
            recurrent: RecurrentConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Từ chối cấu hình khiến lần chạy vô nghĩa.
    pub fn validate(&self) -> Result<()> {
        if !(self.train_ratio > 0.0 && self.train_ratio < 1.0) {
            return Err(ForecastError::InvalidConfig(format!(
                "train_ratio phải nằm trong (0, 1), nhận được {}",
                self.train_ratio
            )));
        }
        if self.min_periods < 2 {
            return Err(ForecastError::InvalidConfig(
                "min_periods phải ít nhất là 2".to_string(),
            ));
        }
        if self.horizon > MAX_HORIZON_MONTHS {
            return Err(ForecastError::InvalidConfig(format!(
                "horizon tối đa {MAX_HORIZON_MONTHS} tháng, nhận được {}",
                self.horizon
            )));
        }
        if self.models.is_empty() {
            return Err(ForecastError::InvalidConfig(
                "cần cấu hình ít nhất một mô hình".to_string(),
            ));
        }
        if !self.min_interval_sigma.is_finite() || self.min_interval_sigma <= 0.0 {
            return Err(ForecastError::InvalidConfig(
                "min_interval_sigma phải là số dương".to_string(),
            ));
        }
        if self.features.rolling_window == 0 {
            return Err(ForecastError::InvalidConfig(
                "rolling_window phải ít nhất là 1".to_string(),
            ));
        }
        for kind in &self.models {
            let needed = kind.lags_needed(self);
            if needed > self.features.lag_count {
                return Err(ForecastError::InvalidConfig(format!(
                    "{kind} cần {needed} lag nhưng lag_count chỉ là {}",
                    self.features.lag_count
                )));
            }
        }
        Ok(())
    }

    pub fn forecast_settings(&self) -> ForecastSettings {
        ForecastSettings {
            min_sigma: self.min_interval_sigma,
            rolling_window: self.features.rolling_window,
        }
    }
}

/// Lỗi chung của pipeline.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ForecastError {
    #[error("Bản ghi {record}: không đọc được ngày {value:?}")]
    MalformedDate { record: usize, value: String },
    #[error("Bản ghi {record}: thiếu trường bắt buộc {field}")]
    MissingValue { record: usize, field: &'static str },
    #[error("Không đủ dữ liệu: cần ít nhất {required} tháng, có {actual}")]
    InsufficientData { required: usize, actual: usize },
    #[error("{model} cần {required} tháng lịch sử, có {actual}")]
    InsufficientHistory {
        model: String,
        required: usize,
        actual: usize,
    },
    #[error("Chưa có mô hình nào được huấn luyện")]
    NoTrainedModel,
    #[error("Huấn luyện {model} thất bại: {reason}")]
    TrainingFailure { model: String, reason: String },
    #[error("Cấu hình không hợp lệ: {0}")]
    InvalidConfig(String),
    #[error("Không đọc được dữ liệu: {0}")]
    Parse(String),
}

impl ForecastError {
    /// Gói lỗi của một mô hình kèm tên mô hình.
    pub fn training(model: ModelKind, err: impl std::fmt::Display) -> Self {
        ForecastError::TrainingFailure {
            model: model.to_string(),
            reason: err.to_string(),
        }
    }

    /// Lỗi chất lượng dữ liệu dừng lần chạy ngay ở bước nạp.
    pub fn is_data_quality(&self) -> bool {
        matches!(
            self,
            ForecastError::MalformedDate { .. }
                | ForecastError::MissingValue { .. }
                | ForecastError::InsufficientData { .. }
                | ForecastError::Parse(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_ratio_outside_unit_interval() {
        let config = PipelineConfig {
            train_ratio: 1.0,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ForecastError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_unbounded_horizon() {
        let config = PipelineConfig {
            horizon: usize::MAX,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ForecastError::InvalidConfig(msg)) if msg.contains("horizon")
        ));
        let longest = PipelineConfig {
            horizon: MAX_HORIZON_MONTHS,
            ..PipelineConfig::default()
        };
        assert!(longest.validate().is_ok());
    }

    #[test]
    fn rejects_lookback_longer_than_lags() {
        let mut config = PipelineConfig::default();
        config.features.lag_count = 2;
        assert!(matches!(
            config.validate(),
            Err(ForecastError::InvalidConfig(msg)) if msg.contains("lag_count")
        ));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"horizon": 24, "models": ["linear_trend"]}"#).unwrap();
        assert_eq!(config.horizon, 24);
        assert_eq!(config.models, vec![ModelKind::LinearTrend]);
        assert_eq!(config.train_ratio, 0.8);
        assert_eq!(config.features.lag_count, 12);
    }

    #[test]
    fn training_window_is_month_inclusive() {
        let window = TrainingWindow {
            start: NaiveDate::from_ymd_opt(2018, 3, 15),
            end: NaiveDate::from_ymd_opt(2019, 1, 2),
        };
        assert!(window.contains(NaiveDate::from_ymd_opt(2018, 3, 1).unwrap()));
        assert!(window.contains(NaiveDate::from_ymd_opt(2019, 1, 1).unwrap()));
        assert!(!window.contains(NaiveDate::from_ymd_opt(2019, 2, 1).unwrap()));
    }
}
