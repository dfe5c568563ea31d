//! Monthly feature table built from cleaned patient records.

use std::collections::{BTreeMap, VecDeque};
use std::f64::consts::PI;

use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::{FeatureConfig, ForecastError, Gender, PatientRecord, Result};

/// Aggregated clinical covariates for one month.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Covariates {
    pub mean_age: f64,
    pub mean_viral_load: f64,
    pub median_viral_load: f64,
    pub mean_alt: f64,
    pub median_alt: f64,
    pub mean_follow_up: f64,
    /// Share of the month's patients flagged lost to follow-up.
    pub ltfu_rate: f64,
    pub male_share: f64,
}

impl Covariates {
    pub const LEN: usize = 8;

    pub fn as_array(&self) -> [f64; Self::LEN] {
        [
            self.mean_age,
            self.mean_viral_load,
            self.median_viral_load,
            self.mean_alt,
            self.median_alt,
            self.mean_follow_up,
            self.ltfu_rate,
            self.male_share,
        ]
    }

    fn from_records(records: &[&PatientRecord]) -> Self {
        let n = records.len() as f64;
        let mut viral: Vec<f64> = records.iter().map(|r| r.viral_load).collect();
        let mut alt: Vec<f64> = records.iter().map(|r| r.alt_level).collect();

        Self {
            mean_age: records.iter().map(|r| r.age).sum::<f64>() / n,
            mean_viral_load: viral.iter().sum::<f64>() / n,
            median_viral_load: median(&mut viral),
            mean_alt: alt.iter().sum::<f64>() / n,
            median_alt: median(&mut alt),
            mean_follow_up: records.iter().map(|r| r.follow_up_months).sum::<f64>() / n,
            ltfu_rate: records.iter().filter(|r| r.lost_to_follow_up).count() as f64 / n,
            male_share: records.iter().filter(|r| r.gender == Gender::Male).count() as f64 / n,
        }
    }
}

/// Calendar and seasonal indicators for a month.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CalendarFeatures {
    pub month: u32,
    pub quarter: u32,
    pub month_sin: f64,
    pub month_cos: f64,
}

impl CalendarFeatures {
    pub fn for_period(period: NaiveDate) -> Self {
        let month = period.month();
        let angle = 2.0 * PI * (month - 1) as f64 / 12.0;
        Self {
            month,
            quarter: (month - 1) / 3 + 1,
            month_sin: angle.sin(),
            month_cos: angle.cos(),
        }
    }
}

/// One month of the modeling table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureRow {
    /// First day of the month.
    pub period: NaiveDate,
    /// Months since the first period of the table.
    pub index: usize,
    pub patient_count: f64,
    pub covariates: Covariates,
    pub calendar: CalendarFeatures,
    /// `lags[i]` is the count `i + 1` months earlier.
    pub lags: Vec<Option<f64>>,
    /// Mean of up to `rolling_window` previous counts.
    pub rolling_mean: Option<f64>,
}

impl FeatureRow {
    /// First `n` lags, or `None` if the history does not reach that far.
    pub fn lag_window(&self, n: usize) -> Option<Vec<f64>> {
        if n > self.lags.len() {
            return None;
        }
        self.lags[..n].iter().copied().collect()
    }

    /// Build the following month from a buffer of counts, most recent last.
    ///
    /// Covariates persist from `self`; they are not observed in the future.
    pub fn successor(&self, counts: &VecDeque<f64>, rolling_window: usize) -> FeatureRow {
        let period = next_month(self.period);
        FeatureRow {
            period,
            index: self.index + 1,
            patient_count: 0.0,
            covariates: self.covariates,
            calendar: CalendarFeatures::for_period(period),
            lags: lags_from(counts.iter().rev().copied(), self.lags.len()),
            rolling_mean: trailing_mean(counts.iter().rev().copied(), rolling_window),
        }
    }
}

/// Bucket records by calendar month and derive per-month features.
///
/// Every month between the first and the last registration appears exactly
/// once. Months without records count zero and repeat the previous
/// month's covariates.
pub fn build_feature_table(
    records: &[PatientRecord],
    config: &FeatureConfig,
) -> Result<Vec<FeatureRow>> {
    let mut by_month: BTreeMap<NaiveDate, Vec<&PatientRecord>> = BTreeMap::new();
    for record in records {
        by_month
            .entry(month_start(record.registration_date))
            .or_default()
            .push(record);
    }

    let (Some(&first), Some(&last)) = (by_month.keys().next(), by_month.keys().next_back()) else {
        return Err(ForecastError::InsufficientData {
            required: 1,
            actual: 0,
        });
    };

    let mut rows: Vec<FeatureRow> = Vec::new();
    let mut history: VecDeque<f64> = VecDeque::new();
    let mut covariates = Covariates::default();
    let mut period = first;
    let mut index = 0;

    while period <= last {
        let month_records = by_month.get(&period).map(Vec::as_slice).unwrap_or(&[]);
        if !month_records.is_empty() {
            covariates = Covariates::from_records(month_records);
        }
        let count = month_records.len() as f64;

        rows.push(FeatureRow {
            period,
            index,
            patient_count: count,
            covariates,
            calendar: CalendarFeatures::for_period(period),
            lags: lags_from(history.iter().rev().copied(), config.lag_count),
            rolling_mean: trailing_mean(history.iter().rev().copied(), config.rolling_window),
        });

        history.push_back(count);
        if history.len() > config.lag_count.max(config.rolling_window) {
            history.pop_front();
        }
        period = next_month(period);
        index += 1;
    }

    tracing::info!(
        records = records.len(),
        periods = rows.len(),
        first = %first,
        last = %last,
        "built monthly feature table"
    );
    Ok(rows)
}

/// First day of the month containing `date`.
pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

pub fn next_month(period: NaiveDate) -> NaiveDate {
    period
        .checked_add_months(Months::new(1))
        .unwrap_or(NaiveDate::MAX)
}

/// `true` when each period is exactly one month after the previous one.
pub fn is_contiguous(rows: &[FeatureRow]) -> bool {
    rows.windows(2)
        .all(|pair| next_month(pair[0].period) == pair[1].period && pair[1].index == pair[0].index + 1)
}

fn lags_from(recent_first: impl Iterator<Item = f64>, lag_count: usize) -> Vec<Option<f64>> {
    let mut lags: Vec<Option<f64>> = recent_first.take(lag_count).map(Some).collect();
    lags.resize(lag_count, None);
    lags
}

fn trailing_mean(recent_first: impl Iterator<Item = f64>, window: usize) -> Option<f64> {
    let values: Vec<f64> = recent_first.take(window).collect();
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}
