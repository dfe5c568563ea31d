//! Forecast CSV export and the dashboard-side reader.

use std::io::{Read, Write};

use chrono::NaiveDate;
use csv::StringRecord;
use hepcast_core::{rolling_errors, ForecastError, ForecastPoint, Result, RollingError};
use serde::{Deserialize, Serialize};

use crate::{csv_error, parse_date};

/// Half width of the 80% band when the file has none.
pub const DEFAULT_PI80_HALF_WIDTH: f64 = 1.5;
/// Half width of the 95% band when the file has none.
pub const DEFAULT_PI95_HALF_WIDTH: f64 = 3.0;

/// A forecast line as the dashboard reads it, optionally with the observed
/// count for that month.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ForecastRow {
    pub date: NaiveDate,
    pub predicted_median: f64,
    pub actual: Option<f64>,
    pub pi80_low: f64,
    pub pi80_high: f64,
    pub pi95_low: f64,
    pub pi95_high: f64,
}

impl From<ForecastPoint> for ForecastRow {
    fn from(point: ForecastPoint) -> Self {
        Self {
            date: point.date,
            predicted_median: point.predicted_median,
            actual: None,
            pi80_low: point.pi80_low,
            pi80_high: point.pi80_high,
            pi95_low: point.pi95_low,
            pi95_high: point.pi95_high,
        }
    }
}

/// Write forecast points with the `date,predicted_median,pi80_low,...` header.
pub fn write_forecast_csv<W: Write>(writer: W, points: &[ForecastPoint]) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    for point in points {
        csv.serialize(point).map_err(csv_error)?;
    }
    csv.flush().map_err(|err| ForecastError::Parse(err.to_string()))
}

/// Write normalized rows, `actual` included.
pub fn write_forecast_rows<W: Write>(writer: W, rows: &[ForecastRow]) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    for row in rows {
        csv.serialize(row).map_err(csv_error)?;
    }
    csv.flush().map_err(|err| ForecastError::Parse(err.to_string()))
}

/// Read and normalize a forecast CSV.
///
/// `date` and `predicted_median` are required. A missing `actual` column
/// leaves every actual empty. An interval whose low or high column is absent
/// is filled symmetrically around the median with the default half width.
/// Rows come back sorted by date.
pub fn read_forecast_csv<R: Read>(reader: R) -> Result<Vec<ForecastRow>> {
    let (headers, records) = read_table(reader)?;
    let column = |name: &str| find_exact(&headers, name);

    let (date, median) = match (column("date"), column("predicted_median")) {
        (Some(date), Some(median)) => (date, median),
        (date, median) => {
            let missing: Vec<&str> = [("date", date), ("predicted_median", median)]
                .into_iter()
                .filter(|(_, col)| col.is_none())
                .map(|(name, _)| name)
                .collect();
            return Err(ForecastError::Parse(format!(
                "forecast CSV is missing required columns {missing:?}"
            )));
        }
    };
    let layout = Layout {
        date,
        median,
        actual: column("actual"),
        pi80: column("pi80_low").zip(column("pi80_high")),
        pi95: column("pi95_low").zip(column("pi95_high")),
    };

    let lines = parse_lines(&records, &layout, Strictness::Strict)?;
    let rows = finish_rows(lines, DEFAULT_PI80_HALF_WIDTH, DEFAULT_PI95_HALF_WIDTH);
    tracing::info!(rows = rows.len(), "normalized forecast CSV");
    Ok(rows)
}

/// Read a monthly forecast export whose column names vary.
///
/// The date column is the first header mentioning `date`, `month`, `period`
/// or `year` (the first column otherwise). The median is the first other
/// column holding numbers whose header mentions a forecast-like word, or the
/// first numeric column when none does. `actual` is the first header
/// mentioning `actual`, `observed`, `obs` or `report`. Canonical names win
/// when present.
///
/// Rows with an unreadable date or median are dropped. Bands absent from the
/// file use the sample standard deviation of the medians as the 80% half
/// width and twice that for 95%, falling back to the fixed defaults when the
/// deviation is zero or undefined.
pub fn read_monthly_forecast_csv<R: Read>(reader: R) -> Result<Vec<ForecastRow>> {
    let (headers, records) = read_table(reader)?;
    let layout = detect_layout(&headers, &records)?;
    tracing::debug!(?layout, "detected forecast columns");

    let lines = parse_lines(&records, &layout, Strictness::Lenient)?;
    let dropped = records.len() - lines.len();
    if dropped > 0 {
        tracing::warn!(dropped, "skipped forecast rows without a readable date or median");
    }

    let medians: Vec<f64> = lines.iter().map(|line| line.median).collect();
    let (half80, half95) = match sample_std(&medians) {
        Some(sigma) if sigma > 0.0 => (sigma, 2.0 * sigma),
        _ => (DEFAULT_PI80_HALF_WIDTH, DEFAULT_PI95_HALF_WIDTH),
    };
    let rows = finish_rows(lines, half80, half95);
    tracing::info!(rows = rows.len(), "normalized monthly forecast CSV");
    Ok(rows)
}

const DATE_WORDS: &[&str] = &["date", "month", "period", "year"];
const MEDIAN_WORDS: &[&str] = &[
    "forecast", "pred", "median", "value", "count", "case", "n_", "total",
];
const ACTUAL_WORDS: &[&str] = &["actual", "observed", "obs", "report"];

#[derive(Debug)]
struct Layout {
    date: usize,
    median: usize,
    actual: Option<usize>,
    pi80: Option<(usize, usize)>,
    pi95: Option<(usize, usize)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strictness {
    /// Any unreadable cell fails the whole file.
    Strict,
    /// Rows with an unreadable date or median are skipped; other bad cells read as empty.
    Lenient,
}

struct ParsedLine {
    date: NaiveDate,
    median: f64,
    actual: Option<f64>,
    pi80: (Option<f64>, Option<f64>),
    pi95: (Option<f64>, Option<f64>),
}

fn read_table<R: Read>(reader: R) -> Result<(StringRecord, Vec<StringRecord>)> {
    let mut csv = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = csv.headers().map_err(csv_error)?.clone();
    let records = csv
        .records()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(csv_error)?;
    Ok((headers, records))
}

fn find_exact(headers: &StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h.trim().eq_ignore_ascii_case(name))
}

fn mentions(header: &str, words: &[&str]) -> bool {
    let header = header.to_ascii_lowercase();
    words.iter().any(|word| header.contains(word))
}

fn detect_layout(headers: &StringRecord, records: &[StringRecord]) -> Result<Layout> {
    if headers.is_empty() {
        return Err(ForecastError::Parse("forecast CSV has no columns".to_string()));
    }
    let date = find_exact(headers, "date")
        .or_else(|| headers.iter().position(|h| mentions(h, DATE_WORDS)))
        .unwrap_or(0);
    let actual = find_exact(headers, "actual").or_else(|| {
        headers
            .iter()
            .enumerate()
            .find(|&(col, h)| col != date && mentions(h, ACTUAL_WORDS))
            .map(|(col, _)| col)
    });
    let pi80 = find_exact(headers, "pi80_low").zip(find_exact(headers, "pi80_high"));
    let pi95 = find_exact(headers, "pi95_low").zip(find_exact(headers, "pi95_high"));

    let reserved = |col: usize| {
        col == date
            || Some(col) == actual
            || pi80.is_some_and(|(low, high)| col == low || col == high)
            || pi95.is_some_and(|(low, high)| col == low || col == high)
    };
    let holds_numbers = |col: usize| {
        records
            .iter()
            .any(|record| parse_number(record.get(col).unwrap_or_default()).is_some())
    };
    let numeric: Vec<usize> = (0..headers.len())
        .filter(|&col| !reserved(col) && holds_numbers(col))
        .collect();
    let median = find_exact(headers, "predicted_median")
        .or_else(|| {
            numeric
                .iter()
                .copied()
                .find(|&col| headers.get(col).is_some_and(|h| mentions(h, MEDIAN_WORDS)))
        })
        .or_else(|| numeric.first().copied())
        .ok_or_else(|| {
            ForecastError::Parse("forecast CSV has no numeric column to use as the median".to_string())
        })?;

    Ok(Layout {
        date,
        median,
        actual,
        pi80,
        pi95,
    })
}

fn parse_number(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("nan") {
        return None;
    }
    value.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Calendar date, `YYYY-MM`, or a bare year (read as January).
fn parse_period(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    parse_date(value).or_else(|| {
        if value.len() != 4 || !value.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        NaiveDate::from_ymd_opt(value.parse().ok()?, 1, 1)
    })
}

fn parse_lines(
    records: &[StringRecord],
    layout: &Layout,
    strictness: Strictness,
) -> Result<Vec<ParsedLine>> {
    let strict = strictness == Strictness::Strict;
    let mut lines = Vec::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        let line = record
            .position()
            .map_or(index + 2, |pos| pos.line() as usize);
        let text = |col: usize| record.get(col).map(str::trim).unwrap_or_default();
        let number = |col: usize, field: &str| -> Result<Option<f64>> {
            let value = text(col);
            match parse_number(value) {
                Some(number) => Ok(Some(number)),
                None if !strict || value.is_empty() || value.eq_ignore_ascii_case("nan") => {
                    Ok(None)
                }
                None => Err(ForecastError::Parse(format!(
                    "line {line}: {field} is not a number: {value:?}"
                ))),
            }
        };

        let raw_date = text(layout.date);
        let date = match parse_period(raw_date) {
            Some(date) => date,
            None if strict => {
                return Err(ForecastError::MalformedDate {
                    record: line,
                    value: raw_date.to_string(),
                })
            }
            None => continue,
        };
        let median = match number(layout.median, "predicted_median")? {
            Some(median) => median,
            None if strict => {
                return Err(ForecastError::MissingValue {
                    record: line,
                    field: "predicted_median",
                })
            }
            None => continue,
        };
        let actual = match layout.actual {
            Some(col) => number(col, "actual")?,
            None => None,
        };
        let band = |columns: Option<(usize, usize)>| -> Result<(Option<f64>, Option<f64>)> {
            match columns {
                Some((low, high)) => Ok((number(low, "interval low")?, number(high, "interval high")?)),
                None => Ok((None, None)),
            }
        };

        lines.push(ParsedLine {
            date,
            median,
            actual,
            pi80: band(layout.pi80)?,
            pi95: band(layout.pi95)?,
        });
    }
    Ok(lines)
}

fn finish_rows(lines: Vec<ParsedLine>, half80: f64, half95: f64) -> Vec<ForecastRow> {
    let mut rows: Vec<ForecastRow> = lines
        .into_iter()
        .map(|line| {
            let median = line.median;
            ForecastRow {
                date: line.date,
                predicted_median: median,
                actual: line.actual,
                pi80_low: line.pi80.0.unwrap_or(median - half80),
                pi80_high: line.pi80.1.unwrap_or(median + half80),
                pi95_low: line.pi95.0.unwrap_or(median - half95),
                pi95_high: line.pi95.1.unwrap_or(median + half95),
            }
        })
        .collect();
    rows.sort_by_key(|row| row.date);
    rows
}

fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(variance.sqrt())
}

/// Trailing MAE and RMSE of the median against actuals, row by row.
pub fn forecast_rolling_errors(rows: &[ForecastRow], window: usize) -> Vec<RollingError> {
    let actual: Vec<Option<f64>> = rows.iter().map(|row| row.actual).collect();
    let predicted: Vec<f64> = rows.iter().map(|row| row.predicted_median).collect();
    rolling_errors(&actual, &predicted, window)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_intervals_get_default_bands() {
        let rows = read_forecast_csv(" date , predicted_median \n2025-02,10\n2025-01,8\n".as_bytes())
            .unwrap();
        assert_eq!(rows[0].date, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        assert_eq!((rows[0].pi80_low, rows[0].pi80_high), (6.5, 9.5));
        assert_eq!((rows[1].pi95_low, rows[1].pi95_high), (7.0, 13.0));
        assert!(rows.iter().all(|row| row.actual.is_none()));
    }

    #[test]
    fn half_present_band_is_replaced() {
        let text = "date,predicted_median,pi80_low,pi95_low,pi95_high,actual\n\
                    2025-01-01,10,1,2,20,\n";
        let rows = read_forecast_csv(text.as_bytes()).unwrap();
        assert_eq!((rows[0].pi80_low, rows[0].pi80_high), (8.5, 11.5));
        assert_eq!((rows[0].pi95_low, rows[0].pi95_high), (2.0, 20.0));
        assert_eq!(rows[0].actual, None);
    }

    #[test]
    fn required_columns_are_enforced() {
        let err = read_forecast_csv("date,actual\n2025-01-01,3\n".as_bytes()).unwrap_err();
        assert!(matches!(err, ForecastError::Parse(msg) if msg.contains("predicted_median")));
    }

    #[test]
    fn loose_headers_are_detected() {
        let text = "month,forecast_cases,observed\n2025-02,12,\n2025-01,10,9\n";
        let rows = read_monthly_forecast_csv(text.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].date, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        assert_eq!(rows[0].predicted_median, 10.0);
        assert_eq!(rows[0].actual, Some(9.0));
        assert_eq!(rows[1].actual, None);
        // Two medians 10 and 12: sample deviation is sqrt(2).
        let sigma = 2f64.sqrt();
        assert!((rows[0].pi80_high - (10.0 + sigma)).abs() < 1e-12);
        assert!((rows[0].pi95_low - (10.0 - 2.0 * sigma)).abs() < 1e-12);
    }

    #[test]
    fn unreadable_dates_are_dropped_not_fatal() {
        let text = "date,predicted_median\n2025-01-01,5\nn/a,6\n2025-02-01,7\n";
        assert!(matches!(
            read_forecast_csv(text.as_bytes()),
            Err(ForecastError::MalformedDate { record: 3, .. })
        ));
        let rows = read_monthly_forecast_csv(text.as_bytes()).unwrap();
        let medians: Vec<f64> = rows.iter().map(|row| row.predicted_median).collect();
        assert_eq!(medians, vec![5.0, 7.0]);
    }

    #[test]
    fn bare_years_and_flat_series_use_fixed_bands() {
        let text = "year,total\n2027,4\n2026,4\n";
        let rows = read_monthly_forecast_csv(text.as_bytes()).unwrap();
        assert_eq!(rows[0].date, NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());
        assert_eq!((rows[0].pi80_low, rows[0].pi80_high), (2.5, 5.5));
        assert_eq!((rows[0].pi95_low, rows[0].pi95_high), (1.0, 7.0));
    }

    #[test]
    fn canonical_export_keeps_its_bands() {
        let text = "date,predicted_median,pi80_low,pi80_high,pi95_low,pi95_high,actual\n\
                    2025-01-01,10,8,12,6,14,11\n2025-02-01,30,27,33,25,35,\n";
        let monthly = read_monthly_forecast_csv(text.as_bytes()).unwrap();
        assert_eq!(monthly, read_forecast_csv(text.as_bytes()).unwrap());
        assert_eq!((monthly[1].pi95_low, monthly[1].pi95_high), (25.0, 35.0));
    }

    #[test]
    fn no_numeric_column_is_an_error() {
        let err = read_monthly_forecast_csv("month,notes\n2025-01,ok\n".as_bytes()).unwrap_err();
        assert!(matches!(err, ForecastError::Parse(msg) if msg.contains("numeric")));
    }

    #[test]
    fn written_points_read_back_in_order() {
        let date = NaiveDate::from_ymd_opt(2026, 5, 1).unwrap();
        let point = ForecastPoint {
            date,
            predicted_median: 12.25,
            pi80_low: 10.0,
            pi80_high: 14.5,
            pi95_low: 8.0,
            pi95_high: 16.5,
        };
        let mut buffer = Vec::new();
        write_forecast_csv(&mut buffer, &[point]).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.starts_with("date,predicted_median,pi80_low,pi80_high,pi95_low,pi95_high\n"));

        let rows = read_forecast_csv(text.as_bytes()).unwrap();
        assert_eq!(rows, vec![ForecastRow::from(point)]);
    }
}
