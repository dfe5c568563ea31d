//! Patient registration exports to cleaned [`PatientRecord`]s.
//!
//! Ingestion is strict: an unreadable date or number stops the load with an
//! error that names the source record. Missing clinical values are either
//! rejected or filled according to the configured [`ImputationPolicy`].

use std::collections::{HashMap, HashSet};
use std::io::Read;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use csv::StringRecord;
use hepcast_core::features::month_start;
use hepcast_core::{ForecastError, Gender, ImputationPolicy, PatientRecord, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

mod anonymize;
mod forecast_csv;

pub use anonymize::{anonymize_patient_csv, AnonymizeSummary, PHI_COLUMNS};
pub use forecast_csv::{
    forecast_rolling_errors, read_forecast_csv, read_monthly_forecast_csv, write_forecast_csv,
    write_forecast_rows, ForecastRow, DEFAULT_PI80_HALF_WIDTH, DEFAULT_PI95_HALF_WIDTH,
};

const PATIENT_ID: &[&str] = &["patient_id", "id"];
const REGISTRATION_DATE: &[&str] = &["registration_date", "date", "reg_date"];
const AGE: &[&str] = &["age"];
const GENDER: &[&str] = &["gender", "sex"];
const VIRAL_LOAD: &[&str] = &["viral_load", "hbv_dna"];
const ALT_LEVEL: &[&str] = &["alt_level", "alt"];
const FOLLOW_UP: &[&str] = &["follow_up_months", "follow_up_duration"];
const LTFU: &[&str] = &["ltfu", "lost_to_follow_up", "ltfu_status"];

/// One source row exactly as read, before any parsing.
///
/// `line` is the 1-based source line (CSV) or array position (JSON) and is
/// what error messages refer to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPatientRow {
    pub line: usize,
    pub patient_id: Option<String>,
    pub registration_date: Option<String>,
    pub age: Option<String>,
    pub gender: Option<String>,
    pub viral_load: Option<String>,
    pub alt_level: Option<String>,
    pub follow_up_months: Option<String>,
    pub ltfu: Option<String>,
}

/// Read a headered CSV export.
pub fn load_records_csv<R: Read>(reader: R) -> Result<Vec<RawPatientRow>> {
    let mut csv = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = csv.headers().map_err(csv_error)?.clone();

    let column = |aliases: &[&str]| {
        headers
            .iter()
            .position(|h| aliases.iter().any(|alias| h.trim().eq_ignore_ascii_case(alias)))
    };
    let columns = [
        column(PATIENT_ID),
        column(REGISTRATION_DATE),
        column(AGE),
        column(GENDER),
        column(VIRAL_LOAD),
        column(ALT_LEVEL),
        column(FOLLOW_UP),
        column(LTFU),
    ];
    if columns[0].is_none() || columns[1].is_none() {
        return Err(ForecastError::Parse(
            "patient CSV needs a patient_id and a registration_date column".to_string(),
        ));
    }

    let mut rows = Vec::new();
    for (index, record) in csv.records().enumerate() {
        let record = record.map_err(csv_error)?;
        let line = record
            .position()
            .map_or(index + 2, |pos| pos.line() as usize);
        let cell = |slot: usize| text_cell(&record, columns[slot]);
        rows.push(RawPatientRow {
            line,
            patient_id: cell(0),
            registration_date: cell(1),
            age: cell(2),
            gender: cell(3),
            viral_load: cell(4),
            alt_level: cell(5),
            follow_up_months: cell(6),
            ltfu: cell(7),
        });
    }

    tracing::info!(rows = rows.len(), "loaded patient rows from CSV");
    Ok(rows)
}

fn text_cell(record: &StringRecord, column: Option<usize>) -> Option<String> {
    let value = record.get(column?)?.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Read a JSON array of patient objects.
pub fn load_records_json(text: &str) -> Result<Vec<RawPatientRow>> {
    let value: Value =
        serde_json::from_str(text).map_err(|err| ForecastError::Parse(err.to_string()))?;
    load_records_value(&value)
}

/// Read patient objects from an already parsed JSON value.
///
/// Keys are matched case-insensitively against the same aliases as CSV
/// headers. Numbers and booleans are accepted as well as strings.
pub fn load_records_value(value: &Value) -> Result<Vec<RawPatientRow>> {
    let entries = value
        .as_array()
        .ok_or_else(|| ForecastError::Parse("expected a JSON array of patient records".into()))?;

    let rows = entries
        .iter()
        .enumerate()
        .map(|(index, entry)| -> Result<RawPatientRow> {
            let line = index + 1;
            let object = entry.as_object().ok_or_else(|| {
                ForecastError::Parse(format!("record {line}: expected a JSON object"))
            })?;
            let field = |aliases: &[&str]| -> Result<Option<String>> {
                let found = object
                    .iter()
                    .find(|(key, _)| aliases.iter().any(|a| key.trim().eq_ignore_ascii_case(a)));
                match found {
                    None => Ok(None),
                    Some((key, value)) => json_text(value).map_err(|kind| {
                        ForecastError::Parse(format!("record {line}: field {key} holds {kind}"))
                    }),
                }
            };
            Ok(RawPatientRow {
                line,
                patient_id: field(PATIENT_ID)?,
                registration_date: field(REGISTRATION_DATE)?,
                age: field(AGE)?,
                gender: field(GENDER)?,
                viral_load: field(VIRAL_LOAD)?,
                alt_level: field(ALT_LEVEL)?,
                follow_up_months: field(FOLLOW_UP)?,
                ltfu: field(LTFU)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    tracing::info!(rows = rows.len(), "loaded patient rows from JSON");
    Ok(rows)
}

fn json_text(value: &Value) -> std::result::Result<Option<String>, &'static str> {
    match value {
        Value::Null => Ok(None),
        Value::String(text) => {
            let text = text.trim();
            Ok((!text.is_empty()).then(|| text.to_string()))
        }
        Value::Number(number) => Ok(Some(number.to_string())),
        Value::Bool(flag) => Ok(Some(flag.to_string())),
        Value::Array(_) => Err("an array"),
        Value::Object(_) => Err("an object"),
    }
}

/// Parse a registration date in any of the accepted layouts.
///
/// `YYYY-MM` resolves to the first of the month; timestamps keep their
/// calendar date.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    for format in ["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Some(date);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(&format!("{value}-01"), "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(stamp) = DateTime::parse_from_rfc3339(value) {
        return Some(stamp.date_naive());
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|stamp| stamp.date())
}

/// `sha256:<hex>` digest of a raw patient identifier.
pub fn hash_identifier(raw: &str) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(raw.trim().as_bytes())))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Measure {
    Age,
    ViralLoad,
    AltLevel,
    FollowUp,
}

impl Measure {
    const ALL: [Measure; 4] = [
        Measure::Age,
        Measure::ViralLoad,
        Measure::AltLevel,
        Measure::FollowUp,
    ];

    fn name(self) -> &'static str {
        match self {
            Measure::Age => "age",
            Measure::ViralLoad => "viral_load",
            Measure::AltLevel => "alt_level",
            Measure::FollowUp => "follow_up_months",
        }
    }

    fn raw(self, row: &RawPatientRow) -> Option<&str> {
        match self {
            Measure::Age => row.age.as_deref(),
            Measure::ViralLoad => row.viral_load.as_deref(),
            Measure::AltLevel => row.alt_level.as_deref(),
            Measure::FollowUp => row.follow_up_months.as_deref(),
        }
    }
}

struct ParsedRow {
    line: usize,
    patient_id: String,
    date: NaiveDate,
    values: [Option<f64>; 4],
    gender: Gender,
    ltfu: bool,
}

type DedupeKey = (String, NaiveDate, [Option<u64>; 4], Gender, bool);

impl ParsedRow {
    fn parse(raw: &RawPatientRow) -> Result<Self> {
        let line = raw.line;
        let patient_id = raw
            .patient_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(ForecastError::MissingValue {
                record: line,
                field: "patient_id",
            })?
            .to_string();

        let date_text = raw
            .registration_date
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .ok_or(ForecastError::MissingValue {
                record: line,
                field: "registration_date",
            })?;
        let date = parse_date(date_text).ok_or_else(|| ForecastError::MalformedDate {
            record: line,
            value: date_text.to_string(),
        })?;

        let mut values = [None; 4];
        for (slot, measure) in Measure::ALL.into_iter().enumerate() {
            values[slot] = parse_number(line, measure.name(), measure.raw(raw))?;
        }

        Ok(Self {
            line,
            patient_id,
            date,
            values,
            gender: parse_gender(raw.gender.as_deref()),
            ltfu: parse_ltfu(line, raw.ltfu.as_deref())?,
        })
    }

    fn dedupe_key(&self) -> DedupeKey {
        (
            self.patient_id.clone(),
            self.date,
            self.values.map(|v| v.map(f64::to_bits)),
            self.gender,
            self.ltfu,
        )
    }
}

fn is_missing(text: &str) -> bool {
    let text = text.trim();
    text.is_empty()
        || ["na", "n/a", "nan", "null", "none"]
            .iter()
            .any(|marker| text.eq_ignore_ascii_case(marker))
}

fn parse_number(line: usize, field: &str, value: Option<&str>) -> Result<Option<f64>> {
    let Some(text) = value.filter(|t| !is_missing(t)) else {
        return Ok(None);
    };
    match text.trim().parse::<f64>() {
        Ok(number) if number.is_finite() => Ok(Some(number)),
        _ => Err(ForecastError::Parse(format!(
            "record {line}: field {field} is not a number: {text:?}"
        ))),
    }
}

fn parse_gender(value: Option<&str>) -> Gender {
    match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        Some("m" | "male") => Gender::Male,
        Some("f" | "female") => Gender::Female,
        _ => Gender::Unknown,
    }
}

fn parse_ltfu(line: usize, value: Option<&str>) -> Result<bool> {
    let Some(text) = value.filter(|t| !is_missing(t)) else {
        return Ok(false);
    };
    match text.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "ltfu" | "lost" => Ok(true),
        "0" | "false" | "no" | "n" | "active" | "retained" => Ok(false),
        _ => Err(ForecastError::Parse(format!(
            "record {line}: field ltfu is not a yes/no value: {text:?}"
        ))),
    }
}

/// Turn raw rows into cleaned records. The input is left untouched.
///
/// Exact duplicates (same identifier, date and clinical values before any
/// imputation) keep their first occurrence.
pub fn clean_records(rows: &[RawPatientRow], policy: ImputationPolicy) -> Result<Vec<PatientRecord>> {
    let parsed = rows.iter().map(ParsedRow::parse).collect::<Result<Vec<_>>>()?;

    let mut seen = HashSet::new();
    let mut unique: Vec<ParsedRow> = parsed
        .into_iter()
        .filter(|row| seen.insert(row.dedupe_key()))
        .collect();
    let duplicates = rows.len() - unique.len();
    if duplicates > 0 {
        tracing::warn!(duplicates, "dropped duplicate patient records");
    }

    let imputed = impute(&mut unique, policy)?;

    let records = unique
        .into_iter()
        .map(|row| -> Result<PatientRecord> {
            let value = |measure: Measure| {
                row.values[measure as usize].ok_or(ForecastError::MissingValue {
                    record: row.line,
                    field: measure.name(),
                })
            };
            Ok(PatientRecord {
                patient_hash: hash_identifier(&row.patient_id),
                registration_date: row.date,
                age: value(Measure::Age)?,
                gender: row.gender,
                viral_load: value(Measure::ViralLoad)?,
                alt_level: value(Measure::AltLevel)?,
                follow_up_months: value(Measure::FollowUp)?,
                lost_to_follow_up: row.ltfu,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    tracing::info!(
        records = records.len(),
        duplicates,
        imputed,
        policy = ?policy,
        "cleaned patient records"
    );
    Ok(records)
}

/// Fill missing measures in place; returns how many values were filled.
fn impute(rows: &mut [ParsedRow], policy: ImputationPolicy) -> Result<usize> {
    if policy == ImputationPolicy::Reject {
        for row in rows.iter() {
            if let Some(measure) = Measure::ALL
                .into_iter()
                .find(|m| row.values[*m as usize].is_none())
            {
                return Err(ForecastError::MissingValue {
                    record: row.line,
                    field: measure.name(),
                });
            }
        }
        return Ok(0);
    }

    let mut filled = 0;
    for measure in Measure::ALL {
        let slot = measure as usize;
        let mut monthly: HashMap<NaiveDate, (f64, usize)> = HashMap::new();
        let mut overall = (0.0, 0usize);
        for row in rows.iter() {
            if let Some(value) = row.values[slot] {
                let entry = monthly.entry(month_start(row.date)).or_default();
                entry.0 += value;
                entry.1 += 1;
                overall.0 += value;
                overall.1 += 1;
            }
        }

        for row in rows.iter_mut().filter(|row| row.values[slot].is_none()) {
            let (sum, count) = monthly
                .get(&month_start(row.date))
                .copied()
                .filter(|(_, count)| *count > 0)
                .unwrap_or(overall);
            if count == 0 {
                return Err(ForecastError::MissingValue {
                    record: row.line,
                    field: measure.name(),
                });
            }
            row.values[slot] = Some(sum / count as f64);
            filled += 1;
        }
    }
    Ok(filled)
}

fn csv_error(err: csv::Error) -> ForecastError {
    ForecastError::Parse(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(line: usize, id: &str, date: &str, age: Option<&str>) -> RawPatientRow {
        RawPatientRow {
            line,
            patient_id: Some(id.to_string()),
            registration_date: Some(date.to_string()),
            age: age.map(str::to_string),
            gender: Some("F".to_string()),
            viral_load: Some("1200".to_string()),
            alt_level: Some("35".to_string()),
            follow_up_months: Some("6".to_string()),
            ltfu: Some("0".to_string()),
        }
    }

    #[test]
    fn accepted_date_layouts() {
        let expected = NaiveDate::from_ymd_opt(2021, 3, 14).unwrap();
        for text in [
            "2021-03-14",
            "2021/03/14",
            "14/03/2021",
            "2021-03-14T08:30:00Z",
            "2021-03-14 08:30:00",
        ] {
            assert_eq!(parse_date(text), Some(expected), "{text}");
        }
        assert_eq!(parse_date("2021-03"), NaiveDate::from_ymd_opt(2021, 3, 1));
        assert_eq!(parse_date("March 2021"), None);
    }

    #[test]
    fn malformed_date_names_the_record() {
        let err = clean_records(&[raw(7, "p1", "2021-13-40", Some("40"))], ImputationPolicy::Reject)
            .unwrap_err();
        assert_eq!(
            err,
            ForecastError::MalformedDate {
                record: 7,
                value: "2021-13-40".to_string()
            }
        );
    }

    #[test]
    fn exact_duplicates_keep_the_first() {
        let rows = vec![
            raw(2, "p1", "2021-01-05", Some("40")),
            raw(3, "p1", "2021-01-05", Some("40")),
            raw(4, "p1", "2021-01-05", Some("41")),
        ];
        let records = clean_records(&rows, ImputationPolicy::Reject).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].age, 40.0);
        assert_eq!(records[1].age, 41.0);
    }

    #[test]
    fn period_mean_prefers_the_same_month() {
        let rows = vec![
            raw(2, "a", "2021-01-05", Some("30")),
            raw(3, "b", "2021-01-20", Some("50")),
            raw(4, "c", "2021-01-28", None),
            raw(5, "d", "2021-02-02", None),
            raw(6, "e", "2021-03-02", Some("70")),
        ];
        let records = clean_records(&rows, ImputationPolicy::PeriodMean).unwrap();
        assert_eq!(records[2].age, 40.0);
        assert_eq!(records[3].age, 50.0);
        assert_eq!(rows[2].age, None);
    }

    #[test]
    fn reject_policy_fails_on_missing_values() {
        let rows = vec![raw(2, "a", "2021-01-05", Some("30")), raw(3, "b", "2021-01-06", None)];
        assert_eq!(
            clean_records(&rows, ImputationPolicy::Reject).unwrap_err(),
            ForecastError::MissingValue {
                record: 3,
                field: "age"
            }
        );
    }

    #[test]
    fn a_field_missing_everywhere_cannot_be_imputed() {
        let rows = vec![raw(2, "a", "2021-01-05", None)];
        assert!(matches!(
            clean_records(&rows, ImputationPolicy::PeriodMean),
            Err(ForecastError::MissingValue { field: "age", .. })
        ));
    }

    #[test]
    fn identifiers_are_hashed() {
        let records =
            clean_records(&[raw(2, "MRN-001", "2021-01-05", Some("30"))], ImputationPolicy::Reject)
                .unwrap();
        let hash = &records[0].patient_hash;
        assert!(hash.starts_with("sha256:"));
        assert_eq!(hash.len(), "sha256:".len() + 64);
        assert!(!hash.contains("MRN-001"));
        assert_eq!(hash, &hash_identifier(" MRN-001 "));
    }

    #[test]
    fn gender_and_ltfu_defaults() {
        let mut row = raw(2, "a", "2021-01-05", Some("30"));
        row.gender = None;
        row.ltfu = None;
        let records = clean_records(&[row], ImputationPolicy::Reject).unwrap();
        assert_eq!(records[0].gender, Gender::Unknown);
        assert!(!records[0].lost_to_follow_up);
    }

    #[test]
    fn bad_numbers_are_parse_errors() {
        let mut row = raw(9, "a", "2021-01-05", Some("thirty"));
        row.ltfu = None;
        let err = clean_records(&[row], ImputationPolicy::PeriodMean).unwrap_err();
        assert!(matches!(&err, ForecastError::Parse(msg) if msg.contains("record 9")));
    }

    #[test]
    fn json_values_of_any_scalar_type() {
        let rows = load_records_json(
            r#"[{"ID": 17, "Date": "2022-05", "age": 44.5, "sex": "m", "ALT": null, "ltfu": true}]"#,
        )
        .unwrap();
        assert_eq!(rows[0].patient_id.as_deref(), Some("17"));
        assert_eq!(rows[0].registration_date.as_deref(), Some("2022-05"));
        assert_eq!(rows[0].age.as_deref(), Some("44.5"));
        assert_eq!(rows[0].alt_level, None);
        assert_eq!(rows[0].ltfu.as_deref(), Some("true"));

        assert!(load_records_json(r#"{"id": 1}"#).is_err());
        assert!(load_records_json(r#"[{"id": [1]}]"#).is_err());
    }
}
