use std::fs::{self, File};

use chrono::NaiveDate;
use hepcast_core::{build_feature_table, FeatureConfig, ForecastError, Gender, ImputationPolicy};
use hepcast_records::{
    anonymize_patient_csv, clean_records, forecast_rolling_errors, hash_identifier,
    load_records_csv, read_forecast_csv, read_monthly_forecast_csv,
};

fn fixture_path(name: &str) -> String {
    format!("{}/tests/data/{name}", env!("CARGO_MANIFEST_DIR"))
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[test]
fn cohort_export_is_cleaned() {
    let file = File::open(fixture_path("cohort.csv")).expect("cohort fixture is readable");
    let raw = load_records_csv(file).expect("cohort fixture loads");
    assert_eq!(raw.len(), 8);
    assert_eq!(raw[0].line, 2);

    let records = clean_records(&raw, ImputationPolicy::PeriodMean).expect("cohort cleans");
    assert_eq!(records.len(), 7, "one exact duplicate is dropped");

    let dates: Vec<NaiveDate> = records.iter().map(|r| r.registration_date).collect();
    assert_eq!(
        dates,
        vec![
            date(2021, 1, 4),
            date(2021, 1, 18),
            date(2021, 1, 22),
            date(2021, 1, 1),
            date(2021, 3, 2),
            date(2021, 3, 15),
            date(2021, 3, 28),
        ]
    );

    assert!((records[1].viral_load - 7400.0 / 3.0).abs() < 1e-9);
    assert!((records[2].alt_level - 109.0 / 3.0).abs() < 1e-9);
    assert_eq!(records[5].age, 49.0);
    assert_eq!(records[6].follow_up_months, 2.5);

    assert_eq!(records[4].gender, Gender::Unknown);
    assert_eq!(records[5].gender, Gender::Female);
    assert!(records[2].lost_to_follow_up);
    assert!(records[4].lost_to_follow_up);
    assert!(!records[3].lost_to_follow_up);

    assert_eq!(records[0].patient_hash, hash_identifier("P001"));
    assert!(records.iter().all(|r| r.patient_hash.starts_with("sha256:")));
}

#[test]
fn cleaned_cohort_fills_empty_months() {
    let file = File::open(fixture_path("cohort.csv")).expect("cohort fixture is readable");
    let raw = load_records_csv(file).expect("cohort fixture loads");
    let records = clean_records(&raw, ImputationPolicy::PeriodMean).expect("cohort cleans");

    let rows = build_feature_table(&records, &FeatureConfig::default()).expect("features build");
    let counts: Vec<f64> = rows.iter().map(|row| row.patient_count).collect();
    assert_eq!(counts, vec![4.0, 0.0, 3.0]);
    assert_eq!(rows[1].period, date(2021, 2, 1));
}

#[test]
fn reject_policy_stops_at_first_gap() {
    let file = File::open(fixture_path("cohort.csv")).expect("cohort fixture is readable");
    let raw = load_records_csv(file).expect("cohort fixture loads");
    let err = clean_records(&raw, ImputationPolicy::Reject).unwrap_err();
    assert_eq!(
        err,
        ForecastError::MissingValue {
            record: 3,
            field: "viral_load"
        }
    );
}

#[test]
fn malformed_date_is_fatal() {
    let file = File::open(fixture_path("cohort_bad_date.csv")).expect("fixture is readable");
    let raw = load_records_csv(file).expect("fixture loads");
    let err = clean_records(&raw, ImputationPolicy::PeriodMean).unwrap_err();
    assert_eq!(
        err,
        ForecastError::MalformedDate {
            record: 3,
            value: "sometime in 2021".to_string()
        }
    );
    assert!(err.is_data_quality());
}

#[test]
fn forecast_csv_with_actuals_gives_rolling_errors() {
    let file = File::open(fixture_path("forecast_with_actuals.csv")).expect("fixture is readable");
    let rows = read_forecast_csv(file).expect("forecast CSV normalizes");
    assert_eq!(rows.first().map(|r| r.date), Some(date(2024, 1, 1)));
    assert_eq!(rows[1].actual, None);

    let rolling = forecast_rolling_errors(&rows, 7);
    let mae: Vec<Option<f64>> = rolling.iter().map(|r| r.mae).collect();
    assert_eq!(mae, vec![Some(2.0), Some(2.0), Some(1.5), Some(2.0)]);
    let last_rmse = rolling[3].rmse.expect("last window has actuals");
    assert!((last_rmse - (14.0f64 / 3.0).sqrt()).abs() < 1e-12);
}

#[test]
fn monthly_forecast_export_is_normalized() {
    let file = File::open(fixture_path("monthly_forecast_2025_2029.csv"))
        .expect("fixture is readable");
    let rows = read_monthly_forecast_csv(file).expect("monthly forecast normalizes");

    let dates: Vec<NaiveDate> = rows.iter().map(|r| r.date).collect();
    assert_eq!(dates, vec![date(2025, 1, 1), date(2025, 2, 1), date(2025, 3, 1)]);
    let actuals: Vec<Option<f64>> = rows.iter().map(|r| r.actual).collect();
    assert_eq!(actuals, vec![Some(9.0), Some(13.0), None]);

    // Medians 10, 12, 14 have a sample deviation of 2.
    assert_eq!((rows[0].pi80_low, rows[0].pi80_high), (8.0, 12.0));
    assert_eq!((rows[2].pi95_low, rows[2].pi95_high), (10.0, 18.0));

    let rolling = forecast_rolling_errors(&rows, 7);
    assert_eq!(rolling[1].mae, Some(1.0));
}

#[test]
fn patient_phi_is_removed() {
    let input = fs::read(fixture_path("patients_phi.csv")).expect("fixture is readable");
    let mut output = Vec::new();
    let summary = anonymize_patient_csv(input.as_slice(), &mut output).expect("anonymizes");
    let text = String::from_utf8(output).expect("utf-8 output");

    assert_eq!(summary.rows, 2);
    assert_eq!(summary.blanked_columns.len(), 5);
    assert_eq!(
        text.lines().next(),
        Some("name,email,phone,ssn,mrn,age,gender,patient_hash")
    );
    for secret in ["Alice", "alice@example.org", "555-0100", "123-45-6789", "MRN-77", "P001"] {
        assert!(!text.contains(secret), "{secret} leaked");
    }
    assert!(text.contains(&hash_identifier("P002")));
}
