//! Strip direct identifiers from a patient CSV before it leaves the clinic.

use std::io::{Read, Write};

use csv::StringRecord;
use hepcast_core::{ForecastError, Result};
use serde::Serialize;

use crate::{csv_error, hash_identifier};

/// Columns whose values are blanked.
pub const PHI_COLUMNS: [&str; 5] = ["name", "email", "phone", "ssn", "mrn"];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnonymizeSummary {
    pub rows: usize,
    pub blanked_columns: Vec<String>,
    /// Whether a `patient_id` column was replaced by `patient_hash`.
    pub hashed_identifier: bool,
}

/// Copy a patient CSV, blanking PHI columns and replacing `patient_id` with
/// a trailing `patient_hash` column. Other columns pass through unchanged.
pub fn anonymize_patient_csv<R: Read, W: Write>(reader: R, writer: W) -> Result<AnonymizeSummary> {
    let mut input = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .from_reader(reader);
    let headers = input.headers().map_err(csv_error)?.clone();

    let blanked: Vec<usize> = headers
        .iter()
        .enumerate()
        .filter(|(_, name)| PHI_COLUMNS.iter().any(|phi| name.eq_ignore_ascii_case(phi)))
        .map(|(index, _)| index)
        .collect();
    let id_column = headers
        .iter()
        .position(|name| name.eq_ignore_ascii_case("patient_id"));

    let mut out_headers: StringRecord = headers
        .iter()
        .enumerate()
        .filter(|(index, _)| Some(*index) != id_column)
        .map(|(_, name)| name)
        .collect();
    if id_column.is_some() {
        out_headers.push_field("patient_hash");
    }

    let mut output = csv::Writer::from_writer(writer);
    output.write_record(&out_headers).map_err(csv_error)?;

    let mut rows = 0;
    for record in input.records() {
        let record = record.map_err(csv_error)?;
        let mut out: StringRecord = record
            .iter()
            .enumerate()
            .filter(|(index, _)| Some(*index) != id_column)
            .map(|(index, value)| if blanked.contains(&index) { "" } else { value })
            .collect();
        if let Some(column) = id_column {
            let id = record.get(column).unwrap_or_default().trim();
            if id.is_empty() {
                out.push_field("");
            } else {
                out.push_field(&hash_identifier(id));
            }
        }
        output.write_record(&out).map_err(csv_error)?;
        rows += 1;
    }
    output
        .flush()
        .map_err(|err| ForecastError::Parse(err.to_string()))?;

    let summary = AnonymizeSummary {
        rows,
        blanked_columns: blanked
            .iter()
            .map(|&index| headers[index].to_string())
            .collect(),
        hashed_identifier: id_column.is_some(),
    };
    tracing::info!(
        rows = summary.rows,
        blanked = summary.blanked_columns.len(),
        hashed = summary.hashed_identifier,
        "anonymized patient CSV"
    );
    Ok(summary)
}
