//! Row shaping between storage and the API.
//!
//! Outgoing rows hide password columns and render dates as `dd-mm-yyyy`
//! (`dd-mm-yyyy HH:MM` for datetimes). Incoming dates accept the same
//! display form or ISO-8601.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;

use super::types::{EntityDefinition, FieldType};

const DATE_DISPLAY: &str = "%d-%m-%Y";
const DATETIME_DISPLAY: &str = "%d-%m-%Y %H:%M";

/// Storage format written back to the database.
pub const DATE_STORAGE: &str = "%Y-%m-%d";
pub const DATETIME_STORAGE: &str = "%Y-%m-%d %H:%M:%S";

/// Apply output casts to one row of `def`.
pub fn shape_row(def: &EntityDefinition, row: &mut Value) {
    let Some(obj) = row.as_object_mut() else {
        return;
    };

    for field in &def.fields {
        match field.field_type {
            FieldType::Password => {
                obj.remove(&field.key);
            }
            FieldType::Date | FieldType::Datetime => {
                let display = match obj.get(&field.key) {
                    Some(Value::String(raw)) => display_value(raw, field.field_type),
                    _ => None,
                };
                if let Some(display) = display {
                    obj.insert(field.key.clone(), Value::String(display));
                }
            }
            _ => {}
        }
    }
}

pub fn shape_rows(def: &EntityDefinition, rows: &mut [Value]) {
    for row in rows {
        shape_row(def, row);
    }
}

/// Render a stored date or timestamp in display format.
pub fn display_value(raw: &str, field_type: FieldType) -> Option<String> {
    match field_type {
        FieldType::Date => parse_stored(raw)
            .map(|dt| dt.date())
            .or_else(|| NaiveDate::parse_from_str(raw, DATE_STORAGE).ok())
            .map(|d| d.format(DATE_DISPLAY).to_string()),
        FieldType::Datetime => parse_stored(raw).map(|dt| dt.format(DATETIME_DISPLAY).to_string()),
        _ => None,
    }
}

/// Timestamps as produced by `row_to_json`: with or without offset.
fn parse_stored(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
}

/// Parse a submitted date: `dd-mm-yyyy` or `yyyy-mm-dd` (a time part is
/// ignored).
pub fn parse_date_input(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, DATE_DISPLAY)
        .or_else(|_| NaiveDate::parse_from_str(raw, DATE_STORAGE))
        .ok()
        .or_else(|| parse_datetime_input(raw).map(|dt| dt.date()))
}

/// Parse a submitted datetime in display or ISO-8601 form. A bare date
/// means midnight.
pub fn parse_datetime_input(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    const FORMATS: [&str; 6] = [
        "%d-%m-%Y %H:%M",
        "%d-%m-%Y %H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
    ];

    FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.naive_local()))
        .or_else(|| {
            NaiveDate::parse_from_str(raw, DATE_DISPLAY)
                .or_else(|_| NaiveDate::parse_from_str(raw, DATE_STORAGE))
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}
