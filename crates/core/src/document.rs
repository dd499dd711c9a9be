use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rusqlite::types::ValueRef;
use serde_json::{json, Map, Number, Value};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::debug;

/// Per-document object carrying the source file and table.
pub const METADATA_KEY: &str = "_metadata";

/// Epoch seconds for 0001-01-01 and 9999-12-31, the range accepted when
/// normalizing timestamps.
const MIN_EPOCH_SECONDS: i64 = -62_135_596_800;
const MAX_EPOCH_SECONDS: i64 = 253_402_300_799;

/// One Elasticsearch document per database row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowDocument {
    pub id: String,
    pub fields: Map<String, Value>,
}

/// Column classification derived from the declared SQLite type. SQLite works
/// with type affinities rather than strict column types, so this drives value
/// normalization, not validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Real,
    Text,
    Numeric,
    DateTime,
    Unspecified,
}

pub fn column_kind(declared_type: &str) -> ColumnKind {
    let declared = declared_type.to_ascii_uppercase();
    // DATETIME and TIMESTAMP both contain TIME; plain DATE does not.
    if declared.contains("TIME") {
        ColumnKind::DateTime
    } else if declared.contains("INT") || declared.contains("BOOL") {
        ColumnKind::Integer
    } else if declared.contains("CHAR") || declared.contains("CLOB") || declared.contains("TEXT") {
        ColumnKind::Text
    } else if declared.is_empty() || declared.contains("BLOB") {
        ColumnKind::Unspecified
    } else if declared.contains("REAL") || declared.contains("FLOA") || declared.contains("DOUB") {
        ColumnKind::Real
    } else {
        ColumnKind::Numeric
    }
}

/// Elasticsearch field type for a declared SQLite column type. `None` leaves
/// the decision to Elasticsearch: with NUMERIC affinity the stored class is
/// unpredictable, so the engine has to look at the data itself.
pub fn es_type_for(declared_type: &str) -> Option<&'static str> {
    let declared = declared_type.to_ascii_uppercase();
    if declared.contains("BIGINT") {
        Some("long")
    } else if declared.contains("SMALLINT") {
        Some("integer")
    } else if declared.contains("TIME") {
        // DATETIME, TIMESTAMP and TIME; plain DATE stays dynamic.
        Some("date")
    } else if declared.contains("INT") {
        // TODO: use "integer" when the data is in range
        Some("long")
    } else if declared.contains("BOOL") {
        Some("boolean")
    } else if declared.contains("CHAR") || declared.contains("CLOB") || declared.contains("TEXT") {
        Some("text")
    } else if declared.contains("FLOA") {
        Some("float")
    } else if declared.contains("REAL") || declared.contains("DOUB") {
        Some("double")
    } else {
        None
    }
}

/// Elasticsearch `properties` object for a table schema. Columns without a
/// predictable type are left out and mapped dynamically.
pub fn table_mapping(schema: &[crate::db::ColumnInfo]) -> Value {
    let mut properties = Map::new();
    for column in schema {
        if let Some(es_type) = es_type_for(&column.declared_type) {
            properties.insert(column.name.clone(), json!({ "type": es_type }));
        }
    }
    Value::Object(properties)
}

/// Stable document identity so re-indexing the same row overwrites instead of
/// duplicating.
pub fn document_id(db_path: &str, table: &str, row_id: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{db_path}:{table}:{row_id}").as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Finish a document: drop references to local paths and attach the source
/// metadata.
pub fn build_document(
    db_path: &str,
    table: &str,
    fields: Map<String, Value>,
) -> Map<String, Value> {
    let mut document: Map<String, Value> = fields
        .into_iter()
        .filter(|(_, value)| !is_local_path_reference(value))
        .collect();

    document.insert(
        METADATA_KEY.to_string(),
        json!({
            "filename": db_path,
            "table": table,
        }),
    );
    document
}

fn is_local_path_reference(value: &Value) -> bool {
    value
        .as_str()
        .and_then(|text| text.strip_prefix("file://"))
        .is_some_and(|path| Path::new(path).exists())
}

/// Normalize a raw SQLite value for indexing. `None` drops the column from
/// the document (binary data has no meaningful text representation).
pub fn coerce_value(kind: ColumnKind, value: ValueRef<'_>) -> Option<Value> {
    match value {
        ValueRef::Null => Some(Value::Null),
        ValueRef::Blob(_) => None,
        ValueRef::Integer(integer) => Some(match kind {
            ColumnKind::DateTime => integer_to_datetime(integer),
            ColumnKind::Numeric => Value::String(integer.to_string()),
            _ => json!(integer),
        }),
        ValueRef::Real(real) => Some(match kind {
            ColumnKind::DateTime => float_to_datetime(real),
            ColumnKind::Numeric => Value::String(real.to_string()),
            _ => Number::from_f64(real).map(Value::Number).unwrap_or(Value::Null),
        }),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            Some(match kind {
                ColumnKind::Integer => integer_from_text(&text),
                ColumnKind::DateTime => text_to_datetime(&text),
                _ => Value::String(text),
            })
        }
    }
}

/// Integer-affinity text values: numeric strings pass through, date strings
/// become epoch seconds, anything else becomes null.
fn integer_from_text(text: &str) -> Value {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(integer) = trimmed.parse::<i64>() {
        return json!(integer);
    }
    if let Some(parsed) = parse_datetime_text(trimmed) {
        return json!(parsed.and_utc().timestamp());
    }
    debug!(value = trimmed, "unparseable integer value");
    Value::Null
}

/// Epoch integers in seconds, milliseconds or microseconds become ISO-8601
/// strings; out-of-range values become null.
fn integer_to_datetime(timestamp: i64) -> Value {
    let seconds = if timestamp.unsigned_abs() >= 100_000_000_000_000 {
        timestamp / 1_000_000
    } else if timestamp.unsigned_abs() >= 100_000_000_000 {
        timestamp / 1_000
    } else {
        timestamp
    };

    if !(MIN_EPOCH_SECONDS..=MAX_EPOCH_SECONDS).contains(&seconds) {
        debug!(timestamp, "timestamp out of range");
        return Value::Null;
    }

    match DateTime::from_timestamp(seconds, 0) {
        Some(datetime) => Value::String(format_datetime(datetime.naive_utc())),
        None => Value::Null,
    }
}

fn float_to_datetime(seconds: f64) -> Value {
    if !seconds.is_finite() {
        return Value::Null;
    }
    integer_to_datetime(seconds as i64)
}

fn text_to_datetime(text: &str) -> Value {
    match parse_datetime_text(text.trim()) {
        Some(datetime) => Value::String(format_datetime(datetime)),
        None => {
            debug!(value = text, "unparseable datetime value");
            Value::Null
        }
    }
}

fn parse_datetime_text(text: &str) -> Option<NaiveDateTime> {
    if let Ok(datetime) = DateTime::parse_from_rfc3339(text) {
        return Some(datetime.naive_utc());
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(text, format) {
            return Some(datetime);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

fn format_datetime(datetime: NaiveDateTime) -> String {
    datetime.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
}
