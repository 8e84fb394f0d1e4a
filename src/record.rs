// 🧾 Record Model - Values and raw records as received from a source
// Records are maps, not structs: one shape serves every entity

use crate::quality::QualityScore;
use crate::schema::FieldType;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Stored form: fractional seconds only when present, so text order is time order
pub const STORED_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

static NULL: Value = Value::Null;

// ============================================================================
// VALUE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Date(_) => "date",
            Value::Timestamp(_) => "timestamp",
        }
    }

    /// Numeric view; integers widen to floats
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            Value::Timestamp(ts) => Some(ts.date()),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            Value::Date(d) => d.and_hms_opt(0, 0, 0),
            _ => None,
        }
    }

    /// Position on the load timeline; dates map to midnight UTC
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.as_timestamp().map(|ts| ts.and_utc())
    }

    /// Parse a raw cell into the given type. Blank cells are null.
    pub fn parse(field_type: FieldType, raw: &str) -> Result<Value, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Value::Null);
        }

        match field_type {
            FieldType::String | FieldType::LargeText => Ok(Value::Text(raw.to_string())),
            FieldType::Float => trimmed
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| format!("'{}' is not a number", trimmed)),
            FieldType::Integer => {
                if let Ok(v) = trimmed.parse::<i64>() {
                    return Ok(Value::Integer(v));
                }
                // Providers often emit whole numbers as "1200.0"
                match trimmed.parse::<f64>() {
                    Ok(v) if v.fract() == 0.0 && v.is_finite() => {
                        // `as` saturates; refuse instead of storing i64::MAX
                        if v >= i64::MIN as f64 && v < i64::MAX as f64 {
                            Ok(Value::Integer(v as i64))
                        } else {
                            Err(format!("'{}' is out of integer range", trimmed))
                        }
                    }
                    _ => Err(format!("'{}' is not an integer", trimmed)),
                }
            }
            FieldType::Date => parse_date(trimmed)
                .map(Value::Date)
                .ok_or_else(|| format!("'{}' is not a date", trimmed)),
            FieldType::Timestamp => parse_timestamp(trimmed)
                .map(Value::Timestamp)
                .ok_or_else(|| format!("'{}' is not a timestamp", trimmed)),
        }
    }

    /// Owned SQLite value; dates and timestamps are stored as sortable text
    pub fn to_sql(&self) -> SqlValue {
        match self {
            Value::Null => SqlValue::Null,
            Value::Integer(v) => SqlValue::Integer(*v),
            Value::Float(v) => SqlValue::Real(*v),
            Value::Text(s) => SqlValue::Text(s.clone()),
            Value::Date(d) => SqlValue::Text(d.format(DATE_FORMAT).to_string()),
            Value::Timestamp(ts) => SqlValue::Text(ts.format(STORED_TIMESTAMP_FORMAT).to_string()),
        }
    }

    /// Read a warehouse cell back using the declared field type
    pub fn from_sql(field_type: FieldType, cell: ValueRef<'_>) -> Result<Value, String> {
        match cell {
            ValueRef::Null => Ok(Value::Null),
            ValueRef::Integer(i) => match field_type {
                FieldType::Float => Ok(Value::Float(i as f64)),
                _ => Ok(Value::Integer(i)),
            },
            ValueRef::Real(f) => Ok(Value::Float(f)),
            ValueRef::Text(bytes) => {
                let text = std::str::from_utf8(bytes).map_err(|e| e.to_string())?;
                Value::parse(field_type, text)
            }
            ValueRef::Blob(_) => Err("blob values are not supported".to_string()),
        }
    }
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .or_else(|_| NaiveDate::parse_from_str(s, "%m/%d/%Y"))
        .ok()
        .or_else(|| parse_timestamp(s).map(|ts| ts.date()))
}

pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for format in [TIMESTAMP_FORMAT, "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, format) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

// ============================================================================
// RAW RECORD
// ============================================================================

/// One entity instance as received from a source.
///
/// `ingested_at` is stamped when the record is built and never touched again.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawRecord {
    pub entity: String,
    pub fields: BTreeMap<String, Value>,
    pub source: String,
    pub ingested_at: DateTime<Utc>,
}

impl RawRecord {
    pub fn new(entity: impl Into<String>, source: impl Into<String>) -> Self {
        RawRecord {
            entity: entity.into(),
            fields: BTreeMap::new(),
            source: source.into(),
            ingested_at: Utc::now(),
        }
    }

    /// Builder: set a field (nulls are simply not stored)
    pub fn with(mut self, field: &str, value: Value) -> Self {
        self.set(field, value);
        self
    }

    pub fn with_ingested_at(mut self, at: DateTime<Utc>) -> Self {
        self.ingested_at = at;
        self
    }

    pub fn set(&mut self, field: &str, value: Value) {
        if value.is_null() {
            self.fields.remove(field);
        } else {
            self.fields.insert(field.to_string(), value);
        }
    }

    /// Field value, `Value::Null` when absent
    pub fn get(&self, field: &str) -> &Value {
        self.fields.get(field).unwrap_or(&NULL)
    }

    pub fn has(&self, field: &str) -> bool {
        !self.get(field).is_null()
    }

    /// Primary-key values in declared key order
    pub fn key_values(&self, primary_key: &[String]) -> Vec<Value> {
        primary_key.iter().map(|k| self.get(k).clone()).collect()
    }

    /// Human-readable key, e.g. "AAPL|2024-01-02"
    pub fn key_label(&self, primary_key: &[String]) -> String {
        primary_key
            .iter()
            .map(|k| match self.get(k).to_sql() {
                SqlValue::Text(s) => s,
                SqlValue::Integer(i) => i.to_string(),
                SqlValue::Real(f) => f.to_string(),
                _ => String::new(),
            })
            .collect::<Vec<_>>()
            .join("|")
    }

    /// Hash of everything an upsert would write except `ingested_at`.
    ///
    /// Two loads of the same content hash identically, which is how the
    /// loader tells a real update from a harmless re-delivery.
    pub fn content_hash(&self, quality_score: f64) -> String {
        let mut hasher = Sha256::new();
        let fields_json = serde_json::to_string(&self.fields).unwrap_or_default();
        hasher.update(format!(
            "{}|{}|{}|{:.6}",
            self.entity, fields_json, self.source, quality_score
        ));
        format!("{:x}", hasher.finalize())
    }
}

/// A raw record paired with the score computed for this load
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredRecord {
    pub record: RawRecord,
    pub score: QualityScore,
}

impl ScoredRecord {
    pub fn new(record: RawRecord, score: QualityScore) -> Self {
        ScoredRecord { record, score }
    }
}

// ============================================================================
// TESTS
// ============================================================================
