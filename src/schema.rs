// 📐 Schema Registry - Entity shapes for the raw layer
// Declares fields, primary keys, required fields and value constraints per entity

use crate::error::{PipelineError, Result};
use crate::record::{RawRecord, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// FIELD TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Float,
    Integer,
    Date,
    Timestamp,
    LargeText,
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Float => "float",
            FieldType::Integer => "integer",
            FieldType::Date => "date",
            FieldType::Timestamp => "timestamp",
            FieldType::LargeText => "large_text",
        }
    }

    /// SQLite column affinity used for warehouse tables
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldType::Float => "REAL",
            FieldType::Integer => "INTEGER",
            FieldType::String | FieldType::LargeText | FieldType::Date | FieldType::Timestamp => {
                "TEXT"
            }
        }
    }

    /// Coerce a value into this type, or explain why it does not fit.
    ///
    /// Text is re-parsed for typed fields so connectors may hand over raw cells.
    pub fn coerce(&self, value: &Value) -> std::result::Result<Value, String> {
        match (self, value) {
            (_, Value::Null) => Ok(Value::Null),
            (FieldType::String | FieldType::LargeText, Value::Text(_)) => Ok(value.clone()),
            (FieldType::Float, Value::Float(_)) => Ok(value.clone()),
            (FieldType::Float, Value::Integer(i)) => Ok(Value::Float(*i as f64)),
            (FieldType::Integer, Value::Integer(_)) => Ok(value.clone()),
            (FieldType::Date, Value::Date(_)) => Ok(value.clone()),
            (FieldType::Timestamp, Value::Timestamp(_)) => Ok(value.clone()),
            (FieldType::Timestamp, Value::Date(d)) => d
                .and_hms_opt(0, 0, 0)
                .map(Value::Timestamp)
                .ok_or_else(|| format!("cannot widen {} to a timestamp", d)),
            (_, Value::Text(raw)) => Value::parse(*self, raw),
            (_, other) => Err(format!(
                "expected {}, got {}",
                self.name(),
                other.type_name()
            )),
        }
    }
}

// ============================================================================
// FIELD DEFINITION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub type_: FieldType,
    pub description: String,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, type_: FieldType) -> Self {
        FieldDefinition {
            name: name.into(),
            type_,
            description: String::new(),
        }
    }

    /// Builder: add description
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }
}

// ============================================================================
// CONSTRAINTS
// ============================================================================

/// Logical value constraint. Violations lower the quality score; they never
/// reject a record at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constraint {
    /// field >= 0
    NonNegative { field: String },
    /// field >= other (e.g. high >= low)
    AtLeast { field: String, other: String },
    /// low <= field <= high
    WithinRange {
        field: String,
        low: String,
        high: String,
    },
}

impl Constraint {
    pub fn non_negative(field: &str) -> Self {
        Constraint::NonNegative {
            field: field.to_string(),
        }
    }

    pub fn at_least(field: &str, other: &str) -> Self {
        Constraint::AtLeast {
            field: field.to_string(),
            other: other.to_string(),
        }
    }

    pub fn within_range(field: &str, low: &str, high: &str) -> Self {
        Constraint::WithinRange {
            field: field.to_string(),
            low: low.to_string(),
            high: high.to_string(),
        }
    }

    /// Stable name used as the key in the deduction table
    pub fn name(&self) -> String {
        match self {
            Constraint::NonNegative { field } => format!("{}_non_negative", field),
            Constraint::AtLeast { field, other } => format!("{}_gte_{}", field, other),
            Constraint::WithinRange { field, .. } => format!("{}_within_range", field),
        }
    }

    /// `None` when an operand is absent; missing values are scored separately.
    pub fn check(&self, record: &RawRecord) -> Option<bool> {
        match self {
            Constraint::NonNegative { field } => record.get(field).as_f64().map(|v| v >= 0.0),
            Constraint::AtLeast { field, other } => {
                let value = record.get(field).as_f64()?;
                let floor = record.get(other).as_f64()?;
                Some(value >= floor)
            }
            Constraint::WithinRange { field, low, high } => {
                let value = record.get(field).as_f64()?;
                let low = record.get(low).as_f64()?;
                let high = record.get(high).as_f64()?;
                Some(value >= low && value <= high)
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Constraint::NonNegative { field } => format!("{} must not be negative", field),
            Constraint::AtLeast { field, other } => {
                format!("{} must be greater than or equal to {}", field, other)
            }
            Constraint::WithinRange { field, low, high } => {
                format!("{} must lie between {} and {}", field, low, high)
            }
        }
    }
}

// ============================================================================
// ENTITY SCHEMA
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySchema {
    pub name: String,
    pub fields: Vec<FieldDefinition>,
    pub primary_key: Vec<String>,
    pub required: Vec<String>,
    pub constraints: Vec<Constraint>,
    /// Field whose maximum becomes the incremental cursor after a load
    pub watermark: Option<String>,
}

impl EntitySchema {
    pub fn new(name: impl Into<String>) -> Self {
        EntitySchema {
            name: name.into(),
            fields: Vec::new(),
            primary_key: Vec::new(),
            required: Vec::new(),
            constraints: Vec::new(),
            watermark: None,
        }
    }

    /// Builder: append a field
    pub fn with_field(mut self, name: &str, type_: FieldType) -> Self {
        self.fields.push(FieldDefinition::new(name, type_));
        self
    }

    /// Builder: append a field with a description
    pub fn with_described_field(mut self, name: &str, type_: FieldType, desc: &str) -> Self {
        self.fields
            .push(FieldDefinition::new(name, type_).with_description(desc));
        self
    }

    pub fn with_primary_key(mut self, fields: &[&str]) -> Self {
        self.primary_key = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_required(mut self, fields: &[&str]) -> Self {
        self.required = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn with_watermark(mut self, field: &str) -> Self {
        self.watermark = Some(field.to_string());
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_primary_key(&self, name: &str) -> bool {
        self.primary_key.iter().any(|k| k == name)
    }

    pub fn raw_table(&self) -> String {
        format!("raw_{}", self.name)
    }

    pub fn staging_table(&self) -> String {
        format!("stg_{}", self.name)
    }

    /// Check the record's shape and return a copy with every value coerced
    /// to its declared type.
    ///
    /// Hard violations only: wrong entity, unknown field, wrong type, or a
    /// missing primary-key value. Missing required fields are a quality
    /// concern and pass through.
    pub fn conform(&self, record: &RawRecord) -> std::result::Result<RawRecord, Vec<PipelineError>> {
        let mut errors = Vec::new();

        if record.entity != self.name {
            errors.push(PipelineError::schema(
                &self.name,
                "<entity>",
                format!("record belongs to entity '{}'", record.entity),
            ));
        }

        for name in record.fields.keys() {
            if self.field(name).is_none() {
                errors.push(PipelineError::schema(&self.name, name, "unknown field"));
            }
        }

        let mut fields = BTreeMap::new();
        for def in &self.fields {
            let raw = record.get(&def.name);
            match def.type_.coerce(raw) {
                Ok(value) => {
                    if value.is_null() && self.is_primary_key(&def.name) {
                        errors.push(PipelineError::schema(
                            &self.name,
                            &def.name,
                            "primary key value is missing",
                        ));
                    }
                    if !value.is_null() {
                        fields.insert(def.name.clone(), value);
                    }
                }
                Err(message) => errors.push(PipelineError::schema(&self.name, &def.name, message)),
            }
        }

        if record.source.trim().is_empty() {
            errors.push(PipelineError::schema(&self.name, "source", "provenance is empty"));
        }

        if errors.is_empty() {
            Ok(RawRecord {
                entity: record.entity.clone(),
                fields,
                source: record.source.clone(),
                ingested_at: record.ingested_at,
            })
        } else {
            Err(errors)
        }
    }
}

// ============================================================================
// SCHEMA REGISTRY
// ============================================================================

/// Catalog of every entity the pipeline knows about.
///
/// Built once per run and shared read-only, so schemas cannot drift while a
/// load or transform is in flight.
pub struct SchemaRegistry {
    schemas: BTreeMap<String, EntitySchema>,
}

impl SchemaRegistry {
    /// Registry holding the four core financial entities
    pub fn new() -> Self {
        let mut registry = SchemaRegistry::empty();
        registry.register_core_entities();
        registry
    }

    pub fn empty() -> Self {
        SchemaRegistry {
            schemas: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, schema: EntitySchema) {
        self.schemas.insert(schema.name.clone(), schema);
    }

    /// Look up an entity; unknown names abort the run before any write
    pub fn get(&self, name: &str) -> Result<&EntitySchema> {
        self.schemas.get(name).ok_or_else(|| {
            PipelineError::config(format!(
                "unknown entity '{}' (known: {})",
                name,
                self.names().join(", ")
            ))
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.schemas.keys().cloned().collect()
    }

    pub fn schemas(&self) -> impl Iterator<Item = &EntitySchema> {
        self.schemas.values()
    }

    fn register_core_entities(&mut self) {
        // ====================================================================
        // DAILY PRICES
        // ====================================================================
        self.register(
            EntitySchema::new("stock_prices")
                .with_described_field("ticker", FieldType::String, "Instrument symbol")
                .with_described_field("date", FieldType::Date, "Trading day")
                .with_field("open", FieldType::Float)
                .with_field("high", FieldType::Float)
                .with_field("low", FieldType::Float)
                .with_field("close", FieldType::Float)
                .with_field("volume", FieldType::Integer)
                .with_field("dividends", FieldType::Float)
                .with_field("stock_splits", FieldType::Float)
                .with_primary_key(&["ticker", "date"])
                .with_required(&["open", "high", "low", "close"])
                .with_constraint(Constraint::at_least("high", "low"))
                .with_constraint(Constraint::within_range("open", "low", "high"))
                .with_constraint(Constraint::within_range("close", "low", "high"))
                .with_constraint(Constraint::non_negative("volume"))
                .with_watermark("date"),
        );

        // ====================================================================
        // FUNDAMENTALS
        // ====================================================================
        self.register(
            EntitySchema::new("fundamentals")
                .with_field("ticker", FieldType::String)
                .with_described_field("fiscal_quarter", FieldType::String, "e.g. 'Q4 2024'")
                .with_field("market_cap", FieldType::Float)
                .with_field("revenue", FieldType::Float)
                .with_field("net_income", FieldType::Float)
                .with_field("eps", FieldType::Float)
                .with_field("pe_ratio", FieldType::Float)
                .with_field("profit_margin", FieldType::Float)
                .with_field("debt_to_equity", FieldType::Float)
                .with_field("total_assets", FieldType::Float)
                .with_field("total_liabilities", FieldType::Float)
                .with_primary_key(&["ticker", "fiscal_quarter"])
                .with_required(&["revenue"])
                .with_constraint(Constraint::non_negative("revenue"))
                .with_constraint(Constraint::non_negative("market_cap")),
        );

        // ====================================================================
        // NEWS
        // ====================================================================
        self.register(
            EntitySchema::new("news")
                .with_field("article_id", FieldType::String)
                .with_field("ticker", FieldType::String)
                .with_described_field("title", FieldType::String, "Headline")
                .with_field("description", FieldType::LargeText)
                .with_field("content", FieldType::LargeText)
                .with_field("author", FieldType::String)
                .with_field("source_name", FieldType::String)
                .with_field("url", FieldType::String)
                .with_field("published_at", FieldType::Timestamp)
                .with_primary_key(&["article_id"])
                .with_required(&["title", "url", "published_at"])
                .with_watermark("published_at"),
        );

        // ====================================================================
        // REGULATORY FILINGS (XBRL facts)
        // ====================================================================
        self.register(
            EntitySchema::new("sec_filings")
                .with_field("ticker", FieldType::String)
                .with_field("cik", FieldType::String)
                .with_described_field("concept", FieldType::String, "us-gaap concept name")
                .with_field("label", FieldType::String)
                .with_field("period_start", FieldType::Date)
                .with_field("period_end", FieldType::Date)
                .with_field("value", FieldType::Float)
                .with_field("unit", FieldType::String)
                .with_field("fiscal_year", FieldType::Integer)
                .with_described_field("fiscal_period", FieldType::String, "Q1..Q3 or FY")
                .with_field("form_type", FieldType::String)
                .with_field("filed_date", FieldType::Date)
                .with_field("accession_no", FieldType::String)
                .with_primary_key(&["ticker", "concept", "period_end", "fiscal_period"])
                .with_required(&["value"])
                .with_watermark("filed_date"),
        );
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn price(ticker: &str) -> RawRecord {
        RawRecord::new("stock_prices", "yahoo_finance")
            .with("ticker", Value::Text(ticker.to_string()))
            .with("date", Value::Text("2024-01-02".to_string()))
            .with("close", Value::Integer(103))
            .with("high", Value::Float(104.0))
            .with("low", Value::Float(99.5))
    }

    #[test]
    fn test_core_entities_registered() {
        let registry = SchemaRegistry::new();
        assert_eq!(
            registry.names(),
            vec!["fundamentals", "news", "sec_filings", "stock_prices"]
        );
        let prices = registry.get("stock_prices").unwrap();
        assert_eq!(prices.primary_key, vec!["ticker", "date"]);
        assert_eq!(prices.raw_table(), "raw_stock_prices");
    }

    #[test]
    fn test_unknown_entity_is_fatal() {
        let registry = SchemaRegistry::new();
        let err = registry.get("options_chain").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_conform_coerces_types() {
        let registry = SchemaRegistry::new();
        let schema = registry.get("stock_prices").unwrap();

        let conformed = schema.conform(&price("AAPL")).unwrap();
        assert_eq!(
            conformed.get("date"),
            &Value::Date(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap())
        );
        assert_eq!(conformed.get("close"), &Value::Float(103.0));
    }

    #[test]
    fn test_conform_rejects_missing_primary_key() {
        let registry = SchemaRegistry::new();
        let schema = registry.get("stock_prices").unwrap();

        let mut record = price("AAPL");
        record.fields.remove("ticker");

        let errors = schema.conform(&record).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("ticker"));
    }

    #[test]
    fn test_conform_rejects_wrong_type_and_unknown_field() {
        let registry = SchemaRegistry::new();
        let schema = registry.get("stock_prices").unwrap();

        let record = price("AAPL")
            .with("volume", Value::Text("lots".to_string()))
            .with("sector", Value::Text("Tech".to_string()));

        let errors = schema.conform(&record).unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_missing_required_field_is_not_a_schema_violation() {
        let registry = SchemaRegistry::new();
        let schema = registry.get("stock_prices").unwrap();

        let mut record = price("AAPL");
        record.fields.remove("close");
        assert!(schema.conform(&record).is_ok());
    }

    #[test]
    fn test_constraint_checks() {
        let high_low = Constraint::at_least("high", "low");
        let record = price("AAPL");
        assert_eq!(high_low.check(&record), Some(true));
        assert_eq!(high_low.name(), "high_gte_low");

        let inverted = record.clone().with("low", Value::Float(120.0));
        assert_eq!(high_low.check(&inverted), Some(false));

        let volume = Constraint::non_negative("volume");
        assert_eq!(volume.check(&record), None);
        assert_eq!(
            volume.check(&record.with("volume", Value::Integer(-5))),
            Some(false)
        );
    }
}
