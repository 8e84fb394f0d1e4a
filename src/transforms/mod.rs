// 🔧 Transformation Layer - raw rows → validated staging rows
//
// One transform per entity kind, dispatched through a registry keyed by
// entity name. Every transform is a pure function of (raw rows, context):
// same input and same `as_of` give the same output.

pub mod filings;
pub mod fundamentals;
pub mod news;
pub mod prices;

use crate::config::TransformConfig;
use crate::error::{PipelineError, Result};
use crate::record::{ScoredRecord, Value};
use crate::schema::{FieldDefinition, FieldType};
use crate::sentiment::{KeywordSentiment, SentimentClassifier};
use chrono::{DateTime, Months, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

// ============================================================================
// STAGING RECORD
// ============================================================================

/// Derived row headed for `stg_<entity>`. Raw fields plus computed ones.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagingRecord {
    pub entity: String,
    pub fields: BTreeMap<String, Value>,
    pub source: String,
    pub ingested_at: DateTime<Utc>,
    pub quality_score: f64,
    pub is_valid: bool,
}

impl StagingRecord {
    /// Start from a raw row; derived fields are added by the transform
    pub fn from_raw(raw: &ScoredRecord) -> Self {
        StagingRecord {
            entity: raw.record.entity.clone(),
            fields: raw.record.fields.clone(),
            source: raw.record.source.clone(),
            ingested_at: raw.record.ingested_at,
            quality_score: raw.score.value(),
            is_valid: false,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).filter(|v| !v.is_null())
    }

    pub fn set(&mut self, field: &str, value: Value) {
        if value.is_null() {
            self.fields.remove(field);
        } else {
            self.fields.insert(field.to_string(), value);
        }
    }

    pub fn number(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(Value::as_f64)
    }
}

/// Valid rows only; invalid ones are counted and dropped
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransformOutput {
    pub records: Vec<StagingRecord>,
    pub invalid: usize,
}

impl TransformOutput {
    /// Keep the row if valid, otherwise count it
    pub fn push(&mut self, mut record: StagingRecord, valid: bool) {
        if valid {
            record.is_valid = true;
            self.records.push(record);
        } else {
            self.invalid += 1;
        }
    }
}

// ============================================================================
// CONTEXT
// ============================================================================

/// Everything a transform may depend on besides its input rows
#[derive(Clone)]
pub struct TransformContext {
    /// Reference instant for recency windows
    pub as_of: DateTime<Utc>,
    pub recency_months: BTreeMap<String, u32>,
    pub annual_sentinel: String,
    pub sentiment: Arc<dyn SentimentClassifier>,
}

impl TransformContext {
    pub fn from_config(config: &TransformConfig, as_of: DateTime<Utc>) -> Self {
        TransformContext {
            as_of,
            recency_months: config.recency_months.clone(),
            annual_sentinel: config.annual_period_sentinel.clone(),
            sentiment: Arc::new(KeywordSentiment::from_keywords(&config.sentiment)),
        }
    }

    /// Builder: swap the sentiment classifier
    pub fn with_sentiment(mut self, classifier: Arc<dyn SentimentClassifier>) -> Self {
        self.sentiment = classifier;
        self
    }

    /// Oldest instant still inside the entity's recency window
    pub fn recency_cutoff(&self, entity: &str) -> DateTime<Utc> {
        let months = self
            .recency_months
            .get(entity)
            .copied()
            .unwrap_or(crate::config::DEFAULT_RECENCY_MONTHS);
        self.as_of
            .checked_sub_months(Months::new(months))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl std::fmt::Debug for TransformContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformContext")
            .field("as_of", &self.as_of)
            .field("recency_months", &self.recency_months)
            .field("annual_sentinel", &self.annual_sentinel)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ENTITY KINDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Prices,
    Fundamentals,
    News,
    Filings,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Prices,
        EntityKind::Fundamentals,
        EntityKind::News,
        EntityKind::Filings,
    ];

    pub fn entity_name(&self) -> &'static str {
        match self {
            EntityKind::Prices => "stock_prices",
            EntityKind::Fundamentals => "fundamentals",
            EntityKind::News => "news",
            EntityKind::Filings => "sec_filings",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.entity_name() == name)
    }

    /// Columns the transform adds on top of the raw fields
    pub fn derived_fields(&self) -> Vec<FieldDefinition> {
        match self {
            EntityKind::Prices => vec![FieldDefinition::new("daily_return", FieldType::Float)
                .with_description("(close - prev_close) / prev_close per ticker")],
            EntityKind::Fundamentals => Vec::new(),
            EntityKind::News => vec![FieldDefinition::new("sentiment", FieldType::String)
                .with_description("positive / negative / neutral")],
            EntityKind::Filings => {
                vec![FieldDefinition::new("reporting_frequency", FieldType::String)
                    .with_description("annual / quarterly")]
            }
        }
    }

    pub fn transform(&self, raw: &[ScoredRecord], ctx: &TransformContext) -> TransformOutput {
        match self {
            EntityKind::Prices => prices::transform(raw, ctx),
            EntityKind::Fundamentals => fundamentals::transform(raw, ctx),
            EntityKind::News => news::transform(raw, ctx),
            EntityKind::Filings => filings::transform(raw, ctx),
        }
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Entity name → transform kind
pub struct TransformRegistry {
    kinds: BTreeMap<String, EntityKind>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        TransformRegistry {
            kinds: EntityKind::ALL
                .into_iter()
                .map(|k| (k.entity_name().to_string(), k))
                .collect(),
        }
    }

    /// Unknown names stop the run before any staging table is touched
    pub fn resolve(&self, entity: &str) -> Result<EntityKind> {
        self.kinds.get(entity).copied().ok_or_else(|| {
            PipelineError::config(format!("no transform registered for '{}'", entity))
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.kinds.keys().cloned().collect()
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// SQL comparison semantics: any comparison against a missing value is false
pub(crate) fn gte(left: Option<f64>, right: Option<f64>) -> bool {
    matches!((left, right), (Some(l), Some(r)) if l >= r)
}

pub(crate) fn gt(left: Option<f64>, right: Option<f64>) -> bool {
    matches!((left, right), (Some(l), Some(r)) if l > r)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::quality::QualityScore;
    use crate::record::{RawRecord, ScoredRecord, Value};
    use chrono::{TimeZone, Utc};

    pub fn scored(entity: &str, fields: &[(&str, Value)]) -> ScoredRecord {
        let mut record = RawRecord::new(entity, "fixture")
            .with_ingested_at(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        for (name, value) in fields {
            record.set(name, value.clone());
        }
        ScoredRecord::new(record, QualityScore::new(100.0))
    }
}
