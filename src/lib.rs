// FinSage Ingest - Core Library
// Incremental, idempotent financial data loads with quality scoring and
// dependency-ordered staging transforms. Used by the `finsage` CLI and tests.

pub mod error;      // Error taxonomy
pub mod config;     // TOML configuration
pub mod record;     // Values and raw records
pub mod schema;     // Schema Registry
pub mod quality;    // Quality Scorer
pub mod sentiment;  // Headline sentiment rules
pub mod audit;      // Event trail
pub mod warehouse;  // SQLite raw layer
pub mod cursor;     // Incremental Cursor Manager
pub mod connector;  // Source connectors
pub mod loader;     // Idempotent Merge Loader
pub mod transforms; // Transformation Layer
pub mod staging;    // Staging tables
pub mod scheduler;  // Dependency Scheduler
pub mod checks;     // Warehouse invariant checks
pub mod pipeline;   // Everything wired together

// Re-export commonly used types
pub use error::{PipelineError, Result};
pub use config::{IngestConfig, PipelineConfig, TransformConfig, WarehouseConfig};
pub use record::{RawRecord, ScoredRecord, Value};
pub use schema::{Constraint, EntitySchema, FieldDefinition, FieldType, SchemaRegistry};
pub use quality::{
    BatchSummary, DeductionTable, QualityIssue, QualityReport, QualityScore, QualityScorer,
    Severity,
};
pub use sentiment::{KeywordSentiment, Sentiment, SentimentClassifier, SentimentKeywords};
pub use audit::{get_events_for_entity, insert_event, Event};
pub use warehouse::{setup_database, Warehouse};
pub use cursor::{CursorManager, Window};
pub use connector::{CsvConnector, SourceConnector, StaticConnector};
pub use loader::{LoadResult, MergeLoader};
pub use transforms::{
    EntityKind, StagingRecord, TransformContext, TransformOutput, TransformRegistry,
};
pub use scheduler::{CancelToken, Scheduler, Unit, UnitStatus};
pub use checks::{CheckReport, CheckResult};
pub use pipeline::{LoadJob, LoadReport, Pipeline, StageOutcome, TransformReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
