// 🔌 Source Connectors - where raw records come from
// A connector returns the records inside a window, or an error. Never an
// empty batch standing in for a failure.

use crate::cursor::Window;
use crate::error::{PipelineError, Result};
use crate::record::{RawRecord, Value};
use crate::schema::EntitySchema;
use std::path::{Path, PathBuf};

/// SourceConnector - one external data source
pub trait SourceConnector: Send + Sync {
    /// Provenance recorded on every record this connector produces
    fn name(&self) -> &str;

    /// Records of `schema`'s entity whose watermark falls inside `window`
    fn fetch(&self, schema: &EntitySchema, window: &Window) -> Result<Vec<RawRecord>>;
}

/// Keep records whose watermark is inside the window.
///
/// Records without a readable watermark are kept; the loader decides
/// whether they are acceptable.
pub fn in_window(schema: &EntitySchema, record: &RawRecord, window: &Window) -> bool {
    let Some(field) = &schema.watermark else {
        return true;
    };
    let value = record.get(field);
    let parsed = match value {
        Value::Text(raw) => schema
            .field(field)
            .and_then(|def| Value::parse(def.type_, raw).ok())
            .and_then(|v| v.watermark()),
        other => other.watermark(),
    };
    parsed.map(|at| window.contains(&at)).unwrap_or(true)
}

// ============================================================================
// CSV CONNECTOR
// ============================================================================

/// Reads `<dir>/<entity>.csv`, one record per row, header names = field names
pub struct CsvConnector {
    dir: PathBuf,
    source: String,
}

impl CsvConnector {
    pub fn new(dir: impl Into<PathBuf>, source: impl Into<String>) -> Self {
        CsvConnector {
            dir: dir.into(),
            source: source.into(),
        }
    }

    pub fn file_for(&self, entity: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", entity))
    }

    fn read_file(&self, schema: &EntitySchema, path: &Path) -> Result<Vec<RawRecord>> {
        let context = format!("read {}", path.display());

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::Headers)
            .from_path(path)
            .map_err(|e| PipelineError::transient(&context, e.to_string()))?;

        let headers = reader
            .headers()
            .map_err(|e| PipelineError::transient(&context, e.to_string()))?
            .clone();

        // Extract columns outside the schema (e.g. a provider's own `source`)
        let ignored: Vec<&str> = headers
            .iter()
            .filter(|h| schema.field(h).is_none())
            .collect();
        if !ignored.is_empty() {
            tracing::warn!(
                entity = %schema.name,
                columns = ?ignored,
                "ignoring csv columns outside the schema"
            );
        }

        let mut records = Vec::new();
        for (line_num, row) in reader.records().enumerate() {
            let row = row.map_err(|e| {
                PipelineError::transient(&context, format!("line {}: {}", line_num + 2, e))
            })?;

            let mut record = RawRecord::new(&schema.name, &self.source);
            for (header, cell) in headers.iter().zip(row.iter()) {
                let Some(def) = schema.field(header) else {
                    continue;
                };
                // Unparseable cells stay text so the loader rejects them
                let value = Value::parse(def.type_, cell).unwrap_or_else(|_| Value::text(cell));
                record.set(header, value);
            }
            records.push(record);
        }

        Ok(records)
    }
}

impl SourceConnector for CsvConnector {
    fn name(&self) -> &str {
        &self.source
    }

    fn fetch(&self, schema: &EntitySchema, window: &Window) -> Result<Vec<RawRecord>> {
        let path = self.file_for(&schema.name);
        if !path.is_file() {
            return Err(PipelineError::transient(
                &format!("fetch {}", schema.name),
                format!("{} not found", path.display()),
            ));
        }

        let all = self.read_file(schema, &path)?;
        let total = all.len();
        let records: Vec<RawRecord> = all
            .into_iter()
            .filter(|r| in_window(schema, r, window))
            .collect();

        tracing::info!(
            source = %self.source,
            entity = %schema.name,
            total,
            in_window = records.len(),
            "fetched csv rows"
        );
        Ok(records)
    }
}

// ============================================================================
// STATIC CONNECTOR
// ============================================================================

/// In-memory source; handy for embedding and for tests
pub struct StaticConnector {
    source: String,
    records: Vec<RawRecord>,
    failure: Option<String>,
}

impl StaticConnector {
    pub fn new(source: impl Into<String>, records: Vec<RawRecord>) -> Self {
        StaticConnector {
            source: source.into(),
            records,
            failure: None,
        }
    }

    /// A source that is down: every fetch fails with `TransientIo`
    pub fn failing(source: impl Into<String>, message: impl Into<String>) -> Self {
        StaticConnector {
            source: source.into(),
            records: Vec::new(),
            failure: Some(message.into()),
        }
    }
}

impl SourceConnector for StaticConnector {
    fn name(&self) -> &str {
        &self.source
    }

    fn fetch(&self, schema: &EntitySchema, window: &Window) -> Result<Vec<RawRecord>> {
        if let Some(message) = &self.failure {
            return Err(PipelineError::transient(
                &format!("fetch {} from {}", schema.name, self.source),
                message.clone(),
            ));
        }

        Ok(self
            .records
            .iter()
            .filter(|r| r.entity == schema.name && in_window(schema, r, window))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaRegistry;
    use chrono::{TimeZone, Utc};
    use std::io::Write;

    fn window() -> Window {
        Window {
            from: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            to: Utc.with_ymd_and_hms(2024, 1, 4, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_csv_rows_are_typed_and_windowed() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("stock_prices.csv")).unwrap();
        writeln!(file, "ticker,date,open,high,low,close,volume").unwrap();
        writeln!(file, "T,2024-01-01,99,101,98,100,1000").unwrap();
        writeln!(file, "T,2024-01-02,100,104,99,103,1200").unwrap();
        writeln!(file, "T,2024-01-03,103,105,101,,1300").unwrap();
        writeln!(file, "T,2024-01-04,104,106,102,105,1100").unwrap();
        drop(file);

        let registry = SchemaRegistry::new();
        let schema = registry.get("stock_prices").unwrap();
        let connector = CsvConnector::new(dir.path(), "csv");

        let records = connector.fetch(schema, &window()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("close"), &Value::Float(103.0));
        assert_eq!(records[0].get("volume"), &Value::Integer(1200));
        assert!(!records[1].has("close"));
        assert_eq!(records[0].source, "csv");
    }

    #[test]
    fn test_bad_cells_stay_text() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("stock_prices.csv"),
            "ticker,date,close,volume\nT,2024-01-02,n/a,1\n",
        )
        .unwrap();

        let registry = SchemaRegistry::new();
        let schema = registry.get("stock_prices").unwrap();
        let records = CsvConnector::new(dir.path(), "csv")
            .fetch(schema, &window())
            .unwrap();

        assert_eq!(records[0].get("close"), &Value::text("n/a"));
        assert!(schema.conform(&records[0]).is_err());
    }

    #[test]
    fn test_columns_outside_schema_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("stock_prices.csv"),
            "ticker,date,close,volume,source\nT,2024-01-02,10,1,yahoo_finance\n",
        )
        .unwrap();

        let registry = SchemaRegistry::new();
        let schema = registry.get("stock_prices").unwrap();
        let records = CsvConnector::new(dir.path(), "csv")
            .fetch(schema, &window())
            .unwrap();

        assert!(!records[0].fields.contains_key("source"));
        assert_eq!(records[0].source, "csv");
        assert!(schema.conform(&records[0]).is_ok());
    }

    #[test]
    fn test_missing_file_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SchemaRegistry::new();
        let err = CsvConnector::new(dir.path(), "csv")
            .fetch(registry.get("news").unwrap(), &window())
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_static_connector_failure() {
        let registry = SchemaRegistry::new();
        let connector = StaticConnector::failing("newsapi", "HTTP 503");
        let err = connector
            .fetch(registry.get("news").unwrap(), &window())
            .unwrap_err();
        assert!(err.to_string().contains("HTTP 503"));
    }
}
