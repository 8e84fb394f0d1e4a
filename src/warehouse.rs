// 🗄️ Warehouse - SQLite file holding raw tables, staging tables, cursors and events
// Each unit of work opens its own connection; WAL lets readers and the
// per-entity writer run side by side.

use crate::audit;
use crate::config::WarehouseConfig;
use crate::error::{PipelineError, Result};
use crate::record::{RawRecord, ScoredRecord, Value};
use crate::quality::QualityScore;
use crate::schema::{EntitySchema, SchemaRegistry};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Bookkeeping columns every raw table carries after the entity's own fields
pub const RAW_META_COLUMNS: [&str; 4] = ["source", "ingested_at", "data_quality_score", "content_hash"];

pub struct Warehouse {
    path: PathBuf,
    busy_timeout: Duration,
    writer_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Warehouse {
    /// Open (or create) the warehouse file and make sure every table exists
    pub fn open(config: &WarehouseConfig, registry: &SchemaRegistry) -> Result<Self> {
        let warehouse = Warehouse {
            path: config.path.clone(),
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
            writer_locks: Mutex::new(HashMap::new()),
        };

        let conn = warehouse.connect()?;
        setup_database(&conn, registry)?;
        tracing::debug!(path = %warehouse.path.display(), "warehouse ready");

        Ok(warehouse)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fresh connection with WAL and a busy timeout
    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).map_err(|e| {
            PipelineError::transient(
                &format!("open warehouse {}", self.path.display()),
                e.to_string(),
            )
        })?;

        // WAL for crash recovery and concurrent readers
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(self.busy_timeout)?;

        Ok(conn)
    }

    /// The single-writer lock for an entity's key space
    pub fn writer_lock(&self, entity: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .writer_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(entity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

pub fn setup_database(conn: &Connection, registry: &SchemaRegistry) -> Result<()> {
    // ==========================================================================
    // Raw tables, one per registered entity
    // ==========================================================================
    for schema in registry.schemas() {
        conn.execute(&create_raw_table_sql(schema), [])?;
    }

    // ==========================================================================
    // Incremental cursors
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS load_cursors (
            source TEXT NOT NULL,
            entity TEXT NOT NULL,
            watermark TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (source, entity)
        )",
        [],
    )?;

    // ==========================================================================
    // Audit trail
    // ==========================================================================
    audit::create_events_table(conn)?;

    Ok(())
}

pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn create_raw_table_sql(schema: &EntitySchema) -> String {
    let mut columns: Vec<String> = schema
        .fields
        .iter()
        .map(|f| {
            let not_null = if schema.is_primary_key(&f.name) { " NOT NULL" } else { "" };
            format!("{} {}{}", quote(&f.name), f.type_.sql_type(), not_null)
        })
        .collect();

    columns.push("source TEXT NOT NULL".to_string());
    columns.push("ingested_at TEXT NOT NULL".to_string());
    columns.push("data_quality_score REAL NOT NULL".to_string());
    columns.push("content_hash TEXT NOT NULL".to_string());

    let key = schema
        .primary_key
        .iter()
        .map(|k| quote(k))
        .collect::<Vec<_>>()
        .join(", ");
    columns.push(format!("PRIMARY KEY ({})", key));

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        quote(&schema.raw_table()),
        columns.join(",\n    ")
    )
}

/// Every raw column in table order: entity fields, then bookkeeping
pub fn raw_columns(schema: &EntitySchema) -> Vec<String> {
    schema
        .fields
        .iter()
        .map(|f| f.name.clone())
        .chain(RAW_META_COLUMNS.iter().map(|c| c.to_string()))
        .collect()
}

pub fn format_instant(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn count_rows(conn: &Connection, table: &str) -> Result<i64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote(table)),
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Read every raw row for an entity, ordered by primary key
pub fn read_raw(conn: &Connection, schema: &EntitySchema) -> Result<Vec<ScoredRecord>> {
    let columns = raw_columns(schema)
        .iter()
        .map(|c| quote(c))
        .collect::<Vec<_>>()
        .join(", ");
    let order = schema
        .primary_key
        .iter()
        .map(|k| quote(k))
        .collect::<Vec<_>>()
        .join(", ");

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {} ORDER BY {}",
        columns,
        quote(&schema.raw_table()),
        order
    ))?;

    let field_count = schema.fields.len();
    let records = stmt
        .query_map([], |row| {
            let mut fields = BTreeMap::new();
            for (i, def) in schema.fields.iter().enumerate() {
                let value = Value::from_sql(def.type_, row.get_ref(i)?).map_err(|msg| {
                    rusqlite::Error::FromSqlConversionFailure(
                        i,
                        rusqlite::types::Type::Text,
                        msg.into(),
                    )
                })?;
                if !value.is_null() {
                    fields.insert(def.name.clone(), value);
                }
            }

            let source: String = row.get(field_count)?;
            let ingested_at: String = row.get(field_count + 1)?;
            let score: f64 = row.get(field_count + 2)?;

            let ingested_at = parse_instant(&ingested_at).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    field_count + 1,
                    rusqlite::types::Type::Text,
                    format!("bad ingested_at '{}'", ingested_at).into(),
                )
            })?;

            Ok(ScoredRecord {
                record: RawRecord {
                    entity: schema.name.clone(),
                    fields,
                    source,
                    ingested_at,
                },
                score: QualityScore::new(score),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(records)
}
