// 🔁 Idempotent Merge Loader - stage, then one upsert transaction per batch
//
// Flow per batch:
//   conform each record (rejects counted, batch continues)
//   -> dedup by primary key (last occurrence wins)
//   -> temp staging table on a private connection
//   -> writer lock + IMMEDIATE transaction: classify, upsert, audit, commit
//
// Nothing reaches the raw table unless the whole merge commits.

use crate::audit::{self, Event};
use crate::error::Result;
use crate::record::ScoredRecord;
use crate::schema::{EntitySchema, SchemaRegistry};
use crate::warehouse::{format_instant, quote, raw_columns, Warehouse};
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Rejection messages kept per result; the count is always exact
const MAX_REJECTION_MESSAGES: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadResult {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub rejected: usize,

    /// Earlier rows in the batch replaced by a later row with the same key
    pub superseded: usize,

    /// Largest watermark value among accepted rows
    pub high_watermark: Option<DateTime<Utc>>,

    pub rejections: Vec<String>,
}

impl LoadResult {
    pub fn accepted(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }

    /// A non-empty batch in which nothing survived validation
    pub fn all_rejected(&self) -> bool {
        self.rejected > 0 && self.accepted() == 0
    }

    fn reject(&mut self, message: String) {
        self.rejected += 1;
        if self.rejections.len() < MAX_REJECTION_MESSAGES {
            self.rejections.push(message);
        }
    }
}

pub struct MergeLoader {
    warehouse: Arc<Warehouse>,
    registry: Arc<SchemaRegistry>,
}

impl MergeLoader {
    pub fn new(warehouse: Arc<Warehouse>, registry: Arc<SchemaRegistry>) -> Self {
        MergeLoader {
            warehouse,
            registry,
        }
    }

    pub fn load(&self, entity: &str, batch: Vec<ScoredRecord>) -> Result<LoadResult> {
        let schema = self.registry.get(entity)?;
        let mut result = LoadResult::default();

        // ========================================================================
        // 1. Validate and dedup
        // ========================================================================
        let mut accepted: BTreeMap<String, ScoredRecord> = BTreeMap::new();
        for scored in batch {
            match schema.conform(&scored.record) {
                Ok(record) => {
                    let key = serde_json::to_string(&record.key_values(&schema.primary_key))?;
                    if accepted
                        .insert(key, ScoredRecord::new(record, scored.score))
                        .is_some()
                    {
                        result.superseded += 1;
                    }
                }
                Err(errors) => {
                    let message = errors
                        .iter()
                        .map(|e| e.to_string())
                        .collect::<Vec<_>>()
                        .join("; ");
                    tracing::warn!(entity, %message, "record rejected");
                    result.reject(message);
                }
            }
        }

        result.high_watermark = schema.watermark.as_ref().and_then(|field| {
            accepted
                .values()
                .filter_map(|s| s.record.get(field).watermark())
                .max()
        });

        if accepted.is_empty() {
            tracing::info!(entity, rejected = result.rejected, "nothing to merge");
            return Ok(result);
        }

        // ========================================================================
        // 2. Stage into a connection-private temp table
        // ========================================================================
        let mut conn = self.warehouse.connect()?;
        let stage = stage_batch(&mut conn, schema, accepted.values())?;

        // ========================================================================
        // 3. Merge under the entity's writer lock
        // ========================================================================
        let lock = self.warehouse.writer_lock(entity);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let raw = quote(&schema.raw_table());
        let join = key_join(schema, "r", "s");

        let inserted: i64 = tx.query_row(
            &format!(
                "SELECT COUNT(*) FROM {stage} s WHERE NOT EXISTS (SELECT 1 FROM {raw} r WHERE {join})"
            ),
            [],
            |row| row.get(0),
        )?;
        let unchanged: i64 = tx.query_row(
            &format!(
                "SELECT COUNT(*) FROM {stage} s JOIN {raw} r ON {join} WHERE r.content_hash = s.content_hash"
            ),
            [],
            |row| row.get(0),
        )?;

        tx.execute(&upsert_sql(schema, &stage), [])?;

        result.inserted = inserted as usize;
        result.unchanged = unchanged as usize;
        result.updated = accepted.len() - result.inserted - result.unchanged;

        let source_label = sources_label(accepted.values());
        let event = Event::new(
            audit::BATCH_LOADED,
            entity,
            &source_label,
            serde_json::json!({
                "inserted": result.inserted,
                "updated": result.updated,
                "unchanged": result.unchanged,
                "rejected": result.rejected,
                "superseded": result.superseded,
                "high_watermark": result.high_watermark.as_ref().map(format_instant),
            }),
            "merge_loader",
        );
        audit::insert_event(&tx, &event)?;

        tx.commit()?;
        drop(_guard);

        // ========================================================================
        // 4. Clean up
        // ========================================================================
        conn.execute(&format!("DROP TABLE IF EXISTS {}", stage), [])?;

        tracing::info!(
            entity,
            inserted = result.inserted,
            updated = result.updated,
            unchanged = result.unchanged,
            rejected = result.rejected,
            "batch merged"
        );

        Ok(result)
    }
}

/// Copy the batch into `temp.stage_<entity>` and return its qualified name
fn stage_batch<'a>(
    conn: &mut Connection,
    schema: &EntitySchema,
    rows: impl Iterator<Item = &'a ScoredRecord>,
) -> Result<String> {
    let stage = format!("temp.{}", quote(&format!("stage_{}", schema.name)));
    let columns = raw_columns(schema);

    let tx = conn.transaction()?;
    tx.execute(&format!("DROP TABLE IF EXISTS {}", stage), [])?;
    tx.execute(
        &format!(
            "CREATE TEMP TABLE {} AS SELECT * FROM main.{} WHERE 0",
            quote(&format!("stage_{}", schema.name)),
            quote(&schema.raw_table())
        ),
        [],
    )?;

    {
        let placeholders = (1..=columns.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = tx.prepare(&format!(
            "INSERT INTO {} ({}) VALUES ({})",
            stage,
            columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", "),
            placeholders
        ))?;

        for scored in rows {
            let score = scored.score.value();
            let mut values: Vec<SqlValue> = schema
                .fields
                .iter()
                .map(|f| scored.record.get(&f.name).to_sql())
                .collect();
            values.push(SqlValue::Text(scored.record.source.clone()));
            values.push(SqlValue::Text(format_instant(&scored.record.ingested_at)));
            values.push(SqlValue::Real(score));
            values.push(SqlValue::Text(scored.record.content_hash(score)));

            stmt.execute(params_from_iter(values))?;
        }
    }

    tx.commit()?;
    Ok(stage)
}

fn key_join(schema: &EntitySchema, left: &str, right: &str) -> String {
    schema
        .primary_key
        .iter()
        .map(|k| format!("{left}.{col} = {right}.{col}", col = quote(k)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Upsert that rewrites every non-key column, but only when content changed.
///
/// Rows whose content hash matches keep their original `ingested_at`, so
/// replaying a batch leaves the table byte-for-byte identical.
pub fn upsert_sql(schema: &EntitySchema, stage: &str) -> String {
    let raw = quote(&schema.raw_table());
    let columns = raw_columns(schema);
    let column_list = columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
    let key_list = schema
        .primary_key
        .iter()
        .map(|k| quote(k))
        .collect::<Vec<_>>()
        .join(", ");
    let assignments = columns
        .iter()
        .filter(|c| !schema.is_primary_key(c))
        .map(|c| format!("{col} = excluded.{col}", col = quote(c)))
        .collect::<Vec<_>>()
        .join(",\n    ");

    // `WHERE true` disambiguates the upsert clause from a join constraint
    format!(
        "INSERT INTO {raw} ({column_list})\n\
         SELECT {column_list} FROM {stage} WHERE true\n\
         ON CONFLICT({key_list}) DO UPDATE SET\n    {assignments}\n\
         WHERE {raw}.content_hash <> excluded.content_hash"
    )
}

fn sources_label<'a>(rows: impl Iterator<Item = &'a ScoredRecord>) -> String {
    let mut sources: Vec<&str> = rows.map(|s| s.record.source.as_str()).collect();
    sources.sort_unstable();
    sources.dedup();
    sources.join(",")
}

// ============================================================================
// TESTS
// ============================================================================
