// 🧱 Staging Store - stg_<entity> tables, rebuilt wholesale on every run
// DROP + CREATE + INSERT inside one transaction: readers see the old table
// or the new one, never a half-built one.

use crate::audit::{self, Event};
use crate::error::Result;
use crate::record::Value;
use crate::schema::{EntitySchema, FieldDefinition};
use crate::transforms::{EntityKind, StagingRecord, TransformOutput};
use crate::warehouse::{format_instant, parse_instant, quote};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, TransactionBehavior};
use std::collections::BTreeMap;

/// Typed columns of a staging table: entity fields, then derived fields
pub fn staging_fields(schema: &EntitySchema, kind: EntityKind) -> Vec<FieldDefinition> {
    schema
        .fields
        .iter()
        .cloned()
        .chain(kind.derived_fields())
        .collect()
}

pub fn create_staging_table_sql(schema: &EntitySchema, kind: EntityKind) -> String {
    let mut columns: Vec<String> = staging_fields(schema, kind)
        .iter()
        .map(|f| format!("{} {}", quote(&f.name), f.type_.sql_type()))
        .collect();

    columns.push("source TEXT NOT NULL".to_string());
    columns.push("ingested_at TEXT NOT NULL".to_string());
    columns.push("data_quality_score REAL NOT NULL".to_string());
    columns.push("is_valid INTEGER NOT NULL".to_string());

    let key = schema
        .primary_key
        .iter()
        .map(|k| quote(k))
        .collect::<Vec<_>>()
        .join(", ");
    columns.push(format!("PRIMARY KEY ({})", key));

    format!(
        "CREATE TABLE {} (\n    {}\n)",
        quote(&schema.staging_table()),
        columns.join(",\n    ")
    )
}

/// Replace the entity's staging table with `output`. Returns rows written.
pub fn materialize(
    conn: &mut Connection,
    schema: &EntitySchema,
    kind: EntityKind,
    output: &TransformOutput,
) -> Result<usize> {
    let table = quote(&schema.staging_table());
    let fields = staging_fields(schema, kind);

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(&format!("DROP TABLE IF EXISTS {}", table), [])?;
    tx.execute(&create_staging_table_sql(schema, kind), [])?;

    {
        let mut columns: Vec<String> = fields.iter().map(|f| quote(&f.name)).collect();
        columns.extend(
            ["source", "ingested_at", "data_quality_score", "is_valid"]
                .iter()
                .map(|c| c.to_string()),
        );
        let placeholders = (1..=columns.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = tx.prepare(&format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders
        ))?;

        for record in &output.records {
            let mut values: Vec<SqlValue> = fields
                .iter()
                .map(|f| record.get(&f.name).map(Value::to_sql).unwrap_or(SqlValue::Null))
                .collect();
            values.push(SqlValue::Text(record.source.clone()));
            values.push(SqlValue::Text(format_instant(&record.ingested_at)));
            values.push(SqlValue::Real(record.quality_score));
            values.push(SqlValue::Integer(record.is_valid as i64));
            stmt.execute(params_from_iter(values))?;
        }
    }

    let event = Event::new(
        audit::STAGING_MATERIALIZED,
        &schema.name,
        &schema.staging_table(),
        serde_json::json!({
            "rows": output.records.len(),
            "invalid": output.invalid,
        }),
        "transform",
    );
    audit::insert_event(&tx, &event)?;
    tx.commit()?;

    Ok(output.records.len())
}

/// Read a staging table back, ordered by primary key
pub fn read_staging(
    conn: &Connection,
    schema: &EntitySchema,
    kind: EntityKind,
) -> Result<Vec<StagingRecord>> {
    let fields = staging_fields(schema, kind);
    let columns = fields
        .iter()
        .map(|f| quote(&f.name))
        .chain(
            ["source", "ingested_at", "data_quality_score", "is_valid"]
                .iter()
                .map(|c| c.to_string()),
        )
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
        quote(&schema.staging_table()),
        order
    ))?;

    let n = fields.len();
    let rows = stmt
        .query_map([], |row| {
            let mut values = BTreeMap::new();
            for (i, def) in fields.iter().enumerate() {
                let value = Value::from_sql(def.type_, row.get_ref(i)?).map_err(|msg| {
                    rusqlite::Error::FromSqlConversionFailure(
                        i,
                        rusqlite::types::Type::Text,
                        msg.into(),
                    )
                })?;
                if !value.is_null() {
                    values.insert(def.name.clone(), value);
                }
            }

            let ingested_at: String = row.get(n + 1)?;
            Ok(StagingRecord {
                entity: schema.name.clone(),
                fields: values,
                source: row.get(n)?,
                ingested_at: parse_instant(&ingested_at).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        n + 1,
                        rusqlite::types::Type::Text,
                        format!("bad ingested_at '{}'", ingested_at).into(),
                    )
                })?,
                quality_score: row.get(n + 2)?,
                is_valid: row.get::<_, i64>(n + 3)? != 0,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}
