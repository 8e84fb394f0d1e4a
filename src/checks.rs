// 🧪 Warehouse Invariant Checks - what the `test` command verifies
// Each check counts offending rows; zero means it passed.

use crate::error::{PipelineError, Result};
use crate::record::Value;
use crate::schema::{EntitySchema, SchemaRegistry};
use crate::warehouse::{parse_instant, quote, table_exists};
use rusqlite::{params, Connection};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub failures: i64,
    pub detail: String,
}

impl CheckResult {
    pub fn passed(&self) -> bool {
        self.failures == 0
    }

    /// A failed check as a `ConstraintViolation`; checks report, they never raise
    pub fn violation(&self) -> Option<PipelineError> {
        if self.passed() {
            return None;
        }
        let (entity, constraint) = self.name.split_once('.').unwrap_or(("", self.name.as_str()));
        Some(PipelineError::ConstraintViolation {
            entity: entity.to_string(),
            constraint: constraint.to_string(),
            message: format!("{} rows: {}", self.failures, self.detail),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckReport {
    pub results: Vec<CheckResult>,
}

impl CheckReport {
    pub fn passed(&self) -> bool {
        self.results.iter().all(CheckResult::passed)
    }

    pub fn failed(&self) -> Vec<&CheckResult> {
        self.results.iter().filter(|r| !r.passed()).collect()
    }

    fn record(&mut self, name: String, failures: i64, detail: impl Into<String>) {
        self.results.push(CheckResult {
            name,
            failures,
            detail: detail.into(),
        });
    }
}

pub fn run_checks(conn: &Connection, registry: &SchemaRegistry) -> Result<CheckReport> {
    let mut report = CheckReport::default();

    for schema in registry.schemas() {
        let raw = quote(&schema.raw_table());

        // Rule 1: every raw score lies in [0, 100]
        let out_of_bounds: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE data_quality_score < 0 OR data_quality_score > 100",
                raw
            ),
            [],
            |row| row.get(0),
        )?;
        report.record(
            format!("{}.score_bounds", schema.name),
            out_of_bounds,
            "data_quality_score outside [0, 100]",
        );

        // Rule 2: one raw row per primary key
        let keys = schema
            .primary_key
            .iter()
            .map(|k| quote(k))
            .collect::<Vec<_>>()
            .join(", ");
        let duplicates: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM (SELECT {keys} FROM {raw} GROUP BY {keys} HAVING COUNT(*) > 1)"
            ),
            [],
            |row| row.get(0),
        )?;
        report.record(
            format!("{}.unique_key", schema.name),
            duplicates,
            "primary key appears more than once",
        );

        // Rule 3: staging holds valid rows only
        if table_exists(conn, &schema.staging_table())? {
            let invalid: i64 = conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE is_valid = 0",
                    quote(&schema.staging_table())
                ),
                [],
                |row| row.get(0),
            )?;
            report.record(
                format!("{}.staging_valid", schema.name),
                invalid,
                "staging row with is_valid = 0",
            );
        }

        // Rule 4: no cursor ahead of the data it claims to cover
        if let Some(field) = &schema.watermark {
            let ahead = cursors_ahead(conn, schema, field)?;
            report.record(
                format!("{}.cursor_not_ahead", schema.name),
                ahead.len() as i64,
                if ahead.is_empty() {
                    "cursor ahead of loaded data".to_string()
                } else {
                    format!("cursor ahead of loaded data for: {}", ahead.join(", "))
                },
            );
        }
    }

    // Rule 5: price staging rows satisfy the price constraints
    if table_exists(conn, "stg_stock_prices")? {
        let violations: i64 = conn.query_row(
            "SELECT COUNT(*) FROM stg_stock_prices
             WHERE NOT COALESCE(close > 0 AND volume >= 0 AND high >= low, 0)",
            [],
            |row| row.get(0),
        )?;
        report.record(
            "stock_prices.staging_price_constraints".to_string(),
            violations,
            "close <= 0, volume < 0 or high < low in staging",
        );
    }

    Ok(report)
}

/// Sources whose stored cursor is later than the newest loaded watermark
fn cursors_ahead(conn: &Connection, schema: &EntitySchema, field: &str) -> Result<Vec<String>> {
    let Some(def) = schema.field(field) else {
        return Ok(Vec::new());
    };

    let mut stmt = conn.prepare(&format!(
        "SELECT c.source, c.watermark,
                (SELECT MAX(r.{col}) FROM {raw} r WHERE r.source = c.source)
         FROM load_cursors c WHERE c.entity = ?1",
        col = quote(field),
        raw = quote(&schema.raw_table())
    ))?;

    let rows = stmt
        .query_map(params![schema.name], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut ahead = Vec::new();
    for (source, cursor, newest) in rows {
        let cursor = parse_instant(&cursor);
        let newest = newest
            .and_then(|text| Value::parse(def.type_, &text).ok())
            .and_then(|v| v.watermark());

        let is_ahead = match (cursor, newest) {
            (Some(c), Some(n)) => c > n,
            // a cursor with nothing loaded behind it
            (Some(_), None) => true,
            (None, _) => false,
        };
        if is_ahead {
            ahead.push(source);
        }
    }

    Ok(ahead)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::setup_database;

    fn warehouse() -> (Connection, SchemaRegistry) {
        let conn = Connection::open_in_memory().unwrap();
        let registry = SchemaRegistry::new();
        setup_database(&conn, &registry).unwrap();
        (conn, registry)
    }

    #[test]
    fn test_empty_warehouse_passes() {
        let (conn, registry) = warehouse();
        let report = run_checks(&conn, &registry).unwrap();
        assert!(report.passed());
        assert!(!report.results.is_empty());
    }

    #[test]
    fn test_cursor_ahead_of_data_fails() {
        let (conn, registry) = warehouse();
        conn.execute(
            "INSERT INTO raw_stock_prices (ticker, date, close, source, ingested_at, data_quality_score, content_hash)
             VALUES ('T', '2024-01-02', 100.0, 'yahoo', '2024-01-05T00:00:00.000000Z', 70.0, 'h')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO load_cursors VALUES ('yahoo', 'stock_prices', '2024-01-02T00:00:00.000000Z', 'x')",
            [],
        )
        .unwrap();
        assert!(run_checks(&conn, &registry).unwrap().passed());

        conn.execute(
            "UPDATE load_cursors SET watermark = '2024-02-01T00:00:00.000000Z'",
            [],
        )
        .unwrap();
        let report = run_checks(&conn, &registry).unwrap();
        let failed = report.failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].name, "stock_prices.cursor_not_ahead");
    }

    #[test]
    fn test_invalid_staging_rows_fail() {
        let (conn, registry) = warehouse();
        conn.execute_batch(
            "CREATE TABLE stg_stock_prices (ticker TEXT, date TEXT, high REAL, low REAL,
                 close REAL, volume INTEGER, is_valid INTEGER NOT NULL);
             INSERT INTO stg_stock_prices VALUES ('T', '2024-01-02', 10, 9, 9.5, 100, 1);
             INSERT INTO stg_stock_prices VALUES ('T', '2024-01-03', 10, 9, 9.5, -5, 0);",
        )
        .unwrap();

        let report = run_checks(&conn, &registry).unwrap();
        let names: Vec<&str> = report.failed().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["stock_prices.staging_valid", "stock_prices.staging_price_constraints"]
        );
    }

    #[test]
    fn test_failed_check_reads_as_constraint_violation() {
        let failed = CheckResult {
            name: "news.cursor_not_ahead".to_string(),
            failures: 1,
            detail: "cursor ahead of loaded data for: newsapi".to_string(),
        };
        match failed.violation() {
            Some(PipelineError::ConstraintViolation {
                entity, constraint, ..
            }) => {
                assert_eq!(entity, "news");
                assert_eq!(constraint, "cursor_not_ahead");
            }
            other => panic!("expected a constraint violation, got {:?}", other),
        }

        let passed = CheckResult {
            failures: 0,
            ..failed
        };
        assert!(passed.violation().is_none());
    }
}
