// ⏱️ Incremental Cursor Manager - per (source, entity) high watermark
// Window = [from, to). The cursor only moves forward, and only after a load commits.

use crate::audit::{self, Event};
use crate::config::IngestConfig;
use crate::error::{PipelineError, Result};
use crate::warehouse::{format_instant, parse_instant, Warehouse};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Half-open fetch window: `from` inclusive, `to` exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl Window {
    pub fn contains(&self, at: &DateTime<Utc>) -> bool {
        *at >= self.from && *at < self.to
    }
}

pub struct CursorManager {
    warehouse: Arc<Warehouse>,
    ingest: IngestConfig,
}

impl CursorManager {
    pub fn new(warehouse: Arc<Warehouse>, ingest: IngestConfig) -> Self {
        CursorManager { warehouse, ingest }
    }

    /// Last committed watermark, if the pair was ever loaded
    pub fn cursor(&self, source: &str, entity: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.warehouse.connect()?;
        let stored: Option<String> = conn
            .query_row(
                "SELECT watermark FROM load_cursors WHERE source = ?1 AND entity = ?2",
                params![source, entity],
                |row| row.get(0),
            )
            .optional()?;

        match stored {
            None => Ok(None),
            Some(text) => parse_instant(&text).map(Some).ok_or_else(|| {
                PipelineError::config(format!(
                    "corrupt cursor for {}/{}: '{}'",
                    source, entity, text
                ))
            }),
        }
    }

    pub fn next_window(&self, source: &str, entity: &str) -> Result<Window> {
        self.next_window_at(source, entity, Utc::now())
    }

    /// Window ending at `now`. Never-loaded pairs look back the configured
    /// number of days.
    pub fn next_window_at(&self, source: &str, entity: &str, now: DateTime<Utc>) -> Result<Window> {
        let from = match self.cursor(source, entity)? {
            Some(watermark) => watermark,
            None => now - Duration::days(self.ingest.lookback_for(entity)),
        };

        let window = Window { from, to: now };
        tracing::debug!(
            source,
            entity,
            from = %window.from,
            to = %window.to,
            "next fetch window"
        );
        Ok(window)
    }

    /// Advance the cursor. Returns false (and changes nothing) when the new
    /// watermark is not strictly greater than the stored one.
    pub fn commit(&self, source: &str, entity: &str, watermark: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.warehouse.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let previous: Option<String> = tx
            .query_row(
                "SELECT watermark FROM load_cursors WHERE source = ?1 AND entity = ?2",
                params![source, entity],
                |row| row.get(0),
            )
            .optional()?;

        let changed = tx.execute(
            "INSERT INTO load_cursors (source, entity, watermark, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(source, entity) DO UPDATE SET
                watermark = excluded.watermark,
                updated_at = excluded.updated_at
             WHERE excluded.watermark > load_cursors.watermark",
            params![
                source,
                entity,
                format_instant(&watermark),
                format_instant(&Utc::now())
            ],
        )?;

        if changed == 0 {
            tx.rollback()?;
            tracing::warn!(
                source,
                entity,
                watermark = %watermark,
                previous = previous.as_deref().unwrap_or("-"),
                "cursor not advanced"
            );
            return Ok(false);
        }

        let event = Event::new(
            audit::CURSOR_ADVANCED,
            entity,
            source,
            serde_json::json!({
                "from": previous,
                "to": format_instant(&watermark),
            }),
            "cursor_manager",
        );
        audit::insert_event(&tx, &event)?;
        tx.commit()?;

        tracing::info!(source, entity, watermark = %watermark, "cursor advanced");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WarehouseConfig;
    use crate::schema::SchemaRegistry;
    use chrono::TimeZone;

    fn manager(dir: &tempfile::TempDir) -> CursorManager {
        let config = WarehouseConfig {
            path: dir.path().join("cursor.db"),
            ..WarehouseConfig::default()
        };
        let warehouse = Warehouse::open(&config, &SchemaRegistry::new()).unwrap();
        CursorManager::new(Arc::new(warehouse), IngestConfig::default())
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_first_window_uses_lookback() {
        let dir = tempfile::tempdir().unwrap();
        let cursors = manager(&dir);

        let now = at(2024, 6, 1);
        let window = cursors.next_window_at("yahoo_finance", "stock_prices", now).unwrap();
        assert_eq!(window.to, now);
        assert_eq!(window.from, now - Duration::days(730));
    }

    #[test]
    fn test_window_starts_at_committed_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let cursors = manager(&dir);

        assert!(cursors.commit("yahoo_finance", "stock_prices", at(2024, 1, 3)).unwrap());
        let window = cursors
            .next_window_at("yahoo_finance", "stock_prices", at(2024, 1, 10))
            .unwrap();

        assert_eq!(window.from, at(2024, 1, 3));
        assert!(window.contains(&at(2024, 1, 3)));
        assert!(!window.contains(&at(2024, 1, 10)));
    }

    #[test]
    fn test_commit_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let cursors = manager(&dir);

        assert!(cursors.commit("newsapi", "news", at(2024, 3, 1)).unwrap());
        // equal and older watermarks do nothing
        assert!(!cursors.commit("newsapi", "news", at(2024, 3, 1)).unwrap());
        assert!(!cursors.commit("newsapi", "news", at(2024, 2, 1)).unwrap());
        assert_eq!(cursors.cursor("newsapi", "news").unwrap(), Some(at(2024, 3, 1)));

        assert!(cursors.commit("newsapi", "news", at(2024, 3, 2)).unwrap());
        assert_eq!(cursors.cursor("newsapi", "news").unwrap(), Some(at(2024, 3, 2)));
    }

    #[test]
    fn test_cursors_are_per_source() {
        let dir = tempfile::tempdir().unwrap();
        let cursors = manager(&dir);

        cursors.commit("sec_edgar", "sec_filings", at(2024, 5, 1)).unwrap();
        assert_eq!(cursors.cursor("other_feed", "sec_filings").unwrap(), None);
    }

    #[test]
    fn test_advance_is_audited() {
        let dir = tempfile::tempdir().unwrap();
        let cursors = manager(&dir);

        cursors.commit("newsapi", "news", at(2024, 3, 1)).unwrap();
        cursors.commit("newsapi", "news", at(2024, 1, 1)).unwrap();

        let conn = cursors.warehouse.connect().unwrap();
        let events = audit::get_events_for_entity(&conn, "news", "newsapi").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, audit::CURSOR_ADVANCED);
    }
}
