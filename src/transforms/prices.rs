// Daily prices: per-ticker daily return, then the validity gate.
//
// The lag is taken over every raw row of the ticker before filtering, so an
// invalid day still serves as the previous close for the next one.

use super::{gt, gte, StagingRecord, TransformContext, TransformOutput};
use crate::record::{ScoredRecord, Value};
use std::collections::BTreeMap;

pub fn transform(raw: &[ScoredRecord], _ctx: &TransformContext) -> TransformOutput {
    let mut by_ticker: BTreeMap<String, Vec<&ScoredRecord>> = BTreeMap::new();
    for row in raw {
        let ticker = row.record.get("ticker").as_str().unwrap_or_default().to_string();
        by_ticker.entry(ticker).or_default().push(row);
    }

    let mut output = TransformOutput::default();
    for rows in by_ticker.values_mut() {
        rows.sort_by_key(|r| r.record.get("date").as_date());

        let mut prev_close: Option<f64> = None;
        for row in rows.iter() {
            let mut staged = StagingRecord::from_raw(row);
            let close = staged.number("close");

            let daily_return = match (close, prev_close) {
                (Some(c), Some(p)) if p != 0.0 => Some((c - p) / p),
                _ => None,
            };
            staged.set("daily_return", daily_return.map(Value::Float).unwrap_or(Value::Null));

            let valid = is_valid(&staged);
            output.push(staged, valid);
            prev_close = close;
        }
    }

    output
}

/// close present and positive, volume >= 0, high >= low
pub fn is_valid(row: &StagingRecord) -> bool {
    let close = row.number("close");
    close.is_some()
        && gt(close, Some(0.0))
        && gte(row.number("volume"), Some(0.0))
        && gte(row.number("high"), row.number("low"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransformConfig;
    use crate::transforms::fixtures::scored;
    use chrono::{NaiveDate, Utc};

    fn day(ticker: &str, date: &str, close: f64, volume: i64) -> ScoredRecord {
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap();
        scored(
            "stock_prices",
            &[
                ("ticker", Value::text(ticker)),
                ("date", Value::Date(date)),
                ("open", Value::Float(close)),
                ("high", Value::Float(close + 2.0)),
                ("low", Value::Float(close - 2.0)),
                ("close", Value::Float(close)),
                ("volume", Value::Integer(volume)),
            ],
        )
    }

    fn ctx() -> TransformContext {
        TransformContext::from_config(&TransformConfig::default(), Utc::now())
    }

    #[test]
    fn test_daily_return_and_first_row() {
        // input deliberately out of order
        let raw = vec![day("T", "2024-01-02", 103.0, 10), day("T", "2024-01-01", 100.0, 10)];
        let output = transform(&raw, &ctx());

        assert_eq!(output.invalid, 0);
        assert_eq!(output.records.len(), 2);
        assert_eq!(output.records[0].get("daily_return"), None);

        let ret = output.records[1].number("daily_return").unwrap();
        assert!((ret - 0.03).abs() < 1e-9);
    }

    #[test]
    fn test_negative_volume_is_dropped() {
        let raw = vec![day("T", "2024-01-01", 100.0, 10), day("T", "2024-01-02", 103.0, -5)];
        let output = transform(&raw, &ctx());

        assert_eq!(output.invalid, 1);
        assert_eq!(output.records.len(), 1);
        assert!(output.records.iter().all(|r| r.is_valid));
    }

    #[test]
    fn test_lag_spans_invalid_rows() {
        let raw = vec![
            day("T", "2024-01-01", 100.0, 10),
            day("T", "2024-01-02", 110.0, -1),
            day("T", "2024-01-03", 121.0, 10),
        ];
        let output = transform(&raw, &ctx());

        let last = output.records.last().unwrap();
        assert!((last.number("daily_return").unwrap() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_returns_are_per_ticker() {
        let raw = vec![
            day("AAA", "2024-01-01", 10.0, 1),
            day("BBB", "2024-01-02", 50.0, 1),
            day("AAA", "2024-01-02", 11.0, 1),
        ];
        let output = transform(&raw, &ctx());

        let bbb = output
            .records
            .iter()
            .find(|r| r.get("ticker") == Some(&Value::text("BBB")))
            .unwrap();
        assert_eq!(bbb.get("daily_return"), None);
    }

    #[test]
    fn test_missing_volume_or_inverted_range_is_invalid() {
        let mut no_volume = day("T", "2024-01-01", 100.0, 10);
        no_volume.record.fields.remove("volume");
        let inverted = day("T", "2024-01-02", 100.0, 10).record.with("low", Value::Float(500.0));
        let inverted = ScoredRecord::new(inverted, no_volume.score);

        let output = transform(&[no_volume, inverted], &ctx());
        assert_eq!(output.invalid, 2);
        assert!(output.records.is_empty());
    }

    #[test]
    fn test_zero_prior_close_gives_no_return() {
        let zero = day("T", "2024-01-01", 0.0, 10);
        let output = transform(&[zero, day("T", "2024-01-02", 5.0, 10)], &ctx());

        // the zero-close row itself is invalid
        assert_eq!(output.invalid, 1);
        assert_eq!(output.records[0].get("daily_return"), None);
    }
}
