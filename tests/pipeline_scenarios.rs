// End-to-end scenarios: CSV extract -> raw layer -> staging -> checks

use chrono::{Duration, Utc};
use finsage_ingest::staging::read_staging;
use finsage_ingest::warehouse::read_raw;
use finsage_ingest::{
    CsvConnector, EntityKind, IngestConfig, LoadJob, Pipeline, PipelineConfig, UnitStatus, Value,
    WarehouseConfig,
};
use std::path::Path;
use std::sync::Arc;

fn pipeline(dir: &Path) -> Pipeline {
    let config = PipelineConfig {
        warehouse: WarehouseConfig {
            path: dir.join("warehouse.db"),
            ..WarehouseConfig::default()
        },
        // fixtures are dated 2024; keep them inside the first window
        ingest: IngestConfig {
            default_lookback_days: 36_500,
            ..IngestConfig::default()
        },
        ..PipelineConfig::default()
    };
    Pipeline::new(config).unwrap()
}

fn write(dir: &Path, entity: &str, content: &str) {
    std::fs::write(dir.join(format!("{}.csv", entity)), content).unwrap();
}

const PRICES: &str = "\
ticker,date,open,high,low,close,volume
T,2024-01-01,99,101,98,100,1000
T,2024-01-02,101,104,100,103,1200
T,2024-01-03,103,105,102,104,-5
";

#[test]
fn test_daily_return_reaches_staging() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "stock_prices", PRICES);
    let pipeline = pipeline(dir.path());

    let report = pipeline
        .load_entity("stock_prices", &CsvConnector::new(dir.path(), "csv"))
        .unwrap();
    assert_eq!(report.result.inserted, 3);

    let statuses = pipeline.transform(Some(&["stock_prices".to_string()])).unwrap();
    assert!(statuses["stock_prices"].is_success());

    let conn = pipeline.warehouse().connect().unwrap();
    let schema = pipeline.registry().get("stock_prices").unwrap();
    let rows = read_staging(&conn, schema, EntityKind::Prices).unwrap();

    // the negative-volume day never reaches staging
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get("daily_return"), None);
    let ret = rows[1].number("daily_return").unwrap();
    assert!((ret - 0.03).abs() < 1e-9);
    assert!(rows.iter().all(|r| r.is_valid));
}

#[test]
fn test_negative_volume_is_scored_but_kept_in_raw() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "stock_prices", PRICES);
    let pipeline = pipeline(dir.path());

    pipeline
        .load_entity("stock_prices", &CsvConnector::new(dir.path(), "csv"))
        .unwrap();

    let conn = pipeline.warehouse().connect().unwrap();
    let schema = pipeline.registry().get("stock_prices").unwrap();
    let raw = read_raw(&conn, schema).unwrap();

    assert_eq!(raw.len(), 3);
    let negative = raw
        .iter()
        .find(|r| r.record.get("volume") == &Value::Integer(-5))
        .unwrap();
    assert!(negative.score.value() < 100.0);
    assert_eq!(negative.score.value(), 80.0);
    assert!(raw
        .iter()
        .filter(|r| r.record.get("volume") != &Value::Integer(-5))
        .all(|r| r.score.value() == 100.0));
}

#[test]
fn test_news_sentiment_in_staging() {
    let dir = tempfile::tempdir().unwrap();
    let day = |n: i64| (Utc::now() - Duration::days(n)).format("%Y-%m-%d %H:%M:%S").to_string();
    write(
        dir.path(),
        "news",
        &format!(
            "article_id,title,url,published_at,author\n\
             a1,Company reports record profit growth,https://n.example/a1,{},Ann\n\
             a2,Company posts steep loss,https://n.example/a2,{},Bo\n\
             a3,Company holds annual meeting,https://n.example/a3,{},Cy\n\
             a4,Company reports record profit growth,https://n.example/a4,{},Di\n",
            day(3),
            day(2),
            day(1),
            day(400)
        ),
    );
    let pipeline = pipeline(dir.path());

    pipeline
        .load_entity("news", &CsvConnector::new(dir.path(), "newsapi"))
        .unwrap();
    let statuses = pipeline.transform(Some(&["news".to_string()])).unwrap();
    assert!(statuses["news"].is_success());

    let conn = pipeline.warehouse().connect().unwrap();
    let schema = pipeline.registry().get("news").unwrap();
    let rows = read_staging(&conn, schema, EntityKind::News).unwrap();

    let sentiment: Vec<(String, String)> = rows
        .iter()
        .map(|r| {
            (
                r.get("article_id").and_then(Value::as_str).unwrap().to_string(),
                r.get("sentiment").and_then(Value::as_str).unwrap().to_string(),
            )
        })
        .collect();

    // a4 is older than the six-month window
    assert_eq!(
        sentiment,
        vec![
            ("a1".to_string(), "positive".to_string()),
            ("a2".to_string(), "negative".to_string()),
            ("a3".to_string(), "neutral".to_string()),
        ]
    );
}

#[test]
fn test_rerun_of_unchanged_window_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "stock_prices", PRICES);
    let pipeline = pipeline(dir.path());
    let connector = CsvConnector::new(dir.path(), "csv");

    let first = pipeline.load_entity("stock_prices", &connector).unwrap();
    assert!(first.cursor_advanced);
    let cursor = pipeline.cursors().cursor("csv", "stock_prices").unwrap();

    let conn = pipeline.warehouse().connect().unwrap();
    let schema = pipeline.registry().get("stock_prices").unwrap();
    let before = read_raw(&conn, schema).unwrap();

    let second = pipeline.load_entity("stock_prices", &connector).unwrap();
    assert_eq!(second.result.inserted, 0);
    assert_eq!(second.result.updated, 0);
    // only the boundary day is re-fetched
    assert_eq!(second.result.unchanged, 1);
    assert!(!second.cursor_advanced);

    assert_eq!(pipeline.cursors().cursor("csv", "stock_prices").unwrap(), cursor);
    assert_eq!(read_raw(&conn, schema).unwrap(), before);
}

#[test]
fn test_fully_rejected_batch_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "stock_prices",
        "ticker,date,close\n,2024-01-02,10\nT,,11\n",
    );
    let pipeline = pipeline(dir.path());

    let report = pipeline
        .load_entity("stock_prices", &CsvConnector::new(dir.path(), "csv"))
        .unwrap();
    assert_eq!(report.result.rejected, 2);
    assert!(report.result.all_rejected());
    assert!(!report.cursor_advanced);
}

#[test]
fn test_full_run_then_checks_pass() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "stock_prices", PRICES);
    write(
        dir.path(),
        "sec_filings",
        "ticker,concept,period_end,fiscal_period,fiscal_year,value,filed_date\n\
         AAPL,Revenues,2024-09-28,FY,2024,391035000000,2024-11-01\n\
         AAPL,Revenues,2024-06-29,Q3,2024,85777000000,2024-08-02\n",
    );
    let pipeline = pipeline(dir.path());
    let connector = Arc::new(CsvConnector::new(dir.path(), "csv"));

    let jobs = vec![
        LoadJob::new("stock_prices", connector.clone()),
        LoadJob::new("sec_filings", connector),
    ];
    let statuses = pipeline.run(jobs).unwrap();

    for (unit, status) in &statuses {
        assert!(status.is_success(), "{} was {}", unit, status.label());
    }
    assert!(matches!(statuses["check"], UnitStatus::Succeeded(_)));
    assert!(pipeline.test().unwrap().passed());

    let conn = pipeline.warehouse().connect().unwrap();
    let schema = pipeline.registry().get("sec_filings").unwrap();
    let rows = read_staging(&conn, schema, EntityKind::Filings).unwrap();
    let frequencies: Vec<&str> = rows
        .iter()
        .filter_map(|r| r.get("reporting_frequency").and_then(Value::as_str))
        .collect();
    // ordered by primary key: period_end 2024-06-29 first
    assert_eq!(frequencies, vec!["quarterly", "annual"]);
}

#[test]
fn test_fractional_timestamps_keep_checks_green() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "news",
        "article_id,title,url,published_at\n\
         a1,Company reports record profit growth,https://n.example/a1,2024-03-01T02:47:21.500Z\n",
    );
    let pipeline = pipeline(dir.path());

    let report = pipeline
        .load_entity("news", &CsvConnector::new(dir.path(), "newsapi"))
        .unwrap();
    assert!(report.cursor_advanced);

    let conn = pipeline.warehouse().connect().unwrap();
    let schema = pipeline.registry().get("news").unwrap();
    let raw = read_raw(&conn, schema).unwrap();
    let published = raw[0].record.get("published_at").watermark().unwrap();
    assert_eq!(
        Some(published),
        pipeline.cursors().cursor("newsapi", "news").unwrap()
    );
    assert_eq!(published.timestamp_subsec_millis(), 500);

    let checks = pipeline.test().unwrap();
    assert!(checks.passed(), "{:?}", checks.failed());
}
