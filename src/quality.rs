// ✅ Quality Scorer - completeness/consistency score per raw record
// Starts at 100 and deducts per issue; pure function of (schema, record)
//
// Quality is NOT validity: a low score never blocks a load. The validity
// predicates in `transforms` are the stricter gate into staging.

use crate::record::RawRecord;
use crate::schema::EntitySchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MAX_SCORE: f64 = 100.0;
pub const MIN_SCORE: f64 = 0.0;

// ============================================================================
// QUALITY SCORE
// ============================================================================

/// Score in [0, 100]; the constructor clamps so the bound always holds
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct QualityScore(f64);

impl QualityScore {
    pub fn new(value: f64) -> Self {
        if value.is_nan() {
            return QualityScore(MIN_SCORE);
        }
        QualityScore(value.clamp(MIN_SCORE, MAX_SCORE))
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

// ============================================================================
// DEDUCTION TABLE
// ============================================================================

/// Deduction rules, read from configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeductionTable {
    /// Per missing required field
    pub missing_required: f64,

    /// Per violated constraint unless overridden below
    pub constraint_violation: f64,

    /// Constraint name -> penalty (e.g. "open_within_range" = 10)
    pub constraint_overrides: BTreeMap<String, f64>,

    /// Entity -> optional-but-expected field -> penalty when absent
    pub missing_expected: BTreeMap<String, BTreeMap<String, f64>>,
}

impl Default for DeductionTable {
    fn default() -> Self {
        let mut constraint_overrides = BTreeMap::new();
        constraint_overrides.insert("open_within_range".to_string(), 10.0);
        constraint_overrides.insert("close_within_range".to_string(), 10.0);

        let expected = |pairs: &[(&str, f64)]| -> BTreeMap<String, f64> {
            pairs.iter().map(|(f, p)| (f.to_string(), *p)).collect()
        };

        let mut missing_expected = BTreeMap::new();
        missing_expected.insert(
            "fundamentals".to_string(),
            expected(&[("net_income", 20.0), ("eps", 10.0), ("pe_ratio", 10.0)]),
        );
        missing_expected.insert(
            "news".to_string(),
            expected(&[("content", 10.0), ("author", 10.0), ("description", 10.0)]),
        );
        missing_expected.insert(
            "sec_filings".to_string(),
            expected(&[
                ("period_start", 10.0),
                ("fiscal_year", 20.0),
                ("accession_no", 10.0),
            ]),
        );

        DeductionTable {
            missing_required: 30.0,
            constraint_violation: 20.0,
            constraint_overrides,
            missing_expected,
        }
    }
}

impl DeductionTable {
    pub fn constraint_penalty(&self, constraint_name: &str) -> f64 {
        self.constraint_overrides
            .get(constraint_name)
            .copied()
            .unwrap_or(self.constraint_violation)
    }
}

// ============================================================================
// QUALITY REPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Severity {
    Critical, // required data missing
    Warning,  // logically inconsistent values
    Info,     // nice-to-have field missing
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityIssue {
    pub severity: Severity,
    pub rule: String,
    pub field: String,
    pub issue: String,
    pub deduction: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub entity: String,
    pub key: String,
    pub score: QualityScore,
    pub issues: Vec<QualityIssue>,
}

impl QualityReport {
    pub fn summary(&self) -> String {
        format!(
            "{} [{}] quality {:.1}, issues: {} ({} critical)",
            self.entity,
            self.key,
            self.score.value(),
            self.issues.len(),
            self.issues
                .iter()
                .filter(|i| i.severity == Severity::Critical)
                .count()
        )
    }

    pub fn has_critical_issues(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Critical)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_records: usize,
    pub perfect_count: usize,
    pub critical_issues_count: usize,
    pub average_score: f64,
    pub min_score: f64,
}

// ============================================================================
// QUALITY SCORER
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct QualityScorer {
    deductions: DeductionTable,
}

impl QualityScorer {
    pub fn new(deductions: DeductionTable) -> Self {
        QualityScorer { deductions }
    }

    pub fn deductions(&self) -> &DeductionTable {
        &self.deductions
    }

    /// Score one record. No I/O, no hidden state.
    pub fn score(&self, schema: &EntitySchema, record: &RawRecord) -> QualityScore {
        self.assess(schema, record).score
    }

    /// Score one record and list every deduction that produced the score
    pub fn assess(&self, schema: &EntitySchema, record: &RawRecord) -> QualityReport {
        let mut issues = Vec::new();

        // Rule 1: required fields present
        for field in &schema.required {
            if !record.has(field) {
                issues.push(QualityIssue {
                    severity: Severity::Critical,
                    rule: "required_present".to_string(),
                    field: field.clone(),
                    issue: format!("{} is missing", field),
                    deduction: self.deductions.missing_required,
                });
            }
        }

        // Rule 2: logical constraints hold (unevaluable ones are skipped)
        for constraint in &schema.constraints {
            if constraint.check(record) == Some(false) {
                let name = constraint.name();
                issues.push(QualityIssue {
                    severity: Severity::Warning,
                    deduction: self.deductions.constraint_penalty(&name),
                    field: name.clone(),
                    rule: name,
                    issue: constraint.describe(),
                });
            }
        }

        // Rule 3: optional-but-expected fields present
        if let Some(expected) = self.deductions.missing_expected.get(&schema.name) {
            for (field, penalty) in expected {
                if !record.has(field) {
                    issues.push(QualityIssue {
                        severity: Severity::Info,
                        rule: "expected_present".to_string(),
                        field: field.clone(),
                        issue: format!("{} is not populated", field),
                        deduction: *penalty,
                    });
                }
            }
        }

        let total: f64 = issues.iter().map(|i| i.deduction).sum();

        QualityReport {
            entity: schema.name.clone(),
            key: record.key_label(&schema.primary_key),
            score: QualityScore::new(MAX_SCORE - total),
            issues,
        }
    }

    pub fn assess_batch(&self, schema: &EntitySchema, records: &[RawRecord]) -> Vec<QualityReport> {
        records.iter().map(|r| self.assess(schema, r)).collect()
    }

    pub fn batch_summary(&self, reports: &[QualityReport]) -> BatchSummary {
        if reports.is_empty() {
            return BatchSummary::default();
        }

        let total = reports.len();
        let scores: Vec<f64> = reports.iter().map(|r| r.score.value()).collect();

        BatchSummary {
            total_records: total,
            perfect_count: scores.iter().filter(|s| **s >= MAX_SCORE).count(),
            critical_issues_count: reports.iter().filter(|r| r.has_critical_issues()).count(),
            average_score: scores.iter().sum::<f64>() / total as f64,
            min_score: scores.iter().cloned().fold(MAX_SCORE, f64::min),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;
    use crate::schema::SchemaRegistry;
    use proptest::prelude::*;

    fn full_price() -> RawRecord {
        RawRecord::new("stock_prices", "yahoo_finance")
            .with("ticker", Value::text("T"))
            .with("date", Value::text("2024-01-02"))
            .with("open", Value::Float(101.0))
            .with("high", Value::Float(104.0))
            .with("low", Value::Float(100.0))
            .with("close", Value::Float(103.0))
            .with("volume", Value::Integer(1_000))
    }

    #[test]
    fn test_clean_record_scores_100() {
        let registry = SchemaRegistry::new();
        let scorer = QualityScorer::default();
        let schema = registry.get("stock_prices").unwrap();

        let report = scorer.assess(schema, &full_price());
        assert_eq!(report.score.value(), 100.0);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn test_negative_volume_deducts_constraint_penalty() {
        let registry = SchemaRegistry::new();
        let scorer = QualityScorer::default();
        let schema = registry.get("stock_prices").unwrap();

        let record = full_price().with("volume", Value::Integer(-5));
        let report = scorer.assess(schema, &record);

        assert_eq!(report.score.value(), 80.0);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].rule, "volume_non_negative");
    }

    #[test]
    fn test_missing_required_and_range_penalties() {
        let registry = SchemaRegistry::new();
        let scorer = QualityScorer::default();
        let schema = registry.get("stock_prices").unwrap();

        // open outside [low, high] costs 10, high < low costs 20
        let record = full_price()
            .with("high", Value::Float(99.0))
            .with("open", Value::Float(120.0))
            .with("close", Value::Null);
        let report = scorer.assess(schema, &record);

        assert_eq!(report.score.value(), 100.0 - 30.0 - 20.0 - 10.0);
        assert!(report.has_critical_issues());
    }

    #[test]
    fn test_expected_fields_per_entity() {
        let registry = SchemaRegistry::new();
        let scorer = QualityScorer::default();
        let schema = registry.get("fundamentals").unwrap();

        let record = RawRecord::new("fundamentals", "yahoo_finance")
            .with("ticker", Value::text("AAPL"))
            .with("fiscal_quarter", Value::text("Q4 2024"))
            .with("revenue", Value::Float(1.0e9))
            .with("eps", Value::Float(6.1));

        // net_income (20) and pe_ratio (10) missing
        assert_eq!(scorer.score(schema, &record).value(), 70.0);
    }

    #[test]
    fn test_score_never_drops_below_zero() {
        let registry = SchemaRegistry::new();
        let scorer = QualityScorer::new(DeductionTable {
            missing_required: 60.0,
            ..DeductionTable::default()
        });
        let schema = registry.get("stock_prices").unwrap();

        let bare = RawRecord::new("stock_prices", "yahoo_finance")
            .with("ticker", Value::text("T"))
            .with("date", Value::text("2024-01-02"));
        assert_eq!(scorer.score(schema, &bare).value(), 0.0);
    }

    #[test]
    fn test_batch_summary() {
        let registry = SchemaRegistry::new();
        let scorer = QualityScorer::default();
        let schema = registry.get("stock_prices").unwrap();

        let records = vec![full_price(), full_price().with("volume", Value::Integer(-1))];
        let summary = scorer.batch_summary(&scorer.assess_batch(schema, &records));

        assert_eq!(summary.total_records, 2);
        assert_eq!(summary.perfect_count, 1);
        assert_eq!(summary.average_score, 90.0);
        assert_eq!(summary.min_score, 80.0);
    }

    proptest! {
        #[test]
        fn prop_score_within_bounds(
            open in proptest::option::of(-1.0e6f64..1.0e6),
            high in proptest::option::of(-1.0e6f64..1.0e6),
            low in proptest::option::of(-1.0e6f64..1.0e6),
            close in proptest::option::of(-1.0e6f64..1.0e6),
            volume in proptest::option::of(any::<i64>()),
        ) {
            let registry = SchemaRegistry::new();
            let scorer = QualityScorer::default();
            let schema = registry.get("stock_prices").unwrap();

            let mut record = RawRecord::new("stock_prices", "fuzz")
                .with("ticker", Value::text("T"))
                .with("date", Value::text("2024-01-02"));
            record.set("open", open.map(Value::Float).unwrap_or(Value::Null));
            record.set("high", high.map(Value::Float).unwrap_or(Value::Null));
            record.set("low", low.map(Value::Float).unwrap_or(Value::Null));
            record.set("close", close.map(Value::Float).unwrap_or(Value::Null));
            record.set("volume", volume.map(Value::Integer).unwrap_or(Value::Null));

            let score = scorer.score(schema, &record).value();
            prop_assert!((MIN_SCORE..=MAX_SCORE).contains(&score));
        }
    }
}
