//! Pipeline configuration.
//!
//! One `PipelineConfig` value is read at startup (TOML file plus a couple of
//! environment overrides), validated, and then passed by reference into every
//! component constructor. Nothing in the crate mutates it afterwards.

use crate::error::{PipelineError, Result};
use crate::quality::DeductionTable;
use crate::schema::SchemaRegistry;
use crate::sentiment::SentimentKeywords;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable that overrides `warehouse.path`
pub const WAREHOUSE_ENV: &str = "FINSAGE_WAREHOUSE";

pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_LOOKBACK_DAYS: i64 = 730;
pub const DEFAULT_RECENCY_MONTHS: u32 = 6;
pub const ANNUAL_PERIOD_SENTINEL: &str = "FY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Worker pool size for load and transform units
    pub concurrency_limit: usize,

    pub warehouse: WarehouseConfig,
    pub ingest: IngestConfig,
    pub transform: TransformConfig,

    /// Quality deduction rules
    pub quality: DeductionTable,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            concurrency_limit: DEFAULT_CONCURRENCY,
            warehouse: WarehouseConfig::default(),
            ingest: IngestConfig::default(),
            transform: TransformConfig::default(),
            quality: DeductionTable::default(),
        }
    }
}

/// Where the raw and staging layers live
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        WarehouseConfig {
            path: PathBuf::new(),
            busy_timeout_ms: 5_000,
        }
    }
}

/// Incremental fetch settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Lookback used when an entity has never been loaded from a source
    pub default_lookback_days: i64,

    /// Per-entity override of the lookback
    pub lookback_days: BTreeMap<String, i64>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            default_lookback_days: DEFAULT_LOOKBACK_DAYS,
            lookback_days: BTreeMap::new(),
        }
    }
}

impl IngestConfig {
    pub fn lookback_for(&self, entity: &str) -> i64 {
        self.lookback_days
            .get(entity)
            .copied()
            .unwrap_or(self.default_lookback_days)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Entity -> recency window in months, evaluated at transform time
    pub recency_months: BTreeMap<String, u32>,

    /// Fiscal period marker that means "annual report"
    pub annual_period_sentinel: String,

    pub sentiment: SentimentKeywords,

    /// Entity -> transform units that must succeed first
    pub depends_on: BTreeMap<String, Vec<String>>,
}

impl Default for TransformConfig {
    fn default() -> Self {
        let mut recency_months = BTreeMap::new();
        recency_months.insert("news".to_string(), DEFAULT_RECENCY_MONTHS);

        TransformConfig {
            recency_months,
            annual_period_sentinel: ANNUAL_PERIOD_SENTINEL.to_string(),
            sentiment: SentimentKeywords::default(),
            depends_on: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| PipelineError::config(format!("invalid configuration: {}", e)))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Apply environment overrides (credentials stay out of config files)
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(path) = std::env::var(WAREHOUSE_ENV) {
            if !path.trim().is_empty() {
                self.warehouse.path = PathBuf::from(path);
            }
        }
        self
    }

    /// Reject anything that would make the run fail halfway.
    ///
    /// Every error here is `FatalConfiguration`, raised before any write.
    pub fn validate(&self, registry: &SchemaRegistry) -> Result<()> {
        if self.warehouse.path.as_os_str().is_empty() {
            return Err(PipelineError::config(format!(
                "warehouse.path is not set (config file or {})",
                WAREHOUSE_ENV
            )));
        }

        if self.concurrency_limit == 0 {
            return Err(PipelineError::config("concurrency_limit must be at least 1"));
        }

        if self.ingest.default_lookback_days <= 0 {
            return Err(PipelineError::config(
                "ingest.default_lookback_days must be positive",
            ));
        }

        for (entity, days) in &self.ingest.lookback_days {
            require_known(registry, entity, "ingest.lookback_days")?;
            if *days <= 0 {
                return Err(PipelineError::config(format!(
                    "ingest.lookback_days.{} must be positive",
                    entity
                )));
            }
        }

        for (entity, months) in &self.transform.recency_months {
            require_known(registry, entity, "transform.recency_months")?;
            if *months == 0 {
                return Err(PipelineError::config(format!(
                    "transform.recency_months.{} must be at least 1",
                    entity
                )));
            }
        }

        for (entity, deps) in &self.transform.depends_on {
            require_known(registry, entity, "transform.depends_on")?;
            for dep in deps {
                require_known(registry, dep, "transform.depends_on")?;
            }
        }

        if self.transform.annual_period_sentinel.trim().is_empty() {
            return Err(PipelineError::config(
                "transform.annual_period_sentinel must not be empty",
            ));
        }

        let keywords = &self.transform.sentiment;
        if keywords
            .positive
            .iter()
            .chain(keywords.negative.iter())
            .any(|k| k.trim().is_empty())
        {
            return Err(PipelineError::config("sentiment keywords must not be blank"));
        }

        for entity in self.quality.missing_expected.keys() {
            require_known(registry, entity, "quality.missing_expected")?;
        }

        let penalties = std::iter::once(self.quality.missing_required)
            .chain(std::iter::once(self.quality.constraint_violation))
            .chain(self.quality.constraint_overrides.values().copied())
            .chain(
                self.quality
                    .missing_expected
                    .values()
                    .flat_map(|m| m.values().copied()),
            );
        for penalty in penalties {
            if !(0.0..=100.0).contains(&penalty) {
                return Err(PipelineError::config(format!(
                    "quality deductions must lie in [0, 100], got {}",
                    penalty
                )));
            }
        }

        Ok(())
    }
}

fn require_known(registry: &SchemaRegistry, entity: &str, section: &str) -> Result<()> {
    if registry.contains(entity) {
        Ok(())
    } else {
        Err(PipelineError::config(format!(
            "{} references unknown entity '{}'",
            section, entity
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> PipelineConfig {
        PipelineConfig {
            warehouse: WarehouseConfig {
                path: PathBuf::from("finsage.db"),
                ..WarehouseConfig::default()
            },
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.concurrency_limit, 4);
        assert_eq!(config.ingest.lookback_for("stock_prices"), 730);
        assert_eq!(config.transform.recency_months["news"], 6);
        assert_eq!(config.transform.annual_period_sentinel, "FY");
        assert_eq!(config.quality.missing_required, 30.0);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = PipelineConfig::from_toml_str(
            r#"
            concurrency_limit = 2

            [warehouse]
            path = "/tmp/finsage.db"

            [ingest.lookback_days]
            news = 30

            [transform.recency_months]
            news = 3

            [transform.sentiment]
            positive = ["rally"]
            negative = ["selloff"]

            [quality.constraint_overrides]
            volume_non_negative = 30.0
            "#,
        )
        .unwrap();

        assert_eq!(config.concurrency_limit, 2);
        assert_eq!(config.warehouse.path, PathBuf::from("/tmp/finsage.db"));
        assert_eq!(config.ingest.lookback_for("news"), 30);
        assert_eq!(config.ingest.lookback_for("stock_prices"), 730);
        assert_eq!(config.transform.recency_months["news"], 3);
        assert_eq!(config.transform.sentiment.positive, vec!["rally"]);
        assert_eq!(config.quality.constraint_penalty("volume_non_negative"), 30.0);
        // untouched sections keep their defaults
        assert_eq!(config.quality.missing_required, 30.0);
        assert!(config.validate(&SchemaRegistry::new()).is_ok());
    }

    #[test]
    fn test_missing_warehouse_is_fatal() {
        let err = PipelineConfig::default()
            .validate(&SchemaRegistry::new())
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("warehouse.path"));
    }

    #[test]
    fn test_unknown_entity_in_config_is_fatal() {
        let mut config = valid();
        config
            .transform
            .depends_on
            .insert("news".to_string(), vec!["options".to_string()]);

        let err = config.validate(&SchemaRegistry::new()).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("options"));
    }

    #[test]
    fn test_zero_concurrency_is_fatal() {
        let config = PipelineConfig {
            concurrency_limit: 0,
            ..valid()
        };
        assert!(config.validate(&SchemaRegistry::new()).is_err());
    }

    #[test]
    fn test_malformed_toml_is_fatal() {
        let err = PipelineConfig::from_toml_str("concurrency_limit = \"many\"").unwrap_err();
        assert!(err.is_fatal());
    }
}
