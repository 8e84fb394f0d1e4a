// 🚰 Pipeline - wires registry, cursors, scorer, loader, transforms and scheduler
//
// Load path per (source, entity):
//   window -> fetch -> score -> [cancel check] -> merge -> cursor commit
// The cursor only moves after the merge transaction has committed.

use crate::checks::{self, CheckReport};
use crate::config::PipelineConfig;
use crate::connector::SourceConnector;
use crate::cursor::{CursorManager, Window};
use crate::error::{PipelineError, Result};
use crate::loader::{LoadResult, MergeLoader};
use crate::quality::{BatchSummary, QualityScorer};
use crate::record::ScoredRecord;
use crate::scheduler::{CancelToken, Scheduler, Unit, UnitStatus};
use crate::schema::SchemaRegistry;
use crate::staging;
use crate::transforms::{TransformContext, TransformRegistry};
use crate::warehouse::{read_raw, Warehouse};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub entity: String,
    pub source: String,
    pub window: Window,
    pub fetched: usize,
    pub result: LoadResult,
    pub quality: BatchSummary,
    pub cursor_advanced: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransformReport {
    pub entity: String,
    pub as_of: DateTime<Utc>,
    pub rows: usize,
    pub invalid: usize,
}

/// What a unit of a full run produced
#[derive(Debug, Clone)]
pub enum StageOutcome {
    Loaded(LoadReport),
    Transformed(TransformReport),
    Checked(CheckReport),
}

/// A connector bound to the entity it should feed
#[derive(Clone)]
pub struct LoadJob {
    pub entity: String,
    pub connector: Arc<dyn SourceConnector>,
}

impl LoadJob {
    pub fn new(entity: impl Into<String>, connector: Arc<dyn SourceConnector>) -> Self {
        LoadJob {
            entity: entity.into(),
            connector,
        }
    }
}

/// Cheap to clone; every clone shares the same warehouse and cancel token
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    registry: Arc<SchemaRegistry>,
    warehouse: Arc<Warehouse>,
    cursors: Arc<CursorManager>,
    scorer: Arc<QualityScorer>,
    loader: Arc<MergeLoader>,
    transforms: Arc<TransformRegistry>,
    cancel: CancelToken,
}

impl Pipeline {
    /// Validate configuration and open the warehouse. Fails before any write
    /// if the configuration is unusable.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let registry = Arc::new(SchemaRegistry::new());
        config.validate(&registry)?;

        let warehouse = Arc::new(Warehouse::open(&config.warehouse, &registry)?);
        let cursors = Arc::new(CursorManager::new(warehouse.clone(), config.ingest.clone()));
        let scorer = Arc::new(QualityScorer::new(config.quality.clone()));
        let loader = Arc::new(MergeLoader::new(warehouse.clone(), registry.clone()));

        tracing::info!(
            warehouse = %config.warehouse.path.display(),
            concurrency = config.concurrency_limit,
            "pipeline ready"
        );

        Ok(Pipeline {
            config: Arc::new(config),
            registry,
            warehouse,
            cursors,
            scorer,
            loader,
            transforms: Arc::new(TransformRegistry::new()),
            cancel: CancelToken::new(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn warehouse(&self) -> &Warehouse {
        &self.warehouse
    }

    pub fn cursors(&self) -> &CursorManager {
        &self.cursors
    }

    /// Token shared by every unit this pipeline schedules
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn scheduler(&self) -> Result<Scheduler> {
        Scheduler::new(self.config.concurrency_limit)
    }

    fn ensure_not_cancelled(&self, what: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(PipelineError::Cancelled(what.to_string()))
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // LOAD
    // ========================================================================

    /// Incremental load of one entity from one source
    pub fn load_entity(&self, entity: &str, connector: &dyn SourceConnector) -> Result<LoadReport> {
        let schema = self.registry.get(entity)?;
        let source = connector.name().to_string();
        self.ensure_not_cancelled(&format!("load of {}", entity))?;

        let window = self.cursors.next_window(&source, entity)?;
        let records = connector.fetch(schema, &window)?;
        let fetched = records.len();

        let mut reports = Vec::with_capacity(fetched);
        let scored: Vec<ScoredRecord> = records
            .into_iter()
            .map(|record| {
                // score typed values where the record conforms
                let basis = schema.conform(&record).unwrap_or_else(|_| record.clone());
                let report = self.scorer.assess(schema, &basis);
                let score = report.score;
                reports.push(report);
                ScoredRecord::new(record, score)
            })
            .collect();
        let quality = self.scorer.batch_summary(&reports);

        // Last point at which a cancelled run may stop
        self.ensure_not_cancelled(&format!("merge of {}", entity))?;
        let result = self.loader.load(entity, scored)?;

        let watermark = match &schema.watermark {
            Some(_) => result.high_watermark,
            // no watermark field: the window end, once something actually changed
            None if result.inserted + result.updated > 0 => Some(window.to),
            None => None,
        };
        let cursor_advanced = match watermark {
            Some(at) => self.cursors.commit(&source, entity, at)?,
            None => false,
        };

        if result.all_rejected() {
            tracing::warn!(entity, source = %source, rejected = result.rejected, "every record rejected");
        }

        Ok(LoadReport {
            entity: entity.to_string(),
            source,
            window,
            fetched,
            result,
            quality,
            cursor_advanced,
        })
    }

    /// Load several entities concurrently, one unit per job
    pub fn load_many(&self, jobs: Vec<LoadJob>) -> Result<BTreeMap<String, UnitStatus<LoadReport>>> {
        let mut units = Vec::with_capacity(jobs.len());
        for job in jobs {
            self.registry.get(&job.entity)?;
            let pipeline = self.clone();
            units.push(Unit::new(job.entity.clone(), move || {
                pipeline.load_entity(&job.entity, job.connector.as_ref())
            }));
        }

        self.scheduler()?.run(units, &self.cancel)
    }

    // ========================================================================
    // TRANSFORM
    // ========================================================================

    /// Rebuild one staging table from the current raw rows
    pub fn transform_entity(&self, entity: &str, ctx: &TransformContext) -> Result<TransformReport> {
        let schema = self.registry.get(entity)?;
        let kind = self.transforms.resolve(entity)?;
        self.ensure_not_cancelled(&format!("transform of {}", entity))?;

        let mut conn = self.warehouse.connect()?;
        let raw = read_raw(&conn, schema)?;
        let output = kind.transform(&raw, ctx);
        let rows = staging::materialize(&mut conn, schema, kind, &output)?;

        tracing::info!(entity, rows, invalid = output.invalid, "staging rebuilt");
        Ok(TransformReport {
            entity: entity.to_string(),
            as_of: ctx.as_of,
            rows,
            invalid: output.invalid,
        })
    }

    /// Resolve the selection (all entities when `None`); unknown names are fatal
    fn select(&self, select: Option<&[String]>) -> Result<Vec<String>> {
        let names = match select {
            Some(names) if !names.is_empty() => names.to_vec(),
            _ => self.transforms.names(),
        };
        for name in &names {
            self.registry.get(name)?;
            self.transforms.resolve(name)?;
        }
        Ok(names)
    }

    /// Configured upstream transforms of `entity` that are part of this run
    fn upstream(&self, entity: &str, selected: &BTreeSet<String>) -> Vec<String> {
        self.config
            .transform
            .depends_on
            .get(entity)
            .map(|deps| deps.iter().filter(|d| selected.contains(*d)).cloned().collect())
            .unwrap_or_default()
    }

    pub fn transform(
        &self,
        select: Option<&[String]>,
    ) -> Result<BTreeMap<String, UnitStatus<TransformReport>>> {
        let entities = self.select(select)?;
        let selected: BTreeSet<String> = entities.iter().cloned().collect();
        let ctx = TransformContext::from_config(&self.config.transform, Utc::now());

        let units = entities
            .iter()
            .map(|entity| {
                let pipeline = self.clone();
                let ctx = ctx.clone();
                let name = entity.clone();
                Unit::new(entity.clone(), move || pipeline.transform_entity(&name, &ctx))
                    .after(&self.upstream(entity, &selected))
            })
            .collect();

        self.scheduler()?.run(units, &self.cancel)
    }

    // ========================================================================
    // TEST
    // ========================================================================

    pub fn test(&self) -> Result<CheckReport> {
        let conn = self.warehouse.connect()?;
        let report = checks::run_checks(&conn, &self.registry)?;
        for violation in report.failed().into_iter().filter_map(|r| r.violation()) {
            tracing::warn!(error = %violation, "check failed");
        }
        Ok(report)
    }

    // ========================================================================
    // FULL RUN
    // ========================================================================

    /// Loads, then transforms, then checks, as one dependency graph.
    ///
    /// `load:<entity>` units run concurrently; `transform:<entity>` waits for
    /// its own load and its configured upstream transforms; `check` waits for
    /// every transform.
    pub fn run(&self, jobs: Vec<LoadJob>) -> Result<BTreeMap<String, UnitStatus<StageOutcome>>> {
        let entities = self.select(None)?;
        let selected: BTreeSet<String> = entities.iter().cloned().collect();
        let ctx = TransformContext::from_config(&self.config.transform, Utc::now());

        let mut units: Vec<Unit<StageOutcome>> = Vec::new();
        let mut loaded = BTreeSet::new();
        for job in jobs {
            self.registry.get(&job.entity)?;
            if !loaded.insert(job.entity.clone()) {
                return Err(PipelineError::Scheduler(format!(
                    "more than one load job for {}",
                    job.entity
                )));
            }
            let pipeline = self.clone();
            units.push(Unit::new(format!("load:{}", job.entity), move || {
                pipeline
                    .load_entity(&job.entity, job.connector.as_ref())
                    .map(StageOutcome::Loaded)
            }));
        }

        for entity in &entities {
            let mut deps: Vec<String> = self
                .upstream(entity, &selected)
                .into_iter()
                .map(|d| format!("transform:{}", d))
                .collect();
            if loaded.contains(entity) {
                deps.push(format!("load:{}", entity));
            }

            let pipeline = self.clone();
            let ctx = ctx.clone();
            let name = entity.clone();
            units.push(
                Unit::new(format!("transform:{}", entity), move || {
                    pipeline
                        .transform_entity(&name, &ctx)
                        .map(StageOutcome::Transformed)
                })
                .after(&deps),
            );
        }

        let transforms: Vec<String> = entities.iter().map(|e| format!("transform:{}", e)).collect();
        let pipeline = self.clone();
        units.push(
            Unit::new("check", move || pipeline.test().map(StageOutcome::Checked)).after(&transforms),
        );

        self.scheduler()?.run(units, &self.cancel)
    }
}
