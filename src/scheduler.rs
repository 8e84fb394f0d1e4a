// 🗓️ Dependency Scheduler - run units in DAG order on a bounded pool
//
// The graph is validated before anything runs. A unit starts once all its
// dependencies succeeded; a failure blocks its dependents transitively but
// never its siblings. Cancellation stops new starts, running units finish.

use crate::error::{PipelineError, Result};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

pub type Task<T> = Box<dyn FnOnce() -> Result<T> + Send + 'static>;

pub struct Unit<T> {
    pub id: String,
    pub depends_on: Vec<String>,
    task: Task<T>,
}

impl<T> Unit<T> {
    pub fn new(id: impl Into<String>, task: impl FnOnce() -> Result<T> + Send + 'static) -> Self {
        Unit {
            id: id.into(),
            depends_on: Vec::new(),
            task: Box::new(task),
        }
    }

    /// Builder: add dependencies
    pub fn after<S: AsRef<str>>(mut self, deps: &[S]) -> Self {
        self.depends_on
            .extend(deps.iter().map(|d| d.as_ref().to_string()));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnitStatus<T> {
    Succeeded(T),
    Failed(String),
    /// Never started because `blocked_by` (or something it needed) failed
    Skipped { blocked_by: String },
    /// Never started because the run was cancelled
    Cancelled,
}

impl<T> UnitStatus<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, UnitStatus::Succeeded(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            UnitStatus::Succeeded(_) => "succeeded",
            UnitStatus::Failed(_) => "failed",
            UnitStatus::Skipped { .. } => "skipped",
            UnitStatus::Cancelled => "cancelled",
        }
    }

    pub fn output(&self) -> Option<&T> {
        match self {
            UnitStatus::Succeeded(v) => Some(v),
            _ => None,
        }
    }
}

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// GRAPH VALIDATION
// ============================================================================

/// Topological order of the units, or an error for empty/duplicate ids,
/// unknown dependencies and cycles
pub fn topo_sort<T>(units: &[Unit<T>]) -> Result<Vec<String>> {
    let mut indegree: BTreeMap<String, usize> = BTreeMap::new();
    let mut edges: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut ids = BTreeSet::new();

    for u in units {
        if u.id.trim().is_empty() {
            return Err(PipelineError::Scheduler("unit id is empty".to_string()));
        }
        if !ids.insert(u.id.clone()) {
            return Err(PipelineError::Scheduler(format!("duplicate unit id: {}", u.id)));
        }
        indegree.insert(u.id.clone(), 0);
        edges.entry(u.id.clone()).or_default();
    }

    for u in units {
        for dep in &u.depends_on {
            if !ids.contains(dep) {
                return Err(PipelineError::Scheduler(format!(
                    "unit {} depends on unknown unit {}",
                    u.id, dep
                )));
            }
            *indegree.entry(u.id.clone()).or_default() += 1;
            edges.entry(dep.clone()).or_default().push(u.id.clone());
        }
    }

    let mut q: VecDeque<String> = indegree
        .iter()
        .filter_map(|(k, &v)| if v == 0 { Some(k.clone()) } else { None })
        .collect();
    let mut out = Vec::with_capacity(units.len());
    while let Some(n) = q.pop_front() {
        out.push(n.clone());
        if let Some(children) = edges.get(&n) {
            for c in children {
                if let Some(d) = indegree.get_mut(c) {
                    *d -= 1;
                    if *d == 0 {
                        q.push_back(c.clone());
                    }
                }
            }
        }
    }

    if out.len() != units.len() {
        let stuck: Vec<&str> = indegree
            .iter()
            .filter(|(_, &v)| v > 0)
            .map(|(k, _)| k.as_str())
            .collect();
        return Err(PipelineError::Scheduler(format!(
            "units contain a cycle through: {}",
            stuck.join(", ")
        )));
    }

    Ok(out)
}

// ============================================================================
// SCHEDULER
// ============================================================================

#[derive(Debug)]
pub struct Scheduler {
    concurrency_limit: usize,
}

impl Scheduler {
    pub fn new(concurrency_limit: usize) -> Result<Self> {
        if concurrency_limit == 0 {
            return Err(PipelineError::config("concurrency limit must be at least 1"));
        }
        Ok(Scheduler { concurrency_limit })
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    /// Run every unit and report a status for each one
    pub fn run<T: Send + 'static>(
        &self,
        units: Vec<Unit<T>>,
        cancel: &CancelToken,
    ) -> Result<BTreeMap<String, UnitStatus<T>>> {
        topo_sort(&units)?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.concurrency_limit)
            .thread_name(|i| format!("finsage-worker-{i}"))
            .build()
            .map_err(|e| PipelineError::Scheduler(format!("cannot build worker pool: {}", e)))?;

        let mut pending: BTreeMap<String, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut tasks: BTreeMap<String, Task<T>> = BTreeMap::new();
        for unit in units {
            pending.insert(unit.id.clone(), unit.depends_on.len());
            for dep in &unit.depends_on {
                dependents.entry(dep.clone()).or_default().push(unit.id.clone());
            }
            tasks.insert(unit.id, unit.task);
        }

        let mut ready: VecDeque<String> = pending
            .iter()
            .filter(|(_, &n)| n == 0)
            .map(|(id, _)| id.clone())
            .collect();
        let mut blocked: BTreeMap<String, String> = BTreeMap::new();
        let mut statuses: BTreeMap<String, UnitStatus<T>> = BTreeMap::new();

        let (tx, rx) = mpsc::channel::<(String, UnitStatus<T>)>();
        let mut in_flight = 0usize;

        loop {
            // Settle or dispatch everything that is ready right now
            while let Some(id) = ready.pop_front() {
                let status = if let Some(root) = blocked.get(&id) {
                    Some(UnitStatus::Skipped {
                        blocked_by: root.clone(),
                    })
                } else if cancel.is_cancelled() {
                    Some(UnitStatus::Cancelled)
                } else {
                    None
                };

                if let Some(status) = status {
                    tracing::warn!(unit = %id, status = status.label(), "unit not started");
                    settle(&id, status, &dependents, &mut pending, &mut blocked, &mut ready, &mut statuses);
                    continue;
                }

                let Some(task) = tasks.remove(&id) else {
                    continue;
                };
                let tx = tx.clone();
                in_flight += 1;
                tracing::info!(unit = %id, "unit started");

                pool.spawn(move || {
                    let status = match catch_unwind(AssertUnwindSafe(task)) {
                        Ok(Ok(value)) => UnitStatus::Succeeded(value),
                        Ok(Err(e)) => UnitStatus::Failed(e.to_string()),
                        Err(panic) => UnitStatus::Failed(panic_message(panic.as_ref())),
                    };
                    // receiver outlives every spawned unit
                    let _ = tx.send((id, status));
                });
            }

            if in_flight == 0 {
                break;
            }

            let (id, status) = rx
                .recv()
                .map_err(|_| PipelineError::Scheduler("worker pool hung up".to_string()))?;
            in_flight -= 1;

            match &status {
                UnitStatus::Failed(reason) => tracing::warn!(unit = %id, %reason, "unit failed"),
                _ => tracing::info!(unit = %id, status = status.label(), "unit finished"),
            }
            settle(&id, status, &dependents, &mut pending, &mut blocked, &mut ready, &mut statuses);
        }

        Ok(statuses)
    }
}

/// Record a final status and release (or block) the unit's dependents
fn settle<T>(
    id: &str,
    status: UnitStatus<T>,
    dependents: &BTreeMap<String, Vec<String>>,
    pending: &mut BTreeMap<String, usize>,
    blocked: &mut BTreeMap<String, String>,
    ready: &mut VecDeque<String>,
    statuses: &mut BTreeMap<String, UnitStatus<T>>,
) {
    let root = match &status {
        UnitStatus::Failed(_) => Some(id.to_string()),
        UnitStatus::Skipped { blocked_by } => Some(blocked_by.clone()),
        UnitStatus::Succeeded(_) | UnitStatus::Cancelled => None,
    };

    for child in dependents.get(id).into_iter().flatten() {
        if let Some(root) = &root {
            blocked.entry(child.clone()).or_insert_with(|| root.clone());
        }
        if let Some(n) = pending.get_mut(child) {
            *n -= 1;
            if *n == 0 {
                ready.push_back(child.clone());
            }
        }
    }

    statuses.insert(id.to_string(), status);
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
