//! The scan runner.
//!
//! A [`Scan`] accumulates constants, derived variables, loop variables,
//! optimizer searches, filters, per-level user actions and hidden-name
//! patterns, then drives the step iterator: every completed iteration of
//! every level is emitted to the recorder (or a local record), promised
//! values are awaited before emission, optimizer targets are fed back
//! automatically, and progress bars track each level without ever
//! blocking the scan.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use data_types::{RecordDescription, RecordId, ScanId, Value};
use expression::Expr;
use futures::future::BoxFuture;
use observability_deps::tracing::{debug, info, warn};
use regex::RegexSet;
use scan_iter::{
    scan_iters, Dimension, FilterFn, FunctionDef, Kwds, LoopSource, LoopSpec, OptimizerConfig,
    OptimizerFactory, ScanConfig, ScanStep, StepStatus,
};
use snafu::Snafu;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;

mod context;
mod progress;
pub mod recipe;
pub mod server;
mod sink;

pub use context::{Promise, StepContext, Stored};
pub use recorder_client::Database;

use progress::ScanProgress;
use sink::Sink;

/// Cap on concurrently promised futures per scan.
const PROMISE_CAPACITY: usize = 100;

/// Errors raised while assembling or running a scan.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("planning scan: {source}"), context(false))]
    Plan { source: scan_iter::Error },

    #[snafu(display("recorder client error: {source}"))]
    Client { source: recorder_client::Error },

    #[snafu(display("record error: {source}"))]
    Record { source: record::Error },

    #[snafu(display("catalog error: {source}"))]
    Catalog { source: record_catalog::Error },

    #[snafu(display("action at level {level} failed: {source}"))]
    Action {
        level: i64,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[snafu(display("promised value for {key:?} failed: {source}"))]
    Promised {
        key: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[snafu(display("invalid hide pattern {pattern:?}: {source}"))]
    HidePattern {
        pattern: String,
        source: regex::Error,
    },

    #[snafu(display("optimizer {name:?} has no search dimensions"))]
    EmptyOptimizer { name: String },

    #[snafu(display("binding port {port}: {source}"))]
    Bind { port: u16, source: std::io::Error },

    #[snafu(display("scan was cancelled"))]
    Cancelled,

    #[snafu(display("scan task panicked or was aborted"))]
    TaskFailed,
}

/// Result alias for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A per-level user action, invoked with the bindings of each iteration
/// body at its level (`-1` mounts on the innermost body).
pub type Action = Arc<dyn Fn(StepContext) -> BoxFuture<'static, std::result::Result<(), BoxError>> + Send + Sync>;

struct OptimizerSpec {
    level: i64,
    maxiter: usize,
    minimize: bool,
    factory: OptimizerFactory,
    dimensions: Vec<Dimension>,
}

impl std::fmt::Debug for OptimizerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimizerSpec")
            .field("level", &self.level)
            .field("maxiter", &self.maxiter)
            .field("minimize", &self.minimize)
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

/// See the crate docs.
pub struct Scan {
    id: ScanId,
    app: String,
    tags: Vec<String>,
    database: Database,
    loops: BTreeMap<i64, Vec<(Vec<String>, LoopSource)>>,
    functions: BTreeMap<String, FunctionDef>,
    constants: Kwds,
    optimizers: BTreeMap<String, OptimizerSpec>,
    actions: BTreeMap<i64, Action>,
    filters: BTreeMap<i64, Vec<FilterFn>>,
    hide_patterns: Vec<String>,
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl std::fmt::Debug for Scan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scan")
            .field("id", &self.id)
            .field("app", &self.app)
            .field("levels", &self.loops.len())
            .field("database", &self.database)
            .finish()
    }
}

impl Scan {
    /// A scan writing to the default local daemon.
    pub fn new(app: impl Into<String>) -> Self {
        Self::with_database(
            app,
            Database::Url(format!("tcp://127.0.0.1:{}", protocol::DEFAULT_PORT)),
        )
    }

    /// A scan writing to an explicit database.
    pub fn with_database(app: impl Into<String>, database: Database) -> Self {
        Self {
            id: ScanId::new(),
            app: app.into(),
            tags: vec![],
            database,
            loops: BTreeMap::new(),
            functions: BTreeMap::new(),
            constants: Kwds::new(),
            optimizers: BTreeMap::new(),
            actions: BTreeMap::new(),
            filters: BTreeMap::new(),
            hide_patterns: vec![r"^__.*".to_string(), r".*__$".to_string()],
            pool: None,
        }
    }

    /// The scan's own id (distinct from the record id).
    pub fn id(&self) -> ScanId {
        self.id
    }

    /// Attach catalog tags.
    pub fn tag(&mut self, tag: impl Into<String>) -> &mut Self {
        self.tags.push(tag.into());
        self
    }

    /// Bind a constant.
    pub fn set_const(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.constants.insert(name.into(), value.into());
        self
    }

    /// Bind a derived variable to an expression over other names.
    pub fn set(&mut self, name: impl Into<String>, expr: Expr) -> &mut Self {
        self.functions.insert(name.into(), FunctionDef::Expr(expr));
        self
    }

    /// Bind a derived variable to a callable with declared dependencies.
    pub fn set_callable(
        &mut self,
        name: impl Into<String>,
        deps: impl IntoIterator<Item = &'static str>,
        f: impl Fn(&Kwds) -> std::result::Result<Value, BoxError> + Send + Sync + 'static,
    ) -> &mut Self {
        self.functions
            .insert(name.into(), FunctionDef::callable(deps, f));
        self
    }

    /// Declare a loop variable at a level. Levels may be sparse; they are
    /// compacted in declaration order when the scan assembles.
    pub fn search(
        &mut self,
        name: impl Into<String>,
        level: i64,
        source: LoopSource,
    ) -> &mut Self {
        self.loops
            .entry(level)
            .or_default()
            .push((vec![name.into()], source));
        self
    }

    /// Declare a tuple of names advancing in lockstep at a level.
    pub fn search_zip(
        &mut self,
        names: impl IntoIterator<Item = &'static str>,
        level: i64,
        source: LoopSource,
    ) -> &mut Self {
        self.loops.entry(level).or_default().push((
            names.into_iter().map(str::to_string).collect(),
            source,
        ));
        self
    }

    /// Declare an optimizer minimizing `target` (a derived or stored
    /// variable) at a level; attach dimensions with [`Scan::search_space`].
    pub fn minimize(&mut self, target: impl Into<String>, level: i64, maxiter: usize) -> &mut Self {
        self.optimizer(target, level, maxiter, true)
    }

    /// Declare an optimizer maximizing `target` at a level.
    pub fn maximize(&mut self, target: impl Into<String>, level: i64, maxiter: usize) -> &mut Self {
        self.optimizer(target, level, maxiter, false)
    }

    fn optimizer(
        &mut self,
        target: impl Into<String>,
        level: i64,
        maxiter: usize,
        minimize: bool,
    ) -> &mut Self {
        self.optimizers.insert(
            target.into(),
            OptimizerSpec {
                level,
                maxiter,
                minimize,
                factory: Arc::new(|dims| Box::new(scan_iter::GridSearch::new(dims))),
                dimensions: vec![],
            },
        );
        self
    }

    /// Replace an optimizer's search policy.
    pub fn optimizer_factory(&mut self, target: &str, factory: OptimizerFactory) -> &mut Self {
        if let Some(spec) = self.optimizers.get_mut(target) {
            spec.factory = factory;
        } else {
            warn!(target, "no optimizer declared under this target");
        }
        self
    }

    /// Attach one search dimension (a loop variable driven by the
    /// optimizer's suggestions) to a declared optimizer.
    pub fn search_space(&mut self, name: impl Into<String>, target: &str, low: f64, high: f64) -> &mut Self {
        match self.optimizers.get_mut(target) {
            Some(spec) => spec.dimensions.push(Dimension::new(name, low, high)),
            None => warn!(target, "no optimizer declared under this target"),
        }
        self
    }

    /// Add a step filter at a level (`-1` applies everywhere).
    pub fn add_filter(
        &mut self,
        level: i64,
        f: impl Fn(&Kwds) -> bool + Send + Sync + 'static,
    ) -> &mut Self {
        self.filters.entry(level).or_default().push(Arc::new(f));
        self
    }

    /// Add an expression filter; evaluation failures pass the step.
    pub fn add_filter_expr(&mut self, level: i64, expr: Expr) -> &mut Self {
        self.add_filter(level, move |kwds: &Kwds| {
            let env = expression::Env::with_variables(kwds.clone());
            match expr.value(&env) {
                Ok(v) => v.is_truthy(),
                Err(e) => {
                    debug!(error = %e, "filter expression failed, passing step");
                    true
                }
            }
        })
    }

    /// Mount a user action at a level; `-1` runs on every innermost step.
    pub fn mount(&mut self, level: i64, action: Action) -> &mut Self {
        self.actions.insert(level, action);
        self
    }

    /// Exclude matching names from emission. The pattern set is
    /// snapshotted into the record description at start.
    pub fn hide(&mut self, pattern: impl Into<String>) -> &mut Self {
        self.hide_patterns.push(pattern.into());
        self
    }

    /// Evaluate independent derived variables on this pool.
    pub fn with_pool(&mut self, pool: Arc<rayon::ThreadPool>) -> &mut Self {
        self.pool = Some(pool);
        self
    }

    /// Start the scan on the current runtime.
    pub fn start(self) -> ScanHandle {
        let id = self.id;
        let cancel = CancellationToken::new();
        let (record_tx, record_rx) = watch::channel(None);
        let token = cancel.clone();
        let task = tokio::spawn(async move { self.run_inner(token, record_tx).await });
        ScanHandle {
            id,
            cancel,
            record_id: record_rx,
            task,
        }
    }

    /// Run to completion in place (mostly for tests and simple scripts).
    pub async fn run(self) -> Result<ScanOutcome> {
        let (record_tx, _record_rx) = watch::channel(None);
        self.run_inner(CancellationToken::new(), record_tx).await
    }

    fn assemble(&self) -> Result<(ScanConfig, Assembled)> {
        let mut loops: Vec<LoopSpec> = vec![];
        let mut level_keys: Vec<i64> = self.loops.keys().copied().collect();
        for spec in self.optimizers.values() {
            if !level_keys.contains(&spec.level) {
                level_keys.push(spec.level);
            }
        }
        level_keys.sort_unstable();

        for declared in &level_keys {
            let mut entries: Vec<(Vec<String>, LoopSource)> = self
                .loops
                .get(declared)
                .cloned()
                .unwrap_or_default();
            for (name, spec) in &self.optimizers {
                if spec.level != *declared {
                    continue;
                }
                if spec.dimensions.is_empty() {
                    return EmptyOptimizerSnafu { name: name.clone() }.fail();
                }
                entries.push((
                    spec.dimensions.iter().map(|d| d.name.clone()).collect(),
                    LoopSource::Optimizer(OptimizerConfig {
                        dimensions: spec.dimensions.clone(),
                        factory: Arc::clone(&spec.factory),
                        maxiter: spec.maxiter,
                        minimize: spec.minimize,
                    }),
                ));
            }
            loops.push(LoopSpec::zip(entries));
        }

        // leveled filters compose into one leaf predicate
        let filter: Option<FilterFn> = if self.filters.is_empty() {
            None
        } else {
            let filters: Vec<FilterFn> = self.filters.values().flatten().cloned().collect();
            Some(Arc::new(move |kwds: &Kwds| {
                filters.iter().all(|f| f(kwds))
            }))
        };

        let hide = RegexSet::new(&self.hide_patterns).map_err(|source| Error::HidePattern {
            pattern: self.hide_patterns.join("|"),
            source,
        })?;

        let totals: BTreeMap<usize, Option<u64>> = loops
            .iter()
            .enumerate()
            .map(|(level, spec)| (level, spec.size_hint().map(|n| n as u64)))
            .collect();

        // feedback wiring for auto-telling optimizers
        let feedback: Vec<FeedbackSpec> = self
            .optimizers
            .iter()
            .map(|(target, spec)| FeedbackSpec {
                target: target.clone(),
                keys: spec.dimensions.iter().map(|d| d.name.clone()).collect(),
                minimize: spec.minimize,
            })
            .collect();

        let config = ScanConfig {
            loops,
            functions: self.functions.clone(),
            constants: self.constants.clone(),
            filter,
            level_marker: true,
            pool: self.pool.clone(),
        };
        Ok((
            config,
            Assembled {
                hide,
                totals,
                feedback,
            },
        ))
    }

    fn description(&self, assembled: &Assembled, axis: &BTreeMap<String, Vec<usize>>) -> RecordDescription {
        RecordDescription {
            app: self.app.clone(),
            tags: self.tags.clone(),
            axis: axis.clone(),
            totals: assembled.totals.clone(),
            ctime: Some(Utc::now()),
            scripts: std::env::args().collect(),
            env: std::env::vars().collect(),
            hidden: self.hide_patterns.clone(),
        }
    }

    async fn run_inner(
        self,
        cancel: CancellationToken,
        record_tx: watch::Sender<Option<RecordId>>,
    ) -> Result<ScanOutcome> {
        let (config, assembled) = self.assemble()?;
        let mut iter = scan_iters(config)?;
        let levels = iter.plan().levels;
        let description = self.description(&assembled, &iter.plan().axis);

        let mut sink = Sink::open(&self.database, description).await?;
        let record_id = sink.record_id();
        record_tx.send(record_id).ok();
        info!(scan = %self.id, record = ?record_id, app = self.app, "scan started");

        let sem = Arc::new(Semaphore::new(PROMISE_CAPACITY));
        let pipes = iter.pipes();
        let progress = ScanProgress::new(&assembled.totals);
        let mut last_kwds = Kwds::new();
        let mut steps_emitted = 0u64;

        let outcome = loop {
            if cancel.is_cancelled() {
                break Err(Error::Cancelled);
            }
            let Some(step) = iter.next() else {
                break Ok(());
            };
            let step = match step {
                Ok(s) => s,
                Err(e) => break Err(e.into()),
            };
            match step {
                ScanStep::Begin(info) => {
                    if info.pos.last() == Some(&0) {
                        progress.reset(info.level);
                    }
                    if let Some(action) = self.actions.get(&(info.level as i64)) {
                        let ctx = StepContext::new(
                            info.iteration,
                            info.pos.clone(),
                            info.kwds.clone(),
                            Arc::clone(&sem),
                            pipes.clone(),
                        );
                        let run = action(ctx.clone());
                        tokio::select! {
                            r = run => {
                                if let Err(source) = r {
                                    break Err(Error::Action { level: info.level as i64, source });
                                }
                            }
                            _ = cancel.cancelled() => break Err(Error::Cancelled),
                        }
                    }
                }
                ScanStep::Step(step) => {
                    match self
                        .handle_step(step, &assembled, &mut sink, &sem, &pipes, levels, &cancel)
                        .await
                    {
                        Ok(kwds) => {
                            steps_emitted += 1;
                            last_kwds = kwds;
                        }
                        Err(e) => break Err(e),
                    }
                }
                ScanStep::End(info) => {
                    progress.update(info.level, 1);
                    // completing an iteration of an outer level emits the
                    // full variable bag at that level
                    if info.level + 1 < levels {
                        let variables = self.visible(&assembled, &info.kwds);
                        let position = info.pos.last().copied().unwrap_or(0);
                        if let Err(e) = sink
                            .append(info.level as i64, info.iteration as u64, position as u64, variables)
                            .await
                        {
                            break Err(e);
                        }
                    }
                }
            }
        };

        // the final synthetic step flushes whatever the scan managed to
        // write, even on a failure path
        if let Err(e) = sink.append(-1, 0, 0, BTreeMap::new()).await {
            warn!(error = %e, "final flush emission failed");
        }
        if let Err(e) = sink.finish().await {
            warn!(error = %e, "closing record failed");
        }
        progress.finish();
        let cache_record = sink.into_cache_record();

        outcome.map(|()| {
            info!(scan = %self.id, steps = steps_emitted, "scan finished");
            ScanOutcome {
                record_id,
                steps: steps_emitted,
                variables: last_kwds,
                cache_record,
            }
        })
    }

    fn visible(&self, assembled: &Assembled, kwds: &Kwds) -> BTreeMap<String, Value> {
        kwds.iter()
            .filter(|(k, _)| !assembled.hide.is_match(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_step(
        &self,
        step: StepStatus,
        assembled: &Assembled,
        sink: &mut Sink,
        sem: &Arc<Semaphore>,
        pipes: &scan_iter::FeedbackPipes,
        levels: usize,
        cancel: &CancellationToken,
    ) -> Result<Kwds> {
        let ctx = StepContext::new(
            step.iteration,
            step.pos.clone(),
            step.kwds.clone(),
            Arc::clone(sem),
            pipes.clone(),
        );
        if let Some(action) = self.actions.get(&-1) {
            let run = action(ctx.clone());
            tokio::select! {
                r = run => r.map_err(|source| Error::Action { level: -1, source })?,
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }

        // merge stored results over the step bindings, awaiting promises
        let mut merged = step.kwds.clone();
        for (key, stored) in ctx.take_stored() {
            let value = match stored {
                Stored::Ready(v) => v,
                Stored::Pending(promise) => promise
                    .await
                    .map_err(|source| Error::Promised { key: key.clone(), source })?,
            };
            merged.insert(key, value);
        }

        // optimizer targets feed back before the level's pipes drain
        for spec in &assembled.feedback {
            let Some(observed) = merged.get(&spec.target) else {
                continue;
            };
            let observed = if spec.minimize {
                observed.clone()
            } else {
                negate(observed)
            };
            let suggested: Vec<Value> = spec
                .keys
                .iter()
                .filter_map(|k| merged.get(k).cloned())
                .collect();
            if suggested.len() == spec.keys.len() {
                let keys: Vec<&str> = spec.keys.iter().map(String::as_str).collect();
                pipes.send(&keys, suggested, observed);
            }
        }

        let variables = self.visible(assembled, &merged);
        sink.append(
            (levels - 1) as i64,
            step.iteration as u64,
            step.pos.last().copied().unwrap_or(0) as u64,
            variables,
        )
        .await?;
        Ok(merged)
    }
}

fn negate(v: &Value) -> Value {
    match v.as_f64() {
        Some(x) => Value::Float(-x),
        None => v.clone(),
    }
}

struct FeedbackSpec {
    target: String,
    keys: Vec<String>,
    minimize: bool,
}

struct Assembled {
    hide: RegexSet,
    totals: BTreeMap<usize, Option<u64>>,
    feedback: Vec<FeedbackSpec>,
}

/// What a finished scan produced.
#[derive(Debug)]
pub struct ScanOutcome {
    /// The record the scan wrote into, when persisted.
    pub record_id: Option<RecordId>,
    /// Innermost steps emitted.
    pub steps: u64,
    /// The variable bag of the last emitted step.
    pub variables: Kwds,
    /// The in-process record of a cache-database scan.
    pub cache_record: Option<record::Record>,
}

/// Handle to a started scan.
#[derive(Debug)]
pub struct ScanHandle {
    id: ScanId,
    cancel: CancellationToken,
    record_id: watch::Receiver<Option<RecordId>>,
    task: tokio::task::JoinHandle<Result<ScanOutcome>>,
}

impl ScanHandle {
    /// The scan's id.
    pub fn id(&self) -> ScanId {
        self.id
    }

    /// Cancel the outer scan task. In-flight promised work is not
    /// cancelled transitively; the record keeps whatever was flushed.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The record id if creation already completed, without waiting.
    pub fn try_record_id(&self) -> Option<RecordId> {
        *self.record_id.borrow()
    }

    /// The record id, as soon as record creation completed.
    pub async fn record_id(&mut self) -> Option<RecordId> {
        loop {
            if let Some(id) = *self.record_id.borrow() {
                return Some(id);
            }
            if self.record_id.changed().await.is_err() {
                return *self.record_id.borrow();
            }
        }
    }

    /// Wait for the scan to finish.
    pub async fn done(self) -> Result<ScanOutcome> {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "scan task join failed");
                Err(Error::TaskFailed)
            }
        }
    }
}
