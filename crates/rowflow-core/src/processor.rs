// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Parallel row processing with ordered reassembly.
//!
//! # Execution model
//!
//! The source is cut into batches of `batch_size` rows. Each batch becomes one
//! task per pipeline and is queued on a bounded channel drained by a fixed
//! pool of scoped worker threads. Workers run every row of a task under its
//! own cleanup wave and send the finished batch back. The calling thread is
//! the only consumer: it buffers finished batches per pipeline in a
//! `BTreeMap` keyed by batch sequence number and hands rows to the routers
//! strictly in source order. A batch is handed out only after every pipeline
//! has finished it.
//!
//! At most `max_in_flight` tasks are submitted but not yet drained, which
//! bounds both the task queue and the reassembly buffer.
//!
//! # Determinism
//!
//! Delivery order, delivered cells and warning counts do not depend on the
//! worker count or on scheduling. When a row aborts the run, every row before
//! it is still delivered to every pipeline and no pipeline gets a row after it.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{debug, debug_span, info, instrument, warn};

use crate::cleanup::{CleanupLedger, ReleaseReport};
use crate::error::{panic_message, ChannelError, ConfigError, EngineError, RowError};
use crate::progress::ProgressSink;
use crate::router::ResultRouter;
use crate::table::{Cell, Row, RowKey, RowSource};
use crate::transform::{check_output_columns, RowContext, RowFailurePolicy, RowTransform};
use crate::warnings::{SummaryFilter, WarningConsolidator, DEFAULT_DISPLAY_CAP, ROW_CONTEXT_ID};

/// Default number of rows per batch.
pub const DEFAULT_BATCH_SIZE: usize = 25;
/// Largest accepted batch size.
pub const MAX_BATCH_SIZE: usize = 10_000;
/// Largest accepted worker count.
pub const MAX_WORKERS: usize = 1024;
/// Largest accepted in-flight batch count.
pub const MAX_IN_FLIGHT: usize = MAX_WORKERS * 16;
/// Default number of rows between progress reports.
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 20;

const EMPTY_CELL_MESSAGE: &str = "Encountered empty input cell.";
const NO_ABORT: u64 = u64::MAX;

/// Tuning knobs of the [`Engine`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Worker threads; `None` uses the available parallelism.
    pub workers: Option<usize>,
    /// Rows per batch.
    pub batch_size: usize,
    /// Tasks submitted but not yet drained; `None` means four per worker.
    pub max_in_flight: Option<usize>,
    /// Rows between progress reports.
    pub progress_interval: u64,
    /// Distinct messages per context shown in the warning summary.
    pub warning_display_cap: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            workers: None,
            batch_size: DEFAULT_BATCH_SIZE,
            max_in_flight: None,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            warning_display_cap: DEFAULT_DISPLAY_CAP,
        }
    }
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidSetting {
        name,
        reason: reason.into(),
    }
}

impl ProcessorConfig {
    /// Checks every value is in range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.workers {
            Some(0) => return Err(invalid("workers", "must be at least 1")),
            Some(w) if w > MAX_WORKERS => {
                return Err(invalid("workers", format!("must be at most {MAX_WORKERS}")));
            }
            _ => {}
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(invalid(
                "batch_size",
                format!("must be between 1 and {MAX_BATCH_SIZE}"),
            ));
        }
        match self.max_in_flight {
            Some(0) => return Err(invalid("max_in_flight", "must be at least 1")),
            Some(n) if n > MAX_IN_FLIGHT => {
                return Err(invalid(
                    "max_in_flight",
                    format!("must be at most {MAX_IN_FLIGHT}"),
                ));
            }
            _ => {}
        }
        if self.progress_interval == 0 {
            return Err(invalid("progress_interval", "must be at least 1"));
        }
        if self.warning_display_cap == 0 {
            return Err(invalid("warning_display_cap", "must be at least 1"));
        }
        Ok(())
    }

    /// Worker count after applying the default.
    pub fn effective_workers(&self) -> usize {
        self.workers
            .unwrap_or_else(|| thread::available_parallelism().map_or(1, NonZeroUsize::get))
    }
}

/// One contract: a transform and the router receiving its results.
pub struct Pipeline<'a> {
    transform: &'a dyn RowTransform,
    router: &'a mut dyn ResultRouter,
}

impl<'a> Pipeline<'a> {
    /// Pairs `transform` with `router`.
    pub fn new(transform: &'a dyn RowTransform, router: &'a mut dyn ResultRouter) -> Self {
        Self { transform, router }
    }
}

/// How a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every row was processed and delivered.
    Completed,
    /// Cancellation was requested; rows submitted before it were delivered.
    Cancelled,
}

/// Summary of a finished run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunReport {
    /// How the run ended.
    pub outcome: RunOutcome,
    /// Worker threads used.
    pub workers: usize,
    /// Rows taken from the source.
    pub rows_read: u64,
    /// Rows delivered by every pipeline.
    pub rows_delivered: u64,
    /// Rows delivered per pipeline, in pipeline order.
    pub delivered: Vec<u64>,
    /// Rows that got empty output cells, summed over pipelines.
    pub failed_rows: u64,
    /// Resource releases of the run.
    pub release: ReleaseReport,
    /// Rendered warning summary, if anything was recorded.
    pub warnings: Option<String>,
    /// Wall-clock duration.
    pub elapsed: Duration,
}

impl RunReport {
    /// Number of handles whose release failed.
    pub fn release_failures(&self) -> usize {
        self.release.failures.len()
    }

    /// Whether the run was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.outcome == RunOutcome::Cancelled
    }
}


struct Lane<'a> {
    transform: &'a dyn RowTransform,
    width: usize,
    serial: Option<Mutex<()>>,
}

struct Task {
    lane: usize,
    seq: u64,
    rows: Arc<[(u64, Row)]>,
}

struct Processed {
    index: u64,
    row: Row,
    cells: Vec<Cell>,
    /// Set when the row failed and got empty cells.
    diagnostic: Option<String>,
}

struct Abort {
    index: u64,
    key: RowKey,
    error: RowError,
}

enum BatchOutcome {
    Done(Vec<Processed>),
    /// Rows before the failing one, then the failure.
    Aborted(Vec<Processed>, Abort),
    /// Not run because an earlier batch aborted the run.
    Skipped,
    /// The worker panicked outside of a row.
    Crashed(String),
}

struct BatchDone {
    lane: usize,
    seq: u64,
    outcome: BatchOutcome,
    release: ReleaseReport,
}

/// Read-only state shared by the workers.
#[derive(Clone, Copy)]
struct Shared<'a> {
    lanes: &'a [Lane<'a>],
    ledger: &'a CleanupLedger,
    warnings: &'a WarningConsolidator,
    /// Visible to transforms through `RowContext::stop_requested`.
    stop: &'a AtomicBool,
    /// Lowest aborting batch sequence, `NO_ABORT` until a row aborts. Tasks
    /// after it are skipped; tasks before it still run.
    abort: &'a AtomicU64,
}

/// Diagnostic for a failed row, or `None` when the failure aborts the run.
fn failure_message(policy: RowFailurePolicy, error: &RowError) -> Option<String> {
    match (error, policy) {
        (RowError::EmptyCell { stop: false, .. }, _) => Some(EMPTY_CELL_MESSAGE.to_owned()),
        (RowError::EmptyCell { stop: true, .. }, _) | (_, RowFailurePolicy::StopExecution) => None,
        (_, RowFailurePolicy::DeliverEmpty) => Some(format!(
            "Failed to process data due to {error}. Generating empty result cells."
        )),
    }
}

fn run_row(
    shared: Shared<'_>,
    lane: &Lane<'_>,
    index: u64,
    row: &Row,
) -> (Result<Vec<Cell>, RowError>, ReleaseReport) {
    let scope = shared.ledger.scoped_wave();
    let result = {
        let ctx = RowContext::new(index, row.key(), &scope, shared.warnings, shared.stop);
        let _serial = lane
            .serial
            .as_ref()
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner));
        catch_unwind(AssertUnwindSafe(|| lane.transform.process(row, &ctx)))
    };
    let result = match result {
        Ok(Ok(cells)) if cells.len() == lane.width => Ok(cells),
        Ok(Ok(cells)) => Err(RowError::Arity {
            actual: cells.len(),
            expected: lane.width,
        }),
        Ok(Err(e)) => Err(e),
        Err(payload) => Err(RowError::Panicked(panic_message(payload.as_ref()))),
    };
    (result, scope.finish())
}

fn run_batch(shared: Shared<'_>, task: &Task) -> BatchDone {
    let lane = &shared.lanes[task.lane];
    let mut done = Vec::with_capacity(task.rows.len());
    let mut release = ReleaseReport::default();
    for (index, row) in task.rows.iter().map(|(i, r)| (*i, r)) {
        let (result, report) = run_row(shared, lane, index, row);
        release.merge(report);
        let (cells, diagnostic) = match result {
            Ok(cells) => (cells, None),
            Err(error) => {
                let Some(message) = failure_message(lane.transform.failure_policy(), &error) else {
                    shared.abort.fetch_min(task.seq, Ordering::AcqRel);
                    shared.stop.store(true, Ordering::Release);
                    let abort = Abort {
                        index,
                        key: row.key().clone(),
                        error,
                    };
                    return BatchDone {
                        lane: task.lane,
                        seq: task.seq,
                        outcome: BatchOutcome::Aborted(done, abort),
                        release,
                    };
                };
                debug!(
                    transform = lane.transform.name(),
                    index,
                    key = %row.key(),
                    %error,
                    "row failed; delivering empty cells"
                );
                (Cell::missing_cells(lane.width), Some(message))
            }
        };
        done.push(Processed {
            index,
            row: row.clone(),
            cells,
            diagnostic,
        });
    }
    BatchDone {
        lane: task.lane,
        seq: task.seq,
        outcome: BatchOutcome::Done(done),
        release,
    }
}

fn worker_loop(id: usize, shared: Shared<'_>, tasks: &Receiver<Task>, results: &Sender<BatchDone>) {
    let _span = debug_span!("worker", id).entered();
    for task in tasks {
        let outcome = if task.seq > shared.abort.load(Ordering::Acquire) {
            None
        } else {
            Some(catch_unwind(AssertUnwindSafe(|| run_batch(shared, &task))))
        };
        let done = match outcome {
            Some(Ok(done)) => done,
            Some(Err(payload)) => BatchDone {
                lane: task.lane,
                seq: task.seq,
                outcome: BatchOutcome::Crashed(panic_message(payload.as_ref())),
                release: ReleaseReport::default(),
            },
            None => BatchDone {
                lane: task.lane,
                seq: task.seq,
                outcome: BatchOutcome::Skipped,
                release: ReleaseReport::default(),
            },
        };
        if results.send(done).is_err() {
            break;
        }
    }
}

/// A finished batch of one lane, waiting for its turn.
enum Ready {
    Rows(Vec<Processed>),
    /// Rows before an aborting row.
    LastRows(Vec<Processed>),
    /// A batch that never ran.
    Gap,
}

#[derive(Default)]
struct LaneQueue {
    pending: BTreeMap<u64, Ready>,
    delivered: u64,
}

/// The aborting row that ends the run.
struct AbortAt {
    seq: u64,
    lane: usize,
    abort: Abort,
}

impl AbortAt {
    fn position(&self) -> (u64, u64, usize) {
        (self.seq, self.abort.index, self.lane)
    }
}

/// The reassembly side of a run. Lives on the calling thread.
///
/// Batch `seq` is delivered only once every lane has returned it, lane by
/// lane, so an abort in one lane cuts every lane at the same row.
struct Consumer<'e, 'p> {
    pipelines: &'e mut [Pipeline<'p>],
    queues: Vec<LaneQueue>,
    next_seq: u64,
    halted: bool,
    warnings: &'e WarningConsolidator,
    progress: &'e dyn ProgressSink,
    total: Option<u64>,
    interval: u64,
    completed: u64,
    last_report: u64,
    last_key: Option<RowKey>,
    failed_rows: u64,
    release: ReleaseReport,
    /// Earliest aborting row by `(seq, index, lane)`.
    abort: Option<AbortAt>,
    failure: Option<EngineError>,
}

impl<'e, 'p> Consumer<'e, 'p> {
    fn new(
        pipelines: &'e mut [Pipeline<'p>],
        warnings: &'e WarningConsolidator,
        progress: &'e dyn ProgressSink,
        total: Option<u64>,
        interval: u64,
    ) -> Self {
        let queues = pipelines.iter().map(|_| LaneQueue::default()).collect();
        Self {
            pipelines,
            queues,
            next_seq: 0,
            halted: false,
            warnings,
            progress,
            total,
            interval,
            completed: 0,
            last_report: 0,
            last_key: None,
            failed_rows: 0,
            release: ReleaseReport::default(),
            abort: None,
            failure: None,
        }
    }

    fn accepting(&self) -> bool {
        self.abort.is_none() && self.failure.is_none()
    }

    /// Finished tasks waiting for delivery.
    fn buffered(&self) -> usize {
        self.queues.iter().map(|q| q.pending.len()).sum()
    }

    fn halt(&mut self) {
        self.halted = true;
        for q in &mut self.queues {
            q.pending.clear();
        }
    }

    fn fail(&mut self, err: EngineError) {
        if self.failure.is_none() {
            self.failure = Some(err);
        }
        self.halt();
    }

    fn accept(&mut self, done: BatchDone) {
        done.release.record_into(self.warnings);
        self.release.merge(done.release);
        let ready = match done.outcome {
            BatchOutcome::Done(rows) => Ready::Rows(rows),
            BatchOutcome::Aborted(rows, abort) => {
                let at = AbortAt {
                    seq: done.seq,
                    lane: done.lane,
                    abort,
                };
                if self
                    .abort
                    .as_ref()
                    .is_none_or(|current| at.position() < current.position())
                {
                    self.abort = Some(at);
                }
                Ready::LastRows(rows)
            }
            BatchOutcome::Skipped => Ready::Gap,
            BatchOutcome::Crashed(message) => {
                self.fail(EngineError::WorkerPanicked(message));
                return;
            }
        };
        if !self.halted {
            self.queues[done.lane].pending.insert(done.seq, ready);
        }
        self.drain();
    }

    fn drain(&mut self) {
        while !self.halted {
            let seq = self.next_seq;
            if !self.queues.iter().all(|q| q.pending.contains_key(&seq)) {
                return;
            }
            self.next_seq += 1;
            // Every batch before `seq` has been seen, so an abort at or
            // before `seq` is already known here.
            let cutoff = match &self.abort {
                Some(at) if at.seq <= seq => Some(at.abort.index),
                _ => None,
            };
            for lane in 0..self.queues.len() {
                let rows = match self.queues[lane].pending.remove(&seq) {
                    Some(Ready::Rows(rows) | Ready::LastRows(rows)) => rows,
                    Some(Ready::Gap) | None => {
                        self.halt();
                        return;
                    }
                };
                let rows = match cutoff {
                    Some(index) => rows.into_iter().take_while(|p| p.index < index).collect(),
                    None => rows,
                };
                self.deliver(lane, rows);
                if self.halted {
                    return;
                }
            }
            if cutoff.is_some() {
                self.halt();
            }
        }
    }

    fn deliver(&mut self, lane: usize, rows: Vec<Processed>) {
        for Processed {
            index,
            row,
            cells,
            diagnostic,
        } in rows
        {
            if let Some(message) = diagnostic {
                self.warnings.save_warning(ROW_CONTEXT_ID, message);
                self.failed_rows += 1;
            }
            if let Err(e) = self.pipelines[lane].router.route(index, &row, cells) {
                self.fail(e.into());
                return;
            }
            self.queues[lane].delivered += 1;
            self.note_progress(row.key());
        }
    }

    fn note_progress(&mut self, key: &RowKey) {
        let completed = self.queues.iter().map(|q| q.delivered).min().unwrap_or(0);
        if completed <= self.completed {
            return;
        }
        self.completed = completed;
        self.last_key = Some(key.clone());
        if completed - self.last_report >= self.interval {
            self.report();
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn report(&mut self) {
        let done = self.completed;
        self.last_report = done;
        let key = self.last_key.as_ref().map_or("", RowKey::as_str);
        let (fraction, message) = match self.total {
            Some(total) => (
                (total > 0).then(|| done as f64 / total as f64),
                format!("Processed row {done}/{total} ('{key}')"),
            ),
            None => (None, format!("Processed row {done} ('{key}')")),
        };
        self.progress.set_progress(fraction, &message);
    }

    fn finish_progress(&mut self) {
        if self.completed > self.last_report {
            self.report();
        }
    }

    /// Closes every router once, whatever happened before.
    fn close_routers(&mut self) {
        let mut first_err: Option<ChannelError> = None;
        for p in self.pipelines.iter_mut() {
            if let Err(e) = p.router.close() {
                warn!(transform = p.transform.name(), error = %e, "closing output failed");
                first_err.get_or_insert(e);
            }
        }
        if let Some(e) = first_err {
            if self.failure.is_none() {
                self.failure = Some(e.into());
            }
        }
    }
}

/// Runs pipelines over row sources.
///
/// The engine owns the cleanup ledger and the warning consolidator of its
/// runs. It can be reused; each run starts with empty warnings.
pub struct Engine {
    config: ProcessorConfig,
    ledger: CleanupLedger,
    warnings: WarningConsolidator,
    filter: SummaryFilter,
    runs: u64,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("ledger", &self.ledger)
            .field("runs", &self.runs)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine after validating `config`.
    pub fn new(config: ProcessorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let warnings = WarningConsolidator::new().with_display_cap(config.warning_display_cap);
        Ok(Self {
            config,
            ledger: CleanupLedger::new(),
            warnings,
            filter: SummaryFilter::default(),
            runs: 0,
        })
    }

    /// Hides matching warnings from the rendered run summary.
    pub fn with_summary_filter(mut self, filter: SummaryFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Engine settings.
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// The cleanup ledger used by runs.
    pub fn ledger(&self) -> &CleanupLedger {
        &self.ledger
    }

    /// Warnings of the last run.
    pub fn warnings(&self) -> &WarningConsolidator {
        &self.warnings
    }

    /// Convenience wrapper for a single pipeline.
    pub fn run_single(
        &mut self,
        source: &dyn RowSource,
        transform: &dyn RowTransform,
        router: &mut dyn ResultRouter,
        progress: &dyn ProgressSink,
    ) -> Result<RunReport, EngineError> {
        let mut pipelines = [Pipeline::new(transform, router)];
        self.run(source, &mut pipelines, progress)
    }

    /// Processes every row of `source` through every pipeline.
    ///
    /// Each pipeline's router sees its rows in source order, whatever the
    /// worker count. Routers are closed exactly once, on success and on error.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Config`] before any row is processed.
    /// - [`EngineError::RowAborted`] when a row fails under
    ///   [`RowFailurePolicy::StopExecution`] or hits an empty cell that must
    ///   stop the run.
    /// - [`EngineError::Channel`] when an output channel fails.
    #[instrument(skip_all, fields(pipelines = pipelines.len()))]
    pub fn run(
        &mut self,
        source: &dyn RowSource,
        pipelines: &mut [Pipeline<'_>],
        progress: &dyn ProgressSink,
    ) -> Result<RunReport, EngineError> {
        let started = Instant::now();
        self.runs += 1;
        self.warnings.clear();
        if pipelines.is_empty() {
            return Err(invalid("pipelines", "at least one pipeline is required").into());
        }
        let input = source.columns();
        for p in pipelines.iter() {
            check_output_columns(p.transform.output_columns())?;
            p.transform.validate(input)?;
            p.router.validate(input, p.transform.output_columns())?;
        }

        let lanes: Vec<Lane<'_>> = pipelines
            .iter()
            .map(|p| Lane {
                transform: p.transform,
                width: p.transform.output_columns().len(),
                serial: (!p.transform.allows_parallel()).then(|| Mutex::new(())),
            })
            .collect();
        let workers = if lanes.iter().all(|l| l.serial.is_some()) {
            1
        } else {
            self.config.effective_workers()
        };
        let max_in_flight = self
            .config
            .max_in_flight
            .unwrap_or(workers * 4)
            .max(lanes.len());
        let batch_size = self.config.batch_size;
        info!(
            run = self.runs,
            workers,
            batch_size,
            max_in_flight,
            "starting run"
        );

        let stop = AtomicBool::new(false);
        let abort = AtomicU64::new(NO_ABORT);
        let shared = Shared {
            lanes: &lanes,
            ledger: &self.ledger,
            warnings: &self.warnings,
            stop: &stop,
            abort: &abort,
        };
        let (task_tx, task_rx) = bounded::<Task>(max_in_flight);
        let (done_tx, done_rx) = unbounded::<BatchDone>();
        let mut consumer = Consumer::new(
            pipelines,
            &self.warnings,
            progress,
            source.row_count(),
            self.config.progress_interval,
        );
        let mut rows_read = 0_u64;
        let mut cancelled = false;

        thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|id| {
                    let tasks = task_rx.clone();
                    let results = done_tx.clone();
                    s.spawn(move || worker_loop(id, shared, &tasks, &results))
                })
                .collect();
            drop(task_rx);
            drop(done_tx);

            let mut rows = source.rows().peekable();
            let mut next_seq = 0_u64;
            let mut outstanding = 0_usize;
            loop {
                while consumer.accepting()
                    && !cancelled
                    && outstanding + consumer.buffered() + lanes.len() <= max_in_flight
                {
                    if rows.peek().is_none() {
                        break;
                    }
                    if progress.check_cancelled() {
                        info!(rows_read, "cancellation requested; draining in-flight batches");
                        stop.store(true, Ordering::Release);
                        cancelled = true;
                        break;
                    }
                    let batch: Vec<(u64, Row)> =
                        (rows_read..).zip(rows.by_ref().take(batch_size)).collect();
                    rows_read += batch.len() as u64;
                    let batch: Arc<[(u64, Row)]> = Arc::from(batch);
                    for lane in 0..lanes.len() {
                        let task = Task {
                            lane,
                            seq: next_seq,
                            rows: Arc::clone(&batch),
                        };
                        if task_tx.send(task).is_err() {
                            consumer.fail(EngineError::WorkerPanicked(
                                "worker pool exited early".to_owned(),
                            ));
                            break;
                        }
                        outstanding += 1;
                    }
                    next_seq += 1;
                }
                if outstanding == 0 {
                    break;
                }
                if let Ok(done) = done_rx.recv() {
                    outstanding -= 1;
                    consumer.accept(done);
                } else {
                    consumer.fail(EngineError::WorkerPanicked(
                        "worker pool exited early".to_owned(),
                    ));
                    break;
                }
            }
            drop(task_tx);
            for handle in handles {
                if let Err(payload) = handle.join() {
                    consumer.fail(EngineError::WorkerPanicked(panic_message(payload.as_ref())));
                }
            }
        });

        consumer.finish_progress();
        consumer.close_routers();
        let stragglers = self.ledger.release_all();
        if stragglers.attempted() > 0 {
            debug!(handles = stragglers.attempted(), "released handles left outside row waves");
        }
        stragglers.record_into(&self.warnings);
        consumer.release.merge(stragglers);

        if let Some(err) = consumer.failure.take() {
            warn!(error = %err, "run failed");
            return Err(err);
        }
        if let Some(AbortAt { lane, abort, .. }) = consumer.abort.take() {
            let transform = lanes[lane].transform.name().to_owned();
            warn!(
                transform,
                index = abort.index,
                key = %abort.key,
                error = %abort.error,
                "run aborted"
            );
            return Err(EngineError::RowAborted {
                transform,
                index: abort.index,
                key: abort.key,
                source: abort.error,
            });
        }

        let delivered: Vec<u64> = consumer.queues.iter().map(|q| q.delivered).collect();
        let rows_delivered = delivered.iter().copied().min().unwrap_or(0);
        let totals = HashMap::from([(ROW_CONTEXT_ID.to_owned(), rows_read)]);
        let report = RunReport {
            outcome: if cancelled {
                RunOutcome::Cancelled
            } else {
                RunOutcome::Completed
            },
            workers,
            rows_read,
            rows_delivered,
            delivered,
            failed_rows: consumer.failed_rows,
            release: std::mem::take(&mut consumer.release),
            warnings: self.warnings.summary_filtered(&self.filter, Some(&totals)),
            elapsed: started.elapsed(),
        };
        info!(
            outcome = ?report.outcome,
            rows = report.rows_delivered,
            failed = report.failed_rows,
            released = report.release.released,
            release_failures = report.release_failures(),
            elapsed = ?report.elapsed,
            "run finished"
        );
        Ok(report)
    }
}
