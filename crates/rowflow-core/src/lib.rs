// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! rowflow-core: order-preserving parallel row transforms.
//!
//! A [`RowTransform`] computes extra cells for every row of a [`RowSource`].
//! The [`Engine`] runs it on a pool of worker threads and hands the results to
//! a [`ResultRouter`] strictly in source order. Resources a row computation
//! creates are registered with a [`CleanupLedger`] wave and released when the
//! row finishes, whether it succeeded, failed or panicked. Repeated warnings
//! are folded by the [`WarningConsolidator`] into a short run summary.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod channel;
mod cleanup;
mod error;
mod guarded;
mod processor;
mod progress;
mod resolve;
mod router;
mod table;
mod transform;
mod warnings;

/// Output channels and sinks.
pub use channel::{JsonLinesSink, OutputChannel, OutputSink, TableSink};
/// Wave-scoped resource release.
pub use cleanup::{CleanupLedger, ReleaseReport, ResourceHandle, WaveId, WaveScope};
/// Error types of setup, rows, release and output.
pub use error::{ChannelError, ConfigError, EngineError, ReleaseError, RowError};
/// Per-thread or shared lazily built values.
pub use guarded::{LifeCycle, SafeGuarded};
/// The parallel engine and its settings.
pub use processor::{
    Engine, Pipeline, ProcessorConfig, RunOutcome, RunReport, DEFAULT_BATCH_SIZE,
    DEFAULT_PROGRESS_INTERVAL, MAX_BATCH_SIZE, MAX_IN_FLIGHT, MAX_WORKERS,
};
/// Progress reporting and cancellation.
pub use progress::{CancelFlag, LogProgress, NoProgress, ProgressSink};
/// Typed input column access.
pub use resolve::{EmptyCellPolicy, InputColumn};
/// Result routing policies.
pub use router::{
    merged_columns, AppendRouter, ReplaceRouter, ResultRouter, Route, SplitRouter, TargetRouter,
};
/// Tabular data model.
pub use table::{Cell, CellKind, ColumnSpec, IterSource, Row, RowKey, RowSource, Table};
/// The per-row computation contract.
pub use transform::{FnTransform, RowContext, RowFailurePolicy, RowTransform};
/// Warning consolidation.
pub use warnings::{
    Context, SnapshotEntry, Suppression, SummaryFilter, WarningConsolidator, WarningSnapshot,
    BATCH_CONTEXT_ID, DEFAULT_CONTEXT_ID, DEFAULT_DISPLAY_CAP, RESOURCE_CONTEXT_ID,
    ROW_CONTEXT_ID,
};
