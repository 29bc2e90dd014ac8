// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The per-row computation contract.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cleanup::{ResourceHandle, WaveId, WaveScope};
use crate::error::{ConfigError, RowError};
use crate::table::{Cell, ColumnSpec, Row, RowKey};
use crate::warnings::{WarningConsolidator, ROW_CONTEXT_ID};

/// What happens to the run when a row's computation fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowFailurePolicy {
    /// Emit all-missing output cells and record a warning; keep going.
    #[default]
    DeliverEmpty,
    /// Abort the whole run.
    StopExecution,
}

impl fmt::Display for RowFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeliverEmpty => f.write_str("deliver_empty"),
            Self::StopExecution => f.write_str("stop_execution"),
        }
    }
}

/// Per-row services handed to [`RowTransform::process`].
pub struct RowContext<'a> {
    index: u64,
    key: &'a RowKey,
    scope: &'a WaveScope<'a>,
    warnings: &'a WarningConsolidator,
    stop: &'a AtomicBool,
}

impl<'a> RowContext<'a> {
    pub(crate) fn new(
        index: u64,
        key: &'a RowKey,
        scope: &'a WaveScope<'a>,
        warnings: &'a WarningConsolidator,
        stop: &'a AtomicBool,
    ) -> Self {
        Self {
            index,
            key,
            scope,
            warnings,
            stop,
        }
    }

    /// Original index of the row (0-based).
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Key of the row.
    pub fn key(&self) -> &RowKey {
        self.key
    }

    /// Wave under which this row's resources are registered.
    pub fn wave(&self) -> WaveId {
        self.scope.wave()
    }

    /// Registers a resource for release once this row is done.
    pub fn track<H>(&self, handle: Arc<H>) -> Arc<H>
    where
        H: ResourceHandle + 'static,
    {
        self.scope.track(handle)
    }

    /// Registers an optional resource for release once this row is done.
    pub fn track_opt<H>(&self, handle: Option<Arc<H>>) -> Option<Arc<H>>
    where
        H: ResourceHandle + 'static,
    {
        self.scope.track_opt(handle)
    }

    /// Records a warning in the row context.
    pub fn warn(&self, message: impl AsRef<str>) {
        self.warnings.save_warning(ROW_CONTEXT_ID, message);
    }

    /// Records a warning in an arbitrary context.
    pub fn warn_in(&self, context_id: &str, message: impl AsRef<str>) {
        self.warnings.save_warning(context_id, message);
    }

    /// Whether the run is being cancelled or aborted. Long computations may
    /// poll this; the engine never interrupts a row on its own.
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

/// A unit of per-row work.
///
/// Implementations must be `Send + Sync`: the engine calls `process` from
/// several worker threads at once unless `allows_parallel` returns `false`.
pub trait RowTransform: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Columns appended by this transform. `process` must return exactly one
    /// cell per column.
    fn output_columns(&self) -> &[ColumnSpec];

    /// `false` serializes all `process` calls of this transform.
    fn allows_parallel(&self) -> bool {
        true
    }

    /// Policy for rows whose computation fails.
    fn failure_policy(&self) -> RowFailurePolicy {
        RowFailurePolicy::DeliverEmpty
    }

    /// Checks the input layout before any row is processed.
    fn validate(&self, _input: &[ColumnSpec]) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Computes the output cells of one row.
    fn process(&self, row: &Row, ctx: &RowContext<'_>) -> Result<Vec<Cell>, RowError>;
}

/// Rejects empty or duplicate output column names.
pub(crate) fn check_output_columns(columns: &[ColumnSpec]) -> Result<(), ConfigError> {
    let mut seen = HashSet::with_capacity(columns.len());
    for (i, c) in columns.iter().enumerate() {
        if c.name.trim().is_empty() {
            return Err(ConfigError::EmptyColumnName(i));
        }
        if !seen.insert(c.name.as_str()) {
            return Err(ConfigError::DuplicateColumn(c.name.clone()));
        }
    }
    Ok(())
}

/// A [`RowTransform`] backed by a closure.
pub struct FnTransform<F> {
    name: String,
    columns: Vec<ColumnSpec>,
    parallel: bool,
    policy: RowFailurePolicy,
    f: F,
}

impl<F> FnTransform<F>
where
    F: Fn(&Row, &RowContext<'_>) -> Result<Vec<Cell>, RowError> + Send + Sync,
{
    /// Creates a parallel transform with the `DeliverEmpty` policy.
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSpec>, f: F) -> Self {
        Self {
            name: name.into(),
            columns,
            parallel: true,
            policy: RowFailurePolicy::DeliverEmpty,
            f,
        }
    }

    /// Marks the computation as not thread-safe.
    pub fn serial(mut self) -> Self {
        self.parallel = false;
        self
    }

    /// Sets the failure policy.
    pub fn with_policy(mut self, policy: RowFailurePolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl<F> RowTransform for FnTransform<F>
where
    F: Fn(&Row, &RowContext<'_>) -> Result<Vec<Cell>, RowError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn output_columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    fn allows_parallel(&self) -> bool {
        self.parallel
    }

    fn failure_policy(&self) -> RowFailurePolicy {
        self.policy
    }

    fn process(&self, row: &Row, ctx: &RowContext<'_>) -> Result<Vec<Cell>, RowError> {
        (self.f)(row, ctx)
    }
}
