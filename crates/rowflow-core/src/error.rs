// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Error types for setup, per-row computation, resource release and output.

use thiserror::Error;

use crate::table::{CellKind, RowKey};

/// A problem detected before any row is processed. Always aborts the run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A processor setting is out of range.
    #[error("invalid setting `{name}`: {reason}")]
    InvalidSetting {
        /// Setting name.
        name: &'static str,
        /// Human-readable reason.
        reason: String,
    },
    /// A required input column is absent.
    #[error("input column not found: {0}")]
    MissingColumn(String),
    /// An input column exists but cannot be read as the expected kind.
    #[error("input column `{column}` has kind {actual}, expected {expected}")]
    IncompatibleColumn {
        /// Column name.
        column: String,
        /// Declared kind.
        actual: CellKind,
        /// Kind the transform needs.
        expected: CellKind,
    },
    /// Two output columns share a name, or collide with an input column.
    #[error("duplicate output column: {0}")]
    DuplicateColumn(String),
    /// An output column has an empty name.
    #[error("output column {0} has an empty name")]
    EmptyColumnName(usize),
    /// A router refers to an output cell that the transform does not produce.
    #[error("router expects output cell {index}, but the transform declares {declared}")]
    RouterColumn {
        /// Index the router inspects.
        index: usize,
        /// Number of declared output columns.
        declared: usize,
    },
    /// Invalid warning suppression pattern.
    #[error("invalid suppression pattern `{pattern}`: {reason}")]
    Suppression {
        /// The offending pattern.
        pattern: String,
        /// Parser message.
        reason: String,
    },
    /// Transform-specific validation failure.
    #[error("{0}")]
    Transform(String),
}

/// Failure of a single row's computation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RowError {
    /// Generic computation failure.
    #[error("{0}")]
    Failed(String),
    /// An input cell was empty.
    #[error("empty input cell in column `{column}`")]
    EmptyCell {
        /// Column name.
        column: String,
        /// Whether the empty cell must stop the whole run.
        stop: bool,
    },
    /// A cell holds a value of the wrong kind.
    #[error("column `{column}` holds {actual}, expected {expected}")]
    TypeMismatch {
        /// Column name.
        column: String,
        /// Kind found in the row.
        actual: CellKind,
        /// Kind requested.
        expected: CellKind,
    },
    /// `process` returned the wrong number of cells.
    #[error("produced {actual} output cells, expected {expected}")]
    Arity {
        /// Cells returned.
        actual: usize,
        /// Declared output columns.
        expected: usize,
    },
    /// `process` panicked.
    #[error("panicked: {0}")]
    Panicked(String),
}

impl RowError {
    /// Shorthand for [`RowError::Failed`].
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Failure to release one resource handle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("failed to release {handle}: {reason}")]
pub struct ReleaseError {
    /// Description of the handle (its `describe()` output).
    pub handle: String,
    /// Why the release failed.
    pub reason: String,
}

impl ReleaseError {
    /// Creates a release error.
    pub fn new(handle: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            reason: reason.into(),
        }
    }
}

/// Output channel failure.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// A row was pushed after `close`, or `close` was called twice.
    #[error("output channel `{0}` is already closed")]
    Closed(String),
    /// A router selected a channel it does not have.
    #[error("no output channel with index {index} (router has {available})")]
    NoSuchTarget {
        /// Selected index.
        index: usize,
        /// Number of channels.
        available: usize,
    },
    /// Underlying writer failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A row could not be serialized.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Error returned by a run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Setup rejected the configuration; no row was processed.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// A row failed under the `StopExecution` policy.
    #[error("processing aborted at row {index} ('{key}') in `{transform}`: {source}")]
    RowAborted {
        /// Transform name.
        transform: String,
        /// Original index of the failing row.
        index: u64,
        /// Key of the failing row.
        key: RowKey,
        /// The row's error.
        #[source]
        source: RowError,
    },
    /// Writing to an output channel failed.
    #[error("output channel error: {0}")]
    Channel(#[from] ChannelError),
    /// A worker thread died outside of row processing.
    #[error("worker thread panicked: {0}")]
    WorkerPanicked(String),
}

/// Renders a panic payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
