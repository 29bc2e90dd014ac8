// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Progress reporting and cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

/// Receives progress updates and answers cancellation polls.
///
/// Only the thread that called [`crate::Engine::run`] talks to the sink.
pub trait ProgressSink {
    /// `fraction` is `None` when the total row count is unknown.
    fn set_progress(&self, fraction: Option<f64>, message: &str);

    /// Polled before each batch submission.
    fn check_cancelled(&self) -> bool {
        false
    }
}

/// Ignores progress and never cancels.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn set_progress(&self, _fraction: Option<f64>, _message: &str) {}
}

/// A cloneable cancellation switch.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates an unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl ProgressSink for CancelFlag {
    fn set_progress(&self, _fraction: Option<f64>, _message: &str) {}

    fn check_cancelled(&self) -> bool {
        self.is_cancelled()
    }
}

/// Logs progress through `tracing` and honors an optional cancel flag.
#[derive(Clone, Debug, Default)]
pub struct LogProgress {
    cancel: Option<CancelFlag>,
}

impl LogProgress {
    /// Logs progress; never cancels.
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs progress and cancels when `flag` is set.
    pub fn with_cancel(flag: CancelFlag) -> Self {
        Self { cancel: Some(flag) }
    }
}

impl ProgressSink for LogProgress {
    fn set_progress(&self, fraction: Option<f64>, message: &str) {
        match fraction {
            Some(f) => info!(percent = f * 100.0, "{message}"),
            None => info!("{message}"),
        }
    }

    fn check_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled)
    }
}
