// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! A progress sink that records what it is told.

use rowflow_core::ProgressSink;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// Records progress messages and answers `true` to cancellation polls once
/// a configured number of polls has been made.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    messages: Mutex<Vec<(Option<f64>, String)>>,
    polls: AtomicUsize,
    cancel_after: Option<usize>,
}

impl RecordingProgress {
    /// Records progress; never cancels.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels from the `polls + 1`-th poll on. `cancel_after(0)` cancels
    /// before the first batch.
    pub fn cancel_after(polls: usize) -> Self {
        Self {
            cancel_after: Some(polls),
            ..Self::default()
        }
    }

    /// Recorded `(fraction, message)` pairs.
    pub fn messages(&self) -> Vec<(Option<f64>, String)> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Cancellation polls so far.
    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

impl ProgressSink for RecordingProgress {
    fn set_progress(&self, fraction: Option<f64>, message: &str) {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((fraction, message.to_owned()));
    }

    fn check_cancelled(&self) -> bool {
        let seen = self.polls.fetch_add(1, Ordering::SeqCst);
        self.cancel_after.is_some_and(|limit| seen >= limit)
    }
}
