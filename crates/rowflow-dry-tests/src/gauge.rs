// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Overlap detection for concurrent calls.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Counts calls and the highest number of calls in progress at once.
///
/// Wrap the body under test in [`enter`](Self::enter); the returned guard
/// marks the call finished when dropped.
#[derive(Clone, Debug, Default)]
pub struct ConcurrencyGauge {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
    dwell: Duration,
}

impl ConcurrencyGauge {
    /// A gauge that does not slow calls down.
    pub fn new() -> Self {
        Self::default()
    }

    /// A gauge that sleeps `dwell` inside every call, widening the window in
    /// which overlaps can be observed.
    pub fn with_dwell(dwell: Duration) -> Self {
        Self {
            dwell,
            ..Self::default()
        }
    }

    /// Marks a call as started.
    pub fn enter(&self) -> GaugeGuard<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.dwell.is_zero() {
            thread::sleep(self.dwell);
        }
        GaugeGuard { gauge: self }
    }

    /// Highest number of overlapping calls seen.
    pub fn max_concurrent(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Calls started so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Ends a gauged call on drop.
#[derive(Debug)]
pub struct GaugeGuard<'a> {
    gauge: &'a ConcurrencyGauge,
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.gauge.active.fetch_sub(1, Ordering::SeqCst);
    }
}
