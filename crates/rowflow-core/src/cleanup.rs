// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Wave-scoped release of externally managed resources.
//!
//! Row computations often create resources whose lifetime is not tied to a
//! Rust owner: native handles, temp files, leases. Each such handle is
//! registered with the [`CleanupLedger`] under a [`WaveId`]; tearing the wave
//! down releases every handle of that wave exactly once, no matter where the
//! computation stopped.
//!
//! # Failure semantics
//!
//! Release is best effort. A handle whose `release` fails or panics is
//! recorded in the [`ReleaseReport`] and logged; the remaining handles of the
//! wave are still released. Release failures are never propagated as errors.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::error::{panic_message, ReleaseError};
use crate::warnings::{WarningConsolidator, RESOURCE_CONTEXT_ID};

static NEXT_WAVE: AtomicU64 = AtomicU64::new(1);

/// Opaque, process-unique identifier grouping resource handles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WaveId(u64);

impl WaveId {
    /// Mints a fresh id. Ids are never reused within a process.
    pub fn next() -> Self {
        Self(NEXT_WAVE.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wave#{}", self.0)
    }
}

/// A resource that must be released explicitly.
pub trait ResourceHandle: Send + Sync {
    /// Releases the underlying resource. Called at most once by the ledger.
    fn release(&self) -> Result<(), ReleaseError>;

    /// Null handles are never registered.
    fn is_null(&self) -> bool {
        false
    }

    /// Short description used in logs and release errors.
    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_owned()
    }
}

/// Outcome of releasing one or more waves.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    /// Handles released successfully.
    pub released: usize,
    /// Handles whose release failed.
    pub failures: Vec<ReleaseError>,
}

impl ReleaseReport {
    /// Whether every attempted release succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Handles attempted (released + failed).
    pub fn attempted(&self) -> usize {
        self.released + self.failures.len()
    }

    /// Folds `other` into `self`.
    pub fn merge(&mut self, other: Self) {
        self.released += other.released;
        self.failures.extend(other.failures);
    }

    /// Counts each failure in the `resource` warning context.
    pub fn record_into(&self, warnings: &WarningConsolidator) {
        for f in &self.failures {
            warnings.save_warning(
                RESOURCE_CONTEXT_ID,
                format!("Failed to release resource: {}", f.reason),
            );
        }
    }
}

struct Entry {
    key: usize,
    handle: Arc<dyn ResourceHandle>,
}

#[derive(Default)]
struct LedgerState {
    waves: HashMap<WaveId, Vec<Entry>>,
    owners: HashMap<usize, WaveId>,
}

/// Tracks resource handles by wave and releases them on demand.
///
/// All methods take `&self`; the ledger is shared by reference between the
/// workers of a run.
#[derive(Default)]
pub struct CleanupLedger {
    state: Mutex<LedgerState>,
}

impl fmt::Debug for CleanupLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("CleanupLedger")
            .field("waves", &state.waves.len())
            .field("outstanding", &state.owners.len())
            .finish()
    }
}

fn handle_key<H: ?Sized>(handle: &Arc<H>) -> usize {
    Arc::as_ptr(handle).cast::<()>().addr()
}

impl CleanupLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mints a fresh wave id.
    pub fn new_wave(&self) -> WaveId {
        WaveId::next()
    }

    /// Mints a wave and returns a scope that releases it when dropped.
    pub fn scoped_wave(&self) -> WaveScope<'_> {
        WaveScope {
            ledger: self,
            wave: self.new_wave(),
            finished: false,
        }
    }

    /// Registers `handle` under `wave` and hands it back.
    ///
    /// Null handles are ignored. A handle that is already registered (under
    /// any wave) stays with its first wave.
    pub fn register<H>(&self, wave: WaveId, handle: Arc<H>) -> Arc<H>
    where
        H: ResourceHandle + 'static,
    {
        if handle.is_null() {
            return handle;
        }
        let key = handle_key(&handle);
        let mut state = self.lock();
        if let Some(owner) = state.owners.get(&key) {
            debug!(%wave, %owner, "handle already registered; keeping first wave");
            return handle;
        }
        state.owners.insert(key, wave);
        let erased: Arc<dyn ResourceHandle> = handle.clone();
        state
            .waves
            .entry(wave)
            .or_default()
            .push(Entry { key, handle: erased });
        handle
    }

    /// [`register`](Self::register) for optional handles; `None` is a no-op.
    pub fn register_opt<H>(&self, wave: WaveId, handle: Option<Arc<H>>) -> Option<Arc<H>>
    where
        H: ResourceHandle + 'static,
    {
        handle.map(|h| self.register(wave, h))
    }

    /// Releases one registered handle ahead of its wave.
    ///
    /// Handles that are not (or no longer) registered are skipped, so a handle
    /// is never released twice through the ledger.
    pub fn release_now<H>(&self, handle: &Arc<H>) -> Result<bool, ReleaseError>
    where
        H: ResourceHandle + 'static,
    {
        let key = handle_key(handle);
        let entry = {
            let mut state = self.lock();
            let Some(wave) = state.owners.remove(&key) else {
                return Ok(false);
            };
            let entries = state.waves.get_mut(&wave);
            let entry = entries.and_then(|list| {
                list.iter()
                    .position(|e| e.key == key)
                    .map(|pos| list.remove(pos))
            });
            if state.waves.get(&wave).is_some_and(Vec::is_empty) {
                state.waves.remove(&wave);
            }
            entry
        };
        match entry {
            Some(e) => release_entry(&e).map(|()| true),
            None => Ok(false),
        }
    }

    /// Releases every handle of `wave`, newest first.
    ///
    /// Releasing an unknown or already released wave returns an empty report.
    pub fn release_wave(&self, wave: WaveId) -> ReleaseReport {
        let entries = {
            let mut state = self.lock();
            let entries = state.waves.remove(&wave).unwrap_or_default();
            for e in &entries {
                state.owners.remove(&e.key);
            }
            entries
        };
        release_entries(entries)
    }

    /// Releases every outstanding wave, oldest wave first.
    pub fn release_all(&self) -> ReleaseReport {
        let mut waves: Vec<(WaveId, Vec<Entry>)> = {
            let mut state = self.lock();
            state.owners.clear();
            state.waves.drain().collect()
        };
        waves.sort_by_key(|(w, _)| *w);
        let mut report = ReleaseReport::default();
        for (wave, entries) in waves {
            debug!(%wave, handles = entries.len(), "releasing outstanding wave");
            report.merge(release_entries(entries));
        }
        report
    }

    /// Registered handles not yet released.
    pub fn outstanding(&self) -> usize {
        self.lock().owners.len()
    }

    /// Waves holding at least one unreleased handle.
    pub fn wave_count(&self) -> usize {
        self.lock().waves.len()
    }
}

fn release_entry(entry: &Entry) -> Result<(), ReleaseError> {
    match catch_unwind(AssertUnwindSafe(|| entry.handle.release())) {
        Ok(result) => result,
        Err(payload) => Err(ReleaseError::new(
            entry.handle.describe(),
            format!("release panicked: {}", panic_message(payload.as_ref())),
        )),
    }
}

fn release_entries(entries: Vec<Entry>) -> ReleaseReport {
    let mut report = ReleaseReport::default();
    let mut seen = HashSet::with_capacity(entries.len());
    for entry in entries.iter().rev() {
        if !seen.insert(entry.key) {
            continue;
        }
        match release_entry(entry) {
            Ok(()) => report.released += 1,
            Err(err) => {
                warn!(handle = %err.handle, reason = %err.reason, "resource release failed");
                report.failures.push(err);
            }
        }
    }
    report
}

/// RAII scope over one wave.
///
/// Dropping the scope releases the wave; [`finish`](Self::finish) does the same
/// and returns the report.
pub struct WaveScope<'a> {
    ledger: &'a CleanupLedger,
    wave: WaveId,
    finished: bool,
}

impl<'a> WaveScope<'a> {
    /// The wave this scope owns.
    pub fn wave(&self) -> WaveId {
        self.wave
    }

    /// The ledger this scope registers with.
    pub fn ledger(&self) -> &'a CleanupLedger {
        self.ledger
    }

    /// Registers `handle` under this scope's wave.
    pub fn track<H>(&self, handle: Arc<H>) -> Arc<H>
    where
        H: ResourceHandle + 'static,
    {
        self.ledger.register(self.wave, handle)
    }

    /// Registers an optional handle under this scope's wave.
    pub fn track_opt<H>(&self, handle: Option<Arc<H>>) -> Option<Arc<H>>
    where
        H: ResourceHandle + 'static,
    {
        self.ledger.register_opt(self.wave, handle)
    }

    /// Releases the wave now.
    pub fn finish(mut self) -> ReleaseReport {
        self.finished = true;
        self.ledger.release_wave(self.wave)
    }
}

impl Drop for WaveScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let report = self.ledger.release_wave(self.wave);
            if !report.is_clean() {
                debug!(wave = %self.wave, failures = report.failures.len(), "wave dropped with release failures");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct TrackedHandle {
        releases: AtomicUsize,
        fail: bool,
        panic: bool,
        null: bool,
        log: Option<Arc<Mutex<Vec<&'static str>>>>,
        name: &'static str,
    }

    impl ResourceHandle for TrackedHandle {
        fn release(&self) -> Result<(), ReleaseError> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            if let Some(log) = &self.log {
                log.lock().unwrap().push(self.name);
            }
            if self.panic {
                panic!("boom");
            }
            if self.fail {
                return Err(ReleaseError::new(self.name, "refused"));
            }
            Ok(())
        }

        fn is_null(&self) -> bool {
            self.null
        }
    }

    fn releases(p: &TrackedHandle) -> usize {
        p.releases.load(Ordering::SeqCst)
    }

    #[test]
    fn waves_are_unique() {
        let ledger = CleanupLedger::new();
        let a = ledger.new_wave();
        let b = ledger.new_wave();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn release_wave_releases_each_handle_once() {
        let ledger = CleanupLedger::new();
        let wave = ledger.new_wave();
        let a = ledger.register(wave, Arc::new(TrackedHandle::default()));
        let b = ledger.register(wave, Arc::new(TrackedHandle::default()));
        // Registering the same handle twice keeps a single entry.
        let a = ledger.register(wave, a);
        assert_eq!(ledger.outstanding(), 2);

        let report = ledger.release_wave(wave);
        assert_eq!(report.released, 2);
        assert!(report.is_clean());
        assert_eq!(releases(&a), 1);
        assert_eq!(releases(&b), 1);

        // Idempotent.
        let again = ledger.release_wave(wave);
        assert_eq!(again.attempted(), 0);
        assert_eq!(releases(&a), 1);
        assert_eq!(ledger.outstanding(), 0);
    }

    #[test]
    fn failures_do_not_stop_the_wave() {
        let ledger = CleanupLedger::new();
        let wave = ledger.new_wave();
        let ok1 = ledger.register(wave, Arc::new(TrackedHandle::default()));
        let bad = ledger.register(
            wave,
            Arc::new(TrackedHandle {
                fail: true,
                name: "bad",
                ..TrackedHandle::default()
            }),
        );
        let boom = ledger.register(
            wave,
            Arc::new(TrackedHandle {
                panic: true,
                ..TrackedHandle::default()
            }),
        );
        let ok2 = ledger.register(wave, Arc::new(TrackedHandle::default()));

        let report = ledger.release_wave(wave);
        assert_eq!(report.released, 2);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures.iter().any(|f| f.reason == "refused"));
        assert!(report
            .failures
            .iter()
            .any(|f| f.reason.contains("panicked: boom")));
        for p in [&ok1, &bad, &boom, &ok2] {
            assert_eq!(releases(p), 1);
        }
    }

    #[test]
    fn null_and_none_are_not_registered() {
        let ledger = CleanupLedger::new();
        let wave = ledger.new_wave();
        let null = ledger.register(
            wave,
            Arc::new(TrackedHandle {
                null: true,
                ..TrackedHandle::default()
            }),
        );
        assert!(ledger.register_opt::<TrackedHandle>(wave, None).is_none());
        assert_eq!(ledger.outstanding(), 0);
        ledger.release_wave(wave);
        assert_eq!(releases(&null), 0);
    }

    #[test]
    fn waves_are_independent_and_release_newest_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mk = |name| {
            Arc::new(TrackedHandle {
                name,
                log: Some(log.clone()),
                ..TrackedHandle::default()
            })
        };
        let ledger = CleanupLedger::new();
        let w1 = ledger.new_wave();
        let w2 = ledger.new_wave();
        ledger.register(w1, mk("first"));
        ledger.register(w1, mk("second"));
        let other = ledger.register(w2, mk("other"));

        ledger.release_wave(w1);
        assert_eq!(*log.lock().unwrap(), vec!["second", "first"]);
        assert_eq!(releases(&other), 0);
        assert_eq!(ledger.wave_count(), 1);

        let report = ledger.release_all();
        assert_eq!(report.released, 1);
        assert_eq!(ledger.wave_count(), 0);
    }

    #[test]
    fn release_now_removes_handle_from_its_wave() {
        let ledger = CleanupLedger::new();
        let wave = ledger.new_wave();
        let h = ledger.register(wave, Arc::new(TrackedHandle::default()));
        assert!(ledger.release_now(&h).unwrap());
        assert!(!ledger.release_now(&h).unwrap());
        assert_eq!(ledger.release_wave(wave).attempted(), 0);
        assert_eq!(releases(&h), 1);
    }

    #[test]
    fn scope_releases_on_drop_and_unwind() {
        let ledger = CleanupLedger::new();
        let h = Arc::new(TrackedHandle::default());
        {
            let scope = ledger.scoped_wave();
            scope.track(h.clone());
        }
        assert_eq!(releases(&h), 1);

        let h2 = Arc::new(TrackedHandle::default());
        let result = catch_unwind(AssertUnwindSafe(|| {
            let scope = ledger.scoped_wave();
            scope.track(h2.clone());
            panic!("row failed");
        }));
        assert!(result.is_err());
        assert_eq!(releases(&h2), 1);
        assert_eq!(ledger.outstanding(), 0);
    }

    #[test]
    fn report_records_warnings() {
        let mut report = ReleaseReport::default();
        report.merge(ReleaseReport {
            released: 1,
            failures: vec![ReleaseError::new("h", "gone"), ReleaseError::new("h2", "gone")],
        });
        let w = WarningConsolidator::new();
        report.record_into(&w);
        assert_eq!(
            w.count(RESOURCE_CONTEXT_ID, "Failed to release resource: gone"),
            2
        );
    }
}
