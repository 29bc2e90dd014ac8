// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Resource handles that count their releases.
//!
//! A [`HandleRegistry`] hands out [`TrackedHandle`]s and remembers how often
//! each one was released, so tests can assert "every handle released exactly
//! once" after a run.

use rowflow_core::{ReleaseError, ResourceHandle};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// How a handle behaves when released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseBehavior {
    /// Release succeeds.
    Succeed,
    /// Release returns an error.
    Fail,
    /// Release panics.
    Panic,
}

#[derive(Default)]
struct Inner {
    /// Release count per handle id.
    releases: Vec<u32>,
}

/// Creates tracked handles and keeps their release counts.
#[derive(Clone, Default)]
pub struct HandleRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl HandleRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A handle whose release succeeds.
    pub fn create(&self) -> Arc<TrackedHandle> {
        self.create_with(ReleaseBehavior::Succeed)
    }

    /// A handle with the given release behavior.
    pub fn create_with(&self, behavior: ReleaseBehavior) -> Arc<TrackedHandle> {
        let mut inner = self.lock();
        let id = inner.releases.len();
        inner.releases.push(0);
        Arc::new(TrackedHandle {
            id,
            behavior,
            registry: self.clone(),
        })
    }

    fn record(&self, id: usize) {
        if let Some(n) = self.lock().releases.get_mut(id) {
            *n += 1;
        }
    }

    /// Handles created so far.
    pub fn created(&self) -> usize {
        self.lock().releases.len()
    }

    /// Release attempts of handle `id`.
    pub fn release_count(&self, id: usize) -> u32 {
        self.lock().releases.get(id).copied().unwrap_or(0)
    }

    /// Handles released at least once.
    pub fn released(&self) -> usize {
        self.lock().releases.iter().filter(|&&n| n > 0).count()
    }

    /// Ids of handles never released.
    pub fn unreleased(&self) -> Vec<usize> {
        self.ids_where(|n| n == 0)
    }

    /// Ids of handles released more than once.
    pub fn double_released(&self) -> Vec<usize> {
        self.ids_where(|n| n > 1)
    }

    /// Whether every handle was released exactly once.
    pub fn all_released_once(&self) -> bool {
        self.lock().releases.iter().all(|&n| n == 1)
    }

    fn ids_where(&self, pred: impl Fn(u32) -> bool) -> Vec<usize> {
        self.lock()
            .releases
            .iter()
            .enumerate()
            .filter(|(_, &n)| pred(n))
            .map(|(id, _)| id)
            .collect()
    }
}

/// A resource handle registered with a [`HandleRegistry`].
pub struct TrackedHandle {
    id: usize,
    behavior: ReleaseBehavior,
    registry: HandleRegistry,
}

impl TrackedHandle {
    /// Registry-assigned id.
    pub fn id(&self) -> usize {
        self.id
    }
}

impl ResourceHandle for TrackedHandle {
    #[allow(clippy::panic)]
    fn release(&self) -> Result<(), ReleaseError> {
        self.registry.record(self.id);
        match self.behavior {
            ReleaseBehavior::Succeed => Ok(()),
            ReleaseBehavior::Fail => Err(ReleaseError::new(
                self.describe(),
                "injected release failure",
            )),
            ReleaseBehavior::Panic => panic!("injected release panic in {}", self.describe()),
        }
    }

    fn describe(&self) -> String {
        format!("tracked#{}", self.id)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn counts_releases_per_handle() {
        let reg = HandleRegistry::new();
        let a = reg.create();
        let b = reg.create_with(ReleaseBehavior::Fail);
        let _c = reg.create();
        a.release().unwrap();
        a.release().unwrap();
        assert!(b.release().is_err());
        assert_eq!(reg.created(), 3);
        assert_eq!(reg.release_count(a.id()), 2);
        assert_eq!(reg.released(), 2);
        assert_eq!(reg.double_released(), vec![0]);
        assert_eq!(reg.unreleased(), vec![2]);
        assert!(!reg.all_released_once());
    }
}
