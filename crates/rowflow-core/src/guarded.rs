// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Lazily built values confined to the thread that uses them.
//!
//! A transform frequently needs an expensive helper derived from its settings
//! (a compiled pattern, a parsed template, a native query object) that must
//! not be mutated from two threads at once. [`SafeGuarded`] builds one copy
//! per worker thread on first use and hands every later call on that thread
//! the same copy. When the helper is thread-safe, [`SafeGuarded::shared`]
//! builds a single instance for everybody instead.
//!
//! Per-thread copies live in thread-local storage keyed by the instance id, so
//! a worker building its copy never blocks another worker.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static LOCAL_COPIES: RefCell<HashMap<u64, Rc<dyn Any>>> = RefCell::new(HashMap::new());
}

const PLANNED: u8 = 0;
const CREATED: u8 = 1;
const DISPOSED: u8 = 2;

/// Lifecycle of a [`SafeGuarded`] value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifeCycle {
    /// No copy has been built yet.
    Planned,
    /// At least one copy exists.
    Created,
    /// Disposed; no copy is handed out anymore.
    Disposed,
}

type SharedValue = Arc<dyn Any + Send + Sync>;

enum Mode {
    PerThread(Box<dyn Fn() -> Box<dyn Any> + Send + Sync>),
    Shared {
        build: Box<dyn Fn() -> SharedValue + Send + Sync>,
        slot: RwLock<Option<SharedValue>>,
    },
}

/// A value built lazily, either once per thread or once for all threads.
pub struct SafeGuarded<T> {
    id: u64,
    mode: Mode,
    state: AtomicU8,
    _value: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for SafeGuarded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeGuarded")
            .field("id", &self.id)
            .field("shared", &self.is_shared())
            .field("state", &self.state())
            .finish()
    }
}

impl<T: 'static> SafeGuarded<T> {
    /// Every thread gets its own copy built by `factory`, at most once per
    /// thread.
    pub fn per_thread<F>(factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::with_mode(Mode::PerThread(Box::new(move || -> Box<dyn Any> {
            Box::new(factory())
        })))
    }

    /// Reads the calling thread's value, building it first if needed.
    ///
    /// Returns `None` once the resource has been disposed.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        if self.state.load(Ordering::Acquire) == DISPOSED {
            return None;
        }
        match &self.mode {
            Mode::PerThread(build) => {
                let value = self.local_copy(build.as_ref())?;
                value.downcast_ref::<T>().map(f)
            }
            Mode::Shared { build, slot } => {
                let value = self.shared_copy(build.as_ref(), slot)?;
                value.downcast_ref::<T>().map(f)
            }
        }
    }

    fn local_copy(&self, build: &(dyn Fn() -> Box<dyn Any> + Send + Sync)) -> Option<Rc<dyn Any>> {
        let existing = LOCAL_COPIES
            .try_with(|m| m.borrow().get(&self.id).cloned())
            .ok()?;
        if let Some(v) = existing {
            return Some(v);
        }
        // Built outside the borrow so factories may use other guarded values.
        let value: Rc<dyn Any> = Rc::from(build());
        LOCAL_COPIES
            .try_with(|m| m.borrow_mut().insert(self.id, value.clone()))
            .ok()?;
        self.mark_created();
        Some(value)
    }
}

impl<T: Send + Sync + 'static> SafeGuarded<T> {
    /// A single thread-safe instance built on first access and shared by all
    /// callers.
    pub fn shared<F>(factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::with_mode(Mode::Shared {
            build: Box::new(move || -> SharedValue { Arc::new(factory()) }),
            slot: RwLock::new(None),
        })
    }
}

impl<T> SafeGuarded<T> {
    fn with_mode(mode: Mode) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            mode,
            state: AtomicU8::new(PLANNED),
            _value: PhantomData,
        }
    }

    fn mark_created(&self) {
        let _ = self
            .state
            .compare_exchange(PLANNED, CREATED, Ordering::AcqRel, Ordering::Acquire);
    }

    fn shared_copy(
        &self,
        build: &(dyn Fn() -> SharedValue + Send + Sync),
        slot: &RwLock<Option<SharedValue>>,
    ) -> Option<SharedValue> {
        if let Some(v) = slot.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
            return Some(v.clone());
        }
        let mut guard = slot.write().unwrap_or_else(PoisonError::into_inner);
        if self.state.load(Ordering::Acquire) == DISPOSED {
            return None;
        }
        if let Some(v) = guard.as_ref() {
            return Some(v.clone());
        }
        let value = build();
        *guard = Some(value.clone());
        self.mark_created();
        Some(value)
    }

    /// Whether a single instance is shared by all threads.
    pub fn is_shared(&self) -> bool {
        matches!(self.mode, Mode::Shared { .. })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifeCycle {
        match self.state.load(Ordering::Acquire) {
            PLANNED => LifeCycle::Planned,
            CREATED => LifeCycle::Created,
            _ => LifeCycle::Disposed,
        }
    }

    /// Disposes the resource.
    ///
    /// Drops the shared instance and the calling thread's copy. Copies held by
    /// other threads are dropped when those threads exit; they are never handed
    /// out again.
    pub fn dispose(&self) {
        self.state.store(DISPOSED, Ordering::Release);
        match &self.mode {
            Mode::Shared { slot, .. } => {
                slot.write().unwrap_or_else(PoisonError::into_inner).take();
            }
            Mode::PerThread(_) => {
                let _ = LOCAL_COPIES.try_with(|m| m.borrow_mut().remove(&self.id));
            }
        }
    }
}

impl<T> Drop for SafeGuarded<T> {
    fn drop(&mut self) {
        if self.state.load(Ordering::Acquire) != DISPOSED {
            self.dispose();
        }
    }
}
