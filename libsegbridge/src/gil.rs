//! Interpreter lock discipline
//!
//! Every call into the runtime, and every allocation or release of a
//! cross-boundary buffer, happens while the calling thread holds the
//! runtime's lock. [`Gil::ensure`] is reentrant; [`Gil::allow_threads`]
//! gives the lock up completely for a native-only section and takes it
//! back, at the same depth, when the returned guard drops.

use std::marker::PhantomData;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use crate::error::{BridgeError, Result};

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// The runtime's global interpreter lock
#[derive(Debug, Default)]
pub struct Gil {
    state: Mutex<LockState>,
    released: Condvar,
}

impl Gil {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_until_free<'a>(&self, mut state: MutexGuard<'a, LockState>) -> MutexGuard<'a, LockState> {
        while state.owner.is_some() {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state
    }

    /// Acquire the lock, or deepen the hold if this thread already owns it
    pub fn ensure(&self) -> GilGuard<'_> {
        let me = thread::current().id();
        let mut state = self.lock_state();
        if state.owner == Some(me) {
            state.depth += 1;
        } else {
            state = self.wait_until_free(state);
            state.owner = Some(me);
            state.depth = 1;
        }
        GilGuard {
            gil: self,
            _not_send: PhantomData,
        }
    }

    /// True if the current thread holds the lock
    pub fn is_held(&self) -> bool {
        self.lock_state().owner == Some(thread::current().id())
    }

    /// Nesting depth of the current thread's hold, zero if it does not hold the lock
    pub fn depth(&self) -> usize {
        let state = self.lock_state();
        if state.owner == Some(thread::current().id()) {
            state.depth
        } else {
            0
        }
    }

    /// Release the lock entirely until the returned guard drops.
    ///
    /// Fails with [`BridgeError::LockNotHeld`] if the current thread does not hold it.
    pub fn allow_threads(&self) -> Result<AllowThreads<'_>> {
        let me = thread::current().id();
        let mut state = self.lock_state();
        if state.owner != Some(me) {
            return Err(BridgeError::LockNotHeld);
        }
        let saved_depth = state.depth;
        state.owner = None;
        state.depth = 0;
        drop(state);
        self.released.notify_one();
        Ok(AllowThreads {
            gil: self,
            saved_depth,
            _not_send: PhantomData,
        })
    }
}

/// Scoped hold on the lock, released on drop
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct GilGuard<'a> {
    gil: &'a Gil,
    _not_send: PhantomData<*const ()>,
}

impl Drop for GilGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.gil.lock_state();
        if state.owner != Some(thread::current().id()) {
            log::warn!("Interpreter lock guard dropped by a thread that does not own the lock");
            return;
        }
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.gil.released.notify_one();
        }
    }
}

/// Scoped release of the lock, reacquired on drop
#[must_use = "the lock is reacquired as soon as the guard is dropped"]
pub struct AllowThreads<'a> {
    gil: &'a Gil,
    saved_depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl Drop for AllowThreads<'_> {
    fn drop(&mut self) {
        let me = thread::current().id();
        let mut state = self.gil.lock_state();
        if state.owner == Some(me) {
            // a guard taken inside the released section is still alive
            state.depth += self.saved_depth;
            return;
        }
        let mut state = self.gil.wait_until_free(state);
        state.owner = Some(me);
        state.depth = self.saved_depth;
    }
}
