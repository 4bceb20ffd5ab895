//! Access Gate Module
//!
//! Reader/writer discipline for the entry table: a bounded number of
//! concurrent readers, and an exclusive writer that closes the gate to new
//! readers and then waits for in-flight readers to drain.

use std::ops::{Deref, DerefMut};
use std::sync::{
    Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::time::{Duration, Instant};

/// Maximum concurrent readers when not configured otherwise
pub const MAX_CONCURRENT_READERS: usize = 64;

#[derive(Debug, Default)]
struct GateState {
    active_readers: usize,
    writer_reserved: bool,
}

/// Gate guarding a value with reader draining and writer exclusivity
#[derive(Debug)]
pub struct AccessGate<T> {
    state: Mutex<GateState>,
    changed: Condvar,
    max_readers: usize,
    value: RwLock<T>,
}

/// Shared section; dereferences to the guarded value
pub struct ReadSection<'a, T> {
    gate: &'a AccessGate<T>,
    guard: RwLockReadGuard<'a, T>,
}

/// Exclusive section; dereferences mutably to the guarded value
pub struct WriteSection<'a, T> {
    gate: &'a AccessGate<T>,
    guard: RwLockWriteGuard<'a, T>,
}

impl<T> AccessGate<T> {
    pub fn new(value: T) -> Self {
        Self::with_max_readers(value, MAX_CONCURRENT_READERS)
    }

    pub fn with_max_readers(value: T, max_readers: usize) -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            changed: Condvar::new(),
            max_readers: max_readers.max(1),
            value: RwLock::new(value),
        }
    }

    pub fn max_readers(&self) -> usize {
        self.max_readers
    }

    /// Readers currently inside a section
    pub fn active_readers(&self) -> usize {
        self.lock_state().active_readers
    }

    /// Enter a shared section. Blocks while a writer holds or awaits the gate,
    /// or while the reader limit is reached.
    pub fn read(&self) -> ReadSection<'_, T> {
        let mut state = self.lock_state();
        while state.writer_reserved || state.active_readers >= self.max_readers {
            state = self.wait(state);
        }
        state.active_readers += 1;
        drop(state);

        ReadSection {
            gate: self,
            guard: self.value.read().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Enter the exclusive section
    pub fn write(&self) -> WriteSection<'_, T> {
        let mut state = self.lock_state();
        while state.writer_reserved {
            state = self.wait(state);
        }
        state.writer_reserved = true;
        while state.active_readers > 0 {
            state = self.wait(state);
        }
        drop(state);

        WriteSection {
            gate: self,
            guard: self.value.write().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Enter the exclusive section, giving up after `timeout`.
    ///
    /// On timeout the gate is reopened to readers before returning `None`.
    pub fn try_write_for(&self, timeout: Duration) -> Option<WriteSection<'_, T>> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Some(self.write());
        };

        let mut state = self.lock_state();
        while state.writer_reserved {
            state = self.wait_until(state, deadline)?;
        }
        state.writer_reserved = true;
        while state.active_readers > 0 {
            match self.wait_until(state, deadline) {
                Some(next) => state = next,
                None => {
                    self.release_writer();
                    return None;
                }
            }
        }
        drop(state);

        Some(WriteSection {
            gate: self,
            guard: self.value.write().unwrap_or_else(PoisonError::into_inner),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, state: MutexGuard<'a, GateState>) -> MutexGuard<'a, GateState> {
        self.changed
            .wait(state)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_until<'a>(
        &self,
        state: MutexGuard<'a, GateState>,
        deadline: Instant,
    ) -> Option<MutexGuard<'a, GateState>> {
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        let (state, _) = self
            .changed
            .wait_timeout(state, deadline - now)
            .unwrap_or_else(PoisonError::into_inner);
        Some(state)
    }

    fn release_reader(&self) {
        let mut state = self.lock_state();
        state.active_readers = state.active_readers.saturating_sub(1);
        drop(state);
        self.changed.notify_all();
    }

    fn release_writer(&self) {
        let mut state = self.lock_state();
        state.writer_reserved = false;
        drop(state);
        self.changed.notify_all();
    }
}

impl<T> Deref for ReadSection<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> Drop for ReadSection<'_, T> {
    fn drop(&mut self) {
        self.gate.release_reader();
    }
}

impl<T> Deref for WriteSection<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for WriteSection<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for WriteSection<'_, T> {
    fn drop(&mut self) {
        self.gate.release_writer();
    }
}
