//! Reader/writer admission for a single partition file.
//!
//! Each index item carries an [`AccessGate`], a small state machine guarded by
//! a mutex and condition variable:
//!
//! ```text
//!             request_read            request_read
//!   Idle ───────────────────► Reading(1) ─────────► Reading(n + 1)
//!    ▲  ◄───────────────────           ◄─────────
//!    │      last reader drops           reader drops
//!    │
//!    └──── writer drops ──── Writing ◄──── request_write (Idle only)
//! ```
//!
//! Any number of readers may share a file; a writer needs it exclusively.

use super::IndexItem;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

/// Access state of a partition file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessState {
    /// Nobody holds the file.
    #[default]
    Idle,
    /// Held by this many readers.
    Reading(usize),
    /// Held by a single writer.
    Writing,
}

/// Condition-variable gate implementing the admission rules.
#[derive(Debug, Default)]
pub struct AccessGate {
    state: Mutex<AccessState>,
    released: Condvar,
}

impl AccessGate {
    /// Creates an idle gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> AccessState {
        *self.state.lock()
    }

    /// Admits a reader unless a writer holds the gate.
    pub fn try_read(&self) -> bool {
        let mut state = self.state.lock();
        Self::admit_read(&mut state)
    }

    /// Admits a writer only when the gate is idle.
    pub fn try_write(&self) -> bool {
        let mut state = self.state.lock();
        Self::admit_write(&mut state)
    }

    /// Blocks until a reader is admitted.
    pub fn wait_read(&self) {
        let mut state = self.state.lock();
        while !Self::admit_read(&mut state) {
            self.released.wait(&mut state);
        }
    }

    /// Blocks until a writer is admitted.
    pub fn wait_write(&self) {
        let mut state = self.state.lock();
        while !Self::admit_write(&mut state) {
            self.released.wait(&mut state);
        }
    }

    /// Like [`AccessGate::wait_write`] but gives up after `timeout`.
    pub fn wait_write_for(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        while !Self::admit_write(&mut state) {
            if self.released.wait_for(&mut state, timeout).timed_out() {
                return Self::admit_write(&mut state);
            }
        }
        true
    }

    fn release_read(&self) {
        let mut state = self.state.lock();
        *state = match *state {
            AccessState::Reading(n) if n > 1 => AccessState::Reading(n - 1),
            _ => AccessState::Idle,
        };
        if *state == AccessState::Idle {
            drop(state);
            self.released.notify_all();
        }
    }

    fn release_write(&self) {
        let mut state = self.state.lock();
        *state = AccessState::Idle;
        drop(state);
        self.released.notify_all();
    }

    fn admit_read(state: &mut AccessState) -> bool {
        match *state {
            AccessState::Idle => *state = AccessState::Reading(1),
            AccessState::Reading(n) => *state = AccessState::Reading(n + 1),
            AccessState::Writing => return false,
        }
        true
    }

    fn admit_write(state: &mut AccessState) -> bool {
        if *state != AccessState::Idle {
            return false;
        }
        *state = AccessState::Writing;
        true
    }
}

/// Shared read access to a partition file. Released on drop.
#[derive(Debug)]
pub struct ReadAccess {
    item: Arc<IndexItem>,
}

impl ReadAccess {
    pub(crate) fn new(item: Arc<IndexItem>) -> Self {
        Self { item }
    }

    /// The file being read.
    pub fn item(&self) -> &Arc<IndexItem> {
        &self.item
    }
}

impl Drop for ReadAccess {
    fn drop(&mut self) {
        self.item.gate().release_read();
    }
}

/// Exclusive write access to a partition file. Released on drop.
#[derive(Debug)]
pub struct WriteAccess {
    item: Arc<IndexItem>,
}

impl WriteAccess {
    pub(crate) fn new(item: Arc<IndexItem>) -> Self {
        Self { item }
    }

    /// The file being written.
    pub fn item(&self) -> &Arc<IndexItem> {
        &self.item
    }
}

impl Drop for WriteAccess {
    fn drop(&mut self) {
        self.item.gate().release_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn test_concurrent_reads() {
        let gate = AccessGate::new();
        assert!(gate.try_read());
        assert!(gate.try_read());
        assert_eq!(gate.state(), AccessState::Reading(2));

        gate.release_read();
        assert_eq!(gate.state(), AccessState::Reading(1));
        gate.release_read();
        assert_eq!(gate.state(), AccessState::Idle);
    }

    #[test]
    fn test_write_excludes_everyone() {
        let gate = AccessGate::new();
        assert!(gate.try_write());
        assert!(!gate.try_read());
        assert!(!gate.try_write());

        gate.release_write();
        assert!(gate.try_read());
        assert!(!gate.try_write());
    }

    #[test]
    fn test_wait_write_unblocks_after_reads_drop() {
        let gate = Arc::new(AccessGate::new());
        assert!(gate.try_read());
        assert!(gate.try_read());

        let admitted = Arc::new(AtomicBool::new(false));
        let waiter = {
            let gate = Arc::clone(&gate);
            let admitted = Arc::clone(&admitted);
            thread::spawn(move || {
                gate.wait_write();
                admitted.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(30));
        gate.release_read();
        thread::sleep(Duration::from_millis(30));
        assert!(!admitted.load(Ordering::SeqCst));

        gate.release_read();
        waiter.join().unwrap();
        assert!(admitted.load(Ordering::SeqCst));
        assert_eq!(gate.state(), AccessState::Writing);
    }

    #[test]
    fn test_wait_read_unblocks_after_write_drops() {
        let gate = Arc::new(AccessGate::new());
        assert!(gate.try_write());

        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.wait_read())
        };
        thread::sleep(Duration::from_millis(20));
        gate.release_write();
        waiter.join().unwrap();
        assert_eq!(gate.state(), AccessState::Reading(1));
    }

    #[test]
    fn test_wait_write_for_times_out() {
        let gate = AccessGate::new();
        assert!(gate.try_read());
        assert!(!gate.wait_write_for(Duration::from_millis(10)));
        assert_eq!(gate.state(), AccessState::Reading(1));
    }
}
