use parking_lot::{Condvar, Mutex};
use std::{
    fmt,
    thread::{self, ThreadId},
    time::{Duration, Instant},
};
use tracing::{trace, warn};

use crate::error::{DbError, Result};

#[derive(Debug, Default)]
struct LockState {
    /// count of holders with a read lock
    read_count: usize,
    /// true while a writer holds the lock
    is_write: bool,
    /// count of threads waiting for the write lock; new readers queue behind them
    try_write_count: usize,
    owner: Option<ThreadId>,
}

/// Timed read/write lock used for structural database changes and for row
/// access inside a table.
///
/// Acquisition blocks until the lock is granted or the timeout elapses. A
/// timeout is reported as [`DbError::LockTimeout`], which callers must treat
/// as "rollback only"; the lock itself never retries.
///
/// Waiting writers take priority over new readers so a steady stream of
/// scans cannot starve a DDL statement.
pub struct Lock {
    id: String,
    state: Mutex<LockState>,
    cond: Condvar,
}

impl Lock {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(LockState::default()),
            cond: Condvar::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Acquires a shared lock, waiting at most `timeout`.
    pub fn lock_read(&self, timeout: Duration) -> Result<LockReadGuard<'_>> {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut state = self.state.lock();

        trace!(lock = %self, read = state.read_count, write = state.is_write,
               try_write = state.try_write_count, "lock_read");

        loop {
            if !state.is_write && state.try_write_count == 0 {
                state.read_count += 1;
                return Ok(LockReadGuard { lock: self });
            }

            if self.cond.wait_until(&mut state, deadline).timed_out()
                && (state.is_write || state.try_write_count > 0)
            {
                return Err(self.timeout_error("read", start, &state));
            }
        }
    }

    /// Acquires the exclusive lock, waiting at most `timeout`.
    pub fn lock_write(&self, timeout: Duration) -> Result<LockWriteGuard<'_>> {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut state = self.state.lock();

        trace!(lock = %self, read = state.read_count, write = state.is_write,
               try_write = state.try_write_count, "lock_write");

        state.try_write_count += 1;

        let result = loop {
            if !state.is_write && state.read_count == 0 {
                state.is_write = true;
                state.owner = Some(thread::current().id());
                break Ok(LockWriteGuard { lock: self });
            }

            if self.cond.wait_until(&mut state, deadline).timed_out()
                && (state.is_write || state.read_count > 0)
            {
                break Err(self.timeout_error("write", start, &state));
            }
        };

        state.try_write_count -= 1;
        // readers blocked behind this writer may proceed now
        self.cond.notify_all();

        result
    }

    /// Returns true while some thread holds the write lock.
    pub fn is_write_locked(&self) -> bool {
        self.state.lock().is_write
    }

    pub fn read_count(&self) -> usize {
        self.state.lock().read_count
    }

    fn timeout_error(&self, mode: &'static str, start: Instant, state: &LockState) -> DbError {
        let waited_ms = start.elapsed().as_millis() as u64;
        warn!(lock = %self, mode, waited_ms, owner = ?state.owner,
              try_write = state.try_write_count, is_write = state.is_write,
              "lock timed out");
        DbError::LockTimeout {
            lock: self.to_string(),
            mode,
            waited_ms,
        }
    }

    fn unlock_read(&self) {
        let mut state = self.state.lock();
        state.read_count = state.read_count.saturating_sub(1);
        trace!(lock = %self, read = state.read_count, "unlock_read");
        self.cond.notify_all();
    }

    fn unlock_write(&self) {
        let mut state = self.state.lock();
        state.is_write = false;
        state.owner = None;
        trace!(lock = %self, "unlock_write");
        self.cond.notify_all();
    }
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lock[{}]", self.id)
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Shared hold on a [`Lock`], released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct LockReadGuard<'a> {
    lock: &'a Lock,
}

impl Drop for LockReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_read();
    }
}

/// Exclusive hold on a [`Lock`], released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct LockWriteGuard<'a> {
    lock: &'a Lock,
}

impl Drop for LockWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    const SHORT: Duration = Duration::from_millis(50);

    #[test]
    fn readers_share_the_lock() {
        let lock = Lock::new("shared");
        let a = lock.lock_read(SHORT).unwrap();
        let b = lock.lock_read(SHORT).unwrap();
        assert_eq!(lock.read_count(), 2);
        drop(a);
        drop(b);
        assert_eq!(lock.read_count(), 0);
    }

    #[test]
    fn writer_times_out_behind_reader() {
        let lock = Lock::new("db");
        let _read = lock.lock_read(SHORT).unwrap();
        let err = lock.lock_write(SHORT).unwrap_err();
        assert!(err.is_rollback_only());
        assert!(err.to_string().contains("Lock[db]"));
        // the failed writer must not leave readers blocked
        assert!(lock.lock_read(SHORT).is_ok());
    }

    #[test]
    fn reader_times_out_behind_writer() {
        let lock = Lock::new("db");
        let write = lock.lock_write(SHORT).unwrap();
        assert!(lock.is_write_locked());
        assert!(matches!(
            lock.lock_read(SHORT),
            Err(DbError::LockTimeout { mode: "read", .. })
        ));
        drop(write);
        assert!(!lock.is_write_locked());
        assert!(lock.lock_read(SHORT).is_ok());
    }

    #[test]
    fn waiting_writer_acquires_after_release() {
        let lock = Lock::new("handoff");
        let read = lock.lock_read(SHORT).unwrap();
        let (tx, rx) = mpsc::channel();

        let lock_ref = &lock;
        thread::scope(|s| {
            s.spawn(move || {
                let lock = lock_ref;
                let guard = lock.lock_write(Duration::from_secs(5));
                tx.send(guard.is_ok()).unwrap();
            });
            thread::sleep(Duration::from_millis(20));
            drop(read);
            assert!(rx.recv().unwrap());
        });
    }
}
