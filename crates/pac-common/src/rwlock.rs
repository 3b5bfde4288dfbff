//! Writer-preferring read/write lock.
//!
//! Guards the orchestrator state shared between the worker task and
//! the administrative API surface. Unlike `std::sync::RwLock`, a
//! pending writer blocks new readers, acquisitions carry a timeout
//! that surfaces as [`PacError::Busy`], and the lock can be deleted:
//! `delete` wakes every waiter and blocks until both the reader and
//! writer counts drain to zero, after which all acquisitions fail.

use std::cell::UnsafeCell;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{PacError, PacResult};

/// How long to wait for a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Block until the lock is granted or deleted.
    Forever,
    /// Block at most this many milliseconds.
    Millis(u64),
    /// Fail immediately if the lock is not free.
    NoWait,
}

#[derive(Default)]
struct LockState {
    readers: u32,
    writers: u32,
    writers_waiting: u32,
    deleted: bool,
}

/// Writer-preferring lock wrapping a `T`.
pub struct PacRwLock<T> {
    state: Mutex<LockState>,
    readers_cv: Condvar,
    writers_cv: Condvar,
    data: UnsafeCell<T>,
}

// Readers and writers are serialized by the state mutex and counts;
// same bounds as std::sync::RwLock.
unsafe impl<T: Send> Send for PacRwLock<T> {}
unsafe impl<T: Send + Sync> Sync for PacRwLock<T> {}

/// Shared-access guard.
pub struct PacReadGuard<'a, T> {
    lock: &'a PacRwLock<T>,
}

/// Exclusive-access guard.
pub struct PacWriteGuard<'a, T> {
    lock: &'a PacRwLock<T>,
}

impl<T> PacRwLock<T> {
    /// Creates the lock owning `data`.
    pub fn new(data: T) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            readers_cv: Condvar::new(),
            writers_cv: Condvar::new(),
            data: UnsafeCell::new(data),
        }
    }

    fn deadline(timeout: Timeout) -> Option<Instant> {
        match timeout {
            Timeout::Forever => None,
            Timeout::Millis(ms) => Some(Instant::now() + Duration::from_millis(ms)),
            Timeout::NoWait => Some(Instant::now()),
        }
    }

    /// Acquires shared access. New readers queue behind any pending
    /// writer.
    pub fn read(&self, timeout: Timeout) -> PacResult<PacReadGuard<'_, T>> {
        let deadline = Self::deadline(timeout);
        let mut state = self.state.lock().expect("rwlock state poisoned");

        if state.deleted {
            return Err(PacError::busy("rwlock deleted"));
        }

        while state.writers > 0 || state.writers_waiting > 0 {
            let (s, still_waiting) = wait_until(&self.readers_cv, state, deadline);
            state = s;
            if !still_waiting {
                return Err(PacError::busy("read lock"));
            }
            if state.deleted {
                return Err(PacError::busy("rwlock deleted"));
            }
        }

        state.readers += 1;
        Ok(PacReadGuard { lock: self })
    }

    /// Acquires exclusive access.
    pub fn write(&self, timeout: Timeout) -> PacResult<PacWriteGuard<'_, T>> {
        let deadline = Self::deadline(timeout);
        let mut state = self.state.lock().expect("rwlock state poisoned");

        if state.deleted {
            return Err(PacError::busy("rwlock deleted"));
        }

        state.writers_waiting += 1;
        while state.readers > 0 || state.writers > 0 {
            let (s, still_waiting) = wait_until(&self.writers_cv, state, deadline);
            state = s;
            if !still_waiting {
                state.writers_waiting -= 1;
                // a reader may be queued behind us
                drop(state);
                self.readers_cv.notify_all();
                return Err(PacError::busy("write lock"));
            }
            if state.deleted {
                state.writers_waiting -= 1;
                drop(state);
                self.readers_cv.notify_all();
                return Err(PacError::busy("rwlock deleted"));
            }
        }
        state.writers_waiting -= 1;
        state.writers = 1;
        Ok(PacWriteGuard { lock: self })
    }

    /// Marks the lock deleted, wakes all waiters and blocks until the
    /// reader and writer counts reach zero. Subsequent acquisitions
    /// fail with `Busy`.
    pub fn delete(&self) {
        let mut state = self.state.lock().expect("rwlock state poisoned");
        state.deleted = true;
        self.readers_cv.notify_all();
        self.writers_cv.notify_all();
        while state.readers > 0 || state.writers > 0 {
            state = self
                .writers_cv
                .wait(state)
                .expect("rwlock state poisoned");
        }
    }

    /// Read access without locking; requires `&mut self` so the
    /// borrow checker proves exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// Waits on `cv`, honouring an optional deadline. The boolean is
/// false once the deadline has passed.
fn wait_until<'m>(
    cv: &Condvar,
    guard: std::sync::MutexGuard<'m, LockState>,
    deadline: Option<Instant>,
) -> (std::sync::MutexGuard<'m, LockState>, bool) {
    match deadline {
        None => {
            let g = cv.wait(guard).expect("rwlock state poisoned");
            (g, true)
        }
        Some(d) => {
            let now = Instant::now();
            if now >= d {
                return (guard, false);
            }
            let (g, _res) = cv
                .wait_timeout(guard, d - now)
                .expect("rwlock state poisoned");
            let expired = Instant::now() >= d;
            (g, !expired)
        }
    }
}

impl<T> std::ops::Deref for PacReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for PacReadGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().expect("rwlock state poisoned");
        state.readers -= 1;
        if state.readers == 0 {
            self.lock.writers_cv.notify_all();
        }
    }
}

impl<T> std::ops::Deref for PacWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> std::ops::DerefMut for PacWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for PacWriteGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().expect("rwlock state poisoned");
        state.writers -= 1;
        self.lock.writers_cv.notify_all();
        self.lock.readers_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_read_then_write() {
        let lock = PacRwLock::new(5u32);
        {
            let r = lock.read(Timeout::Forever).unwrap();
            assert_eq!(*r, 5);
        }
        {
            let mut w = lock.write(Timeout::Forever).unwrap();
            *w = 7;
        }
        assert_eq!(*lock.read(Timeout::NoWait).unwrap(), 7);
    }

    #[test]
    fn test_write_times_out_under_reader() {
        let lock = Arc::new(PacRwLock::new(0u32));
        let r = lock.read(Timeout::Forever).unwrap();

        let l2 = Arc::clone(&lock);
        let h = thread::spawn(move || l2.write(Timeout::Millis(50)).map(|_| ()));
        assert_eq!(h.join().unwrap(), Err(PacError::busy("write lock")));
        drop(r);
        assert!(lock.write(Timeout::NoWait).is_ok());
    }

    #[test]
    fn test_pending_writer_blocks_new_readers() {
        let lock = Arc::new(PacRwLock::new(0u32));
        let r = lock.read(Timeout::Forever).unwrap();

        let l2 = Arc::clone(&lock);
        let writer = thread::spawn(move || {
            let mut w = l2.write(Timeout::Forever).unwrap();
            *w = 1;
        });

        // wait until the writer is queued
        loop {
            let queued = {
                let s = lock.state.lock().unwrap();
                s.writers_waiting > 0 || s.writers > 0
            };
            if queued {
                break;
            }
            thread::yield_now();
        }

        // a new reader must now time out behind the pending writer
        assert!(lock.read(Timeout::Millis(20)).is_err());

        drop(r);
        writer.join().unwrap();
        assert_eq!(*lock.read(Timeout::Forever).unwrap(), 1);
    }

    #[test]
    fn test_concurrent_writers_serialize() {
        let lock = Arc::new(PacRwLock::new(0u64));
        let observed_max = Arc::new(AtomicU32::new(0));
        let active = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            let active = Arc::clone(&active);
            let observed_max = Arc::clone(&observed_max);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let mut w = lock.write(Timeout::Forever).unwrap();
                    let n = active.fetch_add(1, Ordering::SeqCst) + 1;
                    observed_max.fetch_max(n, Ordering::SeqCst);
                    *w += 1;
                    active.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(observed_max.load(Ordering::SeqCst), 1);
        assert_eq!(*lock.read(Timeout::Forever).unwrap(), 800);
    }

    #[test]
    fn test_delete_rejects_new_acquisitions() {
        let lock = PacRwLock::new(0u32);
        lock.delete();
        assert!(lock.read(Timeout::NoWait).is_err());
        assert!(lock.write(Timeout::NoWait).is_err());
    }

    #[test]
    fn test_delete_waits_for_readers() {
        let lock = Arc::new(PacRwLock::new(0u32));
        let r = lock.read(Timeout::Forever).unwrap();

        let l2 = Arc::clone(&lock);
        let deleter = thread::spawn(move || l2.delete());

        thread::sleep(Duration::from_millis(20));
        assert!(!deleter.is_finished());
        drop(r);
        deleter.join().unwrap();
    }
}
