//! Application timer wheel with a 1-second logical tick.
//!
//! Entries are one-shot: on expiry the callback runs once and the
//! entry is gone. Callbacks receive the opaque context registered
//! with the entry and must not mutate shared state directly; they
//! post an event so the mutation happens on the worker under its
//! lock. The tick itself is driven externally (the daemons post a
//! time-tick event from a tokio interval and call [`AppTimer::process`]
//! from the worker).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::warn;

use crate::error::{PacError, PacResult};

/// Tick granularity of the wheel, in seconds.
pub const APP_TMR_1SEC: u64 = 1;

/// Identifies a live timer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

type ExpiryFn = Box<dyn Fn(u64) + Send + Sync>;

struct Entry {
    name: &'static str,
    ctx: u64,
    remaining: u64,
    expiry: ExpiryFn,
}

/// Fixed-capacity timer wheel.
pub struct AppTimer {
    entries: Mutex<HashMap<u64, Entry>>,
    next_id: AtomicU64,
    pool_size: usize,
}

impl AppTimer {
    /// Creates a wheel holding at most `pool_size` live entries.
    pub fn new(pool_size: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            pool_size,
        }
    }

    /// Registers a one-shot timer firing after `period_s` whole
    /// seconds. `ctx` is handed back to `expiry` verbatim.
    pub fn add(
        &self,
        expiry: impl Fn(u64) + Send + Sync + 'static,
        ctx: u64,
        period_s: u64,
        name: &'static str,
    ) -> PacResult<TimerHandle> {
        let mut entries = self.entries.lock().expect("timer wheel poisoned");
        if entries.len() >= self.pool_size {
            warn!(name, "timer pool exhausted");
            return Err(PacError::failure("timer pool exhausted"));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            id,
            Entry {
                name,
                ctx,
                remaining: period_s.max(1),
                expiry: Box::new(expiry),
            },
        );
        Ok(TimerHandle(id))
    }

    /// Cancels a timer. Deleting an already-expired or unknown handle
    /// is a no-op.
    pub fn delete(&self, handle: TimerHandle) {
        self.entries
            .lock()
            .expect("timer wheel poisoned")
            .remove(&handle.0);
    }

    /// Returns whether the handle still refers to a live entry.
    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        self.entries
            .lock()
            .expect("timer wheel poisoned")
            .contains_key(&handle.0)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("timer wheel poisoned").len()
    }

    /// Returns true when no timers are armed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Advances the wheel one tick. Expired callbacks run after the
    /// internal lock is released.
    pub fn process(&self) {
        let mut expired: Vec<(ExpiryFn, u64, &'static str)> = Vec::new();
        {
            let mut entries = self.entries.lock().expect("timer wheel poisoned");
            let ids: Vec<u64> = entries.keys().copied().collect();
            for id in ids {
                let done = {
                    let e = entries.get_mut(&id).expect("entry vanished");
                    e.remaining -= 1;
                    e.remaining == 0
                };
                if done {
                    let e = entries.remove(&id).expect("entry vanished");
                    expired.push((e.expiry, e.ctx, e.name));
                }
            }
        }
        for (expiry, ctx, _name) in expired {
            expiry(ctx);
        }
    }

    /// Drops every entry without running callbacks.
    pub fn clear(&self) {
        self.entries.lock().expect("timer wheel poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn test_fires_after_period() {
        let wheel = AppTimer::new(8);
        let fired = Arc::new(AtomicU32::new(0));
        let f = Arc::clone(&fired);
        wheel
            .add(move |ctx| f.store(ctx as u32, Ordering::SeqCst), 42, 3, "t")
            .unwrap();

        wheel.process();
        wheel.process();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        wheel.process();
        assert_eq!(fired.load(Ordering::SeqCst), 42);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_one_shot_not_rearmed() {
        let wheel = AppTimer::new(8);
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        wheel
            .add(move |_| drop(c.fetch_add(1, Ordering::SeqCst)), 0, 1, "t")
            .unwrap();
        for _ in 0..5 {
            wheel.process();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delete_cancels() {
        let wheel = AppTimer::new(8);
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let h = wheel
            .add(move |_| drop(c.fetch_add(1, Ordering::SeqCst)), 0, 2, "t")
            .unwrap();
        wheel.process();
        wheel.delete(h);
        wheel.process();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        // double delete is harmless
        wheel.delete(h);
    }

    #[test]
    fn test_pool_exhaustion() {
        let wheel = AppTimer::new(2);
        wheel.add(|_| {}, 0, 10, "a").unwrap();
        wheel.add(|_| {}, 0, 10, "b").unwrap();
        assert!(wheel.add(|_| {}, 0, 10, "c").is_err());
        assert_eq!(wheel.len(), 2);
    }

    #[test]
    fn test_zero_period_rounds_up() {
        let wheel = AppTimer::new(2);
        let fired = Arc::new(AtomicU32::new(0));
        let f = Arc::clone(&fired);
        wheel
            .add(move |_| drop(f.fetch_add(1, Ordering::SeqCst)), 0, 0, "t")
            .unwrap();
        wheel.process();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
