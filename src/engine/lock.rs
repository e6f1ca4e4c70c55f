//! Per-hash mutual exclusion with FIFO waiters.
//!
//! One shared table maps a group hash to its lock entry: the time the lock
//! was taken plus an ordered queue of waiter handles. The table mutex is
//! held only for O(1) bookkeeping; the actual wait happens on the waiter's
//! private condvar, outside the table lock. Unlocking hands ownership
//! directly to the oldest waiter (the lock timestamp is preserved), so
//! grants follow request order exactly and a hot hash never bounces through
//! an unlocked state.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::storage::unix_nanos;

struct Waiter {
    granted: Mutex<bool>,
    cv: Condvar,
}

struct LockEntry {
    locked_at_ns: i64,
    waiters: VecDeque<Arc<Waiter>>,
}

#[derive(Default)]
pub struct GroupLockTable {
    table: Mutex<HashMap<String, LockEntry>>,
}

impl GroupLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for `hash`, blocking FIFO behind any current
    /// holder and earlier waiters.
    pub fn lock(&self, hash: &str) {
        let waiter = {
            let mut table = self.table.lock();
            match table.entry(hash.to_string()) {
                Entry::Vacant(vacant) => {
                    vacant.insert(LockEntry {
                        locked_at_ns: unix_nanos(),
                        waiters: VecDeque::new(),
                    });
                    return;
                }
                Entry::Occupied(mut held) => {
                    let waiter = Arc::new(Waiter {
                        granted: Mutex::new(false),
                        cv: Condvar::new(),
                    });
                    held.get_mut().waiters.push_back(Arc::clone(&waiter));
                    waiter
                }
            }
        };

        let mut granted = waiter.granted.lock();
        while !*granted {
            waiter.cv.wait(&mut granted);
        }
    }

    /// Acquires the lock only if it is free; used by the idle sweeper so it
    /// never queues behind workers.
    pub fn try_lock(&self, hash: &str) -> bool {
        let mut table = self.table.lock();
        if table.contains_key(hash) {
            return false;
        }
        table.insert(
            hash.to_string(),
            LockEntry {
                locked_at_ns: unix_nanos(),
                waiters: VecDeque::new(),
            },
        );
        true
    }

    /// Releases the lock for `hash`: ownership transfers to the oldest
    /// waiter, or the entry is removed when nobody waits. Unlocking an
    /// unheld hash is a no-op.
    pub fn unlock(&self, hash: &str) {
        let waiter = {
            let mut table = self.table.lock();
            match table.entry(hash.to_string()) {
                Entry::Vacant(_) => return,
                Entry::Occupied(mut held) => match held.get_mut().waiters.pop_front() {
                    Some(waiter) => Some(waiter),
                    None => {
                        held.remove();
                        None
                    }
                },
            }
        };

        if let Some(waiter) = waiter {
            let mut granted = waiter.granted.lock();
            *granted = true;
            waiter.cv.notify_one();
        }
    }

    pub fn is_locked(&self, hash: &str) -> bool {
        self.table.lock().contains_key(hash)
    }

    /// Nanosecond timestamp the current holder took the lock, if held.
    pub fn locked_at(&self, hash: &str) -> Option<i64> {
        self.table.lock().get(hash).map(|e| e.locked_at_ns)
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}
