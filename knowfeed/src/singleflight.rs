// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of knowfeed.
//
// knowfeed is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// knowfeed is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with knowfeed.  If not,
// see <http://www.gnu.org/licenses/>.

//! # singleflight
//!
//! Collapse concurrent identical origin loads into one: callers of the same key queue on a
//! per-key async mutex, and whoever gets it first does the work while the rest, on waking, re-check
//! the caches the leader just filled. The per-key entry is removed while its mutex is still held
//! (the guard keeps the [Arc] alive), so a late-arriving caller either joins the queue or creates
//! a fresh entry-- a benign race either way, and nothing leaks on error or panic paths because the
//! guard is just dropped.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Keyed single-flight gate
#[derive(Default)]
pub struct SingleFlight {
    flights: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SingleFlight {
    pub fn new() -> SingleFlight {
        SingleFlight::default()
    }

    /// Join (or open) the flight for `key`; resolves once this caller holds the key's mutex
    pub async fn acquire(&self, key: &str) -> Flight<'_> {
        let mutex = self
            .flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_owned())
            .or_default()
            .clone();
        let guard = mutex.lock_owned().await;
        Flight {
            owner: self,
            key: key.to_owned(),
            _guard: guard,
        }
    }

    fn depart(&self, key: &str) {
        self.flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

/// The critical section; dropping it releases the key
pub struct Flight<'a> {
    owner: &'a SingleFlight,
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        // Remove the entry while still holding the mutex; queued waiters hold their own Arc
        self.owner.depart(&self.key);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_coalesce() {
        let gate = Arc::new(SingleFlight::new());
        let loads = Arc::new(AtomicU32::new(0));
        let filled = Arc::new(AtomicU32::new(0));
        let mut handles = vec![];
        for _ in 0..16 {
            let gate = gate.clone();
            let loads = loads.clone();
            let filled = filled.clone();
            handles.push(tokio::spawn(async move {
                let _flight = gate.acquire("page").await;
                // Re-check: only the first arrival finds the "cache" cold
                if filled.load(Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    loads.fetch_add(1, Ordering::SeqCst);
                    filled.store(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn keys_do_not_interfere() {
        let gate = SingleFlight::new();
        let a = gate.acquire("a").await;
        // A different key is immediately available even while "a" is held
        let b = tokio::time::timeout(Duration::from_millis(50), gate.acquire("b")).await;
        assert!(b.is_ok());
        drop(a);
        // And "a" can be re-acquired after departure
        let _again = tokio::time::timeout(Duration::from_millis(50), gate.acquire("a"))
            .await
            .unwrap();
    }
}
