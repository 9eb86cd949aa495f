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

//! # knowfeed-store
//!
//! The key-value store interface on which knowfeed's counters & caches are built.
//!
//! knowfeed keeps three kinds of hot state in a key-value server: raw facts (bitmaps of "who
//! liked/faved what"), in-flight deltas (hashes), and consolidated values (fixed-layout byte
//! blobs), along with the sorted-set relation caches and the feed page/fragment caches. This crate
//! defines [Store], an object-safe trait capturing exactly the operations the services need,
//! including the handful of *atomic* operations that a production deployment would run as
//! server-side scripts: bit toggles that report "did the state change?", packed-segment
//! arithmetic, fold-and-clear aggregation, and a token bucket.
//!
//! [MemoryStore](memory::MemoryStore) is a complete single-process engine: the test double, and a
//! perfectly serviceable backend for single-node deployments. A networked backend (e.g. a
//! Redis-protocol server plus a script loader) implements the same trait out of tree.

pub mod memory;

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use snafu::{Backtrace, Snafu};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("{key} holds a {actual} value where a {expected} was expected"))]
    WrongType {
        key: String,
        actual: &'static str,
        expected: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("The lock at {key} is no longer held by this owner"))]
    LockLost { key: String, backtrace: Backtrace },
    #[snafu(display("Store backend error: {source}"))]
    Backend {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         lock handles                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Backend-specific half of a held [StoreLock]
///
/// Implementations own whatever renewal machinery ("watchdog") keeps the lock alive while held.
/// `abandon()` must stop that machinery without touching the store; the lock entry then lapses by
/// its own TTL. It exists so that [StoreLock]'s `Drop` has something non-async to call.
#[async_trait]
pub trait LockHandle: Send {
    async fn unlock(self: Box<Self>) -> Result<()>;
    fn abandon(&mut self);
}

/// A held distributed lock
///
/// Obtained from [Store::try_lock]. Release it with [unlock](StoreLock::unlock); if the guard is
/// simply dropped, renewal stops and the underlying entry expires on its own, so a crashed holder
/// can't wedge the lock forever.
pub struct StoreLock {
    handle: Option<Box<dyn LockHandle>>,
}

impl StoreLock {
    pub fn new(handle: Box<dyn LockHandle>) -> StoreLock {
        StoreLock {
            handle: Some(handle),
        }
    }
    pub async fn unlock(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle.unlock().await,
            None => Ok(()),
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            handle.abandon();
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        the Store trait                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Bitmap toggle direction
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BitOp {
    Add,
    Remove,
}

/// Outcome of [Store::bit_toggle]: did the bit actually change state?
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BitToggle {
    Changed,
    Unchanged,
}

/// Object-safe trait abstracting over the key-value cache server
///
/// All operations are atomic from the caller's perspective; the compound ones (`bit_toggle`,
/// `packed_add`, `packed_fold_field`, `token_bucket`, `rate_limit_acquire`) correspond to
/// server-side scripts in a networked deployment.
///
/// TTL conventions: `None` means "no expiry". Reading a key past its expiry behaves as if the key
/// were absent.
#[async_trait]
pub trait Store: Send + Sync {
    ////////////////////////////////////////////////////////////////////////////////////////
    // plain values
    ////////////////////////////////////////////////////////////////////////////////////////
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set_raw(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;
    async fn get_string(&self, key: &str) -> Result<Option<String>>;
    async fn set_string(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    /// Set `key` only if absent; true if this call created it
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;
    async fn delete(&self, key: &str) -> Result<bool>;
    /// Enumerate live keys matching a `*`-glob. Linear in the keyspace-- reserve for cold
    /// (mutation/purge) paths; hot paths should maintain index sets instead.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;
    /// Remaining TTL, if the key exists and has one
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;
    /// (Re)set the TTL on an existing key; false if the key is absent
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;
    /// Pipelined GET: one round-trip, one result slot per key, in order
    async fn multi_get_raw(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>>;
    async fn multi_get_string(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    ////////////////////////////////////////////////////////////////////////////////////////
    // hashes
    ////////////////////////////////////////////////////////////////////////////////////////
    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64>;
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn hash_delete(&self, key: &str, fields: &[String]) -> Result<u64>;
    async fn hash_len(&self, key: &str) -> Result<u64>;

    ////////////////////////////////////////////////////////////////////////////////////////
    // lists
    ////////////////////////////////////////////////////////////////////////////////////////
    /// Push `values` onto the head of the list, last element ending up at the head (LPUSH)
    async fn list_push_front(&self, key: &str, values: &[String]) -> Result<u64>;
    /// Inclusive range; negative indices count from the tail (LRANGE)
    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;

    ////////////////////////////////////////////////////////////////////////////////////////
    // sets
    ////////////////////////////////////////////////////////////////////////////////////////
    async fn set_add(&self, key: &str, member: &str) -> Result<bool>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool>;

    ////////////////////////////////////////////////////////////////////////////////////////
    // sorted sets
    ////////////////////////////////////////////////////////////////////////////////////////
    async fn zset_add(&self, key: &str, member: &str, score: f64) -> Result<()>;
    async fn zset_remove(&self, key: &str, member: &str) -> Result<bool>;
    /// Members by descending score, inclusive index range (ZREVRANGE)
    async fn zset_rev_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;
    /// Members with `min <= score <= max`, descending, at most `limit` (ZREVRANGEBYSCORE)
    async fn zset_rev_range_by_score(
        &self,
        key: &str,
        max: f64,
        min: f64,
        limit: usize,
    ) -> Result<Vec<String>>;

    ////////////////////////////////////////////////////////////////////////////////////////
    // bitmaps
    ////////////////////////////////////////////////////////////////////////////////////////
    /// Atomically GETBIT & conditionally SETBIT; [BitToggle::Changed] iff the bit flipped
    async fn bit_toggle(&self, key: &str, offset: u64, op: BitOp) -> Result<BitToggle>;
    async fn get_bit(&self, key: &str, offset: u64) -> Result<bool>;
    async fn bit_count(&self, key: &str) -> Result<u64>;
    /// Pipelined BITCOUNT, one result per key in order; absent keys count zero
    async fn multi_bit_count(&self, keys: &[String]) -> Result<Vec<u64>>;

    ////////////////////////////////////////////////////////////////////////////////////////
    // packed counters
    ////////////////////////////////////////////////////////////////////////////////////////
    /// Atomically add `delta` to segment `idx` (0-based) of the packed counter at `key`,
    /// allocating a zeroed `schema_len * field_size` buffer if absent. The segment is a big-endian
    /// unsigned 32-bit value clamped to `[0, 2^32-1]`. Returns the new segment value.
    async fn packed_add(
        &self,
        key: &str,
        schema_len: usize,
        field_size: usize,
        idx: usize,
        delta: i64,
    ) -> Result<u64>;
    /// Atomically fold field `field` of the hash at `agg_key` into segment `field` of the packed
    /// counter at `counter_key`, then delete the hash field. One step, so a crash can't fold a
    /// delta twice. Returns false if the field was absent or zero.
    async fn packed_fold_field(
        &self,
        counter_key: &str,
        agg_key: &str,
        field: &str,
        schema_len: usize,
        field_size: usize,
    ) -> Result<bool>;

    ////////////////////////////////////////////////////////////////////////////////////////
    // admission control
    ////////////////////////////////////////////////////////////////////////////////////////
    /// Scripted token bucket: refill `refill_per_sec` tokens/s up to `capacity`, consume one,
    /// PEXPIRE the bucket to `ttl`. True if a token was available.
    async fn token_bucket(
        &self,
        key: &str,
        capacity: u64,
        refill_per_sec: u64,
        ttl: Duration,
    ) -> Result<bool>;
    /// Fixed-window rate limiter: at most `permits` acquisitions per `window`. True on admit.
    async fn rate_limit_acquire(&self, key: &str, permits: u32, window: Duration)
        -> Result<bool>;

    ////////////////////////////////////////////////////////////////////////////////////////
    // distributed lock
    ////////////////////////////////////////////////////////////////////////////////////////
    /// Try to acquire the lock at `key` with zero wait. `None` means someone else holds it. The
    /// returned guard is kept alive by backend-side renewal until unlocked or dropped.
    async fn try_lock(&self, key: &str) -> Result<Option<StoreLock>>;
}
