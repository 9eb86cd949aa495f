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

//! # memory
//!
//! A single-process [Store] engine.
//!
//! Everything lives in one mutex-guarded map, which makes the "scripted" compound operations
//! (toggle, packed arithmetic, token bucket) trivially atomic: they run under the same lock as
//! everything else. Expiry is lazy-- a key past its deadline is reaped the next time anything
//! touches it. That's the same observable behavior as a server-side TTL for our purposes, without
//! a sweeper task.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::{BitOp, BitToggle, Error, LockHandle, LockLostSnafu, Result, Store, StoreLock};
use snafu::prelude::*;

/// How long a held lock entry lives between watchdog renewals
const LOCK_TTL: Duration = Duration::from_secs(30);
/// Watchdog renewal cadence; must be comfortably under [LOCK_TTL]
const LOCK_RENEW: Duration = Duration::from_secs(10);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        value & entry                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug)]
enum Value {
    Bytes(Vec<u8>),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
    Set(HashSet<String>),
    Zset(HashMap<String, f64>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Bytes(_) => "string",
            Value::Hash(_) => "hash",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Zset(_) => "zset",
        }
    }
}

#[derive(Clone, Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

type Map = HashMap<String, Entry>;

fn wrong_type(key: &str, actual: &'static str, expected: &'static str) -> Error {
    crate::WrongTypeSnafu {
        key: key.to_owned(),
        actual,
        expected,
    }
    .build()
}

/// Fetch a live entry, reaping it first if expired
fn live<'a>(map: &'a mut Map, key: &str, now: Instant) -> Option<&'a mut Entry> {
    let expired = map
        .get(key)
        .and_then(|e| e.expires_at)
        .map(|at| at <= now)
        .unwrap_or(false);
    if expired {
        map.remove(key);
    }
    map.get_mut(key)
}

/// Fetch a live entry, materializing a fresh `default` if absent or expired
fn ensure<'a>(map: &'a mut Map, key: &str, now: Instant, default: fn() -> Value) -> &'a mut Entry {
    if live(map, key, now).is_none() {
        map.insert(
            key.to_owned(),
            Entry {
                value: default(),
                expires_at: None,
            },
        );
    }
    map.get_mut(key).unwrap(/* just ensured */)
}

/// Match `text` against a glob containing `*` wildcards (the only metacharacter we support)
fn glob_match(pattern: &str, text: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return pattern == text;
    }
    let mut pos = 0usize;
    for (i, seg) in segments.iter().enumerate() {
        if seg.is_empty() {
            continue;
        }
        if i == 0 {
            if !text.starts_with(seg) {
                return false;
            }
            pos = seg.len();
        } else if i == segments.len() - 1 {
            return text.len() >= pos && text[pos..].ends_with(seg);
        } else {
            match text[pos..].find(seg) {
                Some(at) => pos += at + seg.len(),
                None => return false,
            }
        }
    }
    // Pattern ended with '*'
    true
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn read_u32_be(buf: &[u8], off: usize) -> u64 {
    let mut n = 0u64;
    for i in 0..4 {
        n = (n << 8) | buf[off + i] as u64;
    }
    n
}

fn write_u32_be(buf: &mut [u8], off: usize, val: i64) {
    let n = val.clamp(0, u32::MAX as i64) as u32;
    buf[off..off + 4].copy_from_slice(&n.to_be_bytes());
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          MemoryStore                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// In-memory [Store] engine
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Map>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
    fn guard(&self) -> MutexGuard<'_, Map> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
    /// Add `delta` to segment `idx` of the blob at `key` under an already-held guard; shared
    /// between `packed_add` & `packed_fold_field`
    fn packed_add_locked(
        map: &mut Map,
        key: &str,
        schema_len: usize,
        field_size: usize,
        idx: usize,
        delta: i64,
        now: Instant,
    ) -> Result<u64> {
        let expected = schema_len * field_size;
        let entry = live(map, key, now);
        let (mut buf, expires_at) = match entry {
            Some(Entry {
                value: Value::Bytes(b),
                expires_at,
            }) if b.len() == expected => (b.clone(), *expires_at),
            Some(e) if !matches!(e.value, Value::Bytes(_)) => {
                return Err(wrong_type(key, e.value.kind(), "string"))
            }
            // Absent or malformed: start from a zero buffer, as the script would
            _ => (vec![0u8; expected], None),
        };
        let off = idx * field_size;
        let v = read_u32_be(&buf, off) as i64 + delta;
        write_u32_be(&mut buf, off, v);
        let newval = read_u32_be(&buf, off);
        map.insert(
            key.to_owned(),
            Entry {
                value: Value::Bytes(buf),
                expires_at,
            },
        );
        Ok(newval)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        let mut map = self.guard();
        match live(&mut map, key, now) {
            Some(Entry {
                value: Value::Bytes(b),
                ..
            }) => Ok(Some(b.clone())),
            Some(e) => Err(wrong_type(key, e.value.kind(), "string")),
            None => Ok(None),
        }
    }

    async fn set_raw(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut map = self.guard();
        map.insert(
            key.to_owned(),
            Entry {
                value: Value::Bytes(value.to_vec()),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .get_raw(key)
            .await?
            .map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    async fn set_string(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.set_raw(key, value.as_bytes(), ttl).await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut map = self.guard();
        if live(&mut map, key, now).is_some() {
            return Ok(false);
        }
        map.insert(
            key.to_owned(),
            Entry {
                value: Value::Bytes(value.as_bytes().to_vec()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        let mut map = self.guard();
        let found = live(&mut map, key, now).is_some();
        Ok(found && map.remove(key).is_some())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut map = self.guard();
        let expired: Vec<String> = map
            .iter()
            .filter(|(_, e)| e.expires_at.map(|at| at <= now).unwrap_or(false))
            .map(|(k, _)| k.clone())
            .collect();
        for k in expired {
            map.remove(&k);
        }
        Ok(map
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        let mut map = self.guard();
        Ok(live(&mut map, key, now)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut map = self.guard();
        match live(&mut map, key, now) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn multi_get_raw(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let now = Instant::now();
        let mut map = self.guard();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(match live(&mut map, key, now) {
                Some(Entry {
                    value: Value::Bytes(b),
                    ..
                }) => Some(b.clone()),
                _ => None,
            });
        }
        Ok(out)
    }

    async fn multi_get_string(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        Ok(self
            .multi_get_raw(keys)
            .await?
            .into_iter()
            .map(|opt| opt.map(|b| String::from_utf8_lossy(&b).into_owned()))
            .collect())
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let now = Instant::now();
        let mut map = self.guard();
        let entry = ensure(&mut map, key, now, || Value::Hash(HashMap::new()));
        match &mut entry.value {
            Value::Hash(h) => {
                let cur: i64 = h.get(field).and_then(|v| v.parse().ok()).unwrap_or(0);
                let next = cur + delta;
                h.insert(field.to_owned(), next.to_string());
                Ok(next)
            }
            other => Err(wrong_type(key, other.kind(), "hash")),
        }
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let now = Instant::now();
        let mut map = self.guard();
        match live(&mut map, key, now) {
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(h.clone()),
            Some(e) => Err(wrong_type(key, e.value.kind(), "hash")),
            None => Ok(HashMap::new()),
        }
    }

    async fn hash_delete(&self, key: &str, fields: &[String]) -> Result<u64> {
        let now = Instant::now();
        let mut map = self.guard();
        match live(&mut map, key, now) {
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => {
                let mut n = 0;
                for f in fields {
                    if h.remove(f).is_some() {
                        n += 1;
                    }
                }
                Ok(n)
            }
            Some(e) => Err(wrong_type(key, e.value.kind(), "hash")),
            None => Ok(0),
        }
    }

    async fn hash_len(&self, key: &str) -> Result<u64> {
        let now = Instant::now();
        let mut map = self.guard();
        match live(&mut map, key, now) {
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(h.len() as u64),
            Some(e) => Err(wrong_type(key, e.value.kind(), "hash")),
            None => Ok(0),
        }
    }

    async fn list_push_front(&self, key: &str, values: &[String]) -> Result<u64> {
        let now = Instant::now();
        let mut map = self.guard();
        let entry = ensure(&mut map, key, now, || Value::List(VecDeque::new()));
        match &mut entry.value {
            Value::List(l) => {
                for v in values {
                    l.push_front(v.clone());
                }
                Ok(l.len() as u64)
            }
            other => Err(wrong_type(key, other.kind(), "list")),
        }
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut map = self.guard();
        match live(&mut map, key, now) {
            Some(Entry {
                value: Value::List(l),
                ..
            }) => {
                let len = l.len() as i64;
                let norm = |i: i64| -> i64 {
                    if i < 0 {
                        (len + i).max(0)
                    } else {
                        i
                    }
                };
                let (lo, hi) = (norm(start), norm(stop).min(len - 1));
                if lo > hi || len == 0 {
                    return Ok(vec![]);
                }
                Ok(l.iter()
                    .skip(lo as usize)
                    .take((hi - lo + 1) as usize)
                    .cloned()
                    .collect())
            }
            Some(e) => Err(wrong_type(key, e.value.kind(), "list")),
            None => Ok(vec![]),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let now = Instant::now();
        let mut map = self.guard();
        let entry = ensure(&mut map, key, now, || Value::Set(HashSet::new()));
        match &mut entry.value {
            Value::Set(s) => Ok(s.insert(member.to_owned())),
            other => Err(wrong_type(key, other.kind(), "set")),
        }
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut map = self.guard();
        match live(&mut map, key, now) {
            Some(Entry {
                value: Value::Set(s),
                ..
            }) => Ok(s.iter().cloned().collect()),
            Some(e) => Err(wrong_type(key, e.value.kind(), "set")),
            None => Ok(vec![]),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let now = Instant::now();
        let mut map = self.guard();
        match live(&mut map, key, now) {
            Some(Entry {
                value: Value::Set(s),
                ..
            }) => Ok(s.remove(member)),
            Some(e) => Err(wrong_type(key, e.value.kind(), "set")),
            None => Ok(false),
        }
    }

    async fn zset_add(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let now = Instant::now();
        let mut map = self.guard();
        let entry = ensure(&mut map, key, now, || Value::Zset(HashMap::new()));
        match &mut entry.value {
            Value::Zset(z) => {
                z.insert(member.to_owned(), score);
                Ok(())
            }
            other => Err(wrong_type(key, other.kind(), "zset")),
        }
    }

    async fn zset_remove(&self, key: &str, member: &str) -> Result<bool> {
        let now = Instant::now();
        let mut map = self.guard();
        match live(&mut map, key, now) {
            Some(Entry {
                value: Value::Zset(z),
                ..
            }) => Ok(z.remove(member).is_some()),
            Some(e) => Err(wrong_type(key, e.value.kind(), "zset")),
            None => Ok(false),
        }
    }

    async fn zset_rev_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut map = self.guard();
        let mut members: Vec<(String, f64)> = match live(&mut map, key, now) {
            Some(Entry {
                value: Value::Zset(z),
                ..
            }) => z.iter().map(|(m, s)| (m.clone(), *s)).collect(),
            Some(e) => return Err(wrong_type(key, e.value.kind(), "zset")),
            None => return Ok(vec![]),
        };
        members.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        let len = members.len() as i64;
        let norm = |i: i64| -> i64 {
            if i < 0 {
                (len + i).max(0)
            } else {
                i
            }
        };
        let (lo, hi) = (norm(start), norm(stop).min(len - 1));
        if lo > hi || len == 0 {
            return Ok(vec![]);
        }
        Ok(members
            .into_iter()
            .skip(lo as usize)
            .take((hi - lo + 1) as usize)
            .map(|(m, _)| m)
            .collect())
    }

    async fn zset_rev_range_by_score(
        &self,
        key: &str,
        max: f64,
        min: f64,
        limit: usize,
    ) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut map = self.guard();
        let mut members: Vec<(String, f64)> = match live(&mut map, key, now) {
            Some(Entry {
                value: Value::Zset(z),
                ..
            }) => z
                .iter()
                .filter(|(_, s)| **s >= min && **s <= max)
                .map(|(m, s)| (m.clone(), *s))
                .collect(),
            Some(e) => return Err(wrong_type(key, e.value.kind(), "zset")),
            None => return Ok(vec![]),
        };
        members.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        Ok(members.into_iter().take(limit).map(|(m, _)| m).collect())
    }

    async fn bit_toggle(&self, key: &str, offset: u64, op: BitOp) -> Result<BitToggle> {
        let now = Instant::now();
        let mut map = self.guard();
        let entry = ensure(&mut map, key, now, || Value::Bytes(vec![]));
        match &mut entry.value {
            Value::Bytes(b) => {
                let byte = (offset / 8) as usize;
                let mask = 0x80u8 >> (offset % 8);
                let prev = b.get(byte).map(|v| v & mask != 0).unwrap_or(false);
                let want = matches!(op, BitOp::Add);
                if prev == want {
                    return Ok(BitToggle::Unchanged);
                }
                if b.len() <= byte {
                    b.resize(byte + 1, 0);
                }
                if want {
                    b[byte] |= mask;
                } else {
                    b[byte] &= !mask;
                }
                Ok(BitToggle::Changed)
            }
            other => Err(wrong_type(key, other.kind(), "string")),
        }
    }

    async fn get_bit(&self, key: &str, offset: u64) -> Result<bool> {
        let now = Instant::now();
        let mut map = self.guard();
        match live(&mut map, key, now) {
            Some(Entry {
                value: Value::Bytes(b),
                ..
            }) => {
                let byte = (offset / 8) as usize;
                let mask = 0x80u8 >> (offset % 8);
                Ok(b.get(byte).map(|v| v & mask != 0).unwrap_or(false))
            }
            Some(e) => Err(wrong_type(key, e.value.kind(), "string")),
            None => Ok(false),
        }
    }

    async fn bit_count(&self, key: &str) -> Result<u64> {
        let now = Instant::now();
        let mut map = self.guard();
        match live(&mut map, key, now) {
            Some(Entry {
                value: Value::Bytes(b),
                ..
            }) => Ok(b.iter().map(|v| v.count_ones() as u64).sum()),
            Some(e) => Err(wrong_type(key, e.value.kind(), "string")),
            None => Ok(0),
        }
    }

    async fn multi_bit_count(&self, keys: &[String]) -> Result<Vec<u64>> {
        let now = Instant::now();
        let mut map = self.guard();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(match live(&mut map, key, now) {
                Some(Entry {
                    value: Value::Bytes(b),
                    ..
                }) => b.iter().map(|v| v.count_ones() as u64).sum(),
                _ => 0,
            });
        }
        Ok(out)
    }

    async fn packed_add(
        &self,
        key: &str,
        schema_len: usize,
        field_size: usize,
        idx: usize,
        delta: i64,
    ) -> Result<u64> {
        let now = Instant::now();
        let mut map = self.guard();
        MemoryStore::packed_add_locked(&mut map, key, schema_len, field_size, idx, delta, now)
    }

    async fn packed_fold_field(
        &self,
        counter_key: &str,
        agg_key: &str,
        field: &str,
        schema_len: usize,
        field_size: usize,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut map = self.guard();
        let delta = match live(&mut map, agg_key, now) {
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => match h.get(field).and_then(|v| v.parse::<i64>().ok()) {
                Some(d) => d,
                None => return Ok(false),
            },
            Some(e) => return Err(wrong_type(agg_key, e.value.kind(), "hash")),
            None => return Ok(false),
        };
        let idx = match field.parse::<usize>() {
            Ok(i) if i < schema_len => i,
            _ => return Ok(false),
        };
        if delta != 0 {
            MemoryStore::packed_add_locked(
                &mut map, counter_key, schema_len, field_size, idx, delta, now,
            )?;
        }
        if let Some(Entry {
            value: Value::Hash(h),
            ..
        }) = live(&mut map, agg_key, now)
        {
            h.remove(field);
        }
        Ok(delta != 0)
    }

    async fn token_bucket(
        &self,
        key: &str,
        capacity: u64,
        refill_per_sec: u64,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Instant::now();
        let now_s = now_unix_secs();
        let mut map = self.guard();
        let entry = ensure(&mut map, key, now, || Value::Hash(HashMap::new()));
        match &mut entry.value {
            Value::Hash(h) => {
                let last: u64 = h.get("last").and_then(|v| v.parse().ok()).unwrap_or(now_s);
                let tokens: f64 = h
                    .get("tokens")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(capacity as f64);
                let elapsed = now_s.saturating_sub(last);
                let mut tokens = (tokens + elapsed as f64 * refill_per_sec as f64)
                    .min(capacity as f64);
                if tokens < 1.0 {
                    h.insert("last".to_owned(), now_s.to_string());
                    h.insert("tokens".to_owned(), tokens.to_string());
                    return Ok(false);
                }
                tokens -= 1.0;
                h.insert("last".to_owned(), now_s.to_string());
                h.insert("tokens".to_owned(), tokens.to_string());
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            other => Err(wrong_type(key, other.kind(), "hash")),
        }
    }

    async fn rate_limit_acquire(
        &self,
        key: &str,
        permits: u32,
        window: Duration,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut map = self.guard();
        if live(&mut map, key, now).is_none() {
            // First acquisition opens the window; the entry's TTL closes it
            let mut h = HashMap::new();
            h.insert("used".to_owned(), "1".to_owned());
            map.insert(
                key.to_owned(),
                Entry {
                    value: Value::Hash(h),
                    expires_at: Some(now + window),
                },
            );
            return Ok(true);
        }
        match map.get_mut(key) {
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => {
                let used: u32 = h.get("used").and_then(|v| v.parse().ok()).unwrap_or(0);
                if used >= permits {
                    return Ok(false);
                }
                h.insert("used".to_owned(), (used + 1).to_string());
                Ok(true)
            }
            Some(e) => Err(wrong_type(key, e.value.kind(), "hash")),
            None => Ok(false),
        }
    }

    async fn try_lock(&self, key: &str) -> Result<Option<StoreLock>> {
        let token = Uuid::new_v4();
        let now = Instant::now();
        {
            let mut map = self.guard();
            if live(&mut map, key, now).is_some() {
                return Ok(None);
            }
            map.insert(
                key.to_owned(),
                Entry {
                    value: Value::Bytes(token.as_bytes().to_vec()),
                    expires_at: Some(now + LOCK_TTL),
                },
            );
        }
        let inner = self.inner.clone();
        let wd_key = key.to_owned();
        let watchdog = tokio::spawn(async move {
            loop {
                tokio::time::sleep(LOCK_RENEW).await;
                let now = Instant::now();
                let mut map = inner.lock().unwrap_or_else(PoisonError::into_inner);
                match live(&mut map, &wd_key, now) {
                    Some(entry)
                        if matches!(&entry.value, Value::Bytes(b) if b.as_slice() == token.as_bytes()) =>
                    {
                        entry.expires_at = Some(now + LOCK_TTL);
                    }
                    _ => {
                        debug!("lock {} no longer ours; watchdog exiting", wd_key);
                        break;
                    }
                }
            }
        });
        Ok(Some(StoreLock::new(Box::new(MemoryLockHandle {
            inner: self.inner.clone(),
            key: key.to_owned(),
            token,
            watchdog,
        }))))
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       MemoryLockHandle                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

struct MemoryLockHandle {
    inner: Arc<Mutex<Map>>,
    key: String,
    token: Uuid,
    watchdog: JoinHandle<()>,
}

#[async_trait]
impl LockHandle for MemoryLockHandle {
    async fn unlock(self: Box<Self>) -> Result<()> {
        self.watchdog.abort();
        let now = Instant::now();
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let ours = matches!(
            live(&mut map, &self.key, now),
            Some(Entry { value: Value::Bytes(b), .. }) if b.as_slice() == self.token.as_bytes()
        );
        ensure!(ours, LockLostSnafu { key: self.key.clone() });
        map.remove(&self.key);
        Ok(())
    }
    fn abandon(&mut self) {
        self.watchdog.abort();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn strings_and_ttl() {
        let store = MemoryStore::new();
        store.set_string("k", "v", None).await.unwrap();
        assert_eq!(store.get_string("k").await.unwrap().unwrap(), "v");
        store
            .set_string("t", "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(store.get_string("t").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get_string("t").await.unwrap().is_none());
        assert!(!store.set_nx("k", "w", Duration::from_secs(1)).await.unwrap());
        assert!(store.set_nx("n", "w", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn globbing() {
        let store = MemoryStore::new();
        for k in ["feed:public:20:1:v1", "feed:public:20:2:v1", "feed:mine:7:20:1"] {
            store.set_string(k, "x", None).await.unwrap();
        }
        let mut hits = store.keys("feed:public:*").await.unwrap();
        hits.sort();
        assert_eq!(
            hits,
            vec!["feed:public:20:1:v1", "feed:public:20:2:v1"]
        );
        assert_eq!(store.keys("feed:mine:7:*").await.unwrap().len(), 1);
        assert_eq!(store.keys("feed:mine:8:*").await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn bit_toggle_reports_changes() {
        let store = MemoryStore::new();
        assert_eq!(
            store.bit_toggle("bm", 9, BitOp::Add).await.unwrap(),
            BitToggle::Changed
        );
        assert_eq!(
            store.bit_toggle("bm", 9, BitOp::Add).await.unwrap(),
            BitToggle::Unchanged
        );
        assert!(store.get_bit("bm", 9).await.unwrap());
        assert!(!store.get_bit("bm", 8).await.unwrap());
        assert_eq!(store.bit_count("bm").await.unwrap(), 1);
        assert_eq!(
            store.bit_toggle("bm", 9, BitOp::Remove).await.unwrap(),
            BitToggle::Changed
        );
        assert_eq!(store.bit_count("bm").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn packed_arithmetic() {
        let store = MemoryStore::new();
        // Absent key: zero buffer allocated on first add
        assert_eq!(store.packed_add("cnt", 5, 4, 1, 3).await.unwrap(), 3);
        let raw = store.get_raw("cnt").await.unwrap().unwrap();
        assert_eq!(raw.len(), 20);
        assert_eq!(&raw[4..8], &[0, 0, 0, 3]);
        // Negative overflow clamps at zero
        assert_eq!(store.packed_add("cnt", 5, 4, 1, -10).await.unwrap(), 0);
        // Saturation at u32::MAX
        assert_eq!(
            store
                .packed_add("cnt", 5, 4, 2, u32::MAX as i64 + 5)
                .await
                .unwrap(),
            u32::MAX as u64
        );
    }

    #[tokio::test]
    async fn fold_and_clear_is_one_step() {
        let store = MemoryStore::new();
        store.hash_incr("agg", "1", 4).await.unwrap();
        assert!(store
            .packed_fold_field("cnt", "agg", "1", 5, 4)
            .await
            .unwrap());
        let raw = store.get_raw("cnt").await.unwrap().unwrap();
        assert_eq!(&raw[4..8], &[0, 0, 0, 4]);
        assert_eq!(store.hash_len("agg").await.unwrap(), 0);
        // Re-folding the (now absent) field is a no-op
        assert!(!store
            .packed_fold_field("cnt", "agg", "1", 5, 4)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn token_bucket_drains_and_refuses() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            assert!(store
                .token_bucket("rl", 3, 1, Duration::from_secs(60))
                .await
                .unwrap());
        }
        assert!(!store
            .token_bucket("rl", 3, 1, Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn rate_limiter_window() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            assert!(store
                .rate_limit_acquire("rl", 3, Duration::from_millis(50))
                .await
                .unwrap());
        }
        assert!(!store
            .rate_limit_acquire("rl", 3, Duration::from_millis(50))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store
            .rate_limit_acquire("rl", 3, Duration::from_millis(50))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn lock_is_exclusive() {
        let store = MemoryStore::new();
        let guard = store.try_lock("lk").await.unwrap().unwrap();
        assert!(store.try_lock("lk").await.unwrap().is_none());
        guard.unlock().await.unwrap();
        let again = store.try_lock("lk").await.unwrap();
        assert!(again.is_some());
    }

    #[tokio::test]
    async fn zset_ordering() {
        let store = MemoryStore::new();
        store.zset_add("z", "a", 1.0).await.unwrap();
        store.zset_add("z", "b", 3.0).await.unwrap();
        store.zset_add("z", "c", 2.0).await.unwrap();
        assert_eq!(
            store.zset_rev_range("z", 0, -1).await.unwrap(),
            vec!["b", "c", "a"]
        );
        assert_eq!(
            store
                .zset_rev_range_by_score("z", 2.0, f64::NEG_INFINITY, 10)
                .await
                .unwrap(),
            vec!["c", "a"]
        );
        assert!(store.zset_remove("z", "c").await.unwrap());
        assert_eq!(
            store.zset_rev_range("z", 0, 0).await.unwrap(),
            vec!["b"]
        );
    }
}
