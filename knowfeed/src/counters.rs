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

//! # counters
//!
//! The entity counter service: bitmap facts, aggregated snapshots, & the rebuild protocol that
//! reconnects them when a snapshot goes missing or corrupt.
//!
//! Writes toggle a single bit & answer "did anything change?"; only real changes emit a delta
//! event (for eventual aggregation) and a local, same-task notification (for cache patching).
//! Reads decode the packed snapshot; a malformed snapshot triggers a rebuild from the bitmap
//! shards, guarded-- in order-- by an exponential backoff window, a distributed rate limiter, and
//! a zero-wait distributed lock, each refusal degrading to "zero counts now, try again later"
//! rather than stalling the read path.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use snafu::prelude::*;
use tap::Pipe;
use tracing::{debug, info, warn};

use knowfeed_store::{BitOp, BitToggle, Store};

use crate::{
    bitmap, counter_add,
    counter_events::{CounterEvent, CounterEventProducer},
    entities::{Metric, UserId},
    metrics::{Instruments, Registration, Sort},
    packed,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Store operation failed: {source}"))]
    Store { source: knowfeed_store::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

inventory::submit! { Registration::new("counter.toggles", Sort::IntegralCounter) }
inventory::submit! { Registration::new("counter.rebuilds", Sort::IntegralCounter) }
inventory::submit! { Registration::new("counter.rebuilds.refused", Sort::IntegralCounter) }

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        local listeners                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// In-process observer of counter deltas
///
/// Listeners run *synchronously on the mutating task*, after the bitmap write & before the write
/// call returns, so they observe every delta exactly once & in order. They must not fail the
/// write: absorb your own errors.
#[async_trait]
pub trait CounterListener: Send + Sync {
    async fn on_counter_event(&self, event: &CounterEvent);
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Rebuild-protocol knobs
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Rebuild attempts admitted per entity per window
    #[serde(rename = "rate-permits")]
    pub rate_permits: u32,
    #[serde(rename = "rate-window")]
    pub rate_window: Duration,
    /// First backoff step; doubles per refusal
    #[serde(rename = "backoff-base")]
    pub backoff_base: Duration,
    #[serde(rename = "backoff-max")]
    pub backoff_max: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rate_permits: 3,
            rate_window: Duration::from_secs(10),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Backoff levels are clamped here; with the default base & max the delay saturates well before
const MAX_BACKOFF_LEVEL: u32 = 10;

fn rate_limit_key(etype: &str, eid: &str) -> String {
    format!("rl:sds-rebuild:{}:{}", etype, eid)
}

fn lock_key(etype: &str, eid: &str) -> String {
    format!("lock:sds-rebuild:{}:{}", etype, eid)
}

fn backoff_exp_key(etype: &str, eid: &str) -> String {
    format!("backoff:sds-rebuild:exp:{}:{}", etype, eid)
}

fn backoff_until_key(etype: &str, eid: &str) -> String {
    format!("backoff:sds-rebuild:until:{}:{}", etype, eid)
}

fn zeros(metrics: &[Metric]) -> HashMap<Metric, u64> {
    metrics.iter().map(|m| (*m, 0)).collect()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         CounterService                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct CounterService {
    store: Arc<dyn Store>,
    producer: CounterEventProducer,
    listeners: RwLock<Vec<Arc<dyn CounterListener>>>,
    config: Config,
    instruments: Arc<Instruments>,
}

impl CounterService {
    pub fn new(
        store: Arc<dyn Store>,
        producer: CounterEventProducer,
        config: Config,
        instruments: Arc<Instruments>,
    ) -> CounterService {
        CounterService {
            store,
            producer,
            listeners: RwLock::new(vec![]),
            config,
            instruments,
        }
    }

    /// Attach an in-process delta observer (see [CounterListener])
    pub fn register_listener(&self, listener: Arc<dyn CounterListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    ////////////////////////////////////////////////////////////////////////////////////////
    // write path
    ////////////////////////////////////////////////////////////////////////////////////////

    pub async fn like(&self, etype: &str, eid: &str, uid: UserId) -> Result<bool> {
        self.toggle(etype, eid, uid, Metric::Like, BitOp::Add).await
    }

    pub async fn unlike(&self, etype: &str, eid: &str, uid: UserId) -> Result<bool> {
        self.toggle(etype, eid, uid, Metric::Like, BitOp::Remove)
            .await
    }

    pub async fn fav(&self, etype: &str, eid: &str, uid: UserId) -> Result<bool> {
        self.toggle(etype, eid, uid, Metric::Fav, BitOp::Add).await
    }

    pub async fn unfav(&self, etype: &str, eid: &str, uid: UserId) -> Result<bool> {
        self.toggle(etype, eid, uid, Metric::Fav, BitOp::Remove)
            .await
    }

    /// Toggle one (user, metric, entity) bit; true iff the state actually changed
    async fn toggle(
        &self,
        etype: &str,
        eid: &str,
        uid: UserId,
        metric: Metric,
        op: BitOp,
    ) -> Result<bool> {
        let chunk = bitmap::chunk_of(uid);
        let bit = bitmap::bit_of(uid);
        let shard = bitmap::shard_key(metric, etype, eid, chunk);
        let changed = matches!(
            self.store
                .bit_toggle(&shard, bit, op)
                .await
                .context(StoreSnafu)?,
            BitToggle::Changed
        );
        if !changed {
            return Ok(false);
        }
        counter_add!(self.instruments, "counter.toggles", 1, &[]);
        // Track the shard so rebuilds can enumerate it without a keyspace scan
        self.store
            .set_add(&bitmap::shard_index_key(metric, etype, eid), &shard)
            .await
            .context(StoreSnafu)?;
        let delta = match op {
            BitOp::Add => 1,
            BitOp::Remove => -1,
        };
        let event = CounterEvent::of(etype, eid, metric, uid, delta);
        // The fact layer is already updated; a lost event only delays aggregation until the next
        // rebuild, so publish failures are logged & swallowed
        if let Err(err) = self.producer.publish(&event).await {
            warn!("failed to publish counter event for {etype}:{eid}: {err}");
        }
        self.notify(&event).await;
        Ok(true)
    }

    /// Deliver `event` to every registered listener, in order, on this task
    async fn notify(&self, event: &CounterEvent) {
        let listeners: Vec<Arc<dyn CounterListener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener.on_counter_event(event).await;
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////
    // read path
    ////////////////////////////////////////////////////////////////////////////////////////

    pub async fn is_liked(&self, etype: &str, eid: &str, uid: UserId) -> Result<bool> {
        let key = bitmap::shard_key(Metric::Like, etype, eid, bitmap::chunk_of(uid));
        self.store
            .get_bit(&key, bitmap::bit_of(uid))
            .await
            .context(StoreSnafu)
    }

    pub async fn is_faved(&self, etype: &str, eid: &str, uid: UserId) -> Result<bool> {
        let key = bitmap::shard_key(Metric::Fav, etype, eid, bitmap::chunk_of(uid));
        self.store
            .get_bit(&key, bitmap::bit_of(uid))
            .await
            .context(StoreSnafu)
    }

    /// Read the requested metrics from the entity's snapshot, rebuilding it from the bitmap
    /// shards if it's missing or malformed
    pub async fn counts(
        &self,
        etype: &str,
        eid: &str,
        metrics: &[Metric],
    ) -> Result<HashMap<Metric, u64>> {
        let raw = self
            .store
            .get_raw(&packed::snapshot_key(etype, eid))
            .await
            .context(StoreSnafu)?;
        match raw {
            Some(raw) if packed::is_well_formed(&raw) => metrics
                .iter()
                .map(|m| (*m, packed::read_segment(&raw, m.segment()).unwrap_or(0)))
                .collect::<HashMap<Metric, u64>>()
                .pipe(Ok),
            _ => self.rebuild(etype, eid, metrics).await,
        }
    }

    /// Pipelined batch read. Entities with missing or malformed snapshots come back zero rather
    /// than triggering rebuilds-- list rendering stays cheap no matter what state the cache is in.
    pub async fn counts_batch(
        &self,
        etype: &str,
        eids: &[String],
        metrics: &[Metric],
    ) -> Result<HashMap<String, HashMap<Metric, u64>>> {
        if eids.is_empty() || metrics.is_empty() {
            return Ok(HashMap::new());
        }
        let keys: Vec<String> = eids
            .iter()
            .map(|eid| packed::snapshot_key(etype, eid))
            .collect();
        let raws = self.store.multi_get_raw(&keys).await.context(StoreSnafu)?;
        let mut out = HashMap::with_capacity(eids.len());
        for (eid, raw) in eids.iter().zip(raws) {
            let counts = match raw {
                Some(raw) if packed::is_well_formed(&raw) => metrics
                    .iter()
                    .map(|m| (*m, packed::read_segment(&raw, m.segment()).unwrap_or(0)))
                    .collect(),
                _ => zeros(metrics),
            };
            out.insert(eid.clone(), counts);
        }
        Ok(out)
    }

    ////////////////////////////////////////////////////////////////////////////////////////
    // rebuild protocol
    ////////////////////////////////////////////////////////////////////////////////////////

    async fn rebuild(
        &self,
        etype: &str,
        eid: &str,
        metrics: &[Metric],
    ) -> Result<HashMap<Metric, u64>> {
        if self.in_backoff(etype, eid).await? {
            debug!("rebuild of {etype}:{eid} skipped: in backoff");
            return Ok(zeros(metrics));
        }
        let admitted = self
            .store
            .rate_limit_acquire(
                &rate_limit_key(etype, eid),
                self.config.rate_permits,
                self.config.rate_window,
            )
            .await
            .context(StoreSnafu)?;
        if !admitted {
            counter_add!(self.instruments, "counter.rebuilds.refused", 1, &[]);
            self.escalate_backoff(etype, eid).await?;
            return Ok(zeros(metrics));
        }
        let lock = match self
            .store
            .try_lock(&lock_key(etype, eid))
            .await
            .context(StoreSnafu)?
        {
            Some(lock) => lock,
            None => {
                counter_add!(self.instruments, "counter.rebuilds.refused", 1, &[]);
                self.escalate_backoff(etype, eid).await?;
                return Ok(zeros(metrics));
            }
        };
        let result = self.rebuild_locked(etype, eid, metrics).await;
        if let Err(err) = lock.unlock().await {
            warn!("failed to release rebuild lock for {etype}:{eid}: {err}");
        }
        match result {
            Ok(counts) => {
                counter_add!(self.instruments, "counter.rebuilds", 1, &[]);
                info!("rebuilt counter snapshot for {etype}:{eid}");
                self.reset_backoff(etype, eid).await;
                Ok(counts)
            }
            Err(err) => Err(err),
        }
    }

    /// The rebuild proper; call only under the rebuild lock
    async fn rebuild_locked(
        &self,
        etype: &str,
        eid: &str,
        metrics: &[Metric],
    ) -> Result<HashMap<Metric, u64>> {
        let mut buf = vec![0u8; packed::expected_len()];
        let mut out = HashMap::with_capacity(metrics.len());
        let mut rebuilt_fields = Vec::with_capacity(metrics.len());
        for metric in metrics {
            let shards = self
                .store
                .set_members(&bitmap::shard_index_key(*metric, etype, eid))
                .await
                .context(StoreSnafu)?;
            let counts = self
                .store
                .multi_bit_count(&shards)
                .await
                .context(StoreSnafu)?;
            let sum: u64 = counts.iter().sum();
            packed::write_segment(&mut buf, metric.segment(), sum);
            out.insert(*metric, sum);
            rebuilt_fields.push(packed::metric_field(*metric));
        }
        self.store
            .set_raw(&packed::snapshot_key(etype, eid), &buf, None)
            .await
            .context(StoreSnafu)?;
        // Clear the rebuilt metrics' pending deltas: they're already counted in the bitmaps
        if !rebuilt_fields.is_empty() {
            self.store
                .hash_delete(&packed::agg_key(etype, eid), &rebuilt_fields)
                .await
                .context(StoreSnafu)?;
        }
        Ok(out)
    }

    async fn in_backoff(&self, etype: &str, eid: &str) -> Result<bool> {
        let until = self
            .store
            .get_string(&backoff_until_key(etype, eid))
            .await
            .context(StoreSnafu)?
            .and_then(|s| s.parse::<i64>().ok());
        Ok(match until {
            Some(until) => Utc::now().timestamp_millis() < until,
            None => false,
        })
    }

    /// Bump the backoff level (clamped) & extend the "don't even try until" deadline
    async fn escalate_backoff(&self, etype: &str, eid: &str) -> Result<()> {
        let exp_key = backoff_exp_key(etype, eid);
        let level = self
            .store
            .get_string(&exp_key)
            .await
            .context(StoreSnafu)?
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(0)
            .saturating_add(1)
            .min(MAX_BACKOFF_LEVEL);
        let base_ms = self.config.backoff_base.as_millis() as u64;
        let max_ms = self.config.backoff_max.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(1u64 << level).min(max_ms);
        let until = Utc::now().timestamp_millis() + delay_ms as i64;
        self.store
            .set_string(&exp_key, &level.to_string(), None)
            .await
            .context(StoreSnafu)?;
        self.store
            .set_string(
                &backoff_until_key(etype, eid),
                &until.to_string(),
                Some(Duration::from_millis(delay_ms + 1_000)),
            )
            .await
            .context(StoreSnafu)?;
        debug!("rebuild backoff for {etype}:{eid} escalated to level {level} ({delay_ms}ms)");
        Ok(())
    }

    async fn reset_backoff(&self, etype: &str, eid: &str) {
        if let Err(err) = self.store.delete(&backoff_exp_key(etype, eid)).await {
            warn!("failed to clear backoff level for {etype}:{eid}: {err}");
        }
        if let Err(err) = self.store.delete(&backoff_until_key(etype, eid)).await {
            warn!("failed to clear backoff deadline for {etype}:{eid}: {err}");
        }
    }
}
