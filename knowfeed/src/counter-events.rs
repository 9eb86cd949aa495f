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

//! # counter events
//!
//! The eventual-aggregation pipeline between the bitmap fact layer & the packed counter
//! snapshots. Information moves one direction: fact -> delta -> snapshot.
//!
//! - The [producer](CounterEventProducer) publishes one [CounterEvent] per state change to the
//!   `counter-events` topic, partitioned by entity id so per-entity ordering survives.
//! - The aggregation consumer (group `counter-agg`) folds each event's delta into the entity's
//!   aggregation bucket-- a hash keyed by segment index-- and only then acks, binding the commit
//!   to "delta persisted".
//! - The [flusher](spawn_flusher) drains the buckets into the snapshots on a fixed delay. Fold &
//!   field-delete happen in one atomic store step, so a crash mid-flush can at worst leave a
//!   delta *pending*, never fold it twice.
//! - The opt-in replay consumer (group `counter-rebuild`, reading from earliest) exists for
//!   snapshot disaster recovery: it folds the full event history straight into the snapshots.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};
use tracing::{debug, warn};

use knowfeed_store::Store;

use crate::{
    bus::{self, Bus, StartAt},
    entities::{Metric, UserId},
    packed,
    worker::{self, Worker},
};

pub const EVENTS_TOPIC: &str = "counter-events";

pub const AGGREGATION_GROUP: &str = "counter-agg";
pub const REBUILD_GROUP: &str = "counter-rebuild";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to serialize a counter event: {source}"))]
    Ser {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to publish a counter event: {source}"))]
    Publish { source: bus::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          CounterEvent                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One counted state change: "+1 like on knowpost 100 from user 42"
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterEvent {
    pub entity_type: String,
    pub entity_id: String,
    pub metric: Metric,
    /// The metric's segment in the entity schema; carried so consumers need no schema lookup
    pub idx: usize,
    pub user_id: UserId,
    pub delta: i64,
}

impl CounterEvent {
    pub fn of(
        etype: &str,
        eid: &str,
        metric: Metric,
        uid: UserId,
        delta: i64,
    ) -> CounterEvent {
        CounterEvent {
            entity_type: etype.to_owned(),
            entity_id: eid.to_owned(),
            metric,
            idx: metric.segment(),
            user_id: uid,
            delta,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            producer                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone)]
pub struct CounterEventProducer {
    bus: Arc<dyn Bus>,
}

impl CounterEventProducer {
    pub fn new(bus: Arc<dyn Bus>) -> CounterEventProducer {
        CounterEventProducer { bus }
    }
    /// Publish `event`, partitioned by entity id
    pub async fn publish(&self, event: &CounterEvent) -> Result<()> {
        let payload = serde_json::to_string(event).context(SerSnafu)?;
        self.bus
            .publish(EVENTS_TOPIC, Some(&event.entity_id), &payload)
            .await
            .context(PublishSnafu)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           consumers                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Knobs for the aggregation pipeline
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Fixed delay between flusher passes
    #[serde(rename = "flush-interval")]
    pub flush_interval: Duration,
    /// How long consumers block waiting for a message before re-checking for shutdown
    #[serde(rename = "poll-timeout")]
    pub poll_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            poll_timeout: Duration::from_millis(250),
        }
    }
}

/// Spawn the aggregation consumer: `counter-events` -> aggregation buckets
pub fn spawn_aggregation_consumer(
    bus: Arc<dyn Bus>,
    store: Arc<dyn Store>,
    config: Config,
) -> Worker {
    Worker::spawn(move |stop| async move {
        let mut sub = bus
            .subscribe(EVENTS_TOPIC, AGGREGATION_GROUP, StartAt::Latest)
            .await
            .map_err(worker::Error::new)?;
        loop {
            tokio::select! {
                polled = sub.poll(config.poll_timeout) => {
                    let delivery = match polled {
                        Ok(Some(d)) => d,
                        Ok(None) => continue,
                        Err(err) => {
                            warn!("aggregation consumer poll failed: {err}");
                            continue;
                        }
                    };
                    let event: CounterEvent = match serde_json::from_str(&delivery.payload) {
                        Ok(e) => e,
                        Err(err) => {
                            // Poison message: skip it rather than wedge the partition
                            warn!("undecodable counter event {:?}: {err}", delivery.payload);
                            let _ = sub.ack(delivery.offset).await;
                            continue;
                        }
                    };
                    let agg_key = packed::agg_key(&event.entity_type, &event.entity_id);
                    let field = event.idx.to_string();
                    match store.hash_incr(&agg_key, &field, event.delta).await {
                        Ok(_) => {
                            let _ = store.set_add(&packed::agg_index_key(), &agg_key).await;
                            // Ack only now: the delta is durably in the bucket
                            if let Err(err) = sub.ack(delivery.offset).await {
                                warn!("failed to ack counter event: {err}");
                            }
                        }
                        Err(err) => {
                            // No ack; the bus will re-deliver
                            warn!("failed to fold counter event into {agg_key}: {err}");
                        }
                    }
                }
                _ = stop.notified() => return Ok(()),
            }
        }
    })
}

/// One flusher pass: drain every live aggregation bucket into its snapshot
pub async fn flush_aggregation_buckets(store: &dyn Store) {
    let index_key = packed::agg_index_key();
    let buckets = match store.set_members(&index_key).await {
        Ok(b) => b,
        Err(err) => {
            warn!("failed to enumerate aggregation buckets: {err}");
            return;
        }
    };
    for agg_key in buckets {
        let (etype, eid) = match packed::parse_agg_key(&agg_key) {
            Some(pair) => pair,
            None => continue,
        };
        let snapshot_key = packed::snapshot_key(etype, eid);
        let entries = match store.hash_get_all(&agg_key).await {
            Ok(e) => e,
            Err(err) => {
                warn!("failed to read aggregation bucket {agg_key}: {err}");
                continue;
            }
        };
        for field in entries.keys() {
            // Fold-and-clear is one atomic step; on error the field survives for the next pass
            if let Err(err) = store
                .packed_fold_field(
                    &snapshot_key,
                    &agg_key,
                    field,
                    packed::SCHEMA_LEN,
                    packed::FIELD_SIZE,
                )
                .await
            {
                warn!("failed to fold {agg_key}/{field} into {snapshot_key}: {err}");
            }
        }
        // Drop empty buckets to keep the index (and the keyspace) quiet
        if matches!(store.hash_len(&agg_key).await, Ok(0)) {
            let _ = store.delete(&agg_key).await;
            let _ = store.set_remove(&index_key, &agg_key).await;
            debug!("aggregation bucket {agg_key} drained");
        }
    }
}

/// Spawn the fixed-delay aggregation flusher
pub fn spawn_flusher(store: Arc<dyn Store>, config: Config) -> Worker {
    Worker::spawn(move |stop| async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(config.flush_interval) => {
                    flush_aggregation_buckets(store.as_ref()).await;
                }
                _ = stop.notified() => return Ok(()),
            }
        }
    })
}

/// Spawn the disaster-recovery replay consumer: the full event history, folded straight into the
/// snapshots. Opt-in; run it only when rebuilding from scratch.
pub fn spawn_replay_consumer(bus: Arc<dyn Bus>, store: Arc<dyn Store>, config: Config) -> Worker {
    Worker::spawn(move |stop| async move {
        let mut sub = bus
            .subscribe(EVENTS_TOPIC, REBUILD_GROUP, StartAt::Earliest)
            .await
            .map_err(worker::Error::new)?;
        loop {
            tokio::select! {
                polled = sub.poll(config.poll_timeout) => {
                    let delivery = match polled {
                        Ok(Some(d)) => d,
                        Ok(None) => continue,
                        Err(err) => {
                            warn!("replay consumer poll failed: {err}");
                            continue;
                        }
                    };
                    let event: CounterEvent = match serde_json::from_str(&delivery.payload) {
                        Ok(e) => e,
                        Err(err) => {
                            warn!("undecodable counter event in replay {:?}: {err}", delivery.payload);
                            let _ = sub.ack(delivery.offset).await;
                            continue;
                        }
                    };
                    let key = packed::snapshot_key(&event.entity_type, &event.entity_id);
                    match store
                        .packed_add(&key, packed::SCHEMA_LEN, packed::FIELD_SIZE, event.idx, event.delta)
                        .await
                    {
                        Ok(_) => {
                            if let Err(err) = sub.ack(delivery.offset).await {
                                warn!("failed to ack replayed counter event: {err}");
                            }
                        }
                        Err(err) => warn!("failed to replay counter event into {key}: {err}"),
                    }
                }
                _ = stop.notified() => return Ok(()),
            }
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use knowfeed_store::memory::MemoryStore;

    use crate::bus::MemoryBus;

    fn shortened() -> Config {
        Config {
            flush_interval: Duration::from_millis(25),
            poll_timeout: Duration::from_millis(25),
        }
    }

    #[tokio::test]
    async fn event_json_shape() {
        let event = CounterEvent::of("knowpost", "100", Metric::Like, UserId::new(42), 1);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["entityType"], "knowpost");
        assert_eq!(json["entityId"], "100");
        assert_eq!(json["metric"], "like");
        assert_eq!(json["idx"], 1);
        assert_eq!(json["userId"], 42);
        assert_eq!(json["delta"], 1);
    }

    #[tokio::test]
    async fn deltas_flow_from_event_to_snapshot() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let consumer = spawn_aggregation_consumer(bus.clone(), store.clone(), shortened());
        let flusher = spawn_flusher(store.clone(), shortened());
        // Give the consumer a beat to subscribe before producing
        tokio::time::sleep(Duration::from_millis(20)).await;

        let producer = CounterEventProducer::new(bus.clone());
        producer
            .publish(&CounterEvent::of("knowpost", "100", Metric::Like, UserId::new(1), 1))
            .await
            .unwrap();
        producer
            .publish(&CounterEvent::of("knowpost", "100", Metric::Like, UserId::new(2), 1))
            .await
            .unwrap();
        producer
            .publish(&CounterEvent::of("knowpost", "100", Metric::Fav, UserId::new(1), 1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;

        let raw = store
            .get_raw(&packed::snapshot_key("knowpost", "100"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packed::read_segment(&raw, Metric::Like.segment()), Some(2));
        assert_eq!(packed::read_segment(&raw, Metric::Fav.segment()), Some(1));
        // The bucket drained away
        assert!(store
            .get_raw(&packed::agg_key("knowpost", "100"))
            .await
            .unwrap()
            .is_none());
        assert!(store
            .set_members(&packed::agg_index_key())
            .await
            .unwrap()
            .is_empty());

        consumer.shutdown(Duration::from_secs(1)).await.unwrap();
        flusher.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn replay_rebuilds_from_earliest() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let producer = CounterEventProducer::new(bus.clone());
        // Events published *before* the replay consumer exists
        for uid in [1, 2, 3] {
            producer
                .publish(&CounterEvent::of("knowpost", "9", Metric::Like, UserId::new(uid), 1))
                .await
                .unwrap();
        }
        producer
            .publish(&CounterEvent::of("knowpost", "9", Metric::Like, UserId::new(3), -1))
            .await
            .unwrap();

        let replay = spawn_replay_consumer(bus.clone(), store.clone(), shortened());
        tokio::time::sleep(Duration::from_millis(150)).await;

        let raw = store
            .get_raw(&packed::snapshot_key("knowpost", "9"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packed::read_segment(&raw, Metric::Like.segment()), Some(2));

        replay.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}
