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

//! # relation events
//!
//! The consuming half of the follow write path: relation events republished off the outbox land
//! here (group `relation-outbox-consumer`), at least once, in order. Processing is made
//! idempotent with a SETNX dedup key derived from the payload, so redeliveries are no-ops; a
//! processing failure releases the dedup claim & leaves the message un-acked, so the bus hands it
//! back and the retry actually retries.
//!
//! Effects per event: the mirror `follower` row, the `uf:flws:`/`uf:fans:` sorted-set caches
//! (score = created-at millis, short TTL), and the two user-dimension counters.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::{debug, warn};

use knowfeed_store::Store;

use crate::{
    bus::{Bus, StartAt},
    cdc,
    entities::UserId,
    ids::SnowflakeIds,
    storage::{self, Backend},
    user_counters::{self, UserCounterService},
    worker::{self, Worker},
};

pub const CONSUMER_GROUP: &str = "relation-outbox-consumer";

/// Dedup claims outlive any plausible redelivery horizon
const DEDUP_TTL: Duration = Duration::from_secs(600);
/// Relation zset caches are refreshed on every write & backfill
pub const ZSET_TTL: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Store operation failed: {source}"))]
    Store { source: knowfeed_store::Error },
    #[snafu(display("Storage operation failed: {source}"))]
    Storage { source: storage::Error },
    #[snafu(display("Failed to adjust a user counter: {source}"))]
    Counter { source: user_counters::Error },
    #[snafu(display("Failed to generate a follower row id: {source}"))]
    Ids { source: crate::ids::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         RelationEvent                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum RelationEventKind {
    FollowCreated,
    FollowCanceled,
}

impl std::fmt::Display for RelationEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelationEventKind::FollowCreated => write!(f, "FollowCreated"),
            RelationEventKind::FollowCanceled => write!(f, "FollowCanceled"),
        }
    }
}

/// The outbox payload for a follow/unfollow; this exact JSON shape is the contract with the
/// bridge & any other outbox consumer
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationEvent {
    #[serde(rename = "type")]
    pub kind: RelationEventKind,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    /// The `following` row id; absent on cancels
    #[serde(default)]
    pub id: Option<i64>,
}

pub fn followings_key(uid: UserId) -> String {
    format!("uf:flws:{}", uid)
}

pub fn followers_key(uid: UserId) -> String {
    format!("uf:fans:{}", uid)
}

fn dedup_key(evt: &RelationEvent) -> String {
    format!(
        "dedup:rel:{}:{}:{}:{}",
        evt.kind,
        evt.from_user_id,
        evt.to_user_id,
        evt.id.unwrap_or(0)
    )
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     RelationEventProcessor                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct RelationEventProcessor {
    store: Arc<dyn Store>,
    backend: Arc<dyn Backend>,
    user_counters: Arc<UserCounterService>,
    ids: Arc<SnowflakeIds>,
}

impl RelationEventProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        backend: Arc<dyn Backend>,
        user_counters: Arc<UserCounterService>,
        ids: Arc<SnowflakeIds>,
    ) -> RelationEventProcessor {
        RelationEventProcessor {
            store,
            backend,
            user_counters,
            ids,
        }
    }

    /// Apply one relation event's side effects, exactly once per dedup window
    pub async fn process(&self, evt: &RelationEvent) -> Result<()> {
        let dk = dedup_key(evt);
        let first = self
            .store
            .set_nx(&dk, "1", DEDUP_TTL)
            .await
            .context(StoreSnafu)?;
        if !first {
            debug!("relation event {dk} already processed; skipping");
            return Ok(());
        }
        match self.apply(evt).await {
            Ok(()) => Ok(()),
            Err(err) => {
                // Release the claim so the redelivery can actually retry
                if let Err(del) = self.store.delete(&dk).await {
                    warn!("failed to release dedup claim {dk}: {del}");
                }
                Err(err)
            }
        }
    }

    async fn apply(&self, evt: &RelationEvent) -> Result<()> {
        let from = evt.from_user_id;
        let to = evt.to_user_id;
        let flws = followings_key(from);
        let fans = followers_key(to);
        match evt.kind {
            RelationEventKind::FollowCreated => {
                let row_id = match evt.id {
                    Some(id) => id,
                    None => self.ids.next_id().context(IdsSnafu)?,
                };
                self.backend
                    .insert_follower(row_id, to, from)
                    .await
                    .context(StorageSnafu)?;
                let now_ms = Utc::now().timestamp_millis() as f64;
                self.store
                    .zset_add(&flws, &to.to_string(), now_ms)
                    .await
                    .context(StoreSnafu)?;
                self.store
                    .zset_add(&fans, &from.to_string(), now_ms)
                    .await
                    .context(StoreSnafu)?;
                self.store.expire(&flws, ZSET_TTL).await.context(StoreSnafu)?;
                self.store.expire(&fans, ZSET_TTL).await.context(StoreSnafu)?;
                self.user_counters
                    .increment_followings(from, 1)
                    .await
                    .context(CounterSnafu)?;
                self.user_counters
                    .increment_followers(to, 1)
                    .await
                    .context(CounterSnafu)?;
            }
            RelationEventKind::FollowCanceled => {
                self.backend
                    .cancel_follower(to, from)
                    .await
                    .context(StorageSnafu)?;
                self.store
                    .zset_remove(&flws, &to.to_string())
                    .await
                    .context(StoreSnafu)?;
                self.store
                    .zset_remove(&fans, &from.to_string())
                    .await
                    .context(StoreSnafu)?;
                self.store.expire(&flws, ZSET_TTL).await.context(StoreSnafu)?;
                self.store.expire(&fans, ZSET_TTL).await.context(StoreSnafu)?;
                self.user_counters
                    .increment_followings(from, -1)
                    .await
                    .context(CounterSnafu)?;
                self.user_counters
                    .increment_followers(to, -1)
                    .await
                    .context(CounterSnafu)?;
            }
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        consumer worker                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Spawn the `canal-outbox` consumer feeding [RelationEventProcessor]
pub fn spawn_relation_consumer(
    bus: Arc<dyn Bus>,
    processor: Arc<RelationEventProcessor>,
    poll_timeout: Duration,
) -> Worker {
    Worker::spawn(move |stop| async move {
        let mut sub = bus
            .subscribe(cdc::CANAL_OUTBOX_TOPIC, CONSUMER_GROUP, StartAt::Latest)
            .await
            .map_err(worker::Error::new)?;
        loop {
            tokio::select! {
                polled = sub.poll(poll_timeout) => {
                    let delivery = match polled {
                        Ok(Some(d)) => d,
                        Ok(None) => continue,
                        Err(err) => {
                            warn!("relation consumer poll failed: {err}");
                            continue;
                        }
                    };
                    let payloads = cdc::extract_outbox_rows(&delivery.payload);
                    let mut failed = false;
                    for payload in payloads {
                        let evt: RelationEvent = match serde_json::from_str(&payload) {
                            Ok(e) => e,
                            Err(err) => {
                                // Not a relation payload (or garbage); other consumers may care,
                                // we don't
                                debug!("skipping non-relation outbox payload {payload:?}: {err}");
                                continue;
                            }
                        };
                        if let Err(err) = processor.process(&evt).await {
                            warn!("failed to process relation event {evt:?}: {err}");
                            failed = true;
                            break;
                        }
                    }
                    if !failed {
                        if let Err(err) = sub.ack(delivery.offset).await {
                            warn!("failed to ack relation outbox message: {err}");
                        }
                    }
                    // else: no ack; the message comes back around
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

    use crate::{
        bus::MemoryBus,
        counter_events::CounterEventProducer,
        counters::{self, CounterService},
        memory::MemoryBackend,
        metrics::Instruments,
        packed::{self, UserSegment},
    };

    fn processor() -> (Arc<dyn Store>, MemoryBackend, RelationEventProcessor) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let backend = MemoryBackend::new();
        let counters = Arc::new(CounterService::new(
            store.clone(),
            CounterEventProducer::new(Arc::new(MemoryBus::new())),
            counters::Config::default(),
            Arc::new(Instruments::new("knowfeed")),
        ));
        let user_counters = Arc::new(UserCounterService::new(
            store.clone(),
            Arc::new(backend.clone()),
            counters,
            user_counters::Config::default(),
        ));
        let proc = RelationEventProcessor::new(
            store.clone(),
            Arc::new(backend.clone()),
            user_counters,
            Arc::new(SnowflakeIds::default()),
        );
        (store, backend, proc)
    }

    #[tokio::test]
    async fn event_json_contract() {
        let evt = RelationEvent {
            kind: RelationEventKind::FollowCreated,
            from_user_id: UserId::new(1),
            to_user_id: UserId::new(2),
            id: Some(42),
        };
        let json = serde_json::to_value(evt).unwrap();
        assert_eq!(json["type"], "FollowCreated");
        assert_eq!(json["fromUserId"], 1);
        assert_eq!(json["toUserId"], 2);
        assert_eq!(json["id"], 42);
        // Cancels omit the id
        let back: RelationEvent =
            serde_json::from_str(r#"{"type":"FollowCanceled","fromUserId":1,"toUserId":2}"#)
                .unwrap();
        assert_eq!(back.kind, RelationEventKind::FollowCanceled);
        assert_eq!(back.id, None);
    }

    #[tokio::test]
    async fn redelivery_is_deduplicated() {
        let (store, backend, proc) = processor();
        let evt = RelationEvent {
            kind: RelationEventKind::FollowCreated,
            from_user_id: UserId::new(1),
            to_user_id: UserId::new(2),
            id: Some(42),
        };
        proc.process(&evt).await.unwrap();
        proc.process(&evt).await.unwrap(); // redelivery: no further effect
        assert_eq!(
            backend.count_follower_active(UserId::new(2)).await.unwrap(),
            1
        );
        assert_eq!(
            store
                .zset_rev_range(&followings_key(UserId::new(1)), 0, -1)
                .await
                .unwrap(),
            vec!["2"]
        );
        assert_eq!(
            store
                .zset_rev_range(&followers_key(UserId::new(2)), 0, -1)
                .await
                .unwrap(),
            vec!["1"]
        );
        let raw = store
            .get_raw(&packed::user_counter_key(UserId::new(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            packed::read_segment(&raw, UserSegment::Followings.idx()),
            Some(1)
        );
    }

    #[tokio::test]
    async fn cancel_reverses_create() {
        let (store, backend, proc) = processor();
        proc.process(&RelationEvent {
            kind: RelationEventKind::FollowCreated,
            from_user_id: UserId::new(1),
            to_user_id: UserId::new(2),
            id: Some(42),
        })
        .await
        .unwrap();
        proc.process(&RelationEvent {
            kind: RelationEventKind::FollowCanceled,
            from_user_id: UserId::new(1),
            to_user_id: UserId::new(2),
            id: None,
        })
        .await
        .unwrap();
        assert_eq!(
            backend.count_follower_active(UserId::new(2)).await.unwrap(),
            0
        );
        assert!(store
            .zset_rev_range(&followings_key(UserId::new(1)), 0, -1)
            .await
            .unwrap()
            .is_empty());
        let raw = store
            .get_raw(&packed::user_counter_key(UserId::new(2)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            packed::read_segment(&raw, UserSegment::Followers.idx()),
            Some(0)
        );
    }
}
