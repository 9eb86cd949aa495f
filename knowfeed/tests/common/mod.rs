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

//! Shared fixture for the end-to-end suites: the full service graph wired onto the in-memory
//! engines, with every background worker running at test-friendly intervals.

use std::{sync::Arc, time::Duration};

use chrono::Utc;

use knowfeed::{
    bus::{Bus, MemoryBus},
    cdc::{self, MemoryChangeSource},
    counter_events::{self, CounterEventProducer},
    counters::{self, CounterService},
    entities::{KnowPost, PostId, PostStatus, UserId, UserRow, Visibility},
    feed::{self, FeedService},
    feed_listener::FeedCountListener,
    hotkey::{self, HotKeyDetector},
    ids::SnowflakeIds,
    memory::MemoryBackend,
    metrics::Instruments,
    posts::{self, PostService},
    relation::{self, RelationService},
    relation_events::{spawn_relation_consumer, RelationEventProcessor},
    storage::Backend,
    user_counters::{self, UserCounterService},
    worker::Worker,
};
use knowfeed_store::{memory::MemoryStore, Store};

pub struct Harness {
    pub store: Arc<dyn Store>,
    pub backend: MemoryBackend,
    pub bus: Arc<MemoryBus>,
    pub counters: Arc<CounterService>,
    pub user_counters: Arc<UserCounterService>,
    pub relation: Arc<RelationService>,
    pub feed: Arc<FeedService>,
    pub posts: Arc<PostService>,
    workers: Vec<Worker>,
}

/// Flush/poll cadence for the background workers under test
pub const TICK: Duration = Duration::from_millis(25);
/// Long enough for an event to traverse bus -> bucket -> snapshot (or outbox -> CDC -> consumer)
pub const SETTLE: Duration = Duration::from_millis(400);

impl Harness {
    pub async fn new() -> Harness {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let backend = MemoryBackend::new();
        let bus = Arc::new(MemoryBus::new());
        let instruments = Arc::new(Instruments::new("knowfeed"));
        let ids = Arc::new(SnowflakeIds::default());

        let counters = Arc::new(CounterService::new(
            store.clone(),
            CounterEventProducer::new(bus.clone()),
            counters::Config::default(),
            instruments.clone(),
        ));
        let user_counters = Arc::new(UserCounterService::new(
            store.clone(),
            Arc::new(backend.clone()),
            counters.clone(),
            user_counters::Config::default(),
        ));
        let hotkey = Arc::new(HotKeyDetector::new(hotkey::Config::default()));
        let feed = Arc::new(FeedService::new(
            store.clone(),
            Arc::new(backend.clone()),
            counters.clone(),
            hotkey.clone(),
            feed::Config {
                double_delete_delay: Duration::from_millis(60),
                ..Default::default()
            },
            instruments.clone(),
        ));
        counters.register_listener(Arc::new(FeedCountListener::new(
            store.clone(),
            Arc::new(backend.clone()),
            user_counters.clone(),
            feed.local_pages(),
        )));
        let relation = Arc::new(RelationService::new(
            store.clone(),
            Arc::new(backend.clone()),
            user_counters.clone(),
            ids.clone(),
            relation::Config::default(),
        ));
        let posts = Arc::new(PostService::new(
            store.clone(),
            Arc::new(backend.clone()),
            counters.clone(),
            user_counters.clone(),
            feed.clone(),
            hotkey.clone(),
            ids.clone(),
            posts::Config::default(),
        ));

        let events_config = counter_events::Config {
            flush_interval: TICK,
            poll_timeout: TICK,
        };
        let processor = Arc::new(RelationEventProcessor::new(
            store.clone(),
            Arc::new(backend.clone()),
            user_counters.clone(),
            ids.clone(),
        ));
        let workers = vec![
            counter_events::spawn_aggregation_consumer(
                bus.clone(),
                store.clone(),
                events_config.clone(),
            ),
            counter_events::spawn_flusher(store.clone(), events_config),
            cdc::spawn_cdc_bridge(
                Box::new(MemoryChangeSource::new(backend.clone())),
                bus.clone(),
                cdc::Config {
                    interval: TICK,
                    ..Default::default()
                },
            ),
            spawn_relation_consumer(bus.clone(), processor, TICK),
            hotkey::spawn_rotator(hotkey.clone()),
        ];
        // Let the consumers get their subscriptions registered before anything publishes
        tokio::time::sleep(Duration::from_millis(50)).await;

        Harness {
            store,
            backend,
            bus,
            counters,
            user_counters,
            relation,
            feed,
            posts,
            workers,
        }
    }

    pub fn seed_user(&self, id: i64, nickname: &str) {
        self.backend.put_user(UserRow {
            id: UserId::new(id),
            nickname: Some(nickname.to_owned()),
            avatar: None,
            bio: None,
        });
    }

    /// Insert & publish a post with a fixed id, bypassing the draft workflow
    pub async fn seed_published_post(&self, id: i64, creator: i64, title: &str) {
        let now = Utc::now();
        self.backend
            .insert_draft(KnowPost {
                id: PostId::new(id),
                creator_id: UserId::new(creator),
                status: PostStatus::Draft,
                visible: Visibility::Public,
                is_top: false,
                title: Some(title.to_owned()),
                description: None,
                tags: vec![],
                img_urls: vec![],
                content_url: None,
                create_time: now,
                update_time: now,
                publish_time: None,
            })
            .await
            .unwrap();
        self.backend
            .publish(PostId::new(id), UserId::new(creator))
            .await
            .unwrap();
        // Distinct publish timestamps keep feed ordering deterministic
        tokio::time::sleep(Duration::from_millis(3)).await;
    }

    pub async fn shutdown(self) {
        for worker in self.workers {
            worker.shutdown(Duration::from_secs(2)).await.unwrap();
        }
    }
}

/// Publish a raw envelope onto `canal-outbox`, as a redelivery would
pub async fn republish_envelope(bus: &MemoryBus, payload: &str) {
    let envelope = serde_json::json!({
        "table": "outbox",
        "type": "INSERT",
        "data": [ { "payload": payload } ],
    })
    .to_string();
    bus.publish(cdc::CANAL_OUTBOX_TOPIC, None, &envelope)
        .await
        .unwrap();
}
