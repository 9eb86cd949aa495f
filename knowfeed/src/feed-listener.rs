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

//! # feed listener
//!
//! Counter deltas, applied to the feed caches *without invalidating them*.
//!
//! When someone likes or favorites a post, dropping every page that shows it would turn each
//! engagement into a cache-miss storm. Instead this listener-- running synchronously on the
//! toggling task, via [CounterListener]-- patches what's already cached: the post's `feed:count`
//! fragment, every page snapshot the reverse index says references the post (current & previous
//! hour slots, since fragments written near a rollover can be indexed under either), & the
//! author's likes/favs-received counters. Pages that have meanwhile expired are pruned from the
//! index instead of patched.
//!
//! Everything here is best-effort: a patch that fails just means a reader sees a count a flush
//! interval stale. Nothing may fail the user's toggle.

use std::sync::Arc;

use async_trait::async_trait;
use itertools::Itertools;
use tracing::{debug, warn};

use knowfeed_store::Store;

use crate::{
    counters::CounterListener,
    counter_events::CounterEvent,
    entities::{FeedPage, Metric, PostId},
    feed::{count_key, hour_slot, index_key, CountFragment, PageCache},
    storage::Backend,
    user_counters::UserCounterService,
};

pub struct FeedCountListener {
    store: Arc<dyn Store>,
    backend: Arc<dyn Backend>,
    user_counters: Arc<UserCounterService>,
    local_pages: Arc<PageCache>,
}

impl FeedCountListener {
    pub fn new(
        store: Arc<dyn Store>,
        backend: Arc<dyn Backend>,
        user_counters: Arc<UserCounterService>,
        local_pages: Arc<PageCache>,
    ) -> FeedCountListener {
        FeedCountListener {
            store,
            backend,
            user_counters,
            local_pages,
        }
    }

    /// Credit/debit the post author's received-likes/favs counter
    async fn propagate_to_owner(&self, event: &CounterEvent) {
        let id: PostId = match event.entity_id.parse() {
            Ok(id) => id,
            Err(_) => return,
        };
        let post = match self.backend.find_post(id).await {
            Ok(Some(post)) => post,
            Ok(None) => return,
            Err(err) => {
                warn!("owner lookup for {id} failed: {err}");
                return;
            }
        };
        let result = match event.metric {
            Metric::Like => {
                self.user_counters
                    .increment_likes_received(post.creator_id, event.delta)
                    .await
            }
            Metric::Fav => {
                self.user_counters
                    .increment_favs_received(post.creator_id, event.delta)
                    .await
            }
        };
        if let Err(err) = result {
            warn!(
                "failed to propagate {} delta to user {}: {err}",
                event.metric, post.creator_id
            );
        }
    }

    /// Overlay the delta onto an existing `feed:count` fragment, keeping its TTL
    async fn patch_count_fragment(&self, event: &CounterEvent) {
        let key = count_key(&event.entity_id);
        let json = match self.store.get_string(&key).await {
            Ok(Some(json)) => json,
            Ok(None) => return, // nothing cached; the next assembly recomputes
            Err(err) => {
                warn!("failed to read {key}: {err}");
                return;
            }
        };
        let mut fragment: CountFragment = serde_json::from_str(&json).unwrap_or_default();
        match event.metric {
            Metric::Like => fragment.like = apply(fragment.like, event.delta),
            Metric::Fav => fragment.fav = apply(fragment.fav, event.delta),
        }
        let ttl = self.store.ttl(&key).await.ok().flatten();
        match serde_json::to_string(&fragment) {
            Ok(json) => {
                if let Err(err) = self.store.set_string(&key, &json, ttl).await {
                    warn!("failed to patch {key}: {err}");
                }
            }
            Err(err) => warn!("failed to serialize {key}: {err}"),
        }
    }

    /// Patch every cached page the reverse index says shows this post
    async fn patch_pages(&self, event: &CounterEvent) {
        let hour = hour_slot();
        let mut page_keys: Vec<String> = vec![];
        for slot in [hour, hour - 1] {
            match self
                .store
                .set_members(&index_key(&event.entity_id, slot))
                .await
            {
                Ok(members) => page_keys.extend(members),
                Err(err) => warn!("failed to read the reverse index for slot {slot}: {err}"),
            }
        }
        for page_key in page_keys.into_iter().unique() {
            // The local tier is viewer-agnostic (flags are overlaid on read), so patch in place
            self.local_pages.patch(&page_key, |page| {
                adjust_page(page, &event.entity_id, event.metric, event.delta, true)
            });
            match self.store.get_string(&page_key).await {
                Ok(Some(json)) => {
                    let mut page: FeedPage = match serde_json::from_str(&json) {
                        Ok(page) => page,
                        Err(_) => continue,
                    };
                    // Viewer flags must not live in the shared page JSON
                    adjust_page(&mut page, &event.entity_id, event.metric, event.delta, false);
                    let ttl = self.store.ttl(&page_key).await.ok().flatten();
                    match serde_json::to_string(&page) {
                        Ok(json) => {
                            if let Err(err) = self.store.set_string(&page_key, &json, ttl).await {
                                warn!("failed to patch page {page_key}: {err}");
                            }
                        }
                        Err(err) => warn!("failed to serialize page {page_key}: {err}"),
                    }
                }
                Ok(None) => {
                    // The page lapsed; drop its index entry rather than patch a ghost
                    debug!("pruning {page_key} from the reverse index");
                    let _ = self
                        .store
                        .set_remove(&index_key(&event.entity_id, hour), &page_key)
                        .await;
                }
                Err(err) => warn!("failed to read page {page_key}: {err}"),
            }
        }
    }
}

fn apply(current: u64, delta: i64) -> u64 {
    (current as i64 + delta).max(0) as u64
}

fn adjust_page(page: &mut FeedPage, eid: &str, metric: Metric, delta: i64, preserve_flags: bool) {
    for item in page.items.iter_mut().filter(|it| it.id == eid) {
        match metric {
            Metric::Like => item.like_count = Some(apply(item.like_count.unwrap_or(0), delta)),
            Metric::Fav => {
                item.favorite_count = Some(apply(item.favorite_count.unwrap_or(0), delta))
            }
        }
        if !preserve_flags {
            item.liked = None;
            item.faved = None;
        }
    }
}

#[async_trait]
impl CounterListener for FeedCountListener {
    async fn on_counter_event(&self, event: &CounterEvent) {
        if event.entity_type != "knowpost" {
            return;
        }
        self.propagate_to_owner(event).await;
        self.patch_count_fragment(event).await;
        self.patch_pages(event).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use knowfeed_store::memory::MemoryStore;
    use std::time::Duration;

    use crate::{
        bus::MemoryBus,
        counter_events::CounterEventProducer,
        counters::{self, CounterService},
        entities::{FeedItem, KnowPost, PostStatus, UserId, Visibility},
        feed::page_key,
        memory::MemoryBackend,
        metrics::Instruments,
        packed::{self, UserSegment},
        user_counters,
    };
    use chrono::Utc;

    fn item(id: &str, like: u64, fav: u64) -> FeedItem {
        FeedItem {
            id: id.to_owned(),
            title: Some("t".to_owned()),
            description: None,
            cover_image: None,
            tags: vec![],
            author_avatar: None,
            author_nickname: None,
            like_count: Some(like),
            favorite_count: Some(fav),
            liked: None,
            faved: None,
            is_top: None,
        }
    }

    async fn fixture() -> (Arc<dyn Store>, MemoryBackend, Arc<PageCache>, FeedCountListener)
    {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let backend = MemoryBackend::new();
        let now = Utc::now();
        backend
            .insert_draft(KnowPost {
                id: crate::entities::PostId::new(77),
                creator_id: UserId::new(7),
                status: PostStatus::Published,
                visible: Visibility::Public,
                is_top: false,
                title: Some("t".to_owned()),
                description: None,
                tags: vec![],
                img_urls: vec![],
                content_url: None,
                create_time: now,
                update_time: now,
                publish_time: Some(now),
            })
            .await
            .unwrap();
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
        let local = Arc::new(PageCache::new(16, Duration::from_secs(15)));
        let listener = FeedCountListener::new(
            store.clone(),
            Arc::new(backend.clone()),
            user_counters,
            local.clone(),
        );
        (store, backend, local, listener)
    }

    #[tokio::test]
    async fn delta_patches_fragment_pages_and_owner() {
        let (store, _backend, local, listener) = fixture().await;
        let key = page_key(1, 20);
        let page = FeedPage {
            items: vec![item("77", 10, 2)],
            page: 1,
            size: 20,
            has_more: false,
        };
        // Pre-state: page JSON + local copy + count fragment + reverse index
        store
            .set_string(
                &key,
                &serde_json::to_string(&page).unwrap(),
                Some(Duration::from_secs(15)),
            )
            .await
            .unwrap();
        local.put(&key, page.clone());
        store
            .set_string(&count_key("77"), r#"{"like":10,"fav":2}"#, Some(Duration::from_secs(60)))
            .await
            .unwrap();
        store
            .set_add(&index_key("77", hour_slot()), &key)
            .await
            .unwrap();

        listener
            .on_counter_event(&CounterEvent::of(
                "knowpost",
                "77",
                Metric::Like,
                UserId::new(42),
                1,
            ))
            .await;

        // The count fragment moved to 11 & kept a TTL
        let fragment: CountFragment =
            serde_json::from_str(&store.get_string(&count_key("77")).await.unwrap().unwrap())
                .unwrap();
        assert_eq!(fragment, CountFragment { like: 11, fav: 2 });
        assert!(store.ttl(&count_key("77")).await.unwrap().is_some());
        // The distributed page was patched in place, TTL surviving
        let patched: FeedPage =
            serde_json::from_str(&store.get_string(&key).await.unwrap().unwrap()).unwrap();
        assert_eq!(patched.items[0].like_count, Some(11));
        assert_eq!(patched.items[0].liked, None);
        assert!(store.ttl(&key).await.unwrap().is_some());
        // So was the local copy
        assert_eq!(local.get(&key).unwrap().items[0].like_count, Some(11));
        // And the author's likes-received moved
        let raw = store
            .get_raw(&packed::user_counter_key(UserId::new(7)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            packed::read_segment(&raw, UserSegment::LikesReceived.idx()),
            Some(1)
        );
    }

    #[tokio::test]
    async fn lapsed_pages_are_pruned_from_the_index() {
        let (store, _backend, _local, listener) = fixture().await;
        let key = page_key(1, 20);
        let idx = index_key("77", hour_slot());
        store.set_add(&idx, &key).await.unwrap();
        // No page JSON behind the index entry
        listener
            .on_counter_event(&CounterEvent::of(
                "knowpost",
                "77",
                Metric::Fav,
                UserId::new(42),
                1,
            ))
            .await;
        assert!(store.set_members(&idx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn foreign_entity_types_are_ignored() {
        let (store, _backend, _local, listener) = fixture().await;
        store
            .set_string(&count_key("77"), r#"{"like":1,"fav":0}"#, None)
            .await
            .unwrap();
        listener
            .on_counter_event(&CounterEvent::of(
                "comment",
                "77",
                Metric::Like,
                UserId::new(42),
                1,
            ))
            .await;
        let fragment: CountFragment =
            serde_json::from_str(&store.get_string(&count_key("77")).await.unwrap().unwrap())
                .unwrap();
        assert_eq!(fragment.like, 1);
    }
}
