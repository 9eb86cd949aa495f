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

//! # feed
//!
//! The multi-tier feed cache.
//!
//! The public feed reads through three layers, cheapest first:
//!
//! 1. an in-process page LRU with a short TTL;
//! 2. a distributed *fragment tree*-- an ids list plus per-item & per-count pieces, all bound to
//!    the current hour slot so a rollover starts cold instead of detonating everything at once;
//! 3. a distributed whole-page JSON with an even shorter TTL.
//!
//! Misses collapse into a per-page single-flight DB load that rebuilds every layer. The fragment
//! tree exists so that a counter change can patch one `feed:count:{id}` piece & the pages a
//! reverse index says contain it, instead of invalidating whole pages; the hour-slot binding
//! keeps those reverse-index sets small & self-expiring.
//!
//! Everything the shared caches hold is viewer-agnostic: `liked`/`faved` are overlaid per-request
//! from the bitmap layer. The one exception is the "mine" feed, whose cache key embeds the
//! viewer. Mutations purge with a delete / write / delayed-delete dance against readers mid-fill.

use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use chrono::Utc;
use lru::LruCache;
use rand::Rng;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::{debug, info, warn};

use knowfeed_store::Store;

use crate::{
    counter_add,
    counters::{self, CounterService},
    entities::{FeedItem, FeedPage, Metric, PostStatus, UserId},
    hotkey::HotKeyDetector,
    metrics::{Instruments, Registration, Sort},
    singleflight::SingleFlight,
    storage::{self, Backend},
};

pub const LAYOUT_VER: u32 = 1;
/// Negative-cache marker; type-distinct from any JSON we write (we never cache a bare string)
pub const NULL_SENTINEL: &str = "NULL";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Store operation failed: {source}"))]
    Store { source: knowfeed_store::Error },
    #[snafu(display("Storage operation failed: {source}"))]
    Storage { source: storage::Error },
    #[snafu(display("Failed to read entity counts: {source}"))]
    Counts { source: counters::Error },
    #[snafu(display("Failed to serialize a feed page: {source}"))]
    Ser {
        source: serde_json::Error,
        backtrace: snafu::Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

inventory::submit! { Registration::new("feed.reads.local", Sort::IntegralCounter) }
inventory::submit! { Registration::new("feed.reads.fragments", Sort::IntegralCounter) }
inventory::submit! { Registration::new("feed.reads.page", Sort::IntegralCounter) }
inventory::submit! { Registration::new("feed.reads.origin", Sort::IntegralCounter) }

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           key shapes                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub fn page_key(page: u32, size: u32) -> String {
    format!("feed:public:{}:{}:v{}", size, page, LAYOUT_VER)
}

pub fn ids_key(size: u32, hour_slot: i64, page: u32) -> String {
    format!("feed:public:ids:{}:{}:{}", size, hour_slot, page)
}

pub fn has_more_key(size: u32, hour_slot: i64, page: u32) -> String {
    format!("{}:hasMore", ids_key(size, hour_slot, page))
}

pub fn item_key(id: &str) -> String {
    format!("feed:item:{}", id)
}

pub fn count_key(id: &str) -> String {
    format!("feed:count:{}", id)
}

/// Reverse index: the page keys referencing `id` within `hour_slot`
pub fn index_key(id: &str, hour_slot: i64) -> String {
    format!("feed:public:index:{}:{}", id, hour_slot)
}

/// Index set of live page-cache keys, for page-scoped maintenance
pub fn pages_index_key() -> &'static str {
    "feed:public:pages"
}

pub fn mine_key(uid: UserId, page: u32, size: u32) -> String {
    format!("feed:mine:{}:{}:{}", uid, size, page)
}

pub fn hour_slot() -> i64 {
    Utc::now().timestamp_millis() / 3_600_000
}

/// The `feed:count:{id}` fragment body
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct CountFragment {
    pub like: u64,
    pub fav: u64,
}

fn jitter(base: Duration, spread: Duration) -> Duration {
    let extra = rand::thread_rng().gen_range(0..=spread.as_millis() as u64);
    base + Duration::from_millis(extra)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(rename = "local-public-ttl")]
    pub local_public_ttl: Duration,
    #[serde(rename = "local-public-size")]
    pub local_public_size: usize,
    #[serde(rename = "local-mine-ttl")]
    pub local_mine_ttl: Duration,
    #[serde(rename = "local-mine-size")]
    pub local_mine_size: usize,
    /// Distributed whole-page TTL: base plus up to `jitter`
    #[serde(rename = "page-ttl")]
    pub page_ttl: Duration,
    #[serde(rename = "page-ttl-jitter")]
    pub page_ttl_jitter: Duration,
    /// Fragment (ids/item/count/index) TTL: base plus up to `jitter`
    #[serde(rename = "fragment-ttl")]
    pub fragment_ttl: Duration,
    #[serde(rename = "fragment-ttl-jitter")]
    pub fragment_ttl_jitter: Duration,
    #[serde(rename = "mine-ttl")]
    pub mine_ttl: Duration,
    #[serde(rename = "mine-ttl-jitter")]
    pub mine_ttl_jitter: Duration,
    #[serde(rename = "sentinel-ttl")]
    pub sentinel_ttl: Duration,
    #[serde(rename = "sentinel-ttl-jitter")]
    pub sentinel_ttl_jitter: Duration,
    #[serde(rename = "has-more-ttl")]
    pub has_more_ttl: Duration,
    #[serde(rename = "has-more-ttl-jitter")]
    pub has_more_ttl_jitter: Duration,
    /// Pause between the two halves of a double delete
    #[serde(rename = "double-delete-delay")]
    pub double_delete_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_public_ttl: Duration::from_secs(15),
            local_public_size: 1_000,
            local_mine_ttl: Duration::from_secs(10),
            local_mine_size: 1_000,
            page_ttl: Duration::from_secs(10),
            page_ttl_jitter: Duration::from_secs(10),
            fragment_ttl: Duration::from_secs(60),
            fragment_ttl_jitter: Duration::from_secs(30),
            mine_ttl: Duration::from_secs(30),
            mine_ttl_jitter: Duration::from_secs(20),
            sentinel_ttl: Duration::from_secs(30),
            sentinel_ttl_jitter: Duration::from_secs(30),
            has_more_ttl: Duration::from_secs(10),
            has_more_ttl_jitter: Duration::from_secs(10),
            double_delete_delay: Duration::from_millis(200),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        local page cache                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// In-process page LRU with write-time TTL, shared between the feed reader & the counter-change
/// listener (which patches pages in place)
pub struct PageCache {
    inner: Mutex<LruCache<String, (Instant, FeedPage)>>,
    ttl: Duration,
}

impl PageCache {
    pub fn new(size: usize, ttl: Duration) -> PageCache {
        PageCache {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(size.max(1)).unwrap(/* known good */),
            )),
            ttl,
        }
    }
    pub fn get(&self, key: &str) -> Option<FeedPage> {
        let mut cache = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let hit = cache
            .get(key)
            .map(|(at, page)| (at.elapsed() <= self.ttl, page.clone()));
        match hit {
            Some((true, page)) => Some(page),
            Some((false, _)) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }
    pub fn put(&self, key: &str, page: FeedPage) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(key.to_owned(), (Instant::now(), page));
    }
    /// Patch a resident page in place without refreshing its TTL
    pub fn patch(&self, key: &str, patch: impl FnOnce(&mut FeedPage)) {
        let mut cache = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((at, page)) = cache.get_mut(key) {
            if at.elapsed() <= self.ttl {
                patch(page);
            }
        }
    }
    pub fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          FeedService                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct FeedService {
    store: Arc<dyn Store>,
    backend: Arc<dyn Backend>,
    counters: Arc<CounterService>,
    hotkey: Arc<HotKeyDetector>,
    flights: SingleFlight,
    local_public: Arc<PageCache>,
    local_mine: Arc<PageCache>,
    config: Config,
    instruments: Arc<Instruments>,
}

impl FeedService {
    pub fn new(
        store: Arc<dyn Store>,
        backend: Arc<dyn Backend>,
        counters: Arc<CounterService>,
        hotkey: Arc<HotKeyDetector>,
        config: Config,
        instruments: Arc<Instruments>,
    ) -> FeedService {
        let local_public = Arc::new(PageCache::new(
            config.local_public_size,
            config.local_public_ttl,
        ));
        let local_mine = Arc::new(PageCache::new(config.local_mine_size, config.local_mine_ttl));
        FeedService {
            store,
            backend,
            counters,
            hotkey,
            flights: SingleFlight::new(),
            local_public,
            local_mine,
            config,
            instruments,
        }
    }

    /// The in-process public page cache, shared with the counter-change listener
    pub fn local_pages(&self) -> Arc<PageCache> {
        self.local_public.clone()
    }

    ////////////////////////////////////////////////////////////////////////////////////////
    // public feed
    ////////////////////////////////////////////////////////////////////////////////////////

    pub async fn public_feed(
        &self,
        page: u32,
        size: u32,
        viewer: Option<UserId>,
    ) -> Result<FeedPage> {
        let size = size.clamp(1, 50);
        let page = page.max(1);
        let key = page_key(page, size);
        let hour = hour_slot();
        let ids_key = ids_key(size, hour, page);
        let has_more_key = has_more_key(size, hour, page);

        // Tier 1: the in-process page cache
        if let Some(local) = self.local_public.get(&key) {
            self.hotkey.record(&key);
            self.maybe_extend_ttl(&key, self.config.local_public_ttl).await;
            counter_add!(self.instruments, "feed.reads.local", 1, &[]);
            info!("feed.public source=local key={key} page={page} size={size}");
            return Ok(self.overlay(local, viewer).await);
        }

        // Tier 2: assemble from the fragment tree
        if let Some(base) = self
            .assemble_from_fragments(&ids_key, &has_more_key, page, size)
            .await?
        {
            self.local_public.put(&key, base.clone());
            self.hotkey.record(&key);
            self.maybe_extend_ttl(&key, self.config.local_public_ttl).await;
            counter_add!(self.instruments, "feed.reads.fragments", 1, &[]);
            info!("feed.public source=3tier key={key} page={page} size={size}");
            return Ok(self.overlay(base, viewer).await);
        }

        // Tier 3: the distributed whole-page JSON
        if let Some(base) = self.page_cache_hit(&key).await? {
            self.local_public.put(&key, base.clone());
            self.hotkey.record(&key);
            self.maybe_extend_ttl(&key, self.config.local_public_ttl).await;
            counter_add!(self.instruments, "feed.reads.page", 1, &[]);
            info!("feed.public source=page key={key} page={page} size={size}");
            // Heal the fragment tree off the hot path
            spawn_fragment_repair(
                self.store.clone(),
                self.config.clone(),
                base.clone(),
                key.clone(),
                ids_key.clone(),
                has_more_key.clone(),
            );
            return Ok(self.overlay(base, viewer).await);
        }

        // Origin load, one flight per page
        let _flight = self.flights.acquire(&ids_key).await;
        // Re-check the shared tiers: the previous flight may have filled them
        if let Some(base) = self
            .assemble_from_fragments(&ids_key, &has_more_key, page, size)
            .await?
        {
            self.local_public.put(&key, base.clone());
            self.hotkey.record(&key);
            info!("feed.public source=3tier(after-flight) key={key} page={page} size={size}");
            return Ok(self.overlay(base, viewer).await);
        }
        if let Some(base) = self.page_cache_hit(&key).await? {
            self.local_public.put(&key, base.clone());
            self.hotkey.record(&key);
            info!("feed.public source=page(after-flight) key={key} page={page} size={size}");
            return Ok(self.overlay(base, viewer).await);
        }

        // size+1 answers "is there a next page?" without a count query
        let offset = ((page - 1) * size) as usize;
        let mut rows = self
            .backend
            .list_feed_public(size as usize + 1, offset)
            .await
            .context(StorageSnafu)?;
        let has_more = rows.len() > size as usize;
        rows.truncate(size as usize);
        let mut items: Vec<FeedItem> = rows
            .iter()
            .map(|row| FeedItem::from_row(row, false))
            .collect();
        self.fill_counts(&mut items).await?;
        let base = FeedPage {
            items,
            page,
            size,
            has_more,
        };
        self.write_caches(&key, &ids_key, &has_more_key, &base).await;
        self.local_public.put(&key, base.clone());
        self.hotkey.record(&key);
        counter_add!(self.instruments, "feed.reads.origin", 1, &[]);
        info!("feed.public source=db key={key} page={page} size={size} hasMore={has_more}");
        Ok(self.overlay(base, viewer).await)
    }

    /// Populate `like_count`/`favorite_count` on `items` with one batched read
    async fn fill_counts(&self, items: &mut [FeedItem]) -> Result<()> {
        let ids: Vec<String> = items.iter().map(|it| it.id.clone()).collect();
        let counts = self
            .counters
            .counts_batch("knowpost", &ids, &[Metric::Like, Metric::Fav])
            .await
            .context(CountsSnafu)?;
        for item in items.iter_mut() {
            let m = counts.get(&item.id);
            item.like_count = Some(
                m.and_then(|m| m.get(&Metric::Like).copied()).unwrap_or(0),
            );
            item.favorite_count =
                Some(m.and_then(|m| m.get(&Metric::Fav).copied()).unwrap_or(0));
        }
        Ok(())
    }

    /// Overlay the viewer's liked/faved flags; shared cache contents stay viewer-agnostic
    async fn overlay(&self, mut page: FeedPage, viewer: Option<UserId>) -> FeedPage {
        for item in page.items.iter_mut() {
            let (liked, faved) = match viewer {
                Some(uid) => (
                    self.counters
                        .is_liked("knowpost", &item.id, uid)
                        .await
                        .unwrap_or(false),
                    self.counters
                        .is_faved("knowpost", &item.id, uid)
                        .await
                        .unwrap_or(false),
                ),
                None => (false, false),
            };
            item.liked = Some(liked);
            item.faved = Some(faved);
        }
        page
    }

    /// A distributed-page hit counts only if it deserializes *and* every item carries counts;
    /// count-less pages are treated as misses & rebuilt
    async fn page_cache_hit(&self, key: &str) -> Result<Option<FeedPage>> {
        let cached = self.store.get_string(key).await.context(StoreSnafu)?;
        Ok(cached
            .and_then(|json| serde_json::from_str::<FeedPage>(&json).ok())
            .filter(|page| {
                page.items
                    .iter()
                    .all(|it| it.like_count.is_some() && it.favorite_count.is_some())
            }))
    }

    /// Assemble a page from the ids list + item + count fragments, filling gaps from the DB &
    /// the counter service. `None` when the ids list is gone (the fragment tree is cold).
    async fn assemble_from_fragments(
        &self,
        ids_key: &str,
        has_more_key: &str,
        page: u32,
        size: u32,
    ) -> Result<Option<FeedPage>> {
        let id_list = self
            .store
            .list_range(ids_key, 0, size as i64 - 1)
            .await
            .context(StoreSnafu)?;
        if id_list.is_empty() {
            return Ok(None);
        }
        let has_more_flag = self
            .store
            .get_string(has_more_key)
            .await
            .context(StoreSnafu)?;

        let item_keys: Vec<String> = id_list.iter().map(|id| item_key(id)).collect();
        let count_keys: Vec<String> = id_list.iter().map(|id| count_key(id)).collect();
        let item_jsons = self
            .store
            .multi_get_string(&item_keys)
            .await
            .context(StoreSnafu)?;
        let count_jsons = self
            .store
            .multi_get_string(&count_keys)
            .await
            .context(StoreSnafu)?;

        // Remaining fragment lifetime; gap repairs align to it so the tree expires as one
        let aligned_ttl = self.store.ttl(ids_key).await.context(StoreSnafu)?;

        let mut items: Vec<Option<FeedItem>> = Vec::with_capacity(id_list.len());
        for (id, json) in id_list.iter().zip(&item_jsons) {
            match json.as_deref() {
                Some(NULL_SENTINEL) => items.push(None),
                Some(json) => match serde_json::from_str::<FeedItem>(json) {
                    Ok(item) => items.push(Some(item)),
                    Err(_) => items.push(self.repair_item_fragment(id, aligned_ttl).await?),
                },
                None => items.push(self.repair_item_fragment(id, aligned_ttl).await?),
            }
        }

        let mut count_vals: Vec<Option<CountFragment>> = count_jsons
            .iter()
            .map(|json| {
                json.as_deref()
                    .and_then(|j| serde_json::from_str::<CountFragment>(j).ok())
            })
            .collect();
        let need_counts: Vec<String> = id_list
            .iter()
            .zip(&count_vals)
            .filter(|(_, v)| v.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        if !need_counts.is_empty() {
            let batch = self
                .counters
                .counts_batch("knowpost", &need_counts, &[Metric::Like, Metric::Fav])
                .await
                .context(CountsSnafu)?;
            for id in &need_counts {
                let m = batch.get(id);
                let fragment = CountFragment {
                    like: m.and_then(|m| m.get(&Metric::Like).copied()).unwrap_or(0),
                    fav: m.and_then(|m| m.get(&Metric::Fav).copied()).unwrap_or(0),
                };
                if let Ok(json) = serde_json::to_string(&fragment) {
                    let _ = self.store.set_string(&count_key(id), &json, aligned_ttl).await;
                }
                if let Some(pos) = id_list.iter().position(|i| i == id) {
                    count_vals[pos] = Some(fragment);
                }
            }
        }

        let mut assembled = Vec::with_capacity(id_list.len());
        for (item, counts) in items.into_iter().zip(count_vals) {
            let mut item = match item {
                Some(item) => item,
                None => continue, // tombstoned or unrecoverable
            };
            let counts = counts.unwrap_or_default();
            item.like_count = Some(counts.like);
            item.favorite_count = Some(counts.fav);
            assembled.push(item);
        }
        let has_more = match has_more_flag.as_deref() {
            Some(flag) => flag == "1",
            None => id_list.len() == size as usize,
        };
        Ok(Some(FeedPage {
            items: assembled,
            page,
            size,
            has_more,
        }))
    }

    /// Fill one missing item fragment from the DB; tombstone it when the row is gone
    async fn repair_item_fragment(
        &self,
        id: &str,
        aligned_ttl: Option<Duration>,
    ) -> Result<Option<FeedItem>> {
        let post_id = match id.parse() {
            Ok(id) => id,
            Err(_) => return Ok(None),
        };
        let detail = self.backend.find_detail(post_id).await.context(StorageSnafu)?;
        let detail = match detail {
            Some(d) if d.status != PostStatus::Deleted => d,
            _ => {
                let ttl = jitter(self.config.sentinel_ttl, self.config.sentinel_ttl_jitter);
                let _ = self
                    .store
                    .set_string(&item_key(id), NULL_SENTINEL, Some(ttl))
                    .await;
                return Ok(None);
            }
        };
        let item = FeedItem {
            id: id.to_owned(),
            title: detail.title,
            description: detail.description,
            cover_image: detail.img_urls.first().cloned(),
            tags: detail.tags,
            author_avatar: detail.author_avatar,
            author_nickname: detail.author_nickname,
            like_count: None,
            favorite_count: None,
            liked: None,
            faved: None,
            is_top: None,
        };
        if let Ok(json) = serde_json::to_string(&item) {
            let _ = self.store.set_string(&item_key(id), &json, aligned_ttl).await;
        }
        Ok(Some(item))
    }

    /// Rebuild every cache layer from a fresh origin page
    async fn write_caches(
        &self,
        page_key: &str,
        ids_key: &str,
        has_more_key: &str,
        base: &FeedPage,
    ) {
        let frag_ttl = jitter(self.config.fragment_ttl, self.config.fragment_ttl_jitter);
        let page_ttl = jitter(self.config.page_ttl, self.config.page_ttl_jitter);
        write_page_and_fragments(
            self.store.as_ref(),
            &self.config,
            page_key,
            ids_key,
            has_more_key,
            base,
            frag_ttl,
            Some(page_ttl),
        )
        .await;
    }

    /// Stretch a hot page's distributed TTL per the hot-key policy
    async fn maybe_extend_ttl(&self, key: &str, base: Duration) {
        let target = self.hotkey.ttl_for(base, key);
        if target <= base {
            return;
        }
        match self.store.ttl(key).await {
            Ok(Some(current)) if current < target => {
                let _ = self.store.expire(key, target).await;
            }
            _ => (),
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////
    // mine
    ////////////////////////////////////////////////////////////////////////////////////////

    /// The viewer's own published posts. No fragment tree here-- the key embeds the viewer, so
    /// the page (liked/faved included) can be cached whole.
    pub async fn mine(&self, viewer: UserId, page: u32, size: u32) -> Result<FeedPage> {
        let size = size.clamp(1, 50);
        let page = page.max(1);
        let key = mine_key(viewer, page, size);

        if let Some(local) = self.local_mine.get(&key) {
            self.hotkey.record(&key);
            self.maybe_extend_ttl(&key, self.config.mine_ttl).await;
            info!("feed.mine source=local key={key} page={page} size={size} user={viewer}");
            return Ok(local);
        }
        if let Some(cached) = self.page_cache_hit(&key).await? {
            self.local_mine.put(&key, cached.clone());
            self.hotkey.record(&key);
            self.maybe_extend_ttl(&key, self.config.mine_ttl).await;
            info!("feed.mine source=page key={key} page={page} size={size} user={viewer}");
            return Ok(self.overlay(cached, Some(viewer)).await);
        }

        let offset = ((page - 1) * size) as usize;
        let mut rows = self
            .backend
            .list_my_published(viewer, size as usize + 1, offset)
            .await
            .context(StorageSnafu)?;
        let has_more = rows.len() > size as usize;
        rows.truncate(size as usize);
        let mut items: Vec<FeedItem> = rows
            .iter()
            .map(|row| FeedItem::from_row(row, true))
            .collect();
        self.fill_counts(&mut items).await?;
        let page_data = FeedPage {
            items,
            page,
            size,
            has_more,
        };
        let enriched = self.overlay(page_data, Some(viewer)).await;
        match serde_json::to_string(&enriched) {
            Ok(json) => {
                let ttl = jitter(self.config.mine_ttl, self.config.mine_ttl_jitter);
                if let Err(err) = self.store.set_string(&key, &json, Some(ttl)).await {
                    warn!("failed to cache mine page {key}: {err}");
                }
            }
            Err(err) => warn!("failed to serialize mine page {key}: {err}"),
        }
        self.local_mine.put(&key, enriched.clone());
        self.hotkey.record(&key);
        info!("feed.mine source=db key={key} page={page} size={size} user={viewer} hasMore={has_more}");
        Ok(enriched)
    }

    ////////////////////////////////////////////////////////////////////////////////////////
    // purges (the write side's cache half)
    ////////////////////////////////////////////////////////////////////////////////////////

    /// Drop every public feed cache: pages, fragments, indexes, & the local tier
    pub async fn purge_public(&self) {
        self.local_public.clear();
        match self.store.keys("feed:public:*").await {
            Ok(keys) => {
                for key in keys {
                    if let Err(err) = self.store.delete(&key).await {
                        warn!("failed to purge {key}: {err}");
                    }
                }
            }
            Err(err) => warn!("failed to enumerate public feed keys: {err}"),
        }
    }

    /// Drop one author's "mine" caches
    pub async fn purge_mine(&self, uid: UserId) {
        self.local_mine.clear();
        match self.store.keys(&format!("feed:mine:{}:*", uid)).await {
            Ok(keys) => {
                for key in keys {
                    if let Err(err) = self.store.delete(&key).await {
                        warn!("failed to purge {key}: {err}");
                    }
                }
            }
            Err(err) => warn!("failed to enumerate mine feed keys for {uid}: {err}"),
        }
    }

    /// The second half of a double delete: wait out in-flight readers, then purge again
    pub async fn double_purge_public(&self) {
        self.purge_public().await;
        tokio::time::sleep(self.config.double_delete_delay.max(Duration::from_millis(50))).await;
        self.purge_public().await;
    }

    pub async fn double_purge_mine(&self, uid: UserId) {
        self.purge_mine(uid).await;
        tokio::time::sleep(self.config.double_delete_delay.max(Duration::from_millis(50))).await;
        self.purge_mine(uid).await;
    }
}

/// Write the whole-page JSON (when `page_ttl` is given) plus the fragment tree & reverse indexes
#[allow(clippy::too_many_arguments)]
async fn write_page_and_fragments(
    store: &dyn Store,
    config: &Config,
    page_key: &str,
    ids_key: &str,
    has_more_key: &str,
    base: &FeedPage,
    frag_ttl: Duration,
    page_ttl: Option<Duration>,
) {
    if let Some(page_ttl) = page_ttl {
        match serde_json::to_string(base) {
            Ok(json) => {
                if let Err(err) = store.set_string(page_key, &json, Some(page_ttl)).await {
                    warn!("failed to write page cache {page_key}: {err}");
                }
            }
            Err(err) => warn!("failed to serialize page {page_key}: {err}"),
        }
    }
    let ids: Vec<String> = base.items.iter().map(|it| it.id.clone()).collect();
    if !ids.is_empty() {
        // LPUSH reverses its input; feed order in, feed order out
        let reversed: Vec<String> = ids.iter().rev().cloned().collect();
        let _ = store.delete(ids_key).await;
        if let Err(err) = store.list_push_front(ids_key, &reversed).await {
            warn!("failed to write ids list {ids_key}: {err}");
        }
        let _ = store.expire(ids_key, frag_ttl).await;
        // hasMore is a soft hint: cache "1" a bit longer only for genuinely full pages
        let (flag, ttl) = if ids.len() == base.size as usize && base.has_more {
            (
                "1",
                jitter(config.has_more_ttl, config.has_more_ttl_jitter),
            )
        } else {
            (
                if base.has_more { "1" } else { "0" },
                config.has_more_ttl,
            )
        };
        let _ = store.set_string(has_more_key, flag, Some(ttl)).await;
    }
    let _ = store.set_add(pages_index_key(), page_key).await;
    let hour = hour_slot();
    for item in &base.items {
        let idx_key = index_key(&item.id, hour);
        let _ = store.set_add(&idx_key, page_key).await;
        let _ = store.expire(&idx_key, frag_ttl).await;
        if let Ok(json) = serde_json::to_string(item) {
            let _ = store
                .set_string(&item_key(&item.id), &json, Some(frag_ttl))
                .await;
        }
        let fragment = CountFragment {
            like: item.like_count.unwrap_or(0),
            fav: item.favorite_count.unwrap_or(0),
        };
        if let Ok(json) = serde_json::to_string(&fragment) {
            let _ = store
                .set_string(&count_key(&item.id), &json, Some(frag_ttl))
                .await;
        }
    }
}

/// Heal the fragment tree from a page-cache hit, off the request path
fn spawn_fragment_repair(
    store: Arc<dyn Store>,
    config: Config,
    base: FeedPage,
    page_key: String,
    ids_key: String,
    has_more_key: String,
) {
    tokio::spawn(async move {
        let frag_ttl = jitter(config.fragment_ttl, config.fragment_ttl_jitter);
        write_page_and_fragments(
            store.as_ref(),
            &config,
            &page_key,
            &ids_key,
            &has_more_key,
            &base,
            frag_ttl,
            None,
        )
        .await;
        debug!("feed.public fragments repaired idsKey={ids_key}");
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use knowfeed_store::memory::MemoryStore;

    use crate::{
        bus::MemoryBus,
        counter_events::CounterEventProducer,
        entities::{KnowPost, UserRow, Visibility},
        hotkey,
        memory::MemoryBackend,
    };

    async fn seed_posts(backend: &MemoryBackend, n: i64) {
        backend.put_user(UserRow {
            id: UserId::new(7),
            nickname: Some("author".to_owned()),
            avatar: Some("a.png".to_owned()),
            bio: None,
        });
        for i in 1..=n {
            let now = Utc::now();
            backend
                .insert_draft(KnowPost {
                    id: crate::entities::PostId::new(i),
                    creator_id: UserId::new(7),
                    status: PostStatus::Draft,
                    visible: Visibility::Public,
                    is_top: false,
                    title: Some(format!("post-{i}")),
                    description: None,
                    tags: vec!["t".to_owned()],
                    img_urls: vec![],
                    content_url: None,
                    create_time: now,
                    update_time: now,
                    publish_time: None,
                })
                .await
                .unwrap();
            backend
                .publish(crate::entities::PostId::new(i), UserId::new(7))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
    }

    fn service(store: Arc<dyn Store>, backend: MemoryBackend) -> FeedService {
        let counters = Arc::new(CounterService::new(
            store.clone(),
            CounterEventProducer::new(Arc::new(MemoryBus::new())),
            counters::Config::default(),
            Arc::new(Instruments::new("knowfeed")),
        ));
        FeedService::new(
            store,
            Arc::new(backend),
            counters,
            Arc::new(HotKeyDetector::new(hotkey::Config::default())),
            Config::default(),
            Arc::new(Instruments::new("knowfeed")),
        )
    }

    #[tokio::test]
    async fn origin_load_fills_every_tier() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let backend = MemoryBackend::new();
        seed_posts(&backend, 3).await;
        let svc = service(store.clone(), backend);

        let page = svc.public_feed(1, 2, None).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.has_more);
        // Newest first
        assert_eq!(page.items[0].id, "3");
        assert_eq!(page.items[1].id, "2");
        // Counts filled, flags overlaid for the anonymous viewer
        assert_eq!(page.items[0].like_count, Some(0));
        assert_eq!(page.items[0].liked, Some(false));

        // Distributed layers exist now
        let hour = hour_slot();
        assert!(store
            .get_string(&page_key(1, 2))
            .await
            .unwrap()
            .is_some());
        assert_eq!(
            store
                .list_range(&ids_key(2, hour, 1), 0, -1)
                .await
                .unwrap(),
            vec!["3", "2"]
        );
        assert!(store
            .get_string(&item_key("3"))
            .await
            .unwrap()
            .is_some());
        assert!(store
            .get_string(&count_key("3"))
            .await
            .unwrap()
            .is_some());
        assert!(store
            .set_members(&index_key("3", hour))
            .await
            .unwrap()
            .contains(&page_key(1, 2)));
        // The cached page JSON holds no viewer flags
        let cached: FeedPage =
            serde_json::from_str(&store.get_string(&page_key(1, 2)).await.unwrap().unwrap())
                .unwrap();
        assert_eq!(cached.items[0].liked, None);
    }

    #[tokio::test]
    async fn fragment_assembly_survives_page_cache_loss() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let backend = MemoryBackend::new();
        seed_posts(&backend, 2).await;
        let svc = service(store.clone(), backend);

        svc.public_feed(1, 2, None).await.unwrap();
        // Kill the local & page tiers; the fragment tree alone must serve the next read
        svc.local_public.clear();
        store.delete(&page_key(1, 2)).await.unwrap();
        let page = svc.public_feed(1, 2, None).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].id, "2");
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn single_flight_collapses_origin_loads() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let backend = MemoryBackend::new();
        seed_posts(&backend, 3).await;
        let svc = Arc::new(service(store.clone(), backend));

        let mut handles = vec![];
        for _ in 0..20 {
            let svc = svc.clone();
            handles.push(tokio::spawn(
                async move { svc.public_feed(1, 2, None).await },
            ));
        }
        let mut pages = vec![];
        for h in handles {
            pages.push(h.await.unwrap().unwrap());
        }
        // Everyone sees the same ordering & pagination
        for page in &pages {
            let ids: Vec<&str> = page.items.iter().map(|it| it.id.as_str()).collect();
            assert_eq!(ids, vec!["3", "2"]);
            assert!(page.has_more);
        }
    }

    #[tokio::test]
    async fn deleted_rows_get_tombstoned_during_assembly() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let backend = MemoryBackend::new();
        seed_posts(&backend, 2).await;
        let svc = service(store.clone(), backend.clone());

        svc.public_feed(1, 2, None).await.unwrap();
        // Lose one item fragment & delete its row; assembly must tombstone, not die
        store.delete(&item_key("2")).await.unwrap();
        backend
            .soft_delete(crate::entities::PostId::new(2), UserId::new(7))
            .await
            .unwrap();
        svc.local_public.clear();
        store.delete(&page_key(1, 2)).await.unwrap();

        let page = svc.public_feed(1, 2, None).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, "1");
        assert_eq!(
            store.get_string(&item_key("2")).await.unwrap().as_deref(),
            Some(NULL_SENTINEL)
        );
    }

    #[tokio::test]
    async fn mine_caches_viewer_flags_in_place() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let backend = MemoryBackend::new();
        seed_posts(&backend, 2).await;
        let svc = service(store.clone(), backend);
        svc.counters
            .like("knowpost", "1", UserId::new(7))
            .await
            .unwrap();

        let mine = svc.mine(UserId::new(7), 1, 10).await.unwrap();
        assert_eq!(mine.items.len(), 2);
        // is_top rides along on the mine feed
        assert_eq!(mine.items[0].is_top, Some(false));
        let one = mine.items.iter().find(|it| it.id == "1").unwrap();
        assert_eq!(one.liked, Some(true));
        // And the *cached* mine page holds those flags, because the key embeds the viewer
        let cached: FeedPage = serde_json::from_str(
            &store
                .get_string(&mine_key(UserId::new(7), 1, 10))
                .await
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(
            cached.items.iter().find(|it| it.id == "1").unwrap().liked,
            Some(true)
        );
    }

    #[tokio::test]
    async fn purge_drops_all_public_keys() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let backend = MemoryBackend::new();
        seed_posts(&backend, 2).await;
        let svc = service(store.clone(), backend);
        svc.public_feed(1, 2, None).await.unwrap();
        assert!(!store.keys("feed:public:*").await.unwrap().is_empty());
        svc.purge_public().await;
        assert!(store.keys("feed:public:*").await.unwrap().is_empty());
        // Item & count fragments survive a page purge (they're patched, not invalidated)
        assert!(store.get_string(&item_key("1")).await.unwrap().is_some());
    }
}
