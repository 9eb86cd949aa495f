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

//! # posts
//!
//! The post lifecycle (draft, content confirm, metadata, publish, pin, visibility, soft delete)
//! and the detail read.
//!
//! Every mutation brackets its DB write with the double-delete dance: purge the feed & detail
//! caches, commit, then purge again after a short delay to catch readers who loaded the old row
//! just before the commit & would otherwise write it back. The delay only has to exceed the
//! worst-case read-to-write window of a cache fill.
//!
//! Detail reads cache the serialized view under a versioned key with a "NULL" tombstone for
//! absent/deleted posts, overlay the freshest counts from the `feed:count` fragment, & stretch
//! their TTL when the hot-key detector says the post is popular.

use std::{sync::Arc, time::Duration};

use rand::Rng;
use snafu::prelude::*;
use tracing::{info, warn};

use knowfeed_store::Store;

use crate::{
    counters::{self, CounterService},
    entities::{self, KnowPost, Metric, PostDetail, PostId, PostStatus, UserId, Visibility},
    feed::{count_key, CountFragment, FeedService, NULL_SENTINEL},
    hotkey::HotKeyDetector,
    ids::{self, SnowflakeIds},
    singleflight::SingleFlight,
    storage::{self, Backend},
    user_counters::UserCounterService,
};

pub const DETAIL_LAYOUT_VER: u32 = 1;

pub fn detail_key(id: PostId) -> String {
    format!("knowpost:detail:{}:v{}", id, DETAIL_LAYOUT_VER)
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Post {id} does not exist"))]
    NotFound { id: PostId },
    #[snafu(display("Post {id} is not visible to this viewer"))]
    Forbidden { id: PostId },
    #[snafu(display("Draft {id} does not exist or is not yours"))]
    NotOwned { id: PostId },
    #[snafu(display("{source}"))]
    Validation { source: entities::Error },
    #[snafu(display("Store operation failed: {source}"))]
    Store { source: knowfeed_store::Error },
    #[snafu(display("Storage operation failed: {source}"))]
    Storage { source: storage::Error },
    #[snafu(display("Failed to read entity counts: {source}"))]
    Counts { source: counters::Error },
    #[snafu(display("Failed to serialize a detail view: {source}"))]
    Ser {
        source: serde_json::Error,
        backtrace: snafu::Backtrace,
    },
    #[snafu(display("Failed to generate a post id: {source}"))]
    Ids { source: ids::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          PostService                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, serde::Deserialize)]
pub struct Config {
    #[serde(rename = "detail-ttl")]
    pub detail_ttl: Duration,
    #[serde(rename = "detail-ttl-jitter")]
    pub detail_ttl_jitter: Duration,
    #[serde(rename = "sentinel-ttl")]
    pub sentinel_ttl: Duration,
    #[serde(rename = "sentinel-ttl-jitter")]
    pub sentinel_ttl_jitter: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            detail_ttl: Duration::from_secs(60),
            detail_ttl_jitter: Duration::from_secs(30),
            sentinel_ttl: Duration::from_secs(30),
            sentinel_ttl_jitter: Duration::from_secs(30),
        }
    }
}

pub struct PostService {
    store: Arc<dyn Store>,
    backend: Arc<dyn Backend>,
    counters: Arc<CounterService>,
    user_counters: Arc<UserCounterService>,
    feed: Arc<FeedService>,
    hotkey: Arc<HotKeyDetector>,
    ids: Arc<SnowflakeIds>,
    flights: SingleFlight,
    config: Config,
}

impl PostService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        backend: Arc<dyn Backend>,
        counters: Arc<CounterService>,
        user_counters: Arc<UserCounterService>,
        feed: Arc<FeedService>,
        hotkey: Arc<HotKeyDetector>,
        ids: Arc<SnowflakeIds>,
        config: Config,
    ) -> PostService {
        PostService {
            store,
            backend,
            counters,
            user_counters,
            feed,
            hotkey,
            ids,
            flights: SingleFlight::new(),
            config,
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////
    // mutations
    ////////////////////////////////////////////////////////////////////////////////////////

    pub async fn create_draft(&self, creator: UserId) -> Result<PostId> {
        let id = PostId::new(self.ids.next_id().context(IdsSnafu)?);
        let now = chrono::Utc::now();
        self.backend
            .insert_draft(KnowPost {
                id,
                creator_id: creator,
                status: PostStatus::Draft,
                visible: Visibility::Public,
                is_top: false,
                title: None,
                description: None,
                tags: vec![],
                img_urls: vec![],
                content_url: None,
                create_time: now,
                update_time: now,
                publish_time: None,
            })
            .await
            .context(StorageSnafu)?;
        Ok(id)
    }

    /// Purge every cache a mutation of (`creator`, `id`) can have populated
    async fn purge_before(&self, creator: UserId, id: PostId) {
        self.feed.purge_public().await;
        self.feed.purge_mine(creator).await;
        if let Err(err) = self.store.delete(&detail_key(id)).await {
            warn!("failed to drop detail cache for {id}: {err}");
        }
    }

    /// ... and again after the commit, delayed, against readers mid-fill
    async fn purge_after(&self, creator: UserId, id: PostId) {
        self.feed.double_purge_public().await;
        self.feed.double_purge_mine(creator).await;
        if let Err(err) = self.store.delete(&detail_key(id)).await {
            warn!("failed to drop detail cache for {id}: {err}");
        }
    }

    pub async fn confirm_content(
        &self,
        creator: UserId,
        id: PostId,
        content_url: &str,
    ) -> Result<()> {
        self.purge_before(creator, id).await;
        let updated = self
            .backend
            .update_content(id, creator, content_url)
            .await
            .context(StorageSnafu)?;
        ensure!(updated, NotOwnedSnafu { id });
        self.purge_after(creator, id).await;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn update_metadata(
        &self,
        creator: UserId,
        id: PostId,
        title: Option<String>,
        description: Option<String>,
        tags: Vec<String>,
        img_urls: Vec<String>,
        visible: &str,
        is_top: bool,
    ) -> Result<()> {
        let visible: Visibility = visible.parse().context(ValidationSnafu)?;
        self.purge_before(creator, id).await;
        let updated = self
            .backend
            .update_metadata(id, creator, title, description, tags, img_urls, visible, is_top)
            .await
            .context(StorageSnafu)?;
        ensure!(updated, NotOwnedSnafu { id });
        self.purge_after(creator, id).await;
        Ok(())
    }

    pub async fn publish(&self, creator: UserId, id: PostId) -> Result<()> {
        self.purge_before(creator, id).await;
        let updated = self
            .backend
            .publish(id, creator)
            .await
            .context(StorageSnafu)?;
        ensure!(updated, NotOwnedSnafu { id });
        if let Err(err) = self.user_counters.increment_posts(creator, 1).await {
            warn!("failed to bump post count for {creator}: {err}");
        }
        self.purge_after(creator, id).await;
        info!("post {id} published by {creator}");
        Ok(())
    }

    pub async fn update_top(&self, creator: UserId, id: PostId, is_top: bool) -> Result<()> {
        self.purge_before(creator, id).await;
        let updated = self
            .backend
            .update_top(id, creator, is_top)
            .await
            .context(StorageSnafu)?;
        ensure!(updated, NotOwnedSnafu { id });
        self.purge_after(creator, id).await;
        Ok(())
    }

    pub async fn update_visibility(
        &self,
        creator: UserId,
        id: PostId,
        visible: &str,
    ) -> Result<()> {
        let visible: Visibility = visible.parse().context(ValidationSnafu)?;
        self.purge_before(creator, id).await;
        let updated = self
            .backend
            .update_visibility(id, creator, visible)
            .await
            .context(StorageSnafu)?;
        ensure!(updated, NotOwnedSnafu { id });
        self.purge_after(creator, id).await;
        Ok(())
    }

    pub async fn delete(&self, creator: UserId, id: PostId) -> Result<()> {
        self.purge_before(creator, id).await;
        let updated = self
            .backend
            .soft_delete(id, creator)
            .await
            .context(StorageSnafu)?;
        ensure!(updated, NotOwnedSnafu { id });
        self.purge_after(creator, id).await;
        info!("post {id} deleted by {creator}");
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////////////////////
    // detail read
    ////////////////////////////////////////////////////////////////////////////////////////

    pub async fn detail(&self, id: PostId, viewer: Option<UserId>) -> Result<PostDetail> {
        let key = detail_key(id);
        match self.store.get_string(&key).await.context(StoreSnafu)? {
            Some(cached) if cached == NULL_SENTINEL => return NotFoundSnafu { id }.fail(),
            Some(cached) => {
                if let Ok(base) = serde_json::from_str::<PostDetail>(&cached) {
                    self.hotkey.record(&key);
                    self.maybe_extend_ttl(&key).await;
                    info!("detail source=page key={key}");
                    return Ok(self.finish(base, id, viewer).await);
                }
                // Undecodable cache: fall through & rebuild it
            }
            None => (),
        }

        let _flight = self.flights.acquire(&key).await;
        // Re-check inside the flight; the previous holder probably filled it
        match self.store.get_string(&key).await.context(StoreSnafu)? {
            Some(cached) if cached == NULL_SENTINEL => return NotFoundSnafu { id }.fail(),
            Some(cached) => {
                if let Ok(base) = serde_json::from_str::<PostDetail>(&cached) {
                    self.hotkey.record(&key);
                    self.maybe_extend_ttl(&key).await;
                    info!("detail source=page(after-flight) key={key}");
                    return Ok(self.finish(base, id, viewer).await);
                }
            }
            None => (),
        }

        let row = self.backend.find_detail(id).await.context(StorageSnafu)?;
        let row = match row {
            Some(row) if row.status != PostStatus::Deleted => row,
            _ => {
                let ttl = self.config.sentinel_ttl
                    + Duration::from_millis(
                        rand::thread_rng()
                            .gen_range(0..=self.config.sentinel_ttl_jitter.as_millis() as u64),
                    );
                let _ = self.store.set_string(&key, NULL_SENTINEL, Some(ttl)).await;
                return NotFoundSnafu { id }.fail();
            }
        };
        let is_public = row.status == PostStatus::Published && row.visible == Visibility::Public;
        let is_owner = viewer.map(|v| v == row.creator_id).unwrap_or(false);
        // No tombstone here: the post exists, this viewer just can't see it
        ensure!(is_public || is_owner, ForbiddenSnafu { id });

        let counts = self
            .counters
            .counts("knowpost", &id.to_string(), &[Metric::Like, Metric::Fav])
            .await
            .context(CountsSnafu)?;
        let base = PostDetail {
            id: row.id.to_string(),
            title: row.title,
            description: row.description,
            content_url: row.content_url,
            images: row.img_urls,
            tags: row.tags,
            author_id: row.creator_id.to_string(),
            author_avatar: row.author_avatar,
            author_nickname: row.author_nickname,
            like_count: counts.get(&Metric::Like).copied(),
            favorite_count: counts.get(&Metric::Fav).copied(),
            liked: None,
            faved: None,
            is_top: row.is_top,
            visible: row.visible,
            publish_time: row.publish_time,
        };
        // Only public details are cached: the shared cache must never answer for content that
        // still needs a per-viewer permission check
        if is_public {
            let json = serde_json::to_string(&base).context(SerSnafu)?;
            let jittered = self.config.detail_ttl
                + Duration::from_millis(
                    rand::thread_rng()
                        .gen_range(0..=self.config.detail_ttl_jitter.as_millis() as u64),
                );
            // Hot posts earn a longer TTL up front
            let ttl = self.hotkey.ttl_for(self.config.detail_ttl, &key).max(jittered);
            self.store
                .set_string(&key, &json, Some(ttl))
                .await
                .context(StoreSnafu)?;
        }
        info!("detail source=db key={key}");
        Ok(self.finish(base, id, viewer).await)
    }

    /// Overlay the freshest counts (the `feed:count` fragment outlives the detail snapshot) &
    /// the viewer's flags
    async fn finish(&self, mut base: PostDetail, id: PostId, viewer: Option<UserId>) -> PostDetail {
        if let Ok(Some(json)) = self.store.get_string(&count_key(&id.to_string())).await {
            if let Ok(fragment) = serde_json::from_str::<CountFragment>(&json) {
                base.like_count = Some(fragment.like);
                base.favorite_count = Some(fragment.fav);
            }
        }
        let (liked, faved) = match viewer {
            Some(uid) => (
                self.counters
                    .is_liked("knowpost", &base.id, uid)
                    .await
                    .unwrap_or(false),
                self.counters
                    .is_faved("knowpost", &base.id, uid)
                    .await
                    .unwrap_or(false),
            ),
            None => (false, false),
        };
        base.liked = Some(liked);
        base.faved = Some(faved);
        base
    }

    async fn maybe_extend_ttl(&self, key: &str) {
        let target = self.hotkey.ttl_for(self.config.detail_ttl, key);
        match self.store.ttl(key).await {
            Ok(Some(current)) if current < target => {
                let _ = self.store.expire(key, target).await;
            }
            _ => (),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use knowfeed_store::memory::MemoryStore;

    use crate::{
        bus::MemoryBus,
        counter_events::CounterEventProducer,
        entities::UserRow,
        feed, hotkey,
        memory::MemoryBackend,
        metrics::Instruments,
        user_counters,
    };

    fn services() -> (Arc<dyn Store>, MemoryBackend, PostService) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let backend = MemoryBackend::new();
        backend.put_user(UserRow {
            id: UserId::new(7),
            nickname: Some("author".to_owned()),
            avatar: None,
            bio: None,
        });
        let counters = Arc::new(CounterService::new(
            store.clone(),
            CounterEventProducer::new(Arc::new(MemoryBus::new())),
            counters::Config::default(),
            Arc::new(Instruments::new("knowfeed")),
        ));
        let user_counters = Arc::new(UserCounterService::new(
            store.clone(),
            Arc::new(backend.clone()),
            counters.clone(),
            user_counters::Config::default(),
        ));
        let hotkey = Arc::new(HotKeyDetector::new(hotkey::Config::default()));
        let feed_svc = Arc::new(FeedService::new(
            store.clone(),
            Arc::new(backend.clone()),
            counters.clone(),
            hotkey.clone(),
            feed::Config {
                double_delete_delay: Duration::from_millis(60),
                ..Default::default()
            },
            Arc::new(Instruments::new("knowfeed")),
        ));
        let posts = PostService::new(
            store.clone(),
            Arc::new(backend.clone()),
            counters,
            user_counters,
            feed_svc,
            hotkey,
            Arc::new(SnowflakeIds::default()),
            Config::default(),
        );
        (store, backend, posts)
    }

    #[tokio::test]
    async fn lifecycle_draft_publish_delete() {
        let (store, backend, posts) = services();
        let creator = UserId::new(7);
        let id = posts.create_draft(creator).await.unwrap();
        posts
            .update_metadata(
                creator,
                id,
                Some("title".to_owned()),
                None,
                vec!["tag".to_owned()],
                vec!["img.png".to_owned()],
                "public",
                false,
            )
            .await
            .unwrap();
        posts.publish(creator, id).await.unwrap();
        assert_eq!(backend.list_feed_public(10, 0).await.unwrap().len(), 1);
        // Publishing bumped the author's post count
        let raw = store
            .get_raw(&crate::packed::user_counter_key(creator))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            crate::packed::read_segment(&raw, crate::packed::UserSegment::Posts.idx()),
            Some(1)
        );
        posts.delete(creator, id).await.unwrap();
        assert!(backend.list_feed_public(10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mutations_require_ownership() {
        let (_store, _backend, posts) = services();
        let id = posts.create_draft(UserId::new(7)).await.unwrap();
        assert!(matches!(
            posts.publish(UserId::new(8), id).await,
            Err(Error::NotOwned { .. })
        ));
        assert!(matches!(
            posts
                .update_visibility(UserId::new(7), id, "everyone")
                .await,
            Err(Error::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn detail_caches_and_tombstones() {
        let (store, _backend, posts) = services();
        let creator = UserId::new(7);
        let id = posts.create_draft(creator).await.unwrap();
        posts
            .update_metadata(
                creator,
                id,
                Some("title".to_owned()),
                Some("desc".to_owned()),
                vec![],
                vec![],
                "public",
                false,
            )
            .await
            .unwrap();
        posts.publish(creator, id).await.unwrap();

        let detail = posts.detail(id, Some(creator)).await.unwrap();
        assert_eq!(detail.title.as_deref(), Some("title"));
        assert_eq!(detail.like_count, Some(0));
        assert_eq!(detail.liked, Some(false));
        // Cached now; the cached JSON holds no viewer flags
        let cached: PostDetail =
            serde_json::from_str(&store.get_string(&detail_key(id)).await.unwrap().unwrap())
                .unwrap();
        assert_eq!(cached.liked, None);

        // Absent posts tombstone
        let missing = PostId::new(424242);
        assert!(matches!(
            posts.detail(missing, None).await,
            Err(Error::NotFound { .. })
        ));
        assert_eq!(
            store
                .get_string(&detail_key(missing))
                .await
                .unwrap()
                .as_deref(),
            Some(NULL_SENTINEL)
        );
        // And the tombstone answers the next read without a DB trip
        assert!(matches!(
            posts.detail(missing, None).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn drafts_are_owner_only() {
        let (_store, _backend, posts) = services();
        let creator = UserId::new(7);
        let id = posts.create_draft(creator).await.unwrap();
        assert!(matches!(
            posts.detail(id, Some(UserId::new(8))).await,
            Err(Error::Forbidden { .. })
        ));
        assert!(posts.detail(id, Some(creator)).await.is_ok());
        // Forbidden must NOT have installed a tombstone
        assert!(matches!(
            posts.detail(id, Some(UserId::new(8))).await,
            Err(Error::Forbidden { .. })
        ));
    }

    #[tokio::test]
    async fn mutation_purges_feed_and_detail_caches() {
        let (store, backend, posts) = services();
        let creator = UserId::new(7);
        let id = posts.create_draft(creator).await.unwrap();
        posts
            .update_metadata(creator, id, Some("t".to_owned()), None, vec![], vec![], "public", false)
            .await
            .unwrap();
        posts.publish(creator, id).await.unwrap();
        // Warm the caches
        posts.feed.public_feed(1, 10, None).await.unwrap();
        posts.detail(id, None).await.unwrap();
        assert!(!store.keys("feed:public:*").await.unwrap().is_empty());
        // A metadata change purges pages & detail
        posts
            .update_metadata(creator, id, Some("t2".to_owned()), None, vec![], vec![], "public", true)
            .await
            .unwrap();
        assert!(store.keys("feed:public:*").await.unwrap().is_empty());
        assert!(store.get_string(&detail_key(id)).await.unwrap().is_none());
        // The next read sees the new title
        let detail = posts.detail(id, None).await.unwrap();
        assert_eq!(detail.title.as_deref(), Some("t2"));
        assert!(backend.find_post(id).await.unwrap().unwrap().is_top);
    }

    #[tokio::test]
    async fn drafts_never_reach_the_public_feed() {
        let (_store, backend, posts) = services();
        let id = posts.create_draft(UserId::new(7)).await.unwrap();
        posts
            .update_metadata(UserId::new(7), id, Some("x".to_owned()), None, vec![], vec![], "public", false)
            .await
            .unwrap();
        assert!(backend.list_feed_public(10, 0).await.unwrap().is_empty());
    }
}
