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

//! # relation
//!
//! The follow graph's write & read paths.
//!
//! Writes are cheap on purpose: a scripted token bucket admits the call, then one transaction
//! writes the relation row *and* its outbox row-- nothing else. Everything downstream (the mirror
//! table, the sorted-set caches, the user counters) is driven asynchronously by the outbox
//! consumer, so a follow can't fan out into five synchronous writes on the request path.
//!
//! Reads serve from the `uf:flws:`/`uf:fans:` sorted sets (score = created-at millis, newest
//! first), backfilling from the DB on miss with a short TTL. Users over the big-V follower
//! threshold additionally get a per-process top-N cache so their perpetually-hot first pages
//! don't thrash the backfill. Both offset & score-cursor pagination are supported; cursors are
//! millisecond scores, so a page ends with a natural "everything at or below this" bookmark.

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::sync::Arc;
use tap::Pipe;
use tracing::{debug, info};

use knowfeed_store::Store;

use crate::{
    entities::{OutboxRow, Profile, UserId},
    ids::{self, SnowflakeIds},
    packed::UserSegment,
    relation_events::{followers_key, followings_key, RelationEvent, RelationEventKind, ZSET_TTL},
    storage::{self, Backend},
    user_counters::{self, UserCounterService},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Store operation failed: {source}"))]
    Store { source: knowfeed_store::Error },
    #[snafu(display("Storage operation failed: {source}"))]
    Storage { source: storage::Error },
    #[snafu(display("Failed to generate a row id: {source}"))]
    Ids { source: ids::Error },
    #[snafu(display("Failed to serialize a relation event: {source}"))]
    Ser {
        source: serde_json::Error,
        backtrace: snafu::Backtrace,
    },
    #[snafu(display("Failed to read a user counter: {source}"))]
    Counter { source: user_counters::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Follow-admission token bucket: burst capacity
    #[serde(rename = "bucket-capacity")]
    pub bucket_capacity: u64,
    /// ... and steady-state refill, tokens per second
    #[serde(rename = "bucket-refill-per-sec")]
    pub bucket_refill_per_sec: u64,
    /// Idle buckets lapse after this long
    #[serde(rename = "bucket-ttl")]
    pub bucket_ttl: Duration,
    /// Followers at or above this make a user "big-V"
    #[serde(rename = "bigv-threshold")]
    pub bigv_threshold: u64,
    /// How many leading entries the big-V top cache holds per user
    #[serde(rename = "top-depth")]
    pub top_depth: usize,
    #[serde(rename = "top-cache-size")]
    pub top_cache_size: usize,
    #[serde(rename = "top-cache-ttl")]
    pub top_cache_ttl: Duration,
    /// Hard cap on rows fetched per backfill
    #[serde(rename = "backfill-cap")]
    pub backfill_cap: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket_capacity: 100,
            bucket_refill_per_sec: 1,
            bucket_ttl: Duration::from_secs(60),
            bigv_threshold: 500_000,
            top_depth: 500,
            top_cache_size: 1_000,
            top_cache_ttl: Duration::from_secs(600),
            backfill_cap: 1_000,
        }
    }
}

/// Three-state answer to "how do these two users relate?"
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationStatus {
    pub following: bool,
    pub followed_by: bool,
    pub mutual: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Side {
    Followings,
    Followers,
}

impl Side {
    fn key(&self, uid: UserId) -> String {
        match self {
            Side::Followings => followings_key(uid),
            Side::Followers => followers_key(uid),
        }
    }
}

fn follow_bucket_key(uid: UserId) -> String {
    format!("rl:follow:{}", uid)
}

fn parse_ids(members: Vec<String>) -> Vec<UserId> {
    members.iter().filter_map(|m| m.parse().ok()).collect()
}

type TopCache = Mutex<LruCache<i64, (Instant, Vec<UserId>)>>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        RelationService                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct RelationService {
    store: Arc<dyn Store>,
    backend: Arc<dyn Backend>,
    user_counters: Arc<UserCounterService>,
    ids: Arc<SnowflakeIds>,
    flws_top: TopCache,
    fans_top: TopCache,
    config: Config,
}

impl RelationService {
    pub fn new(
        store: Arc<dyn Store>,
        backend: Arc<dyn Backend>,
        user_counters: Arc<UserCounterService>,
        ids: Arc<SnowflakeIds>,
        config: Config,
    ) -> RelationService {
        let cap = NonZeroUsize::new(config.top_cache_size.max(1)).unwrap(/* known good */);
        RelationService {
            store,
            backend,
            user_counters,
            ids,
            flws_top: Mutex::new(LruCache::new(cap)),
            fans_top: Mutex::new(LruCache::new(cap)),
            config,
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////
    // write path
    ////////////////////////////////////////////////////////////////////////////////////////

    /// Follow `to`. False means refused (rate limit) or already following; the caller can't tell
    /// the difference & shouldn't need to.
    pub async fn follow(&self, from: UserId, to: UserId) -> Result<bool> {
        let admitted = self
            .store
            .token_bucket(
                &follow_bucket_key(from),
                self.config.bucket_capacity,
                self.config.bucket_refill_per_sec,
                self.config.bucket_ttl,
            )
            .await
            .context(StoreSnafu)?;
        if !admitted {
            info!("follow by {from} refused by the token bucket");
            return Ok(false);
        }
        let row_id = self.ids.next_id().context(IdsSnafu)?;
        let event = RelationEvent {
            kind: RelationEventKind::FollowCreated,
            from_user_id: from,
            to_user_id: to,
            id: Some(row_id),
        };
        let outbox = OutboxRow {
            id: self.ids.next_id().context(IdsSnafu)?,
            aggregate_type: "following".to_owned(),
            aggregate_id: Some(row_id),
            event_type: "FollowCreated".to_owned(),
            payload: serde_json::to_string(&event).context(SerSnafu)?,
            created_at: Utc::now(),
        };
        // Row + outbox land in one transaction; the consumer owns every other side effect
        self.backend
            .insert_following_with_outbox(row_id, from, to, outbox)
            .await
            .context(StorageSnafu)
    }

    pub async fn unfollow(&self, from: UserId, to: UserId) -> Result<bool> {
        let event = RelationEvent {
            kind: RelationEventKind::FollowCanceled,
            from_user_id: from,
            to_user_id: to,
            id: None,
        };
        let outbox = OutboxRow {
            id: self.ids.next_id().context(IdsSnafu)?,
            aggregate_type: "following".to_owned(),
            aggregate_id: None,
            event_type: "FollowCanceled".to_owned(),
            payload: serde_json::to_string(&event).context(SerSnafu)?,
            created_at: Utc::now(),
        };
        self.backend
            .cancel_following_with_outbox(from, to, outbox)
            .await
            .context(StorageSnafu)
    }

    pub async fn is_following(&self, from: UserId, to: UserId) -> Result<bool> {
        self.backend
            .exists_following(from, to)
            .await
            .context(StorageSnafu)
    }

    pub async fn relation_status(&self, a: UserId, b: UserId) -> Result<RelationStatus> {
        let following = self.is_following(a, b).await?;
        let followed_by = self.is_following(b, a).await?;
        RelationStatus {
            following,
            followed_by,
            mutual: following && followed_by,
        }
        .pipe(Ok)
    }

    ////////////////////////////////////////////////////////////////////////////////////////
    // read path
    ////////////////////////////////////////////////////////////////////////////////////////

    pub async fn following(&self, uid: UserId, limit: usize, offset: usize) -> Result<Vec<UserId>> {
        self.ids_with_offset(Side::Followings, uid, limit, offset)
            .await
    }

    pub async fn followers(&self, uid: UserId, limit: usize, offset: usize) -> Result<Vec<UserId>> {
        self.ids_with_offset(Side::Followers, uid, limit, offset)
            .await
    }

    /// `cursor` is the last returned entry's score (created-at millis); `None` starts at newest
    pub async fn following_cursor(
        &self,
        uid: UserId,
        limit: usize,
        cursor: Option<i64>,
    ) -> Result<Vec<UserId>> {
        self.ids_with_cursor(Side::Followings, uid, limit, cursor)
            .await
    }

    pub async fn followers_cursor(
        &self,
        uid: UserId,
        limit: usize,
        cursor: Option<i64>,
    ) -> Result<Vec<UserId>> {
        self.ids_with_cursor(Side::Followers, uid, limit, cursor)
            .await
    }

    pub async fn following_profiles(
        &self,
        uid: UserId,
        limit: usize,
        offset: usize,
        cursor: Option<i64>,
    ) -> Result<Vec<Profile>> {
        let ids = match cursor {
            Some(_) => self.following_cursor(uid, limit, cursor).await?,
            None => self.following(uid, limit, offset).await?,
        };
        self.profiles(&ids).await
    }

    pub async fn followers_profiles(
        &self,
        uid: UserId,
        limit: usize,
        offset: usize,
        cursor: Option<i64>,
    ) -> Result<Vec<Profile>> {
        let ids = match cursor {
            Some(_) => self.followers_cursor(uid, limit, cursor).await?,
            None => self.followers(uid, limit, offset).await?,
        };
        self.profiles(&ids).await
    }

    /// Batched user lookup, input order preserved, absent users skipped
    async fn profiles(&self, ids: &[UserId]) -> Result<Vec<Profile>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let users = self
            .backend
            .list_users_by_ids(ids)
            .await
            .context(StorageSnafu)?;
        let by_id: HashMap<i64, _> = users.iter().map(|u| (u.id.as_i64(), u)).collect();
        Ok(ids
            .iter()
            .filter_map(|id| by_id.get(&id.as_i64()).map(|u| Profile::from(*u)))
            .collect())
    }

    async fn ids_with_offset(
        &self,
        side: Side,
        uid: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<UserId>> {
        let limit = limit.max(1);
        let key = side.key(uid);
        let (start, stop) = (offset as i64, (offset + limit - 1) as i64);
        let cached = self
            .store
            .zset_rev_range(&key, start, stop)
            .await
            .context(StoreSnafu)?;
        if !cached.is_empty() {
            return Ok(parse_ids(cached));
        }
        // Big-V users' leading pages are usually in the local top cache
        if let Some(top) = self.top_get(side, uid) {
            let from = offset.min(top.len());
            let to = (offset + limit).min(top.len());
            debug!("relation read for {uid} served from the top cache");
            return Ok(top[from..to].to_vec());
        }
        let need = (limit + offset).max(1).min(self.config.backfill_cap);
        let rows = self.fetch_rows(side, uid, need).await?;
        if rows.is_empty() {
            return Ok(vec![]);
        }
        self.fill_zset(&key, &rows, None).await?;
        self.store.expire(&key, ZSET_TTL).await.context(StoreSnafu)?;
        if self.is_big_v(uid).await? {
            self.refresh_top_cache(side, uid, &key).await?;
        }
        let filled = self
            .store
            .zset_rev_range(&key, start, stop)
            .await
            .context(StoreSnafu)?;
        Ok(parse_ids(filled))
    }

    async fn ids_with_cursor(
        &self,
        side: Side,
        uid: UserId,
        limit: usize,
        cursor: Option<i64>,
    ) -> Result<Vec<UserId>> {
        let limit = limit.max(1);
        let key = side.key(uid);
        let max = cursor.map(|c| c as f64).unwrap_or(f64::INFINITY);
        let cached = self
            .store
            .zset_rev_range_by_score(&key, max, f64::NEG_INFINITY, limit)
            .await
            .context(StoreSnafu)?;
        if !cached.is_empty() {
            return Ok(parse_ids(cached));
        }
        let need = limit.max(100).min(self.config.backfill_cap);
        let rows = self.fetch_rows(side, uid, need).await?;
        if rows.is_empty() {
            return Ok(vec![]);
        }
        // Only entries at or below the cursor belong in a cursor-constrained backfill
        self.fill_zset(&key, &rows, cursor).await?;
        self.store.expire(&key, ZSET_TTL).await.context(StoreSnafu)?;
        let filled = self
            .store
            .zset_rev_range_by_score(&key, max, f64::NEG_INFINITY, limit)
            .await
            .context(StoreSnafu)?;
        Ok(parse_ids(filled))
    }

    async fn fetch_rows(
        &self,
        side: Side,
        uid: UserId,
        need: usize,
    ) -> Result<Vec<(UserId, DateTime<Utc>)>> {
        match side {
            Side::Followings => self.backend.list_following_rows(uid, need, 0).await,
            Side::Followers => self.backend.list_follower_rows(uid, need, 0).await,
        }
        .context(StorageSnafu)
    }

    async fn fill_zset(
        &self,
        key: &str,
        rows: &[(UserId, DateTime<Utc>)],
        cursor: Option<i64>,
    ) -> Result<()> {
        for (other, created_at) in rows {
            let score = created_at.timestamp_millis();
            if cursor.map(|c| score <= c).unwrap_or(true) {
                self.store
                    .zset_add(key, &other.to_string(), score as f64)
                    .await
                    .context(StoreSnafu)?;
            }
        }
        Ok(())
    }

    /// Followers segment of the user's packed counter vs. the big-V threshold; an unreadable
    /// counter just means "not big-V today"
    async fn is_big_v(&self, uid: UserId) -> Result<bool> {
        Ok(self
            .user_counters
            .segment(uid, UserSegment::Followers)
            .await
            .context(CounterSnafu)?
            .map(|n| n >= self.config.bigv_threshold)
            .unwrap_or(false))
    }

    fn top_cache(&self, side: Side) -> &TopCache {
        match side {
            Side::Followings => &self.flws_top,
            Side::Followers => &self.fans_top,
        }
    }

    fn top_get(&self, side: Side, uid: UserId) -> Option<Vec<UserId>> {
        let mut cache = self
            .top_cache(side)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let hit = cache
            .get(&uid.as_i64())
            .map(|(at, ids)| (at.elapsed() <= self.config.top_cache_ttl, ids.clone()));
        match hit {
            Some((true, ids)) if !ids.is_empty() => Some(ids),
            Some(_) => {
                cache.pop(&uid.as_i64());
                None
            }
            None => None,
        }
    }

    async fn refresh_top_cache(&self, side: Side, uid: UserId, key: &str) -> Result<()> {
        let members = self
            .store
            .zset_rev_range(key, 0, self.config.top_depth as i64 - 1)
            .await
            .context(StoreSnafu)?;
        if members.is_empty() {
            return Ok(());
        }
        self.top_cache(side)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(uid.as_i64(), (Instant::now(), parse_ids(members)));
        Ok(())
    }
}
