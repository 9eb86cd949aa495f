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
//! An in-memory [Backend](crate::storage::Backend): the relational layer as a handful of
//! mutex-guarded tables. Serves the test suites & doubles as the storage for single-process
//! deployments. The "transactions" of the relation write path are simply both mutations applied
//! under one guard.
//!
//! The outbox keeps an append sequence so the CDC bridge's change source can tail it the way a
//! binlog subscriber would.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    entities::{
        DetailRow, FeedRow, KnowPost, OutboxRow, PostId, PostStatus, RelStatus, RelationRow,
        UserId, UserRow, Visibility,
    },
    storage::{Backend, Result},
};

#[derive(Default)]
struct Tables {
    following: Vec<RelationRow>,
    follower: Vec<RelationRow>,
    outbox: Vec<OutboxRow>,
    posts: HashMap<i64, KnowPost>,
    users: HashMap<i64, UserRow>,
}

/// In-memory relational engine
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Tables>>,
}

impl MemoryBackend {
    pub fn new() -> MemoryBackend {
        MemoryBackend::default()
    }
    fn guard(&self) -> MutexGuard<'_, Tables> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
    /// Seed a user row (test & bootstrap convenience; not part of the [Backend] surface)
    pub fn put_user(&self, row: UserRow) {
        self.guard().users.insert(row.id.as_i64(), row);
    }
    /// Outbox rows appended at or after `seq`, with the next cursor value. This is the change
    /// stream the in-process CDC source tails.
    pub fn outbox_since(&self, seq: usize, limit: usize) -> (Vec<OutboxRow>, usize) {
        let tables = self.guard();
        let end = tables.outbox.len().min(seq + limit);
        if seq >= end {
            return (vec![], seq);
        }
        (tables.outbox[seq..end].to_vec(), end)
    }

    fn feed_row(tables: &Tables, post: &KnowPost) -> FeedRow {
        let author = tables.users.get(&post.creator_id.as_i64());
        FeedRow {
            id: post.id,
            title: post.title.clone(),
            description: post.description.clone(),
            tags: post.tags.clone(),
            img_urls: post.img_urls.clone(),
            author_avatar: author.and_then(|u| u.avatar.clone()),
            author_nickname: author.and_then(|u| u.nickname.clone()),
            is_top: post.is_top,
        }
    }
}

fn active(rows: &[RelationRow], from: UserId, to: UserId) -> Option<usize> {
    rows.iter()
        .position(|r| r.from_user_id == from && r.to_user_id == to && r.status == RelStatus::Active)
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn insert_following_with_outbox(
        &self,
        id: i64,
        from: UserId,
        to: UserId,
        outbox: OutboxRow,
    ) -> Result<bool> {
        let mut tables = self.guard();
        if active(&tables.following, from, to).is_some() {
            return Ok(false);
        }
        tables.following.push(RelationRow {
            id,
            from_user_id: from,
            to_user_id: to,
            status: RelStatus::Active,
            created_at: Utc::now(),
        });
        tables.outbox.push(outbox);
        Ok(true)
    }

    async fn cancel_following_with_outbox(
        &self,
        from: UserId,
        to: UserId,
        outbox: OutboxRow,
    ) -> Result<bool> {
        let mut tables = self.guard();
        match active(&tables.following, from, to) {
            Some(i) => {
                tables.following[i].status = RelStatus::Canceled;
                tables.outbox.push(outbox);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_follower(&self, id: i64, to: UserId, from: UserId) -> Result<bool> {
        let mut tables = self.guard();
        if active(&tables.follower, from, to).is_some() {
            return Ok(false);
        }
        tables.follower.push(RelationRow {
            id,
            from_user_id: from,
            to_user_id: to,
            status: RelStatus::Active,
            created_at: Utc::now(),
        });
        Ok(true)
    }

    async fn cancel_follower(&self, to: UserId, from: UserId) -> Result<bool> {
        let mut tables = self.guard();
        match active(&tables.follower, from, to) {
            Some(i) => {
                tables.follower[i].status = RelStatus::Canceled;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn exists_following(&self, from: UserId, to: UserId) -> Result<bool> {
        Ok(active(&self.guard().following, from, to).is_some())
    }

    async fn list_following_rows(
        &self,
        from: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<(UserId, DateTime<Utc>)>> {
        let tables = self.guard();
        let mut rows: Vec<(UserId, DateTime<Utc>)> = tables
            .following
            .iter()
            .filter(|r| r.from_user_id == from && r.status == RelStatus::Active)
            .map(|r| (r.to_user_id, r.created_at))
            .collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_follower_rows(
        &self,
        to: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<(UserId, DateTime<Utc>)>> {
        let tables = self.guard();
        let mut rows: Vec<(UserId, DateTime<Utc>)> = tables
            .follower
            .iter()
            .filter(|r| r.to_user_id == to && r.status == RelStatus::Active)
            .map(|r| (r.from_user_id, r.created_at))
            .collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn count_following_active(&self, from: UserId) -> Result<u64> {
        Ok(self
            .guard()
            .following
            .iter()
            .filter(|r| r.from_user_id == from && r.status == RelStatus::Active)
            .count() as u64)
    }

    async fn count_follower_active(&self, to: UserId) -> Result<u64> {
        Ok(self
            .guard()
            .follower
            .iter()
            .filter(|r| r.to_user_id == to && r.status == RelStatus::Active)
            .count() as u64)
    }

    async fn insert_draft(&self, post: KnowPost) -> Result<()> {
        self.guard().posts.insert(post.id.as_i64(), post);
        Ok(())
    }

    async fn find_post(&self, id: PostId) -> Result<Option<KnowPost>> {
        Ok(self.guard().posts.get(&id.as_i64()).cloned())
    }

    async fn update_content(
        &self,
        id: PostId,
        creator: UserId,
        content_url: &str,
    ) -> Result<bool> {
        let mut tables = self.guard();
        match tables.posts.get_mut(&id.as_i64()) {
            Some(p) if p.creator_id == creator && p.status != PostStatus::Deleted => {
                p.content_url = Some(content_url.to_owned());
                p.update_time = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_metadata(
        &self,
        id: PostId,
        creator: UserId,
        title: Option<String>,
        description: Option<String>,
        tags: Vec<String>,
        img_urls: Vec<String>,
        visible: Visibility,
        is_top: bool,
    ) -> Result<bool> {
        let mut tables = self.guard();
        match tables.posts.get_mut(&id.as_i64()) {
            Some(p) if p.creator_id == creator && p.status != PostStatus::Deleted => {
                p.title = title;
                p.description = description;
                p.tags = tags;
                p.img_urls = img_urls;
                p.visible = visible;
                p.is_top = is_top;
                p.update_time = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn publish(&self, id: PostId, creator: UserId) -> Result<bool> {
        let mut tables = self.guard();
        match tables.posts.get_mut(&id.as_i64()) {
            Some(p) if p.creator_id == creator && p.status == PostStatus::Draft => {
                p.status = PostStatus::Published;
                let now = Utc::now();
                p.publish_time = Some(now);
                p.update_time = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_top(&self, id: PostId, creator: UserId, is_top: bool) -> Result<bool> {
        let mut tables = self.guard();
        match tables.posts.get_mut(&id.as_i64()) {
            Some(p) if p.creator_id == creator && p.status != PostStatus::Deleted => {
                p.is_top = is_top;
                p.update_time = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_visibility(
        &self,
        id: PostId,
        creator: UserId,
        visible: Visibility,
    ) -> Result<bool> {
        let mut tables = self.guard();
        match tables.posts.get_mut(&id.as_i64()) {
            Some(p) if p.creator_id == creator && p.status != PostStatus::Deleted => {
                p.visible = visible;
                p.update_time = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn soft_delete(&self, id: PostId, creator: UserId) -> Result<bool> {
        let mut tables = self.guard();
        match tables.posts.get_mut(&id.as_i64()) {
            Some(p) if p.creator_id == creator && p.status != PostStatus::Deleted => {
                p.status = PostStatus::Deleted;
                p.update_time = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_feed_public(&self, limit: usize, offset: usize) -> Result<Vec<FeedRow>> {
        let tables = self.guard();
        let mut posts: Vec<&KnowPost> = tables
            .posts
            .values()
            .filter(|p| p.status == PostStatus::Published && p.visible == Visibility::Public)
            .collect();
        posts.sort_by(|a, b| {
            b.publish_time
                .cmp(&a.publish_time)
                .then_with(|| b.id.as_i64().cmp(&a.id.as_i64()))
        });
        Ok(posts
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|p| MemoryBackend::feed_row(&tables, p))
            .collect())
    }

    async fn list_my_published(
        &self,
        creator: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<FeedRow>> {
        let tables = self.guard();
        let mut posts: Vec<&KnowPost> = tables
            .posts
            .values()
            .filter(|p| p.status == PostStatus::Published && p.creator_id == creator)
            .collect();
        posts.sort_by(|a, b| {
            b.is_top
                .cmp(&a.is_top)
                .then_with(|| b.publish_time.cmp(&a.publish_time))
                .then_with(|| b.id.as_i64().cmp(&a.id.as_i64()))
        });
        Ok(posts
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|p| MemoryBackend::feed_row(&tables, p))
            .collect())
    }

    async fn find_detail(&self, id: PostId) -> Result<Option<DetailRow>> {
        let tables = self.guard();
        Ok(tables.posts.get(&id.as_i64()).map(|p| {
            let author = tables.users.get(&p.creator_id.as_i64());
            DetailRow {
                id: p.id,
                creator_id: p.creator_id,
                status: p.status,
                visible: p.visible,
                title: p.title.clone(),
                description: p.description.clone(),
                content_url: p.content_url.clone(),
                tags: p.tags.clone(),
                img_urls: p.img_urls.clone(),
                author_avatar: author.and_then(|u| u.avatar.clone()),
                author_nickname: author.and_then(|u| u.nickname.clone()),
                is_top: p.is_top,
                publish_time: p.publish_time,
            }
        }))
    }

    async fn list_my_published_ids(&self, creator: UserId) -> Result<Vec<PostId>> {
        let tables = self.guard();
        let mut posts: Vec<&KnowPost> = tables
            .posts
            .values()
            .filter(|p| p.status == PostStatus::Published && p.creator_id == creator)
            .collect();
        posts.sort_by(|a, b| b.publish_time.cmp(&a.publish_time));
        Ok(posts.into_iter().map(|p| p.id).collect())
    }

    async fn list_users_by_ids(&self, ids: &[UserId]) -> Result<Vec<UserRow>> {
        let tables = self.guard();
        Ok(ids
            .iter()
            .filter_map(|id| tables.users.get(&id.as_i64()).cloned())
            .collect())
    }
}
