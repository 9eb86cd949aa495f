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

//! # storage
//!
//! Abstractions for the knowfeed relational layer: the `following`/`follower` relation tables,
//! the transactional `outbox`, the `know_post` table, and the slice of `user` the relation reads
//! compose with.
//!
//! The relation write operations take the outbox row as a parameter because the two writes must
//! land in the *same transaction*-- that is the contract the CDC bridge & the downstream
//! consumers rely on, and it can't be expressed by two separate trait calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::Backtrace;

use crate::entities::{
    DetailRow, FeedRow, KnowPost, OutboxRow, PostId, UserId, UserRow, Visibility,
};

#[derive(Debug)]
pub struct Error {
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
    #[allow(dead_code)] // captured for Debug output only
    backtrace: Backtrace,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[async_trait]
pub trait Backend: Send + Sync {
    ////////////////////////////////////////////////////////////////////////////////////////
    // relations
    ////////////////////////////////////////////////////////////////////////////////////////
    /// Insert an active following row and, iff a row was actually written, the outbox row, in one
    /// transaction. Returns true if the relation was created.
    async fn insert_following_with_outbox(
        &self,
        id: i64,
        from: UserId,
        to: UserId,
        outbox: OutboxRow,
    ) -> Result<bool>;
    /// Logically cancel a following row and, iff a row was actually updated, write the outbox row,
    /// in one transaction. Returns true if the relation was canceled.
    async fn cancel_following_with_outbox(
        &self,
        from: UserId,
        to: UserId,
        outbox: OutboxRow,
    ) -> Result<bool>;
    /// Insert an active follower (mirror) row; false if one already exists
    async fn insert_follower(&self, id: i64, to: UserId, from: UserId) -> Result<bool>;
    /// Logically cancel a follower (mirror) row
    async fn cancel_follower(&self, to: UserId, from: UserId) -> Result<bool>;
    async fn exists_following(&self, from: UserId, to: UserId) -> Result<bool>;
    /// Active followings of `from`, most recent first: (toUserId, createdAt)
    async fn list_following_rows(
        &self,
        from: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<(UserId, DateTime<Utc>)>>;
    /// Active followers of `to`, most recent first: (fromUserId, createdAt)
    async fn list_follower_rows(
        &self,
        to: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<(UserId, DateTime<Utc>)>>;
    async fn count_following_active(&self, from: UserId) -> Result<u64>;
    async fn count_follower_active(&self, to: UserId) -> Result<u64>;

    ////////////////////////////////////////////////////////////////////////////////////////
    // posts
    ////////////////////////////////////////////////////////////////////////////////////////
    async fn insert_draft(&self, post: KnowPost) -> Result<()>;
    async fn find_post(&self, id: PostId) -> Result<Option<KnowPost>>;
    /// The following all return false when no row matched (id, creator) -- absent or not owned
    async fn update_content(
        &self,
        id: PostId,
        creator: UserId,
        content_url: &str,
    ) -> Result<bool>;
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<bool>;
    async fn publish(&self, id: PostId, creator: UserId) -> Result<bool>;
    async fn update_top(&self, id: PostId, creator: UserId, is_top: bool) -> Result<bool>;
    async fn update_visibility(
        &self,
        id: PostId,
        creator: UserId,
        visible: Visibility,
    ) -> Result<bool>;
    async fn soft_delete(&self, id: PostId, creator: UserId) -> Result<bool>;
    /// Published, public posts, newest publication first
    async fn list_feed_public(&self, limit: usize, offset: usize) -> Result<Vec<FeedRow>>;
    /// `creator`'s published posts, pinned first, then newest publication first
    async fn list_my_published(
        &self,
        creator: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<FeedRow>>;
    async fn find_detail(&self, id: PostId) -> Result<Option<DetailRow>>;
    async fn list_my_published_ids(&self, creator: UserId) -> Result<Vec<PostId>>;

    ////////////////////////////////////////////////////////////////////////////////////////
    // users
    ////////////////////////////////////////////////////////////////////////////////////////
    /// Batched lookup; rows come back in no particular order & absent ids are skipped
    async fn list_users_by_ids(&self, ids: &[UserId]) -> Result<Vec<UserRow>>;
}
