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

//! # knowfeed models
//!
//! I hate these sort of "catch-all" modules named "models" or "entities", but these types are
//! truly foundational: identifiers, the post row & its lifecycle states, relation & outbox rows,
//! and the feed/detail view types that the caches serialize.

use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("{value} is not a recognized metric"))]
    BadMetric { value: String, backtrace: Backtrace },
    #[snafu(display("{value} is not a supported visibility"))]
    BadVisibility { value: String, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Identifiers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Declare a newtype struct wrapping `i64` to serve as an opaque identifier.
///
/// I could have passed raw `i64`s around, but I just can't bring myself to use the same type to
/// identify users, posts and relation rows all at the same time-- too many call sites take two or
/// three of them in a row.
macro_rules! define_id {
    ($type_name:ident) => {
        #[derive(
            Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
        )]
        #[serde(transparent)]
        pub struct $type_name(i64);

        impl $type_name {
            pub fn new(n: i64) -> $type_name {
                $type_name(n)
            }
            pub fn as_i64(&self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $type_name {
            fn from(n: i64) -> Self {
                $type_name(n)
            }
        }

        impl Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $type_name {
            type Err = std::num::ParseIntError;
            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok($type_name(s.parse()?))
            }
        }
    };
}

define_id!(UserId);
define_id!(PostId);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Metrics                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The two engagement metrics kept in the bitmap fact layer
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Like,
    Fav,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Like => "like",
            Metric::Fav => "fav",
        }
    }
    /// This metric's segment in the entity counter schema (segment 0 is reserved)
    pub fn segment(&self) -> usize {
        match self {
            Metric::Like => 1,
            Metric::Fav => 2,
        }
    }
    pub fn from_segment(idx: usize) -> Option<Metric> {
        match idx {
            1 => Some(Metric::Like),
            2 => Some(Metric::Fav),
            _ => None,
        }
    }
}

impl Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Metric {
    type Err = Error;
    fn from_str(s: &str) -> Result<Metric> {
        match s {
            "like" => Ok(Metric::Like),
            "fav" => Ok(Metric::Fav),
            _ => BadMetricSnafu { value: s }.fail(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         post lifecycle                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Draft,
    Published,
    Deleted,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Followers,
    School,
    Private,
    Unlisted,
}

impl FromStr for Visibility {
    type Err = Error;
    fn from_str(s: &str) -> Result<Visibility> {
        match s {
            "public" => Ok(Visibility::Public),
            "followers" => Ok(Visibility::Followers),
            "school" => Ok(Visibility::School),
            "private" => Ok(Visibility::Private),
            "unlisted" => Ok(Visibility::Unlisted),
            _ => BadVisibilitySnafu { value: s }.fail(),
        }
    }
}

/// A row in the `know_post` table
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct KnowPost {
    pub id: PostId,
    pub creator_id: UserId,
    pub status: PostStatus,
    pub visible: Visibility,
    pub is_top: bool,
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub img_urls: Vec<String>,
    pub content_url: Option<String>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub publish_time: Option<DateTime<Utc>>,
}

/// A feed-query row: the post joined with its author's display fields
#[derive(Clone, Debug)]
pub struct FeedRow {
    pub id: PostId,
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub img_urls: Vec<String>,
    pub author_avatar: Option<String>,
    pub author_nickname: Option<String>,
    pub is_top: bool,
}

/// A detail-query row: [FeedRow] plus ownership, state & content fields
#[derive(Clone, Debug)]
pub struct DetailRow {
    pub id: PostId,
    pub creator_id: UserId,
    pub status: PostStatus,
    pub visible: Visibility,
    pub title: Option<String>,
    pub description: Option<String>,
    pub content_url: Option<String>,
    pub tags: Vec<String>,
    pub img_urls: Vec<String>,
    pub author_avatar: Option<String>,
    pub author_nickname: Option<String>,
    pub is_top: bool,
    pub publish_time: Option<DateTime<Utc>>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         feed view types                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One rendered feed entry
///
/// The shared caches hold this with `liked`/`faved` set to `None`; the viewer's flags are overlaid
/// at read time so that one user's state never leaks into another's page.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    pub id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub cover_image: Option<String>,
    pub tags: Vec<String>,
    pub author_avatar: Option<String>,
    pub author_nickname: Option<String>,
    pub like_count: Option<u64>,
    pub favorite_count: Option<u64>,
    pub liked: Option<bool>,
    pub faved: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_top: Option<bool>,
}

impl FeedItem {
    pub fn from_row(row: &FeedRow, include_is_top: bool) -> FeedItem {
        FeedItem {
            id: row.id.to_string(),
            title: row.title.clone(),
            description: row.description.clone(),
            cover_image: row.img_urls.first().cloned(),
            tags: row.tags.clone(),
            author_avatar: row.author_avatar.clone(),
            author_nickname: row.author_nickname.clone(),
            like_count: None,
            favorite_count: None,
            liked: None,
            faved: None,
            is_top: include_is_top.then_some(row.is_top),
        }
    }
}

/// One page of the feed, as cached & as returned
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPage {
    pub items: Vec<FeedItem>,
    pub page: u32,
    pub size: u32,
    pub has_more: bool,
}

/// The full detail view of one post
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostDetail {
    pub id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub content_url: Option<String>,
    pub images: Vec<String>,
    pub tags: Vec<String>,
    pub author_id: String,
    pub author_avatar: Option<String>,
    pub author_nickname: Option<String>,
    pub like_count: Option<u64>,
    pub favorite_count: Option<u64>,
    pub liked: Option<bool>,
    pub faved: Option<bool>,
    pub is_top: bool,
    pub visible: Visibility,
    pub publish_time: Option<DateTime<Utc>>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      relations & outbox                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RelStatus {
    Canceled = 0,
    Active = 1,
}

/// A row in the `following` table (and, mirrored, `follower`)
#[derive(Clone, Debug)]
pub struct RelationRow {
    pub id: i64,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub status: RelStatus,
    pub created_at: DateTime<Utc>,
}

/// A row in the `outbox` table; `payload` is the embedded event JSON
#[derive(Clone, Debug)]
pub struct OutboxRow {
    pub id: i64,
    pub aggregate_type: String,
    pub aggregate_id: Option<i64>,
    pub event_type: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

/// The display fields of a user, as composed into relation profile lists
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub nickname: Option<String>,
    pub avatar: Option<String>,
    pub bio: Option<String>,
}

/// A row in the `user` table, reduced to what the relation read path needs
#[derive(Clone, Debug)]
pub struct UserRow {
    pub id: UserId,
    pub nickname: Option<String>,
    pub avatar: Option<String>,
    pub bio: Option<String>,
}

impl From<&UserRow> for Profile {
    fn from(row: &UserRow) -> Profile {
        Profile {
            id: row.id.to_string(),
            nickname: row.nickname.clone(),
            avatar: row.avatar.clone(),
            bio: row.bio.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn metric_round_trips() {
        assert_eq!("like".parse::<Metric>().unwrap(), Metric::Like);
        assert_eq!(Metric::Fav.segment(), 2);
        assert_eq!(Metric::from_segment(1), Some(Metric::Like));
        assert!(Metric::from_segment(0).is_none());
        assert!("read".parse::<Metric>().is_err());
    }

    #[test]
    fn visibility_is_validated() {
        assert_eq!("public".parse::<Visibility>().unwrap(), Visibility::Public);
        assert!("everyone".parse::<Visibility>().is_err());
    }

    #[test]
    fn feed_item_json_shape() {
        let item = FeedItem {
            id: "100".to_owned(),
            title: Some("t".to_owned()),
            description: None,
            cover_image: None,
            tags: vec![],
            author_avatar: None,
            author_nickname: None,
            like_count: Some(3),
            favorite_count: Some(1),
            liked: None,
            faved: None,
            is_top: None,
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["likeCount"], 3);
        assert!(json.get("isTop").is_none());
    }
}
