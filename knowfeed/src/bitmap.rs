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

//! # bitmap
//!
//! The sharded-bitmap fact layer's addressing scheme.
//!
//! For each (metric, entity) pair the set of users in that state is a bitmap, sharded into
//! fixed-size chunks so that one huge user id can't balloon a single key: user `u` lands in chunk
//! `u / CHUNK_SIZE` at bit `u % CHUNK_SIZE`. At 32Ki bits a fully-populated shard is 4KiB.
//!
//! Shard keys are tracked in a per-(metric, entity) index set, populated on first write, so
//! rebuilds enumerate shards without scanning the keyspace.

use crate::entities::{Metric, UserId};

/// Bits per shard
pub const CHUNK_SIZE: i64 = 32_768;

pub fn chunk_of(uid: UserId) -> i64 {
    uid.as_i64() / CHUNK_SIZE
}

pub fn bit_of(uid: UserId) -> u64 {
    (uid.as_i64() % CHUNK_SIZE) as u64
}

/// Shard key: `bm:{metric}:{etype}:{eid}:{chunk}`
pub fn shard_key(metric: Metric, etype: &str, eid: &str, chunk: i64) -> String {
    format!("bm:{}:{}:{}:{}", metric.as_str(), etype, eid, chunk)
}

/// Index set of this (metric, entity)'s live shard keys: `bm:idx:{metric}:{etype}:{eid}`
pub fn shard_index_key(metric: Metric, etype: &str, eid: &str) -> String {
    format!("bm:idx:{}:{}:{}", metric.as_str(), etype, eid)
}
