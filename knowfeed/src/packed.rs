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

//! # packed
//!
//! The packed-counter layout & key shapes.
//!
//! A counter snapshot is an opaque byte string of `SCHEMA_LEN x FIELD_SIZE` bytes: a small struct
//! of big-endian unsigned 32-bit segments at fixed offsets, saturating at `[0, 2^32-1]` on write.
//! Two schemas share the layout machinery:
//!
//! - *entity* (`cnt:v1:{etype}:{eid}`): segment 0 reserved, 1 = like, 2 = fav, 3-4 reserved
//! - *user* (`ucnt:{uid}`): 0 = followings, 1 = followers, 2 = posts, 3 = likes-received,
//!   4 = favs-received
//!
//! Segment indices are 0-based everywhere; [Store::packed_add](knowfeed_store::Store::packed_add)
//! speaks the same convention, so callers & scripts can't disagree about offsets.
//!
//! Readers treat a missing or short blob as all-zero & report "needs rebuild" to their caller;
//! the decode helpers here never allocate.

use crate::entities::{Metric, UserId};

/// Bytes per segment: big-endian unsigned 32-bit
pub const FIELD_SIZE: usize = 4;
/// Segments per schema (both schemas reserve room for growth)
pub const SCHEMA_LEN: usize = 5;
/// Version tag baked into the entity snapshot & aggregation-bucket key shapes
pub const SCHEMA_ID: &str = "v1";

/// Expected byte length of a well-formed snapshot
pub const fn expected_len() -> usize {
    SCHEMA_LEN * FIELD_SIZE
}

/// Segments of the user-dimension schema
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UserSegment {
    Followings = 0,
    Followers = 1,
    Posts = 2,
    LikesReceived = 3,
    FavsReceived = 4,
}

impl UserSegment {
    pub fn idx(&self) -> usize {
        *self as usize
    }
}

/// Decode segment `idx` of `raw`; `None` if the blob is malformed (wrong length)
pub fn read_segment(raw: &[u8], idx: usize) -> Option<u64> {
    if raw.len() != expected_len() || idx >= SCHEMA_LEN {
        return None;
    }
    let off = idx * FIELD_SIZE;
    let mut n = 0u64;
    for i in 0..FIELD_SIZE {
        n = (n << 8) | raw[off + i] as u64;
    }
    Some(n)
}

/// Write segment `idx` of `buf` in place, clamping to `[0, 2^32-1]`
pub fn write_segment(buf: &mut [u8], idx: usize, val: u64) {
    let off = idx * FIELD_SIZE;
    let n = val.min(u32::MAX as u64) as u32;
    buf[off..off + FIELD_SIZE].copy_from_slice(&n.to_be_bytes());
}

pub fn is_well_formed(raw: &[u8]) -> bool {
    raw.len() == expected_len()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           key shapes                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Entity counter snapshot: `cnt:v1:{etype}:{eid}`
pub fn snapshot_key(etype: &str, eid: &str) -> String {
    format!("cnt:{}:{}:{}", SCHEMA_ID, etype, eid)
}

/// Aggregation bucket (hash of pending deltas): `agg:v1:{etype}:{eid}`
pub fn agg_key(etype: &str, eid: &str) -> String {
    format!("agg:{}:{}:{}", SCHEMA_ID, etype, eid)
}

/// Index set of live aggregation buckets, maintained by the aggregation consumer so the flusher
/// never has to scan the keyspace
pub fn agg_index_key() -> String {
    format!("agg:idx:{}", SCHEMA_ID)
}

/// User-dimension counter snapshot: `ucnt:{uid}`
pub fn user_counter_key(uid: UserId) -> String {
    format!("ucnt:{}", uid)
}

/// Per-user self-healing throttle: `ucnt:chk:{uid}`
pub fn user_check_key(uid: UserId) -> String {
    format!("ucnt:chk:{}", uid)
}

/// Parse an aggregation-bucket key back into `(etype, eid)`
pub fn parse_agg_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix("agg:")?;
    let rest = rest.strip_prefix(SCHEMA_ID)?.strip_prefix(':')?;
    rest.split_once(':')
}

/// The aggregation-hash field for a metric is its (decimal) segment index
pub fn metric_field(metric: Metric) -> String {
    metric.segment().to_string()
}
