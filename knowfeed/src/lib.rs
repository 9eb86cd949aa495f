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

//! # knowfeed
//!
//! The engagement-and-feed substrate of a social knowledge-sharing platform: per-user bitmap
//! facts aggregated into packed counter snapshots, a rate-limited follow write path over a
//! transactional outbox with a CDC bridge & idempotent consumers, sorted-set relation reads with
//! self-healing user counters, and a multi-tier feed cache with targeted, non-invalidating count
//! patches.
//!
//! The external collaborators-- the key-value cache server ([knowfeed_store]), the relational
//! store ([storage]), the message bus ([bus]), & the change-data-capture stream ([cdc])-- sit
//! behind object-safe traits, each with a fully functional in-memory engine used by the test
//! suites & single-node deployments.

pub mod bitmap;
pub mod bus;
pub mod cdc;
#[path = "counter-events.rs"]
pub mod counter_events;
pub mod counters;
pub mod entities;
pub mod feed;
#[path = "feed-listener.rs"]
pub mod feed_listener;
pub mod hotkey;
pub mod ids;
pub mod memory;
pub mod metrics;
pub mod packed;
pub mod posts;
pub mod relation;
#[path = "relation-events.rs"]
pub mod relation_events;
pub mod singleflight;
pub mod storage;
#[path = "user-counters.rs"]
pub mod user_counters;
pub mod worker;
