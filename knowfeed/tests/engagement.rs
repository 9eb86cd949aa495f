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

//! End-to-end suites for the engagement counters: bitmap facts, event-driven aggregation,
//! snapshot reads & the net-zero round-trip law.

mod common;

use common::{Harness, SETTLE};
use knowfeed::{
    entities::{Metric, UserId},
    packed,
};
use knowfeed_store::Store;

#[tokio::test]
async fn like_toggle_and_aggregated_read() {
    let h = Harness::new().await;
    // A fresh like flips the bit...
    assert!(h
        .counters
        .like("knowpost", "100", UserId::new(42))
        .await
        .unwrap());
    // ... is observable immediately on the fact layer ...
    assert!(h
        .counters
        .is_liked("knowpost", "100", UserId::new(42))
        .await
        .unwrap());
    // ... and lands in the snapshot once aggregation has run
    tokio::time::sleep(SETTLE).await;
    let counts = h
        .counters
        .counts("knowpost", "100", &[Metric::Like, Metric::Fav])
        .await
        .unwrap();
    assert_eq!(counts[&Metric::Like], 1);
    assert_eq!(counts[&Metric::Fav], 0);
    // Un-liking is symmetric & idempotent
    assert!(h
        .counters
        .unlike("knowpost", "100", UserId::new(42))
        .await
        .unwrap());
    assert!(!h
        .counters
        .unlike("knowpost", "100", UserId::new(42))
        .await
        .unwrap());
    tokio::time::sleep(SETTLE).await;
    let counts = h
        .counters
        .counts("knowpost", "100", &[Metric::Like])
        .await
        .unwrap();
    assert_eq!(counts[&Metric::Like], 0);
    h.shutdown().await;
}

#[tokio::test]
async fn repeated_likes_count_once() {
    let h = Harness::new().await;
    assert!(h
        .counters
        .like("knowpost", "5", UserId::new(1))
        .await
        .unwrap());
    // Only the first toggle changes state; the rest emit nothing
    for _ in 0..3 {
        assert!(!h
            .counters
            .like("knowpost", "5", UserId::new(1))
            .await
            .unwrap());
    }
    h.counters
        .like("knowpost", "5", UserId::new(2))
        .await
        .unwrap();
    tokio::time::sleep(SETTLE).await;
    let counts = h
        .counters
        .counts("knowpost", "5", &[Metric::Like])
        .await
        .unwrap();
    assert_eq!(counts[&Metric::Like], 2);
    h.shutdown().await;
}

#[tokio::test]
async fn bitmap_sharding_at_the_chunk_edge() {
    let h = Harness::new().await;
    h.counters
        .like("knowpost", "7", UserId::new(32_768))
        .await
        .unwrap();
    assert_eq!(h.store.bit_count("bm:like:knowpost:7:1").await.unwrap(), 1);
    assert_eq!(h.store.bit_count("bm:like:knowpost:7:0").await.unwrap(), 0);
    h.counters
        .like("knowpost", "7", UserId::new(32_767))
        .await
        .unwrap();
    assert_eq!(h.store.bit_count("bm:like:knowpost:7:0").await.unwrap(), 1);
    tokio::time::sleep(SETTLE).await;
    // Both shards sum into one snapshot segment
    let counts = h
        .counters
        .counts("knowpost", "7", &[Metric::Like])
        .await
        .unwrap();
    assert_eq!(counts[&Metric::Like], 2);
    h.shutdown().await;
}

#[tokio::test]
async fn snapshot_matches_shard_population_at_steady_state() {
    let h = Harness::new().await;
    for uid in 1..=10 {
        h.counters
            .like("knowpost", "900", UserId::new(uid))
            .await
            .unwrap();
    }
    for uid in [2, 4, 6] {
        h.counters
            .unlike("knowpost", "900", UserId::new(uid))
            .await
            .unwrap();
    }
    tokio::time::sleep(SETTLE).await;
    let counts = h
        .counters
        .counts("knowpost", "900", &[Metric::Like])
        .await
        .unwrap();
    let bitcount = h.store.bit_count("bm:like:knowpost:900:0").await.unwrap();
    assert_eq!(counts[&Metric::Like], bitcount);
    assert_eq!(bitcount, 7);
    // The drained bucket is gone
    assert!(h
        .store
        .get_raw(&packed::agg_key("knowpost", "900"))
        .await
        .unwrap()
        .is_none());
    h.shutdown().await;
}
