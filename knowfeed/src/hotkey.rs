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

//! # hotkey
//!
//! Sliding-window heat tracking for cache keys, used to stretch hot pages' TTLs.
//!
//! Per key: a fixed ring of `window / segment` per-segment hit counts. A shared cursor rotates
//! once per segment interval, zeroing the slot it lands on, which ages the window without
//! touching every key on every hit. Heat = the ring's sum, mapped onto NONE/LOW/MEDIUM/HIGH by
//! configured thresholds; each level buys a configured TTL extension.
//!
//! Counting is deliberately approximate: the per-slot bumps race the rotation & each other, and
//! per-process state means each node sees only its own traffic. Both are fine-- a hot key is hot
//! on every node, and a handful of lost hits won't change its level.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use serde::Deserialize;

use crate::worker::Worker;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum Level {
    None,
    Low,
    Medium,
    High,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(rename = "window")]
    pub window: Duration,
    #[serde(rename = "segment")]
    pub segment: Duration,
    #[serde(rename = "level-low")]
    pub level_low: u32,
    #[serde(rename = "level-medium")]
    pub level_medium: u32,
    #[serde(rename = "level-high")]
    pub level_high: u32,
    #[serde(rename = "extend-low")]
    pub extend_low: Duration,
    #[serde(rename = "extend-medium")]
    pub extend_medium: Duration,
    #[serde(rename = "extend-high")]
    pub extend_high: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            segment: Duration::from_secs(10),
            level_low: 50,
            level_medium: 200,
            level_high: 500,
            extend_low: Duration::from_secs(20),
            extend_medium: Duration::from_secs(60),
            extend_high: Duration::from_secs(120),
        }
    }
}

/// Sliding-window hot-key detector
pub struct HotKeyDetector {
    config: Config,
    segments: usize,
    current: AtomicUsize,
    counters: Mutex<HashMap<String, Vec<u32>>>,
}

impl HotKeyDetector {
    pub fn new(config: Config) -> HotKeyDetector {
        let segments = (config.window.as_secs() / config.segment.as_secs().max(1)).max(1) as usize;
        HotKeyDetector {
            config,
            segments,
            current: AtomicUsize::new(0),
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Count one hit on `key` in the current segment
    pub fn record(&self, key: &str) {
        let slot = self.current.load(Ordering::Relaxed);
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let ring = counters
            .entry(key.to_owned())
            .or_insert_with(|| vec![0; self.segments]);
        ring[slot] = ring[slot].saturating_add(1);
    }

    /// Heat over the whole window: the ring's sum
    pub fn heat(&self, key: &str) -> u32 {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|ring| ring.iter().sum())
            .unwrap_or(0)
    }

    pub fn level(&self, key: &str) -> Level {
        let h = self.heat(key);
        if h >= self.config.level_high {
            Level::High
        } else if h >= self.config.level_medium {
            Level::Medium
        } else if h >= self.config.level_low {
            Level::Low
        } else {
            Level::None
        }
    }

    fn extension(&self, level: Level) -> Duration {
        match level {
            Level::High => self.config.extend_high,
            Level::Medium => self.config.extend_medium,
            Level::Low => self.config.extend_low,
            Level::None => Duration::ZERO,
        }
    }

    /// The TTL a cache entry for `key` deserves: `base` plus its level's extension
    pub fn ttl_for(&self, base: Duration, key: &str) -> Duration {
        base + self.extension(self.level(key))
    }

    /// Advance the segment cursor & zero the slot it lands on
    pub fn rotate(&self) {
        let next = (self.current.load(Ordering::Relaxed) + 1) % self.segments;
        self.current.store(next, Ordering::Relaxed);
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for ring in counters.values_mut() {
            ring[next] = 0;
        }
    }

    /// Zero `key`'s whole ring (manual cool-down)
    pub fn reset(&self, key: &str) {
        if let Some(ring) = self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(key)
        {
            ring.iter_mut().for_each(|slot| *slot = 0);
        }
    }
}

/// Spawn the periodic rotation worker for `detector`
pub fn spawn_rotator(detector: Arc<HotKeyDetector>) -> Worker {
    let interval = detector.config.segment;
    Worker::spawn(move |stop| async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => detector.rotate(),
                _ = stop.notified() => return Ok(()),
            }
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn detector() -> HotKeyDetector {
        HotKeyDetector::new(Config {
            window: Duration::from_secs(60),
            segment: Duration::from_secs(10),
            level_low: 5,
            level_medium: 10,
            level_high: 20,
            ..Default::default()
        })
    }

    #[test]
    fn heat_accumulates_and_levels_map() {
        let d = detector();
        assert_eq!(d.level("k"), Level::None);
        for _ in 0..5 {
            d.record("k");
        }
        assert_eq!(d.heat("k"), 5);
        assert_eq!(d.level("k"), Level::Low);
        for _ in 0..15 {
            d.record("k");
        }
        assert_eq!(d.level("k"), Level::High);
        assert_eq!(
            d.ttl_for(Duration::from_secs(60), "k"),
            Duration::from_secs(180)
        );
        assert_eq!(
            d.ttl_for(Duration::from_secs(60), "cold"),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn a_full_rotation_zeroes_the_window() {
        let d = detector();
        for _ in 0..10 {
            d.record("k");
        }
        // Six segments in a 60s/10s window; a full lap clears every slot
        for _ in 0..6 {
            d.rotate();
        }
        assert_eq!(d.heat("k"), 0);
    }

    #[test]
    fn rotation_only_clears_the_new_slot() {
        let d = detector();
        d.record("k");
        d.rotate(); // hits stay in the old slot
        d.record("k");
        assert_eq!(d.heat("k"), 2);
    }
}
