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

//! # ids
//!
//! Snowflake-style id generation: 41 bits of milliseconds since a custom epoch, 5 bits of
//! datacenter, 5 bits of worker, 12 bits of per-millisecond sequence. Ids are positive, unique
//! per (datacenter, worker), and roughly time-ordered, which is what the relation & outbox rows
//! want out of a primary key.

use std::{
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use snafu::{prelude::*, Backtrace};

/// 2024-01-01T00:00:00Z, in milliseconds since the Unix epoch
const EPOCH_MS: u64 = 1_704_067_200_000;

const WORKER_ID_BITS: u64 = 5;
const DATACENTER_ID_BITS: u64 = 5;
const SEQUENCE_BITS: u64 = 12;

const MAX_WORKER_ID: u64 = (1 << WORKER_ID_BITS) - 1;
const MAX_DATACENTER_ID: u64 = (1 << DATACENTER_ID_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

const WORKER_ID_SHIFT: u64 = SEQUENCE_BITS;
const DATACENTER_ID_SHIFT: u64 = SEQUENCE_BITS + WORKER_ID_BITS;
const TIMESTAMP_SHIFT: u64 = SEQUENCE_BITS + WORKER_ID_BITS + DATACENTER_ID_BITS;

/// Clock regressions larger than this (ms) are refused rather than waited-out
const MAX_BACKWARDS_MS: u64 = 5;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("datacenter id {id} exceeds the maximum of {MAX_DATACENTER_ID}"))]
    DatacenterId { id: u64, backtrace: Backtrace },
    #[snafu(display("worker id {id} exceeds the maximum of {MAX_WORKER_ID}"))]
    WorkerId { id: u64, backtrace: Backtrace },
    #[snafu(display("clock moved backwards by {offset}ms; refusing to generate ids"))]
    ClockRegression { offset: u64, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

struct State {
    last_timestamp: u64,
    sequence: u64,
}

/// Thread-safe Snowflake id generator
pub struct SnowflakeIds {
    datacenter_id: u64,
    worker_id: u64,
    state: Mutex<State>,
}

fn current_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl SnowflakeIds {
    pub fn new(datacenter_id: u64, worker_id: u64) -> Result<SnowflakeIds> {
        ensure!(
            datacenter_id <= MAX_DATACENTER_ID,
            DatacenterIdSnafu { id: datacenter_id }
        );
        ensure!(worker_id <= MAX_WORKER_ID, WorkerIdSnafu { id: worker_id });
        Ok(SnowflakeIds {
            datacenter_id,
            worker_id,
            state: Mutex::new(State {
                last_timestamp: 0,
                sequence: 0,
            }),
        })
    }

    pub fn next_id(&self) -> Result<i64> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut timestamp = current_ms();
        if timestamp < state.last_timestamp {
            // Small regressions (NTP nudges) are waited out; anything larger is refused rather
            // than blocking the caller for an unbounded time.
            let offset = state.last_timestamp - timestamp;
            ensure!(offset <= MAX_BACKWARDS_MS, ClockRegressionSnafu { offset });
            std::thread::sleep(std::time::Duration::from_millis(offset));
            timestamp = current_ms();
            ensure!(
                timestamp >= state.last_timestamp,
                ClockRegressionSnafu { offset }
            );
        }
        if timestamp == state.last_timestamp {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // This millisecond's 4096 slots are spent; spin to the next
                while timestamp <= state.last_timestamp {
                    timestamp = current_ms();
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_timestamp = timestamp;
        Ok((((timestamp - EPOCH_MS) << TIMESTAMP_SHIFT)
            | (self.datacenter_id << DATACENTER_ID_SHIFT)
            | (self.worker_id << WORKER_ID_SHIFT)
            | state.sequence) as i64)
    }
}

impl Default for SnowflakeIds {
    fn default() -> Self {
        SnowflakeIds::new(1, 1).unwrap(/* known good */)
    }
}
