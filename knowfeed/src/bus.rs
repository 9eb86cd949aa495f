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

//! # bus
//!
//! The message-bus interface: named topics, string payloads, consumer groups with manual offset
//! commit, at-least-once delivery.
//!
//! A [Subscription] delivers the first message past the group's committed offset and keeps
//! *re-delivering it* until the consumer acks-- which is exactly the retry semantics the counter &
//! relation consumers want: process, then ack; fail, don't ack, see the message again. Knowfeed's
//! relation consumers are single-threaded, so one outstanding delivery at a time is the model.
//!
//! [MemoryBus] is a single-process broker over the same interface. A production deployment backs
//! this with a partitioned log (the producer's partition key is accepted & recorded for that
//! purpose; the in-memory log is totally ordered, which is strictly stronger).

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use snafu::{Backtrace, Snafu};
use tokio::sync::Notify;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Bus backend error: {source}"))]
    Backend {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////

/// Where a freshly created consumer group starts reading
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StartAt {
    Earliest,
    Latest,
}

/// One delivered message; `offset` is what the consumer passes back to `ack`
#[derive(Clone, Debug)]
pub struct Delivery {
    pub offset: u64,
    pub payload: String,
}

#[async_trait]
pub trait Subscription: Send {
    /// Wait up to `timeout` for the group's next un-acked message
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Delivery>>;
    /// Commit through `offset`; un-acked messages are re-delivered by the next `poll`
    async fn ack(&mut self, offset: u64) -> Result<()>;
}

#[async_trait]
pub trait Bus: Send + Sync {
    /// Append `payload` to `topic`. `key`, when given, is the partition key; messages sharing a
    /// key are totally ordered with respect to one another.
    async fn publish(&self, topic: &str, key: Option<&str>, payload: &str) -> Result<()>;
    /// Join (or create) consumer group `group` on `topic`
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        start: StartAt,
    ) -> Result<Box<dyn Subscription>>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           MemoryBus                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct TopicState {
    log: Vec<String>,
    committed: HashMap<String, u64>,
}

#[derive(Default)]
struct Topic {
    state: Mutex<TopicState>,
    wakeup: Notify,
}

impl Topic {
    fn guard(&self) -> MutexGuard<'_, TopicState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process [Bus] broker
#[derive(Clone, Default)]
pub struct MemoryBus {
    topics: Arc<Mutex<HashMap<String, Arc<Topic>>>>,
}

impl MemoryBus {
    pub fn new() -> MemoryBus {
        MemoryBus::default()
    }
    fn topic(&self, name: &str) -> Arc<Topic> {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_owned())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, topic: &str, _key: Option<&str>, payload: &str) -> Result<()> {
        let topic = self.topic(topic);
        topic.guard().log.push(payload.to_owned());
        topic.wakeup.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        start: StartAt,
    ) -> Result<Box<dyn Subscription>> {
        let topic = self.topic(topic);
        {
            let mut state = topic.guard();
            if !state.committed.contains_key(group) {
                let at = match start {
                    StartAt::Earliest => 0,
                    StartAt::Latest => state.log.len() as u64,
                };
                state.committed.insert(group.to_owned(), at);
            }
        }
        Ok(Box::new(MemorySubscription {
            topic,
            group: group.to_owned(),
        }))
    }
}

struct MemorySubscription {
    topic: Arc<Topic>,
    group: String,
}

impl MemorySubscription {
    fn first_unacked(&self) -> Option<Delivery> {
        let state = self.topic.guard();
        let committed = state.committed.get(&self.group).copied().unwrap_or(0);
        state.log.get(committed as usize).map(|payload| Delivery {
            offset: committed,
            payload: payload.clone(),
        })
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register for wakeup *before* checking the log; a publish landing in the gap still
            // wakes us (and the deadline bounds any missed notification regardless)
            let notified = self.topic.wakeup.notified();
            tokio::pin!(notified);
            if let Some(delivery) = self.first_unacked() {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&mut self, offset: u64) -> Result<()> {
        let mut state = self.topic.guard();
        let committed = state.committed.entry(self.group.clone()).or_insert(0);
        if *committed == offset {
            *committed = offset + 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn unacked_messages_are_redelivered() {
        let bus = MemoryBus::new();
        let mut sub = bus
            .subscribe("t", "g", StartAt::Latest)
            .await
            .unwrap();
        bus.publish("t", None, "one").await.unwrap();
        bus.publish("t", None, "two").await.unwrap();
        let d1 = sub.poll(Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(d1.payload, "one");
        // No ack: the same message comes around again
        let d2 = sub.poll(Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(d2.payload, "one");
        sub.ack(d2.offset).await.unwrap();
        let d3 = sub.poll(Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(d3.payload, "two");
        sub.ack(d3.offset).await.unwrap();
        assert!(sub.poll(Duration::from_millis(50)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn groups_are_independent_and_earliest_replays() {
        let bus = MemoryBus::new();
        bus.publish("t", None, "old").await.unwrap();
        let mut live = bus.subscribe("t", "live", StartAt::Latest).await.unwrap();
        let mut replay = bus
            .subscribe("t", "replay", StartAt::Earliest)
            .await
            .unwrap();
        assert!(live.poll(Duration::from_millis(50)).await.unwrap().is_none());
        let d = replay
            .poll(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(d.payload, "old");
    }
}
