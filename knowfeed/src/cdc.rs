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

//! # cdc
//!
//! The change-data-capture bridge: tail the database's change stream, pick out `outbox` row
//! inserts/updates, & republish each row's embedded `payload` JSON onto the `canal-outbox` topic
//! for the downstream consumers. Batches are fetched un-acked and the ack withheld until *every*
//! row in the batch published, so a bus hiccup replays the batch rather than dropping rows--
//! at-least-once end to end, with consumer-side dedup absorbing the duplicates.
//!
//! [ChangeSource] abstracts the binlog subscriber (Canal & friends); [MemoryChangeSource] tails
//! the in-memory backend's outbox table with the same fetch/ack/rollback shape.

use std::{sync::Arc, time::Duration};

use serde::Deserialize;
use serde_json::json;
use snafu::{Backtrace, Snafu};
use tracing::{debug, error, info, warn};

use crate::{
    bus::Bus,
    memory::MemoryBackend,
    worker::Worker,
};

pub const CANAL_OUTBOX_TOPIC: &str = "canal-outbox";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Change source error: {source}"))]
    Source {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub destination: String,
    pub username: String,
    pub password: String,
    /// Subscription filter expression, e.g. `outbox.*`
    pub filter: String,
    #[serde(rename = "batch-size")]
    pub batch_size: usize,
    /// Sleep between polls when the stream is idle
    #[serde(rename = "interval")]
    pub interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_owned(),
            port: 11111,
            destination: "example".to_owned(),
            username: String::new(),
            password: String::new(),
            filter: "outbox.*".to_owned(),
            batch_size: 100,
            interval: Duration::from_millis(500),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          ChangeSource                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChangeEventType {
    Insert,
    Update,
    Other,
}

impl ChangeEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeEventType::Insert => "INSERT",
            ChangeEventType::Update => "UPDATE",
            ChangeEventType::Other => "OTHER",
        }
    }
}

/// One row-level change; `payload` is the value of the row's `payload` column, when present
#[derive(Clone, Debug)]
pub struct ChangeEntry {
    pub table: String,
    pub event: ChangeEventType,
    pub payloads: Vec<String>,
}

/// A batch of changes fetched without ack
#[derive(Clone, Debug)]
pub struct ChangeBatch {
    pub id: i64,
    pub entries: Vec<ChangeEntry>,
}

/// Object-safe abstraction over the binlog subscriber
#[async_trait::async_trait]
pub trait ChangeSource: Send {
    async fn connect(&mut self) -> Result<()>;
    /// Roll back to the last acked position; un-acked batches will be re-fetched
    async fn rollback(&mut self) -> Result<()>;
    /// Fetch up to `batch_size` changes without committing the position; `None` when idle
    async fn get_without_ack(&mut self, batch_size: usize) -> Result<Option<ChangeBatch>>;
    /// Commit through `batch_id`
    async fn ack(&mut self, batch_id: i64) -> Result<()>;
    async fn disconnect(&mut self) -> Result<()>;
}

/// [ChangeSource] over [MemoryBackend]'s outbox table
pub struct MemoryChangeSource {
    backend: MemoryBackend,
    cursor: usize,
    next_batch_id: i64,
    /// (batch id, cursor after that batch) for the outstanding un-acked fetch
    pending: Option<(i64, usize)>,
}

impl MemoryChangeSource {
    pub fn new(backend: MemoryBackend) -> MemoryChangeSource {
        MemoryChangeSource {
            backend,
            cursor: 0,
            next_batch_id: 1,
            pending: None,
        }
    }
}

#[async_trait::async_trait]
impl ChangeSource for MemoryChangeSource {
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }
    async fn rollback(&mut self) -> Result<()> {
        self.pending = None;
        Ok(())
    }
    async fn get_without_ack(&mut self, batch_size: usize) -> Result<Option<ChangeBatch>> {
        // An outstanding un-acked batch is re-delivered verbatim
        let (start, reuse_id) = match self.pending {
            Some((id, _)) => (self.cursor, Some(id)),
            None => (self.cursor, None),
        };
        let (rows, next) = self.backend.outbox_since(start, batch_size);
        if rows.is_empty() {
            return Ok(None);
        }
        let id = reuse_id.unwrap_or_else(|| {
            let id = self.next_batch_id;
            self.next_batch_id += 1;
            id
        });
        self.pending = Some((id, next));
        Ok(Some(ChangeBatch {
            id,
            entries: rows
                .into_iter()
                .map(|row| ChangeEntry {
                    table: "outbox".to_owned(),
                    event: ChangeEventType::Insert,
                    payloads: vec![row.payload],
                })
                .collect(),
        }))
    }
    async fn ack(&mut self, batch_id: i64) -> Result<()> {
        if let Some((id, next)) = self.pending {
            if id == batch_id {
                self.cursor = next;
                self.pending = None;
            }
        }
        Ok(())
    }
    async fn disconnect(&mut self) -> Result<()> {
        self.pending = None;
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        envelope codec                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Extract the embedded payload JSON strings from a `canal-outbox` envelope. Anything that isn't
/// an INSERT/UPDATE on the `outbox` table comes back empty.
pub fn extract_outbox_rows(message: &str) -> Vec<String> {
    let root: serde_json::Value = match serde_json::from_str(message) {
        Ok(v) => v,
        Err(_) => return vec![],
    };
    if root.get("table").and_then(|t| t.as_str()) != Some("outbox") {
        return vec![];
    }
    match root.get("type").and_then(|t| t.as_str()) {
        Some("INSERT") | Some("UPDATE") => (),
        _ => return vec![],
    }
    root.get("data")
        .and_then(|d| d.as_array())
        .map(|rows| {
            rows.iter()
                .filter_map(|row| row.get("payload").and_then(|p| p.as_str()))
                .map(|p| p.to_owned())
                .collect()
        })
        .unwrap_or_default()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          bridge loop                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Spawn the CDC bridge worker
pub fn spawn_cdc_bridge(
    mut source: Box<dyn ChangeSource>,
    bus: Arc<dyn Bus>,
    config: Config,
) -> Worker {
    Worker::spawn(move |stop| async move {
        if !config.enabled {
            info!("CDC bridge disabled; exiting");
            return Ok(());
        }
        info!(
            "CDC bridge connecting to {}:{} dest={} filter={}",
            config.host, config.port, config.destination, config.filter
        );
        if let Err(err) = source.connect().await {
            error!("CDC bridge failed to connect: {err}");
            return Err(crate::worker::Error::new(err));
        }
        // Resume from the last committed position
        if let Err(err) = source.rollback().await {
            error!("CDC bridge failed to roll back: {err}");
            let _ = source.disconnect().await;
            return Err(crate::worker::Error::new(err));
        }
        let result = loop {
            let batch = tokio::select! {
                fetched = source.get_without_ack(config.batch_size) => match fetched {
                    Ok(b) => b,
                    Err(err) => {
                        // The stream is gone; clean up & let the supervisor restart us
                        error!("CDC bridge fetch failed: {err}");
                        break Err(crate::worker::Error::new(err));
                    }
                },
                _ = stop.notified() => break Ok(()),
            };
            let batch = match batch {
                Some(b) => b,
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(config.interval) => continue,
                        _ = stop.notified() => break Ok(()),
                    }
                }
            };
            let mut published_all = true;
            for entry in &batch.entries {
                if !matches!(
                    entry.event,
                    ChangeEventType::Insert | ChangeEventType::Update
                ) {
                    continue;
                }
                let envelope = json!({
                    "table": entry.table,
                    "type": entry.event.as_str(),
                    "data": entry
                        .payloads
                        .iter()
                        .map(|p| json!({ "payload": p }))
                        .collect::<Vec<_>>(),
                })
                .to_string();
                if let Err(err) = bus.publish(CANAL_OUTBOX_TOPIC, None, &envelope).await {
                    warn!("CDC bridge failed to publish an outbox row: {err}");
                    published_all = false;
                    break;
                }
            }
            if published_all {
                if let Err(err) = source.ack(batch.id).await {
                    warn!("CDC bridge failed to ack batch {}: {err}", batch.id);
                }
            } else {
                // Withhold the ack; the whole batch is re-fetched & re-published. Consumers
                // dedup, so the duplicates are harmless.
                debug!("batch {} left un-acked for replay", batch.id);
                tokio::select! {
                    _ = tokio::time::sleep(config.interval) => (),
                    _ = stop.notified() => break Ok(()),
                }
            }
        };
        if let Err(err) = source.disconnect().await {
            warn!("CDC bridge failed to disconnect: {err}");
        }
        info!("CDC bridge stopped");
        result
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        bus::{MemoryBus, StartAt, Subscription},
        entities::{OutboxRow, UserId},
        storage::Backend,
    };
    use chrono::Utc;

    fn outbox_row(id: i64, payload: &str) -> OutboxRow {
        OutboxRow {
            id,
            aggregate_type: "following".to_owned(),
            aggregate_id: Some(id),
            event_type: "FollowCreated".to_owned(),
            payload: payload.to_owned(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn envelope_extraction() {
        let msg = r#"{"table":"outbox","type":"INSERT","data":[{"payload":"{\"x\":1}"}]}"#;
        assert_eq!(extract_outbox_rows(msg), vec!["{\"x\":1}"]);
        assert!(extract_outbox_rows(r#"{"table":"other","type":"INSERT","data":[]}"#).is_empty());
        assert!(extract_outbox_rows(r#"{"table":"outbox","type":"DELETE","data":[]}"#).is_empty());
        assert!(extract_outbox_rows("not json").is_empty());
    }

    #[tokio::test]
    async fn bridge_republishes_outbox_rows() {
        let backend = crate::memory::MemoryBackend::new();
        let bus = Arc::new(MemoryBus::new());
        let mut sub = bus
            .subscribe(CANAL_OUTBOX_TOPIC, "test", StartAt::Earliest)
            .await
            .unwrap();
        backend
            .insert_following_with_outbox(
                1,
                UserId::new(1),
                UserId::new(2),
                outbox_row(10, r#"{"type":"FollowCreated","fromUserId":1,"toUserId":2,"id":1}"#),
            )
            .await
            .unwrap();
        let config = Config {
            interval: Duration::from_millis(20),
            ..Default::default()
        };
        let bridge = spawn_cdc_bridge(
            Box::new(MemoryChangeSource::new(backend.clone())),
            bus.clone(),
            config,
        );
        let delivery = sub
            .poll(Duration::from_secs(2))
            .await
            .unwrap()
            .expect("bridge should publish the outbox row");
        let rows = extract_outbox_rows(&delivery.payload);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].contains("FollowCreated"));
        sub.ack(delivery.offset).await.unwrap();
        bridge.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn unacked_batches_are_refetched() {
        let backend = crate::memory::MemoryBackend::new();
        backend
            .insert_following_with_outbox(1, UserId::new(1), UserId::new(2), outbox_row(10, "{}"))
            .await
            .unwrap();
        let mut source = MemoryChangeSource::new(backend.clone());
        source.connect().await.unwrap();
        let first = source.get_without_ack(10).await.unwrap().unwrap();
        // Not acked: the same batch comes back
        let again = source.get_without_ack(10).await.unwrap().unwrap();
        assert_eq!(first.id, again.id);
        source.ack(again.id).await.unwrap();
        assert!(source.get_without_ack(10).await.unwrap().is_none());
    }
}
