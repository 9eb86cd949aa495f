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

//! # worker
//!
//! knowfeed runs a handful of long-lived background loops: the CDC bridge, the bus consumers, the
//! aggregation flusher, the hot-key rotator. They all share a lifecycle-- spawn a task, loop until
//! told to stop, release resources, return-- so this module provides the one handle type they all
//! hand back: a [JoinHandle] paired with a [Notify] the loop selects on. `shutdown()` consumes the
//! handle & resolves to the loop's result.

use std::{future::Future, pin::Pin, sync::Arc, task::Poll, time::Duration};

use snafu::{prelude::*, Backtrace};
use tokio::{
    sync::Notify,
    task::{JoinError, JoinHandle},
};

#[derive(Debug, Snafu)]
pub enum Error {
    // Generic error variant the worker loops can wrap their own failures in
    #[snafu(display("{source}"))]
    Worker {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    #[snafu(display("Worker failed to run to completion: {source}"))]
    Join {
        source: JoinError,
        backtrace: Backtrace,
    },
    #[snafu(display("Timeout shutting down a worker: {source}"))]
    ShutdownTimeout {
        source: tokio::time::error::Elapsed,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Worker {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Handle on a long-lived background loop
///
/// Hold one of these for as long as the loop should run; call [shutdown](Worker::shutdown) to
/// signal it & collect its result. The handle is also a [Future] resolving when the loop exits on
/// its own (convenient in a `tokio::select!`).
pub struct Worker {
    handle: JoinHandle<Result<()>>,
    stop: Arc<Notify>,
}

impl Worker {
    /// Spawn `f(stop)` as the loop body; `f` must exit promptly once `stop` is notified
    pub fn spawn<F, Fut>(f: F) -> Worker
    where
        F: FnOnce(Arc<Notify>) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let stop = Arc::new(Notify::new());
        let handle = tokio::spawn(f(stop.clone()));
        Worker { handle, stop }
    }
    /// Signal the loop to stop & wait up to `timeout` for it to exit
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        self.stop.notify_one();
        tokio::time::timeout(timeout, self.handle)
            .await
            .context(ShutdownTimeoutSnafu)?
            .context(JoinSnafu)?
    }
}

impl Future for Worker {
    type Output = std::result::Result<Result<()>, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn shutdown_is_prompt() {
        let worker = Worker::spawn(|stop| async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(10)) => (),
                    _ = stop.notified() => return Ok(()),
                }
            }
        });
        worker.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}
