/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use crate::core::error::FetchError;
use crate::network::deferred::Deferred;
use crate::network::dns::{DnsCache, Resolution, ResolveResult};
use crate::network::http::ResponseEvent;
use crate::network::http::request::{RequestOptions, build_get_request};
use crate::network::pool::ConnectionPool;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use url::Url;

/// Where a subscriber receives the events of a transfer
pub type EventSink = UnboundedSender<ResponseEvent>;

/// One logical fetch of one URL, shared by all of its subscribers
///
/// Resolution of the host starts at construction. The request is issued only
/// once the resolution has settled and [`Transfer::go`] was called, in either
/// order, so every subscriber registered before `go` sees the full event
/// sequence.
#[derive(Debug)]
pub struct Transfer {
    url: Url,
    subscribers: Mutex<Vec<EventSink>>,
    go: Deferred<()>,
    /// Resolved when the terminal event is fanned out
    done: Deferred<()>,
}

impl Transfer {
    /// Create the transfer and start resolving its host
    ///
    /// `url` must carry a host. Spawns the transfer task, so it must be
    /// called within a tokio runtime.
    pub(crate) fn start(
        url: Url,
        dns: &DnsCache,
        pool: Arc<ConnectionPool>,
        options: RequestOptions,
    ) -> Arc<Self> {
        let resolution = dns.resolve(url.host_str().unwrap_or_default());
        let transfer = Arc::new(Self {
            url,
            subscribers: Mutex::new(Vec::new()),
            go: Deferred::new(),
            done: Deferred::new(),
        });

        tokio::spawn(transfer.clone().run(resolution, pool, options));
        transfer
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Register a sink for every event from now on
    ///
    /// Sinks added after `go` may miss earlier events.
    pub fn subscribe(&self, sink: EventSink) {
        self.lock_subscribers().push(sink);
    }

    /// Allow the request to be sent
    pub fn go(&self) {
        if self.go.resolve(()) {
            debug!(url = %self.url, "Transfer released");
        }
    }

    /// The terminal event has been fanned out
    pub fn is_finished(&self) -> bool {
        self.done.is_resolved()
    }

    /// Wait until the terminal event has been fanned out
    pub async fn finished(&self) {
        self.done.wait().await
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    async fn run(
        self: Arc<Self>,
        resolution: Resolution,
        pool: Arc<ConnectionPool>,
        options: RequestOptions,
    ) {
        let resolved = resolution.wait().await;
        self.go.wait().await;

        if let Err(e) = self.fetch(resolved, &pool, &options).await {
            warn!(url = %self.url, error = %e, "Transfer failed");
            self.broadcast(ResponseEvent::Error(e));
        }
    }

    /// Send the request and relay its events until the terminal one
    async fn fetch(
        &self,
        resolved: ResolveResult,
        pool: &ConnectionPool,
        options: &RequestOptions,
    ) -> Result<(), FetchError> {
        let addresses = resolved?;
        let addr = *addresses
            .first()
            .ok_or_else(|| FetchError::dns(self.url.host_str().unwrap_or_default(), "no A/AAAA records"))?;

        let request = build_get_request(&self.url, options)?;
        let host = self.url.host_str().unwrap_or_default();
        let port = self.url.port_or_known_default().unwrap_or_default();

        info!(url = %self.url, %addr, subscribers = self.subscriber_count(), "Sending request");
        let mut events = pool.send(self.url.scheme(), host, port, addr, request)?;

        while let Some(event) = events.recv().await {
            let terminal = event.is_terminal();
            self.broadcast(event);
            if terminal {
                return Ok(());
            }
        }
        Err(FetchError::transport("connection task ended without a result"))
    }

    /// Deliver `event` to every live subscriber, dropping the ones that went away
    ///
    /// The transfer counts as finished before the terminal event goes out.
    fn broadcast(&self, event: ResponseEvent) {
        let terminal = event.is_terminal();
        if terminal {
            self.done.resolve(());
        }
        let mut subscribers = self.lock_subscribers();
        subscribers.retain(|sink| sink.send(event.clone()).is_ok());
        if terminal {
            subscribers.clear();
        }
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<EventSink>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
