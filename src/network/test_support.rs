/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! In-memory doubles for the network seams, shared by unit tests

use crate::core::error::FetchError;
use crate::network::dns::NameResolver;
use crate::network::http::ResponseEvent;
use crate::network::pool::ConnectionKey;
use crate::network::transport::{BoxedStream, Connector};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, DuplexStream, duplex};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::time::timeout;

/// Connector handing the server half of an in-memory pipe to the test
#[derive(Debug)]
pub(crate) struct ScriptedConnector {
    servers: UnboundedSender<(ConnectionKey, DuplexStream)>,
    connects: AtomicUsize,
    refuse: AtomicBool,
}

impl ScriptedConnector {
    pub(crate) fn new() -> (Arc<Self>, UnboundedReceiver<(ConnectionKey, DuplexStream)>) {
        let (servers, accepted) = unbounded_channel();
        let connector = Arc::new(Self {
            servers,
            connects: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
        });
        (connector, accepted)
    }

    /// Successful connects so far
    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, key: &ConnectionKey, _addr: SocketAddr) -> Result<BoxedStream, FetchError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(FetchError::transport("connection refused"));
        }
        let (client, server) = duplex(64 * 1024);
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.servers
            .send((key.clone(), server))
            .map_err(|_| FetchError::transport("test server gone"))?;
        Ok(Box::new(client))
    }
}

/// Resolver answering from a fixed table and counting queries
#[derive(Debug, Default)]
pub(crate) struct StaticResolver {
    table: HashMap<String, Vec<IpAddr>>,
    queries: AtomicUsize,
}

impl StaticResolver {
    pub(crate) fn new(entries: &[(&str, &str)]) -> Arc<Self> {
        let mut table: HashMap<String, Vec<IpAddr>> = HashMap::new();
        for (host, ip) in entries {
            table
                .entry(host.to_string())
                .or_default()
                .push(ip.parse().expect("test address"));
        }
        Arc::new(Self {
            table,
            queries: AtomicUsize::new(0),
        })
    }

    pub(crate) fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NameResolver for StaticResolver {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, FetchError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.table
            .get(host)
            .cloned()
            .ok_or_else(|| FetchError::dns(host, "NXDOMAIN"))
    }
}

/// Read from `server` until `count` complete request heads have arrived
pub(crate) async fn read_requests(server: &mut DuplexStream, count: usize) -> Vec<String> {
    let mut raw = Vec::new();
    let mut chunk = [0u8; 4096];
    timeout(Duration::from_secs(2), async {
        while String::from_utf8_lossy(&raw).matches("\r\n\r\n").count() < count {
            let n = server.read(&mut chunk).await.expect("read request");
            assert!(n > 0, "client closed before sending {count} requests");
            raw.extend_from_slice(&chunk[..n]);
        }
    })
    .await
    .expect("requests not received in time");

    String::from_utf8_lossy(&raw)
        .split_inclusive("\r\n\r\n")
        .map(str::to_string)
        .collect()
}

/// Drain one request's events into `(status, body)` or its terminal error
pub(crate) async fn response_body(
    mut events: UnboundedReceiver<ResponseEvent>,
) -> Result<(u16, Vec<u8>), FetchError> {
    let mut status = 0;
    let mut body = Vec::new();
    while let Some(event) = events.recv().await {
        match event {
            ResponseEvent::Response(head) => status = head.status.as_u16(),
            ResponseEvent::Body(chunk) => body.extend_from_slice(&chunk),
            ResponseEvent::End => return Ok((status, body)),
            ResponseEvent::Error(e) => return Err(e),
        }
    }
    Err(FetchError::transport("event stream ended without a terminal event"))
}
