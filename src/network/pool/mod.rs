/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Keyed HTTP/1.1 connection pool
//!
//! At most one live connection exists per `(scheme, host, port)`. Requests
//! for the same key are pipelined on that connection and answered in send
//! order; responses are attributed to the oldest outstanding request.
//!
//! # Lifecycle
//! - A connection is opened on the first request for its key
//! - Peer close with requests outstanding: the unanswered requests are
//!   resent on a fresh connection
//! - Idle for `idle_timeout`, or closed while idle: removed from the pool
//! - Connect failure: every request queued on it fails with a transport error

mod connection;

use crate::core::error::FetchError;
use crate::network::http::ResponseEvent;
use crate::network::transport::Connector;
use bytes::Bytes;
use connection::{Connection, ConnectionDriver, QueuedRequest};
use dashmap::DashMap;
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tracing::{debug, warn};

/// Protocols the pool can connect to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn parse(scheme: &str) -> Result<Self, FetchError> {
        match scheme.to_ascii_lowercase().as_str() {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => Err(FetchError::UnsupportedScheme(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Identity of a pooled connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub scheme: Scheme,
    /// Lower-cased URL hostname (also the TLS server name)
    pub host: String,
    pub port: u16,
}

impl Display for ConnectionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

/// Events of one request, in order, ending with `End` or `Error`
pub type ResponseEvents = UnboundedReceiver<ResponseEvent>;

#[derive(Debug)]
pub struct ConnectionPool {
    connections: Arc<DashMap<ConnectionKey, Arc<Connection>>>,
    connector: Arc<dyn Connector>,
    idle_timeout: Duration,
    next_id: AtomicU64,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, idle_timeout: Duration) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            connector,
            idle_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    /// Queue `request` on the connection for `(scheme, host, port)`
    ///
    /// `addr` is only used if a connection has to be opened. Must be called
    /// within a tokio runtime. Fails synchronously only for an unsupported
    /// scheme; everything else is reported through the returned events.
    pub fn send(
        &self,
        scheme: &str,
        host: &str,
        port: u16,
        addr: IpAddr,
        request: Bytes,
    ) -> Result<ResponseEvents, FetchError> {
        let key = ConnectionKey {
            scheme: Scheme::parse(scheme)?,
            host: host.to_ascii_lowercase(),
            port,
        };
        let addr = SocketAddr::new(addr, port);
        let (sender, events) = unbounded_channel();
        let request = QueuedRequest::new(request, sender);

        // Enqueue under the entry lock so a retiring driver cannot miss it
        let mut entry = self
            .connections
            .entry(key.clone())
            .or_insert_with(|| self.open(key.clone(), addr));

        if let Err(request) = entry.enqueue(request) {
            warn!(key = %key, conn_id = entry.id(), "Pooled connection is gone, replacing it");
            let fresh = self.open(key, addr);
            if let Err(request) = fresh.enqueue(request) {
                request.fail(FetchError::transport("connection task unavailable"));
            }
            *entry = fresh;
        }

        Ok(events)
    }

    /// Number of live connections
    #[allow(unused)]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    fn open(&self, key: ConnectionKey, addr: SocketAddr) -> Arc<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = unbounded_channel();
        debug!(key = %key, conn_id = id, %addr, "Opening pooled connection");

        let driver = ConnectionDriver::new(
            id,
            key,
            addr,
            self.connector.clone(),
            self.idle_timeout,
            receiver,
            self.connections.clone(),
        );
        tokio::spawn(driver.run());

        Arc::new(Connection::new(id, sender))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::test_support::{ScriptedConnector, read_requests, response_body};
    use std::net::Ipv4Addr;
    use tokio::io::AsyncWriteExt;
    use tokio::time::{sleep, timeout};

    const LOCAL: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn get(path: &str) -> Bytes {
        Bytes::from(format!(
            "GET {path} HTTP/1.1\r\nHost: feeds.test\r\nConnection: Keep-Alive\r\n\r\n"
        ))
    }

    fn pool(connector: Arc<ScriptedConnector>, idle: Duration) -> ConnectionPool {
        ConnectionPool::new(connector, idle)
    }

    #[tokio::test]
    async fn test_single_request_roundtrip() {
        let (connector, mut servers) = ScriptedConnector::new();
        let pool = pool(connector.clone(), Duration::from_secs(5));

        let events = pool.send("http", "Feeds.Test", 80, LOCAL, get("/a.xml")).unwrap();
        let (key, mut server) = servers.recv().await.unwrap();
        assert_eq!(key.host, "feeds.test");
        assert_eq!(key.scheme, Scheme::Http);

        let requests = read_requests(&mut server, 1).await;
        assert!(requests[0].starts_with("GET /a.xml HTTP/1.1\r\n"));
        server
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();

        let (status, body) = response_body(events).await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, b"hello");
        assert_eq!(connector.connects(), 1);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_requests_are_pipelined_on_one_connection() {
        let (connector, mut servers) = ScriptedConnector::new();
        let pool = pool(connector.clone(), Duration::from_secs(5));

        let first = pool.send("http", "feeds.test", 80, LOCAL, get("/one")).unwrap();
        let second = pool.send("http", "feeds.test", 80, LOCAL, get("/two")).unwrap();

        let (_, mut server) = servers.recv().await.unwrap();
        let requests = read_requests(&mut server, 2).await;
        assert!(requests[0].starts_with("GET /one "));
        assert!(requests[1].starts_with("GET /two "));

        server
            .write_all(
                b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\none\
HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\ntwo\r\n0\r\n\r\n",
            )
            .await
            .unwrap();

        assert_eq!(response_body(first).await.unwrap().1, b"one");
        assert_eq!(response_body(second).await.unwrap().1, b"two");
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_connection_reused_for_later_request() {
        let (connector, mut servers) = ScriptedConnector::new();
        let pool = pool(connector.clone(), Duration::from_secs(5));

        let first = pool.send("http", "feeds.test", 80, LOCAL, get("/one")).unwrap();
        let (_, mut server) = servers.recv().await.unwrap();
        read_requests(&mut server, 1).await;
        server.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
        assert_eq!(response_body(first).await.unwrap().0, 204);

        let second = pool.send("http", "feeds.test", 80, LOCAL, get("/two")).unwrap();
        read_requests(&mut server, 1).await;
        server
            .write_all(b"HTTP/1.1 304 Not Modified\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(response_body(second).await.unwrap().0, 304);
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_get_distinct_connections() {
        let (connector, mut servers) = ScriptedConnector::new();
        let pool = pool(connector.clone(), Duration::from_secs(5));

        let _a = pool.send("http", "feeds.test", 80, LOCAL, get("/")).unwrap();
        let _b = pool.send("https", "feeds.test", 443, LOCAL, get("/")).unwrap();
        let _c = pool.send("http", "feeds.test", 8080, LOCAL, get("/")).unwrap();

        let mut keys = Vec::new();
        for _ in 0..3 {
            keys.push(servers.recv().await.unwrap().0);
        }
        assert_eq!(connector.connects(), 3);
        assert_eq!(pool.len(), 3);
        assert!(keys.iter().any(|k| k.scheme == Scheme::Https && k.port == 443));
    }

    #[tokio::test]
    async fn test_unanswered_requests_resent_after_peer_close() {
        let (connector, mut servers) = ScriptedConnector::new();
        let pool = pool(connector.clone(), Duration::from_secs(5));

        let first = pool.send("http", "feeds.test", 80, LOCAL, get("/one")).unwrap();
        let second = pool.send("http", "feeds.test", 80, LOCAL, get("/two")).unwrap();

        // Answer only the first request, then hang up
        let (_, mut server) = servers.recv().await.unwrap();
        read_requests(&mut server, 2).await;
        server
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\none")
            .await
            .unwrap();
        drop(server);
        assert_eq!(response_body(first).await.unwrap().1, b"one");

        let (_, mut retry) = servers.recv().await.unwrap();
        let requests = read_requests(&mut retry, 1).await;
        assert!(requests[0].starts_with("GET /two "));
        retry
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\ntwo")
            .await
            .unwrap();

        assert_eq!(response_body(second).await.unwrap().1, b"two");
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_close_mid_response_is_transport_error() {
        let (connector, mut servers) = ScriptedConnector::new();
        let pool = pool(connector, Duration::from_secs(5));

        let mut events = pool.send("http", "feeds.test", 80, LOCAL, get("/a")).unwrap();
        let (_, mut server) = servers.recv().await.unwrap();
        read_requests(&mut server, 1).await;
        server
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc")
            .await
            .unwrap();
        drop(server);

        assert!(matches!(events.recv().await, Some(ResponseEvent::Response(_))));
        assert!(matches!(events.recv().await, Some(ResponseEvent::Body(_))));
        assert!(matches!(
            events.recv().await,
            Some(ResponseEvent::Error(FetchError::Transport(_)))
        ));
    }

    #[tokio::test]
    async fn test_close_delimited_body_ends_on_close() {
        let (connector, mut servers) = ScriptedConnector::new();
        let pool = pool(connector, Duration::from_secs(5));

        let events = pool.send("http", "feeds.test", 80, LOCAL, get("/a")).unwrap();
        let (_, mut server) = servers.recv().await.unwrap();
        read_requests(&mut server, 1).await;
        server
            .write_all(b"HTTP/1.0 200 OK\r\n\r\n<rss/>")
            .await
            .unwrap();
        drop(server);

        let (status, body) = response_body(events).await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, b"<rss/>");
    }

    #[tokio::test]
    async fn test_protocol_violation_fails_request() {
        let (connector, mut servers) = ScriptedConnector::new();
        let pool = pool(connector, Duration::from_secs(5));

        let events = pool.send("http", "feeds.test", 80, LOCAL, get("/a")).unwrap();
        let (_, mut server) = servers.recv().await.unwrap();
        read_requests(&mut server, 1).await;
        server.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();

        let err = response_body(events).await.unwrap_err();
        assert!(matches!(err, FetchError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_connect_failure_fails_queued_requests() {
        let (connector, _servers) = ScriptedConnector::new();
        connector.refuse(true);
        let pool = pool(connector, Duration::from_secs(5));

        let first = pool.send("https", "down.test", 443, LOCAL, get("/a")).unwrap();
        let second = pool.send("https", "down.test", 443, LOCAL, get("/b")).unwrap();

        for events in [first, second] {
            let err = timeout(Duration::from_secs(1), response_body(events))
                .await
                .unwrap()
                .unwrap_err();
            assert!(matches!(err, FetchError::Transport(_)));
        }
    }

    #[tokio::test]
    async fn test_repeated_close_before_response_gives_up() {
        let (connector, mut servers) = ScriptedConnector::new();
        let pool = pool(connector.clone(), Duration::from_secs(5));

        let events = pool.send("http", "flaky.test", 80, LOCAL, get("/a")).unwrap();
        for _ in 0..3 {
            let (_, mut server) = servers.recv().await.unwrap();
            read_requests(&mut server, 1).await;
            drop(server);
        }

        let err = timeout(Duration::from_secs(1), response_body(events))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, FetchError::Transport(_)));
        assert_eq!(connector.connects(), 3);
    }

    #[tokio::test]
    async fn test_partial_response_then_close_gives_up() {
        // Neither a truncated head nor an interim 1xx settles the request
        for prefix in [&b"HTTP/1.1 200 OK\r\nContent-"[..], &b"HTTP/1.1 100 Continue\r\n\r\n"[..]] {
            let (connector, mut servers) = ScriptedConnector::new();
            let pool = pool(connector.clone(), Duration::from_secs(5));

            let events = pool.send("http", "flaky.test", 80, LOCAL, get("/a")).unwrap();
            for _ in 0..3 {
                let (_, mut server) = timeout(Duration::from_secs(1), servers.recv())
                    .await
                    .unwrap()
                    .unwrap();
                read_requests(&mut server, 1).await;
                server.write_all(prefix).await.unwrap();
                drop(server);
            }

            let err = timeout(Duration::from_secs(1), response_body(events))
                .await
                .unwrap()
                .unwrap_err();
            assert!(matches!(err, FetchError::Transport(_)));
            sleep(Duration::from_millis(50)).await;
            assert_eq!(connector.connects(), 3);
            assert!(servers.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_all_unanswered_requests_resent_in_order() {
        let (connector, mut servers) = ScriptedConnector::new();
        let pool = pool(connector.clone(), Duration::from_secs(5));

        let first = pool.send("http", "feeds.test", 80, LOCAL, get("/one")).unwrap();
        let second = pool.send("http", "feeds.test", 80, LOCAL, get("/two")).unwrap();

        let (_, mut server) = servers.recv().await.unwrap();
        read_requests(&mut server, 2).await;
        drop(server);

        let (_, mut retry) = servers.recv().await.unwrap();
        let requests = read_requests(&mut retry, 2).await;
        assert!(requests[0].starts_with("GET /one "));
        assert!(requests[1].starts_with("GET /two "));
        retry
            .write_all(
                b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\none\
HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\ntwo",
            )
            .await
            .unwrap();

        assert_eq!(response_body(first).await.unwrap().1, b"one");
        assert_eq!(response_body(second).await.unwrap().1, b"two");
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_pipelined_responses_split_across_reads() {
        let (connector, mut servers) = ScriptedConnector::new();
        let pool = pool(connector, Duration::from_secs(5));

        let first = pool.send("http", "feeds.test", 80, LOCAL, get("/one")).unwrap();
        let mut second = pool.send("http", "feeds.test", 80, LOCAL, get("/two")).unwrap();

        let (_, mut server) = servers.recv().await.unwrap();
        read_requests(&mut server, 2).await;

        let one: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\none\r\n0\r\n\r\n";
        let two: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\ntwo";
        let wire = [one, two].concat();
        let (head, tail) = wire.split_at(one.len() + 10);

        for piece in head.chunks(4) {
            server.write_all(piece).await.unwrap();
            tokio::task::yield_now().await;
        }
        // The first response ends while the second head is still incomplete
        let (status, body) = timeout(Duration::from_secs(1), response_body(first))
            .await
            .unwrap()
            .unwrap();
        assert_eq!((status, body.as_slice()), (200, &b"one"[..]));
        assert!(second.try_recv().is_err());

        for piece in tail.chunks(4) {
            server.write_all(piece).await.unwrap();
            tokio::task::yield_now().await;
        }
        assert!(matches!(second.recv().await, Some(ResponseEvent::Response(h)) if h.status == 200));
        let (_, body) = response_body(second).await.unwrap();
        assert_eq!(body, b"two");
    }

    #[tokio::test]
    async fn test_unsupported_scheme_rejected() {
        let (connector, _servers) = ScriptedConnector::new();
        let pool = pool(connector.clone(), Duration::from_secs(5));

        let err = pool.send("ftp", "feeds.test", 21, LOCAL, get("/")).unwrap_err();
        assert_eq!(err, FetchError::UnsupportedScheme("ftp".to_string()));
        assert_eq!(connector.connects(), 0);
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn test_idle_connection_is_removed() {
        let (connector, mut servers) = ScriptedConnector::new();
        let pool = pool(connector.clone(), Duration::from_millis(50));

        let events = pool.send("http", "feeds.test", 80, LOCAL, get("/a")).unwrap();
        let (_, mut server) = servers.recv().await.unwrap();
        read_requests(&mut server, 1).await;
        server
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        response_body(events).await.unwrap();

        timeout(Duration::from_secs(2), async {
            while pool.len() > 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // A later request opens a new connection
        let _events = pool.send("http", "feeds.test", 80, LOCAL, get("/b")).unwrap();
        servers.recv().await.unwrap();
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_close_while_idle_removes_connection() {
        let (connector, mut servers) = ScriptedConnector::new();
        let pool = pool(connector, Duration::from_secs(30));

        let events = pool.send("http", "feeds.test", 80, LOCAL, get("/a")).unwrap();
        let (_, mut server) = servers.recv().await.unwrap();
        read_requests(&mut server, 1).await;
        server
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
        response_body(events).await.unwrap();
        drop(server);

        timeout(Duration::from_secs(2), async {
            while pool.len() > 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
