/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Name resolution backends for the DNS cache
//!
//! - [`SystemResolver`]: the operating system resolver (getaddrinfo via tokio)
//! - [`NameserverResolver`]: direct A + AAAA queries against one upstream
//!   nameserver over UDP, wire format handled by hickory

use crate::core::error::FetchError;
use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use rand::random;
use std::fmt::Debug;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, warn};

/// One name query, issued by the DNS cache at most once per hostname
#[async_trait]
pub trait NameResolver: Send + Sync + Debug + 'static {
    /// Resolve `host` to its A/AAAA addresses
    ///
    /// An empty list is a valid answer here; the cache turns it into a failure.
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, FetchError>;
}

/// Resolver backed by the operating system (respects /etc/hosts and resolv.conf)
#[derive(Debug, Default)]
pub struct SystemResolver;

#[async_trait]
impl NameResolver for SystemResolver {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, FetchError> {
        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| FetchError::dns(host, e.to_string()))?;

        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in addrs {
            if !ips.contains(&addr.ip()) {
                ips.push(addr.ip());
            }
        }
        Ok(ips)
    }
}

/// Resolver that queries a single upstream nameserver directly
#[derive(Debug)]
pub struct NameserverResolver {
    server: SocketAddr,
    timeout: Duration,
}

impl NameserverResolver {
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
    const MAX_DATAGRAM: usize = 4096;

    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    #[allow(unused)]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send one query for `record_type` and collect the matching addresses
    async fn query(&self, name: &Name, record_type: RecordType) -> Result<Vec<IpAddr>, String> {
        let request = build_query(name.clone(), record_type);
        let bytes = request
            .to_bytes()
            .map_err(|e| format!("failed to serialize query: {e}"))?;

        let bind_addr: SocketAddr = if self.server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| format!("failed to bind UDP socket: {e}"))?;
        socket
            .connect(self.server)
            .await
            .map_err(|e| format!("failed to connect UDP socket: {e}"))?;
        socket
            .send(&bytes)
            .await
            .map_err(|e| format!("failed to send query: {e}"))?;

        let mut buf = vec![0u8; Self::MAX_DATAGRAM];
        let response = timeout(self.timeout, async {
            loop {
                let len = socket
                    .recv(&mut buf)
                    .await
                    .map_err(|e| format!("failed to receive answer: {e}"))?;
                match Message::from_bytes(&buf[..len]) {
                    Ok(msg) if msg.id() == request.id() => return Ok::<Message, String>(msg),
                    Ok(msg) => {
                        debug!(
                            expected = request.id(),
                            received = msg.id(),
                            "Discarded DNS answer with mismatched id"
                        );
                    }
                    Err(e) => {
                        debug!(error = %e, "Discarded malformed DNS answer");
                    }
                }
            }
        })
        .await
        .map_err(|_| format!("{record_type} query timed out"))??;

        match response.response_code() {
            ResponseCode::NoError => {}
            code => return Err(format!("{record_type} query answered {code}")),
        }

        Ok(response
            .answers()
            .iter()
            .filter(|answer| answer.record_type() == record_type)
            .filter_map(|answer| answer.data().ip_addr())
            .collect())
    }
}

#[async_trait]
impl NameResolver for NameserverResolver {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, FetchError> {
        let mut name = Name::from_str(host).map_err(|e| FetchError::dns(host, e.to_string()))?;
        name.set_fqdn(true);

        let (v4, v6) = futures::join!(
            self.query(&name, RecordType::A),
            self.query(&name, RecordType::AAAA)
        );

        match (v4, v6) {
            (Err(e4), Err(e6)) => {
                warn!(host, server = %self.server, a = %e4, aaaa = %e6, "Nameserver lookup failed");
                Err(FetchError::dns(host, e4))
            }
            (v4, v6) => {
                let mut ips = v4.unwrap_or_default();
                ips.extend(v6.unwrap_or_default());
                Ok(ips)
            }
        }
    }
}

/// Build a recursive query message with a random id
fn build_query(name: Name, record_type: RecordType) -> Message {
    let mut message = Message::new();
    message.set_id(random());
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(name, record_type));
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{RData, Record};

    /// Answer every query from `socket` once with a fixed A record
    async fn answer_once(socket: UdpSocket, ip: Ipv4Addr) {
        let mut buf = vec![0u8; 512];
        for _ in 0..2 {
            let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
            let request = Message::from_bytes(&buf[..len]).unwrap();
            let query = request.queries()[0].clone();

            let mut response = Message::new();
            response.set_id(request.id());
            response.set_message_type(MessageType::Response);
            response.set_op_code(OpCode::Query);
            if query.query_type() == RecordType::A {
                response.add_answer(Record::from_rdata(
                    query.name().clone(),
                    60,
                    RData::A(A(ip)),
                ));
            }
            response.add_query(query);
            socket
                .send_to(&response.to_bytes().unwrap(), peer)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_nameserver_lookup_collects_a_records() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(answer_once(server, Ipv4Addr::new(192, 0, 2, 7)));

        let resolver = NameserverResolver::new(server_addr).with_timeout(Duration::from_secs(2));
        let ips = resolver.lookup("feeds.example.test").await.unwrap();
        assert_eq!(ips, vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7))]);
    }

    #[tokio::test]
    async fn test_nameserver_lookup_times_out() {
        // Bound but never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let resolver = NameserverResolver::new(silent.local_addr().unwrap())
            .with_timeout(Duration::from_millis(100));
        let err = resolver.lookup("feeds.example.test").await.unwrap_err();
        assert!(matches!(err, FetchError::Dns { .. }));
    }

    #[tokio::test]
    async fn test_system_resolver_localhost() {
        let ips = SystemResolver.lookup("localhost").await.unwrap();
        assert!(ips.iter().all(|ip| ip.is_loopback()));
    }
}
