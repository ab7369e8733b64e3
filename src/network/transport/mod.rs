/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Byte-stream establishment for pooled connections
//!
//! A [`Connector`] turns a connection key plus a resolved address into a
//! connected duplex stream: plain TCP for `http`, TCP + TLS for `https`.
//! The pool only sees the stream, so tests substitute in-memory pipes.

use crate::core::error::FetchError;
use crate::network::pool::{ConnectionKey, Scheme};
use crate::network::tls_config::client_config;
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt::Debug;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Duplex byte stream carrying HTTP/1.1
pub trait HttpStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> HttpStream for T {}

pub type BoxedStream = Box<dyn HttpStream>;

#[async_trait]
pub trait Connector: Send + Sync + Debug + 'static {
    /// Connect to `addr` on behalf of `key` (TLS server name is `key.host`)
    async fn connect(&self, key: &ConnectionKey, addr: SocketAddr) -> Result<BoxedStream, FetchError>;
}

/// Real network connector
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    insecure_skip_verify: bool,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration, insecure_skip_verify: bool) -> Self {
        Self {
            connect_timeout,
            insecure_skip_verify,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, key: &ConnectionKey, addr: SocketAddr) -> Result<BoxedStream, FetchError> {
        let tcp = connect_stream(addr, self.connect_timeout).await?;
        match key.scheme {
            Scheme::Http => Ok(Box::new(tcp)),
            Scheme::Https => {
                let tls = connect_tls(tcp, &key.host, self.insecure_skip_verify, self.connect_timeout).await?;
                Ok(Box::new(tls))
            }
        }
    }
}

/// Open a TCP stream with Nagle disabled
async fn connect_stream(addr: SocketAddr, connect_timeout: Duration) -> Result<TcpStream, FetchError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    let _ = socket.set_nonblocking(true);
    let _ = socket.set_tcp_nodelay(true);
    let _ = socket.set_reuse_address(true);

    let socket = TcpSocket::from_std_stream(socket.into());
    match timeout(connect_timeout, socket.connect(addr)).await {
        Ok(Ok(stream)) => {
            debug!(%addr, "TCP connection established");
            Ok(stream)
        }
        Ok(Err(e)) => Err(FetchError::transport(format!("connect to {addr} failed: {e}"))),
        Err(_) => Err(FetchError::transport(format!("connect to {addr} timed out"))),
    }
}

/// Perform the TLS handshake, SNI set to the URL hostname
async fn connect_tls(
    tcp: TcpStream,
    host: &str,
    insecure_skip_verify: bool,
    handshake_timeout: Duration,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, FetchError> {
    let connector = TlsConnector::from(client_config(insecure_skip_verify));
    let name = host.trim_start_matches('[').trim_end_matches(']').to_string();
    let server_name = ServerName::try_from(name)
        .map_err(|_| FetchError::transport(format!("invalid TLS server name '{host}'")))?;

    match timeout(handshake_timeout, connector.connect(server_name, tcp)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(FetchError::transport(format!("TLS handshake with {host} failed: {e}"))),
        Err(_) => Err(FetchError::transport(format!("TLS handshake with {host} timed out"))),
    }
}
