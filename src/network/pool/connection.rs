/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use crate::core::error::FetchError;
use crate::network::http::ResponseEvent;
use crate::network::http::decoder::{CloseOutcome, DecodeEvent, ResponseDecoder};
use crate::network::pool::ConnectionKey;
use crate::network::transport::{BoxedStream, Connector};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::select;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Consecutive closes without a finished response after which the oldest request fails
const MAX_EMPTY_CLOSES: u32 = 3;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// One request waiting for (or receiving) its response
#[derive(Debug)]
pub(crate) struct QueuedRequest {
    bytes: Bytes,
    events: UnboundedSender<ResponseEvent>,
    /// At least one event was delivered, so the request cannot be resent
    answered: bool,
}

impl QueuedRequest {
    pub(crate) fn new(bytes: Bytes, events: UnboundedSender<ResponseEvent>) -> Self {
        Self {
            bytes,
            events,
            answered: false,
        }
    }

    fn deliver(&mut self, event: ResponseEvent) {
        self.answered = true;
        // Receiver dropped means nobody listens any more
        let _ = self.events.send(event);
    }

    pub(crate) fn fail(mut self, error: FetchError) {
        self.deliver(ResponseEvent::Error(error));
    }
}

/// Pool-side handle of a connection; the socket itself is owned by its driver task
#[derive(Debug)]
pub(crate) struct Connection {
    id: u64,
    sender: UnboundedSender<QueuedRequest>,
}

impl Connection {
    pub(crate) fn new(id: u64, sender: UnboundedSender<QueuedRequest>) -> Self {
        Self { id, sender }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Hand a request to the driver; gives it back if the driver has exited
    pub(crate) fn enqueue(&self, request: QueuedRequest) -> Result<(), QueuedRequest> {
        self.sender.send(request).map_err(|e| e.0)
    }
}

/// How a socket session ended
#[derive(Debug)]
enum SessionEnd {
    /// Nothing outstanding for `idle_timeout`
    Idle,
    /// Peer closed, read failed or the stream broke; outstanding requests may be resent
    Closed,
    /// The pool dropped its handle
    Abandoned,
}

/// Background task owning one pooled connection
///
/// Reconnects while requests are outstanding and removes its own pool entry
/// when it retires.
pub(crate) struct ConnectionDriver {
    id: u64,
    key: ConnectionKey,
    addr: SocketAddr,
    connector: Arc<dyn Connector>,
    idle_timeout: Duration,
    receiver: UnboundedReceiver<QueuedRequest>,
    /// Sent and not yet finished, oldest first
    queue: VecDeque<QueuedRequest>,
    connections: Arc<DashMap<ConnectionKey, Arc<Connection>>>,
    empty_closes: u32,
}

impl ConnectionDriver {
    pub(crate) fn new(
        id: u64,
        key: ConnectionKey,
        addr: SocketAddr,
        connector: Arc<dyn Connector>,
        idle_timeout: Duration,
        receiver: UnboundedReceiver<QueuedRequest>,
        connections: Arc<DashMap<ConnectionKey, Arc<Connection>>>,
    ) -> Self {
        Self {
            id,
            key,
            addr,
            connector,
            idle_timeout,
            receiver,
            queue: VecDeque::new(),
            connections,
            empty_closes: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            while let Ok(request) = self.receiver.try_recv() {
                self.queue.push_back(request);
            }
            if self.queue.is_empty() {
                if self.retire() {
                    break;
                }
                continue;
            }

            let stream = match self.connector.connect(&self.key, self.addr).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(conn_id = self.id, key = %self.key, error = %e, "Connection failed");
                    self.fail_all(e);
                    continue;
                }
            };
            info!(conn_id = self.id, key = %self.key, addr = %self.addr, "Connection established");

            match self.session(stream).await {
                SessionEnd::Idle => {
                    debug!(conn_id = self.id, key = %self.key, "Connection idle");
                }
                SessionEnd::Closed => {
                    debug!(
                        conn_id = self.id,
                        key = %self.key,
                        outstanding = self.queue.len(),
                        "Connection closed"
                    );
                }
                SessionEnd::Abandoned => break,
            }
        }

        debug!(conn_id = self.id, key = %self.key, "Connection task exiting");
    }

    /// Serve the queue over one socket until it closes or idles out
    async fn session(&mut self, stream: BoxedStream) -> SessionEnd {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut decoder = ResponseDecoder::new();
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut events = Vec::new();

        // Requests carried over from a previous socket go out first, in order
        let carried: Vec<Bytes> = self.queue.iter().map(|r| r.bytes.clone()).collect();
        for bytes in carried {
            if let Err(e) = write_request(&mut writer, &bytes).await {
                debug!(conn_id = self.id, error = %e, "Resend failed");
                return self.on_close(&mut decoder, e);
            }
        }

        loop {
            let idle = sleep(self.idle_timeout);
            select! {
                request = self.receiver.recv() => {
                    let Some(request) = request else {
                        return SessionEnd::Abandoned;
                    };
                    let result = write_request(&mut writer, &request.bytes).await;
                    self.queue.push_back(request);
                    if let Err(e) = result {
                        return self.on_close(&mut decoder, e);
                    }
                }
                read = reader.read_buf(&mut buf) => {
                    match read {
                        Ok(0) => {
                            return self.on_close(&mut decoder, FetchError::transport("connection closed by peer"));
                        }
                        Ok(_) => {
                            let decoded = decoder.feed(&buf, &mut events);
                            buf.clear();
                            let dispatched = self.dispatch(&mut events);
                            if let Err(e) = decoded.and(dispatched) {
                                warn!(conn_id = self.id, key = %self.key, error = %e, "Dropping connection");
                                if let Some(head) = self.queue.pop_front() {
                                    head.fail(e);
                                }
                                return SessionEnd::Closed;
                            }
                        }
                        Err(e) => {
                            return self.on_close(&mut decoder, e.into());
                        }
                    }
                }
                _ = idle, if self.queue.is_empty() => {
                    return SessionEnd::Idle;
                }
            }
        }
    }

    /// Attribute decoded events to the oldest outstanding request
    fn dispatch(&mut self, events: &mut Vec<DecodeEvent>) -> Result<(), FetchError> {
        for event in events.drain(..) {
            let Some(oldest) = self.queue.front_mut() else {
                return Err(FetchError::protocol("response without an outstanding request"));
            };
            match event {
                DecodeEvent::Head(head) => oldest.deliver(ResponseEvent::Response(head)),
                DecodeEvent::Body(chunk) => oldest.deliver(ResponseEvent::Body(chunk)),
                DecodeEvent::End => {
                    oldest.deliver(ResponseEvent::End);
                    self.queue.pop_front();
                    self.empty_closes = 0;
                }
            }
        }
        Ok(())
    }

    /// The socket is gone: settle the request it was answering
    ///
    /// A close that settles nothing while requests are outstanding counts
    /// towards [`MAX_EMPTY_CLOSES`], whatever bytes arrived before it.
    fn on_close(&mut self, decoder: &mut ResponseDecoder, error: FetchError) -> SessionEnd {
        let settled = match decoder.close() {
            CloseOutcome::Complete => match self.queue.pop_front() {
                Some(mut head) => {
                    head.deliver(ResponseEvent::End);
                    true
                }
                None => false,
            },
            CloseOutcome::Incomplete | CloseOutcome::Idle => {
                if self.queue.front().is_some_and(|head| head.answered)
                    && let Some(head) = self.queue.pop_front()
                {
                    head.fail(error.clone());
                    true
                } else {
                    false
                }
            }
        };

        if settled {
            self.empty_closes = 0;
        } else if !self.queue.is_empty() {
            self.empty_closes += 1;
            if self.empty_closes >= MAX_EMPTY_CLOSES {
                warn!(
                    conn_id = self.id,
                    key = %self.key,
                    attempts = self.empty_closes,
                    "Peer keeps closing before responding, giving up on request"
                );
                self.empty_closes = 0;
                if let Some(head) = self.queue.pop_front() {
                    head.fail(FetchError::transport(format!(
                        "connection closed before response ({error})"
                    )));
                }
            }
        }
        SessionEnd::Closed
    }

    fn fail_all(&mut self, error: FetchError) {
        for request in self.queue.drain(..) {
            request.fail(error.clone());
        }
        while let Ok(request) = self.receiver.try_recv() {
            request.fail(error.clone());
        }
    }

    /// Remove this connection from the pool if nothing more can arrive
    ///
    /// Returns `false` when a request slipped in and the driver must keep going.
    fn retire(&mut self) -> bool {
        let id = self.id;
        let receiver = &self.receiver;
        let removed = self
            .connections
            .remove_if(&self.key, |_, conn| conn.id() == id && receiver.is_empty())
            .is_some();
        if removed {
            debug!(conn_id = id, key = %self.key, "Connection removed from pool");
            return true;
        }
        // Replaced or already gone: nothing will be routed here any more
        !self
            .connections
            .get(&self.key)
            .is_some_and(|conn| conn.id() == id)
    }
}

async fn write_request(writer: &mut WriteHalf<BoxedStream>, bytes: &[u8]) -> Result<(), FetchError> {
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}
