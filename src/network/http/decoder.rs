/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Incremental HTTP/1.1 response decoder
//!
//! Bytes are fed as they arrive from the socket, in buffers of any size. The
//! decoder keeps a growable buffer plus an explicit state, and emits events
//! in wire order:
//!
//! ```text
//! Head -> Fixed(remaining)                     -> Head
//!      -> ChunkSize <-> ChunkData -> ChunkEnd
//!         ChunkSize(0) -> Trailer              -> Head
//!      -> CloseDelimited (until the transport closes)
//! ```
//!
//! Several responses may follow each other in one buffer (pipelining).

use crate::core::error::FetchError;
use crate::network::http::ResponseHead;
use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Version};
use tracing::debug;

/// Largest accepted status line plus header section
const MAX_HEAD_BYTES: usize = 64 * 1024;
/// Largest accepted chunk-size line (size plus extensions)
const MAX_CHUNK_LINE: usize = 1024;
/// Trailer section bounds
const MAX_TRAILER_LINES: usize = 64;
const MAX_TRAILER_BYTES: usize = 16 * 1024;

/// Output of the decoder, attributed by the caller to the oldest outstanding request
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeEvent {
    Head(ResponseHead),
    Body(Bytes),
    End,
}

/// What a transport close means for the response being decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Between responses; nothing was cut off
    Idle,
    /// Close-delimited body: the close is its end
    Complete,
    /// A response was cut off before its end
    Incomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Fixed { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkEnd,
    Trailer { lines: usize, bytes: usize },
    CloseDelimited,
}

#[derive(Debug)]
pub struct ResponseDecoder {
    state: State,
    buf: BytesMut,
    /// Status line parsed, headers still accumulating
    head: Option<ResponseHead>,
    head_bytes: usize,
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Head,
            buf: BytesMut::with_capacity(8192),
            head: None,
            head_bytes: 0,
        }
    }

    /// Feed newly received bytes
    ///
    /// Events decoded before a protocol violation are still pushed to `events`;
    /// after an error the decoder must be discarded.
    pub fn feed(&mut self, data: &[u8], events: &mut Vec<DecodeEvent>) -> Result<(), FetchError> {
        self.buf.extend_from_slice(data);

        loop {
            let progressed = match self.state {
                State::Head => self.decode_head(events)?,
                State::Fixed { remaining } => {
                    match self.take_body(remaining, events) {
                        None => false,
                        Some(0) => {
                            events.push(DecodeEvent::End);
                            self.state = State::Head;
                            true
                        }
                        Some(remaining) => {
                            self.state = State::Fixed { remaining };
                            true
                        }
                    }
                }
                State::ChunkSize => self.decode_chunk_size()?,
                State::ChunkData { remaining } => match self.take_body(remaining, events) {
                    None => false,
                    Some(0) => {
                        self.state = State::ChunkEnd;
                        true
                    }
                    Some(remaining) => {
                        self.state = State::ChunkData { remaining };
                        true
                    }
                },
                State::ChunkEnd => self.decode_chunk_end()?,
                State::Trailer { lines, bytes } => self.decode_trailer(lines, bytes, events)?,
                State::CloseDelimited => {
                    if self.buf.is_empty() {
                        false
                    } else {
                        events.push(DecodeEvent::Body(self.buf.split().freeze()));
                        true
                    }
                }
            };

            if !progressed {
                return Ok(());
            }
        }
    }

    /// The transport closed: classify the response in progress
    pub fn close(&mut self) -> CloseOutcome {
        match self.state {
            State::CloseDelimited => {
                self.state = State::Head;
                CloseOutcome::Complete
            }
            State::Head if self.head.is_none() && self.buf.iter().all(|b| b.is_ascii_whitespace()) => {
                CloseOutcome::Idle
            }
            _ => CloseOutcome::Incomplete,
        }
    }

    /// True while a response head has been emitted but its end has not
    pub fn in_body(&self) -> bool {
        self.state != State::Head
    }

    fn decode_head(&mut self, events: &mut Vec<DecodeEvent>) -> Result<bool, FetchError> {
        loop {
            let Some(line) = take_line(&mut self.buf) else {
                if self.head_bytes + self.buf.len() > MAX_HEAD_BYTES {
                    return Err(FetchError::protocol(format!(
                        "response header section exceeds {MAX_HEAD_BYTES} bytes"
                    )));
                }
                return Ok(false);
            };

            self.head_bytes += line.len() + 2;
            if self.head_bytes > MAX_HEAD_BYTES {
                return Err(FetchError::protocol(format!(
                    "response header section exceeds {MAX_HEAD_BYTES} bytes"
                )));
            }

            if self.head.is_none() {
                // Stray blank lines between responses are tolerated
                if !line.is_empty() {
                    self.head = Some(parse_status_line(&line)?);
                }
                continue;
            }

            if line.is_empty() {
                self.head_bytes = 0;
                if let Some(head) = self.head.take() {
                    self.begin_body(head, events)?;
                }
                return Ok(true);
            }

            if let Some(head) = self.head.as_mut() {
                parse_header_line(&line, &mut head.headers);
            }
        }
    }

    /// Decide the body framing of a complete head
    fn begin_body(&mut self, head: ResponseHead, events: &mut Vec<DecodeEvent>) -> Result<(), FetchError> {
        let status = head.status;
        if status.is_informational() {
            debug!(status = status.as_u16(), "Skipping interim response");
            return Ok(());
        }

        if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
            events.push(DecodeEvent::Head(head));
            events.push(DecodeEvent::End);
            return Ok(());
        }

        let next = if is_chunked(&head.headers) {
            State::ChunkSize
        } else if let Some(length) = content_length(&head.headers)? {
            State::Fixed { remaining: length }
        } else {
            State::CloseDelimited
        };

        events.push(DecodeEvent::Head(head));
        match next {
            State::Fixed { remaining: 0 } => events.push(DecodeEvent::End),
            next => self.state = next,
        }
        Ok(())
    }

    /// Emit up to `remaining` buffered body bytes; `None` when nothing is buffered
    fn take_body(&mut self, remaining: u64, events: &mut Vec<DecodeEvent>) -> Option<u64> {
        if self.buf.is_empty() {
            return None;
        }
        let n = usize::try_from(remaining).map_or(self.buf.len(), |r| r.min(self.buf.len()));
        events.push(DecodeEvent::Body(self.buf.split_to(n).freeze()));
        Some(remaining - n as u64)
    }

    fn decode_chunk_size(&mut self) -> Result<bool, FetchError> {
        let Some(line) = take_line(&mut self.buf) else {
            if self.buf.len() > MAX_CHUNK_LINE {
                return Err(FetchError::protocol("chunk-size line too long"));
            }
            return Ok(false);
        };
        if line.len() > MAX_CHUNK_LINE {
            return Err(FetchError::protocol("chunk-size line too long"));
        }

        let text = String::from_utf8_lossy(&line);
        let size_text = text.split(';').next().unwrap_or_default().trim();
        if size_text.is_empty() || !size_text.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(FetchError::protocol(format!("invalid chunk size '{text}'")));
        }
        let size = u64::from_str_radix(size_text, 16)
            .map_err(|_| FetchError::protocol(format!("chunk size out of range '{text}'")))?;

        self.state = if size == 0 {
            State::Trailer { lines: 0, bytes: 0 }
        } else {
            State::ChunkData { remaining: size }
        };
        Ok(true)
    }

    /// Consume the line break that must follow chunk data
    fn decode_chunk_end(&mut self) -> Result<bool, FetchError> {
        let consumed = match self.buf.first() {
            None => return Ok(false),
            Some(b'\n') => 1,
            Some(b'\r') => match self.buf.get(1) {
                None => return Ok(false),
                Some(b'\n') => 2,
                Some(_) => return Err(FetchError::protocol("missing CRLF after chunk data")),
            },
            Some(_) => return Err(FetchError::protocol("missing CRLF after chunk data")),
        };
        let _ = self.buf.split_to(consumed);
        self.state = State::ChunkSize;
        Ok(true)
    }

    /// Trailer lines after the last chunk are read and dropped
    fn decode_trailer(
        &mut self,
        lines: usize,
        bytes: usize,
        events: &mut Vec<DecodeEvent>,
    ) -> Result<bool, FetchError> {
        let Some(line) = take_line(&mut self.buf) else {
            if bytes + self.buf.len() > MAX_TRAILER_BYTES {
                return Err(FetchError::protocol("trailer section too large"));
            }
            return Ok(false);
        };

        if line.is_empty() {
            events.push(DecodeEvent::End);
            self.state = State::Head;
            return Ok(true);
        }

        let (lines, bytes) = (lines + 1, bytes + line.len());
        if lines > MAX_TRAILER_LINES || bytes > MAX_TRAILER_BYTES {
            return Err(FetchError::protocol("trailer section too large"));
        }
        self.state = State::Trailer { lines, bytes };
        Ok(true)
    }
}

/// Split one line off the buffer, without its LF or CRLF terminator
fn take_line(buf: &mut BytesMut) -> Option<Bytes> {
    let pos = buf.iter().position(|&b| b == b'\n')?;
    let mut line = buf.split_to(pos + 1);
    line.truncate(pos);
    if line.last() == Some(&b'\r') {
        line.truncate(pos - 1);
    }
    Some(line.freeze())
}

/// `HTTP-version SP status-code SP reason-phrase`
fn parse_status_line(line: &[u8]) -> Result<ResponseHead, FetchError> {
    let text = String::from_utf8_lossy(line);
    let malformed = || FetchError::protocol(format!("malformed status line '{text}'"));

    let mut parts = text.splitn(3, ' ');
    let version = match parts.next() {
        Some("HTTP/1.1") => Version::HTTP_11,
        Some("HTTP/1.0") => Version::HTTP_10,
        _ => return Err(malformed()),
    };
    let status = parts
        .next()
        .filter(|code| code.len() == 3)
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(malformed)?;
    let reason = parts.next().unwrap_or_default().trim().to_string();

    Ok(ResponseHead {
        version,
        status,
        reason,
        headers: HeaderMap::new(),
    })
}

/// `Name: Value`; the name is normalized to lower case
fn parse_header_line(line: &[u8], headers: &mut HeaderMap) {
    let Some(colon) = line.iter().position(|&b| b == b':') else {
        debug!(line = %String::from_utf8_lossy(line), "Skipped header line without colon");
        return;
    };
    let name = line[..colon].trim_ascii();
    let value = line[colon + 1..].trim_ascii();

    match (HeaderName::from_bytes(name), HeaderValue::from_bytes(value)) {
        (Ok(name), Ok(value)) => {
            headers.append(name, value);
        }
        _ => debug!(line = %String::from_utf8_lossy(line), "Skipped invalid header line"),
    }
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>, FetchError> {
    let Some(value) = headers.get(CONTENT_LENGTH) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| FetchError::protocol(format!("invalid Content-Length {value:?}")))
}
