/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! HTTP/1.1 client protocol pieces
//!
//! - `request`: GET request serialization
//! - `decoder`: incremental response decoder (status line, headers, and
//!   content-length, chunked or close-delimited bodies)
//!
//! The event types here are what a pooled connection reports per request and
//! what a transfer fans out to its subscribers.

pub mod decoder;
pub mod request;

use crate::core::error::FetchError;
use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};

/// Status line and header section of one response
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    /// Reason phrase as sent by the server (may be empty)
    pub reason: String,
    /// Header names are lower-cased
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// Header value as text, if present and visible ASCII
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Protocol event delivered for one request
///
/// A request observes `Response`, any number of `Body` chunks and then
/// exactly one terminal event: `End` or `Error`.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    Response(ResponseHead),
    Body(Bytes),
    End,
    Error(FetchError),
}

impl ResponseEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResponseEvent::End | ResponseEvent::Error(_))
    }
}
