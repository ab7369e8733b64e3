/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use crate::core::error::FetchError;
use crate::network::http::{ResponseEvent, ResponseHead};
use bytes::{Bytes, BytesMut};
use http::StatusCode;
use http::header::LAST_MODIFIED;
use tokio::sync::mpsc::UnboundedReceiver;

/// Receiving end of one subscriber
#[derive(Debug)]
pub struct Subscription {
    url: String,
    events: UnboundedReceiver<ResponseEvent>,
}

/// A response collected in full by a subscriber
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub head: ResponseHead,
    pub body: Bytes,
}

impl FetchedResponse {
    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    pub fn is_not_modified(&self) -> bool {
        self.head.status == StatusCode::NOT_MODIFIED
    }

    /// `Last-Modified` of the response, for the next conditional request
    pub fn last_modified(&self) -> Option<&str> {
        self.head.header(LAST_MODIFIED.as_str())
    }
}

impl Subscription {
    pub(crate) fn new(url: impl Into<String>, events: UnboundedReceiver<ResponseEvent>) -> Self {
        Self {
            url: url.into(),
            events,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Next event; `None` once the transfer has delivered its terminal event
    pub async fn recv(&mut self) -> Option<ResponseEvent> {
        self.events.recv().await
    }

    /// Buffer the whole response, rejecting bodies larger than `size_limit`
    ///
    /// Dropping out early (size limit) unsubscribes; the transfer carries on
    /// for the other subscribers.
    pub async fn collect(mut self, size_limit: usize) -> Result<FetchedResponse, FetchError> {
        let mut head = None;
        let mut body = BytesMut::new();

        while let Some(event) = self.events.recv().await {
            match event {
                ResponseEvent::Response(response) => head = Some(response),
                ResponseEvent::Body(chunk) => {
                    if body.len() + chunk.len() > size_limit {
                        return Err(FetchError::BodyTooLarge { limit: size_limit });
                    }
                    body.extend_from_slice(&chunk);
                }
                ResponseEvent::End => {
                    let head = head.ok_or_else(|| FetchError::protocol("response ended before its head"))?;
                    return Ok(FetchedResponse {
                        head,
                        body: body.freeze(),
                    });
                }
                ResponseEvent::Error(e) => return Err(e),
            }
        }
        Err(FetchError::transport("transfer ended without a result"))
    }
}
