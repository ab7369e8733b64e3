/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use crate::core::error::FetchError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{BufMut, Bytes, BytesMut};
use url::Url;

/// Per-request header options
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub user_agent: String,
    /// HTTP-date sent as `If-Modified-Since`
    pub if_modified_since: Option<String>,
}

/// Serialize a keep-alive `GET` for `url`
///
/// Credentials embedded in the URL become a Basic `Authorization` header.
pub fn build_get_request(url: &Url, options: &RequestOptions) -> Result<Bytes, FetchError> {
    let host = url
        .host_str()
        .ok_or_else(|| FetchError::invalid_url(url.as_str(), "missing host"))?;

    let mut target = url.path().to_string();
    if target.is_empty() {
        target.push('/');
    }
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }

    let mut buf = BytesMut::with_capacity(256);
    put_line(&mut buf, &format!("GET {target} HTTP/1.1"));
    match url.port() {
        Some(port) => put_line(&mut buf, &format!("Host: {host}:{port}")),
        None => put_line(&mut buf, &format!("Host: {host}")),
    }
    put_line(&mut buf, "Connection: Keep-Alive");
    put_line(&mut buf, "Accept-Encoding: chunked, identity");
    if !options.user_agent.is_empty() {
        put_line(&mut buf, &format!("User-Agent: {}", options.user_agent));
    }
    if let Some(credentials) = basic_credentials(url) {
        put_line(&mut buf, &format!("Authorization: Basic {credentials}"));
    }
    if let Some(since) = &options.if_modified_since {
        put_line(&mut buf, &format!("If-Modified-Since: {since}"));
    }
    buf.put_slice(b"\r\n");

    Ok(buf.freeze())
}

fn put_line(buf: &mut BytesMut, line: &str) {
    buf.put_slice(line.as_bytes());
    buf.put_slice(b"\r\n");
}

/// `user:password` from the URL, percent-decoded and base64 encoded
fn basic_credentials(url: &Url) -> Option<String> {
    if url.username().is_empty() && url.password().is_none() {
        return None;
    }
    let pair = format!(
        "{}:{}",
        percent_decode(url.username()),
        percent_decode(url.password().unwrap_or_default())
    );
    Some(STANDARD.encode(pair))
}

/// Userinfo is kept percent-encoded by `Url`; reuse the form decoder with `+` protected
fn percent_decode(s: &str) -> String {
    url::form_urlencoded::parse(format!("x={}", s.replace('+', "%2B")).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default()
}
