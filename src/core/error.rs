/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Unified error handling for the harvester
//!
//! Two layers of errors exist:
//! - [`FetchError`] is produced by the fetch engine (DNS cache, connection pool,
//!   transfers). It is cheap to clone because one failure is fanned out to every
//!   subscriber of a transfer.
//! - [`HarvestError`] is the application level error returned by configuration
//!   loading, runtime setup and the crawl driver.

use crate::config::types::ConfigError;
use thiserror::Error;

/// Failure of one fetch, delivered as a terminal event to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Name resolution failed (resolver error or no A/AAAA records)
    #[error("DNS failure for '{host}': {reason}")]
    Dns { host: String, reason: String },

    /// Socket level failure: connect refused/unreachable, reset, premature close
    #[error("transport error: {0}")]
    Transport(String),

    /// The URL scheme has no connector (anything but http/https)
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// The peer violated HTTP/1.1 framing
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The URL could not be parsed or has no host
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The response body exceeded the configured size limit
    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    /// The harvest budget elapsed before the fetch completed
    #[error("timed out")]
    Timeout,
}

impl FetchError {
    /// Create a DNS failure
    pub fn dns<H: Into<String>, S: Into<String>>(host: H, reason: S) -> Self {
        FetchError::Dns {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// Create a transport error
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        FetchError::Transport(msg.into())
    }

    /// Create a protocol violation
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        FetchError::Protocol(msg.into())
    }

    /// Create an invalid URL error
    pub fn invalid_url<U: Into<String>, S: Into<String>>(url: U, reason: S) -> Self {
        FetchError::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for FetchError {
    fn from(e: std::io::Error) -> Self {
        FetchError::Transport(e.to_string())
    }
}

/// Main error type for the harvester application
#[derive(Debug, Error)]
pub enum HarvestError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing failed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yml::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tokio runtime error
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl HarvestError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        HarvestError::Config(msg.into())
    }

    /// Create a runtime error
    pub fn runtime<S: Into<String>>(msg: S) -> Self {
        HarvestError::Runtime(msg.into())
    }
}

impl From<ConfigError> for HarvestError {
    fn from(e: ConfigError) -> Self {
        HarvestError::Config(e.to_string())
    }
}

/// Convenient type alias for Results using HarvestError
pub type Result<T> = std::result::Result<T, HarvestError>;
