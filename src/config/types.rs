/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Configuration structure definitions
//!
//! Defines the schema for harvester configuration files (YAML format).

use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("settings.{0} must be greater than zero")]
    ZeroSetting(&'static str),

    #[error("No collections configured")]
    NoCollections,

    #[error("Collection name cannot be empty")]
    EmptyCollectionName,

    #[error("Invalid feed URL '{url}' in collection '{collection}': {reason}")]
    InvalidUrl {
        collection: String,
        url: String,
        reason: String,
    },

    #[error("Invalid nameserver address '{0}' (expected ip:port)")]
    InvalidNameserver(String),
}

/// Main harvester configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging configuration (level, file output)
    #[serde(default)]
    pub log: LogConfig,

    /// Fetch engine and run settings
    #[serde(default)]
    pub settings: Settings,

    /// Named collections of feed URLs
    pub collections: BTreeMap<String, Vec<String>>,
}

impl Config {
    /// Validate configuration
    ///
    /// Checks the log level, numeric settings, the nameserver address and
    /// every feed URL (http/https with a host).
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.log.level.to_lowercase().as_str() {
            "off" | "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(ConfigError::InvalidLogLevel(self.log.level.clone())),
        }

        if self.settings.timeout == 0 {
            return Err(ConfigError::ZeroSetting("timeout"));
        }
        if self.settings.size_limit == 0 {
            return Err(ConfigError::ZeroSetting("size_limit"));
        }
        if self.settings.connect_timeout == 0 {
            return Err(ConfigError::ZeroSetting("connect_timeout"));
        }

        if let Some(nameserver) = &self.settings.nameserver
            && nameserver.parse::<SocketAddr>().is_err()
        {
            return Err(ConfigError::InvalidNameserver(nameserver.clone()));
        }

        if self.collections.is_empty() {
            return Err(ConfigError::NoCollections);
        }

        for (collection, urls) in &self.collections {
            if collection.is_empty() {
                return Err(ConfigError::EmptyCollectionName);
            }
            for url in urls {
                validate_feed_url(url).map_err(|reason| ConfigError::InvalidUrl {
                    collection: collection.clone(),
                    url: url.clone(),
                    reason,
                })?;
            }
        }

        Ok(())
    }

    /// Number of distinct feed URLs over all collections
    pub fn distinct_urls(&self) -> usize {
        let mut urls: Vec<&String> = self.collections.values().flatten().collect();
        urls.sort();
        urls.dedup();
        urls.len()
    }
}

fn validate_feed_url(raw: &str) -> Result<(), String> {
    let url = Url::parse(raw).map_err(|e| e.to_string())?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(format!("unsupported scheme '{other}'")),
    }
    if url.host().is_none() {
        return Err("no host specified".to_string());
    }
    Ok(())
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level: off, trace, debug, info, warn, error
    #[serde(default = "default_level")]
    pub level: String,

    /// Optional file path for log output (in addition to console)
    pub file: Option<String>,
}

impl Default for LogConfig {
    fn default() -> LogConfig {
        LogConfig {
            level: default_level(),
            file: None,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

/// Fetch engine settings
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Wall-clock budget of one harvest run, in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Largest accepted response body, in bytes
    #[serde(default = "default_size_limit")]
    pub size_limit: usize,

    /// Budget for one TCP/TLS connect, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Seconds an idle keep-alive connection stays open
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// Upstream DNS server (`ip:port`); the system resolver is used when absent
    pub nameserver: Option<String>,

    /// Skip TLS certificate verification (**INSECURE**, testing only!)
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// Value of the `User-Agent` request header
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// YAML file keeping each feed's last `Last-Modified`, sent back as
    /// `If-Modified-Since` on the next run; conditional GET is off when absent
    pub state_file: Option<PathBuf>,
}

impl Settings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            timeout: default_timeout(),
            size_limit: default_size_limit(),
            connect_timeout: default_connect_timeout(),
            idle_timeout: default_idle_timeout(),
            nameserver: None,
            insecure_skip_verify: false,
            user_agent: default_user_agent(),
            state_file: None,
        }
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_size_limit() -> usize {
    1024 * 1024
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    10
}

fn default_user_agent() -> String {
    concat!("harvester/", env!("CARGO_PKG_VERSION")).to_string()
}
