/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use crate::core::error::FetchError;
use crate::network::deferred::Deferred;
use crate::network::dns::NameResolver;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Addresses of one hostname, in resolver order
pub type AddressList = Arc<[IpAddr]>;

/// Final outcome of resolving one hostname
pub type ResolveResult = Result<AddressList, FetchError>;

/// A resolution that is pending or already settled
///
/// Cloning shares the same underlying outcome.
#[derive(Debug, Clone)]
pub struct Resolution {
    outcome: Arc<Deferred<ResolveResult>>,
}

impl Resolution {
    fn settled(result: ResolveResult) -> Self {
        Self {
            outcome: Arc::new(Deferred::resolved(result)),
        }
    }

    /// Wait for the outcome (immediate if already settled)
    pub async fn wait(&self) -> ResolveResult {
        self.outcome.wait().await
    }

    /// The outcome if already settled
    pub fn now(&self) -> Option<ResolveResult> {
        self.outcome.peek()
    }
}

/// Process-wide hostname resolution cache
///
/// Every hostname is queried at most once for the lifetime of the cache:
/// concurrent callers attach to the in-flight resolution and later callers
/// are answered from the cached outcome, failures included.
#[derive(Debug)]
pub struct DnsCache {
    resolver: Arc<dyn NameResolver>,
    entries: DashMap<String, Resolution>,
}

impl DnsCache {
    pub fn new(resolver: Arc<dyn NameResolver>) -> Self {
        Self {
            resolver,
            entries: DashMap::new(),
        }
    }

    /// Start (or join) the resolution of `host`
    ///
    /// IP literals, bracketed IPv6 included, settle synchronously without a
    /// query. Must be called within a tokio runtime because a first request
    /// for a hostname spawns the query task.
    pub fn resolve(&self, host: &str) -> Resolution {
        let literal = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if let Ok(ip) = literal.parse::<IpAddr>() {
            return Resolution::settled(Ok(Arc::from([ip])));
        }

        let key = host.to_ascii_lowercase();
        match self.entries.entry(key.clone()) {
            Entry::Occupied(entry) => {
                debug!(host = %key, settled = entry.get().outcome.is_resolved(), "DNS cache hit");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let resolution = Resolution {
                    outcome: Arc::new(Deferred::new()),
                };
                entry.insert(resolution.clone());
                self.spawn_query(key, resolution.outcome.clone());
                resolution
            }
        }
    }

    /// Resolve and wait for the outcome
    #[allow(unused)]
    pub async fn lookup(&self, host: &str) -> ResolveResult {
        self.resolve(host).wait().await
    }

    /// Outcome already cached for `host`, if settled
    #[allow(unused)]
    pub fn cached(&self, host: &str) -> Option<ResolveResult> {
        self.entries
            .get(&host.to_ascii_lowercase())
            .and_then(|entry| entry.now())
    }

    fn spawn_query(&self, host: String, outcome: Arc<Deferred<ResolveResult>>) {
        let resolver = self.resolver.clone();
        debug!(host = %host, "Issuing DNS query");
        tokio::spawn(async move {
            let result = match resolver.lookup(&host).await {
                Ok(ips) if ips.is_empty() => {
                    warn!(host = %host, "No A/AAAA records found");
                    Err(FetchError::dns(&host, "no A/AAAA records"))
                }
                Ok(ips) => {
                    info!(host = %host, addresses = ?ips, "DNS resolution successful");
                    Ok(AddressList::from(ips))
                }
                Err(e) => {
                    warn!(host = %host, error = %e, "DNS resolution failed");
                    Err(e)
                }
            };
            outcome.resolve(result);
        });
    }
}
