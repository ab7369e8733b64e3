/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Harvest run driver
//!
//! Registers one subscriber per `(collection, url)` entry, releases every
//! transfer at once and collects the responses under a wall-clock budget.
//! Whatever is still outstanding when the budget runs out is reported as
//! timed out and ignored from then on.

pub mod state;

use crate::config::types::Settings;
use crate::core::error::{FetchError, HarvestError, Result};
use crate::network::dns::{DnsCache, build_resolver};
use crate::network::pool::ConnectionPool;
use crate::network::transport::TcpConnector;
use crate::transfer::{FetchedResponse, TransferManager};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use state::LastModified;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tracing::{info, warn};

/// Outcome of one `(collection, url)` entry
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// `200` with the collected body size
    Fetched {
        bytes: usize,
        last_modified: Option<String>,
    },
    NotModified,
    /// Any other final status
    Status(u16),
    /// Fetch error, [`FetchError::Timeout`] when the run budget ran out
    Failed(FetchError),
}

#[derive(Debug, Clone)]
pub struct FeedOutcome {
    pub collection: String,
    pub url: String,
    pub outcome: Outcome,
}

/// Per-entry outcomes of one run
#[derive(Debug, Default)]
pub struct HarvestReport {
    pub outcomes: Vec<FeedOutcome>,
}

impl HarvestReport {
    fn record(&mut self, collection: &str, url: &str, outcome: Outcome) {
        match &outcome {
            Outcome::Fetched { bytes, last_modified } => {
                info!(collection, url, bytes, last_modified = ?last_modified, "OK: {bytes} bytes");
            }
            Outcome::NotModified => info!(collection, url, "Not modified"),
            Outcome::Status(status) => warn!(collection, url, status, "Unexpected status {status}"),
            Outcome::Failed(FetchError::BodyTooLarge { limit }) => {
                warn!(collection, url, limit, "Too big, response exceeds the size limit");
            }
            Outcome::Failed(FetchError::Timeout) => warn!(collection, url, "Timed out"),
            Outcome::Failed(e) => warn!(collection, url, error = %e, "Fetch failed"),
        }
        self.outcomes.push(FeedOutcome {
            collection: collection.to_string(),
            url: url.to_string(),
            outcome,
        });
    }

    pub fn fetched(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Fetched { .. }))
    }

    pub fn not_modified(&self) -> usize {
        self.count(|o| matches!(o, Outcome::NotModified))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| match o {
            Outcome::Status(_) => true,
            Outcome::Failed(e) => *e != FetchError::Timeout,
            _ => false,
        })
    }

    pub fn timed_out(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Failed(FetchError::Timeout)))
    }

    /// `previous` updated with this run's fetches
    ///
    /// A `200` without `Last-Modified` drops the feed's entry.
    pub fn updated_state(&self, previous: &LastModified) -> LastModified {
        let mut state = previous.clone();
        for feed in &self.outcomes {
            if let Outcome::Fetched { last_modified, .. } = &feed.outcome {
                match last_modified {
                    Some(value) => state.insert(feed.url.clone(), value.clone()),
                    None => state.remove(&feed.url),
                };
            }
        }
        state
    }

    fn count(&self, predicate: impl Fn(&Outcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| predicate(&o.outcome)).count()
    }

    /// Outcome of `url` within `collection`
    #[allow(unused)]
    pub fn get(&self, collection: &str, url: &str) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|o| o.collection == collection && o.url == url)
            .map(|o| &o.outcome)
    }
}

/// One harvest over a fixed set of collections
#[derive(Debug)]
pub struct Harvester {
    manager: TransferManager,
    size_limit: usize,
    budget: Duration,
}

impl Harvester {
    pub fn new(manager: TransferManager, size_limit: usize, budget: Duration) -> Self {
        Self {
            manager,
            size_limit,
            budget,
        }
    }

    /// Wire the fetch engine from configuration
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let nameserver = settings
            .nameserver
            .as_deref()
            .map(|ns| {
                ns.parse::<SocketAddr>()
                    .map_err(|e| HarvestError::config(format!("invalid nameserver '{ns}': {e}")))
            })
            .transpose()?;

        let dns = Arc::new(DnsCache::new(build_resolver(nameserver)));
        let connector = Arc::new(TcpConnector::new(
            settings.connect_timeout(),
            settings.insecure_skip_verify,
        ));
        let pool = Arc::new(ConnectionPool::new(connector, settings.idle_timeout()));

        Ok(Self::new(
            TransferManager::new(dns, pool, settings.user_agent.clone()),
            settings.size_limit,
            settings.timeout(),
        ))
    }

    /// Fetch every URL of every collection once
    ///
    /// Feeds with an entry in `last_modified` are fetched conditionally.
    pub async fn run(
        &self,
        collections: &BTreeMap<String, Vec<String>>,
        last_modified: &LastModified,
    ) -> HarvestReport {
        let mut report = HarvestReport::default();
        let mut outstanding: Vec<(String, String)> = Vec::new();
        let mut pending = FuturesUnordered::new();

        for (collection, urls) in collections {
            for url in urls {
                match self.manager.subscribe(url, last_modified.get(url).map(String::as_str)) {
                    Ok(subscription) => {
                        outstanding.push((collection.clone(), url.clone()));
                        let size_limit = self.size_limit;
                        let collection = collection.clone();
                        pending.push(async move {
                            let url = subscription.url().to_string();
                            (collection, url, subscription.collect(size_limit).await)
                        });
                    }
                    Err(e) => report.record(collection, url, Outcome::Failed(e)),
                }
            }
        }

        info!(
            entries = outstanding.len(),
            transfers = self.manager.pending(),
            budget_secs = self.budget.as_secs(),
            "Starting harvest"
        );
        self.manager.go();

        let deadline = tokio::time::sleep(self.budget);
        tokio::pin!(deadline);

        loop {
            select! {
                next = pending.next() => {
                    let Some((collection, url, result)) = next else {
                        break;
                    };
                    if let Some(pos) = outstanding.iter().position(|(c, u)| *c == collection && *u == url) {
                        outstanding.remove(pos);
                    }
                    report.record(&collection, &url, outcome_of(result));
                }
                _ = &mut deadline => {
                    for (collection, url) in outstanding.drain(..) {
                        report.record(&collection, &url, Outcome::Failed(FetchError::Timeout));
                    }
                    break;
                }
            }
        }

        info!(
            fetched = report.fetched(),
            not_modified = report.not_modified(),
            failed = report.failed(),
            timed_out = report.timed_out(),
            "Harvest finished"
        );
        report
    }
}

fn outcome_of(result: std::result::Result<FetchedResponse, FetchError>) -> Outcome {
    match result {
        Ok(response) if response.is_not_modified() => Outcome::NotModified,
        Ok(response) if response.status().as_u16() == 200 => Outcome::Fetched {
            bytes: response.body.len(),
            last_modified: response.last_modified().map(str::to_string),
        },
        Ok(response) => Outcome::Status(response.status().as_u16()),
        Err(e) => Outcome::Failed(e),
    }
}
