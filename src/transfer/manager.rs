/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use crate::core::error::FetchError;
use crate::network::dns::DnsCache;
use crate::network::http::request::RequestOptions;
use crate::network::pool::ConnectionPool;
use crate::transfer::subscription::Subscription;
use crate::transfer::transfer::{EventSink, Transfer};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tokio::sync::mpsc::unbounded_channel;
use tracing::debug;
use url::Url;

/// Registry guaranteeing one in-flight transfer per URL
///
/// A transfer leaves the registry once its terminal event has been fanned out.
#[derive(Debug)]
pub struct TransferManager {
    transfers: Arc<DashMap<String, Arc<Transfer>>>,
    dns: Arc<DnsCache>,
    pool: Arc<ConnectionPool>,
    user_agent: String,
}

impl TransferManager {
    pub fn new(dns: Arc<DnsCache>, pool: Arc<ConnectionPool>, user_agent: impl Into<String>) -> Self {
        Self {
            transfers: Arc::new(DashMap::new()),
            dns,
            pool,
            user_agent: user_agent.into(),
        }
    }

    /// Subscribe `sink` to the transfer of `url`, creating the transfer if needed
    ///
    /// `if_modified_since` only applies when this call creates the transfer;
    /// joining a live one keeps the request it already has.
    pub fn get(
        &self,
        url: &str,
        if_modified_since: Option<&str>,
        sink: EventSink,
    ) -> Result<Arc<Transfer>, FetchError> {
        let parsed = Url::parse(url).map_err(|e| FetchError::invalid_url(url, e.to_string()))?;
        if parsed.host_str().is_none_or(str::is_empty) {
            return Err(FetchError::invalid_url(url, "missing host"));
        }

        let transfer = match self.transfers.entry(parsed.as_str().to_string()) {
            // Finished but not yet removed by its watcher
            Entry::Occupied(mut entry) if entry.get().is_finished() => {
                debug!(url = %parsed, "Replacing finished transfer");
                let transfer = self.create(parsed, if_modified_since);
                entry.insert(transfer.clone());
                transfer
            }
            Entry::Occupied(entry) => {
                debug!(url = %parsed, "Joining existing transfer");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let transfer = self.create(parsed, if_modified_since);
                entry.insert(transfer.clone());
                transfer
            }
        };

        transfer.subscribe(sink);
        Ok(transfer)
    }

    /// [`TransferManager::get`] with a fresh channel
    pub fn subscribe(&self, url: &str, if_modified_since: Option<&str>) -> Result<Subscription, FetchError> {
        let (sink, events) = unbounded_channel();
        self.get(url, if_modified_since, sink)?;
        Ok(Subscription::new(url, events))
    }

    /// Release every transfer created so far
    pub fn go(&self) {
        for transfer in self.transfers.iter() {
            transfer.go();
        }
    }

    /// Transfers that have not delivered their terminal event yet
    pub fn pending(&self) -> usize {
        self.transfers.iter().filter(|t| !t.is_finished()).count()
    }

    fn create(&self, url: Url, if_modified_since: Option<&str>) -> Arc<Transfer> {
        debug!(url = %url, if_modified_since = ?if_modified_since, "Creating transfer");
        let key = url.as_str().to_string();
        let options = RequestOptions {
            user_agent: self.user_agent.clone(),
            if_modified_since: if_modified_since.map(str::to_string),
        };
        let transfer = Transfer::start(url, &self.dns, self.pool.clone(), options);

        // Drop the registry entry once the transfer is over, unless it was replaced
        let transfers = self.transfers.clone();
        let watched = transfer.clone();
        tokio::spawn(async move {
            watched.finished().await;
            if transfers.remove_if(&key, |_, t| Arc::ptr_eq(t, &watched)).is_some() {
                debug!(url = %key, "Finished transfer removed");
            }
        });

        transfer
    }
}
