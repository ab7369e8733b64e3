/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Hostname resolution for transfers
//!
//! [`DnsCache`] guarantees one query per hostname for the process lifetime;
//! the query itself is delegated to a [`NameResolver`] backend.

mod cache;
mod resolver;

pub use cache::{AddressList, DnsCache, Resolution, ResolveResult};
pub use resolver::{NameResolver, NameserverResolver, SystemResolver};

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Pick the resolver backend: a configured nameserver, or the system resolver
pub fn build_resolver(nameserver: Option<SocketAddr>) -> Arc<dyn NameResolver> {
    match nameserver {
        Some(server) => {
            info!(%server, "Resolving feed hosts through upstream nameserver");
            Arc::new(NameserverResolver::new(server))
        }
        None => {
            info!("Resolving feed hosts through the system resolver");
            Arc::new(SystemResolver)
        }
    }
}
