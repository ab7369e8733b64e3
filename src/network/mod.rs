/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Network layer of the fetch engine
//!
//! - `dns`: one-query-per-hostname resolution cache
//! - `http`: request serialization and incremental response decoding
//! - `transport`: TCP/TLS stream establishment
//! - `pool`: keyed, pipelining HTTP/1.1 connection pool

pub mod deferred;
pub mod dns;
pub mod http;
pub mod pool;
pub mod tls_config;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;
