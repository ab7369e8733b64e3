/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Per-URL transfers and the manager that deduplicates them
//!
//! A [`TransferManager`] hands out at most one live [`Transfer`] per URL.
//! Callers subscribe first and release the whole batch with
//! [`TransferManager::go`], so no subscriber can arrive after the data has
//! started flowing.

mod manager;
mod subscription;
#[allow(clippy::module_inception)]
mod transfer;

pub use manager::TransferManager;
pub use subscription::{FetchedResponse, Subscription};
#[allow(unused)]
pub use transfer::{EventSink, Transfer};
