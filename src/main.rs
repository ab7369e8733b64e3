/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Harvester - feed harvesting crawler
//!
//! Entry point of one harvest run:
//! - Multi-threaded tokio runtime
//! - Configuration and logging setup
//! - Fetch of every configured feed through the shared fetch engine
//!   (DNS cache, pipelining connection pool, transfer manager)
//! - Conditional GET from the previous run's `Last-Modified` values
//! - Ctrl+C aborts the run

use tokio::{runtime, signal};
use tracing::{error, info, warn};

mod config;
mod core;
mod harvest;
mod network;
mod transfer;

use core::error::{HarvestError, Result};
use harvest::Harvester;
use harvest::state::{self, LastModified};

fn main() -> Result<()> {
    init_runtime()
}

/// Build the multi-threaded tokio runtime and run the harvest on it
fn init_runtime() -> Result<()> {
    let mut tokio_runtime = runtime::Builder::new_multi_thread();
    tokio_runtime
        .enable_all()
        .thread_name("harvester-worker")
        .worker_threads(4);
    let tokio_runtime = tokio_runtime
        .build()
        .map_err(|err| HarvestError::runtime(format!("Failed to initialize Tokio runtime: {err}")))?;
    tokio_runtime.block_on(run_async_main())
}

async fn run_async_main() -> Result<()> {
    let mut runtime = core::init();
    let options = runtime.options.clone();

    let config = match config::init(&options.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration initialization failed: {e}");
            std::process::exit(1);
        }
    };

    let mut log_config = config.log.clone();
    if let Some(level) = options.log_level {
        log_config.level = level;
    }

    // Keep the guard so buffered log lines are flushed on exit
    runtime.log_guard = Some(core::init_log(log_config));
    info!(config = ?options.config, "Harvester initializing...");

    let harvester = match Harvester::from_settings(&config.settings) {
        Ok(harvester) => harvester,
        Err(e) => {
            error!("Fetch engine initialization failed: {}", e);
            std::process::exit(1);
        }
    };

    let state_file = config.settings.state_file.clone();
    let previous = match &state_file {
        Some(path) => state::load(path).unwrap_or_else(|e| {
            warn!(path = ?path, "Ignoring unreadable state file: {}", e);
            LastModified::new()
        }),
        None => LastModified::new(),
    };

    let interrupted = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        report = harvester.run(&config.collections, &previous) => {
            info!(
                fetched = report.fetched(),
                not_modified = report.not_modified(),
                failed = report.failed(),
                timed_out = report.timed_out(),
                "Harvest complete"
            );
            if let Some(path) = &state_file
                && let Err(e) = state::save(path, &report.updated_state(&previous))
            {
                error!(path = ?path, "Failed to write state file: {}", e);
            }
        }
        _ = interrupted => {
            warn!("Received Ctrl+C signal, aborting harvest");
        }
    }

    Ok(())
}
