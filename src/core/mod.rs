/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use crate::config::types::LogConfig;
use crate::core::log::HarvestLogFormatter;
use crate::core::runtime::{Options, Runtime};
use clap::Parser;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

pub mod error;
mod log;
pub mod runtime;

/// Parse command-line options into the runtime container
pub fn init() -> Runtime {
    let options = Options::parse();

    Runtime {
        options,
        log_guard: None,
    }
}

/// Initialize logging
///
/// Console output is always enabled; a non-blocking file writer is added when
/// `log.file` is configured. The returned guard must live until shutdown so
/// buffered lines are flushed.
pub fn init_log(log: LogConfig) -> WorkerGuard {
    let (file_writer, guard) = match log.file.as_deref().map(Path::new) {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map(|name| name.to_os_string())
                .unwrap_or_else(|| "harvester.log".into());
            let file_appender = tracing_appender::rolling::never(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            (Some(non_blocking), Some(guard))
        }
        None => (None, None),
    };

    let console_layer = fmt::layer()
        .event_format(HarvestLogFormatter)
        .with_writer(std::io::stdout);

    let file_layer = file_writer.map(|writer| {
        fmt::layer()
            .event_format(HarvestLogFormatter)
            .with_writer(writer)
    });

    let mut filter = EnvFilter::try_new(&log.level).unwrap_or_else(|_| EnvFilter::new("info"));

    // rustls logs every handshake detail at debug
    if let Ok(directive) = "rustls=warn".parse() {
        filter = filter.add_directive(directive);
    }

    Registry::default()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard.unwrap_or_else(|| tracing_appender::non_blocking(std::io::sink()).1)
}
