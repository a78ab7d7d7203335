// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Structured-logging bootstrap used by the daemon and its tests.

use std::fs::OpenOptions;
use std::str::FromStr;

use anyhow::Context;
use slog::Drain;

/// The format in which log records are emitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-friendly terminal output
    Human,
    /// Bunyan-style JSON, one record per line
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            x => Err(anyhow::anyhow!("invalid log format: {x}")),
        }
    }
}

fn async_root<D>(drain: D, name: &str) -> slog::Logger
where
    D: Drain<Ok = (), Err = std::io::Error> + Send + 'static,
{
    let drain = slog_async::Async::new(drain.fuse())
        .chan_size(8192)
        .build()
        .fuse();
    slog::Logger::root(drain, slog::o!("daemon" => name.to_string()))
}

/// Initialize a root logger.
///
/// Records go to `log_file` if one is given and to stdout otherwise, in the
/// requested format.
pub fn init(
    name: &'static str,
    log_file: &Option<String>,
    log_format: LogFormat,
) -> anyhow::Result<slog::Logger> {
    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))?;
            Ok(match log_format {
                LogFormat::Json => {
                    async_root(slog_bunyan::with_name(name, file).build(), name)
                }
                LogFormat::Human => {
                    let decorator = slog_term::PlainDecorator::new(file);
                    let drain = slog_term::FullFormat::new(decorator).build();
                    async_root(drain, name)
                }
            })
        }
        None => Ok(match log_format {
            LogFormat::Json => async_root(
                slog_bunyan::with_name(name, std::io::stdout()).build(),
                name,
            ),
            LogFormat::Human => {
                let decorator = slog_term::TermDecorator::new().build();
                let drain = slog_term::FullFormat::new(decorator).build();
                async_root(drain, name)
            }
        }),
    }
}
