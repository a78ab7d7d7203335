// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Main application entry point for `lcpd`, the link control plane daemon
//! for Kestrel-family switches.

use std::sync::Arc;
use std::time::Duration;

use slog::error;
use slog::info;
use structopt::StructOpt;

use chip::sim::SimPlatform;
use chip::sim::SimRegisterIo;
use chip::Kestrel;
use common::logging::LogFormat;
use common::ports::PortType;

use crate::switch::Switch;

mod attr;
mod autoneg;
mod boot;
mod clock;
mod fsm;
mod glort;
mod port_fsm;
mod portmap;
mod ports;
mod serdes;
mod switch;
#[cfg(test)]
mod testutil;
mod types;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "lcpd",
    about = "link control plane daemon for kestrel switches"
)]
struct Opt {
    #[structopt(
        long,
        help = "send log data to the named file rather than stdout"
    )]
    log_file: Option<String>,

    #[structopt(
        long,
        short = "l",
        help = "format logs for 'human' or 'json' consumption"
    )]
    log_format: Option<LogFormat>,

    #[structopt(
        long,
        help = "number of physical ports the sim platform reports"
    )]
    ports: Option<u16>,

    #[structopt(
        long,
        help = "requested fabric clock in Hz (default: family nominal)"
    )]
    clock_hz: Option<u64>,

    #[structopt(long, help = "dump port state as JSON after boot and exit")]
    dump_state: bool,
}

// How often timers and the eye monitor are driven.
const TICK_INTERVAL: Duration = Duration::from_millis(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();
    let log = common::logging::init(
        "lcpd",
        &opt.log_file,
        opt.log_format.unwrap_or(LogFormat::Human),
    )?;

    let family = Arc::new(Kestrel::new());
    let io = Arc::new(SimRegisterIo::new(family.as_ref()));
    let platform = Box::new(SimPlatform::new(opt.ports.unwrap_or(8)));
    let switch = Switch::new(&log, family, io, platform)?;

    switch
        .boot(opt.clock_hz)
        .map_err(|e| anyhow::anyhow!("boot failed: {e}"))?;
    info!(log, "switch ready";
        "id" => %switch.identifiers.id,
        "fabric_hz" => switch.fabric_clock().map(|c| c.freq_hz).unwrap_or(0));

    // Bring every cardinal port up; one bad port shouldn't stop the rest.
    for view in switch.all_port_views() {
        if view.port_type == PortType::Physical {
            if let Err(e) = switch.port_enable(view.logical) {
                error!(log, "failed to enable port";
                    "port" => view.logical, "error" => %e);
            }
        }
    }

    if opt.dump_state {
        println!(
            "{}",
            serde_json::to_string_pretty(&switch.all_port_views())?
        );
        return Ok(());
    }

    let mut interval = tokio::time::interval(TICK_INTERVAL);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = switch.tick() {
                    error!(log, "tick failed"; "error" => %e);
                }
            }
            _ = &mut shutdown => {
                info!(log, "shutting down");
                break;
            }
        }
    }
    Ok(())
}
