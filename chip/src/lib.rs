// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Per-chip-family code.
//!
//! Every chip family implements the [`FamilyOps`] capability trait once; the
//! boot sequencer and the resource allocator hold a reference to the active
//! implementation, selected at switch-creation time and never replaced.
//! The only family currently supported is Kestrel.

use schemars::JsonSchema;
use serde::Serialize;
use uuid::Uuid;

pub mod kestrel;
pub mod sim;

pub use kestrel::Kestrel;

use common::ports::FabricPort;
use common::ports::PhysicalPort;
use hal::HalResult;
use hal::LaneHdl;

/// Feature restrictions fused into a part at manufacturing time.  A
/// restricted part may only run its fabric at one of a short list of
/// frequencies; requests are clamped to the nearest permitted value at or
/// below before the divider search runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkuRestriction {
    /// No restriction; any achievable frequency may be requested
    FullControl,
    /// Only the listed frequencies (in Hz, ascending) are permitted
    Limited(&'static [u64]),
}

/// Named register addresses for the handful of global registers the boot
/// sequencer touches.  Per-lane registers are reached through
/// [`FamilyOps::lane_reg`] instead.
#[derive(Clone, Copy, Debug)]
pub struct RegMap {
    /// Fixed identification word; reads back the family's ident constant on
    /// a live device
    pub chip_id: u32,
    /// Fuse word carrying the feature-restriction code
    pub fuse_sku: u32,
    /// Per-domain soft reset control
    pub soft_reset: u32,
    /// Fabric PLL divider programming
    pub pll_fabric_ctrl: u32,
    /// Fabric PLL status
    pub pll_fabric_stat: u32,
    /// On-chip memory clear control
    pub mem_init_ctrl: u32,
    /// On-chip memory clear status
    pub mem_init_stat: u32,
    /// Diagnostic scan-chain control
    pub scan_ctrl: u32,
    /// Switch-fabric loopback control
    pub fabric_loopback: u32,
    /// Congestion-management global configuration
    pub cm_global_cfg: u32,
    /// Event-queue configuration
    pub evq_cfg: u32,
    /// Egress scheduler configuration
    pub sched_cfg: u32,
    /// Status LED control
    pub led_ctrl: u32,
    /// Software-ready handshake word
    pub sw_ready: u32,
    /// Memory parity checking control
    pub parity_ctrl: u32,
    /// Storm-control slot configuration base
    pub storm_cfg: u32,
    /// Trigger slot configuration base
    pub trigger_cfg: u32,
    /// MAC-table structure configuration
    pub ma_table_cfg: u32,
}

/// The capability set a chip family exposes to the generic control plane.
///
/// One implementation exists per family.  Implementations carry no mutable
/// state: everything here is geometry, addressing, and decode logic fixed
/// by the silicon.
pub trait FamilyOps: Send + Sync {
    /// Marketing-free name of the family, for log messages.
    fn family(&self) -> &'static str;

    /// One past the highest physical port number the package can expose.
    fn max_physical_ports(&self) -> PhysicalPort;

    /// Number of EPL blocks on the die.
    fn epl_count(&self) -> u8;

    /// Number of SerDes channels terminated by each EPL.
    fn lanes_per_epl(&self) -> u8;

    /// Frequency of the reference clock feeding the fabric PLL.
    fn refclk_hz(&self) -> u64;

    /// Fabric frequency used when the caller passes the "use default"
    /// sentinel.
    fn default_fabric_clock_hz(&self) -> u64;

    /// The value the identification register reads on a live part.
    fn identification_word(&self) -> u32;

    /// The base lane (EPL and channel) wired to a physical port.
    fn physical_to_lane(&self, phys: PhysicalPort) -> HalResult<LaneHdl>;

    /// The switch-fabric-internal identifier for a physical port.
    fn fabric_port(&self, phys: PhysicalPort) -> FabricPort;

    /// Interpret the fuse word's feature-restriction code.
    fn decode_restriction(&self, fuse: u32) -> SkuRestriction;

    /// Global register addresses.
    fn regs(&self) -> &RegMap;

    /// Address of a per-lane register, given the register's offset within
    /// the lane block.
    fn lane_reg(&self, lane: LaneHdl, offset: u32) -> u32;
}

/// Identifiers for the chip instance being managed.
#[derive(Debug, Clone, JsonSchema, Serialize)]
pub struct Identifiers {
    /// Unique identifier for this switch instance.
    pub id: Uuid,
    /// The chip family backing the instance.
    pub family: String,
    /// The raw identification word read from the part.
    pub ident: u32,
}

impl Identifiers {
    pub fn new(family: &dyn FamilyOps, ident: u32) -> Self {
        Identifiers {
            id: Uuid::new_v4(),
            family: family.family().to_string(),
            ident,
        }
    }
}
