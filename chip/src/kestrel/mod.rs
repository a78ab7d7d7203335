// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The Kestrel switch family: 9 EPL blocks of 4 lanes each, up to 36
//! physical Ethernet ports, fabric clock synthesized from a 644.53125 MHz
//! reference.

pub mod regs;

use crate::FamilyOps;
use crate::RegMap;
use crate::SkuRestriction;
use common::ports::FabricPort;
use common::ports::PhysicalPort;
use hal::HalError;
use hal::HalResult;
use hal::LaneHdl;

/// Value of the identification register on a live Kestrel part.
pub const KESTREL_IDENT: u32 = 0x4b53_1001;

/// The fabric-internal port namespace starts above the lane namespace.
const FABRIC_PORT_BASE: FabricPort = 0x40;

/// Reference clock feeding the fabric PLL: 644.53125 MHz.
const KESTREL_REFCLK_HZ: u64 = 644_531_250;

/// Nominal fabric frequency for unrestricted parts.
const KESTREL_DEFAULT_FABRIC_HZ: u64 = 700_000_000;

// Frequency menus for the frequency-restricted SKU codes.
const SKU_FREQS_FOUR: [u64; 4] =
    [300_000_000, 400_000_000, 500_000_000, 600_000_000];
const SKU_FREQS_TWO: [u64; 2] = [300_000_000, 400_000_000];
const SKU_FREQS_ONE: [u64; 1] = [300_000_000];

const KESTREL_REGMAP: RegMap = RegMap {
    chip_id: 0x0000_0000,
    fuse_sku: 0x0000_0004,
    soft_reset: 0x0000_0010,
    pll_fabric_ctrl: 0x0000_0020,
    pll_fabric_stat: 0x0000_0021,
    mem_init_ctrl: 0x0000_0030,
    mem_init_stat: 0x0000_0031,
    scan_ctrl: 0x0000_0040,
    fabric_loopback: 0x0000_0041,
    cm_global_cfg: 0x0000_0050,
    evq_cfg: 0x0000_0051,
    sched_cfg: 0x0000_0052,
    led_ctrl: 0x0000_0060,
    sw_ready: 0x0000_0070,
    parity_ctrl: 0x0000_0080,
    storm_cfg: 0x0000_0090,
    trigger_cfg: 0x0000_00a0,
    ma_table_cfg: 0x0000_00b0,
};

// Each EPL owns a 0x100-word block starting here, with 0x40 words per lane.
const EPL_BLOCK_BASE: u32 = 0x0001_0000;
const EPL_BLOCK_SIZE: u32 = 0x100;
const LANE_BLOCK_SIZE: u32 = 0x40;

/// The Kestrel family singleton.
#[derive(Debug, Default)]
pub struct Kestrel;

impl Kestrel {
    pub fn new() -> Self {
        Kestrel
    }
}

impl FamilyOps for Kestrel {
    fn family(&self) -> &'static str {
        "kestrel"
    }

    fn max_physical_ports(&self) -> PhysicalPort {
        self.epl_count() as PhysicalPort * self.lanes_per_epl() as PhysicalPort
    }

    fn epl_count(&self) -> u8 {
        9
    }

    fn lanes_per_epl(&self) -> u8 {
        4
    }

    fn refclk_hz(&self) -> u64 {
        KESTREL_REFCLK_HZ
    }

    fn default_fabric_clock_hz(&self) -> u64 {
        KESTREL_DEFAULT_FABRIC_HZ
    }

    fn identification_word(&self) -> u32 {
        KESTREL_IDENT
    }

    fn physical_to_lane(&self, phys: PhysicalPort) -> HalResult<LaneHdl> {
        if phys >= self.max_physical_ports() {
            return Err(HalError::InvalidArg(format!(
                "physical port {phys} out of range"
            )));
        }
        let per_epl = self.lanes_per_epl() as PhysicalPort;
        Ok(LaneHdl::new((phys / per_epl) as u8, (phys % per_epl) as u8))
    }

    fn fabric_port(&self, phys: PhysicalPort) -> FabricPort {
        FABRIC_PORT_BASE + phys
    }

    fn decode_restriction(&self, fuse: u32) -> SkuRestriction {
        // The restriction code lives in the low nibble of the fuse word.
        match fuse & 0xf {
            0 => SkuRestriction::FullControl,
            1 => SkuRestriction::Limited(&SKU_FREQS_FOUR),
            2 => SkuRestriction::Limited(&SKU_FREQS_TWO),
            _ => SkuRestriction::Limited(&SKU_FREQS_ONE),
        }
    }

    fn regs(&self) -> &RegMap {
        &KESTREL_REGMAP
    }

    fn lane_reg(&self, lane: LaneHdl, offset: u32) -> u32 {
        EPL_BLOCK_BASE
            + lane.epl as u32 * EPL_BLOCK_SIZE
            + lane.channel as u32 * LANE_BLOCK_SIZE
            + offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_mapping() {
        let family = Kestrel::new();
        assert_eq!(family.max_physical_ports(), 36);
        assert_eq!(family.physical_to_lane(0).unwrap(), LaneHdl::new(0, 0));
        assert_eq!(family.physical_to_lane(5).unwrap(), LaneHdl::new(1, 1));
        assert_eq!(family.physical_to_lane(35).unwrap(), LaneHdl::new(8, 3));
        family.physical_to_lane(36).unwrap_err();
    }

    #[test]
    fn lane_registers_disjoint() {
        let family = Kestrel::new();
        let a = family.lane_reg(LaneHdl::new(0, 3), regs::LANE_EYE);
        let b = family.lane_reg(LaneHdl::new(1, 0), regs::LANE_EYE);
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn restriction_decode() {
        let family = Kestrel::new();
        assert_eq!(
            family.decode_restriction(0),
            SkuRestriction::FullControl
        );
        match family.decode_restriction(1) {
            SkuRestriction::Limited(freqs) => assert_eq!(freqs.len(), 4),
            x => panic!("unexpected restriction {x:?}"),
        }
    }
}
