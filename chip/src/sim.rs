// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! A register-level simulation of a Kestrel-family part, used by the
//! daemon's sim mode and by the test suites.  The simulator is a plain
//! register file with just enough seeded behavior to let the boot sequence
//! and the link state machines run: the identification word reads as
//! expected, the PLL always locks, memory clears complete immediately, and
//! lanes report a good signal and a healthy eye.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use rand::Rng;

use crate::kestrel::regs;
use crate::kestrel::regs::LaneEye;
use crate::FamilyOps;
use hal::HalResult;
use hal::LaneHdl;
use hal::Platform;
use hal::RegisterIo;
use common::ports::LogicalPort;
use common::ports::PhysicalPort;

// Seeded eye opening for a healthy simulated lane.
const SIM_EYE_HEIGHT: u8 = 40;
const SIM_EYE_WIDTH: u8 = 40;

/// An in-memory register file standing in for the register bus.
pub struct SimRegisterIo {
    regs: Mutex<BTreeMap<u32, u32>>,
    // Eye registers get one unit of read jitter to mimic a live monitor.
    eye_regs: BTreeSet<u32>,
    // Fault injection: registers stuck at a value, dropping writes.
    wedged: Mutex<BTreeSet<u32>>,
    delay_us: AtomicU64,
}

impl SimRegisterIo {
    pub fn new(family: &dyn FamilyOps) -> Self {
        let map = family.regs();
        let mut seed = BTreeMap::new();
        seed.insert(map.chip_id, family.identification_word());
        seed.insert(map.fuse_sku, 0);
        seed.insert(map.pll_fabric_stat, 0x1);
        seed.insert(map.mem_init_stat, 0x1);

        let mut eye_regs = BTreeSet::new();
        for epl in 0..family.epl_count() {
            for channel in 0..family.lanes_per_epl() {
                let lane = LaneHdl::new(epl, channel);
                // Lane PLL locked and signal detected.
                seed.insert(family.lane_reg(lane, regs::LANE_STAT), 0x3);
                let eye = family.lane_reg(lane, regs::LANE_EYE);
                seed.insert(
                    eye,
                    LaneEye::new(SIM_EYE_HEIGHT, SIM_EYE_WIDTH).bits(),
                );
                eye_regs.insert(eye);
            }
        }

        SimRegisterIo {
            regs: Mutex::new(seed),
            eye_regs,
            wedged: Mutex::new(BTreeSet::new()),
            delay_us: AtomicU64::new(0),
        }
    }

    /// Total simulated delay accumulated so far.
    pub fn elapsed_us(&self) -> u64 {
        self.delay_us.load(Ordering::Relaxed)
    }

    /// Wedge a register at `stuck`: reads return it, writes are dropped.
    /// Used by tests to provoke read-back failures.
    pub fn wedge(&self, addr: u32, stuck: u32) {
        self.regs.lock().unwrap().insert(addr, stuck);
        self.wedged.lock().unwrap().insert(addr);
    }
}

impl RegisterIo for SimRegisterIo {
    fn read32(&self, addr: u32) -> HalResult<u32> {
        let val =
            self.regs.lock().unwrap().get(&addr).copied().unwrap_or(0);
        if self.eye_regs.contains(&addr) {
            let eye = LaneEye::from_bits(val);
            let jitter: u8 = rand::thread_rng().gen_range(0..=1);
            return Ok(LaneEye::new(
                eye.height().saturating_sub(jitter),
                eye.width(),
            )
            .bits());
        }
        Ok(val)
    }

    fn write32(&self, addr: u32, val: u32) -> HalResult<()> {
        if self.wedged.lock().unwrap().contains(&addr) {
            return Ok(());
        }
        self.regs.lock().unwrap().insert(addr, val);
        Ok(())
    }

    fn delay_us(&self, us: u64) {
        // The simulator only accounts for time; it never sleeps.
        self.delay_us.fetch_add(us, Ordering::Relaxed);
    }
}

/// A board description for the simulator: `count` physical ports wired
/// straight through, minus any the test declares absent.
pub struct SimPlatform {
    count: PhysicalPort,
    unmapped: BTreeSet<PhysicalPort>,
}

impl SimPlatform {
    pub fn new(count: PhysicalPort) -> Self {
        SimPlatform {
            count,
            unmapped: BTreeSet::new(),
        }
    }

    /// Declare some physical ports absent, as a board with unpopulated
    /// cages would.
    pub fn with_unmapped(
        mut self,
        ports: impl IntoIterator<Item = PhysicalPort>,
    ) -> Self {
        self.unmapped.extend(ports);
        self
    }
}

impl Platform for SimPlatform {
    fn map_physical_port(&self, phys: PhysicalPort) -> Option<LogicalPort> {
        if phys >= self.count || self.unmapped.contains(&phys) {
            return None;
        }
        // Logical 0 is reserved for the CPU port.
        Some(phys + 1)
    }

    fn board_name(&self) -> &str {
        "kestrel-sim"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Kestrel;

    #[test]
    fn seeded_registers() {
        let family = Kestrel::new();
        let io = SimRegisterIo::new(&family);
        let map = family.regs();
        assert_eq!(
            io.read32(map.chip_id).unwrap(),
            family.identification_word()
        );
        assert_eq!(io.read32(map.pll_fabric_stat).unwrap() & 0x1, 0x1);
    }

    #[test]
    fn masked_write() {
        let family = Kestrel::new();
        let io = SimRegisterIo::new(&family);
        io.write32(0x5000, 0xffff_0000).unwrap();
        io.masked_write32(0x5000, 0x0000_00ff, 0x0000_0042).unwrap();
        assert_eq!(io.read32(0x5000).unwrap(), 0xffff_0042);
    }

    #[test]
    fn eye_jitter_bounded() {
        let family = Kestrel::new();
        let io = SimRegisterIo::new(&family);
        let addr = family.lane_reg(LaneHdl::new(0, 0), regs::LANE_EYE);
        for _ in 0..32 {
            let eye = LaneEye::from_bits(io.read32(addr).unwrap());
            assert!(eye.height() >= SIM_EYE_HEIGHT - 1);
            assert_eq!(eye.width(), SIM_EYE_WIDTH);
        }
    }

    #[test]
    fn platform_mapping() {
        let platform = SimPlatform::new(8).with_unmapped([3]);
        assert_eq!(platform.map_physical_port(0), Some(1));
        assert_eq!(platform.map_physical_port(3), None);
        assert_eq!(platform.map_physical_port(7), Some(8));
        assert_eq!(platform.map_physical_port(8), None);
    }
}
