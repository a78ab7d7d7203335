// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The boot sequencer: the ordered procedure that takes the chip from
//! reset to "ready", then runs the post-reset per-block initialization
//! (resource allocation, port creation, ancillary blocks).
//!
//! Every step is gated on the success of the previous one.  A register
//! failure anywhere marks the switch instance failed and aborts: there is
//! no partial-success boot state.  Per-port failures inside the bulk port
//! enumeration are the one exception: those are logged and the port is
//! skipped so its neighbors still come up.

use slog::error;
use slog::info;

use chip::kestrel::regs;
use chip::FamilyOps;
use common::ports::LogicalPort;
use common::ports::PortType;
use common::ports::SpecialPortKind;
use hal::HalError;
use strum::IntoEnumIterator;

use crate::clock;
use crate::glort::GlortCategory;
use crate::portmap::CardinalEntry;
use crate::portmap::CardinalPortMap;
use crate::ports::Port;
use crate::switch::FsmOwner;
use crate::switch::SwitchInner;
use crate::switch::FSM_HISTORY_CAPACITY;
use crate::types::LcpdError;
use crate::types::LcpdResult;

/// The CPU management port's logical number.
pub const CPU_LOGICAL_PORT: LogicalPort = 0;

// Fixed logical numbers for the synthetic endpoints, above the physical
// port space.
const TUNNEL_PORTS: [LogicalPort; 2] = [40, 41];
const LOOPBACK_PORTS: [LogicalPort; 2] = [42, 43];
const PEP_PORTS: [LogicalPort; 2] = [44, 45];
const SECONDARY_MGMT_PORT: LogicalPort = 46;
/// First logical number of the special destinations.
pub const SPECIAL_PORT_BASE: LogicalPort = 48;

// Power-on defaults for the ancillary blocks.
const CM_GLOBAL_DEFAULT: u32 = 0x0004_0040;
const EVQ_DEFAULT: u32 = 0x0000_0400;
const SCHED_DEFAULT: u32 = 0x0000_0001;
const TRIGGER_DEFAULT: u32 = 0;
const STORM_CTRL_DEFAULT: u32 = 0;
const MA_TABLE_DEFAULT: u32 = 0x0001_0000;

const PLL_LOCK_POLLS: u32 = 10;
const MEM_INIT_POLLS: u32 = 100;

fn boot_step<F>(
    inner: &mut SwitchInner,
    step: &'static str,
    f: F,
) -> LcpdResult<()>
where
    F: FnOnce(&mut SwitchInner) -> LcpdResult<()>,
{
    info!(inner.log, "boot step"; "step" => step);
    match f(inner) {
        Ok(()) => Ok(()),
        Err(e) => {
            inner.failed = true;
            error!(inner.log, "boot step failed";
                "step" => step, "error" => %e);
            Err(LcpdError::Boot {
                step,
                err: Box::new(e),
            })
        }
    }
}

/// Verify the identification word still reads as expected.
fn check_alive(inner: &SwitchInner) -> LcpdResult<()> {
    let expected = inner.family.identification_word();
    let found = inner.io.read32(inner.family.regs().chip_id)?;
    if found != expected {
        return Err(HalError::NotAlive { expected, found }.into());
    }
    Ok(())
}

pub(crate) fn run_boot(
    inner: &mut SwitchInner,
    requested_clock_hz: Option<u64>,
) -> LcpdResult<()> {
    boot_step(inner, "alive-check", |s| check_alive(s))?;
    boot_step(inner, "assert-domain-reset", |s| {
        let addr = s.family.regs().soft_reset;
        s.hw_write(addr, regs::SoftReset::all_asserted().bits())
    })?;
    boot_step(inner, "configure-fabric-clock", |s| {
        configure_fabric_clock(s, requested_clock_hz)
    })?;
    boot_step(inner, "init-serdes-mode", |s| {
        // Static coefficients at the lowest rate until a port claims the
        // lane.
        for_each_lane(s, |s, lane| {
            let addr = s.family.lane_reg(lane, regs::LANE_MODE);
            s.hw_write(addr, regs::LaneMode::default().bits())
        })
    })?;
    boot_step(inner, "serdes-up", |s| {
        for_each_lane(s, |s, lane| {
            let addr = s.family.lane_reg(lane, regs::LANE_CTRL);
            s.hw_write(addr, regs::LaneCtrl::powered_up().bits())
        })
    })?;
    boot_step(inner, "release-epl-domains", |s| {
        let addr = s.family.regs().soft_reset;
        s.hw_write(
            addr,
            regs::SoftReset::all_asserted().with_epl_released().bits(),
        )
    })?;
    boot_step(inner, "release-fabric-domain", |s| {
        let (soft_reset, mem_init_ctrl, mem_init_stat) = {
            let map = s.family.regs();
            (map.soft_reset, map.mem_init_ctrl, map.mem_init_stat)
        };
        let released = regs::SoftReset::all_asserted()
            .with_epl_released()
            .with_fabric_released();
        s.hw_write(soft_reset, released.bits())?;
        // Clear the on-chip memories.  The start bit self-clears, so
        // this write is deliberately unverified.
        s.io.write32(mem_init_ctrl, regs::MemInit::start().bits())?;
        for _ in 0..MEM_INIT_POLLS {
            let stat =
                regs::MemInit::from_bits(s.io.read32(mem_init_stat)?);
            if stat.done() {
                return Ok(());
            }
            s.io.delay_us(100);
        }
        Err(LcpdError::Other("memory clear never completed".to_string()))
    })?;
    boot_step(inner, "disable-diagnostics", |s| {
        let map = s.family.regs();
        let (scan, loopback) = (map.scan_ctrl, map.fabric_loopback);
        s.hw_write(scan, 0)?;
        s.hw_write(loopback, 0)
    })?;
    boot_step(inner, "init-congestion-management", |s| {
        let map = s.family.regs();
        let (cm, evq) = (map.cm_global_cfg, map.evq_cfg);
        s.hw_write(cm, CM_GLOBAL_DEFAULT)?;
        s.hw_write(evq, EVQ_DEFAULT)
    })?;
    boot_step(inner, "init-scheduler", |s| {
        let addr = s.family.regs().sched_cfg;
        s.hw_write(addr, SCHED_DEFAULT)
    })?;
    boot_step(inner, "enable-status-leds", |s| {
        let addr = s.family.regs().led_ctrl;
        s.hw_write(addr, 1)
    })?;
    boot_step(inner, "mark-ready", |s| {
        check_alive(s)?;
        let addr = s.family.regs().sw_ready;
        s.hw_write(addr, 1)?;
        s.ready = true;
        Ok(())
    })?;
    boot_step(inner, "post-reset-init", post_reset_init)?;

    info!(inner.log, "boot complete";
        "ports" => inner.ports.len(),
        "fabric_hz" => inner.clock.map(|c| c.freq_hz).unwrap_or(0));
    Ok(())
}

fn configure_fabric_clock(
    inner: &mut SwitchInner,
    requested_hz: Option<u64>,
) -> LcpdResult<()> {
    let map = inner.family.regs();
    let (ctrl_addr, stat_addr, fuse_addr) =
        (map.pll_fabric_ctrl, map.pll_fabric_stat, map.fuse_sku);

    let fuse = inner.io.read32(fuse_addr)?;
    let restriction = inner.family.decode_restriction(fuse);
    let request =
        requested_hz.unwrap_or_else(|| inner.family.default_fabric_clock_hz());
    let choice = clock::select_fabric_clock(
        inner.family.refclk_hz(),
        request,
        restriction,
    )?;

    let d = choice.dividers;
    let ctrl = regs::PllFabricCtrl::default()
        .with_refdiv(d.refdiv)
        .with_outdiv(d.outdiv)
        .with_fbdiv4(d.fbdiv4)
        .with_fbdiv255(d.fbdiv255)
        .with_enabled(true);
    inner.hw_write(ctrl_addr, ctrl.bits())?;

    let mut locked = false;
    for _ in 0..PLL_LOCK_POLLS {
        inner.io.delay_us(100);
        if regs::PllFabricStat::from_bits(inner.io.read32(stat_addr)?)
            .locked()
        {
            locked = true;
            break;
        }
    }
    if !locked {
        return Err(LcpdError::Other(
            "fabric PLL never locked".to_string(),
        ));
    }

    info!(inner.log, "fabric clock configured";
        "requested_hz" => request,
        "achieved_hz" => choice.freq_hz,
        "refdiv" => d.refdiv,
        "outdiv" => d.outdiv,
        "fbdiv4" => d.fbdiv4,
        "fbdiv255" => d.fbdiv255);
    inner.clock = Some(choice);
    Ok(())
}

fn for_each_lane<F>(inner: &mut SwitchInner, mut f: F) -> LcpdResult<()>
where
    F: FnMut(&mut SwitchInner, hal::LaneHdl) -> LcpdResult<()>,
{
    for epl in 0..inner.family.epl_count() {
        for channel in 0..inner.family.lanes_per_epl() {
            f(inner, hal::LaneHdl::new(epl, channel))?;
        }
    }
    Ok(())
}

/// Post-reset per-block initialization: the resource allocator runs here,
/// after the fabric is out of reset and the instance is marked ready.
fn post_reset_init(inner: &mut SwitchInner) -> LcpdResult<()> {
    inner.glorts.validate()?;

    inner.cardinal = CardinalPortMap::new(
        &inner.log,
        inner.family.as_ref(),
        inner.platform.as_ref(),
    );

    create_cpu_port(inner)?;

    // Bulk port creation: a bad port is logged and skipped so the rest of
    // the switch still initializes.
    let entries: Vec<CardinalEntry> = inner.cardinal.entries().to_vec();
    for entry in entries {
        if let Err(e) = create_physical_port(inner, entry) {
            error!(inner.log, "skipping physical port";
                "physical" => entry.physical,
                "logical" => entry.logical,
                "error" => %e);
        }
    }

    create_fixed_ports(inner)?;
    create_special_ports(inner)?;
    inner.recompute_flood_masks();

    ancillary_block_init(inner)?;

    // The internal endpoints forward from the start.
    for lp in std::iter::once(CPU_LOGICAL_PORT)
        .chain(TUNNEL_PORTS)
        .chain(LOOPBACK_PORTS)
    {
        inner.port_admin(lp, true)?;
    }
    Ok(())
}

fn new_managed_port(
    inner: &mut SwitchInner,
    logical: LogicalPort,
    port_type: PortType,
    glort: (GlortCategory, u16),
) -> LcpdResult<Port> {
    let mut port = Port::new(logical, port_type);
    port.glort = inner.glorts.glort_at(glort.0, glort.1)?;
    // The port type fixes which lifecycle table this port binds to.
    let table = crate::port_fsm::table_for(port_type);
    let ty = inner
        .registry
        .get(table.name)
        .expect("registered at construction");
    let sm = inner.engine.create_instance(
        ty,
        format!("port {logical}"),
        FSM_HISTORY_CAPACITY,
        std::time::Duration::from_millis(500),
    );
    inner.bindings.insert(sm, FsmOwner::Port(logical));
    port.sm = Some(sm);
    Ok(port)
}

fn create_cpu_port(inner: &mut SwitchInner) -> LcpdResult<()> {
    let mut port = new_managed_port(
        inner,
        CPU_LOGICAL_PORT,
        PortType::Cpu,
        (GlortCategory::Cpu, 0),
    )?;
    port.fabric = Some(0);
    inner.ports.insert(port)
}

fn create_physical_port(
    inner: &mut SwitchInner,
    entry: CardinalEntry,
) -> LcpdResult<()> {
    let base = inner.family.physical_to_lane(entry.physical)?;
    let mut port = new_managed_port(
        inner,
        entry.logical,
        PortType::Physical,
        (GlortCategory::PerPort, entry.logical),
    )?;
    port.physical = Some(entry.physical);
    port.fabric = Some(entry.fabric);
    inner.ports.insert(port)?;

    inner.ensure_lane_instances(base)?;
    inner.lanes.reassign(entry.logical, &[base])?;
    inner.ports.get_mut(entry.logical)?.lanes = vec![base];
    Ok(())
}

fn create_fixed_ports(inner: &mut SwitchInner) -> LcpdResult<()> {
    let fixed = TUNNEL_PORTS
        .map(|lp| (lp, PortType::TunnelEngine))
        .into_iter()
        .chain(LOOPBACK_PORTS.map(|lp| (lp, PortType::Loopback)))
        .chain(PEP_PORTS.map(|lp| (lp, PortType::Pep)))
        .chain([(SECONDARY_MGMT_PORT, PortType::SecondaryManagement)]);
    for (lp, port_type) in fixed {
        let port = new_managed_port(
            inner,
            lp,
            port_type,
            (GlortCategory::PerPort, lp),
        )?;
        inner.ports.insert(port)?;
    }
    Ok(())
}

fn create_special_ports(inner: &mut SwitchInner) -> LcpdResult<()> {
    for (idx, kind) in SpecialPortKind::iter().enumerate() {
        let logical = SPECIAL_PORT_BASE + idx as LogicalPort;
        let mut port = new_managed_port(
            inner,
            logical,
            PortType::Special(kind),
            (GlortCategory::Special, idx as u16),
        )?;
        // recompute_flood_masks() fills the real value in.
        port.dest_mask = Some(crate::ports::PortMask::EMPTY);
        inner.ports.insert(port)?;
    }
    Ok(())
}

fn ancillary_block_init(inner: &mut SwitchInner) -> LcpdResult<()> {
    let map = inner.family.regs();
    let writes = [
        (map.trigger_cfg, TRIGGER_DEFAULT),
        (map.storm_cfg, STORM_CTRL_DEFAULT),
        (map.ma_table_cfg, MA_TABLE_DEFAULT),
        (map.parity_ctrl, 1),
    ];
    for (addr, val) in writes {
        inner.hw_write(addr, val)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::AttrValue;
    use crate::attr::SwitchAttr;
    use crate::port_fsm::PortState;
    use crate::testutil::sim_switch;
    use chip::sim::SimPlatform;
    use chip::FamilyOps;
    use chip::Kestrel;
    use common::ports::SpecialPortKind;

    #[test]
    fn boot_reaches_ready() -> anyhow::Result<()> {
        let (_io, switch) = sim_switch(SimPlatform::new(8));
        switch.boot(None)?;
        assert!(switch.ready());
        assert!(!switch.failed());

        // Default request is 700 MHz; nearest-above is 700.094 MHz.
        let clock = switch.fabric_clock().unwrap();
        assert_eq!(clock.freq_hz, 700_094_288);

        // The CPU and internal endpoints are forwarding; physical ports
        // wait for administrative enable.
        assert_eq!(switch.port_state(CPU_LOGICAL_PORT)?, PortState::Up);
        assert_eq!(switch.port_state(TUNNEL_PORTS[0])?, PortState::Up);
        assert_eq!(switch.port_state(1)?, PortState::Disabled);
        assert_eq!(switch.port_state(PEP_PORTS[0])?, PortState::Disabled);
        Ok(())
    }

    #[test]
    fn unmapped_ports_skipped_benignly() -> anyhow::Result<()> {
        let (_io, switch) =
            sim_switch(SimPlatform::new(8).with_unmapped([3, 6]));
        switch.boot(None)?;

        // Physical 3 maps to logical 4; it's simply absent.
        switch.port_state(4).unwrap_err();
        switch.port_state(7).unwrap_err();
        assert_eq!(switch.port_state(1)?, PortState::Disabled);
        assert_eq!(switch.port_state(8)?, PortState::Disabled);
        Ok(())
    }

    #[test]
    fn flood_masks_exclude_infrastructure_ports() -> anyhow::Result<()> {
        let (_io, switch) = sim_switch(SimPlatform::new(8));
        switch.boot(None)?;

        let broadcast = switch.port_view(SPECIAL_PORT_BASE)?;
        assert_eq!(
            broadcast.port_type,
            common::ports::PortType::Special(SpecialPortKind::Broadcast)
        );
        let mask = broadcast.dest_mask.unwrap();
        for lp in 1..=8 {
            assert!(mask.contains(lp));
        }
        for lp in [CPU_LOGICAL_PORT, 40, 41, 42, 43, 44, 45, 46] {
            assert!(!mask.contains(lp));
        }
        assert_eq!(mask.count(), 8);

        // Drop, no-op, and RPF-failure destinations keep empty masks.
        for kind_offset in [3, 4, 5] {
            let view = switch.port_view(SPECIAL_PORT_BASE + kind_offset)?;
            assert!(view.dest_mask.unwrap().is_empty());
        }

        // Opting PEPs into flooding adds them, but never the
        // secondary-management endpoint.
        switch.set_switch_attr(
            SwitchAttr::IncludePepsInFlooding,
            AttrValue::Bool(true),
        )?;
        let mask = switch
            .port_view(SPECIAL_PORT_BASE)?
            .dest_mask
            .unwrap();
        assert!(mask.contains(PEP_PORTS[0]));
        assert!(mask.contains(PEP_PORTS[1]));
        assert!(!mask.contains(SECONDARY_MGMT_PORT));
        Ok(())
    }

    #[test]
    fn readback_mismatch_is_fatal() {
        let (io, switch) = sim_switch(SimPlatform::new(4));
        let family = Kestrel::new();
        io.wedge(family.regs().led_ctrl, 0);

        match switch.boot(None) {
            Err(LcpdError::Boot { step, .. }) => {
                assert_eq!(step, "enable-status-leds")
            }
            x => panic!("expected boot failure, got {x:?}"),
        }
        assert!(switch.failed());
        assert!(!switch.ready());

        // No further hardware access is attempted.
        match switch.port_enable(1) {
            Err(LcpdError::Failed) => (),
            x => panic!("expected Failed, got {x:?}"),
        }
    }

    #[test]
    fn dead_chip_fails_alive_check() {
        let (io, switch) = sim_switch(SimPlatform::new(4));
        let family = Kestrel::new();
        io.wedge(family.regs().chip_id, 0xdead_beef);

        match switch.boot(None) {
            Err(LcpdError::Boot { step, .. }) => {
                assert_eq!(step, "alive-check")
            }
            x => panic!("expected boot failure, got {x:?}"),
        }
        assert!(switch.failed());
    }

    #[test]
    fn restricted_sku_clamps_clock() -> anyhow::Result<()> {
        let (io, switch) = sim_switch(SimPlatform::new(4));
        let family = Kestrel::new();
        // SKU code 1: 300/400/500/600 MHz menu.
        use hal::RegisterIo;
        io.write32(family.regs().fuse_sku, 1).unwrap();

        switch.boot(None)?;
        let clock = switch.fabric_clock().unwrap();
        assert_eq!(clock.freq_hz, 600_000_000);
        Ok(())
    }

    #[test]
    fn glort_ranges_validated_and_disjoint() -> anyhow::Result<()> {
        let (_io, switch) = sim_switch(SimPlatform::new(8));
        switch.boot(None)?;

        // Per-port glorts are dense above the per-port base; the CPU
        // lives in its own range.
        let cpu = switch.port_view(CPU_LOGICAL_PORT)?;
        let p1 = switch.port_view(1)?;
        let p2 = switch.port_view(2)?;
        assert_eq!(p2.glort, p1.glort + 1);
        assert_ne!(cpu.glort, p1.glort);
        Ok(())
    }
}
