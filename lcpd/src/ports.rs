// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Logical port records and the lane-ownership arena.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use schemars::JsonSchema;
use serde::Serialize;

use common::ports::DfeMode;
use common::ports::EthMode;
use common::ports::FabricPort;
use common::ports::LogicalPort;
use common::ports::PhysicalPort;
use common::ports::PortType;
use common::ports::RecoveryMode;
use chip::FamilyOps;
use hal::LaneHdl;

use crate::autoneg::AnConfig;
use crate::autoneg::AnPort;
use crate::fsm::FsmId;
use crate::serdes::EyeMonitor;
use crate::serdes::EyeThresholds;
use crate::types::LcpdError;
use crate::types::LcpdResult;

/// A destination set over logical port numbers.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, JsonSchema,
)]
#[serde(transparent)]
pub struct PortMask(u64);

impl PortMask {
    pub const EMPTY: PortMask = PortMask(0);

    pub fn set(&mut self, port: LogicalPort) {
        debug_assert!((port as usize) < 64);
        self.0 |= 1 << port;
    }

    pub fn contains(&self, port: LogicalPort) -> bool {
        self.0 & (1 << port) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }
}

impl fmt::Display for PortMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Per-port operator configuration, applied through the attribute surface.
#[derive(Clone, Copy, Debug)]
pub struct PortConfig {
    pub an: AnConfig,
    /// Explicit tuning-mode request; `None` lets the mode pick
    pub dfe: Option<DfeMode>,
    pub eye_thresholds: EyeThresholds,
    pub eye_timeout: Duration,
    pub recovery: RecoveryMode,
    /// The mode used when autonegotiation is off
    pub static_mode: EthMode,
}

impl Default for PortConfig {
    fn default() -> Self {
        PortConfig {
            an: AnConfig::default(),
            dfe: None,
            eye_thresholds: EyeThresholds::default(),
            eye_timeout: Duration::from_secs(1),
            recovery: RecoveryMode::Soft,
            static_mode: EthMode::Serial10G,
        }
    }
}

/// One logical port.  Created during boot by the resource allocator and
/// destroyed only at switch teardown.
#[derive(Debug)]
pub struct Port {
    pub logical: LogicalPort,
    pub port_type: PortType,
    pub physical: Option<PhysicalPort>,
    pub fabric: Option<FabricPort>,
    /// The port's glort, from the per-port range
    pub glort: u16,
    /// Current operating mode
    pub mode: EthMode,
    /// Destination mask; only populated on special ports
    pub dest_mask: Option<PortMask>,
    /// Lanes currently owned by this port
    pub lanes: Vec<LaneHdl>,
    /// The port lifecycle machine instance
    pub sm: Option<FsmId>,
    /// Negotiation bookkeeping, when autonegotiation is configured
    pub an: Option<AnPort>,
    /// Whether the current mode came from negotiation (drives the
    /// fault-cleared disposition)
    pub resolved_by_an: bool,
    pub cfg: PortConfig,
}

impl Port {
    pub fn new(logical: LogicalPort, port_type: PortType) -> Self {
        Port {
            logical,
            port_type,
            physical: None,
            fabric: None,
            glort: 0,
            mode: EthMode::Disabled,
            dest_mask: None,
            lanes: Vec::new(),
            sm: None,
            an: None,
            resolved_by_an: false,
            cfg: PortConfig::default(),
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port {} ({})", self.logical, self.port_type)
    }
}

/// All logical ports, keyed by logical port number.
#[derive(Debug, Default)]
pub struct PortTable {
    slots: BTreeMap<LogicalPort, Port>,
    by_physical: BTreeMap<PhysicalPort, LogicalPort>,
}

impl PortTable {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn insert(&mut self, port: Port) -> LcpdResult<()> {
        if self.slots.contains_key(&port.logical) {
            return Err(LcpdError::Exists(format!("{port}")));
        }
        if let Some(phys) = port.physical {
            if self.by_physical.contains_key(&phys) {
                return Err(LcpdError::Exists(format!(
                    "physical port {phys} already allocated"
                )));
            }
            self.by_physical.insert(phys, port.logical);
        }
        self.slots.insert(port.logical, port);
        Ok(())
    }

    pub fn get(&self, logical: LogicalPort) -> LcpdResult<&Port> {
        self.slots
            .get(&logical)
            .ok_or(LcpdError::NoSuchPort(logical))
    }

    pub fn get_mut(&mut self, logical: LogicalPort) -> LcpdResult<&mut Port> {
        self.slots
            .get_mut(&logical)
            .ok_or(LcpdError::NoSuchPort(logical))
    }

    pub fn logical_for_physical(
        &self,
        phys: PhysicalPort,
    ) -> Option<LogicalPort> {
        self.by_physical.get(&phys).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Port> {
        self.slots.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Port> {
        self.slots.values_mut()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Compute the destination mask for a flooding special port: every
/// forwarding-capable endpoint, excluding the CPU, tunnel engines,
/// secondary-management ports, and loopbacks.  PCI-express endpoints are
/// excluded as well unless the flooding flag says otherwise.
pub fn flood_mask<'a>(
    ports: impl Iterator<Item = &'a Port>,
    include_peps: bool,
) -> PortMask {
    let mut mask = PortMask::EMPTY;
    for port in ports {
        let include = match port.port_type {
            PortType::Physical => true,
            PortType::Pep => include_peps,
            PortType::Cpu
            | PortType::TunnelEngine
            | PortType::SecondaryManagement
            | PortType::Loopback
            | PortType::Lag
            | PortType::Special(_) => false,
        };
        if include {
            mask.set(port.logical);
        }
    }
    mask
}

/// One slot in the lane arena.
#[derive(Debug)]
pub struct LaneSlot {
    pub hdl: LaneHdl,
    /// The port this lane is exclusively owned by, if any
    pub owner: Option<LogicalPort>,
    /// Physical bring-up machine instance
    pub bringup: Option<FsmId>,
    /// Equalization machine instance
    pub eq: Option<FsmId>,
    pub monitor: EyeMonitor,
    pub dfe: DfeMode,
}

impl LaneSlot {
    fn new(hdl: LaneHdl) -> Self {
        LaneSlot {
            hdl,
            owner: None,
            bringup: None,
            eq: None,
            monitor: EyeMonitor::default(),
            dfe: DfeMode::default(),
        }
    }
}

/// The lane arena: one fixed-capacity slot per SerDes channel on the die,
/// indexed by the flattened lane number.  Empty slots are lanes no mapped
/// port terminates on.
#[derive(Debug)]
pub struct LaneTable {
    lanes_per_epl: u8,
    slots: Vec<Option<LaneSlot>>,
}

impl LaneTable {
    pub fn new(family: &dyn FamilyOps) -> Self {
        let capacity =
            family.epl_count() as usize * family.lanes_per_epl() as usize;
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        LaneTable {
            lanes_per_epl: family.lanes_per_epl(),
            slots,
        }
    }

    fn index(&self, hdl: LaneHdl) -> usize {
        hdl.index(self.lanes_per_epl)
    }

    /// Populate the slot for a lane that a mapped port terminates on.
    pub fn init_slot(&mut self, hdl: LaneHdl) -> LcpdResult<&mut LaneSlot> {
        let idx = self.index(hdl);
        if idx >= self.slots.len() {
            return Err(LcpdError::Invalid(format!("no such lane {hdl}")));
        }
        if self.slots[idx].is_none() {
            self.slots[idx] = Some(LaneSlot::new(hdl));
        }
        Ok(self.slots[idx].as_mut().unwrap())
    }

    pub fn slot(&self, hdl: LaneHdl) -> LcpdResult<&LaneSlot> {
        self.slots
            .get(self.index(hdl))
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                LcpdError::Missing(format!("lane {hdl} not initialized"))
            })
    }

    pub fn slot_mut(&mut self, hdl: LaneHdl) -> LcpdResult<&mut LaneSlot> {
        let idx = self.index(hdl);
        self.slots
            .get_mut(idx)
            .and_then(Option::as_mut)
            .ok_or_else(|| {
                LcpdError::Missing(format!("lane {hdl} not initialized"))
            })
    }

    /// All initialized slots.
    pub fn iter(&self) -> impl Iterator<Item = &LaneSlot> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut LaneSlot> {
        self.slots.iter_mut().filter_map(Option::as_mut)
    }

    /// Reassign ownership: release every lane `owner` currently holds and
    /// claim `new_lanes` instead, as one atomic operation.  Every
    /// requested lane must be initialized and either free or already held
    /// by `owner`; otherwise nothing changes.
    pub fn reassign(
        &mut self,
        owner: LogicalPort,
        new_lanes: &[LaneHdl],
    ) -> LcpdResult<()> {
        for hdl in new_lanes {
            let slot = self.slot(*hdl)?;
            match slot.owner {
                None => (),
                Some(cur) if cur == owner => (),
                Some(cur) => {
                    return Err(LcpdError::Exists(format!(
                        "lane {hdl} is owned by port {cur}"
                    )));
                }
            }
        }
        for slot in self.iter_mut() {
            if slot.owner == Some(owner) {
                slot.owner = None;
            }
        }
        for hdl in new_lanes {
            self.slot_mut(*hdl)?.owner = Some(owner);
        }
        Ok(())
    }

    /// Release every lane held by `owner`, returning the handles.
    #[allow(dead_code)]
    pub fn release_all(&mut self, owner: LogicalPort) -> Vec<LaneHdl> {
        let mut released = Vec::new();
        for slot in self.iter_mut() {
            if slot.owner == Some(owner) {
                slot.owner = None;
                released.push(slot.hdl);
            }
        }
        released
    }
}

/// The contiguous lane group a mode occupies starting from a port's base
/// lane.  Multi-lane modes must start on a suitably aligned channel and
/// may not cross an EPL boundary.
pub fn lanes_for_mode(
    base: LaneHdl,
    mode: EthMode,
    lanes_per_epl: u8,
) -> LcpdResult<Vec<LaneHdl>> {
    let count = mode.lanes();
    if count == 0 {
        return Ok(Vec::new());
    }
    if base.channel % count != 0 {
        return Err(LcpdError::Invalid(format!(
            "{mode} must start on a {count}-lane boundary, not {base}"
        )));
    }
    if base.channel + count > lanes_per_epl {
        return Err(LcpdError::Invalid(format!(
            "{mode} at {base} would cross the EPL boundary"
        )));
    }
    Ok((0..count)
        .map(|i| LaneHdl::new(base.epl, base.channel + i))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ports::SpecialPortKind;
    use chip::Kestrel;

    fn port(logical: LogicalPort, port_type: PortType) -> Port {
        Port::new(logical, port_type)
    }

    #[test]
    fn flood_mask_exclusions() {
        let mut table = PortTable::new();
        table.insert(port(0, PortType::Cpu)).unwrap();
        table.insert(port(1, PortType::Physical)).unwrap();
        table.insert(port(2, PortType::Physical)).unwrap();
        table.insert(port(10, PortType::TunnelEngine)).unwrap();
        table.insert(port(11, PortType::Loopback)).unwrap();
        table.insert(port(12, PortType::Pep)).unwrap();
        table.insert(port(13, PortType::SecondaryManagement)).unwrap();
        table
            .insert(port(20, PortType::Special(SpecialPortKind::Broadcast)))
            .unwrap();

        let mask = flood_mask(table.iter(), false);
        assert!(mask.contains(1));
        assert!(mask.contains(2));
        for excluded in [0, 10, 11, 12, 13, 20] {
            assert!(!mask.contains(excluded));
        }
        assert_eq!(mask.count(), 2);

        // PEPs join the flood domain only when the flag says so.
        let mask = flood_mask(table.iter(), true);
        assert!(mask.contains(12));
        assert!(!mask.contains(13));
        assert_eq!(mask.count(), 3);
    }

    #[test]
    fn duplicate_allocation_rejected() {
        let mut table = PortTable::new();
        let mut a = port(1, PortType::Physical);
        a.physical = Some(0);
        table.insert(a).unwrap();

        let mut b = port(2, PortType::Physical);
        b.physical = Some(0);
        table.insert(b).unwrap_err();
        table.insert(port(1, PortType::Loopback)).unwrap_err();
    }

    #[test]
    fn lane_reassign_is_transactional() {
        let family = Kestrel::new();
        let mut lanes = LaneTable::new(&family);
        for ch in 0..4 {
            lanes.init_slot(LaneHdl::new(0, ch)).unwrap();
        }

        let one = [LaneHdl::new(0, 0)];
        lanes.reassign(1, &one).unwrap();
        assert_eq!(lanes.slot(LaneHdl::new(0, 0)).unwrap().owner, Some(1));

        // Port 2 takes lane 1; port 1 then tries to widen across it.
        lanes.reassign(2, &[LaneHdl::new(0, 1)]).unwrap();
        let quad: Vec<_> = (0..4).map(|ch| LaneHdl::new(0, ch)).collect();
        lanes.reassign(1, &quad).unwrap_err();

        // The failed transfer left every owner untouched.
        assert_eq!(lanes.slot(LaneHdl::new(0, 0)).unwrap().owner, Some(1));
        assert_eq!(lanes.slot(LaneHdl::new(0, 1)).unwrap().owner, Some(2));
        assert_eq!(lanes.slot(LaneHdl::new(0, 2)).unwrap().owner, None);

        // After port 2 vacates, the widening succeeds and transfers all
        // four lanes in one step.
        lanes.release_all(2);
        lanes.reassign(1, &quad).unwrap();
        for ch in 0..4 {
            assert_eq!(
                lanes.slot(LaneHdl::new(0, ch)).unwrap().owner,
                Some(1)
            );
        }
    }

    #[test]
    fn mode_lane_alignment() {
        let quad =
            lanes_for_mode(LaneHdl::new(2, 0), EthMode::Quad100G, 4).unwrap();
        assert_eq!(quad.len(), 4);
        assert_eq!(quad[3], LaneHdl::new(2, 3));

        lanes_for_mode(LaneHdl::new(2, 1), EthMode::Quad100G, 4)
            .unwrap_err();
        lanes_for_mode(LaneHdl::new(2, 2), EthMode::Dual50G, 4).unwrap();
        lanes_for_mode(LaneHdl::new(2, 3), EthMode::Dual50G, 4).unwrap_err();
        assert_eq!(
            lanes_for_mode(LaneHdl::new(2, 3), EthMode::Serial25G, 4)
                .unwrap()
                .len(),
            1
        );
    }
}
