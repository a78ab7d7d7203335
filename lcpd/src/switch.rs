// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The switch instance: the single lock, the state machine bindings, and
//! the event plumbing between ports, negotiation, and lanes.
//!
//! None of the components below run threads of their own.  Hardware
//! interrupts, timer expiries, and attribute calls all enter through the
//! methods here, take the per-switch lock, run every resulting transition
//! to completion, and release the lock on the way out.  Cross-instance
//! notification is explicit: a transition's action codes are interpreted
//! under the same lock and may dispatch further events, which are drained
//! from a work queue before the entry point returns.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use schemars::JsonSchema;
use serde::Serialize;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;

use chip::kestrel::regs;
use chip::FamilyOps;
use chip::Identifiers;
use common::ports::AutonegMode;
use common::ports::DfeMode;
use common::ports::EthMode;
use common::ports::LogicalPort;
use common::ports::PortType;
use common::ports::RecoveryMode;
use hal::LaneHdl;
use hal::Platform;
use hal::RegisterIo;

use crate::attr::AttrValue;
use crate::attr::PortAttr;
use crate::attr::SwitchAttr;
use crate::autoneg;
use crate::autoneg::AnPort;
use crate::autoneg::AnState;
use crate::autoneg::PageDisposition;
use crate::boot;
use crate::clock::ClockChoice;
use crate::fsm;
use crate::fsm::DispatchOutcome;
use crate::fsm::Engine;
use crate::fsm::FsmId;
use crate::fsm::Registry;
use crate::port_fsm;
use crate::port_fsm::PortEvent;
use crate::port_fsm::PortState;
use crate::portmap::CardinalPortMap;
use crate::ports::flood_mask;
use crate::ports::lanes_for_mode;
use crate::ports::LaneTable;
use crate::ports::PortMask;
use crate::ports::PortTable;
use crate::serdes;
use crate::serdes::SerdesEvent;
use crate::serdes::SerdesState;
use crate::types::LcpdError;
use crate::types::LcpdResult;

/// History ring capacity for every state machine instance.
pub(crate) const FSM_HISTORY_CAPACITY: usize = 32;

/// Which domain object a state machine instance belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FsmOwner {
    Port(LogicalPort),
    An(LogicalPort),
    LaneBringup(LaneHdl),
    LaneEq(LaneHdl),
}

/// Register every built-in state machine type.  Registration is a
/// constructor-time step; nothing re-registers at runtime.
fn register_builtin_types(registry: &mut Registry) -> LcpdResult<()> {
    registry.register(&port_fsm::ETHERNET_PORT_FSM)?;
    registry.register(&port_fsm::PEP_PORT_FSM)?;
    registry.register(&port_fsm::STUB_PORT_FSM)?;
    registry.register(&autoneg::SERIAL_AN_FSM)?;
    registry.register(&autoneg::CLAUSE37_AN_FSM)?;
    registry.register(&autoneg::CLAUSE73_AN_FSM)?;
    registry.register(&serdes::SERDES_BRINGUP_FSM)?;
    registry.register(&serdes::SERDES_EQ_FSM)?;
    Ok(())
}

/// Switch-wide configuration knobs, settable through the attribute
/// surface.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SwitchConfig {
    pub include_peps_in_flooding: bool,
    pub an_inhibit_default: Duration,
    pub virtual_routers: u16,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        SwitchConfig {
            include_peps_in_flooding: false,
            an_inhibit_default: Duration::from_millis(500),
            virtual_routers: 1,
        }
    }
}

pub(crate) struct SwitchInner {
    pub log: slog::Logger,
    pub io: Arc<dyn RegisterIo + Send + Sync>,
    pub family: Arc<dyn FamilyOps>,
    pub platform: Box<dyn Platform + Send + Sync>,
    pub registry: Registry,
    pub engine: Engine,
    pub bindings: BTreeMap<FsmId, FsmOwner>,
    pub cardinal: CardinalPortMap,
    pub ports: PortTable,
    pub lanes: LaneTable,
    pub glorts: crate::glort::GlortTable,
    pub config: SwitchConfig,
    pub clock: Option<ClockChoice>,
    pub ready: bool,
    pub failed: bool,
}

/// A switch instance.  All shared state lives behind one lock.
pub struct Switch {
    pub log: slog::Logger,
    pub identifiers: Identifiers,
    inner: Mutex<SwitchInner>,
}

impl Switch {
    pub fn new(
        log: &slog::Logger,
        family: Arc<dyn FamilyOps>,
        io: Arc<dyn RegisterIo + Send + Sync>,
        platform: Box<dyn Platform + Send + Sync>,
    ) -> LcpdResult<Switch> {
        let log = log.new(o!("unit" => "switch"));
        let mut registry = Registry::new();
        register_builtin_types(&mut registry)?;
        let engine = Engine::new(&log);
        let lanes = LaneTable::new(family.as_ref());
        let identifiers =
            Identifiers::new(family.as_ref(), family.identification_word());

        Ok(Switch {
            log: log.clone(),
            identifiers,
            inner: Mutex::new(SwitchInner {
                log,
                io,
                family,
                platform,
                registry,
                engine,
                bindings: BTreeMap::new(),
                cardinal: CardinalPortMap::default(),
                ports: PortTable::new(),
                lanes,
                glorts: crate::glort::GlortTable::new(),
                config: SwitchConfig::default(),
                clock: None,
                ready: false,
                failed: false,
            }),
        })
    }

    /// Run the boot sequence.  `requested_clock_hz` of `None` uses the
    /// family default.
    pub fn boot(&self, requested_clock_hz: Option<u64>) -> LcpdResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_if_failed()?;
        boot::run_boot(&mut inner, requested_clock_hz)
    }

    /// Administratively enable a port.
    pub fn port_enable(&self, logical: LogicalPort) -> LcpdResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_if_failed()?;
        inner.port_admin(logical, true)
    }

    /// Administratively disable a port.
    pub fn port_disable(&self, logical: LogicalPort) -> LcpdResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_if_failed()?;
        inner.port_admin(logical, false)
    }

    /// Deliver a partner autonegotiation page, as the page-received
    /// interrupt handler would.
    pub fn deliver_an_page(
        &self,
        logical: LogicalPort,
        page: u64,
    ) -> LcpdResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_if_failed()?;
        inner.deliver_an_page(logical, page)
    }

    /// Deliver a lane signal change, as the lane interrupt handler would.
    pub fn lane_signal_event(
        &self,
        lane: LaneHdl,
        signal_ok: bool,
    ) -> LcpdResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_if_failed()?;
        let fsm = inner
            .lanes
            .slot(lane)?
            .bringup
            .ok_or_else(|| LcpdError::Missing(format!("lane {lane} fsm")))?;
        let event = if signal_ok {
            SerdesEvent::SignalOk
        } else {
            SerdesEvent::Fault
        };
        inner.dispatch_and_run(fsm, event.into())
    }

    /// Drive timers and the eye monitor.  Called periodically from the
    /// daemon's tick task; a failed instance is left untouched.
    pub fn tick(&self) -> LcpdResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failed {
            return Ok(());
        }
        let outcomes = inner.engine.tick();
        inner.run_outcomes(outcomes)?;
        inner.poll_eyes()
    }

    pub fn get_switch_attr(&self, attr: SwitchAttr) -> LcpdResult<AttrValue> {
        let inner = self.inner.lock().unwrap();
        Ok(match attr {
            SwitchAttr::ReadyState => AttrValue::Bool(inner.ready),
            SwitchAttr::FabricClockHz => {
                AttrValue::U64(inner.clock.map(|c| c.freq_hz).unwrap_or(0))
            }
            SwitchAttr::IncludePepsInFlooding => {
                AttrValue::Bool(inner.config.include_peps_in_flooding)
            }
            SwitchAttr::AnInhibitTimeoutMs => AttrValue::U32(
                inner.config.an_inhibit_default.as_millis() as u32,
            ),
            SwitchAttr::VirtualRouterCount => {
                AttrValue::U16(inner.config.virtual_routers)
            }
        })
    }

    pub fn set_switch_attr(
        &self,
        attr: SwitchAttr,
        value: AttrValue,
    ) -> LcpdResult<()> {
        attr.validate(&value)?;
        let mut inner = self.inner.lock().unwrap();
        inner.fail_if_failed()?;
        match (attr, value) {
            (SwitchAttr::IncludePepsInFlooding, AttrValue::Bool(v)) => {
                inner.config.include_peps_in_flooding = v;
                inner.recompute_flood_masks();
            }
            (SwitchAttr::AnInhibitTimeoutMs, AttrValue::U32(ms)) => {
                inner.config.an_inhibit_default =
                    Duration::from_millis(ms as u64);
            }
            (SwitchAttr::VirtualRouterCount, AttrValue::U16(n)) => {
                inner.config.virtual_routers = n;
            }
            _ => unreachable!("validate() admitted a bad pair"),
        }
        Ok(())
    }

    pub fn get_port_attr(
        &self,
        logical: LogicalPort,
        attr: PortAttr,
    ) -> LcpdResult<AttrValue> {
        let inner = self.inner.lock().unwrap();
        let port = inner.ports.get(logical)?;
        if !attr.applies_to(port.port_type) {
            return Err(LcpdError::Unsupported(format!(
                "{attr:?} on {port}"
            )));
        }
        Ok(match attr {
            PortAttr::Autoneg => AttrValue::Autoneg(port.cfg.an.mode),
            PortAttr::AnIgnoreNonce => {
                AttrValue::Bool(port.cfg.an.ignore_nonce)
            }
            PortAttr::AnInhibitTimeoutMs => {
                AttrValue::U32(port.cfg.an.inhibit.as_millis() as u32)
            }
            PortAttr::Dfe => AttrValue::Dfe(
                port.cfg.dfe.unwrap_or(common::ports::DfeMode::Continuous),
            ),
            PortAttr::EyeHeightThreshold => {
                AttrValue::U16(port.cfg.eye_thresholds.height as u16)
            }
            PortAttr::EyeWidthThreshold => {
                AttrValue::U16(port.cfg.eye_thresholds.width as u16)
            }
            PortAttr::EyeRecoveryTimeoutMs => {
                AttrValue::U32(port.cfg.eye_timeout.as_millis() as u32)
            }
            PortAttr::EyeRecoveryMode => {
                AttrValue::Recovery(port.cfg.recovery)
            }
            PortAttr::InterfaceMode => AttrValue::Mode(port.cfg.static_mode),
        })
    }

    /// Set a per-port attribute.  The value is validated in full before
    /// any state changes, so a failure leaves nothing partially applied.
    pub fn set_port_attr(
        &self,
        logical: LogicalPort,
        attr: PortAttr,
        value: AttrValue,
    ) -> LcpdResult<()> {
        attr.validate(&value)?;
        let mut inner = self.inner.lock().unwrap();
        inner.fail_if_failed()?;
        inner.set_port_attr(logical, attr, value)
    }

    pub fn port_state(&self, logical: LogicalPort) -> LcpdResult<PortState> {
        let inner = self.inner.lock().unwrap();
        let port = inner.ports.get(logical)?;
        let sm = port
            .sm
            .ok_or_else(|| LcpdError::Missing(format!("{port} fsm")))?;
        PortState::try_from(inner.engine.state(sm)?)
    }

    /// The transition history of a port's lifecycle machine.
    pub fn port_history(
        &self,
        logical: LogicalPort,
    ) -> LcpdResult<Vec<fsm::HistoryRecord>> {
        let inner = self.inner.lock().unwrap();
        let port = inner.ports.get(logical)?;
        let sm = port
            .sm
            .ok_or_else(|| LcpdError::Missing(format!("{port} fsm")))?;
        inner.engine.history(sm)
    }

    pub fn port_view(&self, logical: LogicalPort) -> LcpdResult<PortView> {
        let inner = self.inner.lock().unwrap();
        inner.port_view(logical)
    }

    pub fn all_port_views(&self) -> Vec<PortView> {
        let inner = self.inner.lock().unwrap();
        let logicals: Vec<_> =
            inner.ports.iter().map(|p| p.logical).collect();
        logicals
            .iter()
            .filter_map(|lp| inner.port_view(*lp).ok())
            .collect()
    }

    /// The negotiation machine's state, if the port is negotiating.
    pub fn an_state(
        &self,
        logical: LogicalPort,
    ) -> LcpdResult<Option<AnState>> {
        let inner = self.inner.lock().unwrap();
        match inner.ports.get(logical)?.an.as_ref() {
            None => Ok(None),
            Some(an) => {
                Ok(Some(AnState::try_from(inner.engine.state(an.fsm)?)?))
            }
        }
    }

    pub fn lane_view(&self, lane: LaneHdl) -> LcpdResult<LaneView> {
        let inner = self.inner.lock().unwrap();
        let slot = inner.lanes.slot(lane)?;
        let state_of = |fsm: Option<FsmId>| match fsm {
            Some(fsm) => inner
                .engine
                .state_name(fsm)
                .map(str::to_string)
                .unwrap_or_else(|_| "gone".to_string()),
            None => "unmanaged".to_string(),
        };
        Ok(LaneView {
            lane: slot.hdl.to_string(),
            owner: slot.owner,
            bringup: state_of(slot.bringup),
            eq: state_of(slot.eq),
            dfe: slot.dfe,
        })
    }

    pub fn ready(&self) -> bool {
        self.inner.lock().unwrap().ready
    }

    pub fn failed(&self) -> bool {
        self.inner.lock().unwrap().failed
    }

    pub fn fabric_clock(&self) -> Option<ClockChoice> {
        self.inner.lock().unwrap().clock
    }
}

/// The public view of one port.
#[derive(Debug, Serialize, JsonSchema)]
pub struct PortView {
    pub logical: LogicalPort,
    pub port_type: PortType,
    pub state: String,
    pub mode: EthMode,
    pub glort: u16,
    pub lanes: Vec<String>,
    pub dest_mask: Option<PortMask>,
}

/// The public view of one lane.
#[derive(Debug, Serialize, JsonSchema)]
pub struct LaneView {
    pub lane: String,
    pub owner: Option<LogicalPort>,
    pub bringup: String,
    pub eq: String,
    pub dfe: DfeMode,
}

impl SwitchInner {
    fn fail_if_failed(&self) -> LcpdResult<()> {
        if self.failed {
            Err(LcpdError::Failed)
        } else {
            Ok(())
        }
    }

    fn port_view(&self, logical: LogicalPort) -> LcpdResult<PortView> {
        let port = self.ports.get(logical)?;
        let state = match port.sm {
            Some(sm) => self.engine.state_name(sm)?.to_string(),
            None => "unmanaged".to_string(),
        };
        Ok(PortView {
            logical: port.logical,
            port_type: port.port_type,
            state,
            mode: port.mode,
            glort: port.glort,
            lanes: port.lanes.iter().map(|l| l.to_string()).collect(),
            dest_mask: port.dest_mask,
        })
    }

    // ---- event plumbing -------------------------------------------------

    pub(crate) fn dispatch_and_run(
        &mut self,
        id: FsmId,
        event: fsm::Event,
    ) -> LcpdResult<()> {
        let out = self.engine.dispatch(id, event)?;
        self.run_outcomes(vec![out])
    }

    pub(crate) fn run_outcomes(
        &mut self,
        outcomes: Vec<DispatchOutcome>,
    ) -> LcpdResult<()> {
        let mut work: VecDeque<DispatchOutcome> = outcomes.into();
        while let Some(out) = work.pop_front() {
            if !out.handled {
                continue;
            }
            for code in out.actions.iter().copied() {
                self.run_action(out.id, code, &mut work)?;
            }
        }
        Ok(())
    }

    fn run_action(
        &mut self,
        id: FsmId,
        code: u16,
        work: &mut VecDeque<DispatchOutcome>,
    ) -> LcpdResult<()> {
        let owner = *self.bindings.get(&id).ok_or_else(|| {
            LcpdError::Fsm(format!("{id} has no owner binding"))
        })?;
        match owner {
            FsmOwner::Port(lp) => self.port_action(lp, code, work),
            FsmOwner::An(lp) => self.an_action(lp, code, work),
            FsmOwner::LaneBringup(lane) => {
                self.lane_bringup_action(lane, code, work)
            }
            FsmOwner::LaneEq(lane) => self.lane_eq_action(lane, code, work),
        }
    }

    fn dispatch_into(
        &mut self,
        id: FsmId,
        event: fsm::Event,
        work: &mut VecDeque<DispatchOutcome>,
    ) -> LcpdResult<()> {
        let out = self.engine.dispatch(id, event)?;
        work.push_back(out);
        Ok(())
    }

    // ---- port actions ---------------------------------------------------

    fn port_action(
        &mut self,
        lp: LogicalPort,
        code: u16,
        work: &mut VecDeque<DispatchOutcome>,
    ) -> LcpdResult<()> {
        match code {
            port_fsm::action::START_LANES => self.start_lanes(lp, work),
            port_fsm::action::APPLY_MODE => self.apply_mode(lp, work),
            port_fsm::action::MARK_UP => {
                let port = self.ports.get(lp)?;
                info!(self.log, "port up";
                    "port" => lp, "mode" => %port.mode);
                Ok(())
            }
            port_fsm::action::QUIESCE_LANES => self.quiesce_lanes(lp, work),
            port_fsm::action::FAULT_LANES => {
                warn!(self.log, "port faulted"; "port" => lp);
                Ok(())
            }
            x => Err(LcpdError::Fsm(format!(
                "unknown port action {x:#x} for port {lp}"
            ))),
        }
    }

    fn start_lanes(
        &mut self,
        lp: LogicalPort,
        work: &mut VecDeque<DispatchOutcome>,
    ) -> LcpdResult<()> {
        self.ensure_an_instance(lp)?;
        let (lanes, an_fsm, sm, port_type, static_mode) = {
            let port = self.ports.get(lp)?;
            (
                port.lanes.clone(),
                port.an.as_ref().map(|an| an.fsm),
                port.sm.expect("managed port"),
                port.port_type,
                port.cfg.static_mode,
            )
        };

        for lane in &lanes {
            let bringup = self.lanes.slot(*lane)?.bringup;
            if let Some(fsm) = bringup {
                if SerdesState::try_from(self.engine.state(fsm)?)?
                    == SerdesState::NotStarted
                {
                    self.dispatch_into(fsm, SerdesEvent::Start.into(), work)?;
                }
            }
        }

        match an_fsm {
            Some(an) => {
                if let Some(an_port) =
                    self.ports.get_mut(lp)?.an.as_mut()
                {
                    an_port.restart();
                }
                self.dispatch_into(an, autoneg::AnEvent::Start.into(), work)?;
            }
            None => {
                // Mode comes straight from configuration.
                if port_type == PortType::Physical {
                    let port = self.ports.get_mut(lp)?;
                    port.mode = static_mode;
                    port.resolved_by_an = false;
                }
                self.dispatch_into(
                    sm,
                    PortEvent::ModeResolved.into(),
                    work,
                )?;
            }
        }
        Ok(())
    }

    /// Program the resolved mode onto the port's lanes, transferring lane
    /// ownership first when the lane grouping widened or narrowed.
    fn apply_mode(
        &mut self,
        lp: LogicalPort,
        work: &mut VecDeque<DispatchOutcome>,
    ) -> LcpdResult<()> {
        let (mode, sm, physical, dfe_req) = {
            let port = self.ports.get(lp)?;
            (
                port.mode,
                port.sm.expect("managed port"),
                port.physical,
                port.cfg.dfe,
            )
        };

        let Some(physical) = physical else {
            // No physical layer underneath: nothing to tune.
            return self.dispatch_into(
                sm,
                PortEvent::SerdesReady.into(),
                work,
            );
        };

        let base = self.family.physical_to_lane(physical)?;
        let new_lanes =
            lanes_for_mode(base, mode, self.family.lanes_per_epl())?;
        let dfe = serdes::select_dfe_mode(dfe_req, mode)?;

        for lane in &new_lanes {
            self.ensure_lane_instances(*lane)?;
        }
        // Ownership transfer is atomic: either every lane moves or none.
        let old_lanes = self.ports.get(lp)?.lanes.clone();
        self.lanes.reassign(lp, &new_lanes)?;
        {
            let port = self.ports.get_mut(lp)?;
            port.lanes = new_lanes.clone();
        }

        // Lanes given up by a narrowing are quiesced before anyone else
        // can claim them.
        for lane in old_lanes.iter().filter(|l| !new_lanes.contains(l)) {
            let slot = self.lanes.slot(*lane)?;
            let (bringup, eq) = (slot.bringup, slot.eq);
            if let Some(eq) = eq {
                if SerdesState::try_from(self.engine.state(eq)?)?
                    != SerdesState::NotStarted
                {
                    self.dispatch_into(eq, SerdesEvent::Reset.into(), work)?;
                }
            }
            if let Some(bringup) = bringup {
                if SerdesState::try_from(self.engine.state(bringup)?)?
                    != SerdesState::NotStarted
                {
                    self.dispatch_into(
                        bringup,
                        SerdesEvent::Reset.into(),
                        work,
                    )?;
                }
            }
        }

        let lane_mode = regs::LaneMode::default()
            .with_rate_sel(serdes::rate_sel_for(mode))
            .with_dfe_sel(serdes::dfe_sel_for(dfe));
        for lane in &new_lanes {
            let addr = self.family.lane_reg(*lane, regs::LANE_MODE);
            self.hw_write(addr, lane_mode.bits())?;

            let (eq, bringup) = {
                let port = self.ports.get(lp)?;
                let slot = self.lanes.slot_mut(*lane)?;
                slot.dfe = dfe;
                slot.monitor = serdes::EyeMonitor::new(
                    port.cfg.eye_thresholds,
                    port.cfg.eye_timeout,
                    port.cfg.recovery,
                );
                (slot.eq, slot.bringup)
            };

            // Restart tuning under the new mode.  Lanes still in
            // bring-up will start tuning when their signal settles.
            if let Some(eq) = eq {
                if SerdesState::try_from(self.engine.state(eq)?)?
                    != SerdesState::NotStarted
                {
                    self.dispatch_into(eq, SerdesEvent::Reset.into(), work)?;
                }
            }
            if let Some(bringup) = bringup {
                match SerdesState::try_from(self.engine.state(bringup)?)? {
                    SerdesState::NotStarted => self.dispatch_into(
                        bringup,
                        SerdesEvent::Start.into(),
                        work,
                    )?,
                    SerdesState::Complete => {
                        if let Some(eq) = eq {
                            self.dispatch_into(
                                eq,
                                SerdesEvent::Start.into(),
                                work,
                            )?;
                        }
                    }
                    _ => (),
                }
            }
        }
        debug!(self.log, "applied mode";
            "port" => lp, "mode" => %mode, "lanes" => new_lanes.len());
        Ok(())
    }

    fn quiesce_lanes(
        &mut self,
        lp: LogicalPort,
        work: &mut VecDeque<DispatchOutcome>,
    ) -> LcpdResult<()> {
        let (lanes, an_fsm) = {
            let port = self.ports.get(lp)?;
            (port.lanes.clone(), port.an.as_ref().map(|an| an.fsm))
        };
        if let Some(an) = an_fsm {
            if AnState::try_from(self.engine.state(an)?)? != AnState::Idle {
                self.dispatch_into(an, autoneg::AnEvent::Stop.into(), work)?;
            }
        }
        for lane in lanes {
            let slot = self.lanes.slot(lane)?;
            let (bringup, eq) = (slot.bringup, slot.eq);
            if let Some(eq) = eq {
                if SerdesState::try_from(self.engine.state(eq)?)?
                    != SerdesState::NotStarted
                {
                    self.dispatch_into(eq, SerdesEvent::Reset.into(), work)?;
                }
            }
            if let Some(bringup) = bringup {
                if SerdesState::try_from(self.engine.state(bringup)?)?
                    != SerdesState::NotStarted
                {
                    self.dispatch_into(
                        bringup,
                        SerdesEvent::Reset.into(),
                        work,
                    )?;
                }
            }
        }
        let port = self.ports.get_mut(lp)?;
        port.mode = EthMode::Disabled;
        port.resolved_by_an = false;
        Ok(())
    }

    // ---- autonegotiation actions ---------------------------------------

    fn an_action(
        &mut self,
        lp: LogicalPort,
        code: u16,
        work: &mut VecDeque<DispatchOutcome>,
    ) -> LcpdResult<()> {
        match code {
            autoneg::action::TX_BASE_PAGE => {
                let (base_lane, page) = {
                    let port = self.ports.get(lp)?;
                    let an = port.an.as_ref().expect("an action without an");
                    (port.lanes.first().copied(), an.local_base)
                };
                if let Some(lane) = base_lane {
                    self.write_tx_page(lane, page)?;
                }
                Ok(())
            }
            autoneg::action::TX_NEXT_PAGE => {
                let (base_lane, next, partner_done, an_fsm) = {
                    let port = self.ports.get_mut(lp)?;
                    let an = port.an.as_mut().expect("an action without an");
                    (
                        port.lanes.first().copied(),
                        an.tx_next_pages.pop_front(),
                        an.partner_pages_done(),
                        an.fsm,
                    )
                };
                match next {
                    Some(page) => {
                        if let Some(lane) = base_lane {
                            self.write_tx_page(lane, page)?;
                        }
                        Ok(())
                    }
                    None if partner_done => self.dispatch_into(
                        an_fsm,
                        autoneg::AnEvent::PagesDone.into(),
                        work,
                    ),
                    None => {
                        // Nothing more to say: send a null page and keep
                        // collecting the partner's.
                        let null = autoneg::Clause73BasePage::new()
                            .with_np(false)
                            .bits();
                        if let Some(lane) = base_lane {
                            self.write_tx_page(lane, null)?;
                        }
                        Ok(())
                    }
                }
            }
            autoneg::action::RESOLVE => {
                let (resolved, sm) = {
                    let port = self.ports.get_mut(lp)?;
                    let sm = port.sm.expect("managed port");
                    let an = port.an.as_mut().expect("an action without an");
                    (an.resolve(), sm)
                };
                match resolved {
                    Some(mode) => {
                        info!(self.log, "negotiation resolved";
                            "port" => lp, "mode" => %mode);
                        let port = self.ports.get_mut(lp)?;
                        port.mode = mode;
                        port.resolved_by_an = true;
                        self.dispatch_into(
                            sm,
                            PortEvent::ModeResolved.into(),
                            work,
                        )
                    }
                    None => {
                        warn!(self.log,
                            "no common technology with partner";
                            "port" => lp);
                        Ok(())
                    }
                }
            }
            autoneg::action::REPORT_FAILED => {
                warn!(self.log,
                    "autonegotiation failed: inhibit timer expired";
                    "port" => lp);
                Ok(())
            }
            x => Err(LcpdError::Fsm(format!(
                "unknown AN action {x:#x} for port {lp}"
            ))),
        }
    }

    fn write_tx_page(&mut self, lane: LaneHdl, page: u64) -> LcpdResult<()> {
        let lo = self.family.lane_reg(lane, regs::AN_TX_LO);
        let hi = self.family.lane_reg(lane, regs::AN_TX_HI);
        self.hw_write(lo, page as u32)?;
        self.hw_write(hi, (page >> 32) as u32)
    }

    // ---- lane actions ---------------------------------------------------

    fn lane_bringup_action(
        &mut self,
        lane: LaneHdl,
        code: u16,
        work: &mut VecDeque<DispatchOutcome>,
    ) -> LcpdResult<()> {
        match code {
            serdes::action::POWER_UP => {
                let ctrl = self.family.lane_reg(lane, regs::LANE_CTRL);
                self.hw_write(ctrl, regs::LaneCtrl::powered_up().bits())?;
                // The signal may already be there; otherwise the lane
                // interrupt will deliver it later.
                let stat_addr = self.family.lane_reg(lane, regs::LANE_STAT);
                let stat =
                    regs::LaneStat::from_bits(self.io.read32(stat_addr)?);
                if stat.signal_ok() {
                    let fsm = self
                        .lanes
                        .slot(lane)?
                        .bringup
                        .expect("action from this instance");
                    self.dispatch_into(
                        fsm,
                        SerdesEvent::SignalOk.into(),
                        work,
                    )?;
                }
                Ok(())
            }
            serdes::action::POWER_DOWN => {
                let ctrl = self.family.lane_reg(lane, regs::LANE_CTRL);
                self.hw_write(ctrl, regs::LaneCtrl::powered_down().bits())
            }
            serdes::action::SIGNAL_READY => {
                let eq = self.lanes.slot(lane)?.eq;
                if let Some(eq) = eq {
                    if SerdesState::try_from(self.engine.state(eq)?)?
                        != SerdesState::InProgress
                    {
                        self.dispatch_into(
                            eq,
                            SerdesEvent::Start.into(),
                            work,
                        )?;
                    }
                }
                Ok(())
            }
            serdes::action::REPORT_FAULT => {
                self.report_lane_fault(lane, work)
            }
            x => Err(LcpdError::Fsm(format!(
                "unknown bring-up action {x:#x} for lane {lane}"
            ))),
        }
    }

    fn lane_eq_action(
        &mut self,
        lane: LaneHdl,
        code: u16,
        work: &mut VecDeque<DispatchOutcome>,
    ) -> LcpdResult<()> {
        match code {
            serdes::action::COARSE_TUNE => {
                // Calibration runs in the tuning hardware; the completion
                // interrupt is immediate on this model.
                self.io.delay_us(500);
                let eq = self
                    .lanes
                    .slot(lane)?
                    .eq
                    .expect("action from this instance");
                self.dispatch_into(eq, SerdesEvent::TuneDone.into(), work)
            }
            serdes::action::TUNED => self.lane_tuned(lane, work),
            serdes::action::REPORT_FAULT => {
                self.report_lane_fault(lane, work)
            }
            serdes::action::POWER_CYCLE => {
                let bringup = self
                    .lanes
                    .slot(lane)?
                    .bringup
                    .ok_or_else(|| {
                        LcpdError::Missing(format!("lane {lane} bring-up"))
                    })?;
                info!(self.log, "power-cycling lane"; "lane" => %lane);
                self.io.delay_us(1_000);
                if SerdesState::try_from(self.engine.state(bringup)?)?
                    != SerdesState::NotStarted
                {
                    self.dispatch_into(
                        bringup,
                        SerdesEvent::Reset.into(),
                        work,
                    )?;
                }
                self.dispatch_into(bringup, SerdesEvent::Start.into(), work)
            }
            x => Err(LcpdError::Fsm(format!(
                "unknown tuning action {x:#x} for lane {lane}"
            ))),
        }
    }

    /// One lane finished tuning; when the whole group is tuned the owning
    /// port can move forward.
    fn lane_tuned(
        &mut self,
        lane: LaneHdl,
        work: &mut VecDeque<DispatchOutcome>,
    ) -> LcpdResult<()> {
        let Some(owner) = self.lanes.slot(lane)?.owner else {
            return Ok(());
        };
        let (sm, lanes, resolved_by_an) = {
            let port = self.ports.get(owner)?;
            (
                port.sm.expect("managed port"),
                port.lanes.clone(),
                port.resolved_by_an,
            )
        };
        for hdl in &lanes {
            let eq = self.lanes.slot(*hdl)?.eq;
            let tuned = match eq {
                Some(eq) => {
                    SerdesState::try_from(self.engine.state(eq)?)?
                        == SerdesState::Complete
                }
                None => false,
            };
            if !tuned {
                return Ok(());
            }
        }

        match PortState::try_from(self.engine.state(sm)?)? {
            PortState::Negotiating => {
                let event = if resolved_by_an {
                    PortEvent::AnComplete
                } else {
                    PortEvent::SerdesReady
                };
                self.dispatch_into(sm, event.into(), work)
            }
            PortState::Faulted => {
                // Recovery finished retuning the group.
                let event = if resolved_by_an {
                    PortEvent::Renegotiate
                } else {
                    PortEvent::FaultCleared
                };
                self.dispatch_into(sm, event.into(), work)
            }
            _ => Ok(()),
        }
    }

    fn report_lane_fault(
        &mut self,
        lane: LaneHdl,
        work: &mut VecDeque<DispatchOutcome>,
    ) -> LcpdResult<()> {
        let Some(owner) = self.lanes.slot(lane)?.owner else {
            return Ok(());
        };
        let sm = self.ports.get(owner)?.sm.expect("managed port");
        if PortState::try_from(self.engine.state(sm)?)? == PortState::Up {
            warn!(self.log, "lane fault"; "lane" => %lane, "port" => owner);
            self.dispatch_into(sm, PortEvent::LinkFault.into(), work)?;
        }
        Ok(())
    }

    // ---- eye monitoring -------------------------------------------------

    /// Sample every active lane's eye score and fire recovery where a
    /// degradation has outlasted its timeout.
    pub(crate) fn poll_eyes(&mut self) -> LcpdResult<()> {
        let now = std::time::Instant::now();
        let mut fired: Vec<(LaneHdl, RecoveryMode, FsmId)> = Vec::new();
        {
            let engine = &self.engine;
            let io = &self.io;
            let family = &self.family;
            for slot in self.lanes.iter_mut() {
                if slot.owner.is_none() {
                    continue;
                }
                let Some(eq) = slot.eq else { continue };
                let monitoring = match SerdesState::try_from(
                    engine.state(eq)?,
                )? {
                    SerdesState::Complete => true,
                    _ => false,
                };
                if !monitoring {
                    slot.monitor.reset();
                    continue;
                }
                let addr = family.lane_reg(slot.hdl, regs::LANE_EYE);
                let eye = regs::LaneEye::from_bits(io.read32(addr)?);
                if let Some(recovery) =
                    slot.monitor.observe(eye.height(), eye.width(), now)
                {
                    fired.push((slot.hdl, recovery, eq));
                }
            }
        }

        for (lane, recovery, eq) in fired {
            warn!(self.log, "eye degradation past timeout";
                "lane" => %lane, "recovery" => %recovery);
            let mut outcomes = Vec::new();
            // The owning port sees the fault first, so the retune
            // completion finds it in Faulted.
            if let Some(owner) = self.lanes.slot(lane)?.owner {
                let sm = self.ports.get(owner)?.sm.expect("managed port");
                if PortState::try_from(self.engine.state(sm)?)?
                    == PortState::Up
                {
                    outcomes
                        .push(self.engine.dispatch(sm, PortEvent::LinkFault.into())?);
                }
            }
            let event = match recovery {
                RecoveryMode::Soft => SerdesEvent::RecoverSoft,
                RecoveryMode::Hard => SerdesEvent::RecoverHard,
            };
            outcomes.push(self.engine.dispatch(eq, event.into())?);
            self.run_outcomes(outcomes)?;
        }
        Ok(())
    }

    // ---- administration -------------------------------------------------

    pub(crate) fn port_admin(
        &mut self,
        logical: LogicalPort,
        enable: bool,
    ) -> LcpdResult<()> {
        let port = self.ports.get(logical)?;
        let sm = port
            .sm
            .ok_or_else(|| LcpdError::Missing(format!("{port} fsm")))?;
        let state = PortState::try_from(self.engine.state(sm)?)?;
        if enable {
            if state != PortState::Disabled {
                return Err(LcpdError::Invalid(format!(
                    "port {logical} is already enabled ({state})"
                )));
            }
            self.dispatch_and_run(sm, PortEvent::Enable.into())
        } else {
            if state == PortState::Disabled {
                return Err(LcpdError::Invalid(format!(
                    "port {logical} is already disabled"
                )));
            }
            self.dispatch_and_run(sm, PortEvent::Disable.into())
        }
    }

    fn deliver_an_page(
        &mut self,
        logical: LogicalPort,
        page: u64,
    ) -> LcpdResult<()> {
        let (an_fsm, an_mode, first_page) = {
            let port = self.ports.get(logical)?;
            let an = port.an.as_ref().ok_or_else(|| {
                LcpdError::Invalid(format!(
                    "port {logical} is not autonegotiating"
                ))
            })?;
            (an.fsm, an.cfg.mode, an.partner_base.is_none())
        };

        match an_mode {
            AutonegMode::Clause73 => {
                let partner = autoneg::Clause73BasePage::from_bits(page);
                if first_page
                    && partner.selector()
                        != autoneg::Clause73BasePage::SELECTOR as u8
                {
                    debug!(self.log, "ignoring page with bad selector";
                        "port" => logical,
                        "selector" => partner.selector());
                    return Ok(());
                }
                debug!(self.log, "partner page";
                    "port" => logical,
                    "ack" => partner.ack(),
                    "np" => partner.np(),
                    "echoed_nonce" => partner.echoed_nonce());
            }
            AutonegMode::Clause37 => {
                let partner =
                    autoneg::Clause37Page::from_bits(page as u32);
                debug!(self.log, "partner page";
                    "port" => logical,
                    "full_duplex" => partner.full_duplex(),
                    "pause" => partner.pause(),
                    "ack" => partner.ack(),
                    "np" => partner.np());
            }
            _ => (),
        }

        let disposition = self
            .ports
            .get_mut(logical)?
            .an
            .as_mut()
            .expect("checked above")
            .accept_page(page);
        match disposition {
            PageDisposition::NonceClash => {
                debug!(self.log,
                    "nonce clash; restarting negotiation";
                    "port" => logical);
                if let Some(an) = self.ports.get_mut(logical)?.an.as_mut() {
                    an.restart();
                }
                self.dispatch_and_run(
                    an_fsm,
                    autoneg::AnEvent::Start.into(),
                )
            }
            PageDisposition::Deliver => {
                // Acknowledge the partner's base page before replying.
                if an_mode == AutonegMode::Clause73 && first_page {
                    let base_lane = {
                        let port = self.ports.get_mut(logical)?;
                        let an =
                            port.an.as_mut().expect("checked above");
                        an.acknowledge_partner(
                            autoneg::Clause73BasePage::from_bits(page),
                        );
                        port.lanes.first().copied()
                    };
                    if let Some(lane) = base_lane {
                        let tx = {
                            let port = self.ports.get(logical)?;
                            port.an
                                .as_ref()
                                .expect("checked above")
                                .local_base
                        };
                        self.write_tx_page(lane, tx)?;
                    }
                }
                self.dispatch_and_run(
                    an_fsm,
                    autoneg::AnEvent::PageReceived.into(),
                )
            }
        }
    }

    fn set_port_attr(
        &mut self,
        logical: LogicalPort,
        attr: PortAttr,
        value: AttrValue,
    ) -> LcpdResult<()> {
        let port = self.ports.get(logical)?;
        if !attr.applies_to(port.port_type) {
            return Err(LcpdError::Unsupported(format!(
                "{attr:?} on {port}"
            )));
        }
        let sm = port.sm.expect("physical ports are managed");
        let enabled = PortState::try_from(self.engine.state(sm)?)?
            != PortState::Disabled;

        // Validate mode interactions before committing anything.
        if let (PortAttr::Dfe, AttrValue::Dfe(dfe)) = (attr, &value) {
            let mode = if port.mode != EthMode::Disabled {
                port.mode
            } else {
                port.cfg.static_mode
            };
            serdes::select_dfe_mode(Some(*dfe), mode)?;
        }

        let mut reconfigure = false;
        {
            let port = self.ports.get_mut(logical)?;
            match (attr, value) {
                (PortAttr::Autoneg, AttrValue::Autoneg(v)) => {
                    reconfigure = port.cfg.an.mode != v && enabled;
                    port.cfg.an.mode = v;
                }
                (PortAttr::AnIgnoreNonce, AttrValue::Bool(v)) => {
                    port.cfg.an.ignore_nonce = v;
                    if let Some(an) = port.an.as_mut() {
                        an.cfg.ignore_nonce = v;
                    }
                }
                (PortAttr::AnInhibitTimeoutMs, AttrValue::U32(ms)) => {
                    port.cfg.an.inhibit = Duration::from_millis(ms as u64);
                }
                (PortAttr::Dfe, AttrValue::Dfe(v)) => {
                    port.cfg.dfe = Some(v);
                }
                (PortAttr::EyeHeightThreshold, AttrValue::U16(v)) => {
                    port.cfg.eye_thresholds.height = v as u8;
                }
                (PortAttr::EyeWidthThreshold, AttrValue::U16(v)) => {
                    port.cfg.eye_thresholds.width = v as u8;
                }
                (PortAttr::EyeRecoveryTimeoutMs, AttrValue::U32(ms)) => {
                    port.cfg.eye_timeout = Duration::from_millis(ms as u64);
                }
                (PortAttr::EyeRecoveryMode, AttrValue::Recovery(v)) => {
                    port.cfg.recovery = v;
                }
                (PortAttr::InterfaceMode, AttrValue::Mode(v)) => {
                    reconfigure = port.cfg.static_mode != v
                        && enabled
                        && port.cfg.an.mode == AutonegMode::None;
                    port.cfg.static_mode = v;
                }
                _ => unreachable!("validate() admitted a bad pair"),
            }
        }

        // Propagate monitor settings to owned lanes immediately.
        let (thresholds, timeout, recovery, lanes) = {
            let port = self.ports.get(logical)?;
            (
                port.cfg.eye_thresholds,
                port.cfg.eye_timeout,
                port.cfg.recovery,
                port.lanes.clone(),
            )
        };
        for lane in lanes {
            let slot = self.lanes.slot_mut(lane)?;
            slot.monitor.thresholds = thresholds;
            slot.monitor.timeout = timeout;
            slot.monitor.recovery = recovery;
        }

        if reconfigure {
            // Mode and protocol changes take effect through a full
            // disable/enable cycle, so lane ownership moves through the
            // same transactional path as any other (re)negotiation.
            self.dispatch_and_run(sm, PortEvent::Disable.into())?;
            self.dispatch_and_run(sm, PortEvent::Enable.into())?;
        }
        Ok(())
    }

    // ---- instance management -------------------------------------------

    /// Create, replace, or drop the port's negotiation instance to match
    /// its configuration.
    fn ensure_an_instance(&mut self, lp: LogicalPort) -> LcpdResult<()> {
        let (mut cfg, physical, existing) = {
            let port = self.ports.get(lp)?;
            (port.cfg.an, port.physical, port.an.as_ref().map(|an| an.fsm))
        };
        // Only the first port of a transceiver group advertises the
        // group's multi-lane abilities.
        if let Some(phys) = physical {
            cfg.first_in_group =
                self.family.physical_to_lane(phys)?.channel == 0;
        }
        let wanted = autoneg::table_for(cfg.mode).map(|t| t.name);
        let current = match existing {
            Some(fsm) => Some(self.engine.type_name(fsm)?),
            None => None,
        };
        if wanted == current {
            if let Some(fsm) = existing {
                self.engine.set_timer_default(fsm, cfg.inhibit)?;
                if let Some(an) = self.ports.get_mut(lp)?.an.as_mut() {
                    an.cfg = cfg;
                }
            }
            return Ok(());
        }

        if let Some(fsm) = existing {
            self.engine.destroy_instance(fsm)?;
            self.bindings.remove(&fsm);
            self.ports.get_mut(lp)?.an = None;
        }
        if let Some(name) = wanted {
            let ty = self
                .registry
                .get(name)
                .expect("registered at construction");
            let fsm = self.engine.create_instance(
                ty,
                format!("port {lp}/an"),
                FSM_HISTORY_CAPACITY,
                cfg.inhibit,
            );
            self.bindings.insert(fsm, FsmOwner::An(lp));
            self.ports.get_mut(lp)?.an = Some(AnPort::new(cfg, fsm));
        }
        Ok(())
    }

    /// Make sure a lane slot exists and carries its two machine
    /// instances.
    pub(crate) fn ensure_lane_instances(
        &mut self,
        lane: LaneHdl,
    ) -> LcpdResult<()> {
        let needs = {
            let slot = self.lanes.init_slot(lane)?;
            slot.bringup.is_none() || slot.eq.is_none()
        };
        if !needs {
            return Ok(());
        }
        let bringup_ty = self
            .registry
            .get(serdes::SERDES_BRINGUP_FSM.name)
            .expect("registered at construction");
        let eq_ty = self
            .registry
            .get(serdes::SERDES_EQ_FSM.name)
            .expect("registered at construction");
        let bringup = self.engine.create_instance(
            bringup_ty,
            format!("lane {lane}/bringup"),
            FSM_HISTORY_CAPACITY,
            Duration::from_millis(500),
        );
        let eq = self.engine.create_instance(
            eq_ty,
            format!("lane {lane}/eq"),
            FSM_HISTORY_CAPACITY,
            Duration::from_millis(500),
        );
        self.bindings.insert(bringup, FsmOwner::LaneBringup(lane));
        self.bindings.insert(eq, FsmOwner::LaneEq(lane));
        let slot = self.lanes.slot_mut(lane)?;
        slot.bringup = Some(bringup);
        slot.eq = Some(eq);
        Ok(())
    }

    /// Recompute the destination masks of the flooding special ports.
    pub(crate) fn recompute_flood_masks(&mut self) {
        let mask =
            flood_mask(self.ports.iter(), self.config.include_peps_in_flooding);
        for port in self.ports.iter_mut() {
            if let PortType::Special(kind) = port.port_type {
                port.dest_mask = Some(if kind.is_flooding() {
                    mask
                } else {
                    PortMask::EMPTY
                });
            }
        }
    }

    /// A verified register write; any failure marks the instance failed.
    pub(crate) fn hw_write(&mut self, addr: u32, val: u32) -> LcpdResult<()> {
        match self.io.write32_verified(addr, val) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(self.log, "hardware write failed";
                    "addr" => format!("{addr:#010x}"), "error" => %e);
                self.failed = true;
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::CPU_LOGICAL_PORT;
    use crate::testutil::sim_switch;
    use chip::sim::SimPlatform;
    use chip::Kestrel;

    fn eye_addr(lane: LaneHdl) -> u32 {
        Kestrel::new().lane_reg(lane, regs::LANE_EYE)
    }

    fn lane_ctrl_addr(lane: LaneHdl) -> u32 {
        Kestrel::new().lane_reg(lane, regs::LANE_CTRL)
    }

    fn read_tx_page(io: &chip::sim::SimRegisterIo, lane: LaneHdl) -> u64 {
        let family = Kestrel::new();
        let lo = io.read32(family.lane_reg(lane, regs::AN_TX_LO)).unwrap();
        let hi = io.read32(family.lane_reg(lane, regs::AN_TX_HI)).unwrap();
        (lo as u64) | ((hi as u64) << 32)
    }

    fn states_visited(
        switch: &Switch,
        logical: LogicalPort,
    ) -> Vec<PortState> {
        switch
            .port_history(logical)
            .unwrap()
            .iter()
            .filter(|r| r.handled)
            .map(|r| PortState::try_from(r.next).unwrap())
            .collect()
    }

    #[test]
    fn static_port_passes_through_negotiating() -> anyhow::Result<()> {
        let (_io, switch) = sim_switch(SimPlatform::new(8));
        switch.boot(None)?;

        switch.port_enable(1)?;
        assert_eq!(switch.port_state(1)?, PortState::Up);
        assert_eq!(
            states_visited(&switch, 1),
            vec![PortState::Starting, PortState::Negotiating, PortState::Up]
        );
        assert_eq!(switch.port_view(1)?.mode, EthMode::Serial10G);

        let lane = switch.lane_view(LaneHdl::new(0, 0))?;
        assert_eq!(lane.owner, Some(1));
        assert_eq!(lane.bringup, "Complete");
        assert_eq!(lane.eq, "Complete");
        assert_eq!(lane.dfe, DfeMode::Continuous);
        Ok(())
    }

    #[test]
    fn disable_powers_lanes_down() -> anyhow::Result<()> {
        let (io, switch) = sim_switch(SimPlatform::new(8));
        switch.boot(None)?;
        switch.port_enable(1)?;
        assert_eq!(switch.port_state(1)?, PortState::Up);

        switch.port_disable(1)?;
        assert_eq!(switch.port_state(1)?, PortState::Disabled);
        assert_eq!(switch.port_view(1)?.mode, EthMode::Disabled);
        let ctrl = io.read32(lane_ctrl_addr(LaneHdl::new(0, 0))).unwrap();
        assert_eq!(ctrl, regs::LaneCtrl::powered_down().bits());

        // Enabling again brings it all the way back.
        switch.port_enable(1)?;
        assert_eq!(switch.port_state(1)?, PortState::Up);
        Ok(())
    }

    #[test]
    fn clause73_loopback_negotiates_highest_common() -> anyhow::Result<()> {
        // Leave the rest of EPL 0 unpopulated so the port can widen.
        let (io, switch) =
            sim_switch(SimPlatform::new(36).with_unmapped([1, 2, 3]));
        switch.boot(None)?;

        switch.set_port_attr(
            1,
            PortAttr::Autoneg,
            AttrValue::Autoneg(AutonegMode::Clause73),
        )?;
        switch.set_port_attr(
            1,
            PortAttr::AnIgnoreNonce,
            AttrValue::Bool(true),
        )?;
        switch.port_enable(1)?;
        assert_eq!(switch.port_state(1)?, PortState::Starting);
        assert_eq!(switch.an_state(1)?, Some(AnState::BasePage));

        // Loop our own base page back; the nonce clash is ignored.
        let page = read_tx_page(&io, LaneHdl::new(0, 0));
        switch.deliver_an_page(1, page)?;

        assert_eq!(switch.an_state(1)?, Some(AnState::Good));
        assert_eq!(switch.port_state(1)?, PortState::Up);
        let view = switch.port_view(1)?;
        assert_eq!(view.mode, EthMode::Quad100G);
        assert_eq!(view.lanes.len(), 4);
        assert_eq!(
            states_visited(&switch, 1),
            vec![PortState::Starting, PortState::Negotiating, PortState::Up]
        );

        // 25G-class lanes picked up hardware-assisted tuning, and the
        // widened group took ownership of the whole EPL.
        for ch in 0..4 {
            let lane = switch.lane_view(LaneHdl::new(0, ch))?;
            assert_eq!(lane.owner, Some(1));
            assert_eq!(lane.dfe, DfeMode::HardwareAssisted);
        }
        Ok(())
    }

    #[test]
    fn group_follower_negotiates_single_lane() -> anyhow::Result<()> {
        let (io, switch) = sim_switch(SimPlatform::new(8));
        switch.boot(None)?;

        // Port 2 rides channel 1 of EPL 0: not the group owner, so its
        // base page must not offer the multi-lane modes.
        switch.set_port_attr(
            2,
            PortAttr::Autoneg,
            AttrValue::Autoneg(AutonegMode::Clause73),
        )?;
        switch.set_port_attr(
            2,
            PortAttr::AnIgnoreNonce,
            AttrValue::Bool(true),
        )?;
        switch.port_enable(2)?;

        let lane = LaneHdl::new(0, 1);
        let page = autoneg::Clause73BasePage::from_bits(
            read_tx_page(&io, lane),
        );
        assert_eq!(
            page.tech(),
            autoneg::default_tech_abilities(false)
        );

        // Looped back, the best common mode is the fastest single-lane
        // technology.
        switch.deliver_an_page(2, page.bits())?;
        assert_eq!(switch.port_state(2)?, PortState::Up);
        assert_eq!(switch.port_view(2)?.mode, EthMode::Serial25G);
        assert_eq!(switch.port_view(2)?.lanes.len(), 1);
        Ok(())
    }

    #[test]
    fn nonce_clash_restarts_exchange() -> anyhow::Result<()> {
        let (io, switch) = sim_switch(SimPlatform::new(8));
        switch.boot(None)?;
        switch.set_port_attr(
            1,
            PortAttr::Autoneg,
            AttrValue::Autoneg(AutonegMode::Clause73),
        )?;
        switch.port_enable(1)?;

        let page = read_tx_page(&io, LaneHdl::new(0, 0));
        switch.deliver_an_page(1, page)?;

        // The looped-back page was rejected and the exchange restarted.
        assert_eq!(switch.an_state(1)?, Some(AnState::BasePage));
        assert_eq!(switch.port_state(1)?, PortState::Starting);
        Ok(())
    }

    #[test]
    fn inhibit_timer_fails_negotiation() -> anyhow::Result<()> {
        let (_io, switch) = sim_switch(SimPlatform::new(8));
        switch.boot(None)?;
        switch.set_port_attr(
            1,
            PortAttr::Autoneg,
            AttrValue::Autoneg(AutonegMode::Clause73),
        )?;
        switch.set_port_attr(
            1,
            PortAttr::AnInhibitTimeoutMs,
            AttrValue::U32(10),
        )?;
        switch.port_enable(1)?;
        assert_eq!(switch.an_state(1)?, Some(AnState::BasePage));

        std::thread::sleep(Duration::from_millis(20));
        switch.tick()?;

        assert_eq!(switch.an_state(1)?, Some(AnState::Failed));
        assert_eq!(switch.port_state(1)?, PortState::Starting);
        assert!(!states_visited(&switch, 1)
            .contains(&PortState::Negotiating));
        Ok(())
    }

    #[test]
    fn eye_degradation_soft_recovery() -> anyhow::Result<()> {
        let (io, switch) = sim_switch(SimPlatform::new(8));
        switch.boot(None)?;
        switch.set_port_attr(
            1,
            PortAttr::EyeRecoveryTimeoutMs,
            AttrValue::U32(10),
        )?;
        switch.port_enable(1)?;
        assert_eq!(switch.port_state(1)?, PortState::Up);

        let lane = LaneHdl::new(0, 0);
        io.write32(eye_addr(lane), regs::LaneEye::new(2, 2).bits())
            .unwrap();
        switch.tick()?;
        assert_eq!(switch.port_state(1)?, PortState::Up);

        std::thread::sleep(Duration::from_millis(15));
        switch.tick()?;

        // Recovery retuned the lane; the port faulted and came back.
        assert_eq!(switch.port_state(1)?, PortState::Up);
        let visited = states_visited(&switch, 1);
        assert!(visited.contains(&PortState::Faulted));
        assert_eq!(visited.last(), Some(&PortState::Up));
        assert_eq!(switch.lane_view(lane)?.eq, "Complete");
        Ok(())
    }

    #[test]
    fn eye_degradation_hard_recovery() -> anyhow::Result<()> {
        let (io, switch) = sim_switch(SimPlatform::new(8));
        switch.boot(None)?;
        switch.set_port_attr(
            1,
            PortAttr::EyeRecoveryTimeoutMs,
            AttrValue::U32(10),
        )?;
        switch.set_port_attr(
            1,
            PortAttr::EyeRecoveryMode,
            AttrValue::Recovery(RecoveryMode::Hard),
        )?;
        switch.port_enable(1)?;

        let lane = LaneHdl::new(0, 0);
        io.write32(eye_addr(lane), regs::LaneEye::new(2, 2).bits())
            .unwrap();
        switch.tick()?;
        std::thread::sleep(Duration::from_millis(15));
        switch.tick()?;

        // The power-cycle redid bring-up and tuning end to end.
        assert_eq!(switch.port_state(1)?, PortState::Up);
        assert!(states_visited(&switch, 1).contains(&PortState::Faulted));
        let view = switch.lane_view(lane)?;
        assert_eq!(view.bringup, "Complete");
        assert_eq!(view.eq, "Complete");
        let ctrl = io.read32(lane_ctrl_addr(lane)).unwrap();
        assert_eq!(ctrl, regs::LaneCtrl::powered_up().bits());
        Ok(())
    }

    #[test]
    fn mode_change_transfers_lane_ownership() -> anyhow::Result<()> {
        let (_io, switch) =
            sim_switch(SimPlatform::new(36).with_unmapped([1, 2, 3]));
        switch.boot(None)?;

        switch.port_enable(1)?;
        assert_eq!(switch.port_view(1)?.lanes.len(), 1);

        // Widening to four lanes takes the whole EPL transactionally.
        switch.set_port_attr(
            1,
            PortAttr::InterfaceMode,
            AttrValue::Mode(EthMode::Quad40G),
        )?;
        assert_eq!(switch.port_state(1)?, PortState::Up);
        assert_eq!(switch.port_view(1)?.mode, EthMode::Quad40G);
        assert_eq!(switch.port_view(1)?.lanes.len(), 4);
        assert_eq!(
            switch.lane_view(LaneHdl::new(0, 3))?.owner,
            Some(1)
        );

        // Narrowing back releases the extra lanes.
        switch.set_port_attr(
            1,
            PortAttr::InterfaceMode,
            AttrValue::Mode(EthMode::Serial10G),
        )?;
        assert_eq!(switch.port_state(1)?, PortState::Up);
        assert_eq!(switch.port_view(1)?.lanes.len(), 1);
        assert_eq!(switch.lane_view(LaneHdl::new(0, 3))?.owner, None);
        Ok(())
    }

    #[test]
    fn lane_fault_takes_port_down() -> anyhow::Result<()> {
        let (_io, switch) = sim_switch(SimPlatform::new(8));
        switch.boot(None)?;
        switch.port_enable(1)?;
        assert_eq!(switch.port_state(1)?, PortState::Up);

        switch.lane_signal_event(LaneHdl::new(0, 0), false)?;
        assert_eq!(switch.port_state(1)?, PortState::Faulted);
        Ok(())
    }

    #[test]
    fn port_attrs_unsupported_off_physical() -> anyhow::Result<()> {
        let (_io, switch) = sim_switch(SimPlatform::new(8));
        switch.boot(None)?;

        match switch.get_port_attr(CPU_LOGICAL_PORT, PortAttr::Dfe) {
            Err(LcpdError::Unsupported(_)) => (),
            x => panic!("expected Unsupported, got {x:?}"),
        }
        match switch.set_port_attr(
            44,
            PortAttr::Autoneg,
            AttrValue::Autoneg(AutonegMode::Clause73),
        ) {
            Err(LcpdError::Unsupported(_)) => (),
            x => panic!("expected Unsupported, got {x:?}"),
        }
        Ok(())
    }

    #[test]
    fn dfe_conflicts_rejected_at_set_time() -> anyhow::Result<()> {
        let (_io, switch) = sim_switch(SimPlatform::new(8));
        switch.boot(None)?;

        // Serial10G tolerates an explicit OneShot request.
        switch.set_port_attr(
            1,
            PortAttr::Dfe,
            AttrValue::Dfe(DfeMode::OneShot),
        )?;

        // A 1G static-only mode rejects it, atomically: the earlier
        // value survives.
        switch.set_port_attr(
            1,
            PortAttr::InterfaceMode,
            AttrValue::Mode(EthMode::Base1000X),
        )?;
        switch
            .set_port_attr(1, PortAttr::Dfe, AttrValue::Dfe(DfeMode::OneShot))
            .unwrap_err();
        assert_eq!(
            switch.get_port_attr(1, PortAttr::Dfe)?,
            AttrValue::Dfe(DfeMode::OneShot)
        );
        Ok(())
    }
}
