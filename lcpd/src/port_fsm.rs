// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The per-port lifecycle state machine.
//!
//! Every port binds one of three concrete transition tables, chosen by its
//! type when the lane/endpoint mapping is first resolved: plain Ethernet
//! ports negotiate and train; PCI-express endpoints skip negotiation; ports
//! with no physical layer bind a stub that jumps straight to forwarding.

use std::convert::TryFrom;
use std::fmt;

use common::ports::PortType;

use crate::fsm;
use crate::fsm::Effect;
use crate::fsm::Transition;
use crate::fsm::TransitionTable;
use crate::types::LcpdError;

/// The individual states in the port lifecycle machine.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
pub enum PortState {
    /// Administratively down; lanes powered off
    #[default]
    Disabled,
    /// Enabled, lane bring-up underway, operating mode not yet known
    Starting,
    /// Mode known; negotiating with the partner and/or tuning lanes
    Negotiating,
    /// Passing traffic
    Up,
    /// A link fault took the port out of service
    Faulted,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<PortState> for fsm::State {
    fn from(s: PortState) -> Self {
        s as fsm::State
    }
}

impl TryFrom<fsm::State> for PortState {
    type Error = LcpdError;

    fn try_from(s: fsm::State) -> Result<Self, LcpdError> {
        match s {
            0 => Ok(PortState::Disabled),
            1 => Ok(PortState::Starting),
            2 => Ok(PortState::Negotiating),
            3 => Ok(PortState::Up),
            4 => Ok(PortState::Faulted),
            x => Err(LcpdError::Fsm(format!("invalid port state {x}"))),
        }
    }
}

/// Events delivered to a port instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::IntoStaticStr)]
pub enum PortEvent {
    /// Administrative enable
    Enable,
    /// The operating mode is now known, by negotiation or configuration
    ModeResolved,
    /// Autonegotiation and link training finished
    AnComplete,
    /// All owned lanes are tuned and passing data
    SerdesReady,
    /// The link went down underneath us
    LinkFault,
    /// The fault condition cleared; resume without renegotiating
    FaultCleared,
    /// The fault condition cleared; renegotiate before resuming
    Renegotiate,
    /// Administrative disable
    Disable,
}

impl From<PortEvent> for fsm::Event {
    fn from(e: PortEvent) -> Self {
        e as fsm::Event
    }
}

/// Domain action codes handed back by port transitions.
pub mod action {
    /// Power the port's lanes and start bring-up (and autonegotiation,
    /// when configured)
    pub const START_LANES: u16 = 0x01;
    /// Program the resolved mode onto the lanes and begin tuning
    pub const APPLY_MODE: u16 = 0x02;
    /// The port reached forwarding state
    pub const MARK_UP: u16 = 0x03;
    /// Stop negotiation and power the lanes down
    pub const QUIESCE_LANES: u16 = 0x04;
    /// The port left forwarding state on a fault
    pub const FAULT_LANES: u16 = 0x05;
}

const S_DISABLED: fsm::State = PortState::Disabled as fsm::State;
const S_STARTING: fsm::State = PortState::Starting as fsm::State;
const S_NEGOTIATING: fsm::State = PortState::Negotiating as fsm::State;
const S_UP: fsm::State = PortState::Up as fsm::State;
const S_FAULTED: fsm::State = PortState::Faulted as fsm::State;

const E_ENABLE: fsm::Event = PortEvent::Enable as fsm::Event;
const E_MODE_RESOLVED: fsm::Event = PortEvent::ModeResolved as fsm::Event;
const E_AN_COMPLETE: fsm::Event = PortEvent::AnComplete as fsm::Event;
const E_SERDES_READY: fsm::Event = PortEvent::SerdesReady as fsm::Event;
const E_LINK_FAULT: fsm::Event = PortEvent::LinkFault as fsm::Event;
const E_FAULT_CLEARED: fsm::Event = PortEvent::FaultCleared as fsm::Event;
const E_RENEGOTIATE: fsm::Event = PortEvent::Renegotiate as fsm::Event;
const E_DISABLE: fsm::Event = PortEvent::Disable as fsm::Event;

const PORT_STATES: &[&str] =
    &["Disabled", "Starting", "Negotiating", "Up", "Faulted"];
const PORT_EVENTS: &[&str] = &[
    "Enable",
    "ModeResolved",
    "AnComplete",
    "SerdesReady",
    "LinkFault",
    "FaultCleared",
    "Renegotiate",
    "Disable",
];

/// The table bound by physical Ethernet ports.
pub const ETHERNET_PORT_FSM: TransitionTable = TransitionTable {
    name: "port-ethernet",
    states: PORT_STATES,
    events: PORT_EVENTS,
    initial: S_DISABLED,
    fatal_unhandled: false,
    transitions: &[
        Transition {
            from: S_DISABLED,
            event: E_ENABLE,
            to: S_STARTING,
            effects: &[Effect::Action(action::START_LANES)],
        },
        Transition {
            from: S_STARTING,
            event: E_MODE_RESOLVED,
            to: S_NEGOTIATING,
            effects: &[Effect::Action(action::APPLY_MODE)],
        },
        Transition {
            from: S_STARTING,
            event: E_DISABLE,
            to: S_DISABLED,
            effects: &[Effect::Action(action::QUIESCE_LANES)],
        },
        Transition {
            from: S_NEGOTIATING,
            event: E_AN_COMPLETE,
            to: S_UP,
            effects: &[Effect::Action(action::MARK_UP)],
        },
        Transition {
            from: S_NEGOTIATING,
            event: E_SERDES_READY,
            to: S_UP,
            effects: &[Effect::Action(action::MARK_UP)],
        },
        Transition {
            from: S_NEGOTIATING,
            event: E_DISABLE,
            to: S_DISABLED,
            effects: &[Effect::Action(action::QUIESCE_LANES)],
        },
        Transition {
            from: S_UP,
            event: E_LINK_FAULT,
            to: S_FAULTED,
            effects: &[Effect::Action(action::FAULT_LANES)],
        },
        Transition {
            from: S_UP,
            event: E_DISABLE,
            to: S_DISABLED,
            effects: &[Effect::Action(action::QUIESCE_LANES)],
        },
        Transition {
            from: S_FAULTED,
            event: E_FAULT_CLEARED,
            to: S_UP,
            effects: &[Effect::Action(action::MARK_UP)],
        },
        Transition {
            from: S_FAULTED,
            event: E_RENEGOTIATE,
            to: S_NEGOTIATING,
            effects: &[Effect::Action(action::APPLY_MODE)],
        },
        Transition {
            from: S_FAULTED,
            event: E_DISABLE,
            to: S_DISABLED,
            effects: &[Effect::Action(action::QUIESCE_LANES)],
        },
    ],
};

/// The table bound by PCI-express endpoint ports: the mode is fixed by the
/// host interface, so there is no autonegotiation path.
pub const PEP_PORT_FSM: TransitionTable = TransitionTable {
    name: "port-pep",
    states: PORT_STATES,
    events: PORT_EVENTS,
    initial: S_DISABLED,
    fatal_unhandled: false,
    transitions: &[
        Transition {
            from: S_DISABLED,
            event: E_ENABLE,
            to: S_STARTING,
            effects: &[Effect::Action(action::START_LANES)],
        },
        Transition {
            from: S_STARTING,
            event: E_MODE_RESOLVED,
            to: S_NEGOTIATING,
            effects: &[Effect::Action(action::APPLY_MODE)],
        },
        Transition {
            from: S_STARTING,
            event: E_DISABLE,
            to: S_DISABLED,
            effects: &[Effect::Action(action::QUIESCE_LANES)],
        },
        Transition {
            from: S_NEGOTIATING,
            event: E_SERDES_READY,
            to: S_UP,
            effects: &[Effect::Action(action::MARK_UP)],
        },
        Transition {
            from: S_NEGOTIATING,
            event: E_DISABLE,
            to: S_DISABLED,
            effects: &[Effect::Action(action::QUIESCE_LANES)],
        },
        Transition {
            from: S_UP,
            event: E_LINK_FAULT,
            to: S_FAULTED,
            effects: &[Effect::Action(action::FAULT_LANES)],
        },
        Transition {
            from: S_UP,
            event: E_DISABLE,
            to: S_DISABLED,
            effects: &[Effect::Action(action::QUIESCE_LANES)],
        },
        Transition {
            from: S_FAULTED,
            event: E_FAULT_CLEARED,
            to: S_UP,
            effects: &[Effect::Action(action::MARK_UP)],
        },
        Transition {
            from: S_FAULTED,
            event: E_DISABLE,
            to: S_DISABLED,
            effects: &[Effect::Action(action::QUIESCE_LANES)],
        },
    ],
};

/// The table bound by ports with no physical layer (CPU, loopback, tunnel
/// engines, LAG pseudo-ports, synthetic destinations).  Any unmodeled event
/// here indicates a design error, so the type opts into fatal handling.
pub const STUB_PORT_FSM: TransitionTable = TransitionTable {
    name: "port-stub",
    states: PORT_STATES,
    events: PORT_EVENTS,
    initial: S_DISABLED,
    fatal_unhandled: true,
    transitions: &[
        Transition {
            from: S_DISABLED,
            event: E_ENABLE,
            to: S_STARTING,
            effects: &[Effect::Action(action::START_LANES)],
        },
        Transition {
            from: S_STARTING,
            event: E_MODE_RESOLVED,
            to: S_UP,
            effects: &[Effect::Action(action::MARK_UP)],
        },
        Transition {
            from: S_STARTING,
            event: E_DISABLE,
            to: S_DISABLED,
            effects: &[],
        },
        Transition {
            from: S_UP,
            event: E_DISABLE,
            to: S_DISABLED,
            effects: &[],
        },
    ],
};

/// Pick the transition table a port of the given type binds to.  The
/// binding is chosen once, when the lane/endpoint mapping for the port is
/// first resolved.
pub fn table_for(port_type: PortType) -> &'static TransitionTable {
    match port_type {
        PortType::Physical => &ETHERNET_PORT_FSM,
        PortType::Pep | PortType::SecondaryManagement => &PEP_PORT_FSM,
        PortType::Cpu
        | PortType::TunnelEngine
        | PortType::Loopback
        | PortType::Lag
        | PortType::Special(_) => &STUB_PORT_FSM,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    // Every `to` state reachable in every table must be a declared state,
    // and Up must only be entered from Negotiating or via the stub's
    // direct mode-resolved path.
    #[test]
    fn tables_are_consistent() {
        for table in [&ETHERNET_PORT_FSM, &PEP_PORT_FSM, &STUB_PORT_FSM] {
            for t in table.transitions {
                assert!((t.from as usize) < table.states.len());
                assert!((t.to as usize) < table.states.len());
                assert!((t.event as usize) < table.events.len());
                if t.to == S_UP && t.from != S_FAULTED {
                    if table.name == "port-stub" {
                        assert_eq!(t.event, E_MODE_RESOLVED);
                    } else {
                        assert_eq!(t.from, S_NEGOTIATING);
                    }
                }
            }
        }
    }

    #[test]
    fn state_conversions() {
        for state in PortState::iter() {
            let raw: crate::fsm::State = state.into();
            assert_eq!(PortState::try_from(raw).unwrap(), state);
        }
        PortState::try_from(9).unwrap_err();
    }

    #[test]
    fn binding_by_type() {
        use common::ports::SpecialPortKind;
        assert_eq!(table_for(PortType::Physical).name, "port-ethernet");
        assert_eq!(table_for(PortType::Pep).name, "port-pep");
        assert_eq!(
            table_for(PortType::Special(SpecialPortKind::Drop)).name,
            "port-stub"
        );
    }
}
