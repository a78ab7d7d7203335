// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Link-partner autonegotiation.
//!
//! Three protocol variants are supported, selected per port by
//! configuration: a two-wire serial handshake for 1G serial modes, a
//! base-page exchange with a fixed 32-bit codeword, and an extended
//! base/next-page exchange with 64-bit codewords carrying multiple
//! technology proposals.  All variants share the same machine shape:
//! advertise, wait for the partner under a link-fail-inhibit timer, and
//! resolve a single interface mode that is reported to the port machine.

use std::collections::VecDeque;
use std::convert::TryFrom;
use std::fmt;
use std::time::Duration;

use rand::Rng;

use common::ports::AutonegMode;
use common::ports::EthMode;

use crate::fsm;
use crate::fsm::Effect;
use crate::fsm::FsmId;
use crate::fsm::Transition;
use crate::fsm::TransitionTable;
use crate::types::LcpdError;

/// The states of the negotiation machine, shared by all variants.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
pub enum AnState {
    /// Not negotiating
    #[default]
    Idle,
    /// Base page sent, waiting on the partner's
    BasePage,
    /// Exchanging next pages
    NextPage,
    /// Negotiation complete, mode resolved
    Good,
    /// The inhibit timer expired before the exchange completed
    Failed,
}

impl fmt::Display for AnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<AnState> for fsm::State {
    fn from(s: AnState) -> Self {
        s as fsm::State
    }
}

impl TryFrom<fsm::State> for AnState {
    type Error = LcpdError;

    fn try_from(s: fsm::State) -> Result<Self, LcpdError> {
        match s {
            0 => Ok(AnState::Idle),
            1 => Ok(AnState::BasePage),
            2 => Ok(AnState::NextPage),
            3 => Ok(AnState::Good),
            4 => Ok(AnState::Failed),
            x => Err(LcpdError::Fsm(format!("invalid AN state {x}"))),
        }
    }
}

/// Events delivered to a negotiation instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::IntoStaticStr)]
pub enum AnEvent {
    /// Begin (or restart) negotiation
    Start,
    /// A partner page arrived
    PageReceived,
    /// Both sides have exhausted their next pages
    PagesDone,
    /// The link-fail-inhibit timer expired
    InhibitExpired,
    /// Administrative stop
    Stop,
}

impl From<AnEvent> for fsm::Event {
    fn from(e: AnEvent) -> Self {
        e as fsm::Event
    }
}

/// Domain action codes handed back by negotiation transitions.
pub mod action {
    /// Transmit the local base page
    pub const TX_BASE_PAGE: u16 = 0x10;
    /// Transmit the next queued page (or report pages done)
    pub const TX_NEXT_PAGE: u16 = 0x11;
    /// Resolve the negotiated mode and report it to the port machine
    pub const RESOLVE: u16 = 0x12;
    /// Negotiation failed; leave the port out of service
    pub const REPORT_FAILED: u16 = 0x13;
}

const S_IDLE: fsm::State = AnState::Idle as fsm::State;
const S_BASE: fsm::State = AnState::BasePage as fsm::State;
const S_NEXT: fsm::State = AnState::NextPage as fsm::State;
const S_GOOD: fsm::State = AnState::Good as fsm::State;
const S_FAILED: fsm::State = AnState::Failed as fsm::State;

const E_START: fsm::Event = AnEvent::Start as fsm::Event;
const E_PAGE: fsm::Event = AnEvent::PageReceived as fsm::Event;
const E_PAGES_DONE: fsm::Event = AnEvent::PagesDone as fsm::Event;
const E_INHIBIT: fsm::Event = AnEvent::InhibitExpired as fsm::Event;
const E_STOP: fsm::Event = AnEvent::Stop as fsm::Event;

const AN_STATES: &[&str] =
    &["Idle", "BasePage", "NextPage", "Good", "Failed"];
const AN_EVENTS: &[&str] =
    &["Start", "PageReceived", "PagesDone", "InhibitExpired", "Stop"];

// The inhibit timer uses the instance default, which is set from the
// port's configured timeout at instance creation.
const START_EFFECTS: &[Effect] = &[
    Effect::ArmTimer { event: E_INHIBIT, after: None },
    Effect::Action(action::TX_BASE_PAGE),
];

// Both single-page variants share this machine shape; only the codeword
// parsing differs, and that lives in the domain code below.
const SINGLE_PAGE_TRANSITIONS: &[Transition] = &[
    Transition {
        from: S_IDLE,
        event: E_START,
        to: S_BASE,
        effects: START_EFFECTS,
    },
    // A restart mid-exchange (e.g. after a nonce clash) rearms the
    // inhibit timer and retransmits.
    Transition {
        from: S_BASE,
        event: E_START,
        to: S_BASE,
        effects: START_EFFECTS,
    },
    Transition {
        from: S_BASE,
        event: E_PAGE,
        to: S_GOOD,
        effects: &[Effect::CancelTimer, Effect::Action(action::RESOLVE)],
    },
    Transition {
        from: S_BASE,
        event: E_INHIBIT,
        to: S_FAILED,
        effects: &[Effect::Action(action::REPORT_FAILED)],
    },
    Transition {
        from: S_GOOD,
        event: E_START,
        to: S_BASE,
        effects: START_EFFECTS,
    },
    Transition {
        from: S_BASE,
        event: E_STOP,
        to: S_IDLE,
        effects: &[Effect::CancelTimer],
    },
    Transition { from: S_GOOD, event: E_STOP, to: S_IDLE, effects: &[] },
    Transition { from: S_FAILED, event: E_STOP, to: S_IDLE, effects: &[] },
    Transition {
        from: S_FAILED,
        event: E_START,
        to: S_BASE,
        effects: START_EFFECTS,
    },
];

/// Single-page serial handshake: the partner's base page alone resolves
/// the mode.
pub const SERIAL_AN_FSM: TransitionTable = TransitionTable {
    name: "an-serial-gmii",
    states: AN_STATES,
    events: AN_EVENTS,
    initial: S_IDLE,
    fatal_unhandled: false,
    transitions: SINGLE_PAGE_TRANSITIONS,
};

/// Clause-37 style negotiation shares the serial machine shape; only the
/// codeword differs.
pub const CLAUSE37_AN_FSM: TransitionTable = TransitionTable {
    name: "an-clause37",
    states: AN_STATES,
    events: AN_EVENTS,
    initial: S_IDLE,
    fatal_unhandled: false,
    transitions: SINGLE_PAGE_TRANSITIONS,
};

/// Clause-73 style negotiation adds the next-page exchange.
pub const CLAUSE73_AN_FSM: TransitionTable = TransitionTable {
    name: "an-clause73",
    states: AN_STATES,
    events: AN_EVENTS,
    initial: S_IDLE,
    fatal_unhandled: false,
    transitions: &[
        Transition {
            from: S_IDLE,
            event: E_START,
            to: S_BASE,
            effects: START_EFFECTS,
        },
        Transition {
            from: S_BASE,
            event: E_START,
            to: S_BASE,
            effects: START_EFFECTS,
        },
        Transition {
            from: S_NEXT,
            event: E_START,
            to: S_BASE,
            effects: START_EFFECTS,
        },
        Transition {
            from: S_BASE,
            event: E_PAGE,
            to: S_NEXT,
            effects: &[Effect::Action(action::TX_NEXT_PAGE)],
        },
        Transition {
            from: S_NEXT,
            event: E_PAGE,
            to: S_NEXT,
            effects: &[Effect::Action(action::TX_NEXT_PAGE)],
        },
        Transition {
            from: S_NEXT,
            event: E_PAGES_DONE,
            to: S_GOOD,
            effects: &[Effect::CancelTimer, Effect::Action(action::RESOLVE)],
        },
        Transition {
            from: S_BASE,
            event: E_INHIBIT,
            to: S_FAILED,
            effects: &[Effect::Action(action::REPORT_FAILED)],
        },
        Transition {
            from: S_NEXT,
            event: E_INHIBIT,
            to: S_FAILED,
            effects: &[Effect::Action(action::REPORT_FAILED)],
        },
        Transition {
            from: S_GOOD,
            event: E_START,
            to: S_BASE,
            effects: START_EFFECTS,
        },
        Transition {
            from: S_BASE,
            event: E_STOP,
            to: S_IDLE,
            effects: &[Effect::CancelTimer],
        },
        Transition {
            from: S_NEXT,
            event: E_STOP,
            to: S_IDLE,
            effects: &[Effect::CancelTimer],
        },
        Transition { from: S_GOOD, event: E_STOP, to: S_IDLE, effects: &[] },
        Transition {
            from: S_FAILED,
            event: E_STOP,
            to: S_IDLE,
            effects: &[],
        },
        Transition {
            from: S_FAILED,
            event: E_START,
            to: S_BASE,
            effects: START_EFFECTS,
        },
    ],
};

pub fn table_for(mode: AutonegMode) -> Option<&'static TransitionTable> {
    match mode {
        AutonegMode::None => None,
        AutonegMode::SerialGmii => Some(&SERIAL_AN_FSM),
        AutonegMode::Clause37 => Some(&CLAUSE37_AN_FSM),
        AutonegMode::Clause73 => Some(&CLAUSE73_AN_FSM),
    }
}

/// Physical-layer technologies a clause-73 base page can propose, in
/// ability-bit order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::EnumIter)]
pub enum TechAbility {
    Kx1G = 0,
    Kr10G = 1,
    Kr40G4 = 2,
    Kr25G = 3,
    Kr50G2 = 4,
    Kr100G4 = 5,
}

impl TechAbility {
    pub fn bit(&self) -> u32 {
        1 << (*self as u32)
    }

    pub fn eth_mode(&self) -> EthMode {
        match self {
            TechAbility::Kx1G => EthMode::Base1000X,
            TechAbility::Kr10G => EthMode::Serial10G,
            TechAbility::Kr25G => EthMode::Serial25G,
            TechAbility::Kr40G4 => EthMode::Quad40G,
            TechAbility::Kr50G2 => EthMode::Dual50G,
            TechAbility::Kr100G4 => EthMode::Quad100G,
        }
    }
}

// Resolution priority: fastest first.
const TECH_PRIORITY: [TechAbility; 6] = [
    TechAbility::Kr100G4,
    TechAbility::Kr50G2,
    TechAbility::Kr40G4,
    TechAbility::Kr25G,
    TechAbility::Kr10G,
    TechAbility::Kx1G,
];

/// Pick the highest common technology between the local and partner
/// ability fields.
pub fn resolve_hcd(local: u32, partner: u32) -> Option<EthMode> {
    let common = local & partner;
    TECH_PRIORITY
        .iter()
        .find(|t| common & t.bit() != 0)
        .map(TechAbility::eth_mode)
}

/// A 64-bit clause-73 style base page.
///
/// Only the low 48 bits are meaningful; the upper 16 are reserved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Clause73BasePage(u64);

impl Clause73BasePage {
    /// IEEE 802.3 selector value carried in every base page
    pub const SELECTOR: u64 = 0x1;

    pub fn from_bits(bits: u64) -> Self {
        Clause73BasePage(bits)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn new() -> Self {
        Clause73BasePage(Self::SELECTOR)
    }

    /// Bits [4:0]: message selector
    pub fn selector(&self) -> u8 {
        (self.0 & 0x1f) as u8
    }

    /// Bits [9:5]: echo of the partner's transmitted nonce
    pub fn echoed_nonce(&self) -> u8 {
        ((self.0 >> 5) & 0x1f) as u8
    }

    pub fn with_echoed_nonce(mut self, val: u8) -> Self {
        self.0 = (self.0 & !(0x1f << 5)) | (((val & 0x1f) as u64) << 5);
        self
    }

    /// Bit 14: acknowledge
    pub fn ack(&self) -> bool {
        self.0 & (1 << 14) != 0
    }

    pub fn with_ack(mut self, val: bool) -> Self {
        if val {
            self.0 |= 1 << 14;
        } else {
            self.0 &= !(1 << 14);
        }
        self
    }

    /// Bit 15: more pages follow
    pub fn np(&self) -> bool {
        self.0 & (1 << 15) != 0
    }

    pub fn with_np(mut self, val: bool) -> Self {
        if val {
            self.0 |= 1 << 15;
        } else {
            self.0 &= !(1 << 15);
        }
        self
    }

    /// Bits [20:16]: transmitted nonce, the anti-looping discriminator
    pub fn nonce(&self) -> u8 {
        ((self.0 >> 16) & 0x1f) as u8
    }

    pub fn with_nonce(mut self, val: u8) -> Self {
        self.0 = (self.0 & !(0x1f << 16)) | (((val & 0x1f) as u64) << 16);
        self
    }

    /// Bits [45:21]: technology ability field
    pub fn tech(&self) -> u32 {
        ((self.0 >> 21) & 0x1ff_ffff) as u32
    }

    pub fn with_tech(mut self, val: u32) -> Self {
        self.0 = (self.0 & !(0x1ff_ffff << 21))
            | (((val & 0x1ff_ffff) as u64) << 21);
        self
    }
}

/// The fixed 32-bit codeword used by the clause-37 style exchange.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Clause37Page(u32);

impl Clause37Page {
    pub fn from_bits(bits: u32) -> Self {
        Clause37Page(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Bit 5: full duplex supported
    pub fn full_duplex(&self) -> bool {
        self.0 & (1 << 5) != 0
    }

    pub fn with_full_duplex(mut self, val: bool) -> Self {
        if val {
            self.0 |= 1 << 5;
        } else {
            self.0 &= !(1 << 5);
        }
        self
    }

    /// Bits [8:7]: pause ability
    pub fn pause(&self) -> u8 {
        ((self.0 >> 7) & 0x3) as u8
    }

    /// Bit 14: acknowledge
    pub fn ack(&self) -> bool {
        self.0 & (1 << 14) != 0
    }

    /// Bit 15: more pages follow (always clear in this variant)
    pub fn np(&self) -> bool {
        self.0 & (1 << 15) != 0
    }
}

/// Per-port negotiation configuration.
#[derive(Clone, Copy, Debug)]
pub struct AnConfig {
    pub mode: AutonegMode,
    /// Link-fail-inhibit timeout
    pub inhibit: Duration,
    /// Allow negotiation to complete against a port looped back to itself
    /// by skipping the anti-looping nonce comparison (test/debug use)
    pub ignore_nonce: bool,
    /// Whether this port is the first of a group sharing a physical
    /// transceiver; the first port advertises the group's multi-lane
    /// abilities
    pub first_in_group: bool,
}

impl Default for AnConfig {
    fn default() -> Self {
        AnConfig {
            mode: AutonegMode::None,
            inhibit: Duration::from_millis(500),
            ignore_nonce: false,
            first_in_group: true,
        }
    }
}

/// Abilities advertised in the default clause-73 base page.
pub fn default_tech_abilities(first_in_group: bool) -> u32 {
    let single = TechAbility::Kx1G.bit()
        | TechAbility::Kr10G.bit()
        | TechAbility::Kr25G.bit();
    if first_in_group {
        // The group owner may also offer the multi-lane modes.
        single
            | TechAbility::Kr40G4.bit()
            | TechAbility::Kr50G2.bit()
            | TechAbility::Kr100G4.bit()
    } else {
        single
    }
}

/// What to do with a freshly received partner page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageDisposition {
    /// Deliver it to the machine as a PageReceived event
    Deliver,
    /// The partner's nonce matches ours: the wire is looped back.
    /// Restart the exchange with a fresh nonce.
    NonceClash,
}

/// Per-port negotiation bookkeeping, bound to one machine instance.
#[derive(Debug)]
pub struct AnPort {
    pub cfg: AnConfig,
    pub fsm: FsmId,
    /// Our transmitted nonce for the current exchange
    pub nonce: u8,
    /// The base page we advertise
    pub local_base: u64,
    /// Next pages still to transmit
    pub tx_next_pages: VecDeque<u64>,
    /// The partner's base page, once seen
    pub partner_base: Option<u64>,
    /// Next pages collected from the partner
    pub partner_next: Vec<u64>,
}

impl AnPort {
    pub fn new(cfg: AnConfig, fsm: FsmId) -> Self {
        let nonce = fresh_nonce();
        let local_base = match cfg.mode {
            AutonegMode::Clause73 => Clause73BasePage::new()
                .with_nonce(nonce)
                .with_tech(default_tech_abilities(cfg.first_in_group))
                .bits(),
            AutonegMode::Clause37 => {
                Clause37Page::default().with_full_duplex(true).bits() as u64
            }
            // The serial handshake advertises link state and duplex only.
            AutonegMode::SerialGmii | AutonegMode::None => 0,
        };
        AnPort {
            cfg,
            fsm,
            nonce,
            local_base,
            tx_next_pages: VecDeque::new(),
            partner_base: None,
            partner_next: Vec::new(),
        }
    }

    /// Reset the exchange state for a fresh negotiation round.
    pub fn restart(&mut self) {
        self.nonce = fresh_nonce();
        if self.cfg.mode == AutonegMode::Clause73 {
            self.local_base = Clause73BasePage::from_bits(self.local_base)
                .with_nonce(self.nonce)
                .with_ack(false)
                .with_echoed_nonce(0)
                .bits();
        }
        self.partner_base = None;
        self.partner_next.clear();
    }

    /// Record that we have seen the partner's base page: later
    /// transmissions acknowledge it and echo its nonce.
    pub fn acknowledge_partner(&mut self, partner: Clause73BasePage) {
        self.local_base = Clause73BasePage::from_bits(self.local_base)
            .with_echoed_nonce(partner.nonce())
            .with_ack(true)
            .bits();
    }

    /// Classify an arriving partner page and record it.
    pub fn accept_page(&mut self, page: u64) -> PageDisposition {
        if self.cfg.mode == AutonegMode::Clause73
            && self.partner_base.is_none()
            && !self.cfg.ignore_nonce
        {
            let partner = Clause73BasePage::from_bits(page);
            if partner.nonce() == self.nonce {
                return PageDisposition::NonceClash;
            }
        }
        if self.partner_base.is_none() {
            self.partner_base = Some(page);
        } else {
            self.partner_next.push(page);
        }
        PageDisposition::Deliver
    }

    /// True once the partner has signalled its last page.
    pub fn partner_pages_done(&self) -> bool {
        match self.cfg.mode {
            AutonegMode::Clause73 => match self.partner_next.last() {
                Some(page) => !Clause73BasePage::from_bits(*page).np(),
                None => self
                    .partner_base
                    .map(|p| !Clause73BasePage::from_bits(p).np())
                    .unwrap_or(false),
            },
            _ => self.partner_base.is_some(),
        }
    }

    /// Resolve the negotiated mode from the collected pages.
    pub fn resolve(&self) -> Option<EthMode> {
        let partner = self.partner_base?;
        match self.cfg.mode {
            AutonegMode::Clause73 => {
                let local = Clause73BasePage::from_bits(self.local_base);
                let partner = Clause73BasePage::from_bits(partner);
                resolve_hcd(local.tech(), partner.tech())
            }
            AutonegMode::Clause37 => {
                let partner = Clause37Page::from_bits(partner as u32);
                partner.full_duplex().then_some(EthMode::Base1000X)
            }
            AutonegMode::SerialGmii => Some(EthMode::Base1000X),
            AutonegMode::None => None,
        }
    }
}

fn fresh_nonce() -> u8 {
    rand::thread_rng().gen_range(1..=0x1f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_page_fields() {
        let page = Clause73BasePage::new()
            .with_nonce(0x11)
            .with_echoed_nonce(0x0a)
            .with_tech(TechAbility::Kr10G.bit() | TechAbility::Kr25G.bit())
            .with_np(true);
        assert_eq!(page.selector(), 1);
        assert_eq!(page.nonce(), 0x11);
        assert_eq!(page.echoed_nonce(), 0x0a);
        assert!(page.np());
        assert!(!page.ack());
        assert_eq!(
            page.tech(),
            TechAbility::Kr10G.bit() | TechAbility::Kr25G.bit()
        );
    }

    #[test]
    fn hcd_prefers_fastest() {
        let local = default_tech_abilities(true);
        let partner = TechAbility::Kr10G.bit() | TechAbility::Kr100G4.bit();
        assert_eq!(resolve_hcd(local, partner), Some(EthMode::Quad100G));

        let partner = TechAbility::Kr10G.bit();
        assert_eq!(resolve_hcd(local, partner), Some(EthMode::Serial10G));

        assert_eq!(resolve_hcd(local, 0), None);
    }

    #[test]
    fn group_followers_advertise_single_lane_only() {
        let follower = default_tech_abilities(false);
        assert_eq!(follower & TechAbility::Kr100G4.bit(), 0);
        assert_eq!(follower & TechAbility::Kr50G2.bit(), 0);
        assert_ne!(follower & TechAbility::Kr25G.bit(), 0);
    }

    #[test]
    fn nonce_clash_detected_and_ignorable() {
        let cfg = AnConfig {
            mode: AutonegMode::Clause73,
            ..Default::default()
        };
        let mut an = AnPort::new(cfg, crate::fsm::FsmId::test_id());
        let looped = Clause73BasePage::new()
            .with_nonce(an.nonce)
            .with_tech(default_tech_abilities(true))
            .bits();
        assert_eq!(an.accept_page(looped), PageDisposition::NonceClash);

        an.cfg.ignore_nonce = true;
        assert_eq!(an.accept_page(looped), PageDisposition::Deliver);
        assert!(an.partner_base.is_some());
        assert_eq!(an.resolve(), Some(EthMode::Quad100G));
    }

    #[test]
    fn clause37_resolution() {
        let cfg = AnConfig {
            mode: AutonegMode::Clause37,
            ..Default::default()
        };
        let mut an = AnPort::new(cfg, crate::fsm::FsmId::test_id());
        let partner =
            Clause37Page::default().with_full_duplex(true).bits() as u64;
        assert_eq!(an.accept_page(partner), PageDisposition::Deliver);
        assert!(an.partner_pages_done());
        assert_eq!(an.resolve(), Some(EthMode::Base1000X));
    }

    #[test]
    fn restart_rolls_nonce() {
        let cfg = AnConfig {
            mode: AutonegMode::Clause73,
            ..Default::default()
        };
        let mut an = AnPort::new(cfg, crate::fsm::FsmId::test_id());
        an.partner_base = Some(1);
        an.restart();
        assert!(an.partner_base.is_none());
        let page = Clause73BasePage::from_bits(an.local_base);
        assert_eq!(page.nonce(), an.nonce);
        assert_ne!(an.nonce, 0);
    }
}
