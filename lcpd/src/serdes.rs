// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! SerDes lane bring-up and receiver equalization.
//!
//! Each lane owns two machine instances: one for physical bring-up (power,
//! PLL, signal detect) and one for equalization tuning.  The equalization
//! instance is also the anchor for the eye-quality monitor: when a lane's
//! eye score stays below its configured threshold past its configured
//! timeout, a recovery action fires.  Soft recovery restarts coarse
//! tuning; hard recovery power-cycles the lane.

use std::convert::TryFrom;
use std::fmt;
use std::time::Duration;
use std::time::Instant;

use common::ports::DfeMode;
use common::ports::EthMode;
use common::ports::RecoveryMode;
use common::ports::STATIC_DFE_MAX_MBPS;

use crate::fsm;
use crate::fsm::Effect;
use crate::fsm::Transition;
use crate::fsm::TransitionTable;
use crate::types::LcpdError;
use crate::types::LcpdResult;

/// Progress of a bring-up or tuning pass.
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
pub enum SerdesState {
    #[default]
    NotStarted,
    InProgress,
    Complete,
    Error,
}

impl fmt::Display for SerdesState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<SerdesState> for fsm::State {
    fn from(s: SerdesState) -> Self {
        s as fsm::State
    }
}

impl TryFrom<fsm::State> for SerdesState {
    type Error = LcpdError;

    fn try_from(s: fsm::State) -> Result<Self, LcpdError> {
        match s {
            0 => Ok(SerdesState::NotStarted),
            1 => Ok(SerdesState::InProgress),
            2 => Ok(SerdesState::Complete),
            3 => Ok(SerdesState::Error),
            x => Err(LcpdError::Fsm(format!("invalid serdes state {x}"))),
        }
    }
}

/// Events delivered to lane instances.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::IntoStaticStr)]
pub enum SerdesEvent {
    /// Begin bring-up or tuning
    Start,
    /// The receiver sees a stable signal
    SignalOk,
    /// The tuning pass converged
    TuneDone,
    /// The lane faulted underneath us
    Fault,
    /// Eye degradation recovery: restart from coarse calibration
    RecoverSoft,
    /// Eye degradation recovery: power-cycle the lane
    RecoverHard,
    /// Return to the powered-down initial state
    Reset,
}

impl From<SerdesEvent> for fsm::Event {
    fn from(e: SerdesEvent) -> Self {
        e as fsm::Event
    }
}

/// Domain action codes handed back by lane transitions.
pub mod action {
    /// Power the lane and enable the transmitter/receiver
    pub const POWER_UP: u16 = 0x20;
    /// Power the lane down
    pub const POWER_DOWN: u16 = 0x21;
    /// Bring-up finished; the equalization instance may start
    pub const SIGNAL_READY: u16 = 0x22;
    /// Run coarse calibration
    pub const COARSE_TUNE: u16 = 0x23;
    /// Tuning converged; the owning port may proceed
    pub const TUNED: u16 = 0x24;
    /// Surface a lane fault to the owning port
    pub const REPORT_FAULT: u16 = 0x25;
    /// Hard recovery: power-cycle the lane and redo bring-up
    pub const POWER_CYCLE: u16 = 0x26;
}

const S_NOT_STARTED: fsm::State = SerdesState::NotStarted as fsm::State;
const S_IN_PROGRESS: fsm::State = SerdesState::InProgress as fsm::State;
const S_COMPLETE: fsm::State = SerdesState::Complete as fsm::State;
const S_ERROR: fsm::State = SerdesState::Error as fsm::State;

const E_START: fsm::Event = SerdesEvent::Start as fsm::Event;
const E_SIGNAL_OK: fsm::Event = SerdesEvent::SignalOk as fsm::Event;
const E_TUNE_DONE: fsm::Event = SerdesEvent::TuneDone as fsm::Event;
const E_FAULT: fsm::Event = SerdesEvent::Fault as fsm::Event;
const E_RECOVER_SOFT: fsm::Event = SerdesEvent::RecoverSoft as fsm::Event;
const E_RECOVER_HARD: fsm::Event = SerdesEvent::RecoverHard as fsm::Event;
const E_RESET: fsm::Event = SerdesEvent::Reset as fsm::Event;

const SERDES_STATES: &[&str] =
    &["NotStarted", "InProgress", "Complete", "Error"];
const SERDES_EVENTS: &[&str] = &[
    "Start",
    "SignalOk",
    "TuneDone",
    "Fault",
    "RecoverSoft",
    "RecoverHard",
    "Reset",
];

/// Physical bring-up of a lane.
pub const SERDES_BRINGUP_FSM: TransitionTable = TransitionTable {
    name: "serdes-bringup",
    states: SERDES_STATES,
    events: SERDES_EVENTS,
    initial: S_NOT_STARTED,
    fatal_unhandled: false,
    transitions: &[
        Transition {
            from: S_NOT_STARTED,
            event: E_START,
            to: S_IN_PROGRESS,
            effects: &[Effect::Action(action::POWER_UP)],
        },
        Transition {
            from: S_IN_PROGRESS,
            event: E_SIGNAL_OK,
            to: S_COMPLETE,
            effects: &[Effect::Action(action::SIGNAL_READY)],
        },
        Transition {
            from: S_IN_PROGRESS,
            event: E_FAULT,
            to: S_ERROR,
            effects: &[Effect::Action(action::REPORT_FAULT)],
        },
        Transition {
            from: S_COMPLETE,
            event: E_FAULT,
            to: S_ERROR,
            effects: &[Effect::Action(action::REPORT_FAULT)],
        },
        Transition {
            from: S_IN_PROGRESS,
            event: E_RESET,
            to: S_NOT_STARTED,
            effects: &[Effect::Action(action::POWER_DOWN)],
        },
        Transition {
            from: S_COMPLETE,
            event: E_RESET,
            to: S_NOT_STARTED,
            effects: &[Effect::Action(action::POWER_DOWN)],
        },
        Transition {
            from: S_ERROR,
            event: E_RESET,
            to: S_NOT_STARTED,
            effects: &[Effect::Action(action::POWER_DOWN)],
        },
    ],
};

/// Receiver equalization tuning of a lane.
pub const SERDES_EQ_FSM: TransitionTable = TransitionTable {
    name: "serdes-eq",
    states: SERDES_STATES,
    events: SERDES_EVENTS,
    initial: S_NOT_STARTED,
    fatal_unhandled: false,
    transitions: &[
        Transition {
            from: S_NOT_STARTED,
            event: E_START,
            to: S_IN_PROGRESS,
            effects: &[Effect::Action(action::COARSE_TUNE)],
        },
        Transition {
            from: S_ERROR,
            event: E_START,
            to: S_IN_PROGRESS,
            effects: &[Effect::Action(action::COARSE_TUNE)],
        },
        Transition {
            from: S_IN_PROGRESS,
            event: E_TUNE_DONE,
            to: S_COMPLETE,
            effects: &[Effect::Action(action::TUNED)],
        },
        Transition {
            from: S_IN_PROGRESS,
            event: E_FAULT,
            to: S_ERROR,
            effects: &[Effect::Action(action::REPORT_FAULT)],
        },
        Transition {
            from: S_COMPLETE,
            event: E_RECOVER_SOFT,
            to: S_IN_PROGRESS,
            effects: &[Effect::Action(action::COARSE_TUNE)],
        },
        Transition {
            from: S_COMPLETE,
            event: E_RECOVER_HARD,
            to: S_ERROR,
            effects: &[Effect::Action(action::POWER_CYCLE)],
        },
        Transition {
            from: S_IN_PROGRESS,
            event: E_RESET,
            to: S_NOT_STARTED,
            effects: &[],
        },
        Transition {
            from: S_COMPLETE,
            event: E_RESET,
            to: S_NOT_STARTED,
            effects: &[],
        },
        Transition {
            from: S_ERROR,
            event: E_RESET,
            to: S_NOT_STARTED,
            effects: &[],
        },
    ],
};

/// Pick the tuning mode a lane will run for the given interface mode,
/// honoring an explicit per-lane request where the silicon allows it.
pub fn select_dfe_mode(
    requested: Option<DfeMode>,
    mode: EthMode,
) -> LcpdResult<DfeMode> {
    if mode.lane_rate_mbps() <= STATIC_DFE_MAX_MBPS {
        // Slow lanes cannot run adaptive equalization at all.
        return match requested {
            None | Some(DfeMode::Static) => Ok(DfeMode::Static),
            Some(x) => Err(LcpdError::Invalid(format!(
                "{x} tuning unavailable at {} Mbps; \
                 static coefficients are required",
                mode.lane_rate_mbps()
            ))),
        };
    }
    if mode.requires_hw_assisted_dfe() {
        return match requested {
            None | Some(DfeMode::HardwareAssisted) => {
                Ok(DfeMode::HardwareAssisted)
            }
            // The bench override is allowed everywhere adaptive tuning is.
            Some(DfeMode::InitialCalibrationOnly) => {
                Ok(DfeMode::InitialCalibrationOnly)
            }
            Some(x) => Err(LcpdError::Invalid(format!(
                "{mode} mandates hardware-assisted tuning, not {x}"
            ))),
        };
    }
    Ok(requested.unwrap_or(DfeMode::Continuous))
}

/// The rate-select code programmed into a lane's mode register.
pub fn rate_sel_for(mode: EthMode) -> u8 {
    match mode {
        EthMode::Disabled => 0,
        EthMode::Base1000X => 1,
        EthMode::Serial10G => 2,
        EthMode::Serial25G => 3,
        EthMode::Quad40G => 4,
        EthMode::Dual50G => 5,
        EthMode::Quad100G => 6,
    }
}

/// The equalization code programmed into a lane's mode register.
pub fn dfe_sel_for(mode: DfeMode) -> u8 {
    match mode {
        DfeMode::Static => 0,
        DfeMode::OneShot => 1,
        DfeMode::Continuous => 2,
        DfeMode::HardwareAssisted => 3,
        DfeMode::InitialCalibrationOnly => 4,
    }
}

/// Per-lane eye-quality floor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EyeThresholds {
    pub height: u8,
    pub width: u8,
}

impl Default for EyeThresholds {
    fn default() -> Self {
        EyeThresholds {
            height: 20,
            width: 20,
        }
    }
}

/// Watches one lane's periodic eye-quality score and decides when to fire
/// recovery.  Thresholds, timeout, and the recovery action are all
/// per-lane configuration.
#[derive(Clone, Copy, Debug)]
pub struct EyeMonitor {
    pub thresholds: EyeThresholds,
    pub timeout: Duration,
    pub recovery: RecoveryMode,
    below_since: Option<Instant>,
}

impl EyeMonitor {
    pub fn new(
        thresholds: EyeThresholds,
        timeout: Duration,
        recovery: RecoveryMode,
    ) -> Self {
        EyeMonitor {
            thresholds,
            timeout,
            recovery,
            below_since: None,
        }
    }

    /// Record one eye sample.  Returns the recovery action to take if the
    /// score has now been below threshold for longer than the timeout; the
    /// monitor rearms itself so the action fires once per degradation
    /// episode.
    pub fn observe(
        &mut self,
        height: u8,
        width: u8,
        now: Instant,
    ) -> Option<RecoveryMode> {
        let below = height < self.thresholds.height
            || width < self.thresholds.width;
        if !below {
            self.below_since = None;
            return None;
        }
        match self.below_since {
            None => {
                self.below_since = Some(now);
                None
            }
            Some(since) if now.duration_since(since) >= self.timeout => {
                self.below_since = None;
                Some(self.recovery)
            }
            Some(_) => None,
        }
    }

    /// Forget any degradation in progress, e.g. after a reconfiguration.
    pub fn reset(&mut self) {
        self.below_since = None;
    }
}

impl Default for EyeMonitor {
    fn default() -> Self {
        EyeMonitor::new(
            EyeThresholds::default(),
            Duration::from_secs(1),
            RecoveryMode::Soft,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_required_at_low_rates() {
        assert_eq!(
            select_dfe_mode(None, EthMode::Base1000X).unwrap(),
            DfeMode::Static
        );
        select_dfe_mode(Some(DfeMode::Continuous), EthMode::Base1000X)
            .unwrap_err();
    }

    #[test]
    fn hw_assist_mandated_at_25g() {
        for mode in [EthMode::Serial25G, EthMode::Dual50G, EthMode::Quad100G]
        {
            assert_eq!(
                select_dfe_mode(None, mode).unwrap(),
                DfeMode::HardwareAssisted
            );
        }
        select_dfe_mode(Some(DfeMode::OneShot), EthMode::Quad100G)
            .unwrap_err();
        assert_eq!(
            select_dfe_mode(
                Some(DfeMode::InitialCalibrationOnly),
                EthMode::Serial25G
            )
            .unwrap(),
            DfeMode::InitialCalibrationOnly
        );
    }

    #[test]
    fn ten_gig_defaults_to_continuous() {
        assert_eq!(
            select_dfe_mode(None, EthMode::Serial10G).unwrap(),
            DfeMode::Continuous
        );
        assert_eq!(
            select_dfe_mode(Some(DfeMode::OneShot), EthMode::Quad40G)
                .unwrap(),
            DfeMode::OneShot
        );
    }

    #[test]
    fn monitor_fires_after_timeout() {
        let mut monitor = EyeMonitor::new(
            EyeThresholds::default(),
            Duration::from_millis(10),
            RecoveryMode::Hard,
        );
        let t0 = Instant::now();
        assert_eq!(monitor.observe(40, 40, t0), None);
        assert_eq!(monitor.observe(5, 40, t0), None);
        // Still inside the grace period.
        assert_eq!(
            monitor.observe(5, 40, t0 + Duration::from_millis(5)),
            None
        );
        assert_eq!(
            monitor.observe(5, 40, t0 + Duration::from_millis(15)),
            Some(RecoveryMode::Hard)
        );
        // Rearmed: the next bad sample starts a new episode.
        assert_eq!(
            monitor.observe(5, 40, t0 + Duration::from_millis(16)),
            None
        );
    }

    #[test]
    fn monitor_clears_on_good_sample() {
        let mut monitor = EyeMonitor::new(
            EyeThresholds::default(),
            Duration::from_millis(10),
            RecoveryMode::Soft,
        );
        let t0 = Instant::now();
        assert_eq!(monitor.observe(5, 5, t0), None);
        assert_eq!(
            monitor.observe(40, 40, t0 + Duration::from_millis(5)),
            None
        );
        // The earlier dip no longer counts.
        assert_eq!(
            monitor.observe(5, 5, t0 + Duration::from_millis(20)),
            None
        );
    }
}
