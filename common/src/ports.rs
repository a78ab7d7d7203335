// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Vocabulary types describing ports, interface modes, and tuning modes.

use std::fmt;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// A logical port number, the identifier exposed to software callers.
pub type LogicalPort = u16;

/// A physical port number, fixed by the chip package pinout.
pub type PhysicalPort = u16;

/// A switch-fabric-internal port identifier, distinct from the logical
/// port number.
pub type FabricPort = u16;

/// The synthetic logical ports allocated alongside the real ones.  These
/// exist only as destinations: each carries a destination port-mask rather
/// than any physical resources.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
pub enum SpecialPortKind {
    /// All-ports broadcast
    Broadcast,
    /// Flooding destination for unknown multicast frames
    UnknownMulticast,
    /// Flooding destination for unknown unicast frames
    UnicastFlood,
    /// Frames sent here are silently discarded
    Drop,
    /// Placeholder destination that performs no forwarding action
    NoOp,
    /// Destination for frames failing the reverse-path-forwarding check
    RpfFailure,
}

impl SpecialPortKind {
    /// Flooding destinations carry a computed port-mask; the rest are
    /// drop-class and keep an empty mask.
    pub fn is_flooding(&self) -> bool {
        matches!(
            self,
            SpecialPortKind::Broadcast
                | SpecialPortKind::UnknownMulticast
                | SpecialPortKind::UnicastFlood
        )
    }
}

impl fmt::Display for SpecialPortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Classification of a logical port.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    PartialEq,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PortType {
    /// The management port connected to the host CPU
    Cpu,
    /// A physical Ethernet port backed by SerDes lanes
    Physical,
    /// A PCI-express endpoint exposed to a host
    Pep,
    /// A tunnel-engine port
    TunnelEngine,
    /// An internal loopback port
    Loopback,
    /// A link-aggregation pseudo-port
    Lag,
    /// A PCI-express endpoint reserved for out-of-band management
    SecondaryManagement,
    /// One of the synthetic destinations
    Special(SpecialPortKind),
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortType::Special(kind) => write!(f, "Special({kind})"),
            x => write!(f, "{x:?}"),
        }
    }
}

/// Ethernet interface mode: the combination of speed and lane grouping a
/// port is configured to run.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
pub enum EthMode {
    /// No interface configured
    #[default]
    Disabled,
    /// 1000BASE-X over one lane at 1.25 Gbps
    Base1000X,
    /// 10G serial over one lane at 10.3125 Gbps
    Serial10G,
    /// 25G serial over one lane at 25.78125 Gbps
    Serial25G,
    /// 40G over four 10.3125 Gbps lanes
    Quad40G,
    /// 50G over two 25.78125 Gbps lanes
    Dual50G,
    /// 100G over four 25.78125 Gbps lanes
    Quad100G,
}

impl EthMode {
    /// The number of SerDes lanes the mode occupies.
    pub fn lanes(&self) -> u8 {
        match self {
            EthMode::Disabled => 0,
            EthMode::Base1000X | EthMode::Serial10G | EthMode::Serial25G => 1,
            EthMode::Dual50G => 2,
            EthMode::Quad40G | EthMode::Quad100G => 4,
        }
    }

    /// Per-lane line rate in megabits per second.
    pub fn lane_rate_mbps(&self) -> u32 {
        match self {
            EthMode::Disabled => 0,
            EthMode::Base1000X => 1_250,
            EthMode::Serial10G | EthMode::Quad40G => 10_312,
            EthMode::Serial25G | EthMode::Dual50G | EthMode::Quad100G => {
                25_781
            }
        }
    }

    /// 25G-class lanes mandate hardware-assisted receiver tuning.
    pub fn requires_hw_assisted_dfe(&self) -> bool {
        self.lane_rate_mbps() >= 25_000
    }
}

impl fmt::Display for EthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The link-partner negotiation protocol a port runs before settling on an
/// interface mode.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    PartialEq,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AutonegMode {
    /// The interface mode is configured directly; no negotiation
    #[default]
    None,
    /// Two-wire serial handshake used by 1G serial modes
    SerialGmii,
    /// Base-page exchange with a fixed 32-bit codeword
    Clause37,
    /// Base/next-page exchange with 64-bit codewords and multiple
    /// technology proposals
    Clause73,
}

impl fmt::Display for AutonegMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Receiver equalization tuning mode for a lane.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    PartialEq,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DfeMode {
    /// Fixed coefficients; mandatory below [`STATIC_DFE_MAX_MBPS`]
    Static,
    /// A single calibration pass after signal detection
    OneShot,
    /// Ongoing fine adaptation after the initial calibration
    #[default]
    Continuous,
    /// Tuning delegated to on-chip assist logic
    HardwareAssisted,
    /// Coarse calibration only, for bench debugging
    InitialCalibrationOnly,
}

impl fmt::Display for DfeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Lane rates at or below this cannot run adaptive equalization.
pub const STATIC_DFE_MAX_MBPS: u32 = 2_500;

/// Action taken when a lane's eye quality stays below threshold past its
/// configured timeout.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    PartialEq,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    /// Restart tuning from coarse calibration
    #[default]
    Soft,
    /// Power-cycle the lane and redo bring-up
    Hard,
}

impl fmt::Display for RecoveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn lane_counts_match_rates() {
        for mode in EthMode::iter() {
            if mode == EthMode::Disabled {
                assert_eq!(mode.lanes(), 0);
                continue;
            }
            assert!(mode.lanes() > 0);
            assert!(mode.lane_rate_mbps() > 0);
        }
        assert!(EthMode::Quad100G.requires_hw_assisted_dfe());
        assert!(!EthMode::Serial10G.requires_hw_assisted_dfe());
    }

    #[test]
    fn flooding_specials() {
        let flooding: Vec<_> = SpecialPortKind::iter()
            .filter(SpecialPortKind::is_flooding)
            .collect();
        assert_eq!(
            flooding,
            vec![
                SpecialPortKind::Broadcast,
                SpecialPortKind::UnknownMulticast,
                SpecialPortKind::UnicastFlood,
            ]
        );
    }
}
