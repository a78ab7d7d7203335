// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The table-driven attribute surface.
//!
//! Attributes are keyed by enumerated identifiers, one enumeration per
//! domain.  Switch-wide and per-port attributes are fully implemented
//! here.  The VLAN, ACL, trigger, QoS, and MAC-table enumerations exist so
//! callers get a typed `Unsupported` answer rather than a silent ignore;
//! those subsystems are external collaborators.
//!
//! Every attribute carries metadata: value type, valid range, default, and
//! applicability.  A set call validates everything before touching any
//! state, so a failure never leaves an attribute partially applied.

use std::fmt;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use common::ports::AutonegMode;
use common::ports::DfeMode;
use common::ports::EthMode;
use common::ports::PortType;
use common::ports::RecoveryMode;

use crate::types::LcpdError;
use crate::types::LcpdResult;

/// Capacity for virtual routers on the supported families.
pub const MAX_VIRTUAL_ROUTERS: u16 = 16;

/// A typed attribute value.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AttrValue {
    Bool(bool),
    U16(u16),
    U32(u32),
    U64(u64),
    Mode(EthMode),
    Autoneg(AutonegMode),
    Dfe(DfeMode),
    Recovery(RecoveryMode),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(v) => write!(f, "{v}"),
            AttrValue::U16(v) => write!(f, "{v}"),
            AttrValue::U32(v) => write!(f, "{v}"),
            AttrValue::U64(v) => write!(f, "{v}"),
            AttrValue::Mode(v) => write!(f, "{v}"),
            AttrValue::Autoneg(v) => write!(f, "{v}"),
            AttrValue::Dfe(v) => write!(f, "{v}"),
            AttrValue::Recovery(v) => write!(f, "{v}"),
        }
    }
}

/// Switch-wide attributes.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, strum::EnumIter, strum::IntoStaticStr,
)]
pub enum SwitchAttr {
    /// Whether the boot sequence has completed (read-only)
    ReadyState,
    /// The synthesized fabric clock frequency in Hz (read-only)
    FabricClockHz,
    /// Include PCI-express endpoints in the flooding destination masks
    IncludePepsInFlooding,
    /// Default link-fail-inhibit timeout for newly enabled ports, in ms
    AnInhibitTimeoutMs,
    /// Number of virtual routers to provision
    VirtualRouterCount,
}

impl SwitchAttr {
    pub fn writable(&self) -> bool {
        !matches!(self, SwitchAttr::ReadyState | SwitchAttr::FabricClockHz)
    }

    pub fn default_value(&self) -> AttrValue {
        match self {
            SwitchAttr::ReadyState => AttrValue::Bool(false),
            SwitchAttr::FabricClockHz => AttrValue::U64(0),
            SwitchAttr::IncludePepsInFlooding => AttrValue::Bool(false),
            SwitchAttr::AnInhibitTimeoutMs => AttrValue::U32(500),
            SwitchAttr::VirtualRouterCount => AttrValue::U16(1),
        }
    }

    /// Type- and range-check a candidate value.
    pub fn validate(&self, value: &AttrValue) -> LcpdResult<()> {
        match (self, value) {
            (SwitchAttr::IncludePepsInFlooding, AttrValue::Bool(_)) => Ok(()),
            (SwitchAttr::AnInhibitTimeoutMs, AttrValue::U32(ms)) => {
                if (10..=10_000).contains(ms) {
                    Ok(())
                } else {
                    Err(LcpdError::Invalid(format!(
                        "inhibit timeout {ms} ms outside [10, 10000]"
                    )))
                }
            }
            (SwitchAttr::VirtualRouterCount, AttrValue::U16(n)) => {
                if *n == 0 {
                    Err(LcpdError::Invalid(
                        "at least one virtual router is required".to_string(),
                    ))
                } else if *n > MAX_VIRTUAL_ROUTERS {
                    // Over-capacity is reported here, at configuration
                    // time, not deferred to first use.
                    Err(LcpdError::Exhausted(format!(
                        "{n} virtual routers exceed capacity \
                         ({MAX_VIRTUAL_ROUTERS})"
                    )))
                } else {
                    Ok(())
                }
            }
            (SwitchAttr::ReadyState | SwitchAttr::FabricClockHz, _) => {
                Err(LcpdError::Invalid(format!(
                    "attribute {self:?} is read-only"
                )))
            }
            _ => Err(LcpdError::Invalid(format!(
                "wrong value type {value} for {self:?}"
            ))),
        }
    }
}

/// Per-port attributes.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, strum::EnumIter, strum::IntoStaticStr,
)]
pub enum PortAttr {
    /// Negotiation protocol variant
    Autoneg,
    /// Skip the anti-looping nonce comparison (loopback testing)
    AnIgnoreNonce,
    /// Link-fail-inhibit timeout in ms
    AnInhibitTimeoutMs,
    /// Explicit equalization tuning mode
    Dfe,
    /// Eye-height floor before recovery is considered
    EyeHeightThreshold,
    /// Eye-width floor before recovery is considered
    EyeWidthThreshold,
    /// How long the eye may sit below threshold before recovery, in ms
    EyeRecoveryTimeoutMs,
    /// Recovery action: soft retune or hard power-cycle
    EyeRecoveryMode,
    /// Interface mode used when autonegotiation is off
    InterfaceMode,
}

impl PortAttr {
    /// Which port types the attribute applies to.  Everything here rides
    /// on SerDes lanes, so only physical Ethernet ports qualify; getting
    /// or setting elsewhere is `Unsupported`, never silently ignored.
    pub fn applies_to(&self, port_type: PortType) -> bool {
        matches!(port_type, PortType::Physical)
    }

    pub fn default_value(&self) -> AttrValue {
        match self {
            PortAttr::Autoneg => AttrValue::Autoneg(AutonegMode::None),
            PortAttr::AnIgnoreNonce => AttrValue::Bool(false),
            PortAttr::AnInhibitTimeoutMs => AttrValue::U32(500),
            PortAttr::Dfe => AttrValue::Dfe(DfeMode::Continuous),
            PortAttr::EyeHeightThreshold => AttrValue::U16(20),
            PortAttr::EyeWidthThreshold => AttrValue::U16(20),
            PortAttr::EyeRecoveryTimeoutMs => AttrValue::U32(1_000),
            PortAttr::EyeRecoveryMode => {
                AttrValue::Recovery(RecoveryMode::Soft)
            }
            PortAttr::InterfaceMode => AttrValue::Mode(EthMode::Serial10G),
        }
    }

    /// Type- and range-check a candidate value.
    pub fn validate(&self, value: &AttrValue) -> LcpdResult<()> {
        match (self, value) {
            (PortAttr::Autoneg, AttrValue::Autoneg(_)) => Ok(()),
            (PortAttr::AnIgnoreNonce, AttrValue::Bool(_)) => Ok(()),
            (PortAttr::AnInhibitTimeoutMs, AttrValue::U32(ms)) => {
                if (10..=10_000).contains(ms) {
                    Ok(())
                } else {
                    Err(LcpdError::Invalid(format!(
                        "inhibit timeout {ms} ms outside [10, 10000]"
                    )))
                }
            }
            (PortAttr::Dfe, AttrValue::Dfe(_)) => Ok(()),
            (
                PortAttr::EyeHeightThreshold | PortAttr::EyeWidthThreshold,
                AttrValue::U16(v),
            ) => {
                if (1..=200).contains(v) {
                    Ok(())
                } else {
                    Err(LcpdError::Invalid(format!(
                        "eye threshold {v} outside [1, 200]"
                    )))
                }
            }
            (PortAttr::EyeRecoveryTimeoutMs, AttrValue::U32(ms)) => {
                if (10..=60_000).contains(ms) {
                    Ok(())
                } else {
                    Err(LcpdError::Invalid(format!(
                        "recovery timeout {ms} ms outside [10, 60000]"
                    )))
                }
            }
            (PortAttr::EyeRecoveryMode, AttrValue::Recovery(_)) => Ok(()),
            (PortAttr::InterfaceMode, AttrValue::Mode(mode)) => {
                if *mode == EthMode::Disabled {
                    Err(LcpdError::Invalid(
                        "use the disable operation, not a mode set"
                            .to_string(),
                    ))
                } else {
                    Ok(())
                }
            }
            _ => Err(LcpdError::Invalid(format!(
                "wrong value type {value} for {self:?}"
            ))),
        }
    }
}

// The remaining attribute domains belong to external collaborators.  The
// enumerations exist so lookups fail with a typed Unsupported error.

macro_rules! external_attr_domain {
    ($name:ident, $($variant:ident),+) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, strum::IntoStaticStr)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn get(&self) -> LcpdResult<AttrValue> {
                Err(LcpdError::Unsupported(format!("{self:?}")))
            }

            pub fn set(&self, _value: AttrValue) -> LcpdResult<()> {
                Err(LcpdError::Unsupported(format!("{self:?}")))
            }
        }
    };
}

external_attr_domain!(VlanAttr, MemberPorts, Mtu, Learning);
external_attr_domain!(AclAttr, Mode, SliceAllocation);
external_attr_domain!(TriggerAttr, Condition, Action, RateLimiter);
external_attr_domain!(QosAttr, SchedulerScheme, Watermarks, PauseMode);
external_attr_domain!(MacTableAttr, AgingTime, StationMoveLimit);

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn defaults_validate_for_writable_attrs() {
        for attr in SwitchAttr::iter().filter(SwitchAttr::writable) {
            attr.validate(&attr.default_value()).unwrap();
        }
        for attr in PortAttr::iter() {
            attr.validate(&attr.default_value()).unwrap();
        }
    }

    #[test]
    fn read_only_attrs_reject_writes() {
        SwitchAttr::ReadyState
            .validate(&AttrValue::Bool(true))
            .unwrap_err();
        SwitchAttr::FabricClockHz
            .validate(&AttrValue::U64(1))
            .unwrap_err();
    }

    #[test]
    fn type_mismatch_rejected() {
        PortAttr::Autoneg.validate(&AttrValue::Bool(true)).unwrap_err();
        PortAttr::EyeRecoveryTimeoutMs
            .validate(&AttrValue::U16(100))
            .unwrap_err();
    }

    #[test]
    fn virtual_router_capacity_reported_at_config_time() {
        SwitchAttr::VirtualRouterCount
            .validate(&AttrValue::U16(MAX_VIRTUAL_ROUTERS))
            .unwrap();
        match SwitchAttr::VirtualRouterCount
            .validate(&AttrValue::U16(MAX_VIRTUAL_ROUTERS + 1))
        {
            Err(LcpdError::Exhausted(_)) => (),
            x => panic!("expected Exhausted, got {x:?}"),
        }
    }

    #[test]
    fn external_domains_are_unsupported() {
        match VlanAttr::Mtu.get() {
            Err(LcpdError::Unsupported(_)) => (),
            x => panic!("expected Unsupported, got {x:?}"),
        }
        QosAttr::Watermarks.set(AttrValue::U32(1)).unwrap_err();
        MacTableAttr::AgingTime.set(AttrValue::U32(300)).unwrap_err();
    }

    #[test]
    fn applicability_is_physical_only() {
        assert!(PortAttr::Dfe.applies_to(PortType::Physical));
        assert!(!PortAttr::Dfe.applies_to(PortType::Cpu));
        assert!(!PortAttr::Autoneg.applies_to(PortType::Pep));
    }
}
