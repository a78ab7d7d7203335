// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Typed views of the Kestrel register words the control plane programs.
//!
//! Each wrapper documents the field layout of one register and exposes the
//! fields through accessor methods, so no caller ever assembles a raw mask
//! by hand.

/// Offsets of the per-lane registers within a lane's block.  Combine with
/// [`crate::FamilyOps::lane_reg`] to get an address.
pub const LANE_CTRL: u32 = 0x00;
pub const LANE_STAT: u32 = 0x01;
pub const LANE_MODE: u32 = 0x02;
pub const LANE_EYE: u32 = 0x03;
/// Outbound autonegotiation page, low and high words
pub const AN_TX_LO: u32 = 0x04;
pub const AN_TX_HI: u32 = 0x05;
/// Inbound autonegotiation page, low and high words
pub const AN_RX_LO: u32 = 0x06;
pub const AN_RX_HI: u32 = 0x07;

/// Per-domain soft reset control.
///
/// A set bit holds the named domain in reset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SoftReset(u32);

impl SoftReset {
    /// Bit 0: main switch fabric
    const FABRIC: u32 = 1 << 0;
    /// Bit 1: all EPL blocks
    const EPL: u32 = 1 << 1;
    /// Bit 2: tunnel engines
    const TUNNEL: u32 = 1 << 2;
    /// Bit 3: PCI-express endpoints
    const PCIE: u32 = 1 << 3;

    pub fn from_bits(bits: u32) -> Self {
        SoftReset(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    /// All domains held in reset.
    pub fn all_asserted() -> Self {
        SoftReset(Self::FABRIC | Self::EPL | Self::TUNNEL | Self::PCIE)
    }

    pub fn with_epl_released(mut self) -> Self {
        self.0 &= !Self::EPL;
        self
    }

    pub fn with_fabric_released(mut self) -> Self {
        self.0 &= !(Self::FABRIC | Self::TUNNEL | Self::PCIE);
        self
    }

    pub fn fabric_asserted(&self) -> bool {
        self.0 & Self::FABRIC != 0
    }

    pub fn epl_asserted(&self) -> bool {
        self.0 & Self::EPL != 0
    }
}

/// Fabric PLL divider programming.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PllFabricCtrl(u32);

impl PllFabricCtrl {
    pub fn from_bits(bits: u32) -> Self {
        PllFabricCtrl(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Bits [5:0]: reference divider, 1-63
    pub fn refdiv(&self) -> u8 {
        (self.0 & 0x3f) as u8
    }

    pub fn with_refdiv(mut self, val: u8) -> Self {
        self.0 = (self.0 & !0x3f) | (val as u32 & 0x3f);
        self
    }

    /// Bits [11:6]: output divider, 2-63
    pub fn outdiv(&self) -> u8 {
        ((self.0 >> 6) & 0x3f) as u8
    }

    pub fn with_outdiv(mut self, val: u8) -> Self {
        self.0 = (self.0 & !(0x3f << 6)) | ((val as u32 & 0x3f) << 6);
        self
    }

    /// Bit 12: feedback doubler
    pub fn fbdiv4(&self) -> u8 {
        ((self.0 >> 12) & 0x1) as u8
    }

    pub fn with_fbdiv4(mut self, val: u8) -> Self {
        self.0 = (self.0 & !(1 << 12)) | ((val as u32 & 0x1) << 12);
        self
    }

    /// Bits [20:13]: feedback multiplier, 1-255
    pub fn fbdiv255(&self) -> u8 {
        ((self.0 >> 13) & 0xff) as u8
    }

    pub fn with_fbdiv255(mut self, val: u8) -> Self {
        self.0 = (self.0 & !(0xff << 13)) | ((val as u32) << 13);
        self
    }

    /// Bit 31: PLL enable
    pub fn enabled(&self) -> bool {
        self.0 & (1 << 31) != 0
    }

    pub fn with_enabled(mut self, val: bool) -> Self {
        if val {
            self.0 |= 1 << 31;
        } else {
            self.0 &= !(1 << 31);
        }
        self
    }
}

/// Fabric PLL status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PllFabricStat(u32);

impl PllFabricStat {
    pub fn from_bits(bits: u32) -> Self {
        PllFabricStat(bits)
    }

    /// Bit 0: PLL has acquired lock
    pub fn locked(&self) -> bool {
        self.0 & 0x1 != 0
    }
}

/// On-chip memory clear control/status pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemInit(u32);

impl MemInit {
    pub fn from_bits(bits: u32) -> Self {
        MemInit(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Bit 0 of the control word: start clearing all on-chip memories
    pub fn start() -> Self {
        MemInit(0x1)
    }

    /// Bit 0 of the status word: the clear has completed
    pub fn done(&self) -> bool {
        self.0 & 0x1 != 0
    }
}

/// Per-lane control.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LaneCtrl(u32);

impl LaneCtrl {
    /// Bit 0: lane power
    const POWER: u32 = 1 << 0;
    /// Bit 1: transmitter enable
    const TX_EN: u32 = 1 << 1;
    /// Bit 2: receiver enable
    const RX_EN: u32 = 1 << 2;

    pub fn from_bits(bits: u32) -> Self {
        LaneCtrl(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn powered_up() -> Self {
        LaneCtrl(Self::POWER | Self::TX_EN | Self::RX_EN)
    }

    pub fn powered_down() -> Self {
        LaneCtrl(0)
    }

    pub fn powered(&self) -> bool {
        self.0 & Self::POWER != 0
    }
}

/// Per-lane status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LaneStat(u32);

impl LaneStat {
    pub fn from_bits(bits: u32) -> Self {
        LaneStat(bits)
    }

    /// Bit 0: lane PLL locked
    pub fn pll_locked(&self) -> bool {
        self.0 & (1 << 0) != 0
    }

    /// Bit 1: receive signal detected and stable
    pub fn signal_ok(&self) -> bool {
        self.0 & (1 << 1) != 0
    }
}

/// Per-lane operating mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LaneMode(u32);

impl LaneMode {
    pub fn from_bits(bits: u32) -> Self {
        LaneMode(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Bits [3:0]: line-rate select code
    pub fn rate_sel(&self) -> u8 {
        (self.0 & 0xf) as u8
    }

    pub fn with_rate_sel(mut self, val: u8) -> Self {
        self.0 = (self.0 & !0xf) | (val as u32 & 0xf);
        self
    }

    /// Bits [7:4]: equalization mode code
    pub fn dfe_sel(&self) -> u8 {
        ((self.0 >> 4) & 0xf) as u8
    }

    pub fn with_dfe_sel(mut self, val: u8) -> Self {
        self.0 = (self.0 & !(0xf << 4)) | ((val as u32 & 0xf) << 4);
        self
    }
}

/// Per-lane receiver eye quality, sampled by the monitor hardware.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LaneEye(u32);

impl LaneEye {
    pub fn from_bits(bits: u32) -> Self {
        LaneEye(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn new(height: u8, width: u8) -> Self {
        LaneEye((height as u32) | ((width as u32) << 8))
    }

    /// Bits [7:0]: vertical eye opening, arbitrary units
    pub fn height(&self) -> u8 {
        (self.0 & 0xff) as u8
    }

    /// Bits [15:8]: horizontal eye opening, arbitrary units
    pub fn width(&self) -> u8 {
        ((self.0 >> 8) & 0xff) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pll_ctrl_fields() {
        let ctrl = PllFabricCtrl::default()
            .with_refdiv(58)
            .with_outdiv(6)
            .with_fbdiv4(0)
            .with_fbdiv255(189)
            .with_enabled(true);
        assert_eq!(ctrl.refdiv(), 58);
        assert_eq!(ctrl.outdiv(), 6);
        assert_eq!(ctrl.fbdiv4(), 0);
        assert_eq!(ctrl.fbdiv255(), 189);
        assert!(ctrl.enabled());

        let copy = PllFabricCtrl::from_bits(ctrl.bits());
        assert_eq!(copy, ctrl);
    }

    #[test]
    fn eye_packing() {
        let eye = LaneEye::new(40, 33);
        assert_eq!(eye.height(), 40);
        assert_eq!(eye.width(), 33);
    }

    #[test]
    fn reset_release_order() {
        let reset = SoftReset::all_asserted();
        assert!(reset.fabric_asserted());
        assert!(reset.epl_asserted());

        let reset = reset.with_epl_released();
        assert!(reset.fabric_asserted());
        assert!(!reset.epl_asserted());

        let reset = reset.with_fabric_released();
        assert!(!reset.fabric_asserted());
        assert_eq!(reset.bits(), 0);
    }
}
