// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::cmp::Ordering;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// Identifies a single SerDes lane by the EPL block that terminates it and
/// the channel within that block.
#[derive(
    Clone, Copy, Debug, Deserialize, Hash, JsonSchema, PartialEq, Serialize,
)]
pub struct LaneHdl {
    pub epl: u8,
    pub channel: u8,
}

impl LaneHdl {
    pub fn new(epl: u8, channel: u8) -> Self {
        LaneHdl { epl, channel }
    }

    /// Flatten to a global lane index, given the family's channels-per-EPL.
    pub fn index(&self, lanes_per_epl: u8) -> usize {
        self.epl as usize * lanes_per_epl as usize + self.channel as usize
    }
}

impl From<&LaneHdl> for u16 {
    fn from(hdl: &LaneHdl) -> Self {
        ((hdl.epl as u16) << 8) | (hdl.channel as u16)
    }
}

impl From<LaneHdl> for u16 {
    fn from(hdl: LaneHdl) -> Self {
        (&hdl).into()
    }
}

impl From<u16> for LaneHdl {
    fn from(item: u16) -> Self {
        LaneHdl {
            epl: (item >> 8) as u8,
            channel: (item & 0xff) as u8,
        }
    }
}

impl Ord for LaneHdl {
    fn cmp(&self, other: &Self) -> Ordering {
        let a: u16 = self.into();
        let b: u16 = other.into();

        a.cmp(&b)
    }
}

impl PartialOrd for LaneHdl {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Eq for LaneHdl {}

impl std::fmt::Display for LaneHdl {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.epl, self.channel)
    }
}

impl std::str::FromStr for LaneHdl {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = "invalid lane name";

        let v: Vec<&str> = s.splitn(2, ':').collect();
        if v.len() != 2 {
            return Err(err);
        }
        let epl = v[0].parse::<u8>().map_err(|_| err)?;
        let channel = v[1].parse::<u8>().map_err(|_| err)?;
        Ok(LaneHdl { epl, channel })
    }
}

#[cfg(test)]
mod tests {
    use super::LaneHdl;

    #[test]
    fn lane_roundtrip() {
        let hdl = LaneHdl::new(3, 2);
        let packed: u16 = hdl.into();
        assert_eq!(LaneHdl::from(packed), hdl);
        assert_eq!("3:2".parse::<LaneHdl>().unwrap(), hdl);
        assert_eq!(hdl.index(4), 14);
    }

    #[test]
    fn lane_ordering() {
        assert!(LaneHdl::new(0, 3) < LaneHdl::new(1, 0));
        assert!(LaneHdl::new(2, 1) < LaneHdl::new(2, 2));
    }
}
