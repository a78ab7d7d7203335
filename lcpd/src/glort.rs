// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The glort space: global resource identifiers used to address logical
//! ports and groups across chip and stacking boundaries.
//!
//! The 16-bit glort space is partitioned into disjoint ranges, one per
//! consumer category.  A category's range may be overridden, but only
//! before its first use; once a consumer has been handed a glort from a
//! range, that range is fixed for the life of the switch instance.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use crate::types::LcpdError;
use crate::types::LcpdResult;

/// The consumers among which the glort space is partitioned.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
pub enum GlortCategory {
    Cpu,
    Special,
    PerPort,
    Lag,
    Multicast,
    Mailbox,
}

impl fmt::Display for GlortCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A contiguous glort range, closed at the base and `size` entries long.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlortRange {
    pub base: u16,
    pub size: u16,
}

impl GlortRange {
    pub fn new(base: u16, size: u16) -> Self {
        GlortRange { base, size }
    }

    fn end(&self) -> u32 {
        self.base as u32 + self.size as u32
    }

    fn overlaps(&self, other: &GlortRange) -> bool {
        (self.base as u32) < other.end() && (other.base as u32) < self.end()
    }
}

impl fmt::Display for GlortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#06x}..{:#06x})", self.base, self.end())
    }
}

// Default partitioning.  LAG reserves room for both local and cross-chip
// aggregates; see `LAG_LOCAL_GLORTS`/`LAG_CROSS_GLORTS`.
const DEFAULT_RANGES: [(GlortCategory, GlortRange); 6] = [
    (GlortCategory::Cpu, GlortRange { base: 0x0000, size: 0x0010 }),
    (GlortCategory::Special, GlortRange { base: 0x00f0, size: 0x0010 }),
    (GlortCategory::PerPort, GlortRange { base: 0x0100, size: 0x0100 }),
    (GlortCategory::Lag, GlortRange { base: 0x0c00, size: 0x0200 }),
    (GlortCategory::Multicast, GlortRange { base: 0x1000, size: 0x1000 }),
    (GlortCategory::Mailbox, GlortRange { base: 0x2000, size: 0x0040 }),
];

/// Glorts reserved for locally terminated link aggregates.
pub const LAG_LOCAL_GLORTS: u16 = 0x0100;
/// Glorts reserved for aggregates spanning a stacking boundary.
pub const LAG_CROSS_GLORTS: u16 = 0x0100;

/// The per-switch glort partitioning.
#[derive(Debug, Default)]
pub struct GlortTable {
    overrides: BTreeMap<GlortCategory, GlortRange>,
    /// Categories whose range has been handed out at least once
    locked: BTreeSet<GlortCategory>,
}

impl GlortTable {
    pub fn new() -> Self {
        Default::default()
    }

    fn default_range(category: GlortCategory) -> GlortRange {
        DEFAULT_RANGES
            .iter()
            .find(|(c, _)| *c == category)
            .map(|(_, r)| *r)
            .expect("every category has a default")
    }

    fn effective(&self, category: GlortCategory) -> GlortRange {
        self.overrides
            .get(&category)
            .copied()
            .unwrap_or_else(|| Self::default_range(category))
    }

    /// Override a category's range.  Fails once the category has been
    /// used, or if the new range would overlap another category's.
    pub fn set_range(
        &mut self,
        category: GlortCategory,
        range: GlortRange,
    ) -> LcpdResult<()> {
        if self.locked.contains(&category) {
            return Err(LcpdError::Invalid(format!(
                "glort range for {category} is already in use"
            )));
        }
        for (other, other_range) in self.all_ranges() {
            if other != category && range.overlaps(&other_range) {
                return Err(LcpdError::RangeOverlap(format!(
                    "{category} {range} overlaps {other} {other_range}"
                )));
            }
        }
        self.overrides.insert(category, range);
        Ok(())
    }

    /// The range for a category, fixing it against later override.
    pub fn range(&mut self, category: GlortCategory) -> GlortRange {
        self.locked.insert(category);
        self.effective(category)
    }

    /// Look up a range without locking it (diagnostics only).
    #[allow(dead_code)]
    pub fn peek(&self, category: GlortCategory) -> GlortRange {
        self.effective(category)
    }

    /// The `index`th glort of a category's range.
    pub fn glort_at(
        &mut self,
        category: GlortCategory,
        index: u16,
    ) -> LcpdResult<u16> {
        let range = self.range(category);
        if index >= range.size {
            return Err(LcpdError::Exhausted(format!(
                "{category} glort {index} exceeds {range}"
            )));
        }
        Ok(range.base + index)
    }

    fn all_ranges(
        &self,
    ) -> impl Iterator<Item = (GlortCategory, GlortRange)> + '_ {
        use strum::IntoEnumIterator;
        GlortCategory::iter().map(|c| (c, self.effective(c)))
    }

    /// Fail fast if any two categories overlap, or a category's reserved
    /// sub-allocations no longer fit, e.g. the local plus cross-chip LAG
    /// reservations exceeding the LAG range.
    pub fn validate(&mut self) -> LcpdResult<()> {
        let ranges: Vec<_> = self.all_ranges().collect();
        for (i, (cat_a, a)) in ranges.iter().enumerate() {
            for (cat_b, b) in ranges.iter().skip(i + 1) {
                if a.overlaps(b) {
                    return Err(LcpdError::RangeOverlap(format!(
                        "{cat_a} {a} overlaps {cat_b} {b}"
                    )));
                }
            }
        }
        let lag = self.range(GlortCategory::Lag);
        let needed = LAG_LOCAL_GLORTS as u32 + LAG_CROSS_GLORTS as u32;
        if needed > lag.size as u32 {
            return Err(LcpdError::Exhausted(format!(
                "local + cross-chip LAG glorts ({needed}) exceed {lag}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn defaults_are_disjoint() {
        let mut table = GlortTable::new();
        table.validate().unwrap();

        let ranges: Vec<_> =
            GlortCategory::iter().map(|c| table.peek(c)).collect();
        for (i, a) in ranges.iter().enumerate() {
            for b in ranges.iter().skip(i + 1) {
                assert!(!a.overlaps(b), "{a} overlaps {b}");
            }
        }
    }

    #[test]
    fn override_before_first_use_only() {
        let mut table = GlortTable::new();
        table
            .set_range(GlortCategory::Mailbox, GlortRange::new(0x3000, 0x80))
            .unwrap();
        assert_eq!(
            table.range(GlortCategory::Mailbox),
            GlortRange::new(0x3000, 0x80)
        );

        // Used once: now fixed for the life of the instance.
        table
            .set_range(GlortCategory::Mailbox, GlortRange::new(0x4000, 0x80))
            .unwrap_err();
    }

    #[test]
    fn overlapping_override_rejected() {
        let mut table = GlortTable::new();
        table
            .set_range(GlortCategory::Mailbox, GlortRange::new(0x1000, 0x40))
            .unwrap_err();
    }

    #[test]
    fn allocation_bounds_checked() {
        let mut table = GlortTable::new();
        let base = table.peek(GlortCategory::PerPort).base;
        assert_eq!(table.glort_at(GlortCategory::PerPort, 0).unwrap(), base);
        assert_eq!(
            table.glort_at(GlortCategory::PerPort, 36).unwrap(),
            base + 36
        );
        table.glort_at(GlortCategory::PerPort, 0x100).unwrap_err();
    }

    #[test]
    fn lag_reservation_fits() {
        let mut table = GlortTable::new();
        table
            .set_range(GlortCategory::Lag, GlortRange::new(0x0c00, 0x0100))
            .unwrap();
        // 256 + 256 reserved identifiers can't fit in a 256-entry range.
        table.validate().unwrap_err();
    }
}
