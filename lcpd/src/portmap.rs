// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The cardinal port table: the physical↔logical↔fabric mapping for every
//! port the platform layer declares present.
//!
//! Physical port numbers are fixed by the chip package; the platform layer
//! decides which of them are wired on a given board and what logical
//! number each is known by.  Ports the platform declines to map are simply
//! absent from the table: logged, never an error.

use std::collections::BTreeMap;

use slog::debug;
use slog::o;

use chip::FamilyOps;
use common::ports::FabricPort;
use common::ports::LogicalPort;
use common::ports::PhysicalPort;
use hal::Platform;

/// One mapped ("cardinal") port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CardinalEntry {
    pub logical: LogicalPort,
    pub physical: PhysicalPort,
    pub fabric: FabricPort,
}

/// The ordered set of cardinal ports, with O(1) lookup by either key.
///
/// The entry list is sorted ascending by logical port number, and the
/// mapping is a bijection over the enumerated physical ports.
#[derive(Clone, Debug, Default)]
pub struct CardinalPortMap {
    entries: Vec<CardinalEntry>,
    by_logical: BTreeMap<LogicalPort, usize>,
    by_physical: BTreeMap<PhysicalPort, usize>,
}

impl CardinalPortMap {
    /// Enumerate every physical port the family can expose and build the
    /// table from the platform's answers.
    pub fn new(
        log: &slog::Logger,
        family: &dyn FamilyOps,
        platform: &dyn Platform,
    ) -> Self {
        let log = log.new(o!("unit" => "portmap"));
        let mut entries = Vec::new();
        for phys in 0..family.max_physical_ports() {
            match platform.map_physical_port(phys) {
                Some(logical) => entries.push(CardinalEntry {
                    logical,
                    physical: phys,
                    fabric: family.fabric_port(phys),
                }),
                None => {
                    debug!(log, "physical port not mapped by platform";
                        "physical" => phys);
                }
            }
        }
        entries.sort_by_key(|e| e.logical);

        let mut map = CardinalPortMap {
            entries,
            by_logical: BTreeMap::new(),
            by_physical: BTreeMap::new(),
        };
        for (idx, entry) in map.entries.iter().enumerate() {
            let dup = map.by_logical.insert(entry.logical, idx);
            assert!(
                dup.is_none(),
                "platform mapped two physical ports to logical {}",
                entry.logical
            );
            map.by_physical.insert(entry.physical, idx);
        }
        debug!(log, "built cardinal port map";
            "board" => platform.board_name(),
            "mapped" => map.entries.len());
        map
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entries, ascending by logical port number.
    pub fn entries(&self) -> &[CardinalEntry] {
        &self.entries
    }

    pub fn by_logical(&self, logical: LogicalPort) -> Option<CardinalEntry> {
        self.by_logical.get(&logical).map(|&idx| self.entries[idx])
    }

    pub fn by_physical(
        &self,
        physical: PhysicalPort,
    ) -> Option<CardinalEntry> {
        self.by_physical
            .get(&physical)
            .map(|&idx| self.entries[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chip::sim::SimPlatform;
    use chip::Kestrel;

    fn test_log() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn maps_every_reported_port_exactly_once() {
        let family = Kestrel::new();
        let platform = SimPlatform::new(8).with_unmapped([2, 5]);
        let map = CardinalPortMap::new(&test_log(), &family, &platform);

        assert_eq!(map.len(), 6);
        for phys in [0u16, 1, 3, 4, 6, 7] {
            let entry = map.by_physical(phys).unwrap();
            assert_eq!(entry.physical, phys);
            assert_eq!(map.by_logical(entry.logical).unwrap(), entry);
        }
        // Declined ports are absent, not error entries.
        assert!(map.by_physical(2).is_none());
        assert!(map.by_physical(5).is_none());
    }

    #[test]
    fn entries_strictly_ascending_by_logical() {
        let family = Kestrel::new();
        let platform = SimPlatform::new(12);
        let map = CardinalPortMap::new(&test_log(), &family, &platform);

        let logicals: Vec<_> =
            map.entries().iter().map(|e| e.logical).collect();
        let mut sorted = logicals.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(logicals, sorted);
    }

    #[test]
    fn fabric_ports_follow_family_numbering() {
        let family = Kestrel::new();
        let platform = SimPlatform::new(4);
        let map = CardinalPortMap::new(&test_log(), &family, &platform);
        for entry in map.entries() {
            assert_eq!(entry.fabric, family.fabric_port(entry.physical));
        }
    }
}
