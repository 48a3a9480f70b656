//! Rack & seed topology planning.
//!
//! Placement is computed fresh on every pass from the declared racks and the number of nodes each
//! rack currently holds. Existing nodes are never moved between racks; only the difference between
//! the current total and the desired size is distributed.

use std::collections::BTreeMap;

use cass_core::crd::{Rack, DEFAULT_RACK_NAME};

/// The number of seeds to reach when the datacenter has enough nodes.
const MIN_SEED_COUNT: usize = 3;

/// A node slot within a rack, identified by its StatefulSet ordinal.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot {
    pub rack: String,
    pub ordinal: u32,
}

impl Slot {
    pub fn new(rack: impl Into<String>, ordinal: u32) -> Self {
        Self { rack: rack.into(), ordinal }
    }
}

/// The output of the topology planner.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopologyPlan {
    /// Target node count of each rack, in rack declaration order.
    pub targets: Vec<(String, u32)>,
    /// Slots to be added, in the order they should be started.
    pub additions: Vec<Slot>,
    /// Slots to be removed, in the order they should be decommissioned.
    pub removals: Vec<Slot>,
    /// The seed slots of the datacenter, computed over the target slots.
    pub seeds: Vec<Slot>,
}

impl TopologyPlan {
    /// The target node count of the given rack.
    pub fn target(&self, rack: &str) -> u32 {
        self.targets
            .iter()
            .find(|(name, _)| name == rack)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }

    /// True if the given slot is a seed.
    pub fn is_seed(&self, rack: &str, ordinal: u32) -> bool {
        self.seeds.iter().any(|seed| seed.rack == rack && seed.ordinal == ordinal)
    }
}

/// Plan the target topology of a datacenter.
///
/// - `racks`: the declared racks. An empty list is treated as the single `default` rack.
/// - `current`: the number of nodes each rack currently holds. Missing racks hold zero nodes.
/// - `size`: the desired total number of nodes.
///
/// Additions go to the least populated rack, ties broken by declaration order. Removals come from
/// the most populated rack, highest ordinal first, ties broken by the latest declared rack.
pub fn plan(racks: &[Rack], current: &BTreeMap<String, u32>, size: u32) -> TopologyPlan {
    let names: Vec<String> = if racks.is_empty() {
        vec![DEFAULT_RACK_NAME.to_string()]
    } else {
        racks.iter().map(|rack| rack.name.clone()).collect()
    };
    let mut counts: Vec<u32> = names.iter().map(|name| current.get(name).copied().unwrap_or(0)).collect();
    let total: u32 = counts.iter().sum();

    let mut additions = vec![];
    for _ in total..size {
        // `min_by_key` yields the first minimum, which is the earliest declared rack.
        let idx = match counts.iter().enumerate().min_by_key(|(_, count)| **count) {
            Some((idx, _)) => idx,
            None => break,
        };
        additions.push(Slot::new(names[idx].clone(), counts[idx]));
        counts[idx] += 1;
    }

    let mut removals = vec![];
    for _ in size..total {
        // `max_by_key` yields the last maximum, which is the latest declared rack.
        let idx = match counts.iter().enumerate().max_by_key(|(_, count)| **count) {
            Some((idx, _)) => idx,
            None => break,
        };
        if counts[idx] == 0 {
            break;
        }
        counts[idx] -= 1;
        removals.push(Slot::new(names[idx].clone(), counts[idx]));
    }

    let targets: Vec<(String, u32)> = names.into_iter().zip(counts).collect();
    let seeds = seeds(&targets);
    TopologyPlan { targets, additions, removals, seeds }
}

/// Select the seed slots for the given per-rack targets.
///
/// The first node of every populated rack is a seed. Further nodes are taken round-robin over the
/// racks in declaration order until at least three seeds exist or every node is a seed.
fn seeds(targets: &[(String, u32)]) -> Vec<Slot> {
    let mut seeds: Vec<Slot> = targets
        .iter()
        .filter(|(_, count)| *count > 0)
        .map(|(rack, _)| Slot::new(rack.clone(), 0))
        .collect();
    let max_count = targets.iter().map(|(_, count)| *count).max().unwrap_or(0);
    'rounds: for ordinal in 1..max_count {
        for (rack, count) in targets {
            if seeds.len() >= MIN_SEED_COUNT {
                break 'rounds;
            }
            if *count > ordinal {
                seeds.push(Slot::new(rack.clone(), ordinal));
            }
        }
    }
    seeds
}
