//! Progress & status reporting.

use std::collections::BTreeSet;

use crate::lifecycle::{NodeSlot, NodeState};
use cass_core::crd::{CassandraDatacenterStatus, CassandraNodeStatus, ProgressState};

/// Project the status of a datacenter from the outcome of a pass.
///
/// `base` carries everything the pass has already decided (the operation record, timestamps,
/// acknowledgements and the message). This function only derives the remaining fields from the
/// observed slots, and never has side effects.
pub fn report(base: &CassandraDatacenterStatus, slots: &[NodeSlot], targets: &[(String, u32)], generation: Option<i64>) -> CassandraDatacenterStatus {
    let mut status = base.clone();
    status.observed_generation = generation.or(base.observed_generation);

    // Node identities survive passes during which a node can not be reached.
    let names: BTreeSet<&str> = slots.iter().map(|slot| slot.name.as_str()).collect();
    status.node_statuses.retain(|name, _| names.contains(name.as_str()));
    for slot in slots {
        let remote = match &slot.remote {
            Some(remote) => remote,
            None => continue,
        };
        // Only nodes which have joined the ring are published.
        if remote.host_id.is_none() {
            continue;
        }
        let entry = status.node_statuses.entry(slot.name.clone()).or_insert_with(CassandraNodeStatus::default);
        entry.host_id = remote.host_id.clone();
        if remote.ip.is_some() {
            entry.node_ip = remote.ip.clone();
        }
    }

    let mut replacements: BTreeSet<String> = base
        .node_replacements
        .iter()
        .filter(|name| names.contains(name.as_str()))
        .cloned()
        .collect();
    replacements.extend(
        slots
            .iter()
            .filter(|slot| slot.state == NodeState::NeedsReplacement)
            .map(|slot| slot.name.clone()),
    );
    status.node_replacements = replacements.into_iter().collect();

    let placed = targets.iter().all(|(rack, target)| {
        let normal = slots
            .iter()
            .filter(|slot| &slot.rack == rack && slot.state == NodeState::Normal)
            .count();
        normal == *target as usize
    });
    let ready = status.operation.is_none() && placed && status.node_replacements.is_empty();
    status.cassandra_operator_progress = Some(if ready { ProgressState::Ready } else { ProgressState::Updating });
    status
}
