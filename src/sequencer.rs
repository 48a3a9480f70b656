//! Rolling operation sequencer.
//!
//! A divergence between the desired and the observed datacenter is turned into an
//! `OperationRecord`: an ordered list of single-node work items. Each pass, the sequencer looks at
//! the record and the fresh observations and yields exactly one `StepAction`. Bookkeeping (marking
//! an item done once its node has reached the desired state) is not a step; a pass only ever
//! performs one mutating action against K8s or a node.
//!
//! All functions here are pure. The record is mutated in place, and the caller only persists the
//! mutated record once the returned step has been executed successfully.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::error::ReconcileResult;
use crate::lifecycle::{self, NodeSlot, NodeState};
use crate::topology::TopologyPlan;
use cass_core::crd::{CassandraDatacenter, CassandraDatacenterStatus, ItemStatus, OperationKind, OperationRecord, WorkItem};

/// The observed state of a rack's StatefulSet.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RackState {
    /// The replica count of the StatefulSet.
    pub replicas: u32,
    /// The config hash stamped on the StatefulSet's pod template.
    pub template_hash: Option<String>,
}

/// Everything the sequencer may look at during a pass.
#[derive(Clone, Copy, Debug)]
pub struct ClusterView<'a> {
    /// Every node slot of the declared racks.
    pub slots: &'a [NodeSlot],
    /// The StatefulSet of every declared rack.
    pub racks: &'a BTreeMap<String, RackState>,
    pub plan: &'a TopologyPlan,
    /// The config hash every pod should eventually carry.
    pub desired_hash: &'a str,
    /// The nodes currently requested or flagged for replacement.
    pub replacements: &'a BTreeSet<String>,
    /// The number of consecutive passes a node may stay unreachable while it is being started.
    pub retry_budget: u32,
}

impl<'a> ClusterView<'a> {
    /// Find a slot by pod name.
    pub fn slot(&self, name: &str) -> Option<&'a NodeSlot> {
        self.slots.iter().find(|slot| slot.name == name)
    }

    /// The current replica count of a rack.
    pub fn replicas(&self, rack: &str) -> u32 {
        self.racks.get(rack).map(|rack| rack.replicas).unwrap_or(0)
    }

    /// True if the given node has been requested for replacement, or was classified as needing it.
    pub fn wants_replacement(&self, node: &str) -> bool {
        self.replacements.contains(node) || self.slot(node).map(|slot| slot.state == NodeState::NeedsReplacement).unwrap_or(false)
    }

    /// The declaration index of a rack, used for ordering.
    fn rack_index(&self, rack: &str) -> usize {
        self.plan
            .targets
            .iter()
            .position(|(name, _)| name == rack)
            .unwrap_or(usize::MAX)
    }

    /// The slots of the given racks which are within their rack's target, ordered by rack and ordinal.
    fn target_slots(&self, racks: &[&str]) -> Vec<&'a NodeSlot> {
        let mut slots: Vec<&'a NodeSlot> = self
            .slots
            .iter()
            .filter(|slot| racks.contains(&slot.rack.as_str()) && slot.ordinal < self.plan.target(&slot.rack))
            .collect();
        slots.sort_by_key(|slot| (self.rack_index(&slot.rack), slot.ordinal));
        slots
    }
}

/// A single mutating action to be executed by the control loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepAction {
    /// Apply the StatefulSet of a rack, pushing its current pod template.
    ApplyRack { rack: String },
    /// Scale the StatefulSet of a rack.
    ScaleRack { rack: String, replicas: u32 },
    Start { node: String, replace_ip: Option<String> },
    Decommission { node: String },
    Drain { node: String },
    /// Delete the pod of a node, letting its StatefulSet recreate it.
    DeletePod { node: String },
    /// Delete the data volume and the pod of a node, letting it be rebuilt from scratch.
    Teardown { node: String },
    DeleteVolume { node: String },
    /// Nothing may be done this pass.
    Wait { reason: String },
    /// The record has finished successfully.
    Complete,
    /// The record has failed terminally, and the given node must be replaced.
    Abort { node: String, reason: String },
}

impl StepAction {
    /// A short name used for logging and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ApplyRack { .. } => "apply_rack",
            Self::ScaleRack { .. } => "scale_rack",
            Self::Start { .. } => "start",
            Self::Decommission { .. } => "decommission",
            Self::Drain { .. } => "drain",
            Self::DeletePod { .. } => "delete_pod",
            Self::Teardown { .. } => "teardown",
            Self::DeleteVolume { .. } => "delete_volume",
            Self::Wait { .. } => "wait",
            Self::Complete => "complete",
            Self::Abort { .. } => "abort",
        }
    }
}

/// Pending work derived from a divergence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Work {
    /// A single step which needs no record.
    Step(StepAction),
    /// A new multi-node operation.
    Record(OperationRecord),
}

/// The outcome of stepping a single work item.
enum ItemStep {
    /// The item is finished, move on to the next one.
    Advance,
    Act(StepAction),
}

/// Yield the next step of the given record.
///
/// Pending items which are no longer wanted by the current plan are pruned first. The item in
/// progress always finishes.
pub fn next_step(record: &mut OperationRecord, view: &ClusterView) -> ReconcileResult<StepAction> {
    prune(record, view);
    loop {
        let idx = match record.current_index() {
            Some(idx) => idx,
            None => break,
        };
        let kind = record.kind;
        match step_item(kind, &mut record.items[idx], view)? {
            ItemStep::Advance => continue,
            ItemStep::Act(action) => return Ok(action),
        }
    }
    match record.failed() {
        Some(item) => Ok(StepAction::Abort {
            node: item.node.clone(),
            reason: format!("{} of node {} failed", record.kind, item.node),
        }),
        None => Ok(StepAction::Complete),
    }
}

/// Remove pending items which the current plan no longer calls for.
pub fn prune(record: &mut OperationRecord, view: &ClusterView) {
    let kind = record.kind;
    record.items.retain(|item| {
        if item.status != ItemStatus::Pending {
            return true;
        }
        let target = view.plan.target(&item.rack);
        match kind {
            OperationKind::ScaleUp => item.ordinal < target,
            OperationKind::ScaleDown => item.ordinal >= target,
            OperationKind::Replace => view.wants_replacement(&item.node),
            OperationKind::RollingRestart | OperationKind::CanaryRestart => item.ordinal < target,
        }
    });
}

fn step_item(kind: OperationKind, item: &mut WorkItem, view: &ClusterView) -> ReconcileResult<ItemStep> {
    match kind {
        OperationKind::ScaleUp => step_scale_up(item, view),
        OperationKind::ScaleDown => step_scale_down(item, view),
        OperationKind::Replace => step_replace(item, view),
        OperationKind::RollingRestart | OperationKind::CanaryRestart => step_restart(item, view),
    }
}

fn step_scale_up(item: &mut WorkItem, view: &ClusterView) -> ReconcileResult<ItemStep> {
    if view.replicas(&item.rack) <= item.ordinal {
        item.status = ItemStatus::InProgress;
        return Ok(ItemStep::Act(StepAction::ScaleRack {
            rack: item.rack.clone(),
            replicas: item.ordinal + 1,
        }));
    }
    let slot = match view.slot(&item.node) {
        Some(slot) => slot,
        None => return Ok(wait(item, format!("waiting for pod of node {}", item.node))),
    };
    match slot.state {
        NodeState::Normal => {
            item.status = ItemStatus::Done;
            Ok(ItemStep::Advance)
        }
        NodeState::NeedsReplacement => Ok(abort(item, format!("node {} needs replacement", item.node))),
        NodeState::Unknown => start_or_wait(item, slot, view, None),
        state => Ok(wait(item, format!("waiting for node {} which is {}", item.node, state))),
    }
}

fn step_scale_down(item: &mut WorkItem, view: &ClusterView) -> ReconcileResult<ItemStep> {
    let slot = view.slot(&item.node);
    if view.replicas(&item.rack) <= item.ordinal {
        item.status = ItemStatus::Done;
        if slot.map(|slot| slot.volume).unwrap_or(false) {
            return Ok(ItemStep::Act(StepAction::DeleteVolume { node: item.node.clone() }));
        }
        return Ok(ItemStep::Advance);
    }
    let slot = match slot {
        Some(slot) => slot,
        None => return Ok(wait(item, format!("waiting for pod of node {}", item.node))),
    };
    match slot.state {
        NodeState::Normal => {
            lifecycle::check_decommission(slot, view.slots, view.plan.target(&item.rack))?;
            item.status = ItemStatus::InProgress;
            item.attempts = 0;
            Ok(ItemStep::Act(StepAction::Decommission { node: item.node.clone() }))
        }
        NodeState::Decommissioned => {
            item.status = ItemStatus::InProgress;
            Ok(ItemStep::Act(StepAction::ScaleRack {
                rack: item.rack.clone(),
                replicas: item.ordinal,
            }))
        }
        NodeState::NeedsReplacement => Ok(abort(item, format!("node {} needs replacement", item.node))),
        // A node must be running to hand its ranges over.
        NodeState::Unknown => start_or_wait(item, slot, view, None),
        state => Ok(wait(item, format!("waiting for node {} which is {}", item.node, state))),
    }
}

fn step_replace(item: &mut WorkItem, view: &ClusterView) -> ReconcileResult<ItemStep> {
    let torn_down = match item.torn_down_uid.clone() {
        Some(uid) => uid,
        None => {
            let slot = view.slot(&item.node);
            if let Some(ip) = slot.and_then(|slot| slot.ring_ip()) {
                item.replace_ip = Some(ip.to_string());
            }
            // An empty uid records that no pod existed at teardown.
            item.torn_down_uid = Some(slot.and_then(|slot| slot.pod_uid()).unwrap_or_default().to_string());
            item.status = ItemStatus::InProgress;
            item.attempts = 0;
            return Ok(ItemStep::Act(StepAction::Teardown { node: item.node.clone() }));
        }
    };
    let replace_ip = item.replace_ip.clone();
    await_new_instance(item, &torn_down, view, replace_ip)
}

fn step_restart(item: &mut WorkItem, view: &ClusterView) -> ReconcileResult<ItemStep> {
    if let Some(torn_down) = item.torn_down_uid.clone() {
        return await_new_instance(item, &torn_down, view, None);
    }
    let slot = view.slot(&item.node);
    if item.status == ItemStatus::Pending {
        if let Some(slot) = slot.filter(|slot| slot.state == NodeState::Normal) {
            lifecycle::check_drain(slot)?;
            item.status = ItemStatus::InProgress;
            return Ok(ItemStep::Act(StepAction::Drain { node: item.node.clone() }));
        }
    }
    item.torn_down_uid = Some(slot.and_then(|slot| slot.pod_uid()).unwrap_or_default().to_string());
    item.status = ItemStatus::InProgress;
    item.attempts = 0;
    Ok(ItemStep::Act(StepAction::DeletePod { node: item.node.clone() }))
}

/// Drive a node whose previous pod has been torn down until it is `Normal` again.
fn await_new_instance(item: &mut WorkItem, torn_down: &str, view: &ClusterView, replace_ip: Option<String>) -> ReconcileResult<ItemStep> {
    let slot = view.slot(&item.node).filter(|slot| match &slot.pod {
        Some(pod) => !pod.terminating && pod.uid.as_deref() != Some(torn_down),
        None => false,
    });
    let slot = match slot {
        Some(slot) => slot,
        None => return Ok(wait(item, format!("waiting for new pod of node {}", item.node))),
    };
    match slot.state {
        NodeState::Normal => {
            item.status = ItemStatus::Done;
            Ok(ItemStep::Advance)
        }
        NodeState::Unknown => start_or_wait(item, slot, view, replace_ip),
        state => Ok(wait(item, format!("waiting for node {} which is {}", item.node, state))),
    }
}

/// Start the given node once its management API answers.
fn start_or_wait(item: &mut WorkItem, slot: &NodeSlot, view: &ClusterView, replace_ip: Option<String>) -> ReconcileResult<ItemStep> {
    match &slot.pod {
        Some(pod) if !pod.terminating => (),
        _ => return Ok(wait(item, format!("waiting for pod of node {}", item.node))),
    }
    if !slot.reachable() {
        return Ok(count_unreachable(item, view));
    }
    lifecycle::check_start(slot, view.slots)?;
    item.status = ItemStatus::InProgress;
    item.attempts = 0;
    Ok(ItemStep::Act(StepAction::Start { node: item.node.clone(), replace_ip }))
}

/// Count another pass during which the node could not be reached, failing once over budget.
fn count_unreachable(item: &mut WorkItem, view: &ClusterView) -> ItemStep {
    item.attempts += 1;
    if item.attempts > view.retry_budget {
        return abort(
            item,
            format!("node {} stayed unreachable for {} passes", item.node, item.attempts - 1),
        );
    }
    wait(
        item,
        format!(
            "waiting for management API of node {} ({}/{})",
            item.node, item.attempts, view.retry_budget
        ),
    )
}

fn wait(item: &mut WorkItem, reason: String) -> ItemStep {
    item.status = ItemStatus::InProgress;
    ItemStep::Act(StepAction::Wait { reason })
}

fn abort(item: &mut WorkItem, reason: String) -> ItemStep {
    item.status = ItemStatus::Failed;
    ItemStep::Act(StepAction::Abort { node: item.node.clone(), reason })
}

/// Derive the pending work of a datacenter which has no record in flight.
///
/// Work is derived in priority order: placement, config drift, replacement, then an explicit
/// restart request. A node due for removal which needs replacement is rebuilt before placement,
/// as only a running node can hand its ranges over.
pub fn derive_work(dc: &CassandraDatacenter, status: &CassandraDatacenterStatus, view: &ClusterView, now: DateTime<Utc>) -> Option<Work> {
    let all_racks: Vec<&str> = view.plan.targets.iter().map(|(name, _)| name.as_str()).collect();
    let scoped_racks: Vec<&str> = if dc.spec.canary_upgrade {
        all_racks.iter().take(1).copied().collect()
    } else {
        all_racks.clone()
    };
    let restart_kind = if dc.spec.canary_upgrade {
        OperationKind::CanaryRestart
    } else {
        OperationKind::RollingRestart
    };

    // Placement.
    let broken: Vec<WorkItem> = view
        .plan
        .removals
        .iter()
        .map(|slot| WorkItem::new(dc.pod_name(&slot.rack, slot.ordinal), slot.rack.clone(), slot.ordinal))
        .filter(|item| view.wants_replacement(&item.node))
        .collect();
    if !broken.is_empty() {
        return Some(Work::Record(OperationRecord::new(OperationKind::Replace, broken, now)));
    }
    if !view.plan.removals.is_empty() {
        let items = view
            .plan
            .removals
            .iter()
            .map(|slot| WorkItem::new(dc.pod_name(&slot.rack, slot.ordinal), slot.rack.clone(), slot.ordinal))
            .collect();
        return Some(Work::Record(OperationRecord::new(OperationKind::ScaleDown, items, now)));
    }
    let mut items: Vec<WorkItem> = view
        .target_slots(&all_racks)
        .into_iter()
        .filter(|slot| slot.state == NodeState::Unknown && slot.ordinal < view.replicas(&slot.rack))
        .map(|slot| WorkItem::new(slot.name.clone(), slot.rack.clone(), slot.ordinal))
        .collect();
    items.extend(
        view.plan
            .additions
            .iter()
            .map(|slot| WorkItem::new(dc.pod_name(&slot.rack, slot.ordinal), slot.rack.clone(), slot.ordinal)),
    );
    if !items.is_empty() {
        return Some(Work::Record(OperationRecord::new(OperationKind::ScaleUp, items, now)));
    }

    // Config drift.
    for rack in scoped_racks.iter() {
        let template_hash = view.racks.get(*rack).and_then(|state| state.template_hash.as_deref());
        if template_hash != Some(view.desired_hash) {
            return Some(Work::Step(StepAction::ApplyRack { rack: rack.to_string() }));
        }
    }
    let stale: Vec<WorkItem> = view
        .target_slots(&scoped_racks)
        .into_iter()
        .filter(|slot| slot.state != NodeState::NeedsReplacement)
        .filter(|slot| match &slot.pod {
            Some(pod) => pod.config_hash.as_deref() != Some(view.desired_hash),
            None => false,
        })
        .map(|slot| WorkItem::new(slot.name.clone(), slot.rack.clone(), slot.ordinal))
        .collect();
    if !stale.is_empty() {
        return Some(Work::Record(OperationRecord::new(restart_kind, stale, now)));
    }

    // Replacement.
    let replace: Vec<WorkItem> = view
        .target_slots(&all_racks)
        .into_iter()
        .filter(|slot| view.wants_replacement(&slot.name))
        .map(|slot| WorkItem::new(slot.name.clone(), slot.rack.clone(), slot.ordinal))
        .collect();
    if !replace.is_empty() {
        return Some(Work::Record(OperationRecord::new(OperationKind::Replace, replace, now)));
    }

    // Restart request.
    if dc.spec.rolling_restart_request > status.rolling_restart_ack {
        let items = view
            .target_slots(&scoped_racks)
            .into_iter()
            .filter(|slot| slot.pod.is_some() && slot.state != NodeState::NeedsReplacement)
            .map(|slot| WorkItem::new(slot.name.clone(), slot.rack.clone(), slot.ordinal))
            .collect();
        let mut record = OperationRecord::new(restart_kind, items, now);
        record.restart_token = Some(dc.spec.rolling_restart_request);
        return Some(Work::Record(record));
    }

    None
}

/// The next step of a datacenter which is being stopped, if any remains.
///
/// Nodes which are bootstrapping or leaving are waited for, then every `Normal` node is drained
/// one at a time, and finally every rack is scaled to zero.
pub fn stop_step(view: &ClusterView) -> Option<StepAction> {
    if let Some(slot) = view.slots.iter().find(|slot| slot.state.is_transitional()) {
        return Some(StepAction::Wait {
            reason: format!("waiting for node {} which is {} before stopping", slot.name, slot.state),
        });
    }
    if let Some(slot) = view.slots.iter().find(|slot| slot.state == NodeState::Normal) {
        return Some(StepAction::Drain { node: slot.name.clone() });
    }
    view.plan
        .targets
        .iter()
        .find(|(rack, _)| view.replicas(rack) > 0)
        .map(|(rack, _)| StepAction::ScaleRack { rack: rack.clone(), replicas: 0 })
}
