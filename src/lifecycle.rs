//! Node lifecycle state machine.
//!
//! The state of every node is re-derived on each pass from what K8s reports about its pod, what
//! the node's management API reports about the server process, and whether the node has been
//! flagged for replacement. Nothing is remembered between passes here.

use serde::Deserialize;

use crate::error::{ReconcileError, ReconcileResult};

/// The observable lifecycle state of a server node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// No running server process could be observed.
    Unknown,
    Starting,
    Joining,
    Normal,
    Leaving,
    Decommissioned,
    /// The node's process or storage is considered lost and must be replaced.
    NeedsReplacement,
}

impl NodeState {
    /// Map a state string reported by the management API.
    pub fn from_remote(state: &str) -> Self {
        match state.to_ascii_uppercase().as_str() {
            "STARTING" => Self::Starting,
            "JOINING" => Self::Joining,
            // A moving node still owns its ranges and serves traffic.
            "NORMAL" | "MOVING" => Self::Normal,
            "LEAVING" => Self::Leaving,
            "DECOMMISSIONED" => Self::Decommissioned,
            _ => Self::Unknown,
        }
    }

    /// True if the given transition is part of the lifecycle.
    ///
    /// `Unknown` may be left for `Starting` only. It may also be entered from any state, as a
    /// process can always vanish.
    pub fn can_become(self, next: NodeState) -> bool {
        use NodeState::*;
        match (self, next) {
            (_, Unknown) => true,
            (Unknown, Starting) => true,
            (Starting, Joining) | (Joining, Normal) | (Starting, Normal) => true,
            (Normal, Leaving) | (Leaving, Decommissioned) => true,
            (Normal, NeedsReplacement) | (Joining, NeedsReplacement) | (Starting, NeedsReplacement) => true,
            (Unknown, NeedsReplacement) => true,
            (NeedsReplacement, Starting) => true,
            (from, to) => from == to,
        }
    }

    /// True for the states in which a node is changing its ring membership.
    pub fn is_transitional(self) -> bool {
        matches!(self, Self::Starting | Self::Joining | Self::Leaving)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// The status document returned by a node's management API.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStatus {
    pub state: String,
    #[serde(default)]
    pub host_id: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
}

/// What K8s reports about a server pod.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub rack: String,
    pub ordinal: u32,
    pub uid: Option<String>,
    pub ip: Option<String>,
    /// True if the pod carries the seed label.
    pub seed: bool,
    /// The config hash the pod was created with.
    pub config_hash: Option<String>,
    /// True once the pod has a deletion timestamp.
    pub terminating: bool,
    /// The value of the node-state label of the pod.
    pub state_label: Option<String>,
}

/// A node slot as observed during one pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeSlot {
    /// The pod name of the slot.
    pub name: String,
    pub rack: String,
    pub ordinal: u32,
    pub pod: Option<PodInfo>,
    /// The management API status, if the endpoint could be reached.
    pub remote: Option<RemoteStatus>,
    /// True if the slot's data volume exists.
    pub volume: bool,
    /// The IP last reported by this node, kept from previous passes.
    pub known_ip: Option<String>,
    pub state: NodeState,
}

impl NodeSlot {
    /// True if the management API of this node answered during this pass.
    pub fn reachable(&self) -> bool {
        self.remote.is_some()
    }

    /// The uid of the live pod of this slot, if any.
    pub fn pod_uid(&self) -> Option<&str> {
        self.pod.as_ref().and_then(|pod| pod.uid.as_deref())
    }

    /// The IP under which this node last took part in the ring, if it ever did.
    ///
    /// A node only has a host ID once it has joined the ring.
    pub fn ring_ip(&self) -> Option<&str> {
        self.remote
            .as_ref()
            .filter(|remote| remote.host_id.is_some())
            .and_then(|remote| remote.ip.as_deref())
            .or(self.known_ip.as_deref())
    }

    /// True if the pod of this slot carries the seed label.
    pub fn is_seed(&self) -> bool {
        self.pod.as_ref().map(|pod| pod.seed).unwrap_or(false)
    }
}

/// Classify a node from its observations.
///
/// A replacement request wins over everything which is observed, as a node flagged for
/// replacement is never trusted again until it has been rebuilt.
pub fn classify(pod: Option<&PodInfo>, remote: Option<&RemoteStatus>, replace_requested: bool) -> NodeState {
    if replace_requested {
        return NodeState::NeedsReplacement;
    }
    match (pod, remote) {
        (Some(pod), Some(remote)) if !pod.terminating => NodeState::from_remote(&remote.state),
        _ => NodeState::Unknown,
    }
}

/// Check that the given slot may be started.
///
/// Only one node may bootstrap or leave the ring at a time, so a start is refused while any other
/// node is starting, joining or leaving.
pub fn check_start(slot: &NodeSlot, slots: &[NodeSlot]) -> ReconcileResult<()> {
    if !slot.state.can_become(NodeState::Starting) {
        return Err(ReconcileError::UnsafeToProceed(format!(
            "node {} can not be started from state {}",
            slot.name, slot.state
        )));
    }
    if let Some(other) = slots.iter().find(|other| other.name != slot.name && other.state.is_transitional()) {
        return Err(ReconcileError::UnsafeToProceed(format!(
            "node {} can not be started while node {} is {}",
            slot.name, other.name, other.state
        )));
    }
    Ok(())
}

/// Check that the given slot may be decommissioned.
///
/// `rack_target` is the number of nodes the slot's rack keeps once the current plan is reached.
pub fn check_decommission(slot: &NodeSlot, slots: &[NodeSlot], rack_target: u32) -> ReconcileResult<()> {
    if !slot.state.can_become(NodeState::Leaving) {
        return Err(ReconcileError::UnsafeToProceed(format!(
            "node {} can not be decommissioned from state {}",
            slot.name, slot.state
        )));
    }
    let live = slots
        .iter()
        .filter(|other| matches!(other.state, NodeState::Normal | NodeState::Starting | NodeState::Joining))
        .count();
    if live <= 1 {
        return Err(ReconcileError::UnsafeToProceed(format!(
            "node {} is the last live node of the datacenter",
            slot.name
        )));
    }
    if let Some(other) = slots.iter().find(|other| other.name != slot.name && other.state.is_transitional()) {
        return Err(ReconcileError::UnsafeToProceed(format!(
            "node {} can not be decommissioned while node {} is {}",
            slot.name, other.name, other.state
        )));
    }
    let other_rack_seeds = slots
        .iter()
        .filter(|other| other.name != slot.name && other.rack == slot.rack && other.is_seed())
        .count();
    if slot.is_seed() && rack_target > 0 && other_rack_seeds == 0 {
        return Err(ReconcileError::UnsafeToProceed(format!(
            "node {} is the only seed of rack {}",
            slot.name, slot.rack
        )));
    }
    Ok(())
}

/// Check that the given slot may be drained.
pub fn check_drain(slot: &NodeSlot) -> ReconcileResult<()> {
    if slot.state != NodeState::Normal {
        return Err(ReconcileError::UnsafeToProceed(format!(
            "node {} can not be drained from state {}",
            slot.name, slot.state
        )));
    }
    Ok(())
}
