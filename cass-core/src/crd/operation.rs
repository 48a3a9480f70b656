//! The persisted record of an in-flight multi-node operation.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The kind of a multi-node operation.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum OperationKind {
    ScaleUp,
    ScaleDown,
    Replace,
    RollingRestart,
    CanaryRestart,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::ScaleUp => "ScaleUp",
                Self::ScaleDown => "ScaleDown",
                Self::Replace => "Replace",
                Self::RollingRestart => "RollingRestart",
                Self::CanaryRestart => "CanaryRestart",
            }
        )
    }
}

/// The status of a single work item.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum ItemStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

/// A single-node unit of work.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    /// The pod name of the node.
    pub node: String,
    pub rack: String,
    pub ordinal: u32,
    pub status: ItemStatus,
    /// Consecutive passes during which the node could not be started.
    #[serde(default)]
    pub attempts: u32,
    /// The uid of the pod deleted by this item, used to recognize its successor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub torn_down_uid: Option<String>,
    /// The IP of the node being replaced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_ip: Option<String>,
}

impl WorkItem {
    pub fn new(node: impl Into<String>, rack: impl Into<String>, ordinal: u32) -> Self {
        Self {
            node: node.into(),
            rack: rack.into(),
            ordinal,
            status: ItemStatus::Pending,
            attempts: 0,
            torn_down_uid: None,
            replace_ip: None,
        }
    }
}

/// The single in-flight operation of a datacenter.
///
/// Items are processed strictly in order. An item only leaves `InProgress` once its node has
/// reached the state the operation drives it to, so a record observed after a crash resumes
/// exactly where it left off.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub kind: OperationKind,
    pub items: Vec<WorkItem>,
    pub started_at: DateTime<Utc>,
    /// The rolling restart token acknowledged by this operation once it completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_token: Option<u64>,
}

impl OperationRecord {
    pub fn new(kind: OperationKind, items: Vec<WorkItem>, started_at: DateTime<Utc>) -> Self {
        Self { kind, items, started_at, restart_token: None }
    }

    /// The index of the first item which is not yet finished.
    pub fn current_index(&self) -> Option<usize> {
        self.items
            .iter()
            .position(|item| matches!(item.status, ItemStatus::Pending | ItemStatus::InProgress))
    }

    /// The first item which is not yet finished.
    pub fn current(&self) -> Option<&WorkItem> {
        self.current_index().map(|idx| &self.items[idx])
    }

    /// The first item which ended in failure.
    pub fn failed(&self) -> Option<&WorkItem> {
        self.items.iter().find(|item| item.status == ItemStatus::Failed)
    }
}
