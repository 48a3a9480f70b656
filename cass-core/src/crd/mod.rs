//! Cassandra operator CRDs.
//!
//! References:
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/#additional-printer-columns

mod datacenter;
mod operation;

use kube::Resource;

pub use datacenter::{
    CassandraDatacenter, CassandraDatacenterSpec, CassandraDatacenterStatus, CassandraNodeStatus, ManagementApiAuth, ManagementApiAuthConfig,
    ManagementApiAuthInsecureConfig, ManagementApiAuthManualConfig, ProgressState, Rack, ServerType, StorageConfig, DEFAULT_RACK_NAME,
};
pub use operation::{ItemStatus, OperationKind, OperationRecord, WorkItem};

/// A convenience trait built around the fact that all implementors
/// must have the following attributes.
pub trait RequiredMetadata {
    /// The namespace of this object.
    fn namespace(&self) -> &str;

    /// The name of this object.
    fn name(&self) -> &str;
}

impl RequiredMetadata for CassandraDatacenter {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}
