pub mod crd;
pub mod error;
pub mod serverconfig;

pub use error::AppError;

/// The name under which the operator manages fields and labels objects.
pub const OPERATOR_NAME: &str = "cass-operator";

/// The operator's label for the cluster name.
pub const LABEL_CLUSTER: &str = "cassandra.datastax.com/cluster";
/// The operator's label for the datacenter name.
pub const LABEL_DATACENTER: &str = "cassandra.datastax.com/datacenter";
/// The operator's label for the seed node state.
pub const LABEL_SEED_NODE: &str = "cassandra.datastax.com/seed-node";
/// The operator's label for the rack name.
pub const LABEL_RACK: &str = "cassandra.datastax.com/rack";
/// The operator's label for the datacenter progress.
pub const LABEL_OPERATOR_PROGRESS: &str = "cassandra.datastax.com/operator-progress";
/// The operator's label for the last observed node state of a pod.
pub const LABEL_NODE_STATE: &str = "cassandra.datastax.com/node-state";
/// The canonical label identifying the manager of an object.
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// The pod annotation carrying the hash of the rendered server configuration.
pub const ANNOTATION_CONFIG_HASH: &str = "cassandra.datastax.com/config-hash";

/// Comma-separated label selector which matches every object created by the operator.
pub const OPERATOR_LABEL_SELECTORS: &str = "app.kubernetes.io/managed-by=cass-operator";
