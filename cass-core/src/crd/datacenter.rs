//! CassandraDatacenter CRD.
//!
//! The code here is used to generate the actual CRD used in K8s. See examples/crd.rs.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ContainerPort, PersistentVolumeClaimSpec, ResourceRequirements};
use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crd::operation::OperationRecord;
use crate::crd::RequiredMetadata;
use crate::error::AppError;
use crate::serverconfig;
use crate::{LABEL_CLUSTER, LABEL_DATACENTER, LABEL_MANAGED_BY, LABEL_RACK, OPERATOR_NAME};

const DEFAULT_CASS_REPOSITORY: &str = "datastaxlabs/apache-cassandra-with-mgmtapi";
const DEFAULT_CASS_VERSION: &str = "3.11.6-20200316";
const DEFAULT_DSE_REPOSITORY: &str = "datastaxlabs/dse-k8s-server";
const DEFAULT_DSE_VERSION: &str = "6.8.0-20200316";
const DEFAULT_CONFIG_BUILDER_IMAGE: &str = "datastaxlabs/dse-k8s-config-builder:0.9.0-20200316";

/// The name of the implicit rack used when a datacenter declares none.
pub const DEFAULT_RACK_NAME: &str = "default";

pub type CassandraDatacenter = CassandraDatacenterCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the CassandraDatacenter resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "CassandraDatacenterCRD",
    status = "CassandraDatacenterStatus",
    group = "cassandra.datastax.com",
    version = "v1beta1",
    kind = "CassandraDatacenter",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "cassdc",
    shortname = "cassdcs",
    printcolumn = r#"{"name":"Size","type":"number","jsonPath":".spec.size"}"#,
    printcolumn = r#"{"name":"Server","type":"string","jsonPath":".spec.serverType"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.serverVersion"}"#,
    printcolumn = r#"{"name":"Progress","type":"string","jsonPath":".status.cassandraOperatorProgress"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CassandraDatacenterSpec {
    /// Desired number of server nodes.
    pub size: u32,
    /// Version number of the server.
    pub server_version: String,
    /// Server image name.
    ///
    /// When not set, an image is resolved from `serverType` and `serverVersion`.
    #[serde(default)]
    pub server_image: Option<String>,
    /// Server type: "cassandra" or "dse".
    pub server_type: ServerType,
    /// Config for the server, as a free-form JSON object.
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub config: Option<Value>,
    /// Config for the Management API certificates.
    #[serde(default)]
    pub management_api_auth: ManagementApiAuthConfig,
    /// A list of the named racks in the datacenter, representing independent failure domains.
    ///
    /// The number of racks should match the replication factor of the keyspaces you plan to
    /// create, and the list of racks cannot easily be changed once a datacenter is deployed.
    #[serde(default)]
    pub racks: Vec<Rack>,
    /// Describes the persistent storage request of each server node.
    pub storage_config: StorageConfig,
    /// Resource requirements of the server container of each pod.
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub resources: Option<ResourceRequirements>,
    /// A list of pod names that need to be replaced.
    #[serde(default)]
    pub replace_nodes: Vec<String>,
    /// The name by which CQL clients and instances will know the cluster.
    pub cluster_name: String,
    /// A stopped datacenter will have no running server pods.
    ///
    /// Other resources are left intact, and volumes will re-attach when the datacenter is resumed.
    #[serde(default)]
    pub stopped: bool,
    /// Container image for the config builder init container.
    #[serde(default)]
    pub config_builder_image: Option<String>,
    /// Push configuration and image changes only to the first rack of the datacenter.
    #[serde(default)]
    pub canary_upgrade: bool,
    /// Allow multiple server pods to be scheduled onto the same K8s worker node.
    #[serde(default)]
    pub allow_multiple_nodes_per_worker: bool,
    /// The name of the secret holding the superuser credentials.
    #[serde(default)]
    pub superuser_secret_name: Option<String>,
    /// The K8s service account to use for the server pods.
    #[serde(default)]
    pub service_account: Option<String>,
    /// Rolling restart request token.
    ///
    /// Increment this value to request a rolling restart. The operator records the last handled
    /// token in `status.rollingRestartAck`.
    #[serde(default)]
    pub rolling_restart_request: u64,
}

/// The server distribution to run.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    Cassandra,
    Dse,
}

impl std::fmt::Display for ServerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Cassandra => "cassandra",
                Self::Dse => "dse",
            }
        )
    }
}

/// A named failure domain.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Rack {
    /// The rack name.
    pub name: String,
    /// Zone name to pin the rack, using node affinity.
    #[serde(default)]
    pub zone: Option<String>,
}

impl Rack {
    /// Create a new rack without zone affinity.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), zone: None }
    }
}

/// Persistent storage request of each server node.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// The claim spec of each node's data PVC.
    ///
    /// A storage request is required. Access modes default to `ReadWriteOnce`.
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub cassandra_data_volume_claim_spec: Option<PersistentVolumeClaimSpec>,
}

impl StorageConfig {
    /// The storage requested by the data volume claim spec, if any.
    pub fn storage_request(&self) -> Option<&str> {
        self.cassandra_data_volume_claim_spec
            .as_ref()
            .and_then(|spec| spec.resources.as_ref())
            .and_then(|resources| resources.requests.as_ref())
            .and_then(|requests| requests.get("storage"))
            .map(|quantity| quantity.0.as_str())
            .filter(|quantity| !quantity.is_empty())
    }
}

/// Management API auth config, as declared on the CRD.
///
/// At most one strategy may be set. See `ManagementApiAuthConfig::strategy`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagementApiAuthConfig {
    #[serde(default)]
    pub insecure: Option<ManagementApiAuthInsecureConfig>,
    #[serde(default)]
    pub manual: Option<ManagementApiAuthManualConfig>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct ManagementApiAuthInsecureConfig {}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagementApiAuthManualConfig {
    pub client_secret_name: String,
    pub server_secret_name: String,
    #[serde(default)]
    pub skip_secret_validation: bool,
}

/// The resolved management API auth strategy of a datacenter.
#[derive(Clone, Debug, PartialEq)]
pub enum ManagementApiAuth {
    /// Plain HTTP, no client credentials.
    Insecure,
    /// Mutual TLS using manually provisioned secrets.
    Manual(ManagementApiAuthManualConfig),
}

impl ManagementApiAuthConfig {
    /// Resolve the configured strategy, defaulting to `Insecure` when nothing is set.
    pub fn strategy(&self) -> Result<ManagementApiAuth, AppError> {
        match (&self.insecure, &self.manual) {
            (Some(_), Some(_)) => Err(AppError::InvalidInput(
                "managementApiAuth may declare only one of `insecure` or `manual`".into(),
            )),
            (_, Some(manual)) => Ok(ManagementApiAuth::Manual(manual.clone())),
            _ => Ok(ManagementApiAuth::Insecure),
        }
    }
}

/// Coarse progress of the operator for a datacenter.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum ProgressState {
    Updating,
    Ready,
}

impl std::fmt::Display for ProgressState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Updating => "Updating",
                Self::Ready => "Ready",
            }
        )
    }
}

/// Identity of a server node as last reported by the node itself.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub struct CassandraNodeStatus {
    #[serde(rename = "hostID", default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
    #[serde(rename = "nodeIP", default, skip_serializing_if = "Option::is_none")]
    pub node_ip: Option<String>,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CassandraDatacenterStatus {
    /// The timestamp at which CQL superuser credentials were last upserted to the management API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub super_user_upserted: Option<DateTime<Utc>>,
    /// The timestamp when the operator last started a server node with the management API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_server_node_started: Option<DateTime<Utc>>,
    /// Last known progress state of the operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cassandra_operator_progress: Option<ProgressState>,
    /// The timestamp of the last completed rolling restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rolling_restart: Option<DateTime<Utc>>,
    /// Host ID and IP of every node which has reported them.
    #[serde(default)]
    pub node_statuses: BTreeMap<String, CassandraNodeStatus>,
    /// Nodes currently flagged for replacement.
    #[serde(default)]
    pub node_replacements: Vec<String>,
    /// The single in-flight multi-node operation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<OperationRecord>,
    /// The last `spec.rollingRestartRequest` token which has been handled.
    #[serde(default)]
    pub rolling_restart_ack: u64,
    /// Entries of `spec.replaceNodes` which have already been replaced.
    #[serde(default)]
    pub completed_replacements: Vec<String>,
    /// A human readable annotation describing why progress is blocked, if it is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// The generation of the spec last seen by the operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl CassandraDatacenter {
    /// The racks of this datacenter, always containing at least one rack.
    pub fn racks(&self) -> Vec<Rack> {
        if self.spec.racks.is_empty() {
            vec![Rack::new(DEFAULT_RACK_NAME)]
        } else {
            self.spec.racks.clone()
        }
    }

    /// Resolve the fully qualified server image for this datacenter.
    ///
    /// An explicitly specified image always wins; otherwise a known image is looked up from the
    /// server type and version.
    pub fn server_image(&self) -> Result<String, AppError> {
        match self.spec.server_image.as_deref() {
            Some(image) if !image.is_empty() => Ok(image.to_string()),
            _ => image_for_server_version(self.spec.server_type, &self.spec.server_version),
        }
    }

    /// The image of the config builder init container.
    pub fn config_builder_image(&self) -> &str {
        match self.spec.config_builder_image.as_deref() {
            Some(image) if !image.is_empty() => image,
            _ => DEFAULT_CONFIG_BUILDER_IMAGE,
        }
    }

    /// Labels identifying the cluster of this datacenter.
    pub fn cluster_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_CLUSTER.into(), clean_name(&self.spec.cluster_name));
        labels.insert(LABEL_MANAGED_BY.into(), OPERATOR_NAME.into());
        labels
    }

    /// Labels identifying this datacenter.
    pub fn datacenter_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.cluster_labels();
        labels.insert(LABEL_DATACENTER.into(), self.name().into());
        labels
    }

    /// Labels identifying the given rack of this datacenter.
    pub fn rack_labels(&self, rack: &str) -> BTreeMap<String, String> {
        let mut labels = self.datacenter_labels();
        labels.insert(LABEL_RACK.into(), rack.into());
        labels
    }

    /// The headless service which resolves to the seed nodes of the whole cluster.
    pub fn seed_service_name(&self) -> String {
        format!("{}-seed-service", clean_name(&self.spec.cluster_name))
    }

    /// The headless service which resolves to all pods of this datacenter, ready or not.
    pub fn all_pods_service_name(&self) -> String {
        format!("{}-{}-all-pods-service", clean_name(&self.spec.cluster_name), self.name())
    }

    /// The client facing service of this datacenter.
    pub fn datacenter_service_name(&self) -> String {
        format!("{}-{}-service", clean_name(&self.spec.cluster_name), self.name())
    }

    /// The name of the secret holding the superuser credentials.
    pub fn superuser_secret_name(&self) -> String {
        match self.spec.superuser_secret_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("{}-superuser", clean_name(&self.spec.cluster_name)),
        }
    }

    /// The name of the StatefulSet backing the given rack.
    pub fn statefulset_name(&self, rack: &str) -> String {
        format!("{}-{}-{}-sts", clean_name(&self.spec.cluster_name), self.name(), clean_name(rack))
    }

    /// The name of the pod for the given rack and ordinal.
    pub fn pod_name(&self, rack: &str, ordinal: u32) -> String {
        format!("{}-{}", self.statefulset_name(rack), ordinal)
    }

    /// Render the config document handed to the config builder.
    ///
    /// The seed list is the seed service of the cluster.
    pub fn config_json(&self) -> Result<Value, AppError> {
        let model = serverconfig::model_values(&[self.seed_service_name()], &self.spec.cluster_name, self.name());
        serverconfig::render_config(model, self.spec.config.as_ref())
    }

    /// The hash of everything which requires a node restart when it changes.
    ///
    /// This is stamped onto the pod template of every rack, and pods created from an older
    /// template carry an older hash.
    pub fn config_hash(&self) -> Result<String, AppError> {
        Ok(serverconfig::config_hash(&self.config_json()?, &self.server_image()?))
    }

    /// The container ports exposed by the server container, based on the rendered config.
    pub fn container_ports(&self) -> Result<Vec<ContainerPort>, AppError> {
        let mut ports: Vec<ContainerPort> = [
            // NOTE: port names can not be longer than 15 characters.
            ("native", 9042),
            ("inter-node-msg", 8609),
            ("intra-node", 7000),
            ("tls-intra-node", 7001),
            ("mgmt-api-http", 8080),
        ]
        .iter()
        .map(|(name, port)| container_port(name, *port))
        .collect();

        let config = self.config_json()?;
        let prom_enabled = serverconfig::search_object(&config, "10-write-prom-conf")
            .map(|prom| prom.contains_key("enabled"))
            .unwrap_or(false);
        if prom_enabled {
            ports.push(container_port("prometheus", 9103));
        }
        Ok(ports)
    }

    /// Validate the spec of this datacenter, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errs = vec![];
        if self.spec.size < 1 {
            errs.push("spec.size must be at least 1".to_string());
        }
        if self.spec.cluster_name.len() < 2 {
            errs.push("spec.clusterName must be at least 2 characters long".to_string());
        }
        let mut seen = HashSet::new();
        for rack in self.spec.racks.iter() {
            if rack.name.is_empty() {
                errs.push("spec.racks entries must have a name".to_string());
            } else if !seen.insert(clean_name(&rack.name)) {
                errs.push(format!("spec.racks declares rack '{}' more than once", rack.name));
            }
        }
        if self.spec.storage_config.storage_request().is_none() {
            errs.push("spec.storageConfig.cassandraDataVolumeClaimSpec must request storage".to_string());
        }
        if let Err(err) = self.server_image() {
            errs.push(err.to_string());
        }
        if let Err(err) = self.config_json() {
            errs.push(err.to_string());
        }
        if let Err(err) = self.spec.management_api_auth.strategy() {
            errs.push(err.to_string());
        }
        if errs.is_empty() {
            Ok(())
        } else {
            Err(errs)
        }
    }
}

/// Look up a known image for a server type and version.
fn image_for_server_version(server_type: ServerType, version: &str) -> Result<String, AppError> {
    match (server_type, version) {
        (ServerType::Dse, "6.8.0") => Ok(format!("{}:{}", DEFAULT_DSE_REPOSITORY, DEFAULT_DSE_VERSION)),
        (ServerType::Cassandra, "3.11.6") => Ok(format!("{}:{}", DEFAULT_CASS_REPOSITORY, DEFAULT_CASS_VERSION)),
        _ => Err(AppError::UnsupportedServerVersion {
            server_type: server_type.to_string(),
            version: version.to_string(),
        }),
    }
}

/// Make the given name usable as part of a K8s object name.
fn clean_name(name: &str) -> String {
    name.to_lowercase().replace('_', "-")
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.into()),
        container_port: port,
        ..Default::default()
    }
}

/// Schema for free-form JSON objects.
fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema
        .extensions
        .insert("x-kubernetes-preserve-unknown-fields".into(), Value::Bool(true));
    Schema::Object(schema)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn datacenter(spec: Value) -> CassandraDatacenter {
        let mut dc: CassandraDatacenter = serde_json::from_value(json!({
            "apiVersion": "cassandra.datastax.com/v1beta1",
            "kind": "CassandraDatacenter",
            "metadata": {"name": "dc1", "namespace": "default"},
            "spec": {
                "size": 3,
                "serverType": "cassandra",
                "serverVersion": "3.11.6",
                "clusterName": "cluster1",
                "storageConfig": {"cassandraDataVolumeClaimSpec": {"resources": {"requests": {"storage": "1Gi"}}}},
            },
        }))
        .expect("fixture should deserialize");
        if let Value::Object(overrides) = spec {
            let mut raw = serde_json::to_value(&dc.spec).expect("spec should serialize");
            for (key, val) in overrides {
                raw[key] = val;
            }
            dc.spec = serde_json::from_value(raw).expect("spec overrides should deserialize");
        }
        dc
    }

    #[test]
    fn racks_default_to_single_default_rack() {
        let dc = datacenter(json!({}));
        let racks = dc.racks();
        assert!(racks == vec![Rack::new(DEFAULT_RACK_NAME)], "expected a single default rack, got {:?}", racks);
    }

    #[test]
    fn server_image_resolves_known_versions() {
        let dc = datacenter(json!({}));
        let image = dc.server_image().expect("known version should resolve");
        assert!(image == "datastaxlabs/apache-cassandra-with-mgmtapi:3.11.6-20200316", "unexpected image {}", image);

        let dc = datacenter(json!({"serverType": "dse", "serverVersion": "6.8.0"}));
        let image = dc.server_image().expect("known version should resolve");
        assert!(image == "datastaxlabs/dse-k8s-server:6.8.0-20200316", "unexpected image {}", image);
    }

    #[test]
    fn server_image_rejects_mismatched_pairs_unless_explicit() {
        let dc = datacenter(json!({"serverType": "dse", "serverVersion": "3.11.6"}));
        assert!(
            matches!(dc.server_image(), Err(AppError::UnsupportedServerVersion { .. })),
            "expected unsupported server version error"
        );

        let dc = datacenter(json!({"serverType": "dse", "serverVersion": "3.11.6", "serverImage": "my/image:1"}));
        let image = dc.server_image().expect("explicit image should win");
        assert!(image == "my/image:1", "unexpected image {}", image);
    }

    #[test]
    fn names_are_derived_from_cluster_and_datacenter() {
        let dc = datacenter(json!({"clusterName": "Cluster_One"}));
        assert!(dc.seed_service_name() == "cluster-one-seed-service", "got {}", dc.seed_service_name());
        assert!(dc.all_pods_service_name() == "cluster-one-dc1-all-pods-service", "got {}", dc.all_pods_service_name());
        assert!(dc.datacenter_service_name() == "cluster-one-dc1-service", "got {}", dc.datacenter_service_name());
        assert!(dc.superuser_secret_name() == "cluster-one-superuser", "got {}", dc.superuser_secret_name());
        assert!(dc.pod_name("r1", 2) == "cluster-one-dc1-r1-sts-2", "got {}", dc.pod_name("r1", 2));

        let dc = datacenter(json!({"superuserSecretName": "my-secret"}));
        assert!(dc.superuser_secret_name() == "my-secret", "got {}", dc.superuser_secret_name());
    }

    #[test]
    fn container_ports_include_prometheus_when_enabled() {
        let dc = datacenter(json!({}));
        let ports = dc.container_ports().expect("ports should render");
        assert!(ports.len() == 5, "expected 5 ports got {}", ports.len());

        let dc = datacenter(json!({"config": {"10-write-prom-conf": {"enabled": true}}}));
        let ports = dc.container_ports().expect("ports should render");
        assert!(
            ports.iter().any(|p| p.container_port == 9103),
            "expected prometheus port, got {:?}",
            ports
        );
    }

    #[test]
    fn validate_reports_every_problem() {
        let dc = datacenter(json!({
            "size": 0,
            "racks": [{"name": "r1"}, {"name": "r1"}],
            "serverType": "dse",
            "managementApiAuth": {"insecure": {}, "manual": {"clientSecretName": "c", "serverSecretName": "s"}},
        }));
        let errs = dc.validate().expect_err("spec should be invalid");
        assert!(errs.len() == 4, "expected 4 errors got {}: {:?}", errs.len(), errs);
    }

    #[test]
    fn validate_requires_a_storage_request() {
        let dc = datacenter(json!({"storageConfig": {}}));
        let errs = dc.validate().expect_err("spec without storage should be invalid");
        assert!(errs.len() == 1, "expected 1 error got {}: {:?}", errs.len(), errs);
        assert!(errs[0].contains("cassandraDataVolumeClaimSpec"), "unexpected error {}", errs[0]);

        let dc = datacenter(json!({"storageConfig": {"cassandraDataVolumeClaimSpec": {"storageClassName": "fast"}}}));
        assert!(dc.validate().is_err(), "expected a claim spec without a storage request to be rejected");
    }

    #[test]
    fn auth_strategy_defaults_to_insecure() {
        let dc = datacenter(json!({}));
        let strategy = dc.spec.management_api_auth.strategy().expect("strategy should resolve");
        assert!(strategy == ManagementApiAuth::Insecure, "expected insecure got {:?}", strategy);
    }
}
