//! Manifest generation for the K8s objects backing a datacenter.
//!
//! Everything here is a pure function of the datacenter, so applying the same datacenter twice
//! always yields the same objects.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    Affinity, Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, HTTPGetAction, NodeAffinity, NodeSelector, NodeSelectorRequirement,
    NodeSelectorTerm, ObjectFieldSelector, PersistentVolumeClaim, PodAffinityTerm, PodAntiAffinity, PodSpec, PodTemplateSpec, Probe, Service,
    ServicePort, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::Resource;

use cass_core::crd::{CassandraDatacenter, Rack, RequiredMetadata, ServerType};
use cass_core::{AppError, ANNOTATION_CONFIG_HASH, LABEL_CLUSTER, LABEL_MANAGED_BY, LABEL_SEED_NODE, OPERATOR_NAME};

/// The name of the data volume claim template.
///
/// NOTE WELL: do not change this name. Existing claims are named after it.
pub const DATA_VOLUME_NAME: &str = "server-data";
/// The pod container name of the server.
///
/// NOTE WELL: do not change the name of this container. It will cause breaking changes.
const CONTAINER_NAME_SERVER: &str = "cassandra";
const CONTAINER_NAME_CONFIG_INIT: &str = "server-config-init";
const CONFIG_VOLUME_NAME: &str = "server-config";
pub(super) const CONFIG_PATH: &str = "/config";
pub(super) const DATA_PATH: &str = "/var/lib/cassandra";
pub(super) const PORT_NATIVE: i32 = 9042;
pub(super) const PORT_MGMT_API: i32 = 8080;
const PATH_PROBE_READINESS: &str = "/api/v0/probes/readiness";
const PATH_PROBE_LIVENESS: &str = "/api/v0/probes/liveness";
/// The well known node label carrying the zone of a K8s worker.
const LABEL_K8S_ZONE: &str = "failure-domain.beta.kubernetes.io/zone";
const LABEL_K8S_HOSTNAME: &str = "kubernetes.io/hostname";

/// The name of the data volume claim of the given pod.
pub fn volume_claim_name(pod: &str) -> String {
    format!("{}-{}", DATA_VOLUME_NAME, pod)
}

/// Build the StatefulSet backing the given rack.
pub fn statefulset(dc: &CassandraDatacenter, rack: &Rack, replicas: u32) -> Result<StatefulSet, AppError> {
    let image = dc.server_image()?;
    let config = dc.config_json()?;
    let config_hash = dc.config_hash()?;
    let ports = dc.container_ports()?;

    // Build metadata.
    let mut sts = StatefulSet::default();
    let labels = sts.meta_mut().labels.get_or_insert_with(Default::default);
    labels.extend(dc.rack_labels(&rack.name));
    set_cannonical_labels(labels);
    let labels = labels.clone(); // Used below.
    sts.meta_mut().namespace = Some(dc.namespace().into());
    sts.meta_mut().name = Some(dc.statefulset_name(&rack.name));
    sts.meta_mut().owner_references = owner_reference(dc).map(|owner| vec![owner]);

    // Build spec.
    let spec = sts.spec.get_or_insert_with(Default::default);
    // Pods are only ever replaced by the operator, one at a time.
    spec.update_strategy = Some(StatefulSetUpdateStrategy {
        type_: Some("OnDelete".into()),
        rolling_update: None,
    });
    spec.pod_management_policy = Some("Parallel".into());
    spec.service_name = dc.all_pods_service_name();
    spec.replicas = Some(replicas as i32);
    spec.selector = LabelSelector {
        match_labels: Some(labels.clone()),
        ..Default::default()
    };

    let product_name = dc.spec.server_type.to_string();
    let mut server_env = vec![
        env("USE_MGMT_API", "true"),
        env("MGMT_API_EXPLICIT_START", "true"),
    ];
    if dc.spec.server_type == ServerType::Dse {
        server_env.push(env("DSE_MGMT_EXPLICIT_START", "true"));
    }

    spec.template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels.clone()),
            annotations: Some(maplit::btreemap! {
                ANNOTATION_CONFIG_HASH.into() => config_hash,
            }),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            termination_grace_period_seconds: Some(120),
            service_account_name: dc.spec.service_account.clone(),
            affinity: affinity(dc, rack),
            init_containers: Some(vec![Container {
                name: CONTAINER_NAME_CONFIG_INIT.into(),
                image: Some(dc.config_builder_image().into()),
                image_pull_policy: Some("IfNotPresent".into()),
                env: Some(vec![
                    env("CONFIG_FILE_DATA", &config.to_string()),
                    field_env("POD_IP", "status.podIP"),
                    field_env("HOST_IP", "status.hostIP"),
                    env("USE_HOST_IP_FOR_BROADCAST", "false"),
                    env("RACK_NAME", &rack.name),
                    env("PRODUCT_VERSION", &dc.spec.server_version),
                    env("PRODUCT_NAME", &product_name),
                ]),
                volume_mounts: Some(vec![VolumeMount {
                    name: CONFIG_VOLUME_NAME.into(),
                    mount_path: CONFIG_PATH.into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
            containers: vec![Container {
                // NOTE WELL: do not change the name of this container. It will cause breaking changes.
                name: CONTAINER_NAME_SERVER.into(),
                image: Some(image),
                image_pull_policy: Some("IfNotPresent".into()),
                ports: Some(ports),
                env: Some(server_env),
                resources: dc.spec.resources.clone(),
                volume_mounts: Some(vec![
                    VolumeMount {
                        name: DATA_VOLUME_NAME.into(),
                        mount_path: DATA_PATH.into(),
                        ..Default::default()
                    },
                    VolumeMount {
                        name: CONFIG_VOLUME_NAME.into(),
                        mount_path: CONFIG_PATH.into(),
                        ..Default::default()
                    },
                ]),
                readiness_probe: Some(http_probe(PATH_PROBE_READINESS, 20, 10)),
                liveness_probe: Some(http_probe(PATH_PROBE_LIVENESS, 15, 15)),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: CONFIG_VOLUME_NAME.into(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    };

    // Build volume claim templates.
    let mut claim_spec = dc.spec.storage_config.cassandra_data_volume_claim_spec.clone().unwrap_or_default();
    if claim_spec.access_modes.as_ref().map(|modes| modes.is_empty()).unwrap_or(true) {
        claim_spec.access_modes = Some(vec!["ReadWriteOnce".into()]);
    }
    spec.volume_claim_templates = Some(vec![PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME_NAME.into()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(claim_spec),
        ..Default::default()
    }]);

    Ok(sts)
}

/// Build every service of the given datacenter.
pub fn services(dc: &CassandraDatacenter) -> Vec<Service> {
    // Resolves to the seeds of the whole cluster, across datacenters.
    let mut seed_selector = dc.cluster_labels();
    seed_selector.insert(LABEL_SEED_NODE.into(), "true".into());
    let seed = service(dc, dc.seed_service_name(), dc.cluster_labels(), seed_selector, vec![], true);

    // Used as the governing service of every rack, so pods resolve before they are ready.
    let all_pods = service(
        dc,
        dc.all_pods_service_name(),
        dc.datacenter_labels(),
        dc.datacenter_labels(),
        vec![service_port("native", PORT_NATIVE), service_port("mgmt-api", PORT_MGMT_API)],
        true,
    );

    let datacenter = service(
        dc,
        dc.datacenter_service_name(),
        dc.datacenter_labels(),
        dc.datacenter_labels(),
        vec![service_port("native", PORT_NATIVE), service_port("mgmt-api", PORT_MGMT_API)],
        false,
    );
    vec![seed, all_pods, datacenter]
}

fn service(
    dc: &CassandraDatacenter, name: String, mut labels: BTreeMap<String, String>, mut selector: BTreeMap<String, String>, ports: Vec<ServicePort>,
    publish_not_ready: bool,
) -> Service {
    // Build metadata.
    let mut service = Service::default();
    set_cannonical_labels(&mut labels);
    service.meta_mut().labels = Some(labels);
    service.meta_mut().namespace = Some(dc.namespace().into());
    service.meta_mut().name = Some(name);
    service.meta_mut().owner_references = owner_reference(dc).map(|owner| vec![owner]);

    // Build spec.
    let spec = service.spec.get_or_insert_with(Default::default);
    set_cannonical_labels(&mut selector);
    spec.selector = Some(selector);
    spec.cluster_ip = Some("None".into());
    spec.type_ = Some("ClusterIP".into());
    if publish_not_ready {
        spec.publish_not_ready_addresses = Some(true);
    }
    if !ports.is_empty() {
        spec.ports = Some(ports);
    }
    service
}

/// A controller reference to the given datacenter, once it has been persisted.
fn owner_reference(dc: &CassandraDatacenter) -> Option<OwnerReference> {
    let meta = dc.meta();
    Some(OwnerReference {
        api_version: CassandraDatacenter::api_version(&()).to_string(),
        kind: CassandraDatacenter::kind(&()).to_string(),
        name: meta.name.clone()?,
        uid: meta.uid.clone()?,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Pin a rack to its zone, and spread server pods over workers unless told otherwise.
fn affinity(dc: &CassandraDatacenter, rack: &Rack) -> Option<Affinity> {
    let node_affinity = rack.zone.as_ref().filter(|zone| !zone.is_empty()).map(|zone| NodeAffinity {
        required_during_scheduling_ignored_during_execution: Some(NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(vec![NodeSelectorRequirement {
                    key: LABEL_K8S_ZONE.into(),
                    operator: "In".into(),
                    values: Some(vec![zone.clone()]),
                }]),
                ..Default::default()
            }],
        }),
        ..Default::default()
    });
    let pod_anti_affinity = if dc.spec.allow_multiple_nodes_per_worker {
        None
    } else {
        Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                label_selector: Some(LabelSelector {
                    match_expressions: Some(vec![LabelSelectorRequirement {
                        key: LABEL_CLUSTER.into(),
                        operator: "Exists".into(),
                        values: None,
                    }]),
                    ..Default::default()
                }),
                topology_key: LABEL_K8S_HOSTNAME.into(),
                ..Default::default()
            }]),
            ..Default::default()
        })
    };
    if node_affinity.is_none() && pod_anti_affinity.is_none() {
        return None;
    }
    Some(Affinity {
        node_affinity,
        pod_anti_affinity,
        ..Default::default()
    })
}

fn http_probe(path: &str, initial_delay: i32, period: i32) -> Probe {
    Probe {
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        http_get: Some(HTTPGetAction {
            path: Some(path.into()),
            port: IntOrString::Int(PORT_MGMT_API),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.into()),
        port,
        protocol: Some("TCP".into()),
        target_port: Some(IntOrString::Int(port)),
        ..Default::default()
    }
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.into(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Set the cannonical labels on an object controlled by this operator.
pub fn set_cannonical_labels(labels: &mut BTreeMap<String, String>) {
    labels.insert(LABEL_MANAGED_BY.into(), OPERATOR_NAME.into());
}
