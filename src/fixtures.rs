//! An in-memory simulated cluster used to drive the control loop in tests.
//!
//! The simulation stands in for both K8s and the management API of every node. Passes only ever
//! mutate the simulation through `ClusterOps` and `NodeManagement`; everything K8s or the server
//! process would do on its own happens in `tick`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;

use crate::error::{ReconcileError, ReconcileResult};
use crate::lifecycle::{PodInfo, RemoteStatus};
use crate::mgmt::{Credentials, MgmtError, NodeAddr, NodeManagement};
use crate::reconciler::{ClusterOps, Observed};
use crate::sequencer::RackState;
use cass_core::crd::{CassandraDatacenter, Rack};
use cass_core::{LABEL_NODE_STATE, LABEL_SEED_NODE};

/// A simulated server pod.
#[derive(Clone, Debug)]
pub struct SimPod {
    pub rack: String,
    pub ordinal: u32,
    pub uid: String,
    pub ip: String,
    pub seed: bool,
    pub state_label: Option<String>,
    pub config_hash: Option<String>,
    pub terminating: bool,
    /// The state reported by the server process.
    pub server: String,
    pub host_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct SimState {
    pub racks: BTreeMap<String, RackState>,
    pub pods: BTreeMap<String, SimPod>,
    pub volumes: BTreeSet<String>,
    pub services: BTreeSet<String>,
    /// Pods whose management API does not answer.
    pub unreachable: BTreeSet<String>,
    /// Pods whose next start, decommission or drain is answered with a 409, as if it had already
    /// been made.
    pub already_done: BTreeSet<String>,
    /// Every mutating call made against the simulation, in order.
    pub calls: Vec<String>,
    pub superuser: Option<Credentials>,
    counter: u32,
}

/// A simulated cluster.
#[derive(Debug, Default)]
pub struct SimCluster {
    state: Mutex<SimState>,
}

impl SimCluster {
    /// Run a closure against the state of the simulation.
    pub fn with<T>(&self, f: impl FnOnce(&mut SimState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        f(&mut state)
    }

    /// Every recorded call starting with the given prefix.
    pub fn calls(&self, prefix: &str) -> Vec<String> {
        self.with(|state| state.calls.iter().filter(|call| call.starts_with(prefix)).cloned().collect())
    }

    /// The number of calls recorded so far.
    pub fn call_count(&self) -> usize {
        self.with(|state| state.calls.len())
    }

    /// Advance the simulation by one step of wall clock time.
    pub fn tick(&self, dc: &CassandraDatacenter) {
        self.with(|state| {
            for pod in state.pods.values_mut() {
                let next = match pod.server.as_str() {
                    "STARTING" => "JOINING",
                    "JOINING" => "NORMAL",
                    "LEAVING" => "DECOMMISSIONED",
                    other => other,
                };
                if next == "NORMAL" && pod.host_id.is_none() {
                    pod.host_id = Some(format!("host-{}", pod.uid));
                }
                pod.server = next.to_string();
            }

            let racks = state.racks.clone();
            state.pods.retain(|_, pod| {
                let replicas = racks.get(&pod.rack).map(|rack| rack.replicas).unwrap_or(0);
                !pod.terminating && pod.ordinal < replicas
            });
            for (rack, rack_state) in racks.iter() {
                for ordinal in 0..rack_state.replicas {
                    let name = dc.pod_name(rack, ordinal);
                    if state.pods.contains_key(&name) {
                        continue;
                    }
                    state.counter += 1;
                    let counter = state.counter;
                    state.volumes.insert(name.clone());
                    state.pods.insert(
                        name,
                        SimPod {
                            rack: rack.clone(),
                            ordinal,
                            uid: format!("uid-{}", counter),
                            ip: format!("10.0.{}.{}", counter / 250, counter % 250),
                            seed: false,
                            state_label: None,
                            config_hash: rack_state.template_hash.clone(),
                            terminating: false,
                            server: "NOT_STARTED".into(),
                            host_id: None,
                        },
                    );
                }
            }
        })
    }

    /// The number of pods whose server is neither normal nor decommissioned.
    pub fn unsettled(&self) -> usize {
        self.with(|state| {
            state
                .pods
                .values()
                .filter(|pod| pod.server != "NORMAL" && pod.server != "DECOMMISSIONED")
                .count()
        })
    }

    /// The names of the pods carrying the seed label.
    pub fn seeds(&self) -> Vec<String> {
        self.with(|state| state.pods.iter().filter(|(_, pod)| pod.seed).map(|(name, _)| name.clone()).collect())
    }

    fn reachable_pod(&self, node: &NodeAddr) -> Result<(), MgmtError> {
        self.with(|state| match state.pods.get(&node.pod) {
            Some(pod) if !pod.terminating && pod.ip == node.ip && !state.unreachable.contains(&node.pod) => Ok(()),
            _ => Err(MgmtError::Unreachable(node.pod.clone(), "connection refused".into())),
        })
    }

    fn set_server(&self, node: &NodeAddr, call: String, f: impl FnOnce(&str) -> Result<&'static str, MgmtError>) -> Result<(), MgmtError> {
        self.reachable_pod(node)?;
        self.with(|state| {
            if state.already_done.remove(&node.pod) {
                state.calls.push(format!("{} (already done)", call));
                return Err(MgmtError::AlreadyRunning(node.pod.clone()));
            }
            let pod = state
                .pods
                .get_mut(&node.pod)
                .ok_or_else(|| MgmtError::Unreachable(node.pod.clone(), "no such pod".into()))?;
            pod.server = f(&pod.server)?.to_string();
            state.calls.push(call);
            Ok(())
        })
    }
}

#[async_trait]
impl ClusterOps for SimCluster {
    async fn observe(&self, _: &CassandraDatacenter) -> ReconcileResult<Observed> {
        Ok(self.with(|state| Observed {
            racks: state.racks.clone(),
            pods: state
                .pods
                .iter()
                .map(|(name, pod)| PodInfo {
                    name: name.clone(),
                    rack: pod.rack.clone(),
                    ordinal: pod.ordinal,
                    uid: Some(pod.uid.clone()),
                    ip: Some(pod.ip.clone()),
                    seed: pod.seed,
                    config_hash: pod.config_hash.clone(),
                    terminating: pod.terminating,
                    state_label: pod.state_label.clone(),
                })
                .collect(),
            volumes: state.volumes.clone(),
            services: state.services.clone(),
        }))
    }

    async fn apply_services(&self, dc: &CassandraDatacenter) -> ReconcileResult<()> {
        self.with(|state| {
            state.services.insert(dc.seed_service_name());
            state.services.insert(dc.all_pods_service_name());
            state.services.insert(dc.datacenter_service_name());
            state.calls.push("apply_services".into());
        });
        Ok(())
    }

    async fn apply_rack(&self, dc: &CassandraDatacenter, rack: &Rack, replicas: u32) -> ReconcileResult<()> {
        let hash = dc.config_hash().map_err(|err| ReconcileError::InvalidDesiredState(err.to_string()))?;
        self.with(|state| {
            state.racks.insert(rack.name.clone(), RackState { replicas, template_hash: Some(hash) });
            state.calls.push(format!("apply_rack {} {}", rack.name, replicas));
        });
        Ok(())
    }

    async fn scale_rack(&self, _: &CassandraDatacenter, rack: &str, replicas: u32) -> ReconcileResult<()> {
        self.with(|state| {
            let rack_state = state
                .racks
                .get_mut(rack)
                .ok_or_else(|| ReconcileError::Transient(anyhow!("statefulset of rack {} not found", rack)))?;
            rack_state.replicas = replicas;
            state.calls.push(format!("scale {} {}", rack, replicas));
            Ok(())
        })
    }

    async fn delete_pod(&self, _: &CassandraDatacenter, pod: &str) -> ReconcileResult<()> {
        self.with(|state| {
            if let Some(pod) = state.pods.get_mut(pod) {
                pod.terminating = true;
            }
            state.calls.push(format!("delete_pod {}", pod));
        });
        Ok(())
    }

    async fn delete_volume(&self, _: &CassandraDatacenter, pod: &str) -> ReconcileResult<()> {
        self.with(|state| {
            state.volumes.remove(pod);
            state.calls.push(format!("delete_volume {}", pod));
        });
        Ok(())
    }

    async fn label_pod(&self, _: &CassandraDatacenter, pod: &str, labels: &BTreeMap<String, Option<String>>) -> ReconcileResult<()> {
        self.with(|state| {
            let pod = state
                .pods
                .get_mut(pod)
                .ok_or_else(|| ReconcileError::Transient(anyhow!("pod {} not found", pod)))?;
            if let Some(seed) = labels.get(LABEL_SEED_NODE) {
                pod.seed = seed.as_deref() == Some("true");
            }
            if let Some(node_state) = labels.get(LABEL_NODE_STATE) {
                pod.state_label = node_state.clone();
            }
            Ok(())
        })
    }

    async fn superuser_credentials(&self, _: &CassandraDatacenter) -> ReconcileResult<Option<Credentials>> {
        Ok(self.with(|state| state.superuser.clone()))
    }
}

#[async_trait]
impl NodeManagement for SimCluster {
    async fn status(&self, _: &CassandraDatacenter, node: &NodeAddr) -> Result<RemoteStatus, MgmtError> {
        self.reachable_pod(node)?;
        self.with(|state| {
            let pod = state
                .pods
                .get(&node.pod)
                .ok_or_else(|| MgmtError::Unreachable(node.pod.clone(), "no such pod".into()))?;
            Ok(RemoteStatus {
                state: pod.server.clone(),
                host_id: pod.host_id.clone(),
                ip: Some(pod.ip.clone()),
            })
        })
    }

    async fn start(&self, _: &CassandraDatacenter, node: &NodeAddr, replace_ip: Option<&str>) -> Result<(), MgmtError> {
        let call = match replace_ip {
            Some(ip) => format!("start {} replace_ip={}", node.pod, ip),
            None => format!("start {}", node.pod),
        };
        self.set_server(node, call, |server| match server {
            "NOT_STARTED" | "DRAINED" | "STOPPED" => Ok("STARTING"),
            _ => Err(MgmtError::AlreadyRunning(node.pod.clone())),
        })
    }

    async fn decommission(&self, _: &CassandraDatacenter, node: &NodeAddr) -> Result<(), MgmtError> {
        self.set_server(node, format!("decommission {}", node.pod), |server| match server {
            "NORMAL" => Ok("LEAVING"),
            other => Err(MgmtError::Rejected { node: node.pod.clone(), code: 500, body: format!("node is {}", other) }),
        })
    }

    async fn drain(&self, _: &CassandraDatacenter, node: &NodeAddr) -> Result<(), MgmtError> {
        self.set_server(node, format!("drain {}", node.pod), |_| Ok("DRAINED"))
    }

    async fn upsert_superuser(&self, _: &CassandraDatacenter, node: &NodeAddr, creds: &Credentials) -> Result<(), MgmtError> {
        self.reachable_pod(node)?;
        self.with(|state| state.calls.push(format!("upsert_superuser {}", creds.username)));
        Ok(())
    }
}
