//! Reconciliation control loop.
//!
//! A pass observes one datacenter, plans its topology, classifies every node and then performs at
//! most one step of pending work. The pass never blocks on the cluster converging; it requeues and
//! looks again. Everything the pass needs to remember across passes lives in the datacenter's
//! status, which the caller persists once the pass returns.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use metrics::increment_counter;

use crate::error::{ReconcileError, ReconcileResult};
use crate::lifecycle::{self, NodeSlot, NodeState, PodInfo, RemoteStatus};
use crate::mgmt::{Credentials, MgmtError, NodeAddr, NodeManagement};
use crate::sequencer::{self, ClusterView, RackState, StepAction, Work};
use crate::status;
use crate::topology::{self, TopologyPlan};
use cass_core::crd::{CassandraDatacenter, CassandraDatacenterStatus, OperationKind, ProgressState, Rack, RequiredMetadata};
use cass_core::{LABEL_NODE_STATE, LABEL_SEED_NODE};

pub const METRIC_PASSES: &str = "cass_operator_reconcile_passes";
pub const METRIC_PASS_ERRORS: &str = "cass_operator_reconcile_errors";
pub const METRIC_STEPS: &str = "cass_operator_operation_steps";

/// What K8s reports about the resources of a datacenter.
#[derive(Clone, Debug, Default)]
pub struct Observed {
    /// The StatefulSet of every rack labeled as part of the datacenter, declared or not.
    pub racks: BTreeMap<String, RackState>,
    /// Every server pod of the datacenter.
    pub pods: Vec<PodInfo>,
    /// The pod names whose data volume exists.
    pub volumes: BTreeSet<String>,
    /// The names of the existing services of the datacenter.
    pub services: BTreeSet<String>,
}

/// The K8s resource operations used by the control loop.
#[async_trait]
pub trait ClusterOps: Send + Sync {
    /// Observe every resource of the given datacenter.
    async fn observe(&self, dc: &CassandraDatacenter) -> ReconcileResult<Observed>;
    /// Apply the services of the given datacenter.
    async fn apply_services(&self, dc: &CassandraDatacenter) -> ReconcileResult<()>;
    /// Apply the StatefulSet of a rack with its current pod template.
    async fn apply_rack(&self, dc: &CassandraDatacenter, rack: &Rack, replicas: u32) -> ReconcileResult<()>;
    /// Scale the StatefulSet of a rack.
    async fn scale_rack(&self, dc: &CassandraDatacenter, rack: &str, replicas: u32) -> ReconcileResult<()>;
    /// Delete a server pod. Deleting a pod which does not exist succeeds.
    async fn delete_pod(&self, dc: &CassandraDatacenter, pod: &str) -> ReconcileResult<()>;
    /// Delete the data volume of a server pod. Deleting a volume which does not exist succeeds.
    async fn delete_volume(&self, dc: &CassandraDatacenter, pod: &str) -> ReconcileResult<()>;
    /// Patch the labels of a server pod, removing the labels mapped to `None`.
    async fn label_pod(&self, dc: &CassandraDatacenter, pod: &str, labels: &BTreeMap<String, Option<String>>) -> ReconcileResult<()>;
    /// Read the superuser credentials of the datacenter, if its secret exists.
    async fn superuser_credentials(&self, dc: &CassandraDatacenter) -> ReconcileResult<Option<Credentials>>;
}

/// When the next pass of a datacenter should run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requeue {
    /// Work is in flight, look again shortly.
    Soon,
    /// A transient failure, look again after a backoff.
    Backoff,
    /// The datacenter is converged, only the periodic resync applies.
    Idle,
    /// The desired state is invalid, wait for the datacenter to change.
    Never,
}

/// The outcome of a single pass.
#[derive(Clone, Debug)]
pub struct PassOutcome {
    /// The status to persist.
    pub status: CassandraDatacenterStatus,
    pub requeue: Requeue,
}

/// Settings of the control loop.
#[derive(Clone, Debug)]
pub struct Settings {
    /// The number of consecutive passes a node may stay unreachable while it is being started.
    pub start_retry_budget: u32,
}

/// The per-datacenter reconciliation driver.
pub struct Reconciler {
    cluster: Arc<dyn ClusterOps>,
    mgmt: Arc<dyn NodeManagement>,
    settings: Settings,
}

impl Reconciler {
    /// Create a new instance.
    pub fn new(cluster: Arc<dyn ClusterOps>, mgmt: Arc<dyn NodeManagement>, settings: Settings) -> Self {
        Self { cluster, mgmt, settings }
    }

    /// Describe every metric emitted by the control loop.
    pub fn register_metrics() {
        metrics::register_counter!(METRIC_PASSES, metrics::Unit::Count, "reconciliation passes run");
        metrics::register_counter!(METRIC_PASS_ERRORS, metrics::Unit::Count, "reconciliation passes which ended in an error");
        metrics::register_counter!(METRIC_STEPS, metrics::Unit::Count, "operation steps executed");
    }

    /// Run a single reconciliation pass over the given datacenter.
    ///
    /// Errors never escape a pass. They are turned into a status message and a requeue decision.
    #[tracing::instrument(level = "debug", skip(self, dc), fields(dc = %dc_key(dc)))]
    pub async fn pass(&self, dc: &CassandraDatacenter) -> PassOutcome {
        increment_counter!(METRIC_PASSES);
        let base = dc.status.clone().unwrap_or_default();
        match self.try_pass(dc, base.clone()).await {
            Ok(outcome) => outcome,
            Err(err) => {
                increment_counter!(METRIC_PASS_ERRORS);
                let requeue = match &err {
                    err if err.is_transient() => {
                        tracing::error!(error = ?err, "error during reconciliation pass");
                        Requeue::Backoff
                    }
                    ReconcileError::InvalidDesiredState(_) => {
                        tracing::warn!(error = %err, "datacenter can not be reconciled until its spec changes");
                        Requeue::Never
                    }
                    _ => {
                        tracing::info!(reason = %err, "next step refused, will look again shortly");
                        Requeue::Soon
                    }
                };
                let mut status = base;
                status.message = Some(err.to_string());
                status.cassandra_operator_progress = Some(ProgressState::Updating);
                status.observed_generation = dc.metadata.generation.or(status.observed_generation);
                PassOutcome { status, requeue }
            }
        }
    }

    async fn try_pass(&self, dc: &CassandraDatacenter, mut status: CassandraDatacenterStatus) -> ReconcileResult<PassOutcome> {
        // Validate the desired state.
        if let Err(errs) = dc.validate() {
            return Err(ReconcileError::InvalidDesiredState(errs.join("; ")));
        }
        let desired_hash = dc
            .config_hash()
            .map_err(|err| ReconcileError::InvalidDesiredState(err.to_string()))?;
        let racks = dc.racks();
        let observed = self.cluster.observe(dc).await?;
        check_orphaned_racks(&racks, &observed)?;

        // Ensure the supporting resources exist.
        if [dc.seed_service_name(), dc.all_pods_service_name(), dc.datacenter_service_name()]
            .iter()
            .any(|name| !observed.services.contains(name))
        {
            self.cluster.apply_services(dc).await?;
        }
        let mut rack_states = BTreeMap::new();
        for rack in racks.iter() {
            let state = match observed.racks.get(&rack.name) {
                Some(state) => state.clone(),
                None => {
                    self.cluster.apply_rack(dc, rack, 0).await?;
                    RackState { replicas: 0, template_hash: Some(desired_hash.clone()) }
                }
            };
            rack_states.insert(rack.name.clone(), state);
        }

        // Observe and classify every node.
        let remotes = self.probe(dc, &observed.pods).await;
        let replacements = replacement_requests(dc, &status);
        let mut slots = build_slots(dc, &racks, &rack_states, &observed, &remotes, &replacements, &status);

        let current = rack_states.iter().map(|(name, state)| (name.clone(), state.replicas)).collect();
        let plan = topology::plan(&racks, &current, dc.spec.size);
        self.sync_pod_labels(dc, &plan, &mut slots).await?;

        let view = ClusterView {
            slots: &slots,
            racks: &rack_states,
            plan: &plan,
            desired_hash: &desired_hash,
            replacements: &replacements,
            retry_budget: self.settings.start_retry_budget,
        };

        // A stopped datacenter abandons whatever was in flight.
        if dc.spec.stopped {
            status.operation = None;
            let step = sequencer::stop_step(&view);
            if let Some(step) = step.as_ref() {
                self.execute(dc, &view, step, &mut status).await?;
            }
            let targets: Vec<(String, u32)> = plan.targets.iter().map(|(rack, _)| (rack.clone(), 0)).collect();
            let status = status::report(&status, &slots, &targets, dc.metadata.generation);
            let requeue = if step.is_some() { Requeue::Soon } else { Requeue::Idle };
            return Ok(PassOutcome { status, requeue });
        }

        let now = Utc::now();
        let mut record = status.operation.clone();
        let step = match record.as_mut() {
            Some(record) => {
                if let Some(item) = record.current() {
                    tracing::debug!(kind = %record.kind, node = %item.node, status = ?item.status, "continuing operation");
                }
                Some(sequencer::next_step(record, &view)?)
            }
            None => match sequencer::derive_work(dc, &status, &view, now) {
                Some(Work::Step(step)) => Some(step),
                Some(Work::Record(mut new_record)) => {
                    tracing::info!(kind = %new_record.kind, items = new_record.items.len(), "starting new operation");
                    let step = sequencer::next_step(&mut new_record, &view)?;
                    record = Some(new_record);
                    Some(step)
                }
                None => None,
            },
        };

        if let Some(step) = step.as_ref() {
            self.execute(dc, &view, step, &mut status).await?;
            // The mutated record is only kept once its step has been executed.
            status.operation = record;
            match step {
                StepAction::Complete => self.complete_operation(dc, &mut status),
                StepAction::Abort { node, reason } => {
                    tracing::error!(%node, %reason, "operation failed, node flagged for replacement");
                    if !status.node_replacements.contains(node) {
                        status.node_replacements.push(node.clone());
                    }
                    status.operation = None;
                }
                _ => (),
            }
        }

        let mut status = status::report(&status, &slots, &plan.targets, dc.metadata.generation);
        let ready = status.cassandra_operator_progress == Some(ProgressState::Ready);
        let mut requeue = if ready && step.is_none() { Requeue::Idle } else { Requeue::Soon };
        if ready {
            status.message = None;
        }
        if ready && status.super_user_upserted.is_none() {
            // The outcome of the step above must still be persisted, so this never fails the pass.
            if let Err(err) = self.upsert_superuser(dc, &slots, &mut status).await {
                tracing::error!(error = ?err, "error upserting superuser");
                status.message = Some(format!("error upserting superuser: {}", err));
                requeue = Requeue::Backoff;
            }
        }
        Ok(PassOutcome { status, requeue })
    }

    /// Fetch the remote status of every pod which may be reachable.
    async fn probe(&self, dc: &CassandraDatacenter, pods: &[PodInfo]) -> BTreeMap<String, RemoteStatus> {
        let probes = pods
            .iter()
            .filter(|pod| !pod.terminating)
            .filter_map(|pod| pod.ip.as_ref().map(|ip| NodeAddr { pod: pod.name.clone(), ip: ip.clone() }))
            .map(|addr| async move {
                let res = self.mgmt.status(dc, &addr).await;
                (addr.pod, res)
            });
        let mut remotes = BTreeMap::new();
        for (pod, res) in join_all(probes).await {
            match res {
                Ok(remote) => {
                    remotes.insert(pod, remote);
                }
                Err(err) => tracing::debug!(%pod, error = %err, "node is not reachable"),
            }
        }
        remotes
    }

    /// Bring the seed and node state labels of every live pod in line with the plan.
    async fn sync_pod_labels(&self, dc: &CassandraDatacenter, plan: &TopologyPlan, slots: &mut [NodeSlot]) -> ReconcileResult<()> {
        let seeds = seed_pods(plan, slots);
        for slot in slots.iter_mut() {
            let seed = seeds.contains(&slot.name);
            let state = slot.state.to_string();
            let pod = match slot.pod.as_mut() {
                Some(pod) if !pod.terminating => pod,
                _ => continue,
            };
            let mut labels = BTreeMap::new();
            if pod.seed != seed {
                labels.insert(LABEL_SEED_NODE.to_string(), if seed { Some("true".to_string()) } else { None });
            }
            if pod.state_label.as_deref() != Some(state.as_str()) {
                labels.insert(LABEL_NODE_STATE.to_string(), Some(state.clone()));
            }
            if labels.is_empty() {
                continue;
            }
            if pod.seed != seed {
                tracing::info!(pod = %pod.name, seed, "updating seed label");
            }
            self.cluster.label_pod(dc, &pod.name, &labels).await?;
            pod.seed = seed;
            pod.state_label = Some(state);
        }
        Ok(())
    }

    /// Execute a single step.
    #[tracing::instrument(level = "debug", skip(self, dc, view, status), fields(step = step.name()))]
    async fn execute(&self, dc: &CassandraDatacenter, view: &ClusterView<'_>, step: &StepAction, status: &mut CassandraDatacenterStatus) -> ReconcileResult<()> {
        if !matches!(step, StepAction::Wait { .. } | StepAction::Complete) {
            increment_counter!(METRIC_STEPS, "step" => step.name());
        }
        status.message = None;
        match step {
            StepAction::ApplyRack { rack } => {
                let rack = dc
                    .racks()
                    .into_iter()
                    .find(|candidate| &candidate.name == rack)
                    .ok_or_else(|| ReconcileError::InvalidDesiredState(format!("rack {} is not declared", rack)))?;
                tracing::info!(rack = %rack.name, "applying rack with current pod template");
                self.cluster.apply_rack(dc, &rack, view.replicas(&rack.name)).await?;
            }
            StepAction::ScaleRack { rack, replicas } => {
                tracing::info!(%rack, replicas, "scaling rack");
                self.cluster.scale_rack(dc, rack, *replicas).await?;
            }
            StepAction::Start { node, replace_ip } => {
                let addr = node_addr(view, node)?;
                tracing::info!(%node, replace_ip = ?replace_ip, "starting node");
                match self.mgmt.start(dc, &addr, replace_ip.as_deref()).await {
                    Ok(()) | Err(MgmtError::AlreadyRunning(_)) => (),
                    Err(err) => return Err(err.into()),
                }
                status.last_server_node_started = Some(Utc::now());
            }
            StepAction::Decommission { node } => {
                let addr = node_addr(view, node)?;
                tracing::info!(%node, "decommissioning node");
                match self.mgmt.decommission(dc, &addr).await {
                    Ok(()) | Err(MgmtError::AlreadyRunning(_)) => (),
                    Err(err) => return Err(err.into()),
                }
            }
            StepAction::Drain { node } => {
                let addr = node_addr(view, node)?;
                tracing::info!(%node, "draining node");
                match self.mgmt.drain(dc, &addr).await {
                    Ok(()) | Err(MgmtError::AlreadyRunning(_)) => (),
                    Err(err) => return Err(err.into()),
                }
            }
            StepAction::DeletePod { node } => {
                tracing::info!(%node, "deleting pod");
                self.cluster.delete_pod(dc, node).await?;
            }
            StepAction::Teardown { node } => {
                tracing::info!(%node, "tearing down node storage and pod");
                self.cluster.delete_volume(dc, node).await?;
                self.cluster.delete_pod(dc, node).await?;
            }
            StepAction::DeleteVolume { node } => {
                tracing::info!(%node, "deleting data volume");
                self.cluster.delete_volume(dc, node).await?;
            }
            StepAction::Wait { reason } => {
                tracing::debug!(%reason, "waiting");
                status.message = Some(reason.clone());
            }
            StepAction::Complete => (),
            StepAction::Abort { reason, .. } => status.message = Some(reason.clone()),
        }
        Ok(())
    }

    /// Acknowledge whatever the finished record was handling.
    fn complete_operation(&self, dc: &CassandraDatacenter, status: &mut CassandraDatacenterStatus) {
        let record = match status.operation.take() {
            Some(record) => record,
            None => return,
        };
        tracing::info!(kind = %record.kind, "operation complete");
        if let Some(token) = record.restart_token {
            status.rolling_restart_ack = status.rolling_restart_ack.max(token);
            status.last_rolling_restart = Some(Utc::now());
        }
        if record.kind == OperationKind::Replace {
            for item in record.items.iter() {
                status.node_replacements.retain(|node| node != &item.node);
                if dc.spec.replace_nodes.contains(&item.node) && !status.completed_replacements.contains(&item.node) {
                    status.completed_replacements.push(item.node.clone());
                }
            }
        }
        status.completed_replacements.retain(|node| dc.spec.replace_nodes.contains(node));
    }

    /// Create the superuser role through the first reachable node.
    async fn upsert_superuser(&self, dc: &CassandraDatacenter, slots: &[NodeSlot], status: &mut CassandraDatacenterStatus) -> ReconcileResult<()> {
        let creds = match self.cluster.superuser_credentials(dc).await? {
            Some(creds) => creds,
            None => return Ok(()),
        };
        let addr = slots
            .iter()
            .filter(|slot| slot.state == NodeState::Normal)
            .find_map(|slot| slot.pod.as_ref().and_then(|pod| pod.ip.clone()).map(|ip| NodeAddr { pod: slot.name.clone(), ip }));
        let addr = match addr {
            Some(addr) => addr,
            None => return Ok(()),
        };
        tracing::info!(node = %addr.pod, username = %creds.username, "upserting superuser");
        self.mgmt.upsert_superuser(dc, &addr, &creds).await?;
        status.super_user_upserted = Some(Utc::now());
        Ok(())
    }
}

/// The live pods which should carry the seed label.
///
/// A planned seed is only labeled once it is `Normal`, as a node listed among the seeds never
/// bootstraps. Once labeled, it stays labeled for as long as it is planned. A pod which is no
/// longer planned keeps its label until every planned seed is labeled. The first planned seed of a
/// datacenter with no seed and no `Normal` node is labeled right away, as it has nothing to
/// bootstrap from.
fn seed_pods(plan: &TopologyPlan, slots: &[NodeSlot]) -> BTreeSet<String> {
    let live: Vec<&NodeSlot> = slots
        .iter()
        .filter(|slot| slot.pod.as_ref().map(|pod| !pod.terminating).unwrap_or(false))
        .collect();
    let planned: Vec<&NodeSlot> = live.iter().copied().filter(|slot| plan.is_seed(&slot.rack, slot.ordinal)).collect();
    let mut seeds: BTreeSet<String> = planned
        .iter()
        .filter(|slot| slot.is_seed() || slot.state == NodeState::Normal)
        .map(|slot| slot.name.clone())
        .collect();

    let any_labeled = live.iter().any(|slot| slot.is_seed());
    let any_normal = live.iter().any(|slot| slot.state == NodeState::Normal);
    if !any_labeled && !any_normal {
        if let Some(first) = planned.first() {
            seeds.insert(first.name.clone());
        }
    }
    if seeds.len() < plan.seeds.len() {
        seeds.extend(live.iter().filter(|slot| slot.is_seed()).map(|slot| slot.name.clone()));
    }
    seeds
}

/// The `{namespace}/{name}` key of a datacenter.
pub fn dc_key(dc: &CassandraDatacenter) -> String {
    format!("{}/{}", dc.namespace(), dc.name())
}

/// Refuse to act while a rack which is no longer desired still holds nodes.
fn check_orphaned_racks(racks: &[Rack], observed: &Observed) -> ReconcileResult<()> {
    for (name, state) in observed.racks.iter() {
        if racks.iter().any(|rack| &rack.name == name) {
            continue;
        }
        let pods = observed.pods.iter().filter(|pod| &pod.rack == name).count();
        if state.replicas > 0 || pods > 0 {
            return Err(ReconcileError::InvalidDesiredState(format!(
                "rack {} was removed from spec.racks but still holds {} nodes, removing it would orphan their storage",
                name,
                (state.replicas as usize).max(pods)
            )));
        }
    }
    Ok(())
}

/// The nodes requested by the user or flagged by the operator for replacement.
fn replacement_requests(dc: &CassandraDatacenter, status: &CassandraDatacenterStatus) -> BTreeSet<String> {
    dc.spec
        .replace_nodes
        .iter()
        .filter(|node| !status.completed_replacements.contains(node))
        .chain(status.node_replacements.iter())
        .cloned()
        .collect()
}

/// Build the slots of every declared rack from the observations.
fn build_slots(
    dc: &CassandraDatacenter, racks: &[Rack], rack_states: &BTreeMap<String, RackState>, observed: &Observed, remotes: &BTreeMap<String, RemoteStatus>,
    replacements: &BTreeSet<String>, status: &CassandraDatacenterStatus,
) -> Vec<NodeSlot> {
    // Nodes already torn down for replacement are coming back as fresh instances.
    let torn_down: BTreeSet<&str> = status
        .operation
        .iter()
        .filter(|record| record.kind == OperationKind::Replace)
        .flat_map(|record| record.items.iter())
        .filter(|item| item.torn_down_uid.is_some())
        .map(|item| item.node.as_str())
        .collect();

    let mut slots = vec![];
    for rack in racks.iter() {
        let prefix = format!("{}-", dc.statefulset_name(&rack.name));
        let mut bound = rack_states.get(&rack.name).map(|state| state.replicas).unwrap_or(0);
        for pod in observed.pods.iter().filter(|pod| pod.rack == rack.name) {
            bound = bound.max(pod.ordinal + 1);
        }
        for volume in observed.volumes.iter() {
            if let Some(ordinal) = volume.strip_prefix(&prefix).and_then(|val| val.parse::<u32>().ok()) {
                bound = bound.max(ordinal + 1);
            }
        }
        for ordinal in 0..bound {
            let name = dc.pod_name(&rack.name, ordinal);
            let pod = observed.pods.iter().find(|pod| pod.name == name).cloned();
            let remote = remotes.get(&name).cloned();
            let volume = observed.volumes.contains(&name);
            let fresh = torn_down.contains(name.as_str());
            let lost_volume = pod.as_ref().map(|pod| !pod.terminating).unwrap_or(false) && !volume;
            let replace_requested = !fresh && (replacements.contains(&name) || lost_volume);
            let state = lifecycle::classify(pod.as_ref(), remote.as_ref(), replace_requested);
            let known_ip = status.node_statuses.get(&name).and_then(|node| node.node_ip.clone());
            slots.push(NodeSlot {
                name,
                rack: rack.name.clone(),
                ordinal,
                pod,
                remote,
                volume,
                known_ip,
                state,
            });
        }
    }
    slots
}

/// The management API address of a node.
fn node_addr(view: &ClusterView, node: &str) -> ReconcileResult<NodeAddr> {
    view.slot(node)
        .and_then(|slot| slot.pod.as_ref())
        .and_then(|pod| pod.ip.clone())
        .map(|ip| NodeAddr { pod: node.to_string(), ip })
        .ok_or_else(|| ReconcileError::UnsafeToProceed(format!("node {} has no pod IP", node)))
}
