//! Pass scheduling for datacenters.
//!
//! ## Overview
//! Every event touching a datacenter, be it the datacenter itself or one of its StatefulSets or
//! pods, asks for a pass of that datacenter. A pass always starts from a fresh read of the
//! datacenter, so coalescing many events into a single pass loses nothing.
//!
//! At most one pass of a datacenter is in flight at any time. Events arriving while a pass is in
//! flight mark the datacenter as dirty, and another pass follows as soon as the current one ends.
//! Once a pass ends without new events, the next pass is scheduled according to the requeue
//! decision of the pass. Only the latest requeue timer of a datacenter is honored.
//!
//! ## Status Updates
//! The status returned by a pass is written with the resource version read at the start of the
//! pass. A concurrent write to the datacenter makes the update fail with a conflict, after which
//! a new pass recomputes the status from fresh state.
//!
//! The step of a pass runs before the status recording it is written. If that write fails, the
//! next pass starts from the previous status and derives the same work again from what it
//! observes, so every step must be safe to repeat. A repeated teardown deletes the fresh pod and
//! volume of the node once more. The IP of the node being replaced survives in `nodeStatuses`,
//! so the node is still started as a replacement.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::client::Client;
use kube::Resource;
use serde_json::json;
use tokio::time::timeout;

use crate::config::Config;
use crate::k8s::{Controller, PassState};
use crate::reconciler::{Reconciler, Requeue};
use cass_core::crd::CassandraDatacenter;
use cass_core::LABEL_OPERATOR_PROGRESS;

/// A scheduling task to be performed.
#[derive(Debug)]
pub enum SchedulerTask {
    /// Something changed about the datacenter, calling for a pass.
    DatacenterUpdated(Arc<String>),
    /// The datacenter is gone.
    DatacenterDeleted(Arc<String>),
    /// A pass of the datacenter ended with the given requeue decision.
    PassFinished(Arc<String>, Requeue),
    /// A requeue timer fired for the given requeue generation.
    Requeue(Arc<String>, u64),
}

impl Controller {
    /// Handle a scheduler task.
    #[tracing::instrument(level = "debug", skip(self, task))]
    pub(super) async fn handle_scheduler_task(&mut self, task: SchedulerTask) {
        tracing::debug!(?task, "handling scheduler task");
        match task {
            SchedulerTask::DatacenterUpdated(name) => self.scheduler_datacenter_updated(name),
            SchedulerTask::DatacenterDeleted(name) => self.scheduler_datacenter_deleted(name),
            SchedulerTask::PassFinished(name, requeue) => self.scheduler_pass_finished(name, requeue),
            SchedulerTask::Requeue(name, generation) => self.scheduler_requeue(name, generation),
        }
    }

    fn scheduler_datacenter_updated(&mut self, name: Arc<String>) {
        if !self.datacenters.contains_key(&name) {
            return;
        }
        let backoff_max = Duration::from_secs(self.config.backoff_max_seconds);
        let state = self.passes.entry(name.clone()).or_insert_with(|| PassState::new(backoff_max));
        if state.running {
            state.dirty = true;
            return;
        }
        self.start_pass(name);
    }

    fn scheduler_datacenter_deleted(&mut self, name: Arc<String>) {
        tracing::info!(dc = %name, "datacenter deleted, its resources are garbage collected by K8s");
        // An in flight pass finds the datacenter gone and requeues nothing.
        self.passes.remove(&name);
    }

    fn scheduler_pass_finished(&mut self, name: Arc<String>, requeue: Requeue) {
        let (requeue_delay, resync_delay) = (self.config.requeue_delay(), self.config.resync_delay());
        let state = match self.passes.get_mut(&name) {
            Some(state) => state,
            None => return,
        };
        state.running = false;
        if requeue == Requeue::Backoff {
            // The backoff never gives up, as max elapsed time is unset.
            let delay = state.backoff.next_backoff().unwrap_or(state.backoff.max_interval);
            self.schedule_requeue(name, delay);
            return;
        }
        state.backoff.reset();
        if state.dirty {
            state.dirty = false;
            self.start_pass(name);
            return;
        }
        match requeue {
            Requeue::Soon => self.schedule_requeue(name, requeue_delay),
            Requeue::Idle => self.schedule_requeue(name, resync_delay),
            Requeue::Never | Requeue::Backoff => (),
        }
    }

    fn scheduler_requeue(&mut self, name: Arc<String>, generation: u64) {
        let current = self
            .passes
            .get(&name)
            .map(|state| state.requeue_generation == generation && !state.running)
            .unwrap_or(false);
        if current {
            self.start_pass(name);
        }
    }

    /// Arm a requeue timer for the given datacenter, superseding any armed timer.
    fn schedule_requeue(&mut self, name: Arc<String>, delay: Duration) {
        let state = match self.passes.get_mut(&name) {
            Some(state) => state,
            None => return,
        };
        state.requeue_generation += 1;
        let generation = state.requeue_generation;
        tracing::debug!(dc = %name, ?delay, "requeueing datacenter");
        self.spawn_scheduler_task(SchedulerTask::Requeue(name, generation), Some(delay));
    }

    /// Spawn a pass of the given datacenter.
    fn start_pass(&mut self, name: Arc<String>) {
        let state = match self.passes.get_mut(&name) {
            Some(state) => state,
            None => return,
        };
        state.running = true;
        state.dirty = false;
        // Any armed timer is stale once a pass starts.
        state.requeue_generation += 1;

        let (client, config, reconciler, tx) = (
            self.client.clone(),
            self.config.clone(),
            self.reconciler.clone(),
            self.scheduler_tasks_tx.clone(),
        );
        tokio::spawn(async move {
            let requeue = match run_pass(client, config, reconciler, name.as_str()).await {
                Ok(requeue) => requeue,
                Err(err) => {
                    tracing::error!(error = ?err, dc = %name, "error persisting reconciliation pass");
                    Requeue::Backoff
                }
            };
            let _res = tx.send(SchedulerTask::PassFinished(name, requeue)).await;
        });
    }
}

impl PassState {
    fn new(backoff_max: Duration) -> Self {
        Self {
            running: false,
            dirty: false,
            backoff: ExponentialBackoff {
                max_interval: backoff_max,
                max_elapsed_time: None,
                ..Default::default()
            },
            requeue_generation: 0,
        }
    }
}

/// Run a single pass of the named datacenter and persist its outcome.
#[tracing::instrument(level = "debug", skip(client, config, reconciler))]
async fn run_pass(client: Client, config: Arc<Config>, reconciler: Arc<Reconciler>, name: &str) -> Result<Requeue> {
    let api: Api<CassandraDatacenter> = Api::namespaced(client, &config.namespace);
    let res = timeout(config.api_timeout(), api.get(name))
        .await
        .context("timeout while fetching datacenter")?;
    let mut dc = match res {
        Ok(dc) => dc,
        Err(kube::Error::Api(api_err)) if api_err.code == 404 => return Ok(Requeue::Never),
        Err(err) => return Err(err).context("error fetching datacenter"),
    };
    // Owned resources are garbage collected once the datacenter is gone.
    if dc.meta().deletion_timestamp.is_some() {
        return Ok(Requeue::Never);
    }

    let outcome = reconciler.pass(&dc).await;

    if dc.status.as_ref() != Some(&outcome.status) {
        dc.status = Some(outcome.status.clone());
        let data = serde_json::to_vec(&dc).context("error serializing datacenter status")?;
        let res = timeout(config.api_timeout(), api.replace_status(name, &PostParams::default(), data))
            .await
            .context("timeout while updating datacenter status")?;
        match res {
            Ok(_) => (),
            Err(kube::Error::Api(api_err)) if api_err.code == 409 => {
                tracing::debug!(dc = name, "datacenter changed during the pass, recomputing");
                return Ok(Requeue::Soon);
            }
            Err(err) => return Err(err).context("error updating datacenter status"),
        }
    }

    // Mirror the progress onto a label, so that datacenters may be selected by it.
    let progress = outcome.status.cassandra_operator_progress.as_ref().map(ToString::to_string);
    let labeled = dc.meta().labels.as_ref().and_then(|labels| labels.get(LABEL_OPERATOR_PROGRESS)).cloned();
    if progress.is_some() && progress != labeled {
        let patch = json!({"metadata": {"labels": {LABEL_OPERATOR_PROGRESS: progress}}});
        timeout(config.api_timeout(), api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)))
            .await
            .context("timeout while labeling datacenter")?
            .context("error labeling datacenter")?;
    }

    Ok(outcome.requeue)
}
