//! Kubernetes controller.
//!
//! This controller observes CassandraDatacenter objects along with the StatefulSets and pods
//! created for them, and schedules reconciliation passes in response. Passes of the same
//! datacenter never overlap; passes of different datacenters run concurrently.

mod cluster;
mod data;
mod manifests;
mod scheduler;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use backoff::ExponentialBackoff;
use futures::prelude::*;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::watcher::{watcher, Error as WatcherError, Event};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::config::Config;
use crate::k8s::scheduler::SchedulerTask;
use crate::reconciler::Reconciler;
use cass_core::crd::CassandraDatacenter;
use cass_core::OPERATOR_LABEL_SELECTORS;

pub use cluster::KubeClusterOps;

type EventResult<T> = std::result::Result<Event<T>, WatcherError>;

pub const METRIC_DATACENTERS: &str = "cass_operator_datacenters";

/// The delay applied after a watcher error before polling it again.
const WATCHER_ERROR_DELAY: Duration = Duration::from_secs(10);

/// Kubernetes controller for watching CassandraDatacenter CRs.
pub struct Controller {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// A channel of scheduler tasks.
    scheduler_tasks_tx: mpsc::Sender<SchedulerTask>,
    /// A channel of scheduler tasks.
    scheduler_tasks_rx: ReceiverStream<SchedulerTask>,

    /// The control loop driving each pass.
    reconciler: Arc<Reconciler>,
    /// All known datacenters, keyed by name.
    datacenters: HashMap<Arc<String>, CassandraDatacenter>,
    /// The pass bookkeeping of each known datacenter.
    passes: HashMap<Arc<String>, PassState>,
}

/// Pass bookkeeping of a single datacenter.
struct PassState {
    /// True while a pass of this datacenter is in flight.
    running: bool,
    /// True if something changed while a pass was in flight, calling for another pass.
    dirty: bool,
    /// The backoff applied to consecutive failed passes.
    backoff: ExponentialBackoff,
    /// Only the requeue timer carrying the latest generation triggers a pass.
    requeue_generation: u64,
}

impl Controller {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, reconciler: Arc<Reconciler>, shutdown_tx: broadcast::Sender<()>) -> Self {
        let (scheduler_tasks_tx, scheduler_tasks_rx) = mpsc::channel(1000);
        Self {
            client,
            config,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            scheduler_tasks_tx,
            scheduler_tasks_rx: ReceiverStream::new(scheduler_tasks_rx),
            reconciler,
            datacenters: Default::default(),
            passes: Default::default(),
        }
    }

    /// Describe every metric emitted by the controller.
    pub fn register_metrics() {
        metrics::register_gauge!(METRIC_DATACENTERS, metrics::Unit::Count, "datacenters watched by this operator");
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        // Build watcher streams.
        let params_labels = self.list_params_operator_selector_labels();
        let params_spec = ListParams::default();
        let datacenters: Api<CassandraDatacenter> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let datacenters_watcher = watcher(datacenters, params_spec);
        let statefulsets: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let statefulsets_watcher = watcher(statefulsets, params_labels.clone());
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let pods_watcher = watcher(pods, params_labels);
        tokio::pin!(datacenters_watcher, statefulsets_watcher, pods_watcher);

        tracing::info!(namespace = %self.config.namespace, "k8s controller initialized");
        loop {
            tokio::select! {
                Some(k8s_event_res) = datacenters_watcher.next() => self.handle_datacenter_event(k8s_event_res).await,
                Some(k8s_event_res) = statefulsets_watcher.next() => self.handle_sts_event(k8s_event_res).await,
                Some(k8s_event_res) = pods_watcher.next() => self.handle_pod_event(k8s_event_res).await,
                Some(scheduler_task) = self.scheduler_tasks_rx.next() => self.handle_scheduler_task(scheduler_task).await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("k8s controller shutdown");
        Ok(())
    }

    /// Spawn a task which emits a new scheduler task, optionally after a delay.
    ///
    /// This indirection is used to ensure that we do not block the controller from making
    /// progress and dead-locking when we hit the scheduler task queue cap.
    fn spawn_scheduler_task(&self, task: SchedulerTask, delay: Option<Duration>) {
        let tx = self.scheduler_tasks_tx.clone();
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let _res = tx.send(task).await;
        });
    }

    /// Create a list params object which selects only objects managed by this operator.
    fn list_params_operator_selector_labels(&self) -> ListParams {
        ListParams {
            label_selector: Some(OPERATOR_LABEL_SELECTORS.into()),
            ..Default::default()
        }
    }
}
