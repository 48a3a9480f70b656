use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::k8s::{Controller, KubeClusterOps};
use crate::mgmt::HttpManagementClient;
use crate::reconciler::{Reconciler, Settings};
use crate::server::spawn_http_server;

/// The application object of the operator.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the HTTP server.
    server: JoinHandle<Result<()>>,
    /// The join handle of the K8s controller.
    controller: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>, metrics: PrometheusHandle) -> Result<Self> {
        // App shutdown channel.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);

        // Initialize K8s client.
        let client = kube::Client::try_default().await.context("error initializing K8s client")?;

        // Build the control loop.
        let cluster = Arc::new(KubeClusterOps::new(client.clone(), config.api_timeout()));
        let mgmt = Arc::new(HttpManagementClient::new(client.clone(), config.mgmt_api_port, config.mgmt_timeout()));
        let settings = Settings {
            start_retry_budget: config.start_retry_budget,
        };
        let reconciler = Arc::new(Reconciler::new(cluster, mgmt, settings));

        // Spawn various core tasks.
        let server = spawn_http_server(&config, metrics, shutdown_tx.clone());
        let controller = Controller::new(client, config.clone(), reconciler, shutdown_tx.clone()).spawn();

        Ok(Self {
            _config: config,
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            server,
            controller,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine. In flight passes are abandoned, and resume from the persisted
        // status on the next start.
        tracing::debug!("cass-operator is shutting down");
        if let Err(err) = self.server.await.context("error joining http server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down http server");
        }
        if let Err(err) = self.controller.await.context("error joining k8s controller handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down k8s controller");
        }

        tracing::debug!("cass-operator shutdown complete");
        Ok(())
    }
}
