//! The CassandraDatacenter operator.

mod app;
mod config;
#[cfg(test)]
mod config_test;
mod error;
#[cfg(test)]
mod fixtures;
mod k8s;
mod lifecycle;
mod mgmt;
mod reconciler;
#[cfg(test)]
mod reconciler_test;
mod sequencer;
mod server;
mod status;
mod topology;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;
use crate::k8s::Controller;
use crate::reconciler::Reconciler;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true).with_ansi(true))
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    let recorder = PrometheusBuilder::new()
        .add_global_label("namespace", cfg.namespace.clone())
        .add_global_label("pod", cfg.pod_name.clone())
        .build();
    let metrics_handle = recorder.handle();
    metrics::set_boxed_recorder(Box::new(recorder)).context("error setting prometheus metrics recorder")?;
    Reconciler::register_metrics();
    Controller::register_metrics();

    tracing::info!(
        http_port = %cfg.http_port,
        namespace = %cfg.namespace,
        "starting cass-operator",
    );
    if let Err(err) = App::new(cfg, metrics_handle).await?.spawn().await {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
