use anyhow::Result;
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::{extract::Extension, routing::get, AddExtensionLayer, Router};
use futures::prelude::*;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;

/// Spawn the HTTP server for healthchecks and Prometheus scraping.
pub fn spawn_http_server(config: &Config, handle: PrometheusHandle, shutdown: broadcast::Sender<()>) -> JoinHandle<Result<()>> {
    let mut shutdown_rx = shutdown.subscribe();
    let app = Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/metrics", get(prometheus_scrape))
        .layer(AddExtensionLayer::new(handle));
    let server = axum::Server::bind(&([0, 0, 0, 0], config.http_port).into())
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _res = shutdown_rx.recv().await;
        });
    tracing::info!("http server is listening at 0.0.0.0:{}", config.http_port);
    tokio::spawn(server.map_err(move |err| {
        tracing::error!(error = ?err, "error from http server, shutting down");
        let _res = shutdown.send(());
        anyhow::Error::from(err)
    }))
}

/// Handle Prometheus metrics scraping.
async fn prometheus_scrape(Extension(handle): Extension<PrometheusHandle>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, handle.render())
}
