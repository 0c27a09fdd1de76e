//! HTTP cluster view
//!
//! `GET /clusterview` renders a fresh aggregation as plain text. Its
//! `bindDomain=<name>` parameter binds `<name>` in the registry and
//! `domainTest=<name>` looks it up; either prints `Bound:<name>` when the
//! name was already present. `GET /clusterview.json` returns the report as JSON,
//! `GET /connections` runs a connectivity test and `GET /health` answers "OK".

use std::fmt::Write;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use clusterview_cluster::discovery::{ensure_bound, BindOutcome, Marker, PeerRegistry};
use clusterview_cluster::HealthAggregator;
use clusterview_core::Endpoint;

#[derive(Clone)]
pub struct AppState {
    pub aggregator: HealthAggregator,
    pub peers: Arc<Vec<Endpoint>>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/clusterview", get(cluster_view_text))
        .route("/clusterview.json", get(cluster_view_json))
        .route("/connections", get(connections))
        .route("/health", get(health_check))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterViewQuery {
    pub bind_domain: Option<String>,
    pub domain_test: Option<String>,
}

async fn cluster_view_text(
    State(state): State<AppState>,
    Query(query): Query<ClusterViewQuery>,
) -> Response {
    let view = async {
        let mut body = state.aggregator.aggregate(&state.peers).await?.render_text();
        let registry = state.aggregator.registry();
        body.push_str(&domain_lines(registry.as_ref(), &query).await?);
        Ok::<_, clusterview_cluster::Error>(body)
    };

    match view.await {
        Ok(body) => body.into_response(),
        Err(e) => {
            warn!(error = %e, "Cluster view aggregation failed");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

/// `Bound:<name>` lines for the domain names named in `query`
async fn domain_lines(
    registry: &dyn PeerRegistry,
    query: &ClusterViewQuery,
) -> clusterview_cluster::Result<String> {
    let mut out = String::new();

    if let Some(name) = &query.bind_domain {
        match ensure_bound(registry, name, Marker::new(name.as_str())).await? {
            BindOutcome::AlreadyPresent => {
                let _ = writeln!(out, "Bound:{name}");
            }
            BindOutcome::FreshlyBound => info!(name = %name, "Domain name bound in registry"),
        }
    }
    if let Some(name) = &query.domain_test {
        if registry.lookup(name).await?.is_some() {
            let _ = writeln!(out, "Bound:{name}");
        } else {
            info!(name = %name, "Domain name not bound in registry");
        }
    }

    Ok(out)
}

async fn cluster_view_json(State(state): State<AppState>) -> Response {
    match state.aggregator.aggregate(&state.peers).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            warn!(error = %e, "Cluster view aggregation failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn connections(State(state): State<AppState>) -> impl IntoResponse {
    state.aggregator.test_connections(&state.peers).await.render_text()
}

async fn health_check() -> impl IntoResponse {
    "OK"
}

/// Serve the cluster view until `shutdown` is cancelled
pub async fn serve(address: &str, state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {address}: {e}"))?;
    info!("Cluster view listening on {}", listener.local_addr()?);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| anyhow::anyhow!("HTTP server error: {e}"))?;

    info!("Cluster view server stopped");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
