//! HTTP surfaces: the per-producer status RPC & the node admin endpoints.
//!
//! Each producer gets its own status server on an ephemeral local port,
//! discoverable through the metadata store's hostport registrations. The admin
//! surface runs once per node on the fixed admin port and is what peer nodes
//! query during rebalance admission checks and progress polling.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::Extension;
use axum::routing::{get, post};
use axum::{AddExtensionLayer, Json, Router};
use http::StatusCode;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::cluster::{PeerClient, RebalanceProgress};
use crate::config::Config;
use crate::metakv::MetadataStore;
use crate::producer::{AppSettings, Producer, VbStat};
use crate::service::status::{ErrorPayload, RuntimeInfo, StatusBase, CATALOG};
use crate::supersup::SuperSupervisor;

/// Shared state of one producer's status RPC handlers.
#[derive(Clone)]
pub struct StatusState {
    pub producer: Arc<Producer>,
    pub metakv: Arc<dyn MetadataStore>,
    pub peers: Arc<dyn PeerClient>,
    /// The metadata prefix under which this app's producers register their listeners.
    pub hostports_path: String,
    /// This producer's own listener address, skipped during aggregation.
    pub local_addr: String,
}

/// Spawn the status RPC server for one producer on the given listener.
pub fn spawn_status_server(listener: std::net::TcpListener, state: StatusState, mut stop_rx: watch::Receiver<bool>) -> Result<JoinHandle<Result<()>>> {
    let app = Router::new()
        .route("/getAggRebalanceStatus", get(get_agg_rebalance_status))
        .route("/getNodeMap", get(get_node_map))
        .route("/getRebalanceStatus", get(get_rebalance_status))
        .route("/getRemainingEvents", get(get_remaining_events))
        .route("/getSettings", get(get_settings))
        .route("/getVbStats", get(get_vb_stats))
        .route("/getWorkerMap", get(get_worker_map))
        .route("/updateSettings", post(update_settings))
        .layer(AddExtensionLayer::new(state));
    let server = axum::Server::from_tcp(listener)
        .context("error building producer status server from listener")?
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                if stop_rx.changed().await.is_err() {
                    break;
                }
            }
        });
    Ok(tokio::spawn(async move { server.await.context("error from producer status server") }))
}

/// Spawn the node admin server on the configured admin port.
pub fn spawn_admin_server(config: &Config, super_sup: SuperSupervisor, shutdown_tx: broadcast::Sender<()>) -> Result<JoinHandle<Result<()>>> {
    let listener = std::net::TcpListener::bind(("0.0.0.0", config.admin_port)).context("error binding socket address for admin server")?;
    listener.set_nonblocking(true).context("error preparing admin listener")?;
    let app = Router::new()
        .route("/getBootstrappingApps", get(get_bootstrapping_apps))
        .route("/getRebalanceProgress", get(get_rebalance_progress))
        .layer(AddExtensionLayer::new(super_sup));
    let mut shutdown_rx = shutdown_tx.subscribe();
    let server = axum::Server::from_tcp(listener)
        .context("error building admin server from listener")?
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _res = shutdown_rx.recv().await;
        });
    Ok(tokio::spawn(async move { server.await.context("error from admin server") }))
}

/// Build the error response for the given cataloged status.
fn error_response(base: &StatusBase, err: anyhow::Error) -> (StatusCode, Json<ErrorPayload>) {
    let mut payload = CATALOG.error_payload(base.code).cloned().unwrap_or_else(|| ErrorPayload {
        name: base.name.into(),
        code: base.code,
        description: String::new(),
        attributes: Vec::new(),
        runtime_info: String::new(),
    });
    payload.runtime_info = format!("{:#}", err);
    (CATALOG.disposition(base.code), Json(payload))
}

async fn get_node_map(Extension(state): Extension<StatusState>) -> Json<HashMap<u16, String>> {
    Json(state.producer.assignment_map())
}

async fn get_rebalance_status(Extension(state): Extension<StatusState>) -> Json<bool> {
    Json(state.producer.rebalance_status())
}

async fn get_remaining_events(Extension(state): Extension<StatusState>) -> Json<u64> {
    Json(state.producer.remaining_events())
}

async fn get_settings(Extension(state): Extension<StatusState>) -> Json<AppSettings> {
    Json(state.producer.settings())
}

async fn get_vb_stats(Extension(state): Extension<StatusState>) -> Json<HashMap<u16, VbStat>> {
    Json(state.producer.vb_stats())
}

async fn get_worker_map(Extension(state): Extension<StatusState>) -> Json<HashMap<String, Vec<u16>>> {
    Json(state.producer.worker_map())
}

/// Aggregate rebalance status across every registered producer of this app.
async fn get_agg_rebalance_status(Extension(state): Extension<StatusState>) -> Result<Json<bool>, (StatusCode, Json<ErrorPayload>)> {
    let registrations = state
        .metakv
        .list_prefix(state.hostports_path.clone())
        .await
        .map_err(|err| error_response(&CATALOG.codes.err_get_reb_status, err))?;
    let mut ongoing = state.producer.rebalance_status();
    for (_, value) in registrations {
        let addr = String::from_utf8_lossy(&value).to_string();
        if addr == state.local_addr {
            continue;
        }
        let status = state
            .peers
            .get_rebalance_status(addr)
            .await
            .map_err(|err| error_response(&CATALOG.codes.err_get_reb_status, err))?;
        ongoing = ongoing || status;
    }
    Ok(Json(ongoing))
}

async fn update_settings(
    Extension(state): Extension<StatusState>, Json(payload): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<RuntimeInfo>), (StatusCode, Json<ErrorPayload>)> {
    match state.producer.update_settings(payload).await {
        Ok(()) => Ok((
            StatusCode::OK,
            Json(RuntimeInfo {
                code: CATALOG.codes.ok.code,
                info: format!("settings applied for app {}", state.producer.app_name()),
            }),
        )),
        Err(err) => Err(error_response(&CATALOG.codes.err_invalid_config, err)),
    }
}

async fn get_bootstrapping_apps(Extension(super_sup): Extension<SuperSupervisor>) -> Json<Vec<String>> {
    Json(super_sup.bootstrapping_apps())
}

async fn get_rebalance_progress(Extension(super_sup): Extension<SuperSupervisor>) -> Json<RebalanceProgress> {
    Json(super_sup.rebalance_progress())
}
