/**
 * API HEALTH - Endpoint de supervision du bridge
 *
 * RÔLE :
 * Expose l'état du bridge pour le monitoring (désactivé par défaut,
 * activé via http.listen ou HTTP_LISTEN).
 *
 * FONCTIONNEMENT :
 * - Serveur Axum, une seule route GET /health
 * - 200 quand le bridge est Running, 503 sinon
 * - Corps JSON : snapshot des compteurs (reçus, stockés, rejets par type)
 *
 * SÉCURITÉ :
 * - Lecture seule, ne touche jamais au pipeline des messages
 * - Écoute sur 127.0.0.1 dans la config d'exemple
 */

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::StartupError;
use crate::stats::{BridgeStats, LifecycleState, StatsSnapshot};

pub fn build_router(stats: BridgeStats) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .with_state(stats)
}

async fn get_health(State(stats): State<BridgeStats>) -> (StatusCode, Json<StatsSnapshot>) {
    let snapshot = stats.snapshot();
    let status = match snapshot.state {
        LifecycleState::Running => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(snapshot))
}

/// Binds `address` and serves `/health` in the background.
///
/// Binding happens before returning so a taken port fails startup.
pub async fn spawn_health_server(
    address: SocketAddr,
    stats: BridgeStats,
) -> Result<SocketAddr, StartupError> {
    let listener = TcpListener::bind(address)
        .await
        .map_err(|source| StartupError::HttpBind { address, source })?;
    let local = listener
        .local_addr()
        .map_err(|source| StartupError::HttpBind { address, source })?;

    let app = build_router(stats);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "health server stopped");
        }
    });
    info!(address = %local, "health endpoint listening on /health");
    Ok(local)
}
