pub mod orders;
pub mod session;
pub mod ui;
pub mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use axum::Router;
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(session::router())
        .merge(orders::router())
        .merge(ui::router())
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    logged_in: bool,
    online: bool,
    orders: usize,
    proximity_radius_km: f64,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let session = state.session_snapshot().await;
    Json(HealthResponse {
        status: "ok",
        logged_in: session.is_some(),
        online: session.is_some_and(|session| session.online),
        orders: state.orders().len(),
        proximity_radius_km: state.proximity.radius_km(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err).into_response(),
    }
}
