use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Json;
use axum::Router;
use serde::Deserialize;

use crate::models::event::UiEvent;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/ui/orders-panel", post(orders_panel))
}

#[derive(Deserialize)]
pub struct OrdersPanelRequest {
    pub show: bool,
}

/// Host-side toggle of the orders panel, relayed to every connected shell.
async fn orders_panel(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<OrdersPanelRequest>,
) -> StatusCode {
    state.publish(UiEvent::OrdersPanel { show: payload.show });
    StatusCode::ACCEPTED
}
