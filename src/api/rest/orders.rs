use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::engine::acceptance::accept_order;
use crate::engine::progression::{advance, confirm_pickup};
use crate::engine::sync::resync;
use crate::engine::transitions::requires_pickup_code;
use crate::engine::views::{
    available_orders, completed_orders, earnings_summary, my_active_orders, EarningsSummary,
    OrderCard,
};
use crate::error::{AppError, OrderError};
use crate::models::driver::DriverProfile;
use crate::models::order::{parse_order_ref, Order, OrderStatus};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", get(list_orders))
        .route("/orders/available", get(list_available))
        .route("/orders/mine", get(list_mine))
        .route("/orders/completed", get(list_completed))
        .route("/orders/earnings", get(earnings))
        .route("/orders/sync", post(sync_orders))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/accept", post(accept))
        .route("/orders/:id/advance", post(advance_order))
        .route("/orders/:id/pickup", post(pickup))
}

#[derive(Deserialize)]
pub struct AdvanceRequest {
    pub to: OrderStatus,
}

#[derive(Deserialize)]
pub struct PickupRequest {
    pub code: String,
}

#[derive(Serialize)]
pub struct SyncResponse {
    pub orders: usize,
}

async fn driver(state: &AppState) -> Result<DriverProfile, AppError> {
    Ok(state.current_driver().await.ok_or(OrderError::NoSession)?)
}

fn order_id(raw: &str) -> Result<i64, AppError> {
    parse_order_ref(raw).ok_or_else(|| AppError::BadRequest(format!("invalid order id: {raw}")))
}

fn cards(orders: Vec<Order>) -> Json<Vec<OrderCard>> {
    Json(orders.into_iter().map(OrderCard::from).collect())
}

async fn list_orders(State(state): State<Arc<AppState>>) -> Result<Json<Vec<OrderCard>>, AppError> {
    driver(&state).await?;
    Ok(cards(state.orders().as_ref().clone()))
}

async fn list_available(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<OrderCard>>, AppError> {
    let driver = driver(&state).await?;
    let orders = state.orders();
    Ok(cards(available_orders(
        &orders,
        driver.id,
        state.config.max_active_orders,
    )))
}

async fn list_mine(State(state): State<Arc<AppState>>) -> Result<Json<Vec<OrderCard>>, AppError> {
    let driver = driver(&state).await?;
    Ok(cards(my_active_orders(&state.orders(), driver.id)))
}

async fn list_completed(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<OrderCard>>, AppError> {
    let driver = driver(&state).await?;
    Ok(cards(completed_orders(&state.orders(), driver.id)))
}

async fn earnings(
    State(state): State<Arc<AppState>>,
) -> Result<Json<EarningsSummary>, AppError> {
    let driver = driver(&state).await?;
    Ok(Json(earnings_summary(&state.orders(), driver.id)))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<OrderCard>, AppError> {
    driver(&state).await?;
    let order_id = order_id(&id)?;
    let order = state
        .find_order(order_id)
        .ok_or(OrderError::OrderNotFound(order_id))?;

    Ok(Json(order.into()))
}

async fn accept(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<OrderCard>, AppError> {
    let order = accept_order(&state, order_id(&id)?).await?;
    Ok(Json(order.into()))
}

async fn advance_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<AdvanceRequest>,
) -> Result<Json<OrderCard>, AppError> {
    let order_id = order_id(&id)?;

    if let Some(current) = state.find_order(order_id) {
        if requires_pickup_code(current.status, payload.to) {
            return Err(AppError::Unprocessable(
                "Este paso requiere el código de retiro; usa /pickup".to_string(),
            ));
        }
    }

    let order = advance(&state, order_id, payload.to).await?;
    Ok(Json(order.into()))
}

async fn pickup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<PickupRequest>,
) -> Result<Json<OrderCard>, AppError> {
    let order = confirm_pickup(&state, order_id(&id)?, &payload.code).await?;
    Ok(Json(order.into()))
}

async fn sync_orders(State(state): State<Arc<AppState>>) -> Result<Json<SyncResponse>, AppError> {
    let orders = resync(&state).await?;
    Ok(Json(SyncResponse { orders }))
}
