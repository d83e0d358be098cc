use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::engine::session::{self, SessionError};
use crate::error::AppError;
use crate::geo::GeoPoint;
use crate::models::driver::{DriverProfile, DriverSession};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/session", get(get_session))
        .route("/session/login", post(login))
        .route("/session/logout", post(logout))
        .route("/session/online", post(set_online))
        .route("/session/location", patch(update_location))
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct OnlineRequest {
    pub online: bool,
}

#[derive(Deserialize)]
pub struct LocationRequest {
    pub location: GeoPoint,
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub driver: DriverProfile,
    pub online: bool,
    pub location: Option<GeoPoint>,
}

impl From<DriverSession> for SessionResponse {
    fn from(session: DriverSession) -> Self {
        Self {
            driver: session.profile,
            online: session.online,
            location: session.location,
        }
    }
}

#[derive(Serialize)]
pub struct LocationResponse {
    pub refilter_scheduled: bool,
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<SessionResponse>, AppError> {
    let session = session::login(&state, &payload.username, &payload.password).await?;
    Ok(Json(session.into()))
}

async fn logout(State(state): State<Arc<AppState>>) -> StatusCode {
    session::logout(&state).await;
    StatusCode::NO_CONTENT
}

async fn get_session(State(state): State<Arc<AppState>>) -> Result<Json<SessionResponse>, AppError> {
    let session = state
        .session_snapshot()
        .await
        .ok_or(SessionError::NoSession)?;
    Ok(Json(session.into()))
}

async fn set_online(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<OnlineRequest>,
) -> Result<Json<SessionResponse>, AppError> {
    let session = session::set_online(&state, payload.online).await?;
    Ok(Json(session.into()))
}

async fn update_location(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LocationRequest>,
) -> Result<Json<LocationResponse>, AppError> {
    let refilter_scheduled = session::update_location(&state, payload.location).await?;
    Ok(Json(LocationResponse { refilter_scheduled }))
}
