use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::models::order::OrderStatus;
use crate::store::StoreError;

/// Failures of the order lifecycle operations.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("order has no pickup code configured")]
    MissingPickupCode,

    #[error("pickup code mismatch")]
    CodeMismatch,

    #[error("driver already holds {limit} active orders")]
    AdmissionLimitReached { limit: usize },

    #[error("order was claimed by another driver")]
    AlreadyClaimed,

    #[error("order changed state concurrently")]
    StatusChanged,

    #[error("order {0} not found")]
    OrderNotFound(i64),

    #[error("order {0} is not assigned to this driver")]
    NotOwner(i64),

    #[error("no driver session")]
    NoSession,

    #[error("order sync failed: {0}")]
    SyncFailure(StoreError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl OrderError {
    /// Actionable message in the driver's language.
    pub fn user_message(&self) -> String {
        match self {
            OrderError::InvalidTransition { from, to } => {
                format!("Transición inválida: {from} → {to}")
            }
            OrderError::MissingPickupCode => {
                "Este pedido no tiene código de retiro configurado".to_string()
            }
            OrderError::CodeMismatch => {
                "Código incorrecto. Por favor verifica el código e intenta nuevamente.".to_string()
            }
            OrderError::AdmissionLimitReached { limit } => format!(
                "No puedes aceptar más pedidos. Tienes {limit} pedidos activos. Completa alguno antes de aceptar nuevos."
            ),
            OrderError::AlreadyClaimed => {
                "Otro repartidor ya aceptó este pedido".to_string()
            }
            OrderError::StatusChanged => {
                "El pedido cambió de estado. Revisa la lista actualizada.".to_string()
            }
            OrderError::OrderNotFound(_) => "Pedido no encontrado".to_string(),
            OrderError::NotOwner(_) => "Este pedido no está asignado a ti".to_string(),
            OrderError::NoSession => "Debes iniciar sesión".to_string(),
            OrderError::SyncFailure(_) => "Error al cargar los pedidos".to_string(),
            OrderError::Store(err) => format!("Error al actualizar el pedido: {err}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unprocessable: {0}")]
    Unprocessable(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<OrderError> for AppError {
    fn from(err: OrderError) -> Self {
        let message = err.user_message();
        match err {
            OrderError::InvalidTransition { .. }
            | OrderError::AdmissionLimitReached { .. }
            | OrderError::AlreadyClaimed
            | OrderError::StatusChanged => AppError::Conflict(message),
            OrderError::MissingPickupCode | OrderError::CodeMismatch => {
                AppError::Unprocessable(message)
            }
            OrderError::OrderNotFound(_) => AppError::NotFound(message),
            OrderError::NotOwner(_) => AppError::Forbidden(message),
            OrderError::NoSession => AppError::Unauthorized(message),
            OrderError::SyncFailure(_) | OrderError::Store(_) => AppError::Upstream(message),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            AppError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}
