use chrono::Utc;
use tracing::{error, info, warn};

use crate::engine::pickup_code::verify_pickup_code;
use crate::engine::record_history;
use crate::engine::sync::resync;
use crate::engine::transitions::validate_transition;
use crate::error::OrderError;
use crate::models::history::StatusHistoryEntry;
use crate::models::order::{Order, OrderStatus};
use crate::state::AppState;

fn count(state: &AppState, to: OrderStatus, outcome: &str) {
    state
        .metrics
        .order_transitions_total
        .with_label_values(&[to.as_str(), outcome])
        .inc();
}

/// Moves one of the driver's orders to `to`. The transition is validated
/// against the last synced status before anything is written, and the write
/// itself only lands if the stored status still matches.
pub async fn advance(state: &AppState, order_id: i64, to: OrderStatus) -> Result<Order, OrderError> {
    let driver = state.current_driver().await.ok_or(OrderError::NoSession)?;
    let order = state
        .find_order(order_id)
        .ok_or(OrderError::OrderNotFound(order_id))?;

    if let Err(err) = validate_transition(&order, to) {
        warn!(order_id, from = %order.status, to = %to, error = %err, "transition rejected");
        count(state, to, "invalid");
        return Err(err);
    }

    if !order.is_owned_by(driver.id) {
        count(state, to, "invalid");
        return Err(OrderError::NotOwner(order_id));
    }

    let now = Utc::now();
    match state
        .store
        .update_order_status(order_id, order.status, to, now)
        .await
    {
        Ok(Some(updated)) => {
            info!(order_id, from = %order.status, to = %to, "order status updated");
            count(state, to, "success");
            record_history(state, StatusHistoryEntry::transition(order_id, to, driver.id)).await;
            let _ = resync(state).await;
            Ok(updated)
        }
        Ok(None) => {
            warn!(order_id, expected = %order.status, "order changed before status write");
            count(state, to, "conflict");
            let _ = resync(state).await;
            Err(OrderError::StatusChanged)
        }
        Err(err) => {
            error!(order_id, to = %to, error = %err, "status write failed");
            count(state, to, "error");
            Err(OrderError::Store(err))
        }
    }
}

/// Pickup challenge: checks the code the driver typed against the order and
/// only then advances it to picked up. A mismatch writes nothing.
pub async fn confirm_pickup(state: &AppState, order_id: i64, code: &str) -> Result<Order, OrderError> {
    let order = state
        .find_order(order_id)
        .ok_or(OrderError::OrderNotFound(order_id))?;

    validate_transition(&order, OrderStatus::PickedUp)?;

    if let Err(err) = verify_pickup_code(order.pickup_code.as_deref(), code) {
        warn!(order_id, "pickup code rejected");
        count(state, OrderStatus::PickedUp, "code_mismatch");
        return Err(err);
    }

    advance(state, order_id, OrderStatus::PickedUp).await
}
