use chrono::Utc;
use tracing::{info, warn};

use crate::engine::record_history;
use crate::engine::sync::resync;
use crate::engine::transitions::validate_transition;
use crate::error::OrderError;
use crate::models::driver::DriverProfile;
use crate::models::event::UiEvent;
use crate::models::history::StatusHistoryEntry;
use crate::models::order::{Order, OrderStatus};
use crate::state::AppState;
use crate::store::ClaimOutcome;

/// Orders the driver holds in assigned, en route or picked-up state.
pub fn active_order_count(orders: &[Order], driver_id: i64) -> usize {
    orders
        .iter()
        .filter(|order| order.is_owned_by(driver_id) && order.status.is_active())
        .count()
}

pub fn check_admission(orders: &[Order], driver_id: i64, limit: usize) -> Result<(), OrderError> {
    if active_order_count(orders, driver_id) >= limit {
        Err(OrderError::AdmissionLimitReached { limit })
    } else {
        Ok(())
    }
}

/// Claims a pending order for the session's driver. Whatever the outcome, the
/// order list is refetched afterwards so the shell shows the real winner.
pub async fn accept_order(state: &AppState, order_id: i64) -> Result<Order, OrderError> {
    let driver = state.current_driver().await.ok_or(OrderError::NoSession)?;

    let result = claim(state, &driver, order_id).await;

    let outcome = match &result {
        Ok(_) => "success",
        Err(OrderError::AdmissionLimitReached { .. }) => "admission_limit",
        Err(OrderError::AlreadyClaimed) => "already_claimed",
        Err(OrderError::InvalidTransition { .. }) | Err(OrderError::OrderNotFound(_)) => "invalid",
        Err(_) => "error",
    };
    state
        .metrics
        .order_accepts_total
        .with_label_values(&[outcome])
        .inc();

    // Failures are already logged and surfaced by the sync engine.
    let _ = resync(state).await;

    if let Ok(order) = &result {
        state.publish(UiEvent::ShowMyOrders {
            order_id: order.db_id,
        });
    }

    result
}

async fn claim(state: &AppState, driver: &DriverProfile, order_id: i64) -> Result<Order, OrderError> {
    let orders = state.orders();
    check_admission(&orders, driver.id, state.config.max_active_orders)?;

    let order = orders
        .iter()
        .find(|order| order.db_id == order_id)
        .ok_or(OrderError::OrderNotFound(order_id))?;
    validate_transition(order, OrderStatus::Assigned)?;

    let now = Utc::now();
    let claimed = match state.store.claim_order(order_id, driver.id, now).await? {
        ClaimOutcome::Claimed(claimed) => claimed,
        ClaimOutcome::NotPending => {
            warn!(order_id, driver_id = driver.id, "order already claimed by another driver");
            return Err(OrderError::AlreadyClaimed);
        }
    };

    info!(order_id, driver_id = driver.id, "order accepted");

    record_history(
        state,
        StatusHistoryEntry::transition(order_id, OrderStatus::Assigned, driver.id),
    )
    .await;

    if let Some(company_id) = claimed.company_id.or(order.company_id) {
        match state
            .store
            .get_or_create_order_chat(order_id, company_id, driver.id, now)
            .await
        {
            Ok(chat) => info!(order_id, chat_id = chat.id, "order chat ready"),
            Err(err) => {
                warn!(order_id, error = %err, "failed to open order chat (non-critical)");
                state
                    .metrics
                    .non_critical_failures_total
                    .with_label_values(&["chat"])
                    .inc();
            }
        }
    }

    Ok(claimed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::fixtures::order;

    #[test]
    fn counts_only_own_active_orders() {
        let orders = vec![
            order(1, OrderStatus::Assigned, Some(7)),
            order(2, OrderStatus::PickedUp, Some(7)),
            order(3, OrderStatus::Delivered, Some(7)),
            order(4, OrderStatus::Assigned, Some(8)),
            order(5, OrderStatus::Pending, None),
        ];
        assert_eq!(active_order_count(&orders, 7), 2);
    }

    #[test]
    fn admission_rejects_at_the_limit() {
        let orders = vec![
            order(1, OrderStatus::Assigned, Some(7)),
            order(2, OrderStatus::EnRouteToPickup, Some(7)),
        ];
        assert!(matches!(
            check_admission(&orders, 7, 2),
            Err(OrderError::AdmissionLimitReached { limit: 2 })
        ));
        assert!(check_admission(&orders[..1], 7, 2).is_ok());
    }
}
