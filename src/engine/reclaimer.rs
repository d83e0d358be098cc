use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::engine::record_history;
use crate::engine::sync::resync;
use crate::models::event::UiEvent;
use crate::models::history::StatusHistoryEntry;
use crate::models::order::{Order, OrderStatus};
use crate::state::AppState;

/// The driver's assigned orders whose last update is older than `timeout`.
/// Pure so the rule can run wherever the sweep is scheduled.
pub fn select_stale(
    orders: &[Order],
    driver_id: i64,
    now: DateTime<Utc>,
    timeout: Duration,
) -> Vec<i64> {
    orders
        .iter()
        .filter(|order| order.status == OrderStatus::Assigned)
        .filter(|order| order.driver_id == Some(driver_id))
        .filter(|order| match (now - order.updated_at).to_std() {
            Ok(elapsed) => elapsed > timeout,
            Err(_) => false,
        })
        .map(|order| order.db_id)
        .collect()
}

/// Busy flag that keeps sweeps from overlapping.
#[derive(Debug, Default)]
pub struct TimeoutReclaimer {
    busy: AtomicBool,
}

pub struct SweepGuard<'a> {
    busy: &'a AtomicBool,
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

impl TimeoutReclaimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_begin(&self) -> Option<SweepGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SweepGuard { busy: &self.busy })
    }
}

pub async fn sweep(state: &AppState) -> Option<usize> {
    sweep_at(state, Utc::now()).await
}

/// One reclaim pass over the known order list. Returns `None` when another
/// pass is still running, otherwise how many orders went back to pending.
pub async fn sweep_at(state: &AppState, now: DateTime<Utc>) -> Option<usize> {
    let Some(_guard) = state.reclaimer.try_begin() else {
        debug!("reclaim sweep already in progress; skipping");
        return None;
    };

    let Some(driver) = state.current_driver().await else {
        return Some(0);
    };

    let stale = select_stale(&state.orders(), driver.id, now, state.config.assigned_timeout);
    if stale.is_empty() {
        return Some(0);
    }

    let mut reverted = 0;
    for order_id in stale {
        match state.store.revert_order(order_id, now).await {
            Ok(true) => {
                reverted += 1;
                state.metrics.orders_reverted_total.inc();
                info!(order_id, "stale assignment reverted to pending");
                record_history(state, StatusHistoryEntry::auto_revert(order_id)).await;
            }
            Ok(false) => debug!(order_id, "order left assigned state before revert"),
            Err(err) => error!(order_id, error = %err, "failed to revert stale assignment"),
        }
    }

    if reverted > 0 {
        state.publish(UiEvent::ShowAvailable { reverted });
        let _ = resync(state).await;
    }

    Some(reverted)
}

#[cfg(test)]
mod tests {
    use chrono::Duration as TimeDelta;

    use super::*;
    use crate::store::memory::fixtures::order_at;

    #[test]
    fn only_assigned_orders_past_the_timeout_are_stale() {
        let now = Utc::now();
        let orders = vec![
            order_at(1, OrderStatus::Assigned, Some(7), now - TimeDelta::seconds(61)),
            order_at(2, OrderStatus::Assigned, Some(7), now - TimeDelta::seconds(59)),
            order_at(3, OrderStatus::EnRouteToPickup, Some(7), now - TimeDelta::seconds(600)),
            order_at(4, OrderStatus::Pending, None, now - TimeDelta::seconds(600)),
        ];

        assert_eq!(select_stale(&orders, 7, now, Duration::from_secs(60)), vec![1]);
    }

    #[test]
    fn future_timestamps_are_never_stale() {
        let now = Utc::now();
        let orders = vec![order_at(1, OrderStatus::Assigned, Some(7), now + TimeDelta::seconds(120))];
        assert!(select_stale(&orders, 7, now, Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn other_drivers_assignments_are_left_alone() {
        let now = Utc::now();
        let orders = vec![
            order_at(1, OrderStatus::Assigned, Some(8), now - TimeDelta::seconds(600)),
            order_at(2, OrderStatus::Assigned, Some(7), now - TimeDelta::seconds(600)),
            order_at(3, OrderStatus::Assigned, None, now - TimeDelta::seconds(600)),
        ];

        assert_eq!(select_stale(&orders, 7, now, Duration::from_secs(60)), vec![2]);
    }

    #[test]
    fn second_sweep_cannot_start_while_first_runs() {
        let reclaimer = TimeoutReclaimer::new();
        let guard = reclaimer.try_begin();
        assert!(guard.is_some());
        assert!(reclaimer.try_begin().is_none());

        drop(guard);
        assert!(reclaimer.try_begin().is_some());
    }
}
