use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::error::OrderError;
use crate::models::event::UiEvent;
use crate::state::AppState;
use crate::store::OrderScope;

/// Orders refetches so that only the most recently started one that
/// succeeds may replace the in-memory list.
#[derive(Debug, Default)]
pub struct OrderSyncEngine {
    initiated: AtomicU64,
    applied: Mutex<u64>,
}

impl OrderSyncEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> u64 {
        self.initiated.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Runs `apply` unless a later refetch already landed or the results were
    /// invalidated since `ticket` was issued.
    pub fn apply_if_latest<F>(&self, ticket: u64, apply: F) -> bool
    where
        F: FnOnce(),
    {
        let mut applied = self.applied.lock().unwrap_or_else(PoisonError::into_inner);
        if ticket <= *applied {
            return false;
        }
        *applied = ticket;
        apply();
        true
    }

    /// Makes every refetch currently in flight stale.
    pub fn invalidate(&self) {
        let mut applied = self.applied.lock().unwrap_or_else(PoisonError::into_inner);
        *applied = self.initiated.load(Ordering::SeqCst);
    }
}

/// Refetches the driver's orders, applies proximity filtering and replaces the
/// in-memory list. On failure the previous list stays and a notice is raised.
pub async fn resync(state: &AppState) -> Result<usize, OrderError> {
    let session = state.session_snapshot().await.ok_or(OrderError::NoSession)?;
    let driver_id = session.profile.id;
    let ticket = state.sync.begin();
    let start = Instant::now();

    let scope = OrderScope {
        company_id: session.profile.company_id,
        driver_id,
    };

    let fetched = match state.store.fetch_orders(scope).await {
        Ok(orders) => orders,
        Err(err) => {
            let elapsed = start.elapsed().as_secs_f64();
            state
                .metrics
                .order_sync_latency_seconds
                .with_label_values(&["error"])
                .observe(elapsed);
            state
                .metrics
                .order_syncs_total
                .with_label_values(&["error"])
                .inc();
            warn!(driver_id, error = %err, "order sync failed; keeping previous list");
            let err = OrderError::SyncFailure(err);
            state.publish(UiEvent::Notice {
                message: err.user_message(),
            });
            return Err(err);
        }
    };

    let visible = state
        .proximity
        .apply(fetched, driver_id, session.location)
        .await;
    let count = visible.len();
    let snapshot = Arc::new(visible);

    let applied = state.sync.apply_if_latest(ticket, || {
        state.orders_tx.send_replace(snapshot.clone());
    });

    let elapsed = start.elapsed().as_secs_f64();
    if !applied {
        debug!(driver_id, ticket, "discarding superseded order sync");
        state
            .metrics
            .order_syncs_total
            .with_label_values(&["superseded"])
            .inc();
        return Ok(count);
    }

    state
        .metrics
        .order_sync_latency_seconds
        .with_label_values(&["success"])
        .observe(elapsed);
    state
        .metrics
        .order_syncs_total
        .with_label_values(&["success"])
        .inc();
    state.metrics.orders_visible.set(count as i64);
    info!(driver_id, orders = count, "order list synced");

    state.publish(UiEvent::OrdersUpdated {
        orders: snapshot.as_ref().clone(),
    });

    if let Err(err) = state.storage.set("orders", snapshot.as_ref()).await {
        warn!(error = %err, "failed to persist order snapshot");
        state
            .metrics
            .non_critical_failures_total
            .with_label_values(&["storage"])
            .inc();
    }

    Ok(count)
}
