pub mod acceptance;
pub mod lease;
pub mod pickup_code;
pub mod progression;
pub mod proximity;
pub mod reclaimer;
pub mod session;
pub mod sync;
pub mod transitions;
pub mod views;

use tracing::warn;

use crate::models::history::StatusHistoryEntry;
use crate::state::AppState;

/// Appends a status-history row. Failures are logged and counted, never
/// propagated: the status write they follow already happened.
pub(crate) async fn record_history(state: &AppState, entry: StatusHistoryEntry) {
    let order_id = entry.order_id;
    if let Err(err) = state.store.insert_status_history(entry).await {
        warn!(order_id, error = %err, "failed to append status history (non-critical)");
        state
            .metrics
            .non_critical_failures_total
            .with_label_values(&["history"])
            .inc();
    }
}
