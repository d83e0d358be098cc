use serde::Serialize;

use crate::models::order::Order;

/// Events pushed to the host shell over the websocket channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    OrdersUpdated { orders: Vec<Order> },
    /// Stale assignments were reverted; the shell returns to the available list.
    ShowAvailable { reverted: usize },
    ShowMyOrders { order_id: i64 },
    OrdersPanel { show: bool },
    Notice { message: String },
}
