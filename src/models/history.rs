use serde::{Deserialize, Serialize};

use crate::models::order::OrderStatus;

/// Row appended to `order_status_history` after every status write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusHistoryEntry {
    pub order_id: i64,
    pub status: OrderStatus,
    pub driver_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl StatusHistoryEntry {
    pub fn transition(order_id: i64, status: OrderStatus, driver_id: i64) -> Self {
        Self {
            order_id,
            status,
            driver_id: Some(driver_id),
            notes: None,
        }
    }

    pub fn auto_revert(order_id: i64) -> Self {
        Self {
            order_id,
            status: OrderStatus::Pending,
            driver_id: None,
            notes: Some("Revertido automáticamente por timeout".to_string()),
        }
    }
}
