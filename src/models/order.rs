use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Legacy spelling of the "en route to pickup" state still present in older rows.
pub const EN_ROUTE_LEGACY: &str = "En camino";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    #[serde(rename = "Pendiente")]
    Pending,
    #[serde(rename = "Asignado")]
    Assigned,
    #[serde(rename = "En camino al retiro", alias = "En camino")]
    EnRouteToPickup,
    #[serde(rename = "Producto retirado")]
    PickedUp,
    #[serde(rename = "Entregado")]
    Delivered,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 5] = [
        OrderStatus::Pending,
        OrderStatus::Assigned,
        OrderStatus::EnRouteToPickup,
        OrderStatus::PickedUp,
        OrderStatus::Delivered,
    ];

    /// Canonical spelling as persisted in the orders table.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "Pendiente",
            OrderStatus::Assigned => "Asignado",
            OrderStatus::EnRouteToPickup => "En camino al retiro",
            OrderStatus::PickedUp => "Producto retirado",
            OrderStatus::Delivered => "Entregado",
        }
    }

    /// Every spelling a stored row may carry for this status.
    pub fn spellings(&self) -> &'static [&'static str] {
        match self {
            OrderStatus::EnRouteToPickup => &["En camino al retiro", EN_ROUTE_LEGACY],
            OrderStatus::Pending => &["Pendiente"],
            OrderStatus::Assigned => &["Asignado"],
            OrderStatus::PickedUp => &["Producto retirado"],
            OrderStatus::Delivered => &["Entregado"],
        }
    }

    /// Assigned, en route or picked up: the states counted by admission control.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderStatus::Assigned | OrderStatus::EnRouteToPickup | OrderStatus::PickedUp
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps the legacy "en route" spelling to the canonical one and trims stray
/// whitespace. Unknown values pass through untouched.
pub fn normalize_status(raw: &str) -> &str {
    let trimmed = raw.trim();
    if trimmed == EN_ROUTE_LEGACY {
        OrderStatus::EnRouteToPickup.as_str()
    } else {
        trimmed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown order status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for OrderStatus {
    type Err = UnknownStatus;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match normalize_status(raw) {
            "Pendiente" | "Pending" => Ok(OrderStatus::Pending),
            "Asignado" | "Assigned" => Ok(OrderStatus::Assigned),
            "En camino al retiro" | "EnRouteToPickup" => Ok(OrderStatus::EnRouteToPickup),
            "Producto retirado" | "PickedUp" => Ok(OrderStatus::PickedUp),
            "Entregado" | "Delivered" => Ok(OrderStatus::Delivered),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub db_id: i64,
    pub status: OrderStatus,
    pub client_name: String,
    pub client_phone: String,
    pub local_name: String,
    pub local_address: String,
    pub pickup_address: String,
    pub delivery_address: String,
    pub pickup_code: Option<String>,
    pub suggested_price: Decimal,
    pub notes: String,
    pub driver_id: Option<i64>,
    pub driver_name: Option<String>,
    pub driver_phone: Option<String>,
    pub company_id: Option<i64>,
    pub local_id: Option<i64>,
    pub client_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Kilometres from the driver's last fix; `None` when unknown.
    #[serde(default)]
    pub distance_km: Option<f64>,
    #[serde(default = "within_radius_default")]
    pub within_radius: bool,
}

fn within_radius_default() -> bool {
    true
}

impl Order {
    pub fn display_id(&self) -> String {
        format!("ORD-{}", self.db_id)
    }

    pub fn is_owned_by(&self, driver_id: i64) -> bool {
        self.driver_id == Some(driver_id)
    }

    /// Address geocoded for proximity: the local's own address, falling back
    /// to the pickup address.
    pub fn proximity_address(&self) -> &str {
        if self.local_address.trim().is_empty() {
            &self.pickup_address
        } else {
            &self.local_address
        }
    }
}

/// Parses a display id (`ORD-1001`) or a bare database id (`1001`).
pub fn parse_order_ref(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    let digits = trimmed.strip_prefix("ORD-").unwrap_or(trimmed);
    digits.parse::<i64>().ok().filter(|id| *id > 0)
}
