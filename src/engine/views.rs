use std::collections::BTreeMap;

use chrono::{Datelike, Duration, NaiveDate};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::engine::acceptance::active_order_count;
use crate::engine::transitions::{primary_action, PrimaryAction};
use crate::models::order::{Order, OrderStatus};

#[derive(Debug, Clone, Serialize)]
pub struct OrderCard {
    pub display_id: String,
    #[serde(flatten)]
    pub order: Order,
    pub action: Option<PrimaryAction>,
}

impl From<Order> for OrderCard {
    fn from(order: Order) -> Self {
        Self {
            display_id: order.display_id(),
            action: primary_action(&order),
            order,
        }
    }
}

/// Pending orders offered to the driver. Once the driver is at the active
/// order cap the list is cut down to `limit` entries.
pub fn available_orders(orders: &[Order], driver_id: i64, limit: usize) -> Vec<Order> {
    let available = orders
        .iter()
        .filter(|order| order.status == OrderStatus::Pending && !order.is_owned_by(driver_id))
        .cloned();

    if active_order_count(orders, driver_id) >= limit {
        available.take(limit).collect()
    } else {
        available.collect()
    }
}

pub fn my_active_orders(orders: &[Order], driver_id: i64) -> Vec<Order> {
    orders
        .iter()
        .filter(|order| order.is_owned_by(driver_id) && order.status != OrderStatus::Delivered)
        .cloned()
        .collect()
}

pub fn completed_orders(orders: &[Order], driver_id: i64) -> Vec<Order> {
    orders
        .iter()
        .filter(|order| order.is_owned_by(driver_id) && order.status == OrderStatus::Delivered)
        .cloned()
        .collect()
}

/// Delivered orders and their summed price over one day or one week
/// (weeks start on Monday).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EarningsGroup {
    pub start: NaiveDate,
    pub orders: usize,
    pub total: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct EarningsSummary {
    pub total: Decimal,
    pub pending: Decimal,
    pub completed_orders: usize,
    pub by_day: Vec<EarningsGroup>,
    pub by_week: Vec<EarningsGroup>,
}

/// Totals the driver's wallet: `total` over delivered orders, `pending` over
/// orders still in progress. Groups are keyed by the UTC date of the last
/// update and listed newest first.
pub fn earnings_summary(orders: &[Order], driver_id: i64) -> EarningsSummary {
    let delivered = completed_orders(orders, driver_id);
    let pending: Decimal = my_active_orders(orders, driver_id)
        .iter()
        .filter(|order| order.status != OrderStatus::Pending)
        .map(|order| order.suggested_price)
        .sum();

    let mut by_day: BTreeMap<NaiveDate, EarningsGroup> = BTreeMap::new();
    let mut by_week: BTreeMap<NaiveDate, EarningsGroup> = BTreeMap::new();
    for order in &delivered {
        let day = order.updated_at.date_naive();
        let monday = day - Duration::days(i64::from(day.weekday().num_days_from_monday()));

        for (groups, start) in [(&mut by_day, day), (&mut by_week, monday)] {
            let group = groups.entry(start).or_insert(EarningsGroup {
                start,
                orders: 0,
                total: Decimal::ZERO,
            });
            group.orders += 1;
            group.total += order.suggested_price;
        }
    }

    EarningsSummary {
        total: delivered.iter().map(|order| order.suggested_price).sum(),
        pending,
        completed_orders: delivered.len(),
        by_day: by_day.into_values().rev().collect(),
        by_week: by_week.into_values().rev().collect(),
    }
}
