pub mod memory;
pub mod rest;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::geo::GeoPoint;
use crate::models::chat::OrderChat;
use crate::models::driver::DriverRecord;
use crate::models::history::StatusHistoryEntry;
use crate::models::order::{Order, OrderStatus};

pub use memory::MemoryStore;
pub use rest::RestStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Http(String),

    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            StoreError::Decode(err.to_string())
        } else {
            StoreError::Http(err.to_string())
        }
    }
}

/// Rows visible to one driver: pending orders plus the driver's own, limited
/// to the driver's company when there is one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderScope {
    pub company_id: Option<i64>,
    pub driver_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(Order),
    /// The conditional update matched no row: the order left `Pending` first.
    NotPending,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub order_id: i64,
    pub company_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeNotice {
    Changed(ChangeEvent),
    /// The subscriber fell behind and dropped this many notifications.
    Missed(u64),
}

/// Aborts the task feeding a subscription when the subscription goes away.
struct FeedWatcher(JoinHandle<()>);

impl Drop for FeedWatcher {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Order change feed filtered to one company. Dropping it unsubscribes and
/// stops any watcher feeding it.
pub struct ChangeSubscription {
    rx: broadcast::Receiver<ChangeEvent>,
    company_id: Option<i64>,
    _watcher: Option<FeedWatcher>,
}

impl ChangeSubscription {
    pub fn new(rx: broadcast::Receiver<ChangeEvent>, company_id: Option<i64>) -> Self {
        Self {
            rx,
            company_id,
            _watcher: None,
        }
    }

    /// Ties `watcher` to this subscription's lifetime.
    pub fn with_watcher(mut self, watcher: JoinHandle<()>) -> Self {
        self._watcher = Some(FeedWatcher(watcher));
        self
    }

    /// Next notification for this company; `None` once the feed is closed.
    pub async fn next(&mut self) -> Option<ChangeNotice> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.company_id.is_none() || event.company_id == self.company_id {
                        return Some(ChangeNotice::Changed(event));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "order change feed lagged");
                    return Some(ChangeNotice::Missed(skipped));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// The hosted backend of record, reduced to the queries the driver core
/// performs. Status writes are conditional on the status the caller last saw.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Active driver with this username, if any.
    async fn find_driver_by_username(
        &self,
        username: &str,
    ) -> Result<Option<DriverRecord>, StoreError>;

    /// Pending or self-assigned orders with display fields joined, newest first.
    async fn fetch_orders(&self, scope: OrderScope) -> Result<Vec<Order>, StoreError>;

    /// Sets `Assigned` + driver only while the order is still `Pending`.
    async fn claim_order(
        &self,
        order_id: i64,
        driver_id: i64,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Writes `to` only while the stored status still normalises to `expected`.
    /// `None` when the row no longer matched.
    async fn update_order_status(
        &self,
        order_id: i64,
        expected: OrderStatus,
        to: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Order>, StoreError>;

    /// Administrative reset of a stale assignment back to the unclaimed pool.
    /// Returns false when the order was no longer `Assigned`.
    async fn revert_order(&self, order_id: i64, now: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn insert_status_history(&self, entry: StatusHistoryEntry) -> Result<(), StoreError>;

    /// Reuses the order's unexpired chat or opens a new one.
    async fn get_or_create_order_chat(
        &self,
        order_id: i64,
        company_id: i64,
        driver_id: i64,
        now: DateTime<Utc>,
    ) -> Result<OrderChat, StoreError>;

    async fn record_driver_location(
        &self,
        driver_id: i64,
        location: GeoPoint,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn subscribe_orders(
        &self,
        company_id: Option<i64>,
    ) -> Result<ChangeSubscription, StoreError>;
}
