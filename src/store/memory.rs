use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::geo::GeoPoint;
use crate::models::chat::OrderChat;
use crate::models::driver::DriverRecord;
use crate::models::history::StatusHistoryEntry;
use crate::models::order::{Order, OrderStatus};
use crate::store::{
    ChangeEvent, ChangeKind, ChangeSubscription, ClaimOutcome, DataStore, OrderScope, StoreError,
};

/// In-process backend used for offline runs and tests. Each conditional
/// update holds the row's shard lock, so it is atomic per order.
pub struct MemoryStore {
    drivers: DashMap<String, DriverRecord>,
    orders: DashMap<i64, Order>,
    history: Mutex<Vec<StatusHistoryEntry>>,
    chats: DashMap<i64, OrderChat>,
    locations: DashMap<i64, (GeoPoint, DateTime<Utc>)>,
    next_chat_id: AtomicI64,
    changes_tx: broadcast::Sender<ChangeEvent>,
    fetches: AtomicUsize,
    order_writes: AtomicUsize,
    fail_fetch: AtomicBool,
    fail_history: AtomicBool,
    fail_chat: AtomicBool,
    subscribe_delay_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new(event_buffer_size: usize) -> Self {
        let (changes_tx, _unused_rx) = broadcast::channel(event_buffer_size);
        Self {
            drivers: DashMap::new(),
            orders: DashMap::new(),
            history: Mutex::new(Vec::new()),
            chats: DashMap::new(),
            locations: DashMap::new(),
            next_chat_id: AtomicI64::new(1),
            changes_tx,
            fetches: AtomicUsize::new(0),
            order_writes: AtomicUsize::new(0),
            fail_fetch: AtomicBool::new(false),
            fail_history: AtomicBool::new(false),
            fail_chat: AtomicBool::new(false),
            subscribe_delay_ms: AtomicU64::new(0),
        }
    }

    pub fn insert_driver(&self, driver: DriverRecord) {
        self.drivers.insert(driver.username.clone(), driver);
    }

    /// Places an order as the company panel would, announcing it on the feed.
    pub fn insert_order(&self, order: Order) {
        let event = ChangeEvent {
            kind: ChangeKind::Insert,
            order_id: order.db_id,
            company_id: order.company_id,
        };
        self.orders.insert(order.db_id, order);
        let _ = self.changes_tx.send(event);
    }

    pub fn order(&self, order_id: i64) -> Option<Order> {
        self.orders.get(&order_id).map(|entry| entry.value().clone())
    }

    /// Overwrites a row without touching the write counter, for test setup.
    pub fn with_order<F>(&self, order_id: i64, f: F)
    where
        F: FnOnce(&mut Order),
    {
        if let Some(mut order) = self.orders.get_mut(&order_id) {
            f(order.value_mut());
        }
    }

    pub fn history(&self) -> Vec<StatusHistoryEntry> {
        self.history
            .lock()
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    pub fn chat_for(&self, order_id: i64) -> Option<OrderChat> {
        self.chats.get(&order_id).map(|entry| entry.value().clone())
    }

    pub fn location_of(&self, driver_id: i64) -> Option<GeoPoint> {
        self.locations.get(&driver_id).map(|entry| entry.0)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of status writes that reached a row.
    pub fn order_write_count(&self) -> usize {
        self.order_writes.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.changes_tx.receiver_count()
    }

    pub fn set_fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_history(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_chat(&self, fail: bool) {
        self.fail_chat.store(fail, Ordering::SeqCst);
    }

    /// Makes `subscribe_orders` take this long, like a slow realtime handshake.
    pub fn set_subscribe_delay(&self, delay: std::time::Duration) {
        self.subscribe_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn publish_update(&self, order: &Order) {
        let _ = self.changes_tx.send(ChangeEvent {
            kind: ChangeKind::Update,
            order_id: order.db_id,
            company_id: order.company_id,
        });
    }

    fn unavailable(what: &str) -> StoreError {
        StoreError::Status {
            status: 503,
            body: format!("{what} unavailable"),
        }
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn find_driver_by_username(
        &self,
        username: &str,
    ) -> Result<Option<DriverRecord>, StoreError> {
        Ok(self
            .drivers
            .get(username)
            .map(|entry| entry.value().clone())
            .filter(|driver| driver.active))
    }

    async fn fetch_orders(&self, scope: OrderScope) -> Result<Vec<Order>, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(Self::unavailable("orders"));
        }

        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter(|entry| {
                let order = entry.value();
                let in_company = scope.company_id.is_none() || order.company_id == scope.company_id;
                let visible =
                    order.status == OrderStatus::Pending || order.is_owned_by(scope.driver_id);
                in_company && visible
            })
            .map(|entry| {
                let mut order = entry.value().clone();
                order.distance_km = None;
                order.within_radius = true;
                order
            })
            .collect();

        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    async fn claim_order(
        &self,
        order_id: i64,
        driver_id: i64,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        let claimed = {
            let mut order = self
                .orders
                .get_mut(&order_id)
                .ok_or_else(|| StoreError::NotFound(format!("order {order_id}")))?;

            if order.status != OrderStatus::Pending {
                return Ok(ClaimOutcome::NotPending);
            }

            order.status = OrderStatus::Assigned;
            order.driver_id = Some(driver_id);
            order.updated_at = now;
            order.value().clone()
        };

        self.order_writes.fetch_add(1, Ordering::SeqCst);
        self.publish_update(&claimed);
        Ok(ClaimOutcome::Claimed(claimed))
    }

    async fn update_order_status(
        &self,
        order_id: i64,
        expected: OrderStatus,
        to: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Order>, StoreError> {
        let updated = {
            let mut order = self
                .orders
                .get_mut(&order_id)
                .ok_or_else(|| StoreError::NotFound(format!("order {order_id}")))?;

            if order.status != expected {
                return Ok(None);
            }

            order.status = to;
            order.updated_at = now;
            order.value().clone()
        };

        self.order_writes.fetch_add(1, Ordering::SeqCst);
        self.publish_update(&updated);
        Ok(Some(updated))
    }

    async fn revert_order(&self, order_id: i64, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let reverted = {
            let mut order = self
                .orders
                .get_mut(&order_id)
                .ok_or_else(|| StoreError::NotFound(format!("order {order_id}")))?;

            if order.status != OrderStatus::Assigned {
                return Ok(false);
            }

            order.status = OrderStatus::Pending;
            order.driver_id = None;
            order.driver_name = None;
            order.driver_phone = None;
            order.updated_at = now;
            order.value().clone()
        };

        self.order_writes.fetch_add(1, Ordering::SeqCst);
        self.publish_update(&reverted);
        Ok(true)
    }

    async fn insert_status_history(&self, entry: StatusHistoryEntry) -> Result<(), StoreError> {
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(Self::unavailable("order_status_history"));
        }

        self.history
            .lock()
            .map_err(|_| StoreError::Http("history table poisoned".to_string()))?
            .push(entry);
        Ok(())
    }

    async fn get_or_create_order_chat(
        &self,
        order_id: i64,
        company_id: i64,
        driver_id: i64,
        now: DateTime<Utc>,
    ) -> Result<OrderChat, StoreError> {
        if self.fail_chat.load(Ordering::SeqCst) {
            return Err(Self::unavailable("order_chats"));
        }

        let mut chat = self.chats.entry(order_id).or_insert_with(|| OrderChat {
            id: self.next_chat_id.fetch_add(1, Ordering::SeqCst),
            order_id,
            company_id,
            driver_id,
            expires_at: OrderChat::expiry_from(now),
        });

        if chat.is_expired(now) {
            *chat = OrderChat {
                id: self.next_chat_id.fetch_add(1, Ordering::SeqCst),
                order_id,
                company_id,
                driver_id,
                expires_at: OrderChat::expiry_from(now),
            };
        }

        Ok(chat.value().clone())
    }

    async fn record_driver_location(
        &self,
        driver_id: i64,
        location: GeoPoint,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.locations.insert(driver_id, (location, now));
        Ok(())
    }

    async fn subscribe_orders(
        &self,
        company_id: Option<i64>,
    ) -> Result<ChangeSubscription, StoreError> {
        let delay_ms = self.subscribe_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        }
        Ok(ChangeSubscription::new(self.changes_tx.subscribe(), company_id))
    }
}
