use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::geo::GeoPoint;
use crate::models::chat::OrderChat;
use crate::models::driver::DriverRecord;
use crate::models::history::StatusHistoryEntry;
use crate::models::order::{Order, OrderStatus};
use crate::store::{
    ChangeEvent, ChangeKind, ChangeSubscription, ClaimOutcome, DataStore, OrderScope, StoreError,
};

const ORDER_SELECT: &str =
    "*,clients(name,phone),locals(name,address),drivers(name,phone)";

#[derive(Debug, Default, Deserialize)]
struct NamedRef {
    name: Option<String>,
    phone: Option<String>,
    address: Option<String>,
}

/// Order row as returned by the joined select.
#[derive(Debug, Deserialize)]
struct OrderRow {
    id: i64,
    status: OrderStatus,
    pickup_address: Option<String>,
    delivery_address: Option<String>,
    #[serde(default, deserialize_with = "code_as_string")]
    pickup_code: Option<String>,
    suggested_price: Option<Decimal>,
    notes: Option<String>,
    driver_id: Option<i64>,
    company_id: Option<i64>,
    local_id: Option<i64>,
    client_id: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    clients: Option<NamedRef>,
    #[serde(default)]
    locals: Option<NamedRef>,
    #[serde(default)]
    drivers: Option<NamedRef>,
}

/// Pickup codes were stored as integers in early rows and strings later.
fn code_as_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::String(code)) if !code.trim().is_empty() => Some(code),
        Some(Value::Number(code)) => Some(code.to_string()),
        _ => None,
    })
}

impl From<OrderRow> for Order {
    fn from(row: OrderRow) -> Self {
        let client = row.clients.unwrap_or_default();
        let local = row.locals.unwrap_or_default();
        let driver = row.drivers.unwrap_or_default();
        let pickup_address = row.pickup_address.unwrap_or_default();

        Order {
            db_id: row.id,
            status: row.status,
            client_name: client.name.unwrap_or_default(),
            client_phone: client.phone.unwrap_or_default(),
            local_name: local.name.unwrap_or_default(),
            local_address: local.address.unwrap_or_else(|| pickup_address.clone()),
            pickup_address,
            delivery_address: row.delivery_address.unwrap_or_default(),
            pickup_code: row.pickup_code,
            suggested_price: row.suggested_price.unwrap_or_default(),
            notes: row.notes.unwrap_or_default(),
            driver_id: row.driver_id,
            driver_name: driver.name,
            driver_phone: driver.phone,
            company_id: row.company_id,
            local_id: row.local_id,
            client_id: row.client_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            distance_km: None,
            within_radius: true,
        }
    }
}

#[derive(Serialize)]
struct NewChat {
    order_id: i64,
    company_id: i64,
    driver_id: i64,
    expires_at: DateTime<Utc>,
}

/// `in.("A","B")` filter matching every spelling of a status.
fn status_filter(status: OrderStatus) -> String {
    let quoted: Vec<String> = status
        .spellings()
        .iter()
        .map(|spelling| format!("\"{spelling}\""))
        .collect();
    format!("in.({})", quoted.join(","))
}

#[derive(Debug, Deserialize)]
struct ChangeRow {
    id: i64,
    company_id: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// PostgREST-style client for the hosted backend. Each change subscription
/// polls for rows updated past a watermark and feeds them into the same
/// channel that echoes this process's own writes.
#[derive(Clone)]
pub struct RestStore {
    client: Client,
    base_url: String,
    api_key: String,
    changes_tx: broadcast::Sender<ChangeEvent>,
    change_poll: Duration,
}

impl RestStore {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, event_buffer_size: usize) -> Self {
        let (changes_tx, _unused_rx) = broadcast::channel(event_buffer_size);
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            changes_tx,
            change_poll: Duration::from_secs(5),
        }
    }

    pub fn with_change_poll(mut self, every: Duration) -> Self {
        self.change_poll = every;
        self
    }

    /// Without a watermark, returns the newest row to seed one. With one,
    /// returns every row updated after it, oldest first.
    async fn changed_since(
        &self,
        company_id: Option<i64>,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChangeRow>, StoreError> {
        let mut query = vec![("select", "id,company_id,created_at,updated_at".to_string())];
        match watermark {
            Some(since) => {
                query.push((
                    "updated_at",
                    format!("gt.{}", since.to_rfc3339_opts(SecondsFormat::Micros, true)),
                ));
                query.push(("order", "updated_at.asc".to_string()));
            }
            None => {
                query.push(("order", "updated_at.desc".to_string()));
                query.push(("limit", "1".to_string()));
            }
        }
        if let Some(company_id) = company_id {
            query.push(("company_id", format!("eq.{company_id}")));
        }

        Self::send(self.table(reqwest::Method::GET, "orders").query(&query)).await
    }

    async fn watch_changes(self, company_id: Option<i64>) {
        let mut ticker = interval(self.change_poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut watermark: Option<DateTime<Utc>> = None;

        loop {
            ticker.tick().await;
            let rows = match self.changed_since(company_id, watermark).await {
                Ok(rows) => rows,
                Err(err) => {
                    warn!(company_id, error = %err, "order change poll failed");
                    continue;
                }
            };

            let Some(since) = watermark else {
                watermark = Some(
                    rows.iter()
                        .map(|row| row.updated_at)
                        .max()
                        .unwrap_or(DateTime::UNIX_EPOCH),
                );
                continue;
            };

            let mut newest = since;
            for row in rows {
                let kind = if row.created_at > since {
                    ChangeKind::Insert
                } else {
                    ChangeKind::Update
                };
                debug!(order_id = row.id, ?kind, "remote order change");
                self.publish(kind, row.id, row.company_id);
                newest = newest.max(row.updated_at);
            }
            watermark = Some(newest);
        }
    }

    fn table(&self, method: reqwest::Method, table: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/rest/v1/{table}", self.base_url))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn send<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, StoreError> {
        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::CONFLICT {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Conflict(body));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<T>().await?)
    }

    async fn send_empty(request: RequestBuilder) -> Result<(), StoreError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::CONFLICT {
            Err(StoreError::Conflict(body))
        } else {
            Err(StoreError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }

    fn publish(&self, kind: ChangeKind, order_id: i64, company_id: Option<i64>) {
        let _ = self.changes_tx.send(ChangeEvent {
            kind,
            order_id,
            company_id,
        });
    }

    async fn find_live_chat(
        &self,
        order_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<OrderChat>, StoreError> {
        let order_filter = format!("eq.{order_id}");
        let expiry_filter = format!("gt.{}", now.to_rfc3339());
        let chats: Vec<OrderChat> = Self::send(
            self.table(reqwest::Method::GET, "order_chats").query(&[
                ("select", "*"),
                ("order_id", order_filter.as_str()),
                ("expires_at", expiry_filter.as_str()),
                ("limit", "1"),
            ]),
        )
        .await?;
        Ok(chats.into_iter().next())
    }
}

#[async_trait]
impl DataStore for RestStore {
    async fn find_driver_by_username(
        &self,
        username: &str,
    ) -> Result<Option<DriverRecord>, StoreError> {
        let username_filter = format!("eq.{username}");
        let drivers: Vec<DriverRecord> = Self::send(
            self.table(reqwest::Method::GET, "drivers").query(&[
                ("select", "id,username,name,phone,email,active,company_id,password"),
                ("username", username_filter.as_str()),
                ("active", "eq.true"),
                ("limit", "1"),
            ]),
        )
        .await?;
        Ok(drivers.into_iter().next())
    }

    async fn fetch_orders(&self, scope: OrderScope) -> Result<Vec<Order>, StoreError> {
        let visibility = format!(
            "(status.eq.{},driver_id.eq.{})",
            OrderStatus::Pending.as_str(),
            scope.driver_id
        );
        let mut query: Vec<(&str, String)> = vec![
            ("select", ORDER_SELECT.to_string()),
            ("or", visibility),
            ("order", "created_at.desc".to_string()),
        ];
        if let Some(company_id) = scope.company_id {
            query.push(("company_id", format!("eq.{company_id}")));
        }

        let rows: Vec<OrderRow> =
            Self::send(self.table(reqwest::Method::GET, "orders").query(&query)).await?;
        debug!(rows = rows.len(), driver_id = scope.driver_id, "orders fetched");
        Ok(rows.into_iter().map(Order::from).collect())
    }

    async fn claim_order(
        &self,
        order_id: i64,
        driver_id: i64,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        let id_filter = format!("eq.{order_id}");
        let pending_filter = status_filter(OrderStatus::Pending);
        let rows: Vec<OrderRow> = Self::send(
            self.table(reqwest::Method::PATCH, "orders")
                .query(&[
                    ("id", id_filter.as_str()),
                    ("status", pending_filter.as_str()),
                    ("select", ORDER_SELECT),
                ])
                .header("Prefer", "return=representation")
                .json(&json!({
                    "status": OrderStatus::Assigned,
                    "driver_id": driver_id,
                    "updated_at": now,
                })),
        )
        .await?;

        match rows.into_iter().next() {
            Some(row) => {
                let order = Order::from(row);
                self.publish(ChangeKind::Update, order.db_id, order.company_id);
                Ok(ClaimOutcome::Claimed(order))
            }
            None => Ok(ClaimOutcome::NotPending),
        }
    }

    async fn update_order_status(
        &self,
        order_id: i64,
        expected: OrderStatus,
        to: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Order>, StoreError> {
        let id_filter = format!("eq.{order_id}");
        let expected_filter = status_filter(expected);
        let rows: Vec<OrderRow> = Self::send(
            self.table(reqwest::Method::PATCH, "orders")
                .query(&[
                    ("id", id_filter.as_str()),
                    ("status", expected_filter.as_str()),
                    ("select", ORDER_SELECT),
                ])
                .header("Prefer", "return=representation")
                .json(&json!({
                    "status": to,
                    "updated_at": now,
                })),
        )
        .await?;

        Ok(rows.into_iter().next().map(|row| {
            let order = Order::from(row);
            self.publish(ChangeKind::Update, order.db_id, order.company_id);
            order
        }))
    }

    async fn revert_order(&self, order_id: i64, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let id_filter = format!("eq.{order_id}");
        let assigned_filter = status_filter(OrderStatus::Assigned);
        let rows: Vec<Value> = Self::send(
            self.table(reqwest::Method::PATCH, "orders")
                .query(&[
                    ("id", id_filter.as_str()),
                    ("status", assigned_filter.as_str()),
                    ("select", "id,company_id"),
                ])
                .header("Prefer", "return=representation")
                .json(&json!({
                    "status": OrderStatus::Pending,
                    "driver_id": Value::Null,
                    "updated_at": now,
                })),
        )
        .await?;

        let Some(row) = rows.first() else {
            return Ok(false);
        };
        let company_id = row.get("company_id").and_then(Value::as_i64);
        self.publish(ChangeKind::Update, order_id, company_id);
        Ok(true)
    }

    async fn insert_status_history(&self, entry: StatusHistoryEntry) -> Result<(), StoreError> {
        Self::send_empty(
            self.table(reqwest::Method::POST, "order_status_history")
                .header("Prefer", "return=minimal")
                .json(&entry),
        )
        .await
    }

    async fn get_or_create_order_chat(
        &self,
        order_id: i64,
        company_id: i64,
        driver_id: i64,
        now: DateTime<Utc>,
    ) -> Result<OrderChat, StoreError> {
        if let Some(chat) = self.find_live_chat(order_id, now).await? {
            return Ok(chat);
        }

        let created: Result<Vec<OrderChat>, StoreError> = Self::send(
            self.table(reqwest::Method::POST, "order_chats")
                .header("Prefer", "return=representation")
                .json(&NewChat {
                    order_id,
                    company_id,
                    driver_id,
                    expires_at: OrderChat::expiry_from(now),
                }),
        )
        .await;

        match created {
            Ok(rows) => rows
                .into_iter()
                .next()
                .ok_or_else(|| StoreError::Decode("empty order_chats insert response".to_string())),
            // Another writer opened the chat first.
            Err(StoreError::Conflict(_)) => self
                .find_live_chat(order_id, now)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("chat for order {order_id}"))),
            Err(err) => Err(err),
        }
    }

    async fn record_driver_location(
        &self,
        driver_id: i64,
        location: GeoPoint,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        Self::send_empty(
            self.table(reqwest::Method::POST, "driver_locations")
                .query(&[("on_conflict", "driver_id")])
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(&json!({
                    "driver_id": driver_id,
                    "latitude": location.lat,
                    "longitude": location.lng,
                    "updated_at": now,
                })),
        )
        .await
    }

    async fn subscribe_orders(
        &self,
        company_id: Option<i64>,
    ) -> Result<ChangeSubscription, StoreError> {
        let rx = self.changes_tx.subscribe();
        let watcher = tokio::spawn(self.clone().watch_changes(company_id));
        Ok(ChangeSubscription::new(rx, company_id).with_watcher(watcher))
    }
}
