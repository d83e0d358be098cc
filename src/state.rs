use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, watch, RwLock};
use tracing::info;

use crate::auth::CredentialVerifier;
use crate::config::EngineConfig;
use crate::engine::lease::SessionTasks;
use crate::engine::proximity::ProximityFilter;
use crate::engine::reclaimer::TimeoutReclaimer;
use crate::engine::sync::OrderSyncEngine;
use crate::geo::geocoder::{CachedGeocoder, Geocoder};
use crate::models::driver::{DriverProfile, DriverSession};
use crate::models::event::UiEvent;
use crate::models::order::Order;
use crate::observability::metrics::Metrics;
use crate::storage::LocalStorage;
use crate::store::DataStore;

pub type OrderSnapshot = Arc<Vec<Order>>;

pub struct AppState {
    pub config: EngineConfig,
    pub store: Arc<dyn DataStore>,
    pub proximity: ProximityFilter,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub storage: LocalStorage,
    pub session: RwLock<Option<DriverSession>>,
    /// Only ever replaced wholesale by the sync engine.
    pub orders_tx: watch::Sender<OrderSnapshot>,
    pub sync: OrderSyncEngine,
    pub reclaimer: TimeoutReclaimer,
    pub tasks: Mutex<SessionTasks>,
    pub ui_events_tx: broadcast::Sender<UiEvent>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn DataStore>,
        geocoder: Arc<dyn Geocoder>,
        verifier: Arc<dyn CredentialVerifier>,
        storage: LocalStorage,
    ) -> Self {
        let metrics = Metrics::new();
        let cached = CachedGeocoder::new(geocoder).with_counter(metrics.geocode_requests_total.clone());
        let (orders_tx, _unused_rx) = watch::channel(Arc::new(Vec::new()));
        let (ui_events_tx, _unused_rx) = broadcast::channel(config.event_buffer_size);

        Self {
            proximity: ProximityFilter::new(Arc::new(cached), config.proximity_radius_km),
            config,
            store,
            verifier,
            storage,
            session: RwLock::new(None),
            orders_tx,
            sync: OrderSyncEngine::new(),
            reclaimer: TimeoutReclaimer::new(),
            tasks: Mutex::new(SessionTasks::default()),
            ui_events_tx,
            metrics,
        }
    }

    pub fn orders(&self) -> OrderSnapshot {
        self.orders_tx.borrow().clone()
    }

    pub fn find_order(&self, order_id: i64) -> Option<Order> {
        self.orders_tx
            .borrow()
            .iter()
            .find(|order| order.db_id == order_id)
            .cloned()
    }

    pub async fn current_driver(&self) -> Option<DriverProfile> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|session| session.profile.clone())
    }

    pub async fn session_snapshot(&self) -> Option<DriverSession> {
        self.session.read().await.clone()
    }

    pub fn publish(&self, event: UiEvent) {
        let _ = self.ui_events_tx.send(event);
    }

    pub fn tasks(&self) -> MutexGuard<'_, SessionTasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tears down every session timer, watch and subscription in one place.
    pub fn stop_session_tasks(&self) {
        let mut tasks = self.tasks();
        if tasks.is_running() || tasks.location_debounce.is_some() {
            info!(tasks = ?tasks.running(), "stopping session tasks");
        }
        tasks.clear();
    }
}
