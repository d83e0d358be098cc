use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::auth::authenticate;
use crate::engine::lease::TaskLease;
use crate::engine::reclaimer;
use crate::engine::sync::resync;
use crate::error::AppError;
use crate::geo::{haversine_km, GeoPoint};
use crate::models::driver::{DriverProfile, DriverSession};
use crate::models::order::Order;
use crate::state::AppState;
use crate::store::{ChangeNotice, StoreError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("username and password are required")]
    MissingCredentials,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("no driver session")]
    NoSession,

    #[error("driver is offline")]
    Offline,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::MissingCredentials => {
                AppError::BadRequest("Ingresa usuario y contraseña".to_string())
            }
            SessionError::InvalidCredentials => {
                AppError::Unauthorized("Usuario o contraseña incorrectos".to_string())
            }
            SessionError::NoSession => AppError::Unauthorized("Debes iniciar sesión".to_string()),
            SessionError::Offline => {
                AppError::Conflict("Debes estar en línea para compartir tu ubicación".to_string())
            }
            SessionError::Store(err) => AppError::Upstream(format!("Error de conexión: {err}")),
        }
    }
}

fn count_storage_failure(state: &AppState, key: &str, err: impl std::fmt::Display) {
    warn!(key, error = %err, "failed to persist local state (non-critical)");
    state
        .metrics
        .non_critical_failures_total
        .with_label_values(&["storage"])
        .inc();
}

/// Authenticates, restores the persisted online flag and loads the first
/// order list. Background tasks start only if the driver was online.
pub async fn login(
    state: &Arc<AppState>,
    username: &str,
    password: &str,
) -> Result<DriverSession, SessionError> {
    let profile = authenticate(&state.store, &state.verifier, username, password).await?;

    let online = state.storage.get::<bool>("isOnline").await.unwrap_or(false);
    let session = DriverSession::new(profile.clone(), online);
    let previous = state.session.write().await.replace(session.clone());

    state.stop_session_tasks();
    state.sync.invalidate();

    if previous.map(|prior| prior.profile.id) != Some(profile.id) {
        state.orders_tx.send_replace(Arc::new(Vec::new()));
        state.metrics.orders_visible.set(0);
        if let Err(err) = state.storage.remove("orders").await {
            count_storage_failure(state, "orders", err);
        }
    }

    if let Err(err) = state.storage.set("driver", &profile).await {
        count_storage_failure(state, "driver", err);
    }

    info!(driver_id = profile.id, online, "driver logged in");

    let _ = resync(state).await;
    if online {
        start_session_tasks(state).await;
    }

    Ok(session)
}

/// Ends the session: every task lease is released, in-flight refetches are
/// discarded and the persisted driver and order list are cleared.
pub async fn logout(state: &AppState) {
    let previous = state.session.write().await.take();
    state.stop_session_tasks();
    state.sync.invalidate();

    state.orders_tx.send_replace(Arc::new(Vec::new()));
    state.metrics.orders_visible.set(0);

    for key in ["driver", "orders"] {
        if let Err(err) = state.storage.remove(key).await {
            count_storage_failure(state, key, err);
        }
    }

    if let Some(session) = previous {
        info!(driver_id = session.profile.id, "driver logged out");
    }
}

/// Startup path: brings back a persisted driver together with the last
/// cached order list, then refreshes from the backend.
pub async fn restore(state: &Arc<AppState>) -> Option<DriverProfile> {
    let profile = state.storage.get::<DriverProfile>("driver").await?;
    let online = state.storage.get::<bool>("isOnline").await.unwrap_or(false);

    if let Some(cached) = state.storage.get::<Vec<Order>>("orders").await {
        debug!(orders = cached.len(), "restoring cached order list");
        state.orders_tx.send_replace(Arc::new(cached));
    }

    *state.session.write().await = Some(DriverSession::new(profile.clone(), online));
    info!(driver_id = profile.id, online, "driver session restored");

    let _ = resync(state).await;
    if online {
        start_session_tasks(state).await;
    }

    Some(profile)
}

/// Going online starts the session tasks and refetches; going offline stops
/// them and forgets the location fix.
pub async fn set_online(state: &Arc<AppState>, online: bool) -> Result<DriverSession, SessionError> {
    let session = {
        let mut guard = state.session.write().await;
        let session = guard.as_mut().ok_or(SessionError::NoSession)?;
        session.online = online;
        if !online {
            session.location = None;
            session.filtered_at = None;
        }
        session.clone()
    };

    if let Err(err) = state.storage.set("isOnline", &online).await {
        count_storage_failure(state, "isOnline", err);
    }

    info!(driver_id = session.profile.id, online, "driver availability changed");

    if online {
        start_session_tasks(state).await;
        let _ = resync(state).await;
    } else {
        state.stop_session_tasks();
    }

    Ok(session)
}

/// Records a new fix. It is reported to the backend right away; the order
/// list is only refiltered once the driver has moved far enough, and then
/// only after the debounce window settles.
pub async fn update_location(
    state: &Arc<AppState>,
    location: GeoPoint,
) -> Result<bool, SessionError> {
    let (driver_id, moved) = {
        let mut guard = state.session.write().await;
        let session = guard.as_mut().ok_or(SessionError::NoSession)?;
        if !session.online {
            return Err(SessionError::Offline);
        }
        session.location = Some(location);

        let moved = match session.filtered_at {
            None => true,
            Some(previous) => {
                haversine_km(&previous, &location) * 1000.0 >= state.config.location_min_move_m
            }
        };
        (session.profile.id, moved)
    };

    if let Err(err) = state
        .store
        .record_driver_location(driver_id, location, Utc::now())
        .await
    {
        warn!(driver_id, error = %err, "failed to record driver location (non-critical)");
        state
            .metrics
            .non_critical_failures_total
            .with_label_values(&["location"])
            .inc();
    }

    if moved {
        schedule_refilter(state);
    }

    Ok(moved)
}

fn schedule_refilter(state: &Arc<AppState>) {
    let task_state = state.clone();
    let debounce = state.config.location_debounce;
    let lease = TaskLease::spawn("location_debounce", async move {
        tokio::time::sleep(debounce).await;

        {
            let mut guard = task_state.session.write().await;
            let Some(session) = guard.as_mut() else {
                return;
            };
            session.filtered_at = session.location;
        }

        debug!("location settled; refiltering orders");
        let _ = resync(&task_state).await;
    });

    // Replacing the lease aborts the pending refilter.
    state.tasks().location_debounce = Some(lease);
}

/// Starts the reclaimer, the fallback refetch and the realtime watch for the
/// current session. Running tasks are replaced. Session changes take the
/// session write lock before stopping tasks, so nothing installed here can
/// outlive the online session it was started for.
pub async fn start_session_tasks(state: &Arc<AppState>) {
    let Some(profile) = state.current_driver().await else {
        return;
    };

    let reclaim_state = state.clone();
    let reclaim_every = state.config.reclaim_interval;
    let reclaimer = TaskLease::spawn("reclaimer", async move {
        let mut ticker = interval_at(Instant::now() + reclaim_every, reclaim_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Some(reverted) = reclaimer::sweep(&reclaim_state).await {
                if reverted > 0 {
                    debug!(reverted, "reclaim sweep finished");
                }
            }
        }
    });

    let sync_state = state.clone();
    let sync_every = state.config.sync_fallback_interval;
    let sync_fallback = TaskLease::spawn("sync_fallback", async move {
        let mut ticker = interval_at(Instant::now() + sync_every, sync_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let _ = resync(&sync_state).await;
        }
    });

    let realtime = match state.store.subscribe_orders(profile.company_id).await {
        Ok(mut subscription) => {
            let feed_state = state.clone();
            Some(TaskLease::spawn("realtime", async move {
                while let Some(notice) = subscription.next().await {
                    match notice {
                        ChangeNotice::Changed(event) => {
                            debug!(order_id = event.order_id, kind = ?event.kind, "order change received");
                        }
                        ChangeNotice::Missed(skipped) => {
                            debug!(skipped, "order change feed lagged; refetching");
                        }
                    }
                    let _ = resync(&feed_state).await;
                }
                warn!("order change feed closed");
            }))
        }
        Err(err) => {
            warn!(error = %err, "realtime subscription failed; relying on fallback refetch");
            None
        }
    };

    // The subscribe await may have raced a logout, a driver switch or going
    // offline. Holding the session read lock keeps those out while installing.
    let session = state.session.read().await;
    let still_current = session
        .as_ref()
        .is_some_and(|current| current.online && current.profile.id == profile.id);
    if !still_current {
        debug!(driver_id = profile.id, "session changed while starting tasks; discarding them");
        return;
    }

    let mut tasks = state.tasks();
    tasks.reclaimer = Some(reclaimer);
    tasks.sync_fallback = Some(sync_fallback);
    tasks.realtime = realtime;
    info!(driver_id = profile.id, tasks = ?tasks.running(), "session tasks started");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::auth::CredentialVerifier;
    use crate::config::EngineConfig;
    use crate::geo::geocoder::Geocoder;
    use crate::models::driver::DriverRecord;
    use crate::models::order::OrderStatus;
    use crate::storage::LocalStorage;
    use crate::store::memory::fixtures::{order, order_at};
    use crate::store::MemoryStore;

    struct PlainVerifier;

    impl CredentialVerifier for PlainVerifier {
        fn verify(&self, password: &str, hash: &str) -> bool {
            password == hash
        }
    }

    struct NoGeocoder;

    #[async_trait::async_trait]
    impl Geocoder for NoGeocoder {
        async fn geocode(&self, _address: &str) -> Option<GeoPoint> {
            None
        }
    }

    fn setup(storage: LocalStorage) -> (Arc<AppState>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new(64));
        store.insert_driver(DriverRecord {
            id: 7,
            username: "pedro".to_string(),
            name: "Pedro".to_string(),
            phone: None,
            email: None,
            active: true,
            company_id: Some(1),
            password: "secreto".to_string(),
        });
        store.insert_order(order(1001, OrderStatus::Pending, None));

        let state = AppState::new(
            EngineConfig::default(),
            store.clone(),
            Arc::new(NoGeocoder),
            Arc::new(PlainVerifier),
            storage,
        );
        (Arc::new(state), store)
    }

    #[tokio::test]
    async fn login_loads_orders_and_stays_offline_by_default() {
        let (state, store) = setup(LocalStorage::in_memory());

        let session = login(&state, "pedro", "secreto").await.unwrap();
        assert!(!session.online);
        assert_eq!(state.orders().len(), 1);
        assert!(!state.tasks().is_running());
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn wrong_password_leaves_no_session() {
        let (state, _store) = setup(LocalStorage::in_memory());

        let result = login(&state, "pedro", "nope").await;
        assert!(matches!(result, Err(SessionError::InvalidCredentials)));
        assert!(state.current_driver().await.is_none());
    }

    #[tokio::test]
    async fn going_online_starts_tasks_and_offline_stops_them() {
        let (state, store) = setup(LocalStorage::in_memory());
        login(&state, "pedro", "secreto").await.unwrap();

        set_online(&state, true).await.unwrap();
        assert_eq!(
            state.tasks().running(),
            vec!["reclaimer", "sync_fallback", "realtime"]
        );
        assert_eq!(store.subscriber_count(), 1);

        set_online(&state, false).await.unwrap();
        tokio::task::yield_now().await;
        assert!(!state.tasks().is_running());
        assert_eq!(store.subscriber_count(), 0);
        assert_eq!(state.storage.get::<bool>("isOnline").await, Some(false));
    }

    #[tokio::test]
    async fn logout_clears_session_and_persisted_state() {
        let (state, store) = setup(LocalStorage::in_memory());
        login(&state, "pedro", "secreto").await.unwrap();
        set_online(&state, true).await.unwrap();

        logout(&state).await;
        tokio::task::yield_now().await;

        assert!(state.current_driver().await.is_none());
        assert!(state.orders().is_empty());
        assert!(!state.tasks().is_running());
        assert_eq!(store.subscriber_count(), 0);
        assert!(state.storage.get::<DriverProfile>("driver").await.is_none());
        assert!(state.storage.get::<Vec<Order>>("orders").await.is_none());
    }

    #[tokio::test]
    async fn restore_brings_back_driver_and_cached_orders() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let (state, _store) = setup(LocalStorage::open(&path).await.unwrap());
            login(&state, "pedro", "secreto").await.unwrap();
            set_online(&state, true).await.unwrap();
            state.stop_session_tasks();
        }

        let (state, _store) = setup(LocalStorage::open(&path).await.unwrap());
        let profile = restore(&state).await.unwrap();
        assert_eq!(profile.id, 7);
        assert!(state.session_snapshot().await.unwrap().online);
        assert_eq!(state.orders().len(), 1);
        assert!(state.tasks().is_running());
        state.stop_session_tasks();
    }

    #[tokio::test]
    async fn location_requires_online_driver() {
        let (state, _store) = setup(LocalStorage::in_memory());
        login(&state, "pedro", "secreto").await.unwrap();

        let result = update_location(&state, GeoPoint { lat: -33.45, lng: -70.66 }).await;
        assert!(matches!(result, Err(SessionError::Offline)));
    }

    #[tokio::test(start_paused = true)]
    async fn small_moves_do_not_refilter() {
        let (state, store) = setup(LocalStorage::in_memory());
        login(&state, "pedro", "secreto").await.unwrap();
        set_online(&state, true).await.unwrap();
        state.stop_session_tasks();

        let here = GeoPoint { lat: -33.45, lng: -70.66 };
        assert!(update_location(&state, here).await.unwrap());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(state.session_snapshot().await.unwrap().filtered_at, Some(here));
        assert_eq!(store.location_of(7), Some(here));

        let fetches = store.fetch_count();
        let nudge = GeoPoint { lat: -33.4501, lng: -70.66 };
        assert!(!update_location(&state, nudge).await.unwrap());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(store.fetch_count(), fetches);
        assert_eq!(store.location_of(7), Some(nudge));
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_fixes_collapse_into_one_refetch() {
        let (state, store) = setup(LocalStorage::in_memory());
        login(&state, "pedro", "secreto").await.unwrap();
        set_online(&state, true).await.unwrap();
        state.stop_session_tasks();
        let fetches = store.fetch_count();

        for step in 0..3 {
            let fix = GeoPoint {
                lat: -33.45 + f64::from(step) * 0.01,
                lng: -70.66,
            };
            update_location(&state, fix).await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(store.fetch_count(), fetches + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn going_offline_during_slow_subscribe_leaves_no_tasks() {
        let (state, store) = setup(LocalStorage::in_memory());
        login(&state, "pedro", "secreto").await.unwrap();
        store.set_subscribe_delay(Duration::from_millis(200));

        let going_online = tokio::spawn({
            let state = state.clone();
            async move { set_online(&state, true).await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        set_online(&state, false).await.unwrap();
        going_online.await.unwrap().unwrap();

        assert!(state.tasks().running().is_empty());
        let fetches = store.fetch_count();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(store.fetch_count(), fetches);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn logout_during_slow_subscribe_leaves_no_tasks() {
        let (state, store) = setup(LocalStorage::in_memory());
        login(&state, "pedro", "secreto").await.unwrap();
        store.set_subscribe_delay(Duration::from_millis(200));

        let going_online = tokio::spawn({
            let state = state.clone();
            async move { set_online(&state, true).await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        logout(&state).await;
        let _ = going_online.await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(state.tasks().running().is_empty());
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn switching_driver_drops_previous_orders_when_refetch_fails() {
        let (state, store) = setup(LocalStorage::in_memory());
        store.insert_driver(DriverRecord {
            id: 8,
            username: "ana".to_string(),
            name: "Ana".to_string(),
            phone: None,
            email: None,
            active: true,
            company_id: Some(1),
            password: "clave".to_string(),
        });
        store.insert_order(order_at(
            1002,
            OrderStatus::Assigned,
            Some(7),
            Utc::now() - chrono::Duration::seconds(600),
        ));

        login(&state, "pedro", "secreto").await.unwrap();
        assert_eq!(state.orders().len(), 2);

        store.set_fail_fetch(true);
        login(&state, "ana", "clave").await.unwrap();
        assert!(state.orders().is_empty());
        assert!(state.storage.get::<Vec<Order>>("orders").await.is_none());

        assert_eq!(reclaimer::sweep(&state).await, Some(0));
        assert_eq!(store.order(1002).unwrap().status, OrderStatus::Assigned);
    }
}
