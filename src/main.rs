use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use driver_core::api;
use driver_core::auth::StoredHashVerifier;
use driver_core::config::Config;
use driver_core::engine::session;
use driver_core::error::AppError;
use driver_core::geo::geocoder::NominatimGeocoder;
use driver_core::state::AppState;
use driver_core::storage::LocalStorage;
use driver_core::store::{DataStore, MemoryStore, RestStore};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let store: Arc<dyn DataStore> = match &config.backend_url {
        Some(url) => {
            tracing::info!(backend = %url, "using hosted backend");
            Arc::new(
                RestStore::new(
                    url.clone(),
                    config.backend_key.clone(),
                    config.engine.event_buffer_size,
                )
                .with_change_poll(config.change_poll),
            )
        }
        None => {
            tracing::warn!("BACKEND_URL not set; running against an in-memory store");
            Arc::new(MemoryStore::new(config.engine.event_buffer_size))
        }
    };

    let geocoder = Arc::new(NominatimGeocoder::new(
        config.geocoder_url.clone(),
        config.geocode_delay,
    ));

    let storage = LocalStorage::open(&config.storage_path)
        .await
        .map_err(|err| AppError::Internal(format!("failed to open local state: {err}")))?;

    let shared_state = Arc::new(AppState::new(
        config.engine.clone(),
        store,
        geocoder,
        Arc::new(StoredHashVerifier),
        storage,
    ));

    if let Some(driver) = session::restore(&shared_state).await {
        tracing::info!(driver_id = driver.id, "resumed previous session");
    }

    let app = api::rest::router(shared_state.clone());

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port = config.http_port, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    shared_state.stop_session_tasks();
    tracing::info!("driver core stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
