use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use prometheus::IntCounterVec;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::geo::GeoPoint;

/// Address to coordinates lookup. `None` means the address could not be
/// resolved, for whatever reason; callers treat that as "distance unknown".
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> Option<GeoPoint>;
}

pub fn cache_key(address: &str) -> String {
    address
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Session-lifetime cache in front of any geocoder. Only successful lookups
/// are stored so a backend outage is retried on the next pass.
pub struct CachedGeocoder {
    inner: Arc<dyn Geocoder>,
    cache: DashMap<String, GeoPoint>,
    requests: Option<IntCounterVec>,
}

impl CachedGeocoder {
    pub fn new(inner: Arc<dyn Geocoder>) -> Self {
        Self {
            inner,
            cache: DashMap::new(),
            requests: None,
        }
    }

    pub fn with_counter(mut self, requests: IntCounterVec) -> Self {
        self.requests = Some(requests);
        self
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    fn count(&self, outcome: &str) {
        if let Some(requests) = &self.requests {
            requests.with_label_values(&[outcome]).inc();
        }
    }
}

#[async_trait]
impl Geocoder for CachedGeocoder {
    async fn geocode(&self, address: &str) -> Option<GeoPoint> {
        let key = cache_key(address);
        if key.is_empty() {
            return None;
        }

        if let Some(point) = self.cache.get(&key) {
            self.count("hit");
            return Some(*point);
        }

        match self.inner.geocode(address.trim()).await {
            Some(point) => {
                self.count("miss");
                self.cache.insert(key, point);
                Some(point)
            }
            None => {
                self.count("failed");
                None
            }
        }
    }
}

#[derive(Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
}

/// Spaces request starts at least `delay` apart across every caller sharing
/// it. The lock is held while waiting, so concurrent callers queue up.
pub struct RequestSpacing {
    delay: Duration,
    last: Mutex<Option<Instant>>,
}

impl RequestSpacing {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            tokio::time::sleep_until(previous + self.delay).await;
        }
        *last = Some(Instant::now());
    }
}

/// OpenStreetMap Nominatim search, kept under the public instance's
/// one-request-per-second policy.
pub struct NominatimGeocoder {
    client: reqwest::Client,
    base_url: String,
    spacing: RequestSpacing,
}

impl NominatimGeocoder {
    pub fn new(base_url: impl Into<String>, delay: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            spacing: RequestSpacing::new(delay),
        }
    }

    async fn search(&self, address: &str) -> Result<Option<GeoPoint>, reqwest::Error> {
        self.spacing.wait_turn().await;

        let places: Vec<NominatimPlace> = self
            .client
            .get(format!("{}/search", self.base_url))
            .query(&[("format", "json"), ("q", address), ("limit", "1")])
            .header("User-Agent", "DeliveryApp/1.0")
            .header("Accept-Language", "es,en")
            .timeout(Duration::from_secs(10))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(places.into_iter().next().and_then(|place| {
            let lat = place.lat.parse::<f64>().ok()?;
            let lng = place.lon.parse::<f64>().ok()?;
            Some(GeoPoint { lat, lng })
        }))
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, address: &str) -> Option<GeoPoint> {
        match self.search(address).await {
            Ok(Some(point)) => {
                debug!(address, lat = point.lat, lng = point.lng, "address geocoded");
                Some(point)
            }
            Ok(None) => {
                warn!(address, "geocoder returned no results");
                None
            }
            Err(err) => {
                warn!(address, error = %err, "geocoding request failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingGeocoder {
        calls: AtomicUsize,
        result: Option<GeoPoint>,
    }

    #[async_trait]
    impl Geocoder for CountingGeocoder {
        async fn geocode(&self, _address: &str) -> Option<GeoPoint> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result
        }
    }

    #[test]
    fn cache_key_ignores_case_and_spacing() {
        assert_eq!(
            cache_key("  Av. Providencia   1234 "),
            cache_key("av. providencia 1234")
        );
    }

    #[tokio::test]
    async fn repeated_lookups_hit_the_cache() {
        let inner = Arc::new(CountingGeocoder {
            calls: AtomicUsize::new(0),
            result: Some(GeoPoint {
                lat: -33.42,
                lng: -70.61,
            }),
        });
        let cached = CachedGeocoder::new(inner.clone());

        assert!(cached.geocode("Av. Providencia 1234").await.is_some());
        assert!(cached.geocode("AV. PROVIDENCIA  1234").await.is_some());

        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cached.cached(), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let inner = Arc::new(CountingGeocoder {
            calls: AtomicUsize::new(0),
            result: None,
        });
        let cached = CachedGeocoder::new(inner.clone());

        assert!(cached.geocode("Calle Falsa 123").await.is_none());
        assert!(cached.geocode("Calle Falsa 123").await.is_none());

        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cached.cached(), 0);
    }

    #[tokio::test]
    async fn blank_address_never_reaches_backend() {
        let inner = Arc::new(CountingGeocoder {
            calls: AtomicUsize::new(0),
            result: None,
        });
        let cached = CachedGeocoder::new(inner.clone());

        assert!(cached.geocode("   ").await.is_none());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_are_spaced_apart() {
        let spacing = Arc::new(RequestSpacing::new(Duration::from_millis(1_000)));
        let started = Instant::now();

        let waits: Vec<_> = (0..3)
            .map(|_| {
                let spacing = spacing.clone();
                tokio::spawn(async move {
                    spacing.wait_turn().await;
                    Instant::now()
                })
            })
            .collect();

        let mut starts = Vec::new();
        for wait in waits {
            starts.push(wait.await.unwrap());
        }
        starts.sort();

        assert_eq!(starts[0], started);
        assert!(starts[1] - starts[0] >= Duration::from_millis(1_000));
        assert!(starts[2] - starts[1] >= Duration::from_millis(1_000));
        assert!(started.elapsed() >= Duration::from_millis(2_000));
    }
}
