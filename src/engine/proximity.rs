use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::geo::geocoder::{cache_key, Geocoder};
use crate::geo::{haversine_km, GeoPoint};
use crate::models::order::{Order, OrderStatus};

/// Narrows the synced order list to what the driver should see: pending
/// orders of other drivers are kept only inside the radius, own orders
/// always stay, and anything whose address cannot be resolved stays too.
pub struct ProximityFilter {
    geocoder: Arc<dyn Geocoder>,
    radius_km: f64,
}

impl ProximityFilter {
    pub fn new(geocoder: Arc<dyn Geocoder>, radius_km: f64) -> Self {
        Self {
            geocoder,
            radius_km,
        }
    }

    pub fn radius_km(&self) -> f64 {
        self.radius_km
    }

    fn is_candidate(order: &Order, driver_id: i64) -> bool {
        order.status == OrderStatus::Pending && !order.is_owned_by(driver_id)
    }

    /// Annotates distances and drops out-of-radius pending orders. Without a
    /// fix the list passes through unfiltered.
    pub async fn apply(&self, orders: Vec<Order>, driver_id: i64, fix: Option<GeoPoint>) -> Vec<Order> {
        let Some(fix) = fix else {
            return orders;
        };

        let mut resolved: HashMap<String, Option<GeoPoint>> = HashMap::new();
        for order in orders.iter().filter(|o| Self::is_candidate(o, driver_id)) {
            let key = cache_key(order.proximity_address());
            if resolved.contains_key(&key) {
                continue;
            }
            let point = self.geocoder.geocode(order.proximity_address()).await;
            resolved.insert(key, point);
        }

        let total = orders.len();
        let visible: Vec<Order> = orders
            .into_iter()
            .map(|order| self.annotate(order, driver_id, &fix, &resolved))
            .filter(|order| order.is_owned_by(driver_id) || order.within_radius)
            .collect();

        debug!(
            total,
            visible = visible.len(),
            radius_km = self.radius_km,
            "proximity filter applied"
        );
        visible
    }

    fn annotate(
        &self,
        mut order: Order,
        driver_id: i64,
        fix: &GeoPoint,
        resolved: &HashMap<String, Option<GeoPoint>>,
    ) -> Order {
        if !Self::is_candidate(&order, driver_id) {
            order.distance_km = None;
            order.within_radius = true;
            return order;
        }

        match resolved
            .get(&cache_key(order.proximity_address()))
            .copied()
            .flatten()
        {
            Some(point) => {
                let distance = haversine_km(fix, &point);
                order.distance_km = Some(distance);
                order.within_radius = distance <= self.radius_km;
            }
            None => {
                order.distance_km = None;
                order.within_radius = true;
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::store::memory::fixtures::order;

    const DRIVER: i64 = 7;

    const FIX: GeoPoint = GeoPoint {
        lat: -33.4489,
        lng: -70.6693,
    };

    /// Resolves "near" addresses ~1 km away and "far" ones ~50 km away.
    struct TableGeocoder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Geocoder for TableGeocoder {
        async fn geocode(&self, address: &str) -> Option<GeoPoint> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if address.starts_with("near") {
                Some(GeoPoint {
                    lat: FIX.lat + 0.009,
                    lng: FIX.lng,
                })
            } else if address.starts_with("far") {
                Some(GeoPoint {
                    lat: FIX.lat + 0.45,
                    lng: FIX.lng,
                })
            } else {
                None
            }
        }
    }

    fn filter() -> (ProximityFilter, Arc<TableGeocoder>) {
        let geocoder = Arc::new(TableGeocoder {
            calls: AtomicUsize::new(0),
        });
        (ProximityFilter::new(geocoder.clone(), 5.0), geocoder)
    }

    fn at(id: i64, status: OrderStatus, driver_id: Option<i64>, address: &str) -> Order {
        let mut o = order(id, status, driver_id);
        o.local_address = address.to_string();
        o
    }

    #[tokio::test]
    async fn keeps_near_and_drops_far_pending_orders() {
        let (filter, _) = filter();
        let orders = vec![
            at(1, OrderStatus::Pending, None, "near Local"),
            at(2, OrderStatus::Pending, None, "far Local"),
        ];

        let visible = filter.apply(orders, DRIVER, Some(FIX)).await;

        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].db_id, 1);
        assert!(visible[0].within_radius);
        let distance = visible[0].distance_km.unwrap();
        assert!(distance > 0.5 && distance < 1.5);
    }

    #[tokio::test]
    async fn unresolvable_address_fails_open() {
        let (filter, _) = filter();
        let orders = vec![at(1, OrderStatus::Pending, None, "somewhere unknown")];

        let visible = filter.apply(orders, DRIVER, Some(FIX)).await;

        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].distance_km, None);
        assert!(visible[0].within_radius);
    }

    #[tokio::test]
    async fn own_orders_bypass_distance() {
        let (filter, geocoder) = filter();
        let orders = vec![
            at(1, OrderStatus::Assigned, Some(DRIVER), "far Local"),
            at(2, OrderStatus::Pending, Some(DRIVER), "far Local"),
        ];

        let visible = filter.apply(orders, DRIVER, Some(FIX)).await;

        assert_eq!(visible.len(), 2);
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shared_addresses_are_geocoded_once_per_pass() {
        let (filter, geocoder) = filter();
        let orders = vec![
            at(1, OrderStatus::Pending, None, "near Local"),
            at(2, OrderStatus::Pending, None, "NEAR   local"),
        ];

        let visible = filter.apply(orders, DRIVER, Some(FIX)).await;

        assert_eq!(visible.len(), 2);
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn without_fix_nothing_is_filtered() {
        let (filter, geocoder) = filter();
        let orders = vec![at(1, OrderStatus::Pending, None, "far Local")];

        let visible = filter.apply(orders, DRIVER, None).await;

        assert_eq!(visible.len(), 1);
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 0);
    }
}
