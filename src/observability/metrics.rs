use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub order_transitions_total: IntCounterVec,
    pub order_accepts_total: IntCounterVec,
    pub orders_reverted_total: IntCounter,
    pub order_syncs_total: IntCounterVec,
    pub order_sync_latency_seconds: HistogramVec,
    pub geocode_requests_total: IntCounterVec,
    pub non_critical_failures_total: IntCounterVec,
    pub orders_visible: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let order_transitions_total = IntCounterVec::new(
            Opts::new("order_transitions_total", "Status transitions by target and outcome"),
            &["to", "outcome"],
        )
        .expect("valid order_transitions_total metric");

        let order_accepts_total = IntCounterVec::new(
            Opts::new("order_accepts_total", "Order acceptance attempts by outcome"),
            &["outcome"],
        )
        .expect("valid order_accepts_total metric");

        let orders_reverted_total = IntCounter::new(
            "orders_reverted_total",
            "Stale assignments reverted to pending",
        )
        .expect("valid orders_reverted_total metric");

        let order_syncs_total = IntCounterVec::new(
            Opts::new("order_syncs_total", "Order list refetches by outcome"),
            &["outcome"],
        )
        .expect("valid order_syncs_total metric");

        let order_sync_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "order_sync_latency_seconds",
                "Latency of order refetch plus proximity filtering in seconds",
            ),
            &["outcome"],
        )
        .expect("valid order_sync_latency_seconds metric");

        let geocode_requests_total = IntCounterVec::new(
            Opts::new("geocode_requests_total", "Geocoding lookups by outcome"),
            &["outcome"],
        )
        .expect("valid geocode_requests_total metric");

        let non_critical_failures_total = IntCounterVec::new(
            Opts::new(
                "non_critical_failures_total",
                "Best-effort writes that failed after a successful primary write",
            ),
            &["kind"],
        )
        .expect("valid non_critical_failures_total metric");

        let orders_visible = IntGauge::new("orders_visible", "Orders in the last exposed snapshot")
            .expect("valid orders_visible metric");

        registry
            .register(Box::new(order_transitions_total.clone()))
            .expect("register order_transitions_total");
        registry
            .register(Box::new(order_accepts_total.clone()))
            .expect("register order_accepts_total");
        registry
            .register(Box::new(orders_reverted_total.clone()))
            .expect("register orders_reverted_total");
        registry
            .register(Box::new(order_syncs_total.clone()))
            .expect("register order_syncs_total");
        registry
            .register(Box::new(order_sync_latency_seconds.clone()))
            .expect("register order_sync_latency_seconds");
        registry
            .register(Box::new(geocode_requests_total.clone()))
            .expect("register geocode_requests_total");
        registry
            .register(Box::new(non_critical_failures_total.clone()))
            .expect("register non_critical_failures_total");
        registry
            .register(Box::new(orders_visible.clone()))
            .expect("register orders_visible");

        Self {
            registry,
            order_transitions_total,
            order_accepts_total,
            orders_reverted_total,
            order_syncs_total,
            order_sync_latency_seconds,
            geocode_requests_total,
            non_critical_failures_total,
            orders_visible,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
