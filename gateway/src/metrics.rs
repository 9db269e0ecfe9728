use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};

pub use telemetry::metrics::gather_metrics;

/// Ingest counters and latency, registered against an injected registry.
pub struct GatewayMetrics {
    pub requests: IntCounter,
    pub requests_failed: IntCounter,
    pub validation_failed: IntCounter,
    pub store_failed: IntCounter,
    pub bus_failed: IntCounter,
    pub request_seconds: Histogram,
}

impl GatewayMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let metrics = Self {
            requests: IntCounter::with_opts(Opts::new(
                "iot_controller_requests_total",
                "Total ingest requests",
            ))?,
            requests_failed: IntCounter::with_opts(Opts::new(
                "iot_controller_requests_failed_total",
                "Failed ingest requests",
            ))?,
            validation_failed: IntCounter::with_opts(Opts::new(
                "iot_controller_validation_failed_total",
                "Invalid payloads",
            ))?,
            store_failed: IntCounter::with_opts(Opts::new(
                "iot_controller_store_failed_total",
                "Event store write failures",
            ))?,
            bus_failed: IntCounter::with_opts(Opts::new(
                "iot_controller_bus_failed_total",
                "Event bus publish failures",
            ))?,
            request_seconds: Histogram::with_opts(
                HistogramOpts::new(
                    "iot_controller_request_seconds",
                    "Ingest request latency seconds",
                )
                .buckets(vec![
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                ]),
            )?,
        };

        registry.register(Box::new(metrics.requests.clone()))?;
        registry.register(Box::new(metrics.requests_failed.clone()))?;
        registry.register(Box::new(metrics.validation_failed.clone()))?;
        registry.register(Box::new(metrics.store_failed.clone()))?;
        registry.register(Box::new(metrics.bus_failed.clone()))?;
        registry.register(Box::new(metrics.request_seconds.clone()))?;

        Ok(metrics)
    }
}
