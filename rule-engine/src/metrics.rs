use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

pub use telemetry::metrics::gather_metrics;

pub const ERROR_DECODE: &str = "decode";
pub const ERROR_ALERT_WRITE: &str = "alert_write";

pub struct EngineMetrics {
    pub processed: IntCounter,
    pub errors: IntCounterVec,
    pub hits: IntCounterVec,
    pub process_seconds: Histogram,
}

impl EngineMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let metrics = Self {
            processed: IntCounter::with_opts(Opts::new(
                "rule_engine_processed_total",
                "Messages processed",
            ))?,
            errors: IntCounterVec::new(
                Opts::new("rule_engine_errors_total", "Processing errors"),
                &["kind"],
            )?,
            hits: IntCounterVec::new(
                Opts::new("rule_engine_hits_total", "Rule hits"),
                &["rule_id"],
            )?,
            process_seconds: Histogram::with_opts(
                HistogramOpts::new(
                    "rule_engine_process_seconds",
                    "Processing latency seconds",
                )
                .buckets(vec![
                    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
                ]),
            )?,
        };

        registry.register(Box::new(metrics.processed.clone()))?;
        registry.register(Box::new(metrics.errors.clone()))?;
        registry.register(Box::new(metrics.hits.clone()))?;
        registry.register(Box::new(metrics.process_seconds.clone()))?;

        Ok(metrics)
    }
}
