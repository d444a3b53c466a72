use anyhow::{Context, Result};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

const NAMESPACE: &str = "webhook_batcher";

/// Prometheus metrics for ingestion, flushing and delivery.
pub struct Metrics {
    registry: Registry,

    /// Payloads accepted by the ingestion endpoint.
    pub payloads_received: Counter,
    /// Request bodies that failed to deserialize.
    pub payloads_rejected: Counter,
    /// Payloads currently waiting in the buffer.
    pub buffered_payloads: Gauge,
    /// Flushes that captured a batch, by trigger (size/interval).
    pub batches_flushed: CounterVec,
    /// Delivery attempts by outcome (success/failure).
    pub delivery_attempts: CounterVec,
    /// Batches dropped before any delivery attempt.
    pub batches_abandoned: Counter,
    /// Batches that exhausted every delivery attempt.
    pub batches_failed: Counter,
    /// Duration of a single delivery attempt.
    pub delivery_duration: Histogram,
    /// Number of payloads per flushed batch.
    pub batch_size: Histogram,
}

impl Metrics {
    /// Creates the metric set on a fresh registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let payloads_received = Counter::with_opts(
            Opts::new(
                "payloads_received_total",
                "Payloads accepted by the ingestion endpoint.",
            )
            .namespace(NAMESPACE),
        )?;
        let payloads_rejected = Counter::with_opts(
            Opts::new(
                "payloads_rejected_total",
                "Request bodies that failed to deserialize.",
            )
            .namespace(NAMESPACE),
        )?;
        let buffered_payloads = Gauge::with_opts(
            Opts::new("buffered_payloads", "Payloads waiting in the buffer.").namespace(NAMESPACE),
        )?;
        let batches_flushed = CounterVec::new(
            Opts::new(
                "batches_flushed_total",
                "Flushes that captured a non-empty batch, by trigger.",
            )
            .namespace(NAMESPACE),
            &["trigger"],
        )?;
        let delivery_attempts = CounterVec::new(
            Opts::new(
                "delivery_attempts_total",
                "Batch delivery attempts by outcome.",
            )
            .namespace(NAMESPACE),
            &["outcome"],
        )?;
        let batches_abandoned = Counter::with_opts(
            Opts::new(
                "batches_abandoned_total",
                "Batches dropped before any delivery attempt.",
            )
            .namespace(NAMESPACE),
        )?;
        let batches_failed = Counter::with_opts(
            Opts::new(
                "batches_failed_total",
                "Batches that exhausted every delivery attempt.",
            )
            .namespace(NAMESPACE),
        )?;
        let delivery_duration = Histogram::with_opts(
            HistogramOpts::new(
                "delivery_duration_seconds",
                "Duration of a single batch delivery attempt.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        let batch_size = Histogram::with_opts(
            HistogramOpts::new("batch_size", "Number of payloads per flushed batch.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]),
        )?;

        registry.register(Box::new(payloads_received.clone()))?;
        registry.register(Box::new(payloads_rejected.clone()))?;
        registry.register(Box::new(buffered_payloads.clone()))?;
        registry.register(Box::new(batches_flushed.clone()))?;
        registry.register(Box::new(delivery_attempts.clone()))?;
        registry.register(Box::new(batches_abandoned.clone()))?;
        registry.register(Box::new(batches_failed.clone()))?;
        registry.register(Box::new(delivery_duration.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;

        Ok(Self {
            registry,
            payloads_received,
            payloads_rejected,
            buffered_payloads,
            batches_flushed,
            delivery_attempts,
            batches_abandoned,
            batches_failed,
            delivery_duration,
            batch_size,
        })
    }

    /// Renders every registered metric in Prometheus text format.
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("encoding metrics")?;

        String::from_utf8(buffer).context("converting metrics to string")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_text_contains_namespace() {
        let metrics = Metrics::new().expect("metrics");
        metrics.payloads_received.inc();
        metrics
            .batches_flushed
            .with_label_values(&["size"])
            .inc_by(2.0);

        let text = metrics.encode_text().expect("encode");
        assert!(text.contains("webhook_batcher_payloads_received_total 1"));
        assert!(text.contains("webhook_batcher_batches_flushed_total{trigger=\"size\"} 2"));
    }

    #[test]
    fn test_independent_registries() {
        let a = Metrics::new().expect("metrics a");
        let b = Metrics::new().expect("metrics b");
        a.payloads_rejected.inc();
        assert_eq!(a.payloads_rejected.get(), 1.0);
        assert_eq!(b.payloads_rejected.get(), 0.0);
    }
}
