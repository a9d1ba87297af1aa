use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

use crate::errors::Result;

const NAMESPACE: &str = "alert_sender";

/// Delivery metrics of one sender, registered on the registry it was given
#[derive(Clone)]
pub struct SenderMetrics {
    pub(crate) sent: IntCounterVec,
    pub(crate) errors: IntCounterVec,
    pub(crate) dropped: IntCounter,
    pub(crate) queue_length: IntGaugeVec,
    pub(crate) queue_capacity: IntGauge,
    pub(crate) receivers_discovered: IntGauge,
    pub(crate) latency: HistogramVec,
}

impl SenderMetrics {
    /// Create the metrics and register them on `registry`
    ///
    /// # Errors
    ///
    /// Fails if `registry` already holds metrics with the same names.
    pub fn new(registry: &Registry) -> Result<Self> {
        let metrics = Self {
            sent: IntCounterVec::new(
                Opts::new("sent_total", "Total number of alerts sent.").namespace(NAMESPACE),
                &["receiver"],
            )?,
            errors: IntCounterVec::new(
                Opts::new("errors_total", "Total number of errors sending alert notifications.")
                    .namespace(NAMESPACE),
                &["receiver"],
            )?,
            dropped: IntCounter::with_opts(
                Opts::new(
                    "dropped_total",
                    "Total number of alerts dropped due to errors, overflow or shutdown.",
                )
                .namespace(NAMESPACE),
            )?,
            queue_length: IntGaugeVec::new(
                Opts::new("queue_length", "The number of alert notifications in the queue.")
                    .namespace(NAMESPACE),
                &["group"],
            )?,
            queue_capacity: IntGauge::with_opts(
                Opts::new("queue_capacity", "The capacity of each alert notification queue.")
                    .namespace(NAMESPACE),
            )?,
            receivers_discovered: IntGauge::with_opts(
                Opts::new(
                    "receivers_discovered",
                    "The number of receivers discovered and active.",
                )
                .namespace(NAMESPACE),
            )?,
            latency: HistogramVec::new(
                HistogramOpts::new("latency_seconds", "Latency of pushes to receivers.")
                    .namespace(NAMESPACE),
                &["receiver"],
            )?,
        };

        registry.register(Box::new(metrics.sent.clone()))?;
        registry.register(Box::new(metrics.errors.clone()))?;
        registry.register(Box::new(metrics.dropped.clone()))?;
        registry.register(Box::new(metrics.queue_length.clone()))?;
        registry.register(Box::new(metrics.queue_capacity.clone()))?;
        registry.register(Box::new(metrics.receivers_discovered.clone()))?;
        registry.register(Box::new(metrics.latency.clone()))?;

        Ok(metrics)
    }

    /// Total alerts dropped so far
    pub fn dropped_total(&self) -> u64 {
        self.dropped.get()
    }
}
