//! Listener and handler metrics.
//!
//! One [`Metrics`] registry is shared by every worker. Stats are labelled
//! vectors; each active listener resolves its labelled children once at
//! creation into a [`ListenerStats`] / [`PerHandlerStats`] struct so the hot
//! path never touches the label lookup.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Millisecond buckets for connection length.
const LENGTH_MS_BUCKETS: &[f64] = &[
    0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
    30000.0, 60000.0, 300000.0,
];

/// Per-listener stats, resolved from [`Metrics`] for one listener name.
///
/// Gauges are shared by every worker serving the listener, so they aggregate
/// across workers the same way a shared stats scope would.
#[derive(Clone)]
pub struct ListenerStats {
    pub downstream_cx_total: IntCounter,
    pub downstream_cx_active: IntGauge,
    pub downstream_cx_destroy: IntCounter,
    pub downstream_cx_length_ms: Histogram,
    pub downstream_cx_overflow: IntCounter,
    pub downstream_global_cx_overflow: IntCounter,
    pub downstream_pre_cx_active: IntGauge,
    pub downstream_pre_cx_timeout: IntCounter,
    pub no_filter_chain_match: IntCounter,
}

/// Per handler-listener pair stats (labelled by listener and worker).
#[derive(Clone)]
pub struct PerHandlerStats {
    pub downstream_cx_total: IntCounter,
    pub downstream_cx_active: IntGauge,
}

pub struct Metrics {
    registry: Registry,
    downstream_cx_total: IntCounterVec,
    downstream_cx_active: IntGaugeVec,
    downstream_cx_destroy: IntCounterVec,
    downstream_cx_length_ms: HistogramVec,
    downstream_cx_overflow: IntCounterVec,
    downstream_global_cx_overflow: IntCounterVec,
    downstream_pre_cx_active: IntGaugeVec,
    downstream_pre_cx_timeout: IntCounterVec,
    no_filter_chain_match: IntCounterVec,
    per_handler_cx_total: IntCounterVec,
    per_handler_cx_active: IntGaugeVec,
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<IntCounterVec> {
    let vec = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<IntGaugeVec> {
    let vec = IntGaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>> {
        Self::with_registry(Registry::new())
    }

    pub fn with_registry(registry: Registry) -> Result<Arc<Self>> {
        let downstream_cx_total = counter_vec(
            &registry,
            "listener_downstream_cx_total",
            "Connections accepted into a filter chain",
            &["listener"],
        )?;
        let downstream_cx_active = gauge_vec(
            &registry,
            "listener_downstream_cx_active",
            "Currently active connections",
            &["listener"],
        )?;
        let downstream_cx_destroy = counter_vec(
            &registry,
            "listener_downstream_cx_destroy",
            "Connections destroyed",
            &["listener"],
        )?;
        let downstream_cx_length_ms = HistogramVec::new(
            HistogramOpts::new(
                "listener_downstream_cx_length_ms",
                "Connection length in milliseconds",
            )
            .buckets(LENGTH_MS_BUCKETS.to_vec()),
            &["listener"],
        )?;
        registry.register(Box::new(downstream_cx_length_ms.clone()))?;
        let downstream_cx_overflow = counter_vec(
            &registry,
            "listener_downstream_cx_overflow",
            "Connections rejected by the per-listener limit",
            &["listener"],
        )?;
        let downstream_global_cx_overflow = counter_vec(
            &registry,
            "listener_downstream_global_cx_overflow",
            "Connections rejected by the global limit",
            &["listener"],
        )?;
        let downstream_pre_cx_active = gauge_vec(
            &registry,
            "listener_downstream_pre_cx_active",
            "Sockets currently running listener filters",
            &["listener"],
        )?;
        let downstream_pre_cx_timeout = counter_vec(
            &registry,
            "listener_downstream_pre_cx_timeout",
            "Sockets that timed out in listener filters",
            &["listener"],
        )?;
        let no_filter_chain_match = counter_vec(
            &registry,
            "listener_no_filter_chain_match",
            "Connections closed because no filter chain matched",
            &["listener"],
        )?;
        let per_handler_cx_total = counter_vec(
            &registry,
            "listener_worker_downstream_cx_total",
            "Connections accepted, per worker",
            &["listener", "worker"],
        )?;
        let per_handler_cx_active = gauge_vec(
            &registry,
            "listener_worker_downstream_cx_active",
            "Currently active connections, per worker",
            &["listener", "worker"],
        )?;

        Ok(Arc::new(Self {
            registry,
            downstream_cx_total,
            downstream_cx_active,
            downstream_cx_destroy,
            downstream_cx_length_ms,
            downstream_cx_overflow,
            downstream_global_cx_overflow,
            downstream_pre_cx_active,
            downstream_pre_cx_timeout,
            no_filter_chain_match,
            per_handler_cx_total,
            per_handler_cx_active,
        }))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric in the Prometheus text format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    pub fn listener_stats(&self, listener: &str) -> ListenerStats {
        ListenerStats {
            downstream_cx_total: self.downstream_cx_total.with_label_values(&[listener]),
            downstream_cx_active: self.downstream_cx_active.with_label_values(&[listener]),
            downstream_cx_destroy: self.downstream_cx_destroy.with_label_values(&[listener]),
            downstream_cx_length_ms: self.downstream_cx_length_ms.with_label_values(&[listener]),
            downstream_cx_overflow: self.downstream_cx_overflow.with_label_values(&[listener]),
            downstream_global_cx_overflow: self
                .downstream_global_cx_overflow
                .with_label_values(&[listener]),
            downstream_pre_cx_active: self.downstream_pre_cx_active.with_label_values(&[listener]),
            downstream_pre_cx_timeout: self
                .downstream_pre_cx_timeout
                .with_label_values(&[listener]),
            no_filter_chain_match: self.no_filter_chain_match.with_label_values(&[listener]),
        }
    }

    pub fn per_handler_stats(&self, listener: &str, worker: &str) -> PerHandlerStats {
        PerHandlerStats {
            downstream_cx_total: self.per_handler_cx_total.with_label_values(&[listener, worker]),
            downstream_cx_active: self
                .per_handler_cx_active
                .with_label_values(&[listener, worker]),
        }
    }
}

/// Measures one span of wall time into a histogram, in milliseconds.
pub struct Timespan {
    histogram: Histogram,
    start: Instant,
}

impl Timespan {
    pub fn new(histogram: Histogram) -> Self {
        Self {
            histogram,
            start: Instant::now(),
        }
    }

    pub fn complete(self) {
        self.histogram.observe(self.start.elapsed().as_secs_f64() * 1000.0);
    }
}
