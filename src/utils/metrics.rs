//! Prometheus metrics for gradient synchronisation.
//!
//! Provides gradient norm, clipping and collective-communication metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global metrics registry
static REGISTRY: OnceLock<MetricsRegistry> = OnceLock::new();

/// Collection of all gradient-sync metrics
pub struct MetricsRegistry {
    pub registry: Registry,

    // Gradient metrics
    pub gradient_norm: Histogram,
    pub clip_coefficient: Gauge,
    pub clipped_steps: Counter,

    // Bucketed all-reduce
    pub buckets_flushed: Counter,
    pub bytes_reduced: Counter,

    // Collectives, labelled by group ("tp", "pp", "dp", "world", "sharded")
    pub collective_calls: CounterVec,
    pub communication_time: HistogramVec,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let gradient_norm = Histogram::with_opts(
            HistogramOpts::new("spmd_gradient_norm", "Global gradient norm before clipping")
                .buckets(vec![0.001, 0.01, 0.1, 1.0, 10.0, 100.0, 1000.0])
        )?;
        registry.register(Box::new(gradient_norm.clone()))?;

        let clip_coefficient = Gauge::with_opts(
            Opts::new("spmd_clip_coefficient", "Last clip coefficient applied (1.0 = unclipped)")
        )?;
        registry.register(Box::new(clip_coefficient.clone()))?;

        let clipped_steps = Counter::with_opts(
            Opts::new("spmd_clipped_steps_total", "Clip calls that scaled gradients down")
        )?;
        registry.register(Box::new(clipped_steps.clone()))?;

        let buckets_flushed = Counter::with_opts(
            Opts::new("spmd_allreduce_buckets_total", "Gradient buckets flushed to all-reduce")
        )?;
        registry.register(Box::new(buckets_flushed.clone()))?;

        let bytes_reduced = Counter::with_opts(
            Opts::new("spmd_allreduce_bytes_total", "Gradient bytes sent through bucketed all-reduce")
        )?;
        registry.register(Box::new(bytes_reduced.clone()))?;

        let collective_calls = CounterVec::new(
            Opts::new("spmd_collective_calls_total", "Collective calls per process group"),
            &["group"]
        )?;
        registry.register(Box::new(collective_calls.clone()))?;

        let communication_time = HistogramVec::new(
            HistogramOpts::new("spmd_communication_seconds", "Time spent in collective communications")
                .buckets(vec![0.0001, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["group"]
        )?;
        registry.register(Box::new(communication_time.clone()))?;

        Ok(Self {
            registry,
            gradient_norm,
            clip_coefficient,
            clipped_steps,
            buckets_flushed,
            bytes_reduced,
            collective_calls,
            communication_time,
        })
    }

    /// Gather all metrics as Prometheus text format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Get the global metrics registry.
///
/// `None` only if registration failed, in which case recording is a no-op.
pub fn get_metrics() -> Option<&'static MetricsRegistry> {
    if let Some(m) = REGISTRY.get() {
        return Some(m);
    }
    let m = MetricsRegistry::new().ok()?;
    Some(REGISTRY.get_or_init(|| m))
}

pub fn record_grad_norm(norm: f64) {
    if let Some(m) = get_metrics() {
        if norm.is_finite() {
            m.gradient_norm.observe(norm);
        }
    }
}

pub fn record_clip_coefficient(coeff: f64) {
    if let Some(m) = get_metrics() {
        m.clip_coefficient.set(coeff);
        if coeff < 1.0 {
            m.clipped_steps.inc();
        }
    }
}

pub fn record_bucket_flush(bytes: usize) {
    if let Some(m) = get_metrics() {
        m.buckets_flushed.inc();
        m.bytes_reduced.inc_by(bytes as f64);
    }
}

/// Record one collective on `group` and how long it blocked.
pub fn record_collective(group: &str, duration_secs: f64) {
    if let Some(m) = get_metrics() {
        m.collective_calls.with_label_values(&[group]).inc();
        m.communication_time.with_label_values(&[group]).observe(duration_secs);
    }
}
