//! Prometheus metrics for job coordination
//!
//! This module provides metrics tracking for:
//! - Sharding: resharding passes, items rewritten, leadership per job
//! - Failover: records queued and claimed
//! - Execution: items executed by source, misfires recorded
//! - Listeners: callback failures and missed events
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all job metrics
struct JobMetrics {
    reshardings: CounterVec,
    resharding_duration: HistogramVec,
    items_rewritten: CounterVec,
    failover_queued: CounterVec,
    failover_claimed: CounterVec,
    misfires: CounterVec,
    items_executed: CounterVec,
    item_failures: CounterVec,
    listener_errors: CounterVec,
    watch_lagged: CounterVec,
    is_leader: GaugeVec,
}

impl JobMetrics {
    fn register() -> Result<Self, prometheus::Error> {
        Ok(Self {
            reshardings: register_counter_vec!(
                "jobshard_reshardings_total",
                "Completed resharding passes",
                &["job"]
            )?,
            resharding_duration: register_histogram_vec!(
                "jobshard_resharding_duration_seconds",
                "Time spent in a resharding pass",
                &["job"],
                vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
            )?,
            items_rewritten: register_counter_vec!(
                "jobshard_sharding_items_rewritten_total",
                "Sharding items whose owner changed during resharding",
                &["job"]
            )?,
            failover_queued: register_counter_vec!(
                "jobshard_failover_queued_total",
                "Failover records created for crashed items",
                &["job"]
            )?,
            failover_claimed: register_counter_vec!(
                "jobshard_failover_claimed_total",
                "Failover records claimed by this process",
                &["job"]
            )?,
            misfires: register_counter_vec!(
                "jobshard_misfires_total",
                "Misfire markers recorded",
                &["job"]
            )?,
            items_executed: register_counter_vec!(
                "jobshard_items_executed_total",
                "Sharding items executed by source",
                &["job", "source"]
            )?,
            item_failures: register_counter_vec!(
                "jobshard_item_failures_total",
                "Sharding item executions that returned an error",
                &["job"]
            )?,
            listener_errors: register_counter_vec!(
                "jobshard_listener_errors_total",
                "Listener actions that failed",
                &["job", "action"]
            )?,
            watch_lagged: register_counter_vec!(
                "jobshard_watch_lagged_events_total",
                "Registry events dropped because the listener fell behind",
                &["job"]
            )?,
            is_leader: register_gauge_vec!(
                "jobshard_is_leader",
                "Whether this process is the job leader (1 = yes, 0 = no)",
                &["job"]
            )?,
        })
    }
}

/// Global storage for job metrics; `None` when registration failed
static JOB_METRICS: OnceLock<Option<JobMetrics>> = OnceLock::new();

fn metrics() -> Option<&'static JobMetrics> {
    JOB_METRICS.get().and_then(Option::as_ref)
}

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Safe to call more than once; only the first call registers. If
/// registration fails the error is logged and metric operations stay no-ops.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = jobshard::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    let registered = JOB_METRICS.get_or_init(|| match JobMetrics::register() {
        Ok(m) => {
            tracing::info!("Prometheus metrics initialized successfully");
            Some(m)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Prometheus metrics registration failed");
            None
        }
    });

    if registered.is_some() {
        Ok(())
    } else {
        Err("Metrics registration failed".into())
    }
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    metrics().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Render all registered metrics in the Prometheus text format
pub fn gather_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a completed resharding pass
pub fn record_resharding(job: &str, items_rewritten: usize, duration_secs: f64) {
    let Some(m) = metrics() else {
        return;
    };

    m.reshardings.with_label_values(&[job]).inc();
    m.resharding_duration
        .with_label_values(&[job])
        .observe(duration_secs);
    if items_rewritten > 0 {
        m.items_rewritten
            .with_label_values(&[job])
            .inc_by(items_rewritten as f64);
    }
}

/// Record a failover record created for a crashed item
pub fn record_failover_queued(job: &str) {
    if let Some(m) = metrics() {
        m.failover_queued.with_label_values(&[job]).inc();
    }
}

/// Record failover records claimed by this process
pub fn record_failover_claimed(job: &str, count: usize) {
    if let Some(m) = metrics() {
        m.failover_claimed
            .with_label_values(&[job])
            .inc_by(count as f64);
    }
}

/// Record misfire markers
pub fn record_misfires(job: &str, count: usize) {
    if let Some(m) = metrics() {
        m.misfires.with_label_values(&[job]).inc_by(count as f64);
    }
}

/// Record executed items and how many of them failed
pub fn record_items_executed(job: &str, source: &str, executed: usize, failed: usize) {
    let Some(m) = metrics() else {
        return;
    };

    m.items_executed
        .with_label_values(&[job, source])
        .inc_by(executed as f64);
    if failed > 0 {
        m.item_failures
            .with_label_values(&[job])
            .inc_by(failed as f64);
    }
}

/// Record a failed listener action
pub fn record_listener_error(job: &str, action: &str) {
    if let Some(m) = metrics() {
        m.listener_errors.with_label_values(&[job, action]).inc();
    }
}

/// Record registry events missed by a lagging listener
pub fn record_watch_lagged(job: &str, missed: u64) {
    if let Some(m) = metrics() {
        m.watch_lagged
            .with_label_values(&[job])
            .inc_by(missed as f64);
    }
}

/// Update the leadership gauge for a job
pub fn set_leader(job: &str, is_leader: bool) {
    if let Some(m) = metrics() {
        m.is_leader
            .with_label_values(&[job])
            .set(if is_leader { 1.0 } else { 0.0 });
    }
}

// ============================================================================
// Tests
// ============================================================================
