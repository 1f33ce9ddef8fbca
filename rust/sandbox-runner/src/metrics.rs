use anyhow::{Context, Result};
use prometheus::{
    register_gauge, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge_vec, Encoder, Gauge, Histogram, IntCounter, IntCounterVec, IntGaugeVec,
    TextEncoder,
};
use std::sync::OnceLock;

use crate::pool::PoolStats;

// Pool metrics
pub static POOL_VMS: OnceLock<IntGaugeVec> = OnceLock::new(); // labels: state
pub static POOL_TARGET_SIZE: OnceLock<Gauge> = OnceLock::new();
pub static POOL_CLAIMS: OnceLock<IntCounterVec> = OnceLock::new(); // labels: outcome
pub static POOL_CLAIM_TAG_FAILURES: OnceLock<IntCounter> = OnceLock::new();
pub static POOL_CREATIONS: OnceLock<IntCounterVec> = OnceLock::new(); // labels: outcome
pub static POOL_RECOVERED: OnceLock<IntCounter> = OnceLock::new();

// Balloon metrics
pub static BALLOON_ADJUSTMENTS: OnceLock<IntCounterVec> = OnceLock::new(); // labels: direction
pub static BALLOON_ERRORS: OnceLock<IntCounterVec> = OnceLock::new(); // labels: stage
pub static BALLOON_MANAGED_VMS: OnceLock<Gauge> = OnceLock::new();

// Stats store / snapshot metrics
pub static STATS_DROPPED: OnceLock<IntCounter> = OnceLock::new();
pub static SNAPSHOT_LOCK_WAIT: OnceLock<Histogram> = OnceLock::new();

static INIT_RESULT: OnceLock<Result<()>> = OnceLock::new();

/// Register all runner metrics with the default registry. Safe to call repeatedly.
pub fn init_metrics() -> Result<()> {
    match INIT_RESULT.get_or_init(init_metrics_internal) {
        Ok(()) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("Metrics initialization failed: {}", e)),
    }
}

fn init_metrics_internal() -> Result<()> {
    let pool_vms = register_int_gauge_vec!(
        "runner_pool_vms",
        "Pool VMs by lifecycle state",
        &["state"]
    )
    .context("Failed to register POOL_VMS metric")?;

    let pool_target_size = register_gauge!("runner_pool_target_size", "Configured pool size")
        .context("Failed to register POOL_TARGET_SIZE metric")?;

    let pool_claims = register_int_counter_vec!(
        "runner_pool_claims_total",
        "Claim attempts against the warm pool",
        &["outcome"]
    )
    .context("Failed to register POOL_CLAIMS metric")?;

    let pool_claim_tag_failures = register_int_counter!(
        "runner_pool_claim_tag_failures_total",
        "Claimed VMs whose sandbox metadata could not be written"
    )
    .context("Failed to register POOL_CLAIM_TAG_FAILURES metric")?;

    let pool_creations = register_int_counter_vec!(
        "runner_pool_creations_total",
        "Pool VM creation attempts",
        &["outcome"]
    )
    .context("Failed to register POOL_CREATIONS metric")?;

    let pool_recovered = register_int_counter!(
        "runner_pool_recovered_total",
        "Pool VMs recovered from a previous process"
    )
    .context("Failed to register POOL_RECOVERED metric")?;

    let balloon_adjustments = register_int_counter_vec!(
        "runner_balloon_adjustments_total",
        "Live memory resizes issued by the balloon controller",
        &["direction"]
    )
    .context("Failed to register BALLOON_ADJUSTMENTS metric")?;

    let balloon_errors = register_int_counter_vec!(
        "runner_balloon_errors_total",
        "Balloon controller failures",
        &["stage"]
    )
    .context("Failed to register BALLOON_ERRORS metric")?;

    let balloon_managed_vms = register_gauge!(
        "runner_balloon_managed_vms",
        "Running VMs with an active balloon driver in the last cycle"
    )
    .context("Failed to register BALLOON_MANAGED_VMS metric")?;

    let stats_dropped = register_int_counter!(
        "runner_stats_dropped_total",
        "Memory samples dropped because the write buffer was full"
    )
    .context("Failed to register STATS_DROPPED metric")?;

    let snapshot_lock_wait = register_histogram!(
        "runner_snapshot_lock_wait_seconds",
        "Time spent waiting for snapshot locks",
        vec![0.01, 0.1, 1.0, 10.0, 60.0, 300.0, 1800.0]
    )
    .context("Failed to register SNAPSHOT_LOCK_WAIT metric")?;

    let _ = POOL_VMS.set(pool_vms);
    let _ = POOL_TARGET_SIZE.set(pool_target_size);
    let _ = POOL_CLAIMS.set(pool_claims);
    let _ = POOL_CLAIM_TAG_FAILURES.set(pool_claim_tag_failures);
    let _ = POOL_CREATIONS.set(pool_creations);
    let _ = POOL_RECOVERED.set(pool_recovered);
    let _ = BALLOON_ADJUSTMENTS.set(balloon_adjustments);
    let _ = BALLOON_ERRORS.set(balloon_errors);
    let _ = BALLOON_MANAGED_VMS.set(balloon_managed_vms);
    let _ = STATS_DROPPED.set(stats_dropped);
    let _ = SNAPSHOT_LOCK_WAIT.set(snapshot_lock_wait);

    Ok(())
}

/// Render the default registry in the Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[allow(
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    reason = "pool sizes are tens of VMs"
)]
pub fn record_pool_stats(stats: &PoolStats) {
    if let Some(vms) = POOL_VMS.get() {
        vms.with_label_values(&["available"]).set(stats.available as i64);
        vms.with_label_values(&["claimed"]).set(stats.claimed as i64);
        vms.with_label_values(&["creating"]).set(stats.creating as i64);
    }
    if let Some(target) = POOL_TARGET_SIZE.get() {
        target.set(stats.target_size as f64);
    }
}

pub fn inc_claim(outcome: &str) {
    if let Some(claims) = POOL_CLAIMS.get() {
        claims.with_label_values(&[outcome]).inc();
    }
}

pub fn inc_claim_tag_failure() {
    if let Some(counter) = POOL_CLAIM_TAG_FAILURES.get() {
        counter.inc();
    }
}

pub fn inc_creation(outcome: &str) {
    if let Some(creations) = POOL_CREATIONS.get() {
        creations.with_label_values(&[outcome]).inc();
    }
}

pub fn inc_recovered(count: u64) {
    if let Some(counter) = POOL_RECOVERED.get() {
        counter.inc_by(count);
    }
}

pub fn inc_balloon_adjustment(direction: &str) {
    if let Some(adjustments) = BALLOON_ADJUSTMENTS.get() {
        adjustments.with_label_values(&[direction]).inc();
    }
}

pub fn inc_balloon_error(stage: &str) {
    if let Some(errors) = BALLOON_ERRORS.get() {
        errors.with_label_values(&[stage]).inc();
    }
}

#[allow(clippy::cast_precision_loss, reason = "VM counts are small")]
pub fn set_balloon_managed(count: usize) {
    if let Some(gauge) = BALLOON_MANAGED_VMS.get() {
        gauge.set(count as f64);
    }
}

pub fn inc_stats_dropped() {
    if let Some(counter) = STATS_DROPPED.get() {
        counter.inc();
    }
}

pub fn observe_lock_wait(seconds: f64) {
    if let Some(histogram) = SNAPSHOT_LOCK_WAIT.get() {
        histogram.observe(seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_gather_includes_pool_gauges() {
        init_metrics().unwrap();
        record_pool_stats(&PoolStats {
            available: 2,
            claimed: 1,
            creating: 0,
            target_size: 3,
        });
        inc_claim("hit");

        let text = gather_metrics();
        assert!(text.contains("runner_pool_vms"));
        assert!(text.contains("runner_pool_claims_total"));
    }
}
