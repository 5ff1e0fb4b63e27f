//! Prometheus counters and gauges exported on `/metrics`.
//!
//! All updates are lock-free atomic operations on process-wide statics; the
//! worker gauges are the operator-facing liveness signal (alert when any
//! `keess_workers_inactive` series is above zero).
use std::sync::LazyLock;

use prometheus::{
    IntCounter, IntCounterVec, IntGaugeVec, opts, register_int_counter, register_int_counter_vec,
    register_int_gauge_vec,
};

use crate::kinds::ManagedKind;

/// Number of resources currently visible to a poller, per kind, selector
/// ("sync" or "managed") and cluster.
pub static VISIBLE_RESOURCES: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        opts!(
            "keess_resources",
            "number of resources currently visible to a poller"
        ),
        &["kind", "selector", "cluster"]
    )
    .expect("metric keess_resources is registered once")
});

pub static POLL_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        opts!("keess_poll_errors_total", "number of failed resource lists"),
        &["kind", "cluster"]
    )
    .expect("metric keess_poll_errors_total is registered once")
});

/// Successful destination writes, split by create and update.
pub static SYNC_OPERATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        opts!(
            "keess_sync_operations_total",
            "number of successful destination writes"
        ),
        &["kind", "operation"]
    )
    .expect("metric keess_sync_operations_total is registered once")
});

pub static SYNC_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        opts!(
            "keess_sync_errors_total",
            "number of failed destination writes"
        ),
        &["kind"]
    )
    .expect("metric keess_sync_errors_total is registered once")
});

pub static SYNC_SKIPS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        opts!(
            "keess_sync_skips_total",
            "number of objects or targets skipped without a write"
        ),
        &["kind", "reason"]
    )
    .expect("metric keess_sync_skips_total is registered once")
});

pub static ORPHANS_DETECTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        opts!(
            "keess_orphans_detected_total",
            "number of replicas whose source has disappeared"
        ),
        &["kind"]
    )
    .expect("metric keess_orphans_detected_total is registered once")
});

pub static ORPHANS_REMOVED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        opts!(
            "keess_orphans_removed_total",
            "number of orphaned replicas deleted"
        ),
        &["kind"]
    )
    .expect("metric keess_orphans_removed_total is registered once")
});

pub static REAPER_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        opts!(
            "keess_reaper_errors_total",
            "number of failed orphan checks or deletions"
        ),
        &["kind"]
    )
    .expect("metric keess_reaper_errors_total is registered once")
});

/// 1 while the most recent credentials reload failed to produce a usable
/// client for the cluster, 0 otherwise.
pub static REMOTE_INIT_FAILED: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        opts!(
            "keess_remote_init_failed",
            "whether the last credentials reload failed for a remote cluster"
        ),
        &["cluster"]
    )
    .expect("metric keess_remote_init_failed is registered once")
});

pub static CREDENTIALS_RELOADS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "keess_credentials_reloads_total",
        "number of credentials file reloads"
    )
    .expect("metric keess_credentials_reloads_total is registered once")
});

pub static NAMESPACE_REFRESH_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "keess_namespace_refresh_errors_total",
        "number of failed namespace snapshot refreshes"
    )
    .expect("metric keess_namespace_refresh_errors_total is registered once")
});

pub static WORKERS_ACTIVE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        opts!("keess_workers_active", "long-lived worker tasks running"),
        &["task"]
    )
    .expect("metric keess_workers_active is registered once")
});

pub static WORKERS_INACTIVE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        opts!("keess_workers_inactive", "long-lived worker tasks that exited"),
        &["task"]
    )
    .expect("metric keess_workers_inactive is registered once")
});

/// Why an object or target was skipped without any write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// Bad sync label, missing annotation, or an unsupported kind/scope
    /// combination on the source.
    Configuration,
    /// The destination already holds an object we do not own.
    UnmanagedConflict,
    /// A listed destination namespace does not exist.
    MissingNamespace,
    /// A listed destination cluster is not in the registry.
    MissingCluster,
    /// A replica is missing its tracking annotations.
    MalformedTracking,
}

impl SkipReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::UnmanagedConflict => "unmanaged_conflict",
            Self::MissingNamespace => "missing_namespace",
            Self::MissingCluster => "missing_cluster",
            Self::MalformedTracking => "malformed_tracking",
        }
    }
}

pub fn record_skip(kind: ManagedKind, reason: SkipReason) {
    SYNC_SKIPS
        .with_label_values(&[kind.as_str(), reason.as_str()])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_gather() {
        record_skip(ManagedKind::ConfigMap, SkipReason::Configuration);
        ORPHANS_DETECTED
            .with_label_values(&[ManagedKind::Secret.as_str()])
            .inc();
        CREDENTIALS_RELOADS.inc();

        let names: Vec<_> = prometheus::gather()
            .into_iter()
            .map(|family| family.get_name().to_owned())
            .collect();
        assert!(names.contains(&"keess_sync_skips_total".to_owned()));
        assert!(names.contains(&"keess_orphans_detected_total".to_owned()));
        assert!(names.contains(&"keess_credentials_reloads_total".to_owned()));
    }
}
