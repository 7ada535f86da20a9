//! Canonical `shortlink_cqrs_outbox_{forwarded,failed}_total` counters (C10),
//! tagged by `forwarder_name` per §6's label-set table.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};

static FORWARDED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "shortlink_cqrs_outbox_forwarded_total",
        "Total number of outbox rows successfully re-published to the real transport",
        &["forwarder_name"]
    )
    .expect("failed to register shortlink_cqrs_outbox_forwarded_total")
});

static FAILED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "shortlink_cqrs_outbox_failed_total",
        "Total number of outbox re-publish attempts that failed",
        &["forwarder_name"]
    )
    .expect("failed to register shortlink_cqrs_outbox_failed_total")
});

static EXPIRED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "shortlink_cqrs_outbox_expired_total",
        "Total number of outbox rows discarded for exceeding max age or max retries",
        &["forwarder_name"]
    )
    .expect("failed to register shortlink_cqrs_outbox_expired_total")
});

#[derive(Clone)]
pub struct ForwarderMetrics {
    forwarder_name: String,
}

impl ForwarderMetrics {
    pub fn new(forwarder_name: impl Into<String>) -> Self {
        Self {
            forwarder_name: forwarder_name.into(),
        }
    }

    pub fn record_forwarded(&self) {
        FORWARDED_TOTAL.with_label_values(&[&self.forwarder_name]).inc();
    }

    pub fn record_failed(&self) {
        FAILED_TOTAL.with_label_values(&[&self.forwarder_name]).inc();
    }

    pub fn record_expired(&self) {
        EXPIRED_TOTAL.with_label_values(&[&self.forwarder_name]).inc();
    }
}
