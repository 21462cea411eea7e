use log::info;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::flow::FlowType;
use crate::validator::ValidationOutcome;

/// Running totals of record validation, reset only by a restart.
#[derive(Debug, Default)]
pub struct ValidationStats {
    total: AtomicU64,
    valid: AtomicU64,
    invalid: AtomicU64,
}

impl ValidationStats {
    pub fn record(&self, outcome: &ValidationOutcome) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if outcome.valid {
            self.valid.fetch_add(1, Ordering::Relaxed);
        } else {
            self.invalid.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn valid(&self) -> u64 {
        self.valid.load(Ordering::Relaxed)
    }

    pub fn invalid(&self) -> u64 {
        self.invalid.load(Ordering::Relaxed)
    }

    /// Share of valid records in percent, 100 when nothing was seen yet.
    pub fn valid_percentage(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 100.0;
        }
        self.valid() as f64 * 100.0 / total as f64
    }
}

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub datagrams_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub datagrams_dropped: AtomicU64,
    pub datagrams_oversized: AtomicU64,
    pub netflow5_packets: AtomicU64,
    pub netflow9_packets: AtomicU64,
    pub ipfix_packets: AtomicU64,
    pub sflow_packets: AtomicU64,
    pub malformed_packets: AtomicU64,
    pub missing_templates: AtomicU64,
    pub truncated_records: AtomicU64,
    pub netflow5_records_over_cap: AtomicU64,
    pub templates_learned: AtomicU64,
    pub templates_rejected: AtomicU64,
    pub templates_evicted: AtomicU64,
    pub option_records: AtomicU64,
    pub records_decoded: AtomicU64,
    pub worker_errors: AtomicU64,
    pub sink_records_dropped: AtomicU64,
    pub sink_batches_written: AtomicU64,
    pub sink_batches_failed: AtomicU64,
    pub records_persisted: AtomicU64,
    pub records_lost: AtomicU64,
    pub forward_jobs_dropped: AtomicU64,
    pub forwards_sent: AtomicU64,
    pub forwards_failed: AtomicU64,
    pub validation: ValidationStats,
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl PipelineMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn packet_decoded(&self, flow_type: FlowType) {
        let counter = match flow_type {
            FlowType::Netflow5 => &self.netflow5_packets,
            FlowType::Netflow9 => &self.netflow9_packets,
            FlowType::Ipfix => &self.ipfix_packets,
            FlowType::Sflow5 => &self.sflow_packets,
        };
        bump(counter, 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            datagrams_received: load(&self.datagrams_received),
            bytes_received: load(&self.bytes_received),
            datagrams_dropped: load(&self.datagrams_dropped),
            datagrams_oversized: load(&self.datagrams_oversized),
            netflow5_packets: load(&self.netflow5_packets),
            netflow9_packets: load(&self.netflow9_packets),
            ipfix_packets: load(&self.ipfix_packets),
            sflow_packets: load(&self.sflow_packets),
            malformed_packets: load(&self.malformed_packets),
            missing_templates: load(&self.missing_templates),
            truncated_records: load(&self.truncated_records),
            netflow5_records_over_cap: load(&self.netflow5_records_over_cap),
            templates_learned: load(&self.templates_learned),
            templates_rejected: load(&self.templates_rejected),
            templates_evicted: load(&self.templates_evicted),
            option_records: load(&self.option_records),
            records_decoded: load(&self.records_decoded),
            worker_errors: load(&self.worker_errors),
            sink_records_dropped: load(&self.sink_records_dropped),
            sink_batches_written: load(&self.sink_batches_written),
            sink_batches_failed: load(&self.sink_batches_failed),
            records_persisted: load(&self.records_persisted),
            records_lost: load(&self.records_lost),
            forward_jobs_dropped: load(&self.forward_jobs_dropped),
            forwards_sent: load(&self.forwards_sent),
            forwards_failed: load(&self.forwards_failed),
            validation_total: self.validation.total(),
            validation_valid: self.validation.valid(),
            validation_invalid: self.validation.invalid(),
            validation_valid_percentage: self.validation.valid_percentage(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub datagrams_received: u64,
    pub bytes_received: u64,
    pub datagrams_dropped: u64,
    pub datagrams_oversized: u64,
    pub netflow5_packets: u64,
    pub netflow9_packets: u64,
    pub ipfix_packets: u64,
    pub sflow_packets: u64,
    pub malformed_packets: u64,
    pub missing_templates: u64,
    pub truncated_records: u64,
    pub netflow5_records_over_cap: u64,
    pub templates_learned: u64,
    pub templates_rejected: u64,
    pub templates_evicted: u64,
    pub option_records: u64,
    pub records_decoded: u64,
    pub worker_errors: u64,
    pub sink_records_dropped: u64,
    pub sink_batches_written: u64,
    pub sink_batches_failed: u64,
    pub records_persisted: u64,
    pub records_lost: u64,
    pub forward_jobs_dropped: u64,
    pub forwards_sent: u64,
    pub forwards_failed: u64,
    pub validation_total: u64,
    pub validation_valid: u64,
    pub validation_invalid: u64,
    pub validation_valid_percentage: f64,
}

/// Logs a counter summary every `period` until `stop` fires.
pub async fn run_reporter(metrics: Arc<PipelineMetrics>, period: Duration, stop: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut last_received = 0;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let snapshot = metrics.snapshot();
        let rate = (snapshot.datagrams_received - last_received) / period.as_secs().max(1);
        last_received = snapshot.datagrams_received;

        info!(
            "Receiving {} datagrams per second (received: {}, dropped: {}, malformed: {}, missing templates: {}, records: {}, valid: {:.2}%)",
            rate,
            snapshot.datagrams_received,
            snapshot.datagrams_dropped,
            snapshot.malformed_packets,
            snapshot.missing_templates,
            snapshot.records_decoded,
            snapshot.validation_valid_percentage,
        );
        match serde_json::to_string(&snapshot) {
            Ok(s) => log::debug!("metrics snapshot: {}", s),
            Err(e) => log::debug!("unable to serialize metrics snapshot: {}", e),
        }
    }

    info!("Closing metrics reporter...");
}
