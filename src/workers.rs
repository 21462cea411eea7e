use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use tokio::task::{self, JoinSet};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::decoder::{DecodeOutcome, DecodedPacket, Decoder};
use crate::flow::{FlowRecord, RawDatagram};
use crate::forwarder::ForwardJob;
use crate::metrics::{bump, PipelineMetrics};
use crate::queue::BoundedQueue;
use crate::validator::ValidationOutcome;

pub const DEFAULT_WORKER_COUNT: usize = 4;
pub const DEFAULT_DEQUEUE_TIMEOUT: Duration = Duration::from_millis(100);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub count: usize,
    pub dequeue_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            count: DEFAULT_WORKER_COUNT,
            dequeue_timeout: DEFAULT_DEQUEUE_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// What a single worker needs to turn one datagram into routed records.
#[derive(Clone)]
pub struct Worker {
    decoder: Decoder,
    metrics: Arc<PipelineMetrics>,
    sink: Option<Sender<Arc<FlowRecord>>>,
    forward: Option<Sender<ForwardJob>>,
}

impl Worker {
    pub fn new(decoder: Decoder, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            decoder,
            metrics,
            sink: None,
            forward: None,
        }
    }

    pub fn with_sink(mut self, sink: Sender<Arc<FlowRecord>>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_forwarder(mut self, forward: Sender<ForwardJob>) -> Self {
        self.forward = Some(forward);
        self
    }

    fn route(&self, datagram: RawDatagram, packet: DecodedPacket) -> usize {
        let m = &self.metrics;
        m.packet_decoded(packet.flow_type);
        if packet.missing_template.is_some() {
            bump(&m.missing_templates, 1);
        }
        bump(&m.truncated_records, packet.truncated_records as u64);
        bump(&m.netflow5_records_over_cap, packet.records_over_cap as u64);
        bump(&m.templates_learned, packet.templates_learned as u64);
        bump(&m.templates_rejected, packet.templates_rejected as u64);
        bump(&m.option_records, packet.option_records as u64);
        bump(&m.malformed_packets, packet.malformed_sets.min(1) as u64);
        bump(&m.records_decoded, packet.records.len() as u64);

        let ok = ValidationOutcome::ok();
        for _ in &packet.records {
            m.validation.record(&ok);
        }
        for outcome in &packet.invalid_records {
            m.validation.record(outcome);
        }

        let records: Vec<Arc<FlowRecord>> = packet.records.into_iter().map(Arc::new).collect();
        let produced = records.len();
        if records.is_empty() {
            return 0;
        }

        if let Some(sink) = &self.sink {
            for record in &records {
                match sink.try_send(record.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => bump(&m.sink_records_dropped, 1),
                    Err(TrySendError::Closed(_)) => {
                        bump(&m.worker_errors, 1);
                        warn!("persistence sink is gone, {} record(s) not stored", produced);
                        break;
                    }
                }
            }
        }

        if let Some(forward) = &self.forward {
            let job = ForwardJob {
                payload: datagram.payload,
                source: datagram.source,
                flow_type: packet.flow_type,
                records,
            };
            match forward.try_send(job) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => bump(&m.forward_jobs_dropped, 1),
                Err(TrySendError::Closed(_)) => {
                    bump(&m.worker_errors, 1);
                    warn!("forwarder is gone, datagram from {} not forwarded", datagram.source);
                }
            }
        }

        produced
    }
}

/// Turns one datagram into routed records. Called from the blocking pool.
pub trait DatagramHandler: Send + Sync + 'static {
    /// Returns the number of valid records produced.
    fn process_datagram(&self, datagram: RawDatagram) -> usize;
}

impl DatagramHandler for Worker {
    fn process_datagram(&self, datagram: RawDatagram) -> usize {
        match self.decoder.decode(&datagram) {
            DecodeOutcome::Invalid(e) => {
                bump(&self.metrics.malformed_packets, 1);
                debug!("dropping datagram from {}: {}", datagram.source, e);
                0
            }
            DecodeOutcome::Skip(reason) => {
                bump(&self.metrics.missing_templates, 1);
                debug!("skipping datagram from {}: {}", datagram.source, reason);
                0
            }
            DecodeOutcome::Ok(packet) => self.route(datagram, packet),
        }
    }
}

/// A fixed number of workers sharing one datagram queue.
///
/// Decoding runs on the blocking thread pool so a burst of expensive
/// packets cannot stall the socket readers. A panic while handling one
/// datagram is counted as a worker error and the worker moves on.
pub struct WorkerPool<H: DatagramHandler = Worker> {
    handler: Arc<H>,
    queue: Arc<BoundedQueue<RawDatagram>>,
    settings: WorkerSettings,
    metrics: Arc<PipelineMetrics>,
}

impl<H: DatagramHandler> WorkerPool<H> {
    pub fn new(
        handler: H,
        queue: Arc<BoundedQueue<RawDatagram>>,
        settings: WorkerSettings,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            handler: Arc::new(handler),
            queue,
            settings,
            metrics,
        }
    }

    /// Runs until `stop` fires, then drains what is left in the queue for
    /// at most the shutdown grace period.
    pub async fn run(self, stop: CancellationToken) {
        let count = self.settings.count.max(1);
        let mut workers = JoinSet::new();
        for id in 0..count {
            let handler = self.handler.clone();
            let queue = self.queue.clone();
            let metrics = self.metrics.clone();
            let settings = self.settings;
            let stop = stop.clone();
            workers.spawn(async move { work(id, handler, queue, metrics, settings, stop).await });
        }
        info!("Spawned {} worker(s)", count);

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                bump(&self.metrics.worker_errors, 1);
                warn!("worker ended abnormally: {}", e);
            }
        }

        if !self.queue.is_empty() {
            warn!(
                "shutdown grace expired with {} datagram(s) still queued",
                self.queue.len()
            );
        }
        info!("Closing worker pool...");
    }
}

async fn process_isolated<H: DatagramHandler>(
    handler: &Arc<H>,
    metrics: &PipelineMetrics,
    datagram: RawDatagram,
) {
    let source = datagram.source;
    let handler = handler.clone();
    if let Err(e) = task::spawn_blocking(move || handler.process_datagram(datagram)).await {
        bump(&metrics.worker_errors, 1);
        warn!("failed to process datagram from {}: {}", source, e);
    }
}

async fn work<H: DatagramHandler>(
    id: usize,
    handler: Arc<H>,
    queue: Arc<BoundedQueue<RawDatagram>>,
    metrics: Arc<PipelineMetrics>,
    settings: WorkerSettings,
    stop: CancellationToken,
) {
    let mut processed: u64 = 0;
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            popped = queue.pop(settings.dequeue_timeout) => {
                if let Some(datagram) = popped {
                    process_isolated(&handler, &metrics, datagram).await;
                    processed += 1;
                }
            }
        }
    }

    let deadline = Instant::now() + settings.shutdown_grace;
    while !queue.is_empty() && Instant::now() < deadline {
        if let Some(datagram) = queue.pop(settings.dequeue_timeout).await {
            process_isolated(&handler, &metrics, datagram).await;
            processed += 1;
        }
    }

    debug!("worker {} stopped after {} datagram(s)", id, processed);
}
