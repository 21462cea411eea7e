pub mod errors;
pub mod filter;
pub mod rules;
pub mod target;
pub mod transport;

pub use self::errors::{FilterError, ForwardError};
pub use self::filter::FilterRules;
pub use self::rules::RuleExpr;
pub use self::target::{ForwardTarget, TargetSettings, TransportKind};
pub use self::transport::{ForwardTransport, TcpTransport, UdpTransport};

use bytes::Bytes;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tokio::task::JoinSet;
use tokio::time::{timeout, Duration};

use crate::flow::{FlowRecord, FlowType};
use crate::metrics::{bump, PipelineMetrics};

pub const DEFAULT_LANE_CAPACITY: usize = 1024;
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// One decoded datagram: its untouched bytes plus the records they held.
#[derive(Debug, Clone)]
pub struct ForwardJob {
    pub payload: Bytes,
    pub source: SocketAddr,
    pub flow_type: FlowType,
    pub records: Vec<Arc<FlowRecord>>,
}

/// Fans datagrams out to the configured targets.
///
/// Every target is served by its own task behind its own bounded lane, so a
/// slow or unreachable target only ever drops its own backlog.
pub struct Forwarder {
    targets: Vec<Arc<ForwardTarget>>,
    metrics: Arc<PipelineMetrics>,
    lane_capacity: usize,
    drain_grace: Duration,
}

impl Forwarder {
    pub fn new(targets: Vec<ForwardTarget>, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            targets: targets.into_iter().map(Arc::new).collect(),
            metrics,
            lane_capacity: DEFAULT_LANE_CAPACITY,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }

    pub fn from_settings(
        settings: &[TargetSettings],
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self, ForwardError> {
        let targets = settings
            .iter()
            .map(ForwardTarget::from_settings)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(targets, metrics))
    }

    pub fn with_lane_capacity(mut self, capacity: usize) -> Self {
        self.lane_capacity = capacity.max(1);
        self
    }

    /// How long `run` waits for target lanes to empty once its input closes.
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn has_targets(&self) -> bool {
        self.targets.iter().any(|t| t.active)
    }

    /// Targets with at least one matching record, each listed once no matter
    /// how many records matched.
    pub fn matching_targets<'a>(&'a self, job: &ForwardJob) -> Vec<&'a ForwardTarget> {
        self.targets
            .iter()
            .filter(|t| wants(t, job))
            .map(|t| &**t)
            .collect()
    }

    pub async fn run(self, mut rx: Receiver<ForwardJob>) {
        info!(
            "Spawned forwarder with {} target(s): {:?}",
            self.targets.len(),
            self.targets
        );

        let mut lanes: Vec<(Arc<ForwardTarget>, Sender<Arc<ForwardJob>>)> = Vec::new();
        let mut deliveries = JoinSet::new();
        for target in self.targets.iter().filter(|t| t.active) {
            let (tx, lane_rx) = mpsc::channel(self.lane_capacity);
            deliveries.spawn(deliver(target.clone(), lane_rx, self.metrics.clone()));
            lanes.push((target.clone(), tx));
        }

        while let Some(job) = rx.recv().await {
            let job = Arc::new(job);
            let mut queued = 0;
            for (target, lane) in lanes.iter().filter(|(t, _)| wants(t, &job)) {
                match lane.try_send(job.clone()) {
                    Ok(()) => queued += 1,
                    Err(TrySendError::Full(_)) => {
                        bump(&self.metrics.forward_jobs_dropped, 1);
                        debug!("{} is backed up, dropping datagram from {}", target.name, job.source);
                    }
                    Err(TrySendError::Closed(_)) => {
                        warn!("delivery to {} has stopped", target.name);
                    }
                }
            }
            debug!("queued datagram from {} for {} target(s)", job.source, queued);
        }

        drop(lanes);
        let drained = timeout(self.drain_grace, async {
            while let Some(joined) = deliveries.join_next().await {
                if let Err(e) = joined {
                    warn!("forwarding task ended abnormally: {}", e);
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "forwarding targets did not drain within {:?}, abandoning queued datagrams",
                self.drain_grace
            );
            deliveries.shutdown().await;
        }

        info!("Closing forwarder...");
    }
}

fn wants(target: &ForwardTarget, job: &ForwardJob) -> bool {
    target.active
        && target.accepts_flow_type(job.flow_type)
        && job.records.iter().any(|r| target.matches(r))
}

async fn deliver(
    target: Arc<ForwardTarget>,
    mut lane: Receiver<Arc<ForwardJob>>,
    metrics: Arc<PipelineMetrics>,
) {
    while let Some(job) = lane.recv().await {
        match target.send(&job.payload).await {
            Ok(()) => bump(&metrics.forwards_sent, 1),
            Err(e) => {
                bump(&metrics.forwards_failed, 1);
                warn!(
                    "unable to forward {} datagram from {} to {}: {}",
                    job.flow_type, job.source, target.name, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::transport::MockForwardTransport;
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::io;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedSender;

    fn record(src: &str, protocol: u8) -> Arc<FlowRecord> {
        let mut record = FlowRecord::new(FlowType::Netflow5, "172.16.0.1".parse().unwrap(), Utc::now());
        record.src_ip = Some(src.parse().unwrap());
        record.dst_ip = Some("8.8.8.8".parse().unwrap());
        record.protocol = Some(protocol);
        record.bytes = 500;
        record.packets = 5;
        Arc::new(record)
    }

    fn job(records: Vec<Arc<FlowRecord>>) -> ForwardJob {
        ForwardJob {
            payload: Bytes::from_static(b"\x00\x05original"),
            source: "172.16.0.1:5000".parse().unwrap(),
            flow_type: FlowType::Netflow5,
            records,
        }
    }

    fn rules(yaml: &str) -> FilterRules {
        let settings: TargetSettings =
            serde_yaml::from_str(&format!("name: t\naddress: 127.0.0.1\nport: 9\n{}", yaml)).unwrap();
        FilterRules::compile(&settings).unwrap()
    }

    fn recording(sent: Arc<Mutex<Vec<Vec<u8>>>>) -> MockForwardTransport {
        let mut transport = MockForwardTransport::new();
        transport.expect_describe().return_const("mock".to_owned());
        transport.expect_send().returning(move |payload| {
            sent.lock().unwrap().push(payload.to_vec());
            Ok(())
        });
        transport
    }

    fn notifying(delivered: UnboundedSender<()>) -> MockForwardTransport {
        let mut transport = MockForwardTransport::new();
        transport.expect_describe().return_const("notifying".to_owned());
        transport.expect_send().returning(move |_| {
            delivered.send(()).unwrap();
            Ok(())
        });
        transport
    }

    /// Accepts the first datagram and never finishes sending it.
    struct Blackhole;

    #[async_trait]
    impl ForwardTransport for Blackhole {
        async fn send(&self, _payload: &[u8]) -> Result<(), ForwardError> {
            std::future::pending().await
        }

        fn describe(&self) -> String {
            "blackhole".to_owned()
        }
    }

    async fn run_jobs(forwarder: Forwarder, jobs: Vec<ForwardJob>) {
        let (tx, rx) = mpsc::channel(jobs.len().max(1));
        for job in jobs {
            tx.send(job).await.unwrap();
        }
        drop(tx);
        forwarder.run(rx).await;
    }

    #[test]
    fn test_matching_targets_are_listed_once() {
        let forwarder = Forwarder::new(
            vec![
                ForwardTarget::new(
                    "lan",
                    None,
                    rules("filter_src_ip: 192.168.1.0/24"),
                    Arc::new(MockForwardTransport::new()),
                ),
                ForwardTarget::new(
                    "tcp-only",
                    None,
                    rules("filter_protocol: TCP"),
                    Arc::new(MockForwardTransport::new()),
                ),
            ],
            PipelineMetrics::new(),
        );

        let matched = forwarder.matching_targets(&job(vec![
            record("192.168.1.5", 17),
            record("192.168.1.6", 17),
            record("10.0.0.1", 17),
        ]));

        assert_eq!(vec!["lan"], matched.iter().map(|t| t.name.as_str()).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_sends_original_bytes_once_per_matching_target() {
        let to_lan = Arc::new(Mutex::new(Vec::new()));
        let to_tcp = Arc::new(Mutex::new(Vec::new()));
        let metrics = PipelineMetrics::new();
        let forwarder = Forwarder::new(
            vec![
                ForwardTarget::new(
                    "lan",
                    None,
                    rules("filter_src_ip: 192.168.1.0/24"),
                    Arc::new(recording(to_lan.clone())),
                ),
                ForwardTarget::new(
                    "tcp-only",
                    None,
                    rules("filter_protocol: TCP"),
                    Arc::new(recording(to_tcp.clone())),
                ),
            ],
            metrics.clone(),
        );

        run_jobs(
            forwarder,
            vec![job(vec![
                record("192.168.1.5", 17),
                record("192.168.1.6", 17),
                record("10.0.0.1", 17),
            ])],
        )
        .await;

        assert_eq!(vec![b"\x00\x05original".to_vec()], *to_lan.lock().unwrap());
        assert_eq!(true, to_tcp.lock().unwrap().is_empty());
        assert_eq!(1, metrics.forwards_sent.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_failing_target_does_not_block_others() {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let metrics = PipelineMetrics::new();

        let mut broken = MockForwardTransport::new();
        broken.expect_describe().return_const("broken".to_owned());
        broken
            .expect_send()
            .times(1)
            .returning(|_| Err(ForwardError::Io(io::Error::from(io::ErrorKind::ConnectionRefused))));

        let forwarder = Forwarder::new(
            vec![
                ForwardTarget::new("broken", None, FilterRules::default(), Arc::new(broken)),
                ForwardTarget::new(
                    "healthy",
                    None,
                    FilterRules::default(),
                    Arc::new(recording(delivered.clone())),
                ),
            ],
            metrics.clone(),
        );

        run_jobs(forwarder, vec![job(vec![record("10.0.0.1", 6)])]).await;

        assert_eq!(1, delivered.lock().unwrap().len());
        assert_eq!(1, metrics.forwards_sent.load(Ordering::Relaxed));
        assert_eq!(1, metrics.forwards_failed.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_stuck_target_does_not_delay_others() {
        let metrics = PipelineMetrics::new();
        let (delivered_tx, mut delivered_rx) = mpsc::unbounded_channel();
        let forwarder = Forwarder::new(
            vec![
                ForwardTarget::new("stuck", None, FilterRules::default(), Arc::new(Blackhole)),
                ForwardTarget::new(
                    "healthy",
                    None,
                    FilterRules::default(),
                    Arc::new(notifying(delivered_tx)),
                ),
            ],
            metrics.clone(),
        )
        .with_lane_capacity(2)
        .with_drain_grace(Duration::from_millis(100));

        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(forwarder.run(rx));

        for _ in 0..10 {
            tx.send(job(vec![record("10.0.0.1", 6)])).await.unwrap();
            tokio::time::timeout(Duration::from_secs(1), delivered_rx.recv())
                .await
                .unwrap()
                .unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        assert_eq!(10, metrics.forwards_sent.load(Ordering::Relaxed));
        assert_eq!(true, metrics.forward_jobs_dropped.load(Ordering::Relaxed) >= 7);
    }

    #[tokio::test]
    async fn test_flow_type_mismatch_is_skipped() {
        let mut transport = MockForwardTransport::new();
        transport.expect_describe().return_const("ipfix".to_owned());
        transport.expect_send().never();

        let metrics = PipelineMetrics::new();
        let forwarder = Forwarder::new(
            vec![ForwardTarget::new(
                "ipfix-only",
                Some(FlowType::Ipfix),
                FilterRules::default(),
                Arc::new(transport),
            )],
            metrics.clone(),
        );

        run_jobs(forwarder, vec![job(vec![record("10.0.0.1", 6)])]).await;

        assert_eq!(0, metrics.forwards_sent.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_run_drains_until_closed() {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let forwarder = Forwarder::new(
            vec![ForwardTarget::new(
                "all",
                None,
                FilterRules::default(),
                Arc::new(recording(delivered.clone())),
            )],
            PipelineMetrics::new(),
        );

        run_jobs(
            forwarder,
            vec![job(vec![record("10.0.0.1", 6)]), job(vec![record("10.0.0.2", 6)])],
        )
        .await;

        assert_eq!(2, delivered.lock().unwrap().len());
    }
}
