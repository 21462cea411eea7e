use log::{info, warn};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigCache, ConfigErr};
use crate::decoder::Decoder;
use crate::flow::{FlowRecord, RawDatagram};
use crate::forwarder::ForwardJob;
use crate::importers::{self, errors::ImporterError, UdpImporter};
use crate::metrics::{self, PipelineMetrics};
use crate::queue::BoundedQueue;
use crate::settings::{Configuration, ConstructorErr, SettingsErr};
use crate::storage::PersistenceSink;
use crate::templates::{self, TemplateStore};
use crate::workers::{Worker, WorkerPool};

pub const CONFIG_PATH: &str = "./flowgate.yaml";

pub struct ApplicationState {
    pub config: ConfigCache,
}

#[derive(Debug, Error)]
pub enum AppInitErr {
    #[error(transparent)]
    Config(#[from] ConfigErr),
    #[error("invalid configuration: {0}")]
    Settings(#[from] SettingsErr),
    #[error(transparent)]
    Constructor(#[from] ConstructorErr),
    #[error(transparent)]
    ImporterInit(#[from] ImporterError),
}

impl ApplicationState {
    pub fn new(config_cache: ConfigCache) -> Self {
        Self {
            config: config_cache,
        }
    }

    /// Builds every component, runs until `stop` fires and then shuts the
    /// pipeline down front to back: listeners, workers, sink, forwarder.
    pub async fn init_components(config: Configuration, stop: CancellationToken) -> Result<(), AppInitErr> {
        let metrics = PipelineMetrics::new();
        let templates = Arc::new(TemplateStore::new(Duration::from_secs(
            config.templates.timeout_secs,
        )));
        let queue = Arc::new(BoundedQueue::<RawDatagram>::new(config.pipeline.queue_capacity));

        // storage
        let storage = config
            .storage
            .destination
            .construct_storage(&config.storage)
            .await?;
        info!("Persisting flows to {}", config.storage.destination);
        let (sink_tx, sink_rx) = mpsc::channel::<Arc<FlowRecord>>(config.storage.buffer_capacity);
        let sink = PersistenceSink::new(
            storage,
            config.storage.batch_size,
            Duration::from_secs(config.storage.flush_interval_secs),
            metrics.clone(),
        );
        let sink_task = task::spawn(sink.run(sink_rx));

        let decoder = Decoder::new(templates.clone(), config.pipeline.netflow5_max_records);
        let mut worker = Worker::new(decoder, metrics.clone()).with_sink(sink_tx);

        // forwarding
        let forwarder = config.forwarding.construct_forwarder(metrics.clone())?;
        let forwarder_task = if forwarder.has_targets() {
            let (forward_tx, forward_rx) = mpsc::channel::<ForwardJob>(config.forwarding.queue_capacity);
            worker = worker.with_forwarder(forward_tx);
            Some(task::spawn(forwarder.run(forward_rx)))
        } else {
            info!("No active forwarding targets");
            None
        };

        // listeners are bound before anything starts consuming so a bad
        // port fails startup
        let mut listeners = Vec::new();
        for (flow_type, addr) in config.listeners.enabled() {
            listeners.push(UdpImporter::bind(addr, flow_type, config.listeners.max_packet_size).await?);
        }
        let importer_tasks: Vec<JoinHandle<()>> = listeners
            .into_iter()
            .map(|importer| {
                task::spawn(importers::run(
                    importer,
                    queue.clone(),
                    metrics.clone(),
                    config.listeners.max_packet_size,
                    stop.clone(),
                ))
            })
            .collect();

        let sweeper_task = task::spawn(templates::run_sweeper(
            templates.clone(),
            Duration::from_secs(config.templates.sweep_interval_secs),
            metrics.clone(),
            stop.clone(),
        ));
        let reporter_task = task::spawn(metrics::run_reporter(
            metrics.clone(),
            Duration::from_secs(config.stats_interval_secs),
            stop.clone(),
        ));

        let pool = WorkerPool::new(
            worker,
            queue.clone(),
            config.pipeline.worker_settings(),
            metrics.clone(),
        );
        let pool_task = task::spawn(pool.run(stop.clone()));

        for handle in importer_tasks {
            await_task("importer", handle).await;
        }
        // the pool owns the last senders, so sink and forwarder end after it
        await_task("worker pool", pool_task).await;
        await_task("persistence sink", sink_task).await;
        if let Some(handle) = forwarder_task {
            await_task("forwarder", handle).await;
        }
        await_task("template sweeper", sweeper_task).await;
        await_task("metrics reporter", reporter_task).await;

        let snapshot = metrics.snapshot();
        info!(
            "Pipeline stopped: {} datagrams received, {} dropped, {} records persisted, {} lost",
            snapshot.datagrams_received,
            snapshot.datagrams_dropped,
            snapshot.records_persisted,
            snapshot.records_lost
        );
        Ok(())
    }
}

async fn await_task(name: &str, handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        warn!("{} task failed: {}", name, e);
    }
}

/// Cancels `stop` on Ctrl-C.
pub fn shutdown_on_ctrl_c(stop: CancellationToken) {
    task::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down..."),
            Err(e) => warn!("unable to listen for Ctrl-C, shutting down: {}", e),
        }
        stop.cancel();
    });
}

pub fn init_config(path: &str) -> Result<(ConfigCache, Configuration), AppInitErr> {
    let config_cache = ConfigCache::new(path)?;
    let configuration = config_cache.get_config::<Configuration>()?;
    configuration.validate()?;

    Ok((config_cache, configuration))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::netflow_v5::tests::{sample_flow, v5_packet};
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use tokio::net::UdpSocket;

    fn free_udp_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_pipeline_persists_received_flows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flows.jsonl");
        let port = free_udp_port();

        let config: Configuration = serde_yaml::from_str(&format!(
            "
            listeners:
              bind_address: 127.0.0.1
              netflow5: {}
            pipeline:
              worker_count: 2
              dequeue_timeout_ms: 10
            storage:
              destination: json_lines
              path: {}
              flush_interval_secs: 1
            ",
            port,
            path.display()
        ))
        .unwrap();
        assert_eq!(Ok(()), config.validate());

        let stop = CancellationToken::new();
        let app = tokio::spawn(ApplicationState::init_components(config, stop.clone()));

        // the listener binds asynchronously, so keep sending until a flush lands
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let packet = v5_packet(2, &[sample_flow(), sample_flow()]);
        let mut contents = String::new();
        for _ in 0..100 {
            sender.send_to(&packet, ("127.0.0.1", port)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            contents = tokio::fs::read_to_string(&path).await.unwrap_or_default();
            if !contents.is_empty() {
                break;
            }
        }

        stop.cancel();
        app.await.unwrap().unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap_or(contents);
        let lines = contents.lines().count();
        assert_eq!(true, lines >= 2);
        assert_eq!(0, lines % 2);
        assert_eq!(true, contents.contains("\"src_port\":40000"));
    }

    #[test]
    #[serial]
    fn test_init_config_rejects_invalid_settings() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        std::io::Write::write_all(&mut file, b"pipeline:\n  worker_count: 0\n").unwrap();

        match init_config(file.path().to_str().unwrap()) {
            Err(AppInitErr::Settings(e)) => assert_eq!(SettingsErr::Zero("pipeline.worker_count"), e),
            other => panic!("unexpected {:?}", other.map(|(_, c)| c)),
        }
    }
}
