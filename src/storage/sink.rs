use log::{error, info};
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tokio::time::{interval, Duration, MissedTickBehavior};

use super::FlowStorage;
use crate::flow::FlowRecord;
use crate::metrics::{bump, PipelineMetrics};

pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Buffers records off the decode path and writes them in batches, either
/// when `batch_size` records are waiting or every `flush_interval`.
pub struct PersistenceSink {
    storage: Arc<dyn FlowStorage>,
    buffer: Vec<Arc<FlowRecord>>,
    batch_size: usize,
    flush_interval: Duration,
    metrics: Arc<PipelineMetrics>,
}

impl PersistenceSink {
    pub fn new(
        storage: Arc<dyn FlowStorage>,
        batch_size: usize,
        flush_interval: Duration,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            storage,
            buffer: Vec::with_capacity(batch_size),
            batch_size,
            flush_interval,
            metrics,
        }
    }

    /// Runs until every sender is gone, then writes what is left.
    pub async fn run(mut self, mut rx: Receiver<Arc<FlowRecord>>) {
        info!("Spawned persistence sink...");
        let mut ticker = interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(record) => {
                        self.buffer.push(record);
                        if self.buffer.len() >= self.batch_size {
                            self.flush().await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => self.flush().await,
            }
        }

        self.flush().await;
        info!("Closing persistence sink...");
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        let batch: Vec<Arc<FlowRecord>> = self.buffer.drain(..).collect();
        match self.storage.bulk_insert(&batch).await {
            Ok(stored) => {
                bump(&self.metrics.sink_batches_written, 1);
                bump(&self.metrics.records_persisted, stored as u64);
                info!("saved batch of {} flow records", stored);
            }
            Err(e) => {
                // the batch is gone; telemetry is not retried
                bump(&self.metrics.sink_batches_failed, 1);
                bump(&self.metrics.records_lost, batch.len() as u64);
                error!("failed to save batch of {} records: {}", batch.len(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowType;
    use crate::storage::{MockFlowStorage, StorageError};
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::io;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn record(bytes: u64) -> Arc<FlowRecord> {
        let mut record = FlowRecord::new(FlowType::Netflow5, "10.0.0.1".parse().unwrap(), Utc::now());
        record.bytes = bytes;
        Arc::new(record)
    }

    fn recording_storage(batches: Arc<Mutex<Vec<Vec<u64>>>>) -> MockFlowStorage {
        let mut storage = MockFlowStorage::new();
        storage.expect_bulk_insert().returning(move |records| {
            batches
                .lock()
                .unwrap()
                .push(records.iter().map(|r| r.bytes).collect());
            Ok(records.len())
        });
        storage
    }

    #[tokio::test]
    async fn test_flushes_full_batches_and_remainder_on_close() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let metrics = PipelineMetrics::new();
        let sink = PersistenceSink::new(
            Arc::new(recording_storage(batches.clone())),
            2,
            Duration::from_secs(3600),
            metrics.clone(),
        );

        let (tx, rx) = mpsc::channel(16);
        for bytes in 1..=5 {
            tx.send(record(bytes)).await.unwrap();
        }
        drop(tx);
        sink.run(rx).await;

        assert_eq!(vec![vec![1, 2], vec![3, 4], vec![5]], *batches.lock().unwrap());
        assert_eq!(3, metrics.sink_batches_written.load(Ordering::Relaxed));
        assert_eq!(5, metrics.records_persisted.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_interval_flushes_partial_batch() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let metrics = PipelineMetrics::new();
        let sink = PersistenceSink::new(
            Arc::new(recording_storage(batches.clone())),
            100,
            Duration::from_millis(20),
            metrics.clone(),
        );

        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(sink.run(rx));
        tx.send(record(7)).await.unwrap();

        for _ in 0..50 {
            if !batches.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(vec![vec![7]], *batches.lock().unwrap());

        drop(tx);
        task.await.unwrap();
        assert_eq!(1, metrics.sink_batches_written.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_failed_batch_is_dropped_not_retried() {
        let metrics = PipelineMetrics::new();
        let mut storage = MockFlowStorage::new();
        storage
            .expect_bulk_insert()
            .times(1)
            .returning(|_| Err(StorageError::Io(io::Error::from(io::ErrorKind::BrokenPipe))));
        let sink = PersistenceSink::new(
            Arc::new(storage),
            3,
            Duration::from_secs(3600),
            metrics.clone(),
        );

        let (tx, rx) = mpsc::channel(16);
        for bytes in 0..3 {
            tx.send(record(bytes)).await.unwrap();
        }
        drop(tx);
        sink.run(rx).await;

        assert_eq!(1, metrics.sink_batches_failed.load(Ordering::Relaxed));
        assert_eq!(3, metrics.records_lost.load(Ordering::Relaxed));
        assert_eq!(0, metrics.records_persisted.load(Ordering::Relaxed));
    }
}
