use log::{debug, info, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::errors::ImporterError;
use crate::flow::{FlowType, RawDatagram};
use crate::metrics::{bump, PipelineMetrics};
use crate::queue::BoundedQueue;
use async_trait::async_trait;

#[async_trait]
pub trait Import: Sync + Send {
    fn flow_type(&self) -> FlowType;

    async fn import(&self) -> Result<RawDatagram, ImporterError>;
}

/// Receives datagrams and hands them to the workers. Nothing is decoded
/// here; a full queue drops the datagram instead of slowing the socket.
pub async fn run(
    importer: impl Import,
    queue: Arc<BoundedQueue<RawDatagram>>,
    metrics: Arc<PipelineMetrics>,
    max_packet_size: usize,
    stop: CancellationToken,
) {
    let flow_type = importer.flow_type();
    info!("Spawned {} importer...", flow_type);

    loop {
        let received = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            received = importer.import() => received,
        };

        let datagram = match received {
            Ok(d) => d,
            Err(e) => {
                // ICMP unreachable and friends surface here; the socket is still usable
                warn!("{} importer: {}", flow_type, e);
                continue;
            }
        };

        bump(&metrics.datagrams_received, 1);
        bump(&metrics.bytes_received, datagram.len() as u64);

        if datagram.len() > max_packet_size {
            bump(&metrics.datagrams_oversized, 1);
            bump(&metrics.malformed_packets, 1);
            debug!(
                "dropping {} byte {} datagram from {}: larger than {}",
                datagram.len(),
                flow_type,
                datagram.source,
                max_packet_size
            );
            continue;
        }

        if let Err(dropped) = queue.push(datagram) {
            bump(&metrics.datagrams_dropped, 1);
            debug!(
                "queue full, dropping {} datagram from {}",
                dropped.hint, dropped.source
            );
        }
    }

    info!("Closing {} importer...", flow_type);
}
