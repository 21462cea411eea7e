use async_trait::async_trait;
use bytes::Bytes;
use log::info;
use std::fmt;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use super::{errors::ImporterError, import::Import};
use crate::flow::{FlowType, RawDatagram};

/// One UDP socket per flow type.
pub struct UdpImporter {
    socket: UdpSocket,
    flow_type: FlowType,
    /// One byte more than the largest accepted datagram, so oversized
    /// datagrams show up as such instead of being silently cut.
    scratch: Mutex<Vec<u8>>,
}

impl fmt::Debug for UdpImporter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} listener on {:?}", self.flow_type, self.socket.local_addr())
    }
}

impl UdpImporter {
    pub async fn bind(
        addr: SocketAddr,
        flow_type: FlowType,
        max_packet_size: usize,
    ) -> Result<Self, ImporterError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ImporterError::Bind { addr, source })?;
        info!(
            "listening for {} on udp://{}",
            flow_type,
            socket.local_addr().unwrap_or(addr)
        );

        Ok(Self {
            socket,
            flow_type,
            scratch: Mutex::new(vec![0u8; max_packet_size + 1]),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ImporterError> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl Import for UdpImporter {
    fn flow_type(&self) -> FlowType {
        self.flow_type
    }

    async fn import(&self) -> Result<RawDatagram, ImporterError> {
        let mut buf = self.scratch.lock().await;
        let (len, source) = self.socket.recv_from(&mut buf[..]).await?;
        Ok(RawDatagram::new(
            Bytes::copy_from_slice(&buf[..len]),
            source,
            self.flow_type,
        ))
    }
}
