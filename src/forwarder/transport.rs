use async_trait::async_trait;
use log::{debug, warn};
#[cfg(test)]
use mockall::automock;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::sync::{Mutex, OnceCell};
use tokio::time::{timeout, Duration, Instant};
use tokio_rustls::TlsConnector;

use super::errors::ForwardError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(500);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Carries raw datagram bytes to one downstream collector.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ForwardTransport: Send + Sync {
    async fn send(&self, payload: &[u8]) -> Result<(), ForwardError>;

    fn describe(&self) -> String;
}

async fn resolve(endpoint: &str) -> Result<SocketAddr, ForwardError> {
    lookup_host(endpoint)
        .await?
        .next()
        .ok_or_else(|| ForwardError::Resolve(endpoint.to_owned()))
}

pub struct UdpTransport {
    endpoint: String,
    socket: OnceCell<(UdpSocket, SocketAddr)>,
}

impl UdpTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            socket: OnceCell::new(),
        }
    }

    async fn open(&self) -> Result<(UdpSocket, SocketAddr), ForwardError> {
        let peer = resolve(&self.endpoint).await?;
        let local: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        debug!("forwarding to udp://{} ({})", self.endpoint, peer);
        Ok((socket, peer))
    }
}

#[async_trait]
impl ForwardTransport for UdpTransport {
    async fn send(&self, payload: &[u8]) -> Result<(), ForwardError> {
        // resolution failures are retried on the next send
        let (socket, peer) = self.socket.get_or_try_init(|| self.open()).await?;
        socket.send_to(payload, *peer).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("udp://{}", self.endpoint)
    }
}

type Stream = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Default)]
struct Link {
    stream: Option<Stream>,
    backoff: Option<Backoff>,
}

struct Backoff {
    retry_at: Instant,
    delay: Duration,
}

impl Backoff {
    fn after(previous: Option<&Backoff>) -> Self {
        let delay = previous.map_or(MIN_RECONNECT_DELAY, |b| {
            (b.delay * 2).min(MAX_RECONNECT_DELAY)
        });
        Self {
            retry_at: Instant::now() + delay,
            delay,
        }
    }
}

/// Stream transport, optionally TLS wrapped. The connection is opened on
/// first use and reopened on the send after a write error. After a failed
/// connect, sends fail immediately until an exponentially growing delay
/// has passed.
pub struct TcpTransport {
    endpoint: String,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    link: Mutex<Link>,
}

impl TcpTransport {
    pub fn plain(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            tls: None,
            link: Mutex::new(Link::default()),
        }
    }

    pub fn with_tls(
        endpoint: impl Into<String>,
        server_name: String,
        ca_cert: Option<&Path>,
    ) -> Result<Self, ForwardError> {
        let server_name = ServerName::try_from(server_name)
            .map_err(|e| ForwardError::Tls(format!("invalid server name: {}", e)))?;

        Ok(Self {
            endpoint: endpoint.into(),
            tls: Some((tls_connector(ca_cert)?, server_name)),
            link: Mutex::new(Link::default()),
        })
    }

    async fn connect(&self) -> Result<Stream, ForwardError> {
        let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.endpoint))
            .await
            .map_err(|_| ForwardError::ConnectTimeout(self.endpoint.clone()))??;
        tcp.set_nodelay(true)?;

        match &self.tls {
            None => Ok(Box::new(tcp)),
            Some((connector, server_name)) => {
                let tls = timeout(CONNECT_TIMEOUT, connector.connect(server_name.clone(), tcp))
                    .await
                    .map_err(|_| ForwardError::ConnectTimeout(self.endpoint.clone()))??;
                Ok(Box::new(tls))
            }
        }
    }
}

#[async_trait]
impl ForwardTransport for TcpTransport {
    async fn send(&self, payload: &[u8]) -> Result<(), ForwardError> {
        let mut link = self.link.lock().await;
        let mut stream = match link.stream.take() {
            Some(stream) => stream,
            None => {
                if let Some(backoff) = &link.backoff {
                    let now = Instant::now();
                    if now < backoff.retry_at {
                        return Err(ForwardError::Backoff {
                            endpoint: self.endpoint.clone(),
                            retry_in: backoff.retry_at - now,
                        });
                    }
                }
                match self.connect().await {
                    Ok(stream) => {
                        link.backoff = None;
                        debug!("connected to {}", self.describe());
                        stream
                    }
                    Err(e) => {
                        link.backoff = Some(Backoff::after(link.backoff.as_ref()));
                        return Err(e);
                    }
                }
            }
        };

        stream.write_all(payload).await?;
        stream.flush().await?;
        link.stream = Some(stream);
        Ok(())
    }

    fn describe(&self) -> String {
        let scheme = if self.tls.is_some() { "tls" } else { "tcp" };
        format!("{}://{}", scheme, self.endpoint)
    }
}

fn tls_connector(ca_cert: Option<&Path>) -> Result<TlsConnector, ForwardError> {
    let mut roots = RootCertStore::empty();

    match ca_cert {
        Some(path) => {
            let mut reader = BufReader::new(std::fs::File::open(path)?);
            for cert in rustls_pemfile::certs(&mut reader) {
                roots.add(cert?)?;
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs();
            if let Some(err) = native.errors.first() {
                warn!("some system certificates failed to load: {}", err);
            }
            for cert in native.certs {
                roots.add(cert)?;
            }
        }
    }

    if roots.is_empty() {
        return Err(ForwardError::Tls("no trusted CA certificates found".to_owned()));
    }

    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_udp_sends_bytes_unchanged() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = UdpTransport::new(receiver.local_addr().unwrap().to_string());

        transport.send(b"\x00\x05\x00\x01raw").await.unwrap();
        transport.send(b"second").await.unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&b"\x00\x05\x00\x01raw"[..], &buf[..len]);
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&b"second"[..], &buf[..len]);
    }

    #[tokio::test]
    async fn test_tcp_reuses_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let transport = TcpTransport::plain(listener.local_addr().unwrap().to_string());

        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 10];
            conn.read_exact(&mut buf).await.unwrap();
            buf
        });

        transport.send(b"hello").await.unwrap();
        transport.send(b"world").await.unwrap();

        assert_eq!(b"helloworld".to_vec(), server.await.unwrap());
        assert_eq!(true, transport.describe().starts_with("tcp://127.0.0.1:"));
    }

    #[tokio::test]
    async fn test_tcp_connect_failure_is_reported() {
        // grab a free port and close it again
        let port = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let transport = TcpTransport::plain(format!("127.0.0.1:{}", port));

        assert_eq!(true, matches!(transport.send(b"lost").await, Err(ForwardError::Io(_))));
        // the next send fails fast instead of connecting again
        assert_eq!(
            true,
            matches!(transport.send(b"lost").await, Err(ForwardError::Backoff { .. }))
        );
    }

    #[test]
    fn test_reconnect_delay_doubles_up_to_a_cap() {
        let first = Backoff::after(None);
        assert_eq!(MIN_RECONNECT_DELAY, first.delay);
        let second = Backoff::after(Some(&first));
        assert_eq!(MIN_RECONNECT_DELAY * 2, second.delay);

        let capped = Backoff::after(Some(&Backoff {
            retry_at: Instant::now(),
            delay: MAX_RECONNECT_DELAY,
        }));
        assert_eq!(MAX_RECONNECT_DELAY, capped.delay);
    }

    #[test]
    fn test_tls_requires_a_certificate() {
        let mut empty = tempfile::NamedTempFile::new().unwrap();
        writeln!(empty, "not a certificate").unwrap();

        match TcpTransport::with_tls("127.0.0.1:6514", "collector".to_owned(), Some(empty.path())) {
            Err(ForwardError::Tls(msg)) => assert_eq!("no trusted CA certificates found", msg),
            other => panic!("unexpected {:?}", other.map(|t| t.describe())),
        }
    }

    #[test]
    fn test_tls_missing_ca_file() {
        let result = TcpTransport::with_tls(
            "127.0.0.1:6514",
            "collector".to_owned(),
            Some(Path::new("/nonexistent/ca.pem")),
        );
        assert_eq!(true, matches!(result, Err(ForwardError::Io(_))));
    }
}
