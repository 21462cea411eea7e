use std::io;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImporterError {
    #[error("unable to bind listener to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("receive failed: {0}")]
    Recv(#[from] io::Error),
}

impl PartialEq for ImporterError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bind { addr: a, source: x }, Self::Bind { addr: b, source: y }) => {
                a == b && x.kind() == y.kind()
            }
            (Self::Recv(a), Self::Recv(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}
