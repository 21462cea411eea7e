use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("unable to write batch: {0}")]
    Io(#[from] io::Error),
    #[error("unable to serialize flow record: {0}")]
    Serialization(#[from] serde_json::Error),
}
