use async_trait::async_trait;
use log::info;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{FlowStorage, StorageError};
use crate::flow::FlowRecord;

/// Appends records to a file, one JSON document per line.
///
/// The whole batch is serialized before anything touches the file, so a
/// record that fails to serialize fails the batch without writing a prefix
/// of it.
pub struct JsonLinesStorage {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesStorage {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        info!("persisting flow records to {}", path.display());

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FlowStorage for JsonLinesStorage {
    async fn bulk_insert(&self, records: &[Arc<FlowRecord>]) -> Result<usize, StorageError> {
        let mut buf = Vec::with_capacity(records.len() * 256);
        for record in records {
            serde_json::to_writer(&mut buf, record.as_ref())?;
            buf.push(b'\n');
        }

        let mut file = self.file.lock().await;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(records.len())
    }
}
