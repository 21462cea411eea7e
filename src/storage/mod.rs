pub mod errors;
pub mod json_lines;
pub mod logger;
mod sink;

pub use self::errors::StorageError;
pub use self::json_lines::JsonLinesStorage;
pub use self::logger::LogStorage;
pub use self::sink::{PersistenceSink, DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;

use crate::flow::FlowRecord;

/// External store for decoded flows. A batch is written as a whole or not
/// at all; the returned count is the number of records stored.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FlowStorage: Send + Sync {
    async fn bulk_insert(&self, records: &[Arc<FlowRecord>]) -> Result<usize, StorageError>;
}
