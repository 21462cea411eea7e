use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use log::{debug, info};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::metrics::{bump, PipelineMetrics};

pub const DEFAULT_TEMPLATE_TIMEOUT_SECS: u64 = 1800;

/// Scope of a template id: the exporting device plus the NetFlow v9 source
/// id or IPFIX observation domain it announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId {
    pub exporter: Option<IpAddr>,
    pub domain: u32,
}

impl SourceId {
    pub fn new(exporter: IpAddr, domain: u32) -> Self {
        Self {
            exporter: Some(exporter),
            domain,
        }
    }
}

impl From<u32> for SourceId {
    fn from(domain: u32) -> Self {
        Self {
            exporter: None,
            domain,
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.exporter {
            Some(ip) => write!(f, "{}/{}", ip, self.domain),
            None => write!(f, "{}", self.domain),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateField {
    pub field_type: u16,
    pub length: u16,
    pub enterprise: Option<u32>,
}

impl TemplateField {
    pub fn new(field_type: u16, length: u16) -> Self {
        Self {
            field_type,
            length,
            enterprise: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Data,
    /// Options template; the first `scope_fields` fields are scope fields.
    Options { scope_fields: u16 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub template_id: u16,
    pub kind: TemplateKind,
    pub fields: Arc<[TemplateField]>,
    pub record_length: usize,
    pub field_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template {template_id} from {source_id} declares no fields")]
    Empty { source_id: SourceId, template_id: u16 },
}

/// Per-source cache of field layouts learned from template flow-sets.
///
/// Backed by a sharded concurrent map so workers decoding packets from
/// different exporters do not contend on a single lock.
pub struct TemplateStore {
    templates: DashMap<(SourceId, u16), Template>,
    timeout: ChronoDuration,
}

impl TemplateStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            templates: DashMap::new(),
            timeout: ChronoDuration::seconds(timeout.as_secs() as i64),
        }
    }

    pub fn store(
        &self,
        source_id: SourceId,
        template_id: u16,
        fields: Vec<TemplateField>,
    ) -> Result<Template, TemplateError> {
        self.store_at(source_id, template_id, TemplateKind::Data, fields, Utc::now())
    }

    /// Inserts or fully replaces the definition under `(source_id, template_id)`.
    pub fn store_at(
        &self,
        source_id: SourceId,
        template_id: u16,
        kind: TemplateKind,
        fields: Vec<TemplateField>,
        now: DateTime<Utc>,
    ) -> Result<Template, TemplateError> {
        if fields.is_empty() {
            return Err(TemplateError::Empty {
                source_id,
                template_id,
            });
        }

        let template = Template {
            template_id,
            kind,
            record_length: fields.iter().map(|f| f.length as usize).sum(),
            field_count: fields.len(),
            fields: fields.into(),
            created_at: now,
            last_seen: now,
        };

        if self
            .templates
            .insert((source_id, template_id), template.clone())
            .is_some()
        {
            debug!("template {} from {} redefined", template_id, source_id);
        }

        Ok(template)
    }

    pub fn lookup(&self, source_id: SourceId, template_id: u16) -> Option<Template> {
        self.lookup_at(source_id, template_id, Utc::now())
    }

    /// Returns a copy of the template and refreshes its `last_seen`.
    ///
    /// The refresh happens under the shard write lock, so a concurrent sweep
    /// can never evict a template between the read and the refresh.
    pub fn lookup_at(
        &self,
        source_id: SourceId,
        template_id: u16,
        now: DateTime<Utc>,
    ) -> Option<Template> {
        self.templates
            .get_mut(&(source_id, template_id))
            .map(|mut template| {
                template.last_seen = now;
                template.clone()
            })
    }

    /// Drops a template the exporter explicitly withdrew.
    pub fn withdraw(&self, source_id: SourceId, template_id: u16) -> bool {
        self.templates.remove(&(source_id, template_id)).is_some()
    }

    /// Evicts every template idle for longer than the timeout.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let timeout = self.timeout;
        let mut evicted = 0;
        self.templates.retain(|_, template| {
            let keep = now - template.last_seen <= timeout;
            if !keep {
                evicted += 1;
            }
            keep
        });
        evicted
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

pub async fn run_sweeper(
    store: Arc<TemplateStore>,
    period: Duration,
    metrics: Arc<PipelineMetrics>,
    stop: CancellationToken,
) {
    info!("Spawned template sweeper...");
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let evicted = store.sweep(Utc::now());
        if evicted > 0 {
            bump(&metrics.templates_evicted, evicted as u64);
            info!(
                "evicted {} expired templates, {} remain cached",
                evicted,
                store.len()
            );
        }
    }

    info!("Closing template sweeper...");
}
