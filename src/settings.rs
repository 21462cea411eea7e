use core::fmt;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Duration;

use crate::decoder::DEFAULT_NETFLOW5_MAX_RECORDS;
use crate::flow::FlowType;
use crate::forwarder::{FilterError, FilterRules, ForwardError, Forwarder, TargetSettings};
use crate::metrics::PipelineMetrics;
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::storage::{
    FlowStorage, JsonLinesStorage, LogStorage, StorageError, DEFAULT_BATCH_SIZE,
    DEFAULT_FLUSH_INTERVAL,
};
use crate::templates::DEFAULT_TEMPLATE_TIMEOUT_SECS;
use crate::workers::{WorkerSettings, DEFAULT_SHUTDOWN_GRACE, DEFAULT_WORKER_COUNT};

#[derive(Debug, Error)]
pub enum ConstructorErr {
    #[error("json_lines storage needs storage.path")]
    MissingStoragePath,
    #[error("unable to open storage: {0}")]
    Storage(#[from] StorageError),
    #[error("unable to set up forwarding: {0}")]
    Forward(#[from] ForwardError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsErr {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("no listener is enabled")]
    NoListeners,
    #[error("port {0} is assigned to more than one listener")]
    DuplicatePort(u16),
    #[error("json_lines storage needs storage.path")]
    MissingStoragePath,
    #[error("forwarding target name {0:?} is used more than once")]
    DuplicateTarget(String),
    #[error("forwarding target {target}: {source}")]
    Filter {
        target: String,
        #[source]
        source: FilterError,
    },
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_max_packet_size() -> usize {
    65535
}

/// UDP ports per flow type. Without a `listeners` section all four default
/// ports are opened; once the section is given, only the listed ones are.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ListenerSettings {
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    pub netflow5: Option<u16>,
    pub netflow9: Option<u16>,
    pub ipfix: Option<u16>,
    pub sflow: Option<u16>,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            netflow5: Some(2055),
            netflow9: Some(9995),
            ipfix: Some(4739),
            sflow: Some(6343),
            max_packet_size: default_max_packet_size(),
        }
    }
}

impl ListenerSettings {
    pub fn enabled(&self) -> Vec<(FlowType, SocketAddr)> {
        [
            (FlowType::Netflow5, self.netflow5),
            (FlowType::Netflow9, self.netflow9),
            (FlowType::Ipfix, self.ipfix),
            (FlowType::Sflow5, self.sflow),
        ]
        .into_iter()
        .filter_map(|(flow_type, port)| {
            port.map(|port| (flow_type, SocketAddr::new(self.bind_address, port)))
        })
        .collect()
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    pub worker_count: usize,
    pub netflow5_max_records: usize,
    pub dequeue_timeout_ms: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            worker_count: DEFAULT_WORKER_COUNT,
            netflow5_max_records: DEFAULT_NETFLOW5_MAX_RECORDS,
            dequeue_timeout_ms: 100,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE.as_secs(),
        }
    }
}

impl PipelineSettings {
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            count: self.worker_count,
            dequeue_timeout: Duration::from_millis(self.dequeue_timeout_ms),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TemplateSettings {
    pub timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for TemplateSettings {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TEMPLATE_TIMEOUT_SECS,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
pub enum StorageVariants {
    #[default]
    #[serde(rename = "log")]
    Log,
    #[serde(rename = "json_lines")]
    JsonLines,
}

impl StorageVariants {
    pub async fn construct_storage(
        &self,
        settings: &StorageSettings,
    ) -> Result<Arc<dyn FlowStorage>, ConstructorErr> {
        match *self {
            Self::Log => Ok(Arc::new(LogStorage)),
            Self::JsonLines => {
                let path = settings
                    .path
                    .as_ref()
                    .ok_or(ConstructorErr::MissingStoragePath)?;
                Ok(Arc::new(JsonLinesStorage::open(path).await?))
            }
        }
    }
}

impl fmt::Display for StorageVariants {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Log => "log",
            Self::JsonLines => "json_lines",
        };
        write!(f, "{}", name)
    }
}

impl From<StorageVariants> for String {
    fn from(variant: StorageVariants) -> String {
        variant.to_string()
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageSettings {
    pub destination: StorageVariants,
    pub path: Option<PathBuf>,
    pub batch_size: usize,
    pub flush_interval_secs: u64,
    /// Records waiting for the sink before workers start dropping them.
    pub buffer_capacity: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            destination: StorageVariants::default(),
            path: None,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL.as_secs(),
            buffer_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ForwardingSettings {
    pub queue_capacity: usize,
    pub targets: Vec<TargetSettings>,
}

impl Default for ForwardingSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            targets: Vec::new(),
        }
    }
}

impl ForwardingSettings {
    pub fn construct_forwarder(
        &self,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Forwarder, ConstructorErr> {
        Ok(Forwarder::from_settings(&self.targets, metrics)?.with_lane_capacity(self.queue_capacity))
    }
}

fn default_stats_interval() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Configuration {
    #[serde(default)]
    pub listeners: ListenerSettings,

    #[serde(default)]
    pub pipeline: PipelineSettings,

    #[serde(default)]
    pub templates: TemplateSettings,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub forwarding: ForwardingSettings,

    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            listeners: ListenerSettings::default(),
            pipeline: PipelineSettings::default(),
            templates: TemplateSettings::default(),
            storage: StorageSettings::default(),
            forwarding: ForwardingSettings::default(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

impl Configuration {
    /// Rejects settings that would only fail later, at runtime.
    pub fn validate(&self) -> Result<(), SettingsErr> {
        let non_zero = [
            ("listeners.max_packet_size", self.listeners.max_packet_size as u64),
            ("pipeline.queue_capacity", self.pipeline.queue_capacity as u64),
            ("pipeline.worker_count", self.pipeline.worker_count as u64),
            ("pipeline.dequeue_timeout_ms", self.pipeline.dequeue_timeout_ms),
            ("templates.timeout_secs", self.templates.timeout_secs),
            ("templates.sweep_interval_secs", self.templates.sweep_interval_secs),
            ("storage.batch_size", self.storage.batch_size as u64),
            ("storage.flush_interval_secs", self.storage.flush_interval_secs),
            ("storage.buffer_capacity", self.storage.buffer_capacity as u64),
            ("forwarding.queue_capacity", self.forwarding.queue_capacity as u64),
            ("stats_interval_secs", self.stats_interval_secs),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(SettingsErr::Zero(*name));
        }

        let listeners = self.listeners.enabled();
        if listeners.is_empty() {
            return Err(SettingsErr::NoListeners);
        }
        let mut ports = HashSet::new();
        for (_, addr) in &listeners {
            if !ports.insert(addr.port()) {
                return Err(SettingsErr::DuplicatePort(addr.port()));
            }
        }

        if self.storage.destination == StorageVariants::JsonLines && self.storage.path.is_none() {
            return Err(SettingsErr::MissingStoragePath);
        }

        let mut names = HashSet::new();
        for target in &self.forwarding.targets {
            if !names.insert(target.name.as_str()) {
                return Err(SettingsErr::DuplicateTarget(target.name.clone()));
            }
            FilterRules::compile(target).map_err(|source| SettingsErr::Filter {
                target: target.name.clone(),
                source,
            })?;
        }

        Ok(())
    }
}
