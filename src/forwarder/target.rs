use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use super::errors::ForwardError;
use super::filter::FilterRules;
use super::rules::RuleExpr;
use super::transport::{ForwardTransport, TcpTransport, UdpTransport};
use crate::flow::{FlowRecord, FlowType};

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    #[serde(rename = "udp")]
    Udp,
    #[serde(rename = "tcp")]
    Tcp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TlsSettings {
    /// PEM bundle of trusted roots; the system store is used when absent.
    pub ca_cert: Option<PathBuf>,
    /// Name to verify the peer certificate against; defaults to `address`.
    pub server_name: Option<String>,
}

fn default_active() -> bool {
    true
}

/// A downstream collector as written in the configuration file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TargetSettings {
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub transport: TransportKind,
    pub tls: Option<TlsSettings>,
    /// Only datagrams of this flow type are considered; absent means all.
    pub flow_type: Option<FlowType>,
    #[serde(default = "default_active")]
    pub active: bool,

    pub filter_src_ip: Option<String>,
    pub filter_dst_ip: Option<String>,
    pub filter_protocol: Option<String>,
    pub filter_src_port_range: Option<String>,
    pub filter_dst_port_range: Option<String>,
    pub filter_tos: Option<String>,
    pub filter_bytes_range: Option<String>,
    pub filter_packets_range: Option<String>,
    pub custom_rule: Option<RuleExpr>,
}

impl TargetSettings {
    pub fn endpoint(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

pub struct ForwardTarget {
    pub name: String,
    pub flow_type: Option<FlowType>,
    pub active: bool,
    rules: FilterRules,
    transport: Arc<dyn ForwardTransport>,
}

impl fmt::Debug for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.transport.describe())
    }
}

impl ForwardTarget {
    pub fn new(
        name: impl Into<String>,
        flow_type: Option<FlowType>,
        rules: FilterRules,
        transport: Arc<dyn ForwardTransport>,
    ) -> Self {
        Self {
            name: name.into(),
            flow_type,
            active: true,
            rules,
            transport,
        }
    }

    /// Compiles the filters and prepares the transport. Connections are
    /// made lazily on first send.
    pub fn from_settings(settings: &TargetSettings) -> Result<Self, ForwardError> {
        let rules = FilterRules::compile(settings).map_err(|source| ForwardError::Filter {
            target: settings.name.clone(),
            source,
        })?;

        let endpoint = settings.endpoint();
        let transport: Arc<dyn ForwardTransport> = match settings.transport {
            TransportKind::Udp => Arc::new(UdpTransport::new(endpoint)),
            TransportKind::Tcp => match &settings.tls {
                None => Arc::new(TcpTransport::plain(endpoint)),
                Some(tls) => {
                    let server_name = tls
                        .server_name
                        .clone()
                        .unwrap_or_else(|| settings.address.clone());
                    Arc::new(TcpTransport::with_tls(
                        endpoint,
                        server_name,
                        tls.ca_cert.as_deref(),
                    )?)
                }
            },
        };

        Ok(Self {
            name: settings.name.clone(),
            flow_type: settings.flow_type,
            active: settings.active,
            rules,
            transport,
        })
    }

    pub fn accepts_flow_type(&self, flow_type: FlowType) -> bool {
        self.flow_type.map_or(true, |t| t == flow_type)
    }

    pub fn matches(&self, record: &FlowRecord) -> bool {
        self.active && self.accepts_flow_type(record.flow_type) && self.rules.matches(record)
    }

    pub async fn send(&self, payload: &[u8]) -> Result<(), ForwardError> {
        self.transport.send(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_settings_defaults() {
        let settings: TargetSettings = serde_yaml::from_str(
            "
            name: backup
            address: 10.9.9.9
            port: 2055
            filter_protocol: TCP,UDP
            ",
        )
        .unwrap();

        assert_eq!(TransportKind::Udp, settings.transport);
        assert_eq!(true, settings.active);
        assert_eq!(None, settings.flow_type);
        assert_eq!(Some("TCP,UDP".to_owned()), settings.filter_protocol);
        assert_eq!("10.9.9.9:2055", settings.endpoint());
    }

    #[test]
    fn test_ipv6_endpoint_is_bracketed() {
        let settings: TargetSettings =
            serde_yaml::from_str("name: v6\naddress: '2001:db8::9'\nport: 4739\n").unwrap();
        assert_eq!("[2001:db8::9]:4739", settings.endpoint());
    }

    #[test]
    fn test_invalid_filter_names_the_target() {
        let settings: TargetSettings = serde_yaml::from_str(
            "name: broken\naddress: 127.0.0.1\nport: 9\nfilter_src_ip: 300.1.1.1/8\n",
        )
        .unwrap();

        match ForwardTarget::from_settings(&settings) {
            Err(ForwardError::Filter { target, .. }) => assert_eq!("broken", target),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_inactive_target_never_matches() {
        let mut settings: TargetSettings =
            serde_yaml::from_str("name: off\naddress: 127.0.0.1\nport: 9\nactive: false\n").unwrap();
        let target = ForwardTarget::from_settings(&settings).unwrap();
        let record = FlowRecord::new(FlowType::Netflow5, "10.0.0.1".parse().unwrap(), chrono::Utc::now());
        assert_eq!(false, target.matches(&record));

        settings.active = true;
        settings.flow_type = Some(FlowType::Ipfix);
        let target = ForwardTarget::from_settings(&settings).unwrap();
        assert_eq!(false, target.matches(&record));
    }
}
