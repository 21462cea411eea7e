use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Telemetry protocol a listener is dedicated to and a record was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowType {
    Netflow5,
    Netflow9,
    Ipfix,
    Sflow5,
}

impl FlowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Netflow5 => "netflow5",
            Self::Netflow9 => "netflow9",
            Self::Ipfix => "ipfix",
            Self::Sflow5 => "sflow5",
        }
    }

    pub fn all() -> [FlowType; 4] {
        [Self::Netflow5, Self::Netflow9, Self::Ipfix, Self::Sflow5]
    }
}

impl fmt::Display for FlowType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A datagram exactly as it came off the socket.
///
/// The payload is reference counted so the forwarder can retransmit the
/// original bytes without copying them out of the worker.
#[derive(Debug, Clone)]
pub struct RawDatagram {
    pub payload: Bytes,
    pub source: SocketAddr,
    pub received_at: DateTime<Utc>,
    pub hint: FlowType,
}

impl RawDatagram {
    pub fn new(payload: impl Into<Bytes>, source: SocketAddr, hint: FlowType) -> Self {
        Self {
            payload: payload.into(),
            source,
            received_at: Utc::now(),
            hint,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Loosely typed value produced by field decoding, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    UInt(u64),
    Int(i64),
    Ip(IpAddr),
    Text(String),
    Null,
}

impl FieldValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::UInt(v) => Some(*v),
            Self::Int(v) if *v >= 0 => Some(*v as u64),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UInt(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::Ip(ip) => write!(f, "{}", ip),
            Self::Text(s) => write!(f, "{}", s),
            Self::Null => write!(f, "null"),
        }
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<IpAddr> for FieldValue {
    fn from(v: IpAddr) -> Self {
        Self::Ip(v)
    }
}

pub type FieldMap = BTreeMap<String, FieldValue>;

/// Normalized flow tuple handed to the persistence sink and the forwarder.
///
/// Optional fields are absent when the exporter did not send them (or sent
/// something that did not survive sanitization).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub flow_type: FlowType,
    pub device_source_ip: IpAddr,
    pub timestamp: DateTime<Utc>,
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub protocol: Option<u8>,
    pub tos: Option<u8>,
    pub tcp_flags: Option<u8>,
    pub bytes: u64,
    pub packets: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub next_hop: Option<IpAddr>,
    pub src_as: Option<u32>,
    pub dst_as: Option<u32>,
    pub input_if: Option<u32>,
    pub output_if: Option<u32>,
    pub raw_length: Option<usize>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub extra: FieldMap,
}

impl FlowRecord {
    /// Empty record for `flow_type` exported by `device`.
    pub fn new(flow_type: FlowType, device: IpAddr, timestamp: DateTime<Utc>) -> Self {
        Self {
            flow_type,
            device_source_ip: device,
            timestamp,
            src_ip: None,
            dst_ip: None,
            src_port: None,
            dst_port: None,
            protocol: None,
            tos: None,
            tcp_flags: None,
            bytes: 0,
            packets: 0,
            start_time: None,
            end_time: None,
            next_hop: None,
            src_as: None,
            dst_as: None,
            input_if: None,
            output_if: None,
            raw_length: None,
            extra: FieldMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;
    use test_case::test_case;

    #[test_case(FieldValue::UInt(7), Some(7))]
    #[test_case(FieldValue::Int(-1), None)]
    #[test_case(FieldValue::Text(" 42 ".to_owned()), Some(42))]
    #[test_case(FieldValue::Null, None)]
    fn test_field_value_as_u64(value: FieldValue, expected: Option<u64>) {
        assert_eq!(expected, value.as_u64());
    }

    #[test]
    fn test_flow_record_serializes_flow_type_lowercase() {
        let record = FlowRecord::new(
            FlowType::Netflow5,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            Utc::now(),
        );
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!("netflow5", json["flow_type"]);
        assert_eq!("10.0.0.1", json["device_source_ip"]);
        assert_eq!(true, json.get("extra").is_none());
    }
}
