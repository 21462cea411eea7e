//! Turns the loosely typed field maps produced by template decoding into
//! [`FlowRecord`]s.
//!
//! Only a missing or unparseable address is fatal. Everything else that does
//! not look right (negative numbers, empty strings, nulls, values out of
//! range for their column) is dropped from the record instead.
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use std::net::IpAddr;
use thiserror::Error;

use crate::flow::{FieldMap, FieldValue, FlowRecord, FlowType};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Invalid source IP: {0}")]
    InvalidSourceIp(String),
    #[error("Invalid destination IP: {0}")]
    InvalidDestinationIp(String),
}

/// Result of validating a single decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationOutcome {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn from_errors(errors: &[ValidationError]) -> Self {
        Self {
            valid: errors.is_empty(),
            errors: errors.iter().map(|e| e.to_string()).collect(),
        }
    }
}

/// Normalizes values: numeric strings become integers, non-negative signed
/// integers become unsigned, and negatives, empty strings and nulls are
/// removed.
pub fn sanitize(fields: FieldMap) -> FieldMap {
    fields
        .into_iter()
        .filter_map(|(name, value)| sanitize_value(value).map(|v| (name, v)))
        .collect()
}

fn sanitize_value(value: FieldValue) -> Option<FieldValue> {
    match value {
        FieldValue::Null => None,
        FieldValue::Int(v) if v < 0 => None,
        FieldValue::Int(v) => Some(FieldValue::UInt(v as u64)),
        FieldValue::Text(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            if let Ok(v) = trimmed.parse::<u64>() {
                return Some(FieldValue::UInt(v));
            }
            match trimmed.parse::<i64>() {
                Ok(_) => None,
                Err(_) => Some(FieldValue::Text(s)),
            }
        }
        other => Some(other),
    }
}

/// Timing context of the packet a field map came from.
#[derive(Debug, Clone, Copy)]
pub struct PacketClock {
    pub export_time: DateTime<Utc>,
    /// Router uptime in milliseconds at export, when the header carries it.
    pub sys_uptime_ms: Option<u32>,
}

impl PacketClock {
    /// Converts a sys-uptime relative timestamp to wall clock time.
    /// Returns `None` when the offset does not fit the representable range.
    pub fn from_uptime(&self, uptime_ms: u64) -> Option<DateTime<Utc>> {
        let sys_uptime = i64::from(self.sys_uptime_ms?);
        let delta = sys_uptime.checked_sub(i64::try_from(uptime_ms).ok()?)?;
        let delta = TimeDelta::try_milliseconds(delta)?;
        self.export_time.checked_sub_signed(delta)
    }
}

/// Sanitizes `fields` and maps them onto a [`FlowRecord`].
pub fn validate(
    flow_type: FlowType,
    device: IpAddr,
    clock: &PacketClock,
    fields: FieldMap,
) -> Result<FlowRecord, Vec<ValidationError>> {
    let mut fields = sanitize(fields);
    let mut errors = Vec::new();

    let src_ip = take_ip(&mut fields, &["src_ip", "src_ipv6"]);
    let dst_ip = take_ip(&mut fields, &["dst_ip", "dst_ipv6"]);

    let src_ip = match src_ip {
        None => {
            errors.push(ValidationError::MissingField("src_ip"));
            None
        }
        Some(Err(raw)) => {
            errors.push(ValidationError::InvalidSourceIp(raw));
            None
        }
        Some(Ok(ip)) => Some(ip),
    };
    let dst_ip = match dst_ip {
        None => {
            errors.push(ValidationError::MissingField("dst_ip"));
            None
        }
        Some(Err(raw)) => {
            errors.push(ValidationError::InvalidDestinationIp(raw));
            None
        }
        Some(Ok(ip)) => Some(ip),
    };

    if !errors.is_empty() {
        return Err(errors);
    }

    let mut record = FlowRecord::new(flow_type, device, clock.export_time);
    record.src_ip = src_ip;
    record.dst_ip = dst_ip;
    record.src_port = take_uint(&mut fields, "src_port");
    record.dst_port = take_uint(&mut fields, "dst_port");
    record.protocol = take_uint(&mut fields, "protocol");
    record.tos = take_uint(&mut fields, "tos");
    record.tcp_flags = take_uint(&mut fields, "tcp_flags");
    record.bytes = take_uint::<u64>(&mut fields, "bytes")
        .or_else(|| take_uint(&mut fields, "bytes_total"))
        .unwrap_or(0);
    record.packets = take_uint::<u64>(&mut fields, "packets")
        .or_else(|| take_uint(&mut fields, "packets_total"))
        .unwrap_or(0);
    record.src_as = take_uint(&mut fields, "src_as");
    record.dst_as = take_uint(&mut fields, "dst_as");
    record.input_if = take_uint(&mut fields, "input_if");
    record.output_if = take_uint(&mut fields, "output_if");
    record.next_hop = take_ip(&mut fields, &["next_hop", "next_hop_ipv6"]).and_then(Result::ok);
    record.start_time = take_time(&mut fields, clock, "flow_start_ms", "flow_start_secs", "first_switched");
    record.end_time = take_time(&mut fields, clock, "flow_end_ms", "flow_end_secs", "last_switched");
    record.extra = fields;

    Ok(record)
}

fn take_ip(fields: &mut FieldMap, names: &[&str]) -> Option<Result<IpAddr, String>> {
    let value = names.iter().find_map(|name| fields.remove(*name))?;
    Some(match value {
        FieldValue::Ip(ip) => Ok(ip),
        FieldValue::Text(s) => s.trim().parse::<IpAddr>().map_err(|_| s),
        other => Err(other.to_string()),
    })
}

fn take_uint<T: TryFrom<u64>>(fields: &mut FieldMap, name: &str) -> Option<T> {
    let value = fields.remove(name)?;
    value.as_u64().and_then(|v| T::try_from(v).ok())
}

fn take_time(
    fields: &mut FieldMap,
    clock: &PacketClock,
    millis: &str,
    secs: &str,
    uptime: &str,
) -> Option<DateTime<Utc>> {
    let from_millis = take_uint::<i64>(fields, millis)
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
    let from_secs = take_uint::<i64>(fields, secs).and_then(|s| Utc.timestamp_opt(s, 0).single());
    let from_uptime = take_uint::<u64>(fields, uptime).and_then(|ms| clock.from_uptime(ms));
    from_millis.or(from_secs).or(from_uptime)
}
