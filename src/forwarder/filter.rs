//! Per-target record filters. Every filter field is optional and an absent
//! or blank one matches anything; a record is forwarded to a target only
//! when all of its present filters match.
use ipnet::IpNet;
use std::net::IpAddr;

use super::errors::FilterError;
use super::rules::Rule;
use super::target::TargetSettings;
use crate::flow::FlowRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpMatcher {
    Exact(IpAddr),
    Network(IpNet),
}

impl IpMatcher {
    pub fn parse(field: &'static str, value: &str) -> Result<Self, FilterError> {
        let invalid = || FilterError::InvalidAddress {
            field,
            value: value.to_owned(),
        };
        if value.contains('/') {
            value.parse::<IpNet>().map(Self::Network).map_err(|_| invalid())
        } else {
            value.parse::<IpAddr>().map(Self::Exact).map_err(|_| invalid())
        }
    }

    pub fn matches(&self, ip: IpAddr) -> bool {
        match self {
            Self::Exact(exact) => *exact == ip,
            Self::Network(net) => net.contains(&ip),
        }
    }
}

/// IANA protocol numbers for the names accepted in filters.
const PROTOCOL_NAMES: &[(&str, u8)] = &[
    ("icmp", 1),
    ("igmp", 2),
    ("tcp", 6),
    ("udp", 17),
    ("gre", 47),
    ("esp", 50),
    ("ah", 51),
    ("icmpv6", 58),
    ("ospf", 89),
    ("sctp", 132),
];

pub fn parse_protocol(value: &str) -> Result<u8, FilterError> {
    let value = value.trim();
    if let Ok(number) = value.parse::<u8>() {
        return Ok(number);
    }
    PROTOCOL_NAMES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(value))
        .map(|(_, number)| *number)
        .ok_or_else(|| FilterError::UnknownProtocol(value.to_owned()))
}

/// Parses `"TCP,17, icmp"` into protocol numbers.
pub fn parse_protocols(value: &str) -> Result<Vec<u8>, FilterError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_protocol)
        .collect()
}

pub fn parse_numbers(field: &'static str, value: &str) -> Result<Vec<u64>, FilterError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>().map_err(|_| FilterError::InvalidNumber {
                field,
                value: s.to_owned(),
            })
        })
        .collect()
}

/// Inclusive range; a missing bound is open on that side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumRange {
    pub min: Option<u64>,
    pub max: Option<u64>,
}

impl NumRange {
    pub fn parse(field: &'static str, value: &str) -> Result<Self, FilterError> {
        let invalid = || FilterError::InvalidRange {
            field,
            value: value.to_owned(),
        };
        let bound = |s: &str| -> Result<Option<u64>, FilterError> {
            let s = s.trim();
            if s.is_empty() {
                Ok(None)
            } else {
                s.parse().map(Some).map_err(|_| invalid())
            }
        };

        let range = match value.split_once('-') {
            Some((lo, hi)) => Self {
                min: bound(lo)?,
                max: bound(hi)?,
            },
            None => {
                let exact = bound(value)?.ok_or_else(invalid)?;
                Self {
                    min: Some(exact),
                    max: Some(exact),
                }
            }
        };

        if let (Some(min), Some(max)) = (range.min, range.max) {
            if min > max {
                return Err(FilterError::InvertedRange {
                    field,
                    value: value.to_owned(),
                });
            }
        }
        Ok(range)
    }

    pub fn contains(&self, value: u64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilterRules {
    src_ip: Option<IpMatcher>,
    dst_ip: Option<IpMatcher>,
    protocols: Option<Vec<u8>>,
    src_ports: Option<NumRange>,
    dst_ports: Option<NumRange>,
    tos: Option<Vec<u64>>,
    bytes: Option<NumRange>,
    packets: Option<NumRange>,
    custom: Option<Rule>,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl FilterRules {
    pub fn compile(settings: &TargetSettings) -> Result<Self, FilterError> {
        Ok(Self {
            src_ip: present(&settings.filter_src_ip)
                .map(|v| IpMatcher::parse("filter_src_ip", v))
                .transpose()?,
            dst_ip: present(&settings.filter_dst_ip)
                .map(|v| IpMatcher::parse("filter_dst_ip", v))
                .transpose()?,
            protocols: present(&settings.filter_protocol)
                .map(parse_protocols)
                .transpose()?,
            src_ports: present(&settings.filter_src_port_range)
                .map(|v| NumRange::parse("filter_src_port_range", v))
                .transpose()?,
            dst_ports: present(&settings.filter_dst_port_range)
                .map(|v| NumRange::parse("filter_dst_port_range", v))
                .transpose()?,
            tos: present(&settings.filter_tos)
                .map(|v| parse_numbers("filter_tos", v))
                .transpose()?,
            bytes: present(&settings.filter_bytes_range)
                .map(|v| NumRange::parse("filter_bytes_range", v))
                .transpose()?,
            packets: present(&settings.filter_packets_range)
                .map(|v| NumRange::parse("filter_packets_range", v))
                .transpose()?,
            custom: settings.custom_rule.as_ref().map(|r| r.compile()).transpose()?,
        })
    }

    pub fn matches(&self, record: &FlowRecord) -> bool {
        // a filter on a field the record lacks never matches
        fn check<F, V>(filter: &Option<F>, value: Option<V>, test: impl Fn(&F, V) -> bool) -> bool {
            match (filter, value) {
                (None, _) => true,
                (Some(f), Some(v)) => test(f, v),
                (Some(_), None) => false,
            }
        }

        check(&self.src_ip, record.src_ip, IpMatcher::matches)
            && check(&self.dst_ip, record.dst_ip, IpMatcher::matches)
            && check(&self.protocols, record.protocol, |set, p| set.contains(&p))
            && check(&self.src_ports, record.src_port, |r, p| r.contains(p.into()))
            && check(&self.dst_ports, record.dst_port, |r, p| r.contains(p.into()))
            && check(&self.tos, record.tos, |set, t| set.contains(&u64::from(t)))
            && check(&self.bytes, Some(record.bytes), NumRange::contains)
            && check(&self.packets, Some(record.packets), NumRange::contains)
            && self.custom.as_ref().map_or(true, |rule| rule.eval(record))
    }
}
