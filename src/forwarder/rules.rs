//! Structured custom rules for forwarding targets, e.g.
//!
//! ```yaml
//! custom_rule:
//!   any:
//!     - condition: { field: dst_port, op: in, value: "53,853" }
//!     - not:
//!         condition: { field: src_ip, op: in_cidr, value: 10.0.0.0/8 }
//! ```
use ipnet::IpNet;
use serde::Deserialize;
use std::net::IpAddr;

use super::errors::FilterError;
use super::filter::{parse_protocol, parse_protocols};
use crate::flow::{FlowRecord, FlowType};

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleExpr {
    All(Vec<RuleExpr>),
    Any(Vec<RuleExpr>),
    Not(Box<RuleExpr>),
    Condition(Condition),
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Condition {
    pub field: String,
    pub op: Op,
    pub value: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    /// Value is a comma separated list.
    In,
    InCidr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericField {
    SrcPort,
    DstPort,
    Protocol,
    Tos,
    TcpFlags,
    Bytes,
    Packets,
    SrcAs,
    DstAs,
    InputIf,
    OutputIf,
}

impl NumericField {
    fn get(self, r: &FlowRecord) -> Option<u64> {
        match self {
            Self::SrcPort => r.src_port.map(u64::from),
            Self::DstPort => r.dst_port.map(u64::from),
            Self::Protocol => r.protocol.map(u64::from),
            Self::Tos => r.tos.map(u64::from),
            Self::TcpFlags => r.tcp_flags.map(u64::from),
            Self::Bytes => Some(r.bytes),
            Self::Packets => Some(r.packets),
            Self::SrcAs => r.src_as.map(u64::from),
            Self::DstAs => r.dst_as.map(u64::from),
            Self::InputIf => r.input_if.map(u64::from),
            Self::OutputIf => r.output_if.map(u64::from),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressField {
    SrcIp,
    DstIp,
    NextHop,
    Device,
}

impl AddressField {
    fn get(self, r: &FlowRecord) -> Option<IpAddr> {
        match self {
            Self::SrcIp => r.src_ip,
            Self::DstIp => r.dst_ip,
            Self::NextHop => r.next_hop,
            Self::Device => Some(r.device_source_ip),
        }
    }
}

/// A compiled [`RuleExpr`]. Conditions on a field the record does not carry
/// evaluate to false.
#[derive(Debug, Clone)]
pub enum Rule {
    All(Vec<Rule>),
    Any(Vec<Rule>),
    Not(Box<Rule>),
    Compare(NumericField, Op, u64),
    OneOf(NumericField, Vec<u64>),
    Address(AddressField, bool, IpAddr),
    Network(AddressField, IpNet),
    FlowTypeIs(bool, FlowType),
}

impl RuleExpr {
    pub fn compile(&self) -> Result<Rule, FilterError> {
        Ok(match self {
            Self::All(rules) => Rule::All(compile_all(rules)?),
            Self::Any(rules) => Rule::Any(compile_all(rules)?),
            Self::Not(rule) => Rule::Not(Box::new(rule.compile()?)),
            Self::Condition(c) => c.compile()?,
        })
    }
}

fn compile_all(rules: &[RuleExpr]) -> Result<Vec<Rule>, FilterError> {
    rules.iter().map(RuleExpr::compile).collect()
}

impl Condition {
    fn invalid(&self) -> FilterError {
        FilterError::InvalidRuleValue {
            field: self.field.clone(),
            value: self.value.clone(),
        }
    }

    fn compile(&self) -> Result<Rule, FilterError> {
        let value = self.value.trim();

        if let Some(field) = address_field(&self.field) {
            return match self.op {
                Op::Eq | Op::Ne => value
                    .parse()
                    .map(|ip| Rule::Address(field, self.op == Op::Eq, ip))
                    .map_err(|_| self.invalid()),
                Op::InCidr => value
                    .parse()
                    .map(|net| Rule::Network(field, net))
                    .map_err(|_| self.invalid()),
                _ => Err(self.invalid()),
            };
        }

        if self.field == "flow_type" {
            let flow_type = FlowType::all()
                .into_iter()
                .find(|t| t.as_str().eq_ignore_ascii_case(value))
                .ok_or_else(|| self.invalid())?;
            return match self.op {
                Op::Eq | Op::Ne => Ok(Rule::FlowTypeIs(self.op == Op::Eq, flow_type)),
                _ => Err(self.invalid()),
            };
        }

        let field = numeric_field(&self.field)
            .ok_or_else(|| FilterError::UnknownField(self.field.clone()))?;
        let is_protocol = field == NumericField::Protocol;

        match self.op {
            Op::InCidr => Err(self.invalid()),
            Op::In => {
                let values: Vec<u64> = if is_protocol {
                    parse_protocols(value)?.into_iter().map(u64::from).collect()
                } else {
                    value
                        .split(',')
                        .map(|v| v.trim().parse::<u64>().map_err(|_| self.invalid()))
                        .collect::<Result<Vec<u64>, _>>()?
                };
                Ok(Rule::OneOf(field, values))
            }
            op => {
                let number: u64 = if is_protocol {
                    parse_protocol(value)?.into()
                } else {
                    value.parse::<u64>().map_err(|_| self.invalid())?
                };
                Ok(Rule::Compare(field, op, number))
            }
        }
    }
}

fn address_field(name: &str) -> Option<AddressField> {
    Some(match name {
        "src_ip" => AddressField::SrcIp,
        "dst_ip" => AddressField::DstIp,
        "next_hop" => AddressField::NextHop,
        "device_source_ip" => AddressField::Device,
        _ => return None,
    })
}

fn numeric_field(name: &str) -> Option<NumericField> {
    Some(match name {
        "src_port" => NumericField::SrcPort,
        "dst_port" => NumericField::DstPort,
        "protocol" => NumericField::Protocol,
        "tos" => NumericField::Tos,
        "tcp_flags" => NumericField::TcpFlags,
        "bytes" => NumericField::Bytes,
        "packets" => NumericField::Packets,
        "src_as" => NumericField::SrcAs,
        "dst_as" => NumericField::DstAs,
        "input_if" => NumericField::InputIf,
        "output_if" => NumericField::OutputIf,
        _ => return None,
    })
}

impl Rule {
    pub fn eval(&self, record: &FlowRecord) -> bool {
        match self {
            Self::All(rules) => rules.iter().all(|r| r.eval(record)),
            Self::Any(rules) => rules.iter().any(|r| r.eval(record)),
            Self::Not(rule) => !rule.eval(record),
            Self::Compare(field, op, expected) => match field.get(record) {
                None => false,
                Some(actual) => match op {
                    Op::Eq => actual == *expected,
                    Op::Ne => actual != *expected,
                    Op::Gt => actual > *expected,
                    Op::Ge => actual >= *expected,
                    Op::Lt => actual < *expected,
                    Op::Le => actual <= *expected,
                    Op::In | Op::InCidr => false,
                },
            },
            Self::OneOf(field, values) => field.get(record).map_or(false, |v| values.contains(&v)),
            Self::Address(field, equal, ip) => field
                .get(record)
                .map_or(false, |actual| (actual == *ip) == *equal),
            Self::Network(field, net) => field.get(record).map_or(false, |ip| net.contains(&ip)),
            Self::FlowTypeIs(equal, flow_type) => (record.flow_type == *flow_type) == *equal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn record() -> FlowRecord {
        let mut record = FlowRecord::new(FlowType::Ipfix, "172.16.0.1".parse().unwrap(), Utc::now());
        record.src_ip = Some("10.1.2.3".parse().unwrap());
        record.dst_ip = Some("1.1.1.1".parse().unwrap());
        record.dst_port = Some(853);
        record.protocol = Some(6);
        record.bytes = 4096;
        record.packets = 8;
        record
    }

    fn rule(yaml: &str) -> Rule {
        serde_yaml::from_str::<RuleExpr>(yaml)
            .unwrap()
            .compile()
            .unwrap()
    }

    #[test_case("condition: { field: dst_port, op: in, value: '53,853' }", true; "port list")]
    #[test_case("condition: { field: protocol, op: eq, value: tcp }", true; "protocol by name")]
    #[test_case("condition: { field: bytes, op: gt, value: '4096' }", false; "strictly greater")]
    #[test_case("condition: { field: bytes, op: ge, value: '4096' }", true; "greater or equal")]
    #[test_case("condition: { field: src_ip, op: in_cidr, value: 10.0.0.0/8 }", true; "cidr")]
    #[test_case("condition: { field: dst_ip, op: ne, value: 1.1.1.1 }", false; "address inequality")]
    #[test_case("condition: { field: flow_type, op: eq, value: IPFIX }", true; "flow type")]
    #[test_case("condition: { field: src_as, op: eq, value: '0' }", false; "missing field never matches")]
    #[test_case("not: { condition: { field: src_as, op: eq, value: '0' } }", true; "negated missing field")]
    fn test_conditions(yaml: &str, expected: bool) {
        assert_eq!(expected, rule(yaml).eval(&record()));
    }

    #[test]
    fn test_nested_rule() {
        let rule = rule(
            "
            all:
              - any:
                  - condition: { field: dst_port, op: eq, value: '53' }
                  - condition: { field: dst_port, op: eq, value: '853' }
              - not:
                  condition: { field: src_ip, op: in_cidr, value: 192.168.0.0/16 }
              - condition: { field: packets, op: le, value: '10' }
            ",
        );

        assert_eq!(true, rule.eval(&record()));

        let mut chatty = record();
        chatty.packets = 11;
        assert_eq!(false, rule.eval(&chatty));
    }

    #[test]
    fn test_compile_errors() {
        let unknown: RuleExpr =
            serde_yaml::from_str("condition: { field: colour, op: eq, value: blue }").unwrap();
        assert_eq!(
            Err(FilterError::UnknownField("colour".to_owned())),
            unknown.compile().map(|_| ())
        );

        let bad_value: RuleExpr =
            serde_yaml::from_str("condition: { field: src_port, op: lt, value: lots }").unwrap();
        assert_eq!(
            Err(FilterError::InvalidRuleValue {
                field: "src_port".to_owned(),
                value: "lots".to_owned()
            }),
            bad_value.compile().map(|_| ())
        );

        let cidr_on_port: RuleExpr =
            serde_yaml::from_str("condition: { field: dst_port, op: in_cidr, value: 10.0.0.0/8 }")
                .unwrap();
        assert_eq!(true, cidr_on_port.compile().is_err());
    }
}
