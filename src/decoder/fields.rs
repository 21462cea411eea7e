use lazy_static::lazy_static;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::errors::DecodeError;
use crate::flow::{FieldMap, FieldValue};
use crate::templates::TemplateField;

/// How the bytes of a registered field are interpreted beyond plain
/// big-endian integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Unsigned,
    Ipv4,
    Ipv6,
    Mac,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

lazy_static! {
    /// NetFlow v9 / IPFIX information elements this collector interprets.
    /// The two protocols share numbering for everything listed here.
    static ref FIELD_REGISTRY: HashMap<u16, FieldSpec> = {
        use FieldKind::*;
        let entries: &[(u16, &'static str, FieldKind)] = &[
            (1, "bytes", Unsigned),
            (2, "packets", Unsigned),
            (3, "flows", Unsigned),
            (4, "protocol", Unsigned),
            (5, "tos", Unsigned),
            (6, "tcp_flags", Unsigned),
            (7, "src_port", Unsigned),
            (8, "src_ip", Ipv4),
            (9, "src_mask", Unsigned),
            (10, "input_if", Unsigned),
            (11, "dst_port", Unsigned),
            (12, "dst_ip", Ipv4),
            (13, "dst_mask", Unsigned),
            (14, "output_if", Unsigned),
            (15, "next_hop", Ipv4),
            (16, "src_as", Unsigned),
            (17, "dst_as", Unsigned),
            (18, "bgp_next_hop", Ipv4),
            (21, "last_switched", Unsigned),
            (22, "first_switched", Unsigned),
            (23, "out_bytes", Unsigned),
            (24, "out_packets", Unsigned),
            (27, "src_ipv6", Ipv6),
            (28, "dst_ipv6", Ipv6),
            (29, "src_ipv6_mask", Unsigned),
            (30, "dst_ipv6_mask", Unsigned),
            (31, "ipv6_flow_label", Unsigned),
            (32, "icmp_type", Unsigned),
            (34, "sampling_interval", Unsigned),
            (35, "sampling_algorithm", Unsigned),
            (56, "src_mac", Mac),
            (57, "dst_mac", Mac),
            (58, "src_vlan", Unsigned),
            (59, "dst_vlan", Unsigned),
            (60, "ip_version", Unsigned),
            (61, "direction", Unsigned),
            (62, "next_hop_ipv6", Ipv6),
            (63, "bgp_next_hop_ipv6", Ipv6),
            (80, "in_dst_mac", Mac),
            (81, "out_src_mac", Mac),
            (85, "bytes_total", Unsigned),
            (86, "packets_total", Unsigned),
            (89, "forwarding_status", Unsigned),
            (136, "flow_end_reason", Unsigned),
            (148, "flow_id", Unsigned),
            (150, "flow_start_secs", Unsigned),
            (151, "flow_end_secs", Unsigned),
            (152, "flow_start_ms", Unsigned),
            (153, "flow_end_ms", Unsigned),
            (176, "icmp_type_ipv4", Unsigned),
            (225, "post_nat_src_ip", Ipv4),
            (226, "post_nat_dst_ip", Ipv4),
            (227, "post_nat_src_port", Unsigned),
            (228, "post_nat_dst_port", Unsigned),
            (234, "ingress_vrf", Unsigned),
            (235, "egress_vrf", Unsigned),
        ];

        entries
            .iter()
            .map(|&(code, name, kind)| (code, FieldSpec { name, kind }))
            .collect()
    };
}

pub fn lookup_field(field: &TemplateField) -> Option<&'static FieldSpec> {
    if field.enterprise.is_some() {
        return None;
    }
    FIELD_REGISTRY.get(&field.field_type)
}

pub fn field_name(field: &TemplateField) -> String {
    match lookup_field(field) {
        Some(spec) => spec.name.to_owned(),
        None => format!("UNKNOWN_{}", field.field_type),
    }
}

/// Interprets `raw` according to its registered kind and length.
pub fn parse_value(kind: Option<FieldKind>, raw: &[u8]) -> FieldValue {
    match (kind, raw.len()) {
        (_, 0) => FieldValue::Null,
        (Some(FieldKind::Ipv4), 4) => {
            FieldValue::Ip(IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3])))
        }
        (Some(FieldKind::Ipv6), 16) => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(raw);
            FieldValue::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        (Some(FieldKind::Mac), 6) => FieldValue::Text(
            raw.iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(":"),
        ),
        (_, len) if len <= 8 => FieldValue::UInt(
            raw.iter()
                .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
        ),
        _ => FieldValue::Text(raw.iter().map(|b| format!("{:02x}", b)).collect()),
    }
}

/// Decodes one data record laid out by `fields`.
///
/// Unknown fields are kept under `UNKNOWN_<code>` so the cursor always
/// advances by the declared length.
pub fn decode_record(fields: &[TemplateField], data: &[u8]) -> Result<FieldMap, DecodeError> {
    let mut map = FieldMap::new();
    let mut offset = 0;

    for field in fields {
        let length = field.length as usize;
        if offset + length > data.len() {
            return Err(DecodeError::TruncatedField {
                field_type: field.field_type,
                offset,
                length: field.length,
                remaining: data.len().saturating_sub(offset),
            });
        }

        let raw = &data[offset..offset + length];
        let kind = lookup_field(field).map(|spec| spec.kind);
        map.insert(field_name(field), parse_value(kind, raw));
        offset += length;
    }

    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(Some(FieldKind::Unsigned), &[0x2a], FieldValue::UInt(42); "one byte")]
    #[test_case(Some(FieldKind::Unsigned), &[0x01, 0xbb], FieldValue::UInt(443); "two bytes")]
    #[test_case(Some(FieldKind::Unsigned), &[0, 0, 0x01, 0xf4], FieldValue::UInt(500); "four byte counter")]
    #[test_case(Some(FieldKind::Unsigned), &[0, 0, 0x01, 0x8b, 0xcf, 0xe5, 0x68, 0x00], FieldValue::UInt(1_700_000_000_000); "eight byte millis")]
    #[test_case(Some(FieldKind::Ipv4), &[192, 168, 1, 1], FieldValue::Ip("192.168.1.1".parse().unwrap()); "ipv4")]
    #[test_case(Some(FieldKind::Ipv6), &[0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1], FieldValue::Ip("2001:db8::1".parse().unwrap()); "ipv6")]
    #[test_case(Some(FieldKind::Mac), &[0, 0x1b, 0x44, 0x11, 0x3a, 0xb7], FieldValue::Text("00:1b:44:11:3a:b7".to_owned()); "mac")]
    #[test_case(None, &[], FieldValue::Null; "empty")]
    #[test_case(None, &[0xde, 0xad, 0xbe, 0xef, 0, 1, 2, 3, 4], FieldValue::Text("deadbeef0001020304".to_owned()); "long opaque")]
    fn test_parse_value(kind: Option<FieldKind>, raw: &[u8], expected: FieldValue) {
        assert_eq!(expected, parse_value(kind, raw));
    }

    #[test]
    fn test_ipv4_kind_with_odd_length_falls_back_to_integer() {
        assert_eq!(FieldValue::UInt(0x0a00), parse_value(Some(FieldKind::Ipv4), &[0x0a, 0x00]));
    }

    #[test]
    fn test_decode_record_with_unknown_field() {
        let fields = [
            TemplateField::new(8, 4),
            TemplateField::new(999, 2),
            TemplateField::new(7, 2),
        ];
        let data = [10, 0, 0, 1, 0xff, 0xff, 0x00, 0x50];

        let map = decode_record(&fields, &data).unwrap();

        assert_eq!(Some(&FieldValue::Ip("10.0.0.1".parse().unwrap())), map.get("src_ip"));
        assert_eq!(Some(&FieldValue::UInt(0xffff)), map.get("UNKNOWN_999"));
        assert_eq!(Some(&FieldValue::UInt(80)), map.get("src_port"));
    }

    #[test]
    fn test_enterprise_fields_are_not_interpreted() {
        let field = TemplateField {
            field_type: 8,
            length: 4,
            enterprise: Some(9),
        };
        assert_eq!("UNKNOWN_8", field_name(&field));
    }

    #[test]
    fn test_decode_record_truncated() {
        let fields = [TemplateField::new(8, 4), TemplateField::new(12, 4)];
        let data = [10, 0, 0, 1, 10, 0];

        assert_eq!(
            Err(DecodeError::TruncatedField {
                field_type: 12,
                offset: 4,
                length: 4,
                remaining: 2,
            }),
            decode_record(&fields, &data)
        );
    }
}
