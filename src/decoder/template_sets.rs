//! NetFlow v9 and IPFIX share the same shape: a header followed by sets
//! that either define templates or carry data records framed by a
//! previously defined template. The two dialects differ in header layout,
//! set ids and template record encoding.
use chrono::{DateTime, TimeZone, Utc};
use log::debug;

use super::errors::{DecodeError, SkipReason};
use super::fields::decode_record;
use super::reader::Reader;
use super::DecodedPacket;
use crate::flow::{FlowType, RawDatagram};
use crate::templates::{SourceId, TemplateField, TemplateKind, TemplateStore};
use crate::validator::{self, PacketClock, ValidationOutcome};

pub const V9_HEADER_LEN: usize = 20;
pub const IPFIX_HEADER_LEN: usize = 16;

const SET_HEADER_LEN: usize = 4;
const FIRST_DATA_SET_ID: u16 = 256;
const VARIABLE_LENGTH: u16 = 65535;
const ENTERPRISE_BIT: u16 = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    NetflowV9,
    Ipfix,
}

impl Dialect {
    fn flow_type(self) -> FlowType {
        match self {
            Self::NetflowV9 => FlowType::Netflow9,
            Self::Ipfix => FlowType::Ipfix,
        }
    }

    fn template_set_id(self) -> u16 {
        match self {
            Self::NetflowV9 => 0,
            Self::Ipfix => 2,
        }
    }

    fn options_template_set_id(self) -> u16 {
        match self {
            Self::NetflowV9 => 1,
            Self::Ipfix => 3,
        }
    }
}

struct PacketHeader {
    clock: PacketClock,
    domain: u32,
    /// End of the region holding sets; IPFIX declares it in the header.
    body_end: usize,
    body_start: usize,
}

fn parse_header(dialect: Dialect, payload: &[u8]) -> Result<PacketHeader, DecodeError> {
    let mut r = Reader::new(payload);
    match dialect {
        Dialect::NetflowV9 => {
            let (sys_uptime, unix_secs, source_id) =
                read_v9_header(&mut r).ok_or(DecodeError::TooShort {
                    protocol: "netflow9",
                    len: payload.len(),
                    min: V9_HEADER_LEN,
                })?;

            Ok(PacketHeader {
                clock: PacketClock {
                    export_time: seconds(unix_secs),
                    sys_uptime_ms: Some(sys_uptime),
                },
                domain: source_id,
                body_start: V9_HEADER_LEN,
                body_end: payload.len(),
            })
        }
        Dialect::Ipfix => {
            let (length, export_time, domain) =
                read_ipfix_header(&mut r).ok_or(DecodeError::TooShort {
                    protocol: "ipfix",
                    len: payload.len(),
                    min: IPFIX_HEADER_LEN,
                })?;

            let declared = length as usize;
            let body_end = if declared >= IPFIX_HEADER_LEN {
                declared.min(payload.len())
            } else {
                payload.len()
            };

            Ok(PacketHeader {
                clock: PacketClock {
                    export_time: seconds(export_time),
                    sys_uptime_ms: None,
                },
                domain,
                body_start: IPFIX_HEADER_LEN,
                body_end,
            })
        }
    }
}

// version, count, sys_uptime, unix_secs, sequence, source_id
fn read_v9_header(r: &mut Reader) -> Option<(u32, u32, u32)> {
    r.skip(4)?;
    let sys_uptime = r.u32()?;
    let unix_secs = r.u32()?;
    r.skip(4)?;
    Some((sys_uptime, unix_secs, r.u32()?))
}

// version, length, export_time, sequence, observation_domain
fn read_ipfix_header(r: &mut Reader) -> Option<(u16, u32, u32)> {
    r.skip(2)?;
    let length = r.u16()?;
    let export_time = r.u32()?;
    r.skip(4)?;
    Some((length, export_time, r.u32()?))
}

fn seconds(secs: u32) -> DateTime<Utc> {
    Utc.timestamp_opt(secs as i64, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Decodes a NetFlow v9 or IPFIX packet, learning templates on the way.
pub fn decode(
    dialect: Dialect,
    datagram: &RawDatagram,
    templates: &TemplateStore,
) -> Result<DecodedPacket, DecodeError> {
    let payload = &datagram.payload[..];
    let header = parse_header(dialect, payload)?;
    let source_id = SourceId::new(datagram.source.ip(), header.domain);
    let mut packet = DecodedPacket::new(dialect.flow_type());

    let mut offset = header.body_start;
    while offset + SET_HEADER_LEN <= header.body_end {
        let set_id = u16::from_be_bytes([payload[offset], payload[offset + 1]]);
        let set_len = u16::from_be_bytes([payload[offset + 2], payload[offset + 3]]);

        if (set_len as usize) < SET_HEADER_LEN {
            // no way to find the next set boundary
            let err = DecodeError::InvalidSetLength {
                offset,
                length: set_len,
            };
            if packet.is_empty() {
                return Err(err);
            }
            debug!("stopping at bad flow-set from {}: {}", datagram.source, err);
            packet.malformed_sets += 1;
            break;
        }

        // a set running past the end is decoded as far as it goes; records
        // cut short are counted as truncated
        let set_end = (offset + set_len as usize).min(header.body_end);
        let body = &payload[offset + SET_HEADER_LEN..set_end];

        if set_id == dialect.template_set_id() {
            learn_templates(dialect, body, source_id, templates, &mut packet, false);
        } else if set_id == dialect.options_template_set_id() {
            learn_templates(dialect, body, source_id, templates, &mut packet, true);
        } else if set_id >= FIRST_DATA_SET_ID {
            decode_data_set(set_id, body, source_id, &header.clock, datagram, templates, &mut packet);
        } else {
            debug!("ignoring reserved set id {} from {}", set_id, datagram.source);
        }

        offset += set_len as usize;
    }

    Ok(packet)
}

fn learn_templates(
    dialect: Dialect,
    body: &[u8],
    source_id: SourceId,
    templates: &TemplateStore,
    packet: &mut DecodedPacket,
    options: bool,
) {
    let mut r = Reader::new(body);
    loop {
        let parsed = match (dialect, options) {
            (Dialect::NetflowV9, false) => parse_v9_template(&mut r),
            (Dialect::NetflowV9, true) => parse_v9_options_template(&mut r),
            (Dialect::Ipfix, false) => parse_ipfix_template(&mut r, false),
            (Dialect::Ipfix, true) => parse_ipfix_template(&mut r, true),
        };

        let parsed = match parsed {
            Some(p) => p,
            // what is left is padding or a cut-off record
            None => break,
        };

        match parsed {
            ParsedTemplate::Reserved(template_id) => {
                debug!(
                    "template id {} from {} is reserved, ignoring definition",
                    template_id, source_id
                );
                packet.templates_rejected += 1;
            }
            ParsedTemplate::Withdraw(template_id) => {
                if templates.withdraw(source_id, template_id) {
                    debug!("template {} from {} withdrawn", template_id, source_id);
                }
            }
            ParsedTemplate::Define {
                template_id,
                kind,
                fields,
            } => {
                if fields.iter().any(|f| f.length == VARIABLE_LENGTH) {
                    debug!(
                        "template {} from {} uses variable-length fields, not supported",
                        template_id, source_id
                    );
                    packet.templates_rejected += 1;
                    continue;
                }
                match templates.store_at(source_id, template_id, kind, fields, Utc::now()) {
                    Ok(_) => packet.templates_learned += 1,
                    Err(e) => {
                        debug!("{}", e);
                        packet.templates_rejected += 1;
                    }
                }
            }
        }
    }
}

enum ParsedTemplate {
    Define {
        template_id: u16,
        kind: TemplateKind,
        fields: Vec<TemplateField>,
    },
    Withdraw(u16),
    /// A well-formed record whose id falls below the data set range.
    Reserved(u16),
}

fn parse_v9_template(r: &mut Reader) -> Option<ParsedTemplate> {
    let template_id = r.u16()?;
    let field_count = r.u16()?;
    let mut fields = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        fields.push(TemplateField::new(r.u16()?, r.u16()?));
    }
    if template_id < FIRST_DATA_SET_ID {
        return Some(ParsedTemplate::Reserved(template_id));
    }
    Some(ParsedTemplate::Define {
        template_id,
        kind: TemplateKind::Data,
        fields,
    })
}

fn parse_v9_options_template(r: &mut Reader) -> Option<ParsedTemplate> {
    let template_id = r.u16()?;
    let scope_len = r.u16()? as usize;
    let option_len = r.u16()? as usize;
    let scope_fields = scope_len / 4;
    let mut fields = Vec::with_capacity(scope_fields + option_len / 4);
    for _ in 0..(scope_fields + option_len / 4) {
        fields.push(TemplateField::new(r.u16()?, r.u16()?));
    }
    if template_id < FIRST_DATA_SET_ID {
        return Some(ParsedTemplate::Reserved(template_id));
    }
    Some(ParsedTemplate::Define {
        template_id,
        kind: TemplateKind::Options {
            scope_fields: scope_fields as u16,
        },
        fields,
    })
}

fn parse_ipfix_template(r: &mut Reader, options: bool) -> Option<ParsedTemplate> {
    let template_id = r.u16()?;
    let field_count = r.u16()?;
    if template_id < FIRST_DATA_SET_ID && field_count == 0 {
        return Some(ParsedTemplate::Reserved(template_id));
    }
    if field_count == 0 {
        return Some(ParsedTemplate::Withdraw(template_id));
    }
    let scope_fields = if options { r.u16()? } else { 0 };

    let mut fields = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        let raw_type = r.u16()?;
        let length = r.u16()?;
        let enterprise = if raw_type & ENTERPRISE_BIT != 0 {
            Some(r.u32()?)
        } else {
            None
        };
        fields.push(TemplateField {
            field_type: raw_type & !ENTERPRISE_BIT,
            length,
            enterprise,
        });
    }

    if template_id < FIRST_DATA_SET_ID {
        return Some(ParsedTemplate::Reserved(template_id));
    }
    let kind = if options {
        TemplateKind::Options { scope_fields }
    } else {
        TemplateKind::Data
    };
    Some(ParsedTemplate::Define {
        template_id,
        kind,
        fields,
    })
}

fn decode_data_set(
    template_id: u16,
    body: &[u8],
    source_id: SourceId,
    clock: &PacketClock,
    datagram: &RawDatagram,
    templates: &TemplateStore,
    packet: &mut DecodedPacket,
) {
    let template = match templates.lookup(source_id, template_id) {
        Some(t) => t,
        None => {
            debug!(
                "no template {} for {}, skipping data flow-set",
                template_id, source_id
            );
            packet.note_missing_template(source_id, template_id);
            return;
        }
    };

    let record_length = template.record_length;
    if record_length == 0 {
        return;
    }

    let mut chunks = body.chunks(record_length);
    for chunk in &mut chunks {
        if chunk.len() < record_length {
            // sets are padded to four bytes; anything larger is a cut-off record
            if chunk.len() >= SET_HEADER_LEN && chunk.iter().any(|b| *b != 0) {
                debug!(
                    "dropping cut-off record from {}: {} of {} bytes",
                    datagram.source,
                    chunk.len(),
                    record_length
                );
                packet.truncated_records += 1;
            }
            break;
        }

        if let TemplateKind::Options { .. } = template.kind {
            packet.option_records += 1;
            continue;
        }

        let fields = match decode_record(&template.fields, chunk) {
            Ok(f) => f,
            Err(e) => {
                debug!("dropping record from {}: {}", datagram.source, e);
                packet.truncated_records += 1;
                continue;
            }
        };

        match validator::validate(packet.flow_type, datagram.source.ip(), clock, fields) {
            Ok(record) => packet.records.push(record),
            Err(errors) => packet
                .invalid_records
                .push(ValidationOutcome::from_errors(&errors)),
        }
    }
}

impl DecodedPacket {
    fn note_missing_template(&mut self, source_id: SourceId, template_id: u16) {
        match &mut self.missing_template {
            Some(SkipReason::MissingTemplate { flow_sets, .. }) => *flow_sets += 1,
            None => {
                self.missing_template = Some(SkipReason::MissingTemplate {
                    source_id,
                    template_id,
                    flow_sets: 1,
                })
            }
        }
    }
}
