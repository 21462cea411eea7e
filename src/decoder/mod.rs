pub mod errors;
pub mod fields;
pub mod netflow_v5;
pub(crate) mod reader;
pub mod sflow;
pub mod template_sets;

use log::debug;
use std::sync::Arc;

use crate::flow::{FlowRecord, FlowType, RawDatagram};
use crate::templates::TemplateStore;
use crate::validator::ValidationOutcome;
use errors::{DecodeError, SkipReason};
use template_sets::Dialect;

pub const DEFAULT_NETFLOW5_MAX_RECORDS: usize = 30;

/// Shortest prefix needed to tell the protocols apart.
const SNIFF_LEN: usize = 4;

/// Everything one datagram produced.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPacket {
    pub flow_type: FlowType,
    pub records: Vec<FlowRecord>,
    pub invalid_records: Vec<ValidationOutcome>,
    pub templates_learned: usize,
    pub templates_rejected: usize,
    /// Set when at least one data flow-set referenced an unknown template.
    pub missing_template: Option<SkipReason>,
    pub truncated_records: usize,
    pub records_over_cap: usize,
    pub option_records: usize,
    pub malformed_sets: usize,
}

impl DecodedPacket {
    pub fn new(flow_type: FlowType) -> Self {
        Self {
            flow_type,
            records: Vec::new(),
            invalid_records: Vec::new(),
            templates_learned: 0,
            templates_rejected: 0,
            missing_template: None,
            truncated_records: 0,
            records_over_cap: 0,
            option_records: 0,
            malformed_sets: 0,
        }
    }

    /// Nothing was decoded, learned or even attempted.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
            && self.invalid_records.is_empty()
            && self.templates_learned == 0
            && self.templates_rejected == 0
            && self.option_records == 0
            && self.truncated_records == 0
            && self.missing_template.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutcome {
    Ok(DecodedPacket),
    /// Well formed, but only usable once the exporter sends its templates.
    Skip(SkipReason),
    Invalid(DecodeError),
}

/// Turns datagrams into flow records. The only state it touches is the
/// template store it was built with.
#[derive(Clone)]
pub struct Decoder {
    templates: Arc<TemplateStore>,
    netflow5_max_records: usize,
}

impl Decoder {
    pub fn new(templates: Arc<TemplateStore>, netflow5_max_records: usize) -> Self {
        Self {
            templates,
            netflow5_max_records,
        }
    }

    pub fn templates(&self) -> &Arc<TemplateStore> {
        &self.templates
    }

    pub fn decode(&self, datagram: &RawDatagram) -> DecodeOutcome {
        let flow_type = match sniff(&datagram.payload) {
            Ok(flow_type) => flow_type,
            Err(e) => return DecodeOutcome::Invalid(e),
        };

        if flow_type != datagram.hint {
            debug!(
                "{} sent {} to the {} listener",
                datagram.source, flow_type, datagram.hint
            );
        }

        let decoded = match flow_type {
            FlowType::Netflow5 => netflow_v5::decode(datagram, self.netflow5_max_records),
            FlowType::Netflow9 => template_sets::decode(Dialect::NetflowV9, datagram, &self.templates),
            FlowType::Ipfix => template_sets::decode(Dialect::Ipfix, datagram, &self.templates),
            FlowType::Sflow5 => sflow::decode(datagram),
        };

        match decoded {
            Err(e) => DecodeOutcome::Invalid(e),
            Ok(packet) => match packet.missing_template.clone() {
                Some(reason)
                    if packet.records.is_empty()
                        && packet.invalid_records.is_empty()
                        && packet.templates_learned == 0 =>
                {
                    DecodeOutcome::Skip(reason)
                }
                _ => DecodeOutcome::Ok(packet),
            },
        }
    }
}

/// Identifies the export protocol from the leading version field.
pub fn sniff(payload: &[u8]) -> Result<FlowType, DecodeError> {
    if payload.len() < SNIFF_LEN {
        return Err(DecodeError::TooShort {
            protocol: "flow export",
            len: payload.len(),
            min: SNIFF_LEN,
        });
    }

    let version = u16::from_be_bytes([payload[0], payload[1]]);
    match version {
        5 => Ok(FlowType::Netflow5),
        9 => Ok(FlowType::Netflow9),
        10 => Ok(FlowType::Ipfix),
        _ => {
            let long = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
            if long == 5 {
                Ok(FlowType::Sflow5)
            } else if version == 0 {
                Err(DecodeError::UnknownVersion(long))
            } else {
                Err(DecodeError::UnknownVersion(version.into()))
            }
        }
    }
}
