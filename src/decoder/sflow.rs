use std::net::IpAddr;

use super::errors::DecodeError;
use super::reader::Reader;
use super::DecodedPacket;
use crate::flow::{FieldValue, FlowRecord, FlowType, RawDatagram};

pub const MIN_HEADER_LEN: usize = 20;

const AGENT_IPV4: u32 = 1;
const AGENT_IPV6: u32 = 2;

/// Validates the sFlow v5 datagram header and summarizes the datagram as a
/// single coarse record. Samples are counted, not decomposed.
pub fn decode(datagram: &RawDatagram) -> Result<DecodedPacket, DecodeError> {
    let payload = &datagram.payload[..];
    if payload.len() < MIN_HEADER_LEN {
        return Err(DecodeError::TooShort {
            protocol: "sflow5",
            len: payload.len(),
            min: MIN_HEADER_LEN,
        });
    }

    let mut record = FlowRecord::new(
        FlowType::Sflow5,
        datagram.source.ip(),
        datagram.received_at,
    );
    record.raw_length = Some(payload.len());

    let mut r = Reader::new(payload);
    r.skip(4);
    let agent = match r.u32() {
        Some(AGENT_IPV4) => r.ipv4().map(IpAddr::V4),
        Some(AGENT_IPV6) => r.ipv6().map(IpAddr::V6),
        _ => None,
    };
    if let Some(agent) = agent {
        record
            .extra
            .insert("agent_address".to_owned(), FieldValue::Ip(agent));

        // sub_agent_id, sequence_number, uptime, num_samples
        let tail = (|| Some((r.u32()?, r.u32()?, r.u32()?, r.u32()?)))();
        if let Some((sub_agent, sequence, _uptime, samples)) = tail {
            record
                .extra
                .insert("sub_agent_id".to_owned(), FieldValue::UInt(sub_agent.into()));
            record
                .extra
                .insert("sequence_number".to_owned(), FieldValue::UInt(sequence.into()));
            record
                .extra
                .insert("samples".to_owned(), FieldValue::UInt(samples.into()));
        }
    }

    let mut packet = DecodedPacket::new(FlowType::Sflow5);
    packet.records.push(record);
    Ok(packet)
}
