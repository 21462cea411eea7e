use chrono::{TimeZone, Utc};
use std::net::IpAddr;

use super::errors::DecodeError;
use super::reader::Reader;
use super::DecodedPacket;
use crate::flow::{FieldValue, FlowRecord, FlowType, RawDatagram};
use crate::validator::PacketClock;

pub const HEADER_LEN: usize = 24;
pub const RECORD_LEN: usize = 48;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub count: u16,
    pub sys_uptime: u32,
    pub unix_secs: u32,
    pub unix_nsecs: u32,
    pub flow_sequence: u32,
    pub engine_type: u8,
    pub engine_id: u8,
    pub sampling_interval: u16,
}

impl Header {
    fn parse(reader: &mut Reader) -> Option<Self> {
        Some(Self {
            version: reader.u16()?,
            count: reader.u16()?,
            sys_uptime: reader.u32()?,
            unix_secs: reader.u32()?,
            unix_nsecs: reader.u32()?,
            flow_sequence: reader.u32()?,
            engine_type: reader.u8()?,
            engine_id: reader.u8()?,
            sampling_interval: reader.u16()?,
        })
    }

    fn clock(&self) -> PacketClock {
        let export_time = Utc
            .timestamp_opt(self.unix_secs as i64, self.unix_nsecs.min(999_999_999))
            .single()
            .unwrap_or_else(Utc::now);
        PacketClock {
            export_time,
            sys_uptime_ms: Some(self.sys_uptime),
        }
    }
}

/// Decodes a NetFlow v5 packet.
///
/// At most `max_records` records are decoded; any further records the
/// header announces are counted in `records_over_cap`, and announced records
/// the buffer is too short to hold are counted as truncated.
pub fn decode(datagram: &RawDatagram, max_records: usize) -> Result<DecodedPacket, DecodeError> {
    let payload = &datagram.payload[..];
    let mut reader = Reader::new(payload);
    let header = Header::parse(&mut reader).ok_or(DecodeError::TooShort {
        protocol: "netflow5",
        len: payload.len(),
        min: HEADER_LEN,
    })?;

    let clock = header.clock();
    let device = datagram.source.ip();
    let announced = header.count as usize;
    let to_decode = announced.min(max_records);

    let mut packet = DecodedPacket::new(FlowType::Netflow5);
    packet.records_over_cap = announced - to_decode;

    for _ in 0..to_decode {
        match reader.take(RECORD_LEN) {
            Some(raw) => packet.records.push(decode_record(raw, device, &clock, &header)),
            None => packet.truncated_records += 1,
        }
    }

    Ok(packet)
}

fn decode_record(raw: &[u8], device: IpAddr, clock: &PacketClock, header: &Header) -> FlowRecord {
    // `raw` is exactly RECORD_LEN bytes, so none of these reads can fail
    let mut r = Reader::new(raw);
    let mut record = FlowRecord::new(FlowType::Netflow5, device, clock.export_time);

    record.src_ip = r.ipv4().map(IpAddr::V4);
    record.dst_ip = r.ipv4().map(IpAddr::V4);
    record.next_hop = r.ipv4().map(IpAddr::V4);
    record.input_if = r.u16().map(u32::from);
    record.output_if = r.u16().map(u32::from);
    record.packets = r.u32().map(u64::from).unwrap_or_default();
    record.bytes = r.u32().map(u64::from).unwrap_or_default();
    record.start_time = r.u32().and_then(|first| clock.from_uptime(first.into()));
    record.end_time = r.u32().and_then(|last| clock.from_uptime(last.into()));
    record.src_port = r.u16();
    record.dst_port = r.u16();
    r.skip(1);
    record.tcp_flags = r.u8();
    record.protocol = r.u8();
    record.tos = r.u8();
    record.src_as = r.u16().map(u32::from);
    record.dst_as = r.u16().map(u32::from);

    if let Some(mask) = r.u8() {
        record.extra.insert("src_mask".to_owned(), FieldValue::UInt(mask.into()));
    }
    if let Some(mask) = r.u8() {
        record.extra.insert("dst_mask".to_owned(), FieldValue::UInt(mask.into()));
    }
    record.extra.insert(
        "flow_sequence".to_owned(),
        FieldValue::UInt(header.flow_sequence.into()),
    );
    if header.sampling_interval & 0x3fff != 0 {
        record.extra.insert(
            "sampling_interval".to_owned(),
            FieldValue::UInt((header.sampling_interval & 0x3fff).into()),
        );
    }

    record
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::{Ipv4Addr, SocketAddr};

    pub(crate) struct V5Flow {
        pub src: [u8; 4],
        pub dst: [u8; 4],
        pub src_port: u16,
        pub dst_port: u16,
        pub protocol: u8,
        pub packets: u32,
        pub bytes: u32,
    }

    pub(crate) fn v5_packet(count: u16, flows: &[V5Flow]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&5u16.to_be_bytes());
        buf.extend_from_slice(&count.to_be_bytes());
        buf.extend_from_slice(&60_000u32.to_be_bytes());
        buf.extend_from_slice(&1_700_000_000u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&42u32.to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&0u16.to_be_bytes());

        for f in flows {
            buf.extend_from_slice(&f.src);
            buf.extend_from_slice(&f.dst);
            buf.extend_from_slice(&[0, 0, 0, 0]);
            buf.extend_from_slice(&1u16.to_be_bytes());
            buf.extend_from_slice(&2u16.to_be_bytes());
            buf.extend_from_slice(&f.packets.to_be_bytes());
            buf.extend_from_slice(&f.bytes.to_be_bytes());
            buf.extend_from_slice(&50_000u32.to_be_bytes());
            buf.extend_from_slice(&59_000u32.to_be_bytes());
            buf.extend_from_slice(&f.src_port.to_be_bytes());
            buf.extend_from_slice(&f.dst_port.to_be_bytes());
            buf.push(0);
            buf.push(0x18);
            buf.push(f.protocol);
            buf.push(0);
            buf.extend_from_slice(&64512u16.to_be_bytes());
            buf.extend_from_slice(&15169u16.to_be_bytes());
            buf.push(24);
            buf.push(16);
            buf.extend_from_slice(&[0, 0]);
        }
        buf
    }

    pub(crate) fn sample_flow() -> V5Flow {
        V5Flow {
            src: [192, 168, 1, 1],
            dst: [8, 8, 8, 8],
            src_port: 40000,
            dst_port: 53,
            protocol: 17,
            packets: 5,
            bytes: 500,
        }
    }

    fn datagram(payload: Vec<u8>) -> RawDatagram {
        RawDatagram::new(
            payload,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1)), 5000),
            FlowType::Netflow5,
        )
    }

    #[test]
    fn test_decodes_every_announced_record() {
        let payload = v5_packet(2, &[sample_flow(), sample_flow()]);
        let packet = decode(&datagram(payload), 30).unwrap();

        assert_eq!(2, packet.records.len());
        for record in &packet.records {
            assert_eq!(Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))), record.src_ip);
            assert_eq!(Some(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))), record.dst_ip);
            assert_eq!(500, record.bytes);
            assert_eq!(5, record.packets);
            assert_eq!(Some(40000), record.src_port);
            assert_eq!(Some(53), record.dst_port);
            assert_eq!(Some(17), record.protocol);
            assert_eq!(Some(0x18), record.tcp_flags);
            assert_eq!(Some(64512), record.src_as);
            assert_eq!(Some(15169), record.dst_as);
            assert_eq!(Some(1), record.input_if);
            assert_eq!(Some(2), record.output_if);
            assert_eq!(
                Some(Utc.timestamp_opt(1_699_999_990, 0).unwrap()),
                record.start_time
            );
            assert_eq!(
                Some(Utc.timestamp_opt(1_699_999_999, 0).unwrap()),
                record.end_time
            );
            assert_eq!(IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1)), record.device_source_ip);
            assert_eq!(Some(&FieldValue::UInt(24)), record.extra.get("src_mask"));
        }
        assert_eq!(0, packet.truncated_records);
        assert_eq!(0, packet.records_over_cap);
    }

    #[test]
    fn test_record_cap_is_counted() {
        let flows: Vec<V5Flow> = (0..5).map(|_| sample_flow()).collect();
        let payload = v5_packet(5, &flows);

        let packet = decode(&datagram(payload), 3).unwrap();

        assert_eq!(3, packet.records.len());
        assert_eq!(2, packet.records_over_cap);
    }

    #[test]
    fn test_short_body_counts_truncated_records() {
        let mut payload = v5_packet(2, &[sample_flow(), sample_flow()]);
        payload.truncate(HEADER_LEN + RECORD_LEN + 10);

        let packet = decode(&datagram(payload), 30).unwrap();

        assert_eq!(1, packet.records.len());
        assert_eq!(1, packet.truncated_records);
    }

    #[test]
    fn test_header_too_short() {
        let result = decode(&datagram(vec![0, 5, 0, 1]), 30);

        assert_eq!(
            Err(DecodeError::TooShort {
                protocol: "netflow5",
                len: 4,
                min: HEADER_LEN
            }),
            result.map(|p| p.records.len())
        );
    }
}
