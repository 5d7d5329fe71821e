//! NetFlow v5 wire decode, shared by the UDP source, the poll-dir-mixed
//! v5-file variant, and the one-shot single-file source.

use std::net::{IpAddr, Ipv4Addr};

use flowpack_model::FlowRecord;

pub const V5_HEADER_LEN: usize = 24;
pub const V5_RECORD_LEN: usize = 48;

#[derive(Debug, Clone, Copy)]
pub struct V5Header {
    pub count: u16,
    pub sys_uptime: u32,
    pub unix_secs: u32,
    pub unix_nsecs: u32,
    pub flow_sequence: u32,
    pub engine_type: u8,
    pub engine_id: u8,
}

pub fn parse_header(buf: &[u8]) -> Option<V5Header> {
    if buf.len() < V5_HEADER_LEN {
        return None;
    }
    let version = u16::from_be_bytes([buf[0], buf[1]]);
    if version != 5 {
        return None;
    }
    Some(V5Header {
        count: u16::from_be_bytes([buf[2], buf[3]]),
        sys_uptime: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        unix_secs: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        unix_nsecs: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
        flow_sequence: u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]),
        engine_type: buf[20],
        engine_id: buf[21],
    })
}

fn parse_record(buf: &[u8], header: &V5Header) -> Option<FlowRecord> {
    if buf.len() < V5_RECORD_LEN {
        return None;
    }
    let src_addr = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
    let dst_addr = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
    let input_if = u16::from_be_bytes([buf[12], buf[13]]) as u32;
    let output_if = u16::from_be_bytes([buf[14], buf[15]]) as u32;
    let packets = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]) as u64;
    let octets = u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]) as u64;
    let first = u32::from_be_bytes([buf[24], buf[25], buf[26], buf[27]]);
    let src_port = u16::from_be_bytes([buf[32], buf[33]]);
    let dst_port = u16::from_be_bytes([buf[34], buf[35]]);
    let tcp_flags = buf[37];
    let protocol = buf[38];

    // `first` is milliseconds-since-boot (sys_uptime units); the flow's
    // wall-clock start is unix_secs adjusted by the uptime delta, per
    // the NetFlow v5 spec's SysUptime convention.
    let uptime_delta_ms = header.sys_uptime as i64 - first as i64;
    let start_time_ms = header.unix_secs as i64 * 1000 - uptime_delta_ms;

    Some(FlowRecord {
        src_addr: IpAddr::V4(src_addr),
        dst_addr: IpAddr::V4(dst_addr),
        src_port,
        dst_port,
        protocol,
        input_if,
        output_if,
        start_time_ms,
        elapsed_ms: 0,
        packets,
        bytes: octets,
        tcp_flags,
        sensor_id: 0,
        flowtype_id: 0,
        memo: 0,
    })
}

/// Parse a complete UDP datagram (or on-disk v5 packet frame) into its
/// header and flow records. `None` on a malformed or truncated packet.
pub fn parse_packet(buf: &[u8]) -> Option<(V5Header, Vec<FlowRecord>)> {
    let header = parse_header(buf)?;
    let count = header.count as usize;
    let expected_len = V5_HEADER_LEN + count * V5_RECORD_LEN;
    if buf.len() < expected_len {
        return None;
    }
    let mut records = Vec::with_capacity(count);
    for i in 0..count {
        let offset = V5_HEADER_LEN + i * V5_RECORD_LEN;
        if let Some(record) = parse_record(&buf[offset..offset + V5_RECORD_LEN], &header) {
            records.push(record);
        }
    }
    Some((header, records))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_packet(src: Ipv4Addr, dst: Ipv4Addr, octets: u32, packets: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(V5_HEADER_LEN + V5_RECORD_LEN);
        buf.extend_from_slice(&5u16.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&1000u32.to_be_bytes());
        buf.extend_from_slice(&1_700_000_000u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&42u32.to_be_bytes());
        buf.push(0);
        buf.push(0);
        buf.extend_from_slice(&0u16.to_be_bytes());

        buf.extend_from_slice(&src.octets());
        buf.extend_from_slice(&dst.octets());
        buf.extend_from_slice(&Ipv4Addr::UNSPECIFIED.octets());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&packets.to_be_bytes());
        buf.extend_from_slice(&octets.to_be_bytes());
        buf.extend_from_slice(&100u32.to_be_bytes());
        buf.extend_from_slice(&200u32.to_be_bytes());
        buf.extend_from_slice(&12345u16.to_be_bytes());
        buf.extend_from_slice(&80u16.to_be_bytes());
        buf.push(0);
        buf.push(0x02);
        buf.push(6);
        buf.push(0);
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.push(24);
        buf.push(24);
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf
    }

    #[test]
    fn parses_header_and_one_record() {
        let pkt = build_packet(
            Ipv4Addr::new(10, 10, 0, 100),
            Ipv4Addr::new(8, 8, 8, 8),
            1500,
            10,
        );
        let (header, records) = parse_packet(&pkt).unwrap();
        assert_eq!(header.count, 1);
        assert_eq!(header.flow_sequence, 42);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bytes, 1500);
        assert_eq!(records[0].packets, 10);
        assert_eq!(records[0].src_port, 12345);
        assert_eq!(records[0].dst_port, 80);
        assert_eq!(records[0].protocol, 6);
    }

    #[test]
    fn rejects_wrong_version() {
        let mut pkt = build_packet(
            Ipv4Addr::new(10, 10, 0, 100),
            Ipv4Addr::new(8, 8, 8, 8),
            1500,
            10,
        );
        pkt[1] = 9;
        assert!(parse_packet(&pkt).is_none());
    }

    #[test]
    fn rejects_truncated_packet() {
        let pkt = build_packet(
            Ipv4Addr::new(10, 10, 0, 1),
            Ipv4Addr::new(10, 10, 0, 2),
            100,
            1,
        );
        assert!(parse_packet(&pkt[..pkt.len() - 10]).is_none());
    }
}
