//! **single-file-pdu**: one-shot, non-daemon source (§4.2). Reads one
//! NetFlow v5 file front-to-back, then reports `EndStream` forever.

use std::collections::VecDeque;
use std::path::PathBuf;

use crate::netflow_v5;
use crate::{GetRecordOutcome, IngestSource, SourceStats};

pub struct SingleFilePduSource {
    path: PathBuf,
    queue: VecDeque<flowpack_model::FlowRecord>,
    stats: SourceStats,
    done: bool,
    started: bool,
}

impl SingleFilePduSource {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            queue: VecDeque::new(),
            stats: SourceStats::default(),
            done: false,
            started: false,
        }
    }
}

impl IngestSource for SingleFilePduSource {
    fn start(&mut self) -> anyhow::Result<()> {
        let bytes = std::fs::read(&self.path)?;
        let mut offset = 0;
        while offset < bytes.len() {
            match netflow_v5::parse_packet(&bytes[offset..]) {
                Some((header, records)) => {
                    let consumed = netflow_v5::V5_HEADER_LEN
                        + header.count as usize * netflow_v5::V5_RECORD_LEN;
                    self.queue.extend(records);
                    offset += consumed;
                }
                None => break,
            }
        }
        self.started = true;
        Ok(())
    }

    fn get_record(&mut self) -> GetRecordOutcome {
        if !self.started {
            if let Err(e) = self.start() {
                self.done = true;
                return GetRecordOutcome::FatalError(e.to_string());
            }
        }
        if self.done {
            return GetRecordOutcome::EndStream;
        }
        match self.queue.pop_front() {
            Some(record) => {
                self.stats.total += 1;
                record_or_end(self, record)
            }
            None => {
                self.done = true;
                GetRecordOutcome::EndStream
            }
        }
    }

    fn print_stats(&self) -> SourceStats {
        self.stats
    }
}

/// `BreakPoint` the last record so the pipeline can flush before the
/// next `get_record` call returns `EndStream`.
fn record_or_end(
    source: &SingleFilePduSource,
    record: flowpack_model::FlowRecord,
) -> GetRecordOutcome {
    if source.queue.is_empty() {
        GetRecordOutcome::BreakPoint(record)
    } else {
        GetRecordOutcome::Record(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::Ipv4Addr;

    fn build_packet(count: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&5u16.to_be_bytes());
        buf.extend_from_slice(&count.to_be_bytes());
        buf.extend_from_slice(&1000u32.to_be_bytes());
        buf.extend_from_slice(&1_700_000_000u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.push(0);
        buf.push(0);
        buf.extend_from_slice(&0u16.to_be_bytes());

        for _ in 0..count {
            buf.extend_from_slice(&Ipv4Addr::new(10, 0, 0, 1).octets());
            buf.extend_from_slice(&Ipv4Addr::new(10, 0, 0, 2).octets());
            buf.extend_from_slice(&Ipv4Addr::UNSPECIFIED.octets());
            buf.extend_from_slice(&0u16.to_be_bytes());
            buf.extend_from_slice(&0u16.to_be_bytes());
            buf.extend_from_slice(&1u32.to_be_bytes());
            buf.extend_from_slice(&100u32.to_be_bytes());
            buf.extend_from_slice(&100u32.to_be_bytes());
            buf.extend_from_slice(&200u32.to_be_bytes());
            buf.extend_from_slice(&1234u16.to_be_bytes());
            buf.extend_from_slice(&80u16.to_be_bytes());
            buf.push(0);
            buf.push(0);
            buf.push(6);
            buf.push(0);
            buf.extend_from_slice(&0u16.to_be_bytes());
            buf.extend_from_slice(&0u16.to_be_bytes());
            buf.push(24);
            buf.push(24);
            buf.extend_from_slice(&0u16.to_be_bytes());
        }
        buf
    }

    #[test]
    fn reads_every_record_then_ends_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flows.dat");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&build_packet(2)).unwrap();
        drop(f);

        let mut source = SingleFilePduSource::new(path);
        match source.get_record() {
            GetRecordOutcome::Record(_) => {}
            other => panic!("expected first record, got {other:?}"),
        }
        match source.get_record() {
            GetRecordOutcome::BreakPoint(_) => {}
            other => panic!("expected break-point on last record, got {other:?}"),
        }
        match source.get_record() {
            GetRecordOutcome::EndStream => {}
            other => panic!("expected end of stream, got {other:?}"),
        }
        assert_eq!(source.print_stats().total, 2);
    }

    #[test]
    fn empty_file_ends_stream_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.dat");
        std::fs::File::create(&path).unwrap();

        let mut source = SingleFilePduSource::new(path);
        assert!(matches!(source.get_record(), GetRecordOutcome::EndStream));
    }
}
