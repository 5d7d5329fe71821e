//! **poll-dir-mixed**, **poll-dir-fcfiles**, and **poll-dir-respool**
//! sources (§4.2): directory pollers over files produced
//! create-elsewhere-then-rename by an upstream process.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use flowpack_dispose::{dispose_failure, dispose_success, DisposeConfig};
use flowpack_model::FlowRecord;
use flowpack_wire::FileHeader;

use crate::netflow_v5;
use crate::poll::{DirPoller, PollOutcome};
use crate::{GetRecordOutcome, IngestSource, SourceStats};

/// How to decode one file the poller just handed off.
enum FileKind {
    NetflowV5,
    NativeBinary,
}

fn sniff_kind(path: &Path) -> std::io::Result<FileKind> {
    let mut magic = [0u8; 4];
    let mut f = File::open(path)?;
    let n = f.read(&mut magic)?;
    if n == 4 && magic == flowpack_wire::MAGIC {
        Ok(FileKind::NativeBinary)
    } else {
        Ok(FileKind::NetflowV5)
    }
}

fn decode_native_binary(path: &Path) -> anyhow::Result<Vec<FlowRecord>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut header_buf = [0u8; flowpack_wire::HEADER_LEN];
    reader.read_exact(&mut header_buf)?;
    let _header: FileHeader = FileHeader::from_bytes(&header_buf)?;
    let mut records = Vec::new();
    while let Some(record) = flowpack_wire::read_record(&mut reader)? {
        records.push(record);
    }
    Ok(records)
}

fn decode_netflow_v5_file(path: &Path) -> anyhow::Result<Vec<FlowRecord>> {
    let bytes = std::fs::read(path)?;
    let mut offset = 0;
    let mut out = Vec::new();
    while offset < bytes.len() {
        match netflow_v5::parse_packet(&bytes[offset..]) {
            Some((header, records)) => {
                let consumed =
                    netflow_v5::V5_HEADER_LEN + header.count as usize * netflow_v5::V5_RECORD_LEN;
                out.extend(records);
                offset += consumed;
            }
            None => {
                if out.is_empty() && offset == 0 {
                    anyhow::bail!("malformed netflow v5 file");
                }
                break;
            }
        }
    }
    Ok(out)
}

/// Shared per-file pump: pull a stable file from the poller, decode it
/// fully into an in-memory queue, and dispose of it per §4.9 before
/// asking the poller for the next one. A zero-record file is still a
/// disposition success (§4.2 "Accepting a partial file").
struct FilePump {
    poller: DirPoller,
    dispose: DisposeConfig,
    queue: VecDeque<FlowRecord>,
    stats: SourceStats,
    stopped: bool,
}

impl FilePump {
    fn new(dir: PathBuf, polling_interval: Duration, dispose: DisposeConfig) -> Self {
        Self {
            poller: DirPoller::start(dir, polling_interval),
            dispose,
            queue: VecDeque::new(),
            stats: SourceStats::default(),
            stopped: false,
        }
    }

    /// Pull and decode the next file, returning whether any records are
    /// now queued. Routes a decode failure to the error directory and
    /// reports it via the return value's error case.
    fn pump_next_file(
        &mut self,
        decode: impl FnOnce(&Path) -> anyhow::Result<Vec<FlowRecord>>,
    ) -> Option<anyhow::Result<bool>> {
        match self.poller.next_file() {
            PollOutcome::Stopped => {
                self.stopped = true;
                None
            }
            PollOutcome::File(path) => match decode(&path) {
                Ok(records) => {
                    let had_records = !records.is_empty();
                    self.queue.extend(records);
                    if let Err(e) = dispose_success(&self.dispose, &path) {
                        return Some(Err(e.into()));
                    }
                    Some(Ok(had_records))
                }
                Err(e) => {
                    self.stats.bad += 1;
                    if let Err(dispose_err) = dispose_failure(&self.dispose, &path) {
                        return Some(Err(dispose_err.into()));
                    }
                    Some(Err(e))
                }
            },
        }
    }
}

/// **poll-dir-mixed**: per-probe directory of v5-file or native-binary
/// files.
pub struct PollDirMixedSource {
    pump: FilePump,
}

impl PollDirMixedSource {
    pub fn new(dir: PathBuf, polling_interval: Duration, dispose: DisposeConfig) -> Self {
        Self {
            pump: FilePump::new(dir, polling_interval, dispose),
        }
    }
}

impl IngestSource for PollDirMixedSource {
    fn get_record(&mut self) -> GetRecordOutcome {
        if let Some(record) = self.pump.queue.pop_front() {
            self.pump.stats.total += 1;
            return GetRecordOutcome::Record(record);
        }
        if self.pump.stopped {
            return GetRecordOutcome::EndStream;
        }

        loop {
            let poller_result = self.pump.poller.next_file();
            let path = match poller_result {
                PollOutcome::Stopped => {
                    self.pump.stopped = true;
                    return GetRecordOutcome::FileBreak;
                }
                PollOutcome::File(p) => p,
            };

            let kind = match sniff_kind(&path) {
                Ok(k) => k,
                Err(e) => {
                    let _ = dispose_failure(&self.pump.dispose, &path);
                    return GetRecordOutcome::FatalError(e.to_string());
                }
            };
            let decoded = match kind {
                FileKind::NetflowV5 => decode_netflow_v5_file(&path),
                FileKind::NativeBinary => decode_native_binary(&path),
            };
            match decoded {
                Ok(records) => {
                    let _ = dispose_success(&self.pump.dispose, &path);
                    if records.is_empty() {
                        return GetRecordOutcome::FileBreak;
                    }
                    self.pump.queue.extend(records);
                    let first = self.pump.queue.pop_front().unwrap();
                    self.pump.stats.total += 1;
                    return GetRecordOutcome::Record(first);
                }
                Err(e) => {
                    self.pump.stats.bad += 1;
                    if dispose_failure(&self.pump.dispose, &path).is_err() {
                        return GetRecordOutcome::FatalError(e.to_string());
                    }
                    continue;
                }
            }
        }
    }

    fn print_stats(&self) -> SourceStats {
        self.pump.stats
    }

    fn stop(&mut self) {
        self.pump.poller.stop();
    }
}

/// **poll-dir-respool**: directory of native-binary files whose records
/// already carry `(flowtype, sensor)`; passed through unchanged.
pub struct PollDirRespoolSource {
    pump: FilePump,
}

impl PollDirRespoolSource {
    pub fn new(dir: PathBuf, polling_interval: Duration, dispose: DisposeConfig) -> Self {
        Self {
            pump: FilePump::new(dir, polling_interval, dispose),
        }
    }
}

impl IngestSource for PollDirRespoolSource {
    fn get_record(&mut self) -> GetRecordOutcome {
        if let Some(record) = self.pump.queue.pop_front() {
            self.pump.stats.total += 1;
            return GetRecordOutcome::Record(record);
        }
        match self.pump.pump_next_file(|p| decode_native_binary(p)) {
            None => GetRecordOutcome::FileBreak,
            Some(Ok(false)) => GetRecordOutcome::FileBreak,
            Some(Ok(true)) => {
                let first = self.pump.queue.pop_front().expect("just queued");
                self.pump.stats.total += 1;
                GetRecordOutcome::Record(first)
            }
            Some(Err(e)) => GetRecordOutcome::FatalError(e.to_string()),
        }
    }

    fn print_stats(&self) -> SourceStats {
        self.pump.stats
    }

    fn stop(&mut self) {
        self.pump.poller.stop();
    }
}

/// **poll-dir-fcfiles**: shared poller over files embedding a
/// probe-name header (`u16` length + UTF-8 name) ahead of the usual
/// native-binary payload; maps each file to its probe by name.
pub struct PollDirFcfilesSource {
    pump: FilePump,
    current_probe: Option<String>,
}

fn decode_fcfile(path: &Path) -> anyhow::Result<(String, Vec<FlowRecord>)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf)?;
    let name_len = u16::from_le_bytes(len_buf) as usize;
    let mut name_buf = vec![0u8; name_len];
    reader.read_exact(&mut name_buf)?;
    let probe_name = String::from_utf8(name_buf)?;

    let mut header_buf = [0u8; flowpack_wire::HEADER_LEN];
    reader.read_exact(&mut header_buf)?;
    FileHeader::from_bytes(&header_buf)?;

    let mut records = Vec::new();
    while let Some(record) = flowpack_wire::read_record(&mut reader)? {
        records.push(record);
    }
    Ok((probe_name, records))
}

impl PollDirFcfilesSource {
    pub fn new(dir: PathBuf, polling_interval: Duration, dispose: DisposeConfig) -> Self {
        Self {
            pump: FilePump::new(dir, polling_interval, dispose),
            current_probe: None,
        }
    }
}

impl IngestSource for PollDirFcfilesSource {
    fn get_record(&mut self) -> GetRecordOutcome {
        if let Some(record) = self.pump.queue.pop_front() {
            self.pump.stats.total += 1;
            return GetRecordOutcome::Record(record);
        }

        let path = match self.pump.poller.next_file() {
            PollOutcome::Stopped => return GetRecordOutcome::FileBreak,
            PollOutcome::File(p) => p,
        };

        match decode_fcfile(&path) {
            Ok((probe_name, records)) => {
                self.current_probe = Some(probe_name);
                let _ = dispose_success(&self.pump.dispose, &path);
                if records.is_empty() {
                    return GetRecordOutcome::FileBreak;
                }
                self.pump.queue.extend(records);
                let first = self.pump.queue.pop_front().unwrap();
                self.pump.stats.total += 1;
                GetRecordOutcome::Record(first)
            }
            Err(e) => {
                self.pump.stats.bad += 1;
                let _ = dispose_failure(&self.pump.dispose, &path);
                GetRecordOutcome::FatalError(e.to_string())
            }
        }
    }

    fn print_stats(&self) -> SourceStats {
        self.pump.stats
    }

    fn stop(&mut self) {
        self.pump.poller.stop();
    }

    fn current_probe_name(&self) -> Option<&str> {
        self.current_probe.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_native_file(path: &Path, records: &[FlowRecord]) {
        let mut f = File::create(path).unwrap();
        let header = FileHeader::new(
            1,
            flowpack_wire::ByteOrder::Native,
            flowpack_wire::CompressionMethod::None,
            flowpack_wire::PackedFileDirective {
                hour_ms: 0,
                flowtype_id: 1,
                sensor_id: 1,
            },
        );
        f.write_all(&header.to_bytes().unwrap()).unwrap();
        for r in records {
            flowpack_wire::write_record(&mut f, r).unwrap();
        }
    }

    fn sample_record() -> FlowRecord {
        use std::net::{IpAddr, Ipv4Addr};
        FlowRecord {
            src_addr: IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            dst_addr: IpAddr::V4(Ipv4Addr::new(2, 2, 2, 2)),
            src_port: 1,
            dst_port: 2,
            protocol: 6,
            input_if: 0,
            output_if: 0,
            start_time_ms: 0,
            elapsed_ms: 0,
            packets: 1,
            bytes: 1,
            tcp_flags: 0,
            sensor_id: 1,
            flowtype_id: 1,
            memo: 0,
        }
    }

    #[test]
    fn respool_source_reads_records_through_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        write_native_file(&dir.path().join("a.dat"), &[sample_record()]);

        let dispose = DisposeConfig::default();
        let mut source =
            PollDirRespoolSource::new(dir.path().to_path_buf(), Duration::from_millis(20), dispose);

        match source.get_record() {
            GetRecordOutcome::Record(r) => assert_eq!(r, sample_record()),
            other => panic!("expected a record, got {other:?}"),
        }
        source.stop();
    }

    #[test]
    fn fcfiles_source_extracts_probe_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.dat");
        let mut f = File::create(&path).unwrap();
        let name = b"probe-a";
        f.write_all(&(name.len() as u16).to_le_bytes()).unwrap();
        f.write_all(name).unwrap();
        let header = FileHeader::new(
            1,
            flowpack_wire::ByteOrder::Native,
            flowpack_wire::CompressionMethod::None,
            flowpack_wire::PackedFileDirective {
                hour_ms: 0,
                flowtype_id: 1,
                sensor_id: 1,
            },
        );
        f.write_all(&header.to_bytes().unwrap()).unwrap();
        flowpack_wire::write_record(&mut f, &sample_record()).unwrap();
        drop(f);

        let dispose = DisposeConfig::default();
        let mut source =
            PollDirFcfilesSource::new(dir.path().to_path_buf(), Duration::from_millis(20), dispose);
        match source.get_record() {
            GetRecordOutcome::Record(_) => {}
            other => panic!("expected a record, got {other:?}"),
        }
        assert_eq!(source.current_probe_name(), Some("probe-a"));
        source.stop();
    }
}
