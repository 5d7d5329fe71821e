//! # flowpack-model
//!
//! Canonical data model shared by every other crate in the workspace: the
//! flow record produced by ingest sources, the probe/sensor descriptors
//! that drive classification, and the cache key the stream cache indexes
//! on.

use std::cmp::Ordering;
use std::net::IpAddr;
use std::path::PathBuf;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Milliseconds in one hour; cache keys and archive paths are aligned to
/// this boundary.
pub const HOUR_MS: i64 = 3_600_000;

/// Round `start_time_ms` down to its containing hour.
pub fn floor_to_hour(start_time_ms: i64) -> i64 {
    start_time_ms.div_euclid(HOUR_MS) * HOUR_MS
}

/// A canonical flow record, normalized by an ingest source from whatever
/// wire format it read. Every field except `sensor_id`, `flowtype_id`, and
/// `memo` is immutable after ingest; those three are set by the packing
/// logic during classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub input_if: u32,
    pub output_if: u32,
    /// Milliseconds since epoch.
    pub start_time_ms: i64,
    pub elapsed_ms: u32,
    pub packets: u64,
    pub bytes: u64,
    pub tcp_flags: u8,
    /// Set by the packing logic; 0 until classified.
    pub sensor_id: u16,
    /// Set by the packing logic; 0 until classified.
    pub flowtype_id: u16,
    /// Opaque site-defined slot, carried through unchanged.
    pub memo: u32,
}

impl FlowRecord {
    /// Hour this record belongs to, per `floor_to_hour(start_time_ms)`.
    pub fn hour_ms(&self) -> i64 {
        floor_to_hour(self.start_time_ms)
    }
}

/// The wire protocol a probe is configured to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeKind {
    NetflowV5,
    Ipfix,
    NetflowV9,
    Sflow,
    SilkNative,
}

/// Where a probe gets its bytes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceBinding {
    ListenAddr(String),
    UnixSocket(PathBuf),
    SingleFile(PathBuf),
    PollDirectory(PathBuf),
}

bitflags! {
    /// Per-kind decoder quirks. Unset by default; a site config turns
    /// these on for exporters known to violate the wire format in a
    /// specific, tolerable way.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ProbeQuirks: u32 {
        /// Accept NetFlow v5 packets whose engine/sensor field is zero.
        const ZERO_SENSOR_OK = 0b0000_0001;
        /// Accept a first packet whose SysUptime-derived record time is zero.
        const FIRST_PACKET_ZERO_TIME_OK = 0b0000_0010;
    }
}

impl Default for ProbeQuirks {
    fn default() -> Self {
        ProbeQuirks::empty()
    }
}

bitflags! {
    /// Per-probe logging verbosity flags, independent of the process-wide
    /// log level.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ProbeLogFlags: u32 {
        const LOG_BAD_RECORDS = 0b0000_0001;
        const LOG_FILE_OPENS = 0b0000_0010;
    }
}

impl Default for ProbeLogFlags {
    fn default() -> Self {
        ProbeLogFlags::empty()
    }
}

/// Immutable probe descriptor: one concrete collection endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    pub name: String,
    pub kind: ProbeKind,
    pub source: SourceBinding,
    /// If non-empty, only these source addresses are accepted.
    pub accept_from: Vec<IpAddr>,
    pub quirks: ProbeQuirks,
    pub log_flags: ProbeLogFlags,
}

/// A named flow observation point, carrying a stable numeric id and the
/// network deciders the packing logic consults to assign class/type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub name: String,
    pub id: u16,
    pub probes: Vec<String>,
    pub interface_deciders: Vec<u32>,
    pub ip_block_deciders: Vec<String>,
}

/// Stream cache key: `(flowtype_id, sensor_id, hour_ms)`. Total ordering
/// is by `(sensor_id, flowtype_id, hour_ms)`, not declaration order —
/// this groups a sensor's files together for the eviction scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub flowtype_id: u16,
    pub sensor_id: u16,
    pub hour_ms: i64,
}

impl CacheKey {
    pub fn new(flowtype_id: u16, sensor_id: u16, hour_ms: i64) -> Self {
        debug_assert_eq!(hour_ms % HOUR_MS, 0, "hour_ms must be hour-aligned");
        Self {
            flowtype_id,
            sensor_id,
            hour_ms,
        }
    }
}

impl PartialOrd for CacheKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CacheKey {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.sensor_id, self.flowtype_id, self.hour_ms).cmp(&(
            other.sensor_id,
            other.flowtype_id,
            other.hour_ms,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_to_hour_rounds_down() {
        assert_eq!(floor_to_hour(1_700_000_000_123), 1_699_999_200_000);
        assert_eq!(floor_to_hour(HOUR_MS), HOUR_MS);
        assert_eq!(floor_to_hour(HOUR_MS - 1), 0);
    }

    #[test]
    fn cache_key_orders_by_sensor_then_flowtype_then_hour() {
        let a = CacheKey::new(5, 1, 0);
        let b = CacheKey::new(1, 1, HOUR_MS);
        let c = CacheKey::new(1, 2, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn quirks_default_empty() {
        let q = ProbeQuirks::default();
        assert!(!q.contains(ProbeQuirks::ZERO_SENSOR_OK));
    }
}
