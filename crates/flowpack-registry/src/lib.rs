//! # flowpack-registry
//!
//! The Probe/Sensor Registry (§4.3): a read-mostly lookup table built once
//! at startup from a sensor-configuration TOML file, then consulted by
//! the packing logic and the ingest sources for the rest of the process's
//! life. No mutation after the parser finishes.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use flowpack_model::{Probe, ProbeKind, ProbeLogFlags, ProbeQuirks, Sensor, SourceBinding};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("probe '{0}' declared more than once")]
    DuplicateProbe(String),

    #[error("sensor '{0}' declared more than once")]
    DuplicateSensor(String),

    #[error("sensor '{sensor}' references unknown probe '{probe}'")]
    UnknownProbeReference { sensor: String, probe: String },

    #[error("probe '{0}' declares no source binding (need exactly one of listen-addr, unix-socket, single-file, poll-directory)")]
    MissingSourceBinding(String),

    #[error("probe '{0}' declares more than one source binding")]
    AmbiguousSourceBinding(String),

    #[error("probe '{probe}' has unknown quirk '{quirk}'")]
    UnknownQuirk { probe: String, quirk: String },

    #[error("probe '{probe}' has unknown log flag '{flag}'")]
    UnknownLogFlag { probe: String, flag: String },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// On-disk shape of the sensor-configuration file. This project's own
/// wire format, not a reproduction of any external tool's.
#[derive(Debug, Deserialize)]
struct SensorConfigFile {
    #[serde(default)]
    probes: Vec<ProbeDef>,
    #[serde(default)]
    sensors: Vec<SensorDef>,
}

#[derive(Debug, Deserialize)]
struct ProbeDef {
    name: String,
    kind: ProbeKind,
    #[serde(rename = "listen-addr")]
    listen_addr: Option<String>,
    #[serde(rename = "unix-socket")]
    unix_socket: Option<PathBuf>,
    #[serde(rename = "single-file")]
    single_file: Option<PathBuf>,
    #[serde(rename = "poll-directory")]
    poll_directory: Option<PathBuf>,
    #[serde(rename = "accept-from", default)]
    accept_from: Vec<IpAddr>,
    #[serde(default)]
    quirks: Vec<String>,
    #[serde(rename = "log-flags", default)]
    log_flags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SensorDef {
    name: String,
    id: u16,
    #[serde(default)]
    probes: Vec<String>,
    #[serde(rename = "interface-deciders", default)]
    interface_deciders: Vec<u32>,
    #[serde(rename = "ip-block-deciders", default)]
    ip_block_deciders: Vec<String>,
}

fn parse_quirk(probe: &str, s: &str) -> Result<ProbeQuirks> {
    match s {
        "zero-sensor-ok" => Ok(ProbeQuirks::ZERO_SENSOR_OK),
        "first-packet-zero-time-ok" => Ok(ProbeQuirks::FIRST_PACKET_ZERO_TIME_OK),
        other => Err(RegistryError::UnknownQuirk {
            probe: probe.to_string(),
            quirk: other.to_string(),
        }),
    }
}

fn parse_log_flag(probe: &str, s: &str) -> Result<ProbeLogFlags> {
    match s {
        "log-bad-records" => Ok(ProbeLogFlags::LOG_BAD_RECORDS),
        "log-file-opens" => Ok(ProbeLogFlags::LOG_FILE_OPENS),
        other => Err(RegistryError::UnknownLogFlag {
            probe: probe.to_string(),
            flag: other.to_string(),
        }),
    }
}

impl ProbeDef {
    fn into_probe(self) -> Result<Probe> {
        let bindings = [
            self.listen_addr.clone().map(SourceBinding::ListenAddr),
            self.unix_socket.clone().map(SourceBinding::UnixSocket),
            self.single_file.clone().map(SourceBinding::SingleFile),
            self.poll_directory.clone().map(SourceBinding::PollDirectory),
        ];
        let mut present: Vec<SourceBinding> = bindings.into_iter().flatten().collect();
        let source = match present.len() {
            0 => return Err(RegistryError::MissingSourceBinding(self.name)),
            1 => present.remove(0),
            _ => return Err(RegistryError::AmbiguousSourceBinding(self.name)),
        };

        let mut quirks = ProbeQuirks::empty();
        for q in &self.quirks {
            quirks |= parse_quirk(&self.name, q)?;
        }
        let mut log_flags = ProbeLogFlags::empty();
        for f in &self.log_flags {
            log_flags |= parse_log_flag(&self.name, f)?;
        }

        Ok(Probe {
            name: self.name,
            kind: self.kind,
            source,
            accept_from: self.accept_from,
            quirks,
            log_flags,
        })
    }
}

/// Read-only, read-mostly lookup over probes and sensors.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Registry {
    probes: HashMap<String, Probe>,
    sensors: HashMap<u16, Sensor>,
    probe_to_sensors: HashMap<String, Vec<u16>>,
}

impl Registry {
    /// Build an empty registry (used for respool mode, where no sensor
    /// configuration is required).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: SensorConfigFile =
            toml::from_str(&contents).map_err(|source| RegistryError::Toml {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_parsed(file)
    }

    fn from_parsed(file: SensorConfigFile) -> Result<Self> {
        let mut probes = HashMap::new();
        for def in file.probes {
            let name = def.name.clone();
            let probe = def.into_probe()?;
            if probes.insert(name.clone(), probe).is_some() {
                return Err(RegistryError::DuplicateProbe(name));
            }
        }

        let mut sensors = HashMap::new();
        let mut probe_to_sensors: HashMap<String, Vec<u16>> = HashMap::new();
        for def in file.sensors {
            let name = def.name.clone();
            for probe_name in &def.probes {
                if !probes.contains_key(probe_name) {
                    return Err(RegistryError::UnknownProbeReference {
                        sensor: name.clone(),
                        probe: probe_name.clone(),
                    });
                }
                probe_to_sensors
                    .entry(probe_name.clone())
                    .or_default()
                    .push(def.id);
            }
            let sensor = Sensor {
                name: def.name,
                id: def.id,
                probes: def.probes,
                interface_deciders: def.interface_deciders,
                ip_block_deciders: def.ip_block_deciders,
            };
            if sensors.insert(def.id, sensor).is_some() {
                return Err(RegistryError::DuplicateSensor(name));
            }
        }

        Ok(Self {
            probes,
            sensors,
            probe_to_sensors,
        })
    }

    pub fn find_probe_by_name(&self, name: &str) -> Option<&Probe> {
        self.probes.get(name)
    }

    pub fn iter_probes(&self) -> impl Iterator<Item = &Probe> {
        self.probes.values()
    }

    pub fn iter_sensors(&self) -> impl Iterator<Item = &Sensor> {
        self.sensors.values()
    }

    pub fn probes_for_sensor(&self, sensor_id: u16) -> Vec<&Probe> {
        match self.sensors.get(&sensor_id) {
            Some(sensor) => sensor
                .probes
                .iter()
                .filter_map(|n| self.probes.get(n))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn sensors_for_probe(&self, probe_name: &str) -> Vec<&Sensor> {
        match self.probe_to_sensors.get(probe_name) {
            Some(ids) => ids.iter().filter_map(|id| self.sensors.get(id)).collect(),
            None => Vec::new(),
        }
    }

    pub fn probe_kind(&self, probe_name: &str) -> Option<ProbeKind> {
        self.probes.get(probe_name).map(|p| p.kind)
    }

    pub fn poll_dir_for_probe(&self, probe_name: &str) -> Option<&Path> {
        match self.probes.get(probe_name)?.source {
            SourceBinding::PollDirectory(ref p) => Some(p.as_path()),
            _ => None,
        }
    }

    pub fn listen_addr_for_probe(&self, probe_name: &str) -> Option<&str> {
        match self.probes.get(probe_name)?.source {
            SourceBinding::ListenAddr(ref a) => Some(a.as_str()),
            _ => None,
        }
    }

    pub fn accept_from_for_probe(&self, probe_name: &str) -> &[IpAddr] {
        self.probes
            .get(probe_name)
            .map(|p| p.accept_from.as_slice())
            .unwrap_or(&[])
    }

    pub fn quirks_for_probe(&self, probe_name: &str) -> ProbeQuirks {
        self.probes
            .get(probe_name)
            .map(|p| p.quirks)
            .unwrap_or_default()
    }
}
