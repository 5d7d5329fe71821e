//! # flowpack-classify
//!
//! The packing-logic plug-in contract (§4.4): a site-supplied strategy
//! that maps `(probe, record) -> [(flowtype, sensor), ...]`. Loaded via
//! dynamic linking in the reference system; here it's a static registry
//! of named strategies selected by configuration, per §9's design note
//! that dynamic loading buys nothing this contract needs.

use thiserror::Error;

use flowpack_model::{FlowRecord, Probe};

/// No single record may classify into more than this many
/// `(flowtype, sensor)` pairs.
pub const MAX_SPLIT: usize = 16;

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("classify produced {0} pairs, exceeding MAX_SPLIT={MAX_SPLIT}")]
    TooManySplits(usize),

    #[error("unknown packing-logic strategy '{0}'")]
    UnknownStrategy(String),

    #[error("strategy setup failed: {0}")]
    SetupFailed(String),

    #[error("sensor verification failed: {0}")]
    SensorRejected(String),
}

pub type Result<T> = std::result::Result<T, ClassifyError>;

/// One `(flowtype_id, sensor_id)` classification result.
pub type Classification = (u16, u16);

/// File format and record-version a strategy wants for a given
/// `(probe, flowtype)` pair, overriding the compiled-in default.
pub type FormatAndVersion = (u16, u16);

/// The packing-logic plug-in contract.
pub trait PackingLogic: Send + Sync {
    /// One-time setup; called once after construction.
    fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Optional per-sensor validation, called as sensors are registered.
    fn verify_sensor(&self, _sensor_id: u16) -> Result<()> {
        Ok(())
    }

    /// Classify a record into zero or more `(flowtype, sensor)` pairs.
    /// An empty vec is a classification miss (caller counts it as
    /// "bad", not fatal). Implementations must never return more than
    /// [`MAX_SPLIT`] pairs.
    fn classify(&self, probe: &Probe, record: &FlowRecord) -> Result<Vec<Classification>>;

    /// File format/version override for `(probe, flowtype)`. `None`
    /// means "use the compile-time or IPv6-vs-IPv4 default".
    fn format_and_version(&self, _probe: &Probe, _flowtype_id: u16) -> Option<FormatAndVersion> {
        None
    }
}

fn check_split_count(pairs: Vec<Classification>) -> Result<Vec<Classification>> {
    if pairs.len() > MAX_SPLIT {
        return Err(ClassifyError::TooManySplits(pairs.len()));
    }
    Ok(pairs)
}

/// The built-in respool strategy (§4.4 "When the pipeline is in respool
/// mode"): records already carry their `(flowtype, sensor)` from a prior
/// packing pass, so classification is the identity function and the
/// format/version defaults to the most-expressive available (`None`
/// here, which callers interpret as "keep whatever the source file
/// already had").
#[derive(Debug, Default)]
pub struct RespoolLogic;

impl PackingLogic for RespoolLogic {
    fn classify(&self, _probe: &Probe, record: &FlowRecord) -> Result<Vec<Classification>> {
        check_split_count(vec![(record.flowtype_id, record.sensor_id)])
    }
}

/// Build the named strategy. This is the static registry: extending it
/// to a new site-specific strategy means adding a match arm and
/// implementing [`PackingLogic`], not loading a shared object.
pub fn build_strategy(name: &str) -> Result<Box<dyn PackingLogic>> {
    match name {
        "respool" => Ok(Box::new(RespoolLogic)),
        other => Err(ClassifyError::UnknownStrategy(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn sample_record(flowtype_id: u16, sensor_id: u16) -> FlowRecord {
        FlowRecord {
            src_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            src_port: 1234,
            dst_port: 80,
            protocol: 6,
            input_if: 1,
            output_if: 2,
            start_time_ms: 1_700_000_000_000,
            elapsed_ms: 10,
            packets: 3,
            bytes: 1500,
            tcp_flags: 0,
            sensor_id,
            flowtype_id,
            memo: 0,
        }
    }

    fn sample_probe() -> Probe {
        Probe {
            name: "p".to_string(),
            kind: flowpack_model::ProbeKind::SilkNative,
            source: flowpack_model::SourceBinding::PollDirectory("/tmp".into()),
            accept_from: vec![],
            quirks: Default::default(),
            log_flags: Default::default(),
        }
    }

    #[test]
    fn respool_classify_is_identity() {
        let logic = RespoolLogic;
        let record = sample_record(5, 3);
        let result = logic.classify(&sample_probe(), &record).unwrap();
        assert_eq!(result, vec![(5, 3)]);
    }

    #[test]
    fn build_strategy_known_name() {
        assert!(build_strategy("respool").is_ok());
    }

    #[test]
    fn build_strategy_unknown_name_errors() {
        assert!(matches!(
            build_strategy("site-specific-thing"),
            Err(ClassifyError::UnknownStrategy(_))
        ));
    }

    #[test]
    fn check_split_count_rejects_over_max() {
        let pairs: Vec<Classification> = (0..(MAX_SPLIT as u16 + 1)).map(|i| (i, i)).collect();
        assert!(matches!(
            check_split_count(pairs),
            Err(ClassifyError::TooManySplits(_))
        ));
    }
}
