//! # flowpack-ingest
//!
//! Ingest Sources (§4.2): the six source variants and the directory
//! polling contract they share. Every variant implements [`IngestSource`]
//! and is driven by a pack-pipeline worker thread calling `get_record` in
//! a loop.

pub mod netflow_v5;
pub mod network;
pub mod poll;
pub mod polldir;
pub mod singlefile;

use flowpack_model::FlowRecord;

/// Result of one `get_record` call.
#[derive(Debug)]
pub enum GetRecordOutcome {
    /// Have a record; the worker must keep going.
    Record(FlowRecord),
    /// Have a record; this is also a safe point to stop.
    BreakPoint(FlowRecord),
    /// No record; safe stop point between inputs.
    FileBreak,
    /// No record; transient, caller may retry if still running.
    GetError,
    /// No more data will ever come. Terminal.
    EndStream,
    /// Unrecoverable.
    FatalError(String),
}

/// Aggregate per-source counters, logged on stats callbacks (§4.7
/// "aggregate per-probe counters").
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceStats {
    pub total: u64,
    pub bad: u64,
}

/// The ingest-source capability set (§4.2): `{setup, want_probe, start,
/// get_record, print_stats, stop, free, cleanup}`.
pub trait IngestSource: Send {
    fn setup(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn get_record(&mut self) -> GetRecordOutcome;

    fn print_stats(&self) -> SourceStats {
        SourceStats::default()
    }

    fn stop(&mut self) {}

    fn free(&mut self) {}

    fn cleanup(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// For multiplexed sources (poll-dir-fcfiles): the probe the most
    /// recently returned record belongs to. `None` for single-probe
    /// sources, where the pipeline already knows its one probe.
    fn current_probe_name(&self) -> Option<&str> {
        None
    }
}
