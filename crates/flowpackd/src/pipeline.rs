//! Pack Pipeline worker (§4.7): one per probe, pulling records from an
//! [`IngestSource`], classifying each with the configured packing logic,
//! and writing the result through the stream cache.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flowpack_admission::Admission;
use flowpack_cache::{Cache, Opener};
use flowpack_classify::PackingLogic;
use flowpack_config::{log_pack_error, log_pack_warn};
use flowpack_ingest::{GetRecordOutcome, IngestSource, SourceStats};
use flowpack_model::{CacheKey, FlowRecord, Probe};
use flowpack_registry::Registry;

pub struct WorkerOutcome {
    pub probe_name: String,
    pub stats: SourceStats,
}

/// Run one probe's ingest loop to completion (`EndStream`, a fatal
/// error, or shutdown). `probe` is `None` in respool mode, where the
/// record already carries its own `(flowtype, sensor)`.
pub fn run_worker(
    probe_name: String,
    mut source: Box<dyn IngestSource>,
    registry: Arc<Registry>,
    cache: Arc<Cache>,
    opener: Arc<dyn Opener>,
    strategy: Arc<dyn PackingLogic>,
    admission: Arc<Admission>,
    runtime: tokio::runtime::Handle,
    shutdown: Arc<AtomicBool>,
) -> WorkerOutcome {
    if let Err(e) = source.setup() {
        log_pack_error!("ingest source setup failed", probe = %probe_name, error = %e.to_string());
        return WorkerOutcome {
            probe_name,
            stats: SourceStats::default(),
        };
    }
    if let Err(e) = source.start() {
        log_pack_error!("ingest source start failed", probe = %probe_name, error = %e.to_string());
        return WorkerOutcome {
            probe_name,
            stats: SourceStats::default(),
        };
    }

    // Held for the worker's lifetime: bounds how many probe workers may
    // have an input file open concurrently (§4.1).
    let permit = runtime.block_on(admission.acquire()).ok();

    let probe: Option<Probe> = registry.find_probe_by_name(&probe_name).cloned();
    let mut bad = 0u64;

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match source.get_record() {
            GetRecordOutcome::Record(record) | GetRecordOutcome::BreakPoint(record) => {
                // poll-dir-fcfiles carries its own probe name per file;
                // `probe_name` here is just the worker's placeholder
                // label ("fcfiles"), not a real registry entry.
                let per_record_probe;
                let resolved = match source.current_probe_name() {
                    Some(name) => {
                        per_record_probe = registry.find_probe_by_name(name).cloned();
                        per_record_probe.as_ref()
                    }
                    None => probe.as_ref(),
                };
                if let Err(()) = dispatch_record(&probe_name, resolved, &strategy, &cache, opener.as_ref(), record)
                {
                    bad += 1;
                }
            }
            GetRecordOutcome::FileBreak | GetRecordOutcome::GetError => continue,
            GetRecordOutcome::EndStream | GetRecordOutcome::FatalError(_) => break,
        }
    }

    drop(permit);
    source.stop();
    source.free();
    if let Err(e) = source.cleanup() {
        log_pack_warn!("ingest source cleanup failed", probe = %probe_name, error = %e.to_string());
    }

    let mut stats = source.print_stats();
    stats.bad += bad;
    WorkerOutcome { probe_name, stats }
}

/// Classify one record (or pass it through unchanged in respool mode)
/// and write each resulting `(flowtype, sensor)` copy to the cache.
fn dispatch_record(
    probe_name: &str,
    probe: Option<&Probe>,
    strategy: &Arc<dyn PackingLogic>,
    cache: &Cache,
    opener: &dyn Opener,
    record: FlowRecord,
) -> Result<(), ()> {
    let Some(probe) = probe else {
        return write_classified(cache, opener, record).map_err(|e| {
            log_pack_warn!("failed to write record", probe = %probe_name, error = %e.to_string());
        });
    };

    match strategy.classify(probe, &record) {
        Ok(pairs) if pairs.is_empty() => Err(()),
        Ok(pairs) => {
            let mut any_failed = false;
            for (flowtype_id, sensor_id) in pairs {
                let mut classified = record.clone();
                classified.flowtype_id = flowtype_id;
                classified.sensor_id = sensor_id;
                if let Err(e) = write_classified(cache, opener, classified) {
                    log_pack_warn!("failed to write record", probe = %probe_name, error = %e.to_string());
                    any_failed = true;
                }
            }
            if any_failed {
                Err(())
            } else {
                Ok(())
            }
        }
        Err(e) => {
            log_pack_warn!("classification failed", probe = %probe_name, error = %e.to_string());
            Err(())
        }
    }
}

fn write_classified(cache: &Cache, opener: &dyn Opener, record: FlowRecord) -> anyhow::Result<()> {
    let key = CacheKey::new(record.flowtype_id, record.sensor_id, record.hour_ms());
    let mut handle = cache.lookup_or_open(key, opener)?;
    let bytes = flowpack_wire::encode_record(&record)?;
    handle.write_all(&bytes)?;
    handle.release();
    Ok(())
}
