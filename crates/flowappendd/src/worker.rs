//! Appender worker loop (§4.10): merge one incremental file into its
//! destination hourly repository file per iteration.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fs2::FileExt;

use flowpack_config::{log_append_error, log_append_warn, AppenderConfig, ByteOrderOpt};
use flowpack_dispose::{dispose_failure, dispose_success, DisposeConfig};
use flowpack_ingest::poll::{DirPoller, PollOutcome};
use flowpack_wire::{ByteOrder, FileHeader, HEADER_LEN};

use crate::lockset::HourlyLockSet;

pub struct AppenderWorker {
    pub poller: Arc<DirPoller>,
    pub locks: Arc<HourlyLockSet>,
    pub root_directory: PathBuf,
    pub dispose: DisposeConfig,
    pub appender: AppenderConfig,
    pub byte_order_override: Option<ByteOrder>,
    pub locking: bool,
    pub shutdown: Arc<AtomicBool>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerStats {
    pub merged: u64,
    pub skipped: u64,
    pub errored: u64,
}

pub fn run_appender_worker(worker: &AppenderWorker) -> WorkerStats {
    let mut stats = WorkerStats::default();
    loop {
        if worker.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match worker.poller.next_file() {
            PollOutcome::Stopped => break,
            PollOutcome::File(path) => match process_one(worker, &path) {
                Outcome::Merged => stats.merged += 1,
                Outcome::Skipped => stats.skipped += 1,
                Outcome::Errored => stats.errored += 1,
            },
        }
    }
    stats
}

enum Outcome {
    Merged,
    Skipped,
    Errored,
}

/// Steps 2-12 of the appender worker loop for one incremental path.
fn process_one(worker: &AppenderWorker, path: &Path) -> Outcome {
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Outcome::Skipped,
        Err(e) => {
            log_append_warn!("failed to open incremental file", path = %path.display(), error = %e);
            route_to_error(worker, path);
            return Outcome::Errored;
        }
    };

    if worker.locking {
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Outcome::Skipped,
            Err(e) => {
                log_append_warn!("failed to lock incremental file", path = %path.display(), error = %e);
                route_to_error(worker, path);
                return Outcome::Errored;
            }
        }
    }

    let mut header_bytes = [0u8; HEADER_LEN];
    if let Err(e) = file.read_exact(&mut header_bytes) {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            // Empty or header-less file: treat as a successfully drained
            // zero-record file.
            drop(file);
            dispose(worker, path, true);
            return Outcome::Merged;
        }
        log_append_warn!("failed to read incremental header", path = %path.display(), error = %e);
        route_to_error(worker, path);
        return Outcome::Errored;
    }
    let source_header = match FileHeader::from_bytes(&header_bytes) {
        Ok(h) => h,
        Err(e) => {
            log_append_warn!("bad incremental header", path = %path.display(), error = %e);
            route_to_error(worker, path);
            return Outcome::Errored;
        }
    };

    if let Some(reject_reason) = check_time_window(worker, source_header.directive.hour_ms) {
        log_append_warn!("rejecting incremental by time-window policy", path = %path.display(), reason = %reject_reason);
        route_to_error(worker, path);
        return Outcome::Errored;
    }

    let basename = flowpack_wire::default_basename(flowpack_model::CacheKey::new(
        source_header.directive.flowtype_id,
        source_header.directive.sensor_id,
        source_header.directive.hour_ms,
    ));

    let should_abandon = || worker.shutdown.load(Ordering::SeqCst);
    if worker.locks.acquire(&basename, should_abandon).is_none() {
        return Outcome::Skipped;
    }
    let result = merge_into_destination(worker, &mut file, &source_header, &basename);
    worker.locks.release(&basename);

    match result {
        Ok(MergeOutcome { wrote_any, is_new_file }) => {
            if is_new_file {
                if let Some(template) = &worker.appender.hour_file_command {
                    let dest = worker.root_directory.join(flowpack_wire::default_repository_relpath(
                        flowpack_model::CacheKey::new(
                            source_header.directive.flowtype_id,
                            source_header.directive.sensor_id,
                            source_header.directive.hour_ms,
                        ),
                    ));
                    run_hour_file_command(template, &dest);
                }
            }
            let _ = wrote_any;
            drop(file);
            dispose(worker, path, true);
            Outcome::Merged
        }
        Err(e) => {
            log_append_error!("merge failed", path = %path.display(), error = %e);
            drop(file);
            route_to_error(worker, path);
            Outcome::Errored
        }
    }
}

fn check_time_window(worker: &AppenderWorker, hour_ms: i64) -> Option<&'static str> {
    let now_hour = flowpack_model::floor_to_hour(now_ms());
    let diff_hours = (now_hour - hour_ms) / flowpack_model::HOUR_MS;
    if let Some(past) = worker.appender.reject_hours_past {
        if diff_hours > past as i64 {
            return Some("older than reject-hours-past");
        }
    }
    if let Some(future) = worker.appender.reject_hours_future {
        if -diff_hours > future as i64 {
            return Some("newer than reject-hours-future");
        }
    }
    None
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

struct MergeOutcome {
    wrote_any: bool,
    is_new_file: bool,
}

/// Step 7-9: open the destination hourly file, remember `pos`, copy
/// records, and truncate back to `pos` on any fatal write error.
fn merge_into_destination(
    worker: &AppenderWorker,
    source: &mut File,
    source_header: &FileHeader,
    basename: &str,
) -> anyhow::Result<MergeOutcome> {
    let rel = flowpack_wire::default_repository_relpath(flowpack_model::CacheKey::new(
        source_header.directive.flowtype_id,
        source_header.directive.sensor_id,
        source_header.directive.hour_ms,
    ));
    let dest_path = worker.root_directory.join(rel);
    if let Some(parent) = dest_path.parent() {
        flowpack_config::path::ensure_dir_0755(parent)?;
    }

    let is_new_file = !dest_path.exists();
    let mut dest = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&dest_path)?;

    if worker.locking {
        dest.lock_exclusive()?;
    }

    let dest_header = if is_new_file {
        let header = source_header.with_overrides(worker.byte_order_override, None);
        let bytes = header.to_bytes()?;
        dest.write_all(&bytes)?;
        header
    } else {
        let mut probe = [0u8; HEADER_LEN];
        dest.read_exact(&mut probe)?;
        let header = FileHeader::from_bytes(&probe)?;
        dest.seek(SeekFrom::End(0))?;
        header
    };
    let _ = dest_header;

    let pos = dest.stream_position()?;
    let mut wrote_any = false;
    let copy_result = copy_records(source, &mut dest, &mut wrote_any);

    match copy_result {
        Ok(()) => {
            dest.flush()?;
            Ok(MergeOutcome {
                wrote_any,
                is_new_file,
            })
        }
        Err(e) => {
            if let Err(trunc_err) = dest.set_len(pos) {
                log_append_error!(
                    "truncate-on-error also failed, destination left in unknown state",
                    path = %dest_path.display(),
                    original_error = %e,
                    truncate_error = %trunc_err
                );
            }
            Err(e)
        }
    }
}

fn copy_records(source: &mut File, dest: &mut File, wrote_any: &mut bool) -> anyhow::Result<()> {
    loop {
        match flowpack_wire::read_record(source) {
            Ok(Some(record)) => {
                flowpack_wire::write_record(dest, &record)?;
                *wrote_any = true;
            }
            Ok(None) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}

fn run_hour_file_command(template: &str, dest_path: &Path) {
    let command = template.replace("%s", &dest_path.to_string_lossy());
    match Command::new("sh").arg("-c").arg(&command).status() {
        Ok(status) if status.success() => {}
        Ok(status) => log_append_warn!("hour_file_command exited non-zero", command = %command, status = %status),
        Err(e) => log_append_warn!("failed to spawn hour_file_command", command = %command, error = %e),
    }
}

fn dispose(worker: &AppenderWorker, path: &Path, success: bool) {
    let result = if success {
        dispose_success(&worker.dispose, path)
    } else {
        dispose_failure(&worker.dispose, path)
    };
    if let Err(e) = result {
        log_append_warn!("disposition failed", path = %path.display(), error = %e);
    }
}

fn route_to_error(worker: &AppenderWorker, path: &Path) {
    if let Err(e) = dispose_failure(&worker.dispose, path) {
        log_append_error!("failed to route incremental file to error-dir", path = %path.display(), error = %e);
    }
}

pub fn byte_order_override(opt: ByteOrderOpt) -> Option<ByteOrder> {
    match opt {
        ByteOrderOpt::AsIs => None,
        ByteOrderOpt::Native => Some(ByteOrder::Native),
        ByteOrderOpt::Little => Some(ByteOrder::Little),
        ByteOrderOpt::Big => Some(ByteOrder::Big),
    }
}
