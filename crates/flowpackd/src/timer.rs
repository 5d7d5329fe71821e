//! Flush/Move Timer (§4.8): periodically resolves the cache according to
//! output mode, and on startup recovers any incremental working files left
//! behind by a prior crash by finalizing them the same way.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flowpack_cache::Cache;
use flowpack_config::{log_pack_info, log_pack_warn};

/// What the timer does with files it closes each tick, selected by
/// output mode. Direct mode never finalizes anything; the two staged
/// modes share the same placeholder+working pair lifecycle and differ
/// only in how the pair is resolved.
#[derive(Debug, Clone)]
pub enum FlushAction {
    Direct,
    IncrementalFiles,
    Sending { sender_directory: PathBuf },
}

/// Finalize one incremental-files pair: rename the working file onto its
/// placeholder's path. The placeholder, already on disk at that path as a
/// zero-byte file, is replaced by this rename. On failure the pair is left
/// as-is; the placeholder's continued presence signals work was attempted.
fn finalize_incremental(working: &Path) -> anyhow::Result<()> {
    let placeholder = flowpack_wire::placeholder_path_for(working);
    fs::rename(working, &placeholder)?;
    Ok(())
}

/// Reserve a destination path for `basename` under `sender_dir`: the
/// direct path if free, else a fresh mkstemp-style suffixed name. Uses
/// `create_new` to claim the name atomically before the caller moves the
/// working file onto it, the same idiom `flowpack_wire::create_incremental_pair`
/// uses for the placeholder.
fn reserve_sending_destination(sender_dir: &Path, basename: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(sender_dir)?;
    let direct = sender_dir.join(basename);
    match File::options().write(true).create_new(true).open(&direct) {
        Ok(_) => Ok(direct),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            let reserved = tempfile::Builder::new()
                .prefix(&format!("{basename}."))
                .rand_bytes(6)
                .suffix("")
                .tempfile_in(sender_dir)?;
            let (_file, path) = reserved.keep().map_err(|e| e.error)?;
            Ok(path)
        }
        Err(e) => Err(e),
    }
}

/// Finalize one sending-mode pair: move the working file into
/// `sender_dir` under its basename (a fresh suffix on collision), then
/// unlink the now-orphaned placeholder.
fn finalize_sending(working: &Path, sender_dir: &Path) -> anyhow::Result<()> {
    let basename = working
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let basename = basename.strip_prefix('.').unwrap_or(&basename);
    let dest = reserve_sending_destination(sender_dir, basename)?;
    flowpack_dispose::move_file(working, &dest)?;
    let placeholder = flowpack_wire::placeholder_path_for(working);
    let _ = fs::remove_file(&placeholder);
    Ok(())
}

fn finalize(action: &FlushAction, working: &Path) -> anyhow::Result<()> {
    match action {
        FlushAction::Direct => Ok(()),
        FlushAction::IncrementalFiles => finalize_incremental(working),
        FlushAction::Sending { sender_directory } => finalize_sending(working, sender_directory),
    }
}

/// Finalize one file `Cache::close_all` returned, the same way a flush
/// timer tick would. Exposed for the daemon's own shutdown path, which
/// calls `close_all` directly rather than through the timer.
pub fn finalize_closed(action: &FlushAction, working: &Path) -> anyhow::Result<()> {
    finalize(action, working)
}

/// Rename every dot-prefixed working file directly under `dir` back onto
/// its placeholder name, so a restart after a crash doesn't strand
/// records an appender would otherwise never see. Only pairs where the
/// placeholder is zero-byte and the working file is non-empty are
/// recovered — an empty working file means no record was ever written,
/// and a non-zero placeholder means a previous finalize already ran.
/// Returns the count recovered. No-op for direct mode (`action` is only
/// ever called here with a staged variant; see `main.rs`).
pub fn recover_incremental_directory(dir: &Path, action: &FlushAction) -> anyhow::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut recovered = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_dotfile = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'));
        if !is_dotfile || !entry.file_type()?.is_file() {
            continue;
        }
        if entry.metadata()?.len() == 0 {
            continue;
        }
        let placeholder = flowpack_wire::placeholder_path_for(&path);
        let placeholder_is_zero = fs::metadata(&placeholder).map(|m| m.len() == 0).unwrap_or(true);
        if !placeholder_is_zero {
            continue;
        }
        finalize(action, &path)?;
        recovered += 1;
    }
    if recovered > 0 {
        log_pack_info!("recovered incremental working files after restart", count = recovered);
    }
    Ok(recovered)
}

/// Background loop: every `interval`, resolve the cache per `action`.
/// Exits once `shutdown` is observed.
pub fn run_flush_timer(cache: Arc<Cache>, interval: Duration, shutdown: Arc<AtomicBool>, action: FlushAction) {
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(interval);
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match &action {
            FlushAction::Direct => {
                let flushed = cache.flush();
                if !flushed.is_empty() {
                    log_pack_info!(
                        "flush timer tick",
                        files = flushed.len(),
                        open = cache.open_count()
                    );
                }
            }
            FlushAction::IncrementalFiles | FlushAction::Sending { .. } => {
                let closed = cache.close_all();
                for file in &closed {
                    if let Err(e) = finalize(&action, &file.filename) {
                        log_pack_warn!(
                            "failed to finalize closed file",
                            file = %file.filename.display(),
                            error = %e.to_string()
                        );
                    }
                }
                if !closed.is_empty() {
                    log_pack_info!("flush/move timer tick", files = closed.len());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn recover_incremental_renames_dotfiles_to_placeholder_name() {
        let dir = tempfile::tempdir().unwrap();
        let working = dir.path().join(".ft1-s1-H0.abcdef");
        {
            let mut f = std::fs::File::create(&working).unwrap();
            f.write_all(b"data").unwrap();
        }
        std::fs::write(dir.path().join("ft1-s1-H0.abcdef"), b"").unwrap();

        let recovered =
            recover_incremental_directory(dir.path(), &FlushAction::IncrementalFiles).unwrap();
        assert_eq!(recovered, 1);
        assert!(dir.path().join("ft1-s1-H0.abcdef").exists());
        assert!(!working.exists());
    }

    #[test]
    fn recover_ignores_non_dotfiles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ft1-s1-H0"), b"data").unwrap();
        let recovered =
            recover_incremental_directory(dir.path(), &FlushAction::IncrementalFiles).unwrap();
        assert_eq!(recovered, 0);
    }

    #[test]
    fn recover_ignores_empty_working_files() {
        let dir = tempfile::tempdir().unwrap();
        let working = dir.path().join(".ft1-s1-H0.abcdef");
        std::fs::File::create(&working).unwrap();
        std::fs::write(dir.path().join("ft1-s1-H0.abcdef"), b"").unwrap();

        let recovered =
            recover_incremental_directory(dir.path(), &FlushAction::IncrementalFiles).unwrap();
        assert_eq!(recovered, 0);
        assert!(working.exists());
    }

    #[test]
    fn recover_ignores_pairs_already_finalized() {
        let dir = tempfile::tempdir().unwrap();
        let working = dir.path().join(".ft1-s1-H0.abcdef");
        {
            let mut f = std::fs::File::create(&working).unwrap();
            f.write_all(b"data").unwrap();
        }
        // Placeholder already non-zero: a previous finalize completed.
        std::fs::write(dir.path().join("ft1-s1-H0.abcdef"), b"already done").unwrap();

        let recovered =
            recover_incremental_directory(dir.path(), &FlushAction::IncrementalFiles).unwrap();
        assert_eq!(recovered, 0);
        assert!(working.exists());
    }

    #[test]
    fn recover_sending_moves_working_file_and_unlinks_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let sender_dir = dir.path().join("sender");
        let working = dir.path().join(".ft1-s1-H0.abcdef");
        {
            let mut f = std::fs::File::create(&working).unwrap();
            f.write_all(b"data").unwrap();
        }
        std::fs::write(dir.path().join("ft1-s1-H0.abcdef"), b"").unwrap();

        let action = FlushAction::Sending {
            sender_directory: sender_dir.clone(),
        };
        let recovered = recover_incremental_directory(dir.path(), &action).unwrap();
        assert_eq!(recovered, 1);
        assert!(sender_dir.join("ft1-s1-H0.abcdef").exists());
        assert!(!working.exists());
        assert!(!dir.path().join("ft1-s1-H0.abcdef").exists());
    }

    #[test]
    fn finalize_sending_appends_suffix_on_collision() {
        let dir = tempfile::tempdir().unwrap();
        let sender_dir = dir.path().join("sender");
        std::fs::create_dir_all(&sender_dir).unwrap();
        std::fs::write(sender_dir.join("ft1-s1-H0"), b"existing").unwrap();

        let working = dir.path().join(".ft1-s1-H0");
        std::fs::write(&working, b"new data").unwrap();

        finalize_sending(&working, &sender_dir).unwrap();
        assert!(!working.exists());
        assert_eq!(
            std::fs::read(sender_dir.join("ft1-s1-H0")).unwrap(),
            b"existing"
        );

        let extra: Vec<_> = std::fs::read_dir(&sender_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "ft1-s1-H0")
            .collect();
        assert_eq!(extra.len(), 1);
        assert_eq!(std::fs::read(extra[0].path()).unwrap(), b"new data");
    }
}
