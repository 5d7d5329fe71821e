//! # flowpack-dispose
//!
//! Disposition (§4.9): what happens to an input file after a pack-pipeline
//! worker finishes draining it, successfully or not.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::Utc;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum DisposeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("input file failed and no error_dir is configured")]
    NoErrorDir,
}

pub type Result<T> = std::result::Result<T, DisposeError>;

/// Disposition policy, one instance per pack-pipeline worker (or shared,
/// since it's read-only after construction).
#[derive(Debug, Clone, Default)]
pub struct DisposeConfig {
    pub archive_dir: Option<PathBuf>,
    pub flat_archive: bool,
    pub post_archive_command: Option<String>,
    pub error_dir: Option<PathBuf>,
}

/// Move `path`, tolerating cross-device renames by falling back to
/// copy-then-unlink. Grounded on the write-temp-then-rename idiom used
/// for atomic publication elsewhere in this codebase, adapted here for
/// a move between two already-final paths rather than a temp file.
pub fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc_exdev()) => {
            fs::copy(src, dst)?;
            fs::remove_file(src)?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn libc_exdev() -> i32 {
    18 // EXDEV on Linux and macOS
}

#[cfg(not(unix))]
fn libc_exdev() -> i32 {
    -1
}

fn run_post_archive_command(template: &str, archived_path: &Path) {
    let command = template.replace("%s", &archived_path.to_string_lossy());
    match Command::new("sh").arg("-c").arg(&command).status() {
        Ok(status) if status.success() => {}
        Ok(status) => warn!(%command, ?status, "post_archive_command exited non-zero"),
        Err(e) => warn!(%command, error = %e, "failed to spawn post_archive_command"),
    }
}

/// Dispose of a successfully drained input file: archive (tree or flat)
/// or unlink, then run `post_archive_command` if configured. Command
/// failures are logged, not propagated (§4.9).
pub fn dispose_success(config: &DisposeConfig, path: &Path) -> Result<()> {
    let Some(archive_dir) = &config.archive_dir else {
        fs::remove_file(path)?;
        return Ok(());
    };

    let basename = path
        .file_name()
        .map(|n| n.to_owned())
        .unwrap_or_else(|| path.as_os_str().to_owned());

    let dest = if config.flat_archive {
        archive_dir.join(&basename)
    } else {
        let now = Utc::now();
        archive_dir
            .join(format!("{:04}", now.format("%Y")))
            .join(format!("{:02}", now.format("%m")))
            .join(format!("{:02}", now.format("%d")))
            .join(format!("{:02}", now.format("%H")))
            .join(&basename)
    };

    move_file(path, &dest)?;

    if let Some(template) = &config.post_archive_command {
        run_post_archive_command(template, &dest);
    }

    Ok(())
}

/// Dispose of an input file that failed mid-read: move to `error_dir` if
/// configured, else return an error so the caller aborts the worker.
pub fn dispose_failure(config: &DisposeConfig, path: &Path) -> Result<()> {
    let Some(error_dir) = &config.error_dir else {
        return Err(DisposeError::NoErrorDir);
    };
    let basename = path
        .file_name()
        .map(|n| n.to_owned())
        .unwrap_or_else(|| path.as_os_str().to_owned());
    move_file(path, &error_dir.join(basename))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(b"x").unwrap();
        path
    }

    #[test]
    fn dispose_success_unlinks_when_no_archive_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = touch(dir.path(), "a.dat");
        let config = DisposeConfig::default();
        dispose_success(&config, &path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn dispose_success_flat_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("archive");
        let path = touch(dir.path(), "a.dat");
        let config = DisposeConfig {
            archive_dir: Some(archive.clone()),
            flat_archive: true,
            ..Default::default()
        };
        dispose_success(&config, &path).unwrap();
        assert!(archive.join("a.dat").exists());
        assert!(!path.exists());
    }

    #[test]
    fn dispose_success_tree_archive_uses_hour_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("archive");
        let path = touch(dir.path(), "b.dat");
        let config = DisposeConfig {
            archive_dir: Some(archive.clone()),
            flat_archive: false,
            ..Default::default()
        };
        dispose_success(&config, &path).unwrap();

        let now = Utc::now();
        let expected = archive
            .join(format!("{:04}", now.format("%Y")))
            .join(format!("{:02}", now.format("%m")))
            .join(format!("{:02}", now.format("%d")))
            .join(format!("{:02}", now.format("%H")))
            .join("b.dat");
        assert!(expected.exists());
    }

    #[test]
    fn dispose_failure_without_error_dir_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = touch(dir.path(), "c.dat");
        let config = DisposeConfig::default();
        assert!(matches!(
            dispose_failure(&config, &path),
            Err(DisposeError::NoErrorDir)
        ));
    }

    #[test]
    fn dispose_failure_moves_to_error_dir() {
        let dir = tempfile::tempdir().unwrap();
        let error_dir = dir.path().join("errors");
        let path = touch(dir.path(), "d.dat");
        let config = DisposeConfig {
            error_dir: Some(error_dir.clone()),
            ..Default::default()
        };
        dispose_failure(&config, &path).unwrap();
        assert!(error_dir.join("d.dat").exists());
        assert!(!path.exists());
    }
}
