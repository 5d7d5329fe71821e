//! Small path helpers shared by the opener, cache, and disposition code.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Normalize a path, falling back to the original if it doesn't exist yet
/// (canonicalization only works on paths that already exist).
pub fn normalize_or_original(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Ensure `dir` exists, creating it (and parents) with mode 0755 under
/// `umask 0022`, matching §4.6.1 step 2's repository-directory creation
/// rule.
pub fn ensure_dir_0755(dir: &Path) -> io::Result<()> {
    if dir.exists() {
        return Ok(());
    }
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o755);
        fs::set_permissions(dir, perms)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_dir_creates_missing_parents() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a").join("b").join("c");
        ensure_dir_0755(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn normalize_or_original_falls_back_for_missing_path() {
        let missing = Path::new("/definitely/does/not/exist/flowpack");
        assert_eq!(normalize_or_original(missing), missing.to_path_buf());
    }
}
