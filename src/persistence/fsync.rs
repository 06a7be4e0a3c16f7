//! Low-level fsync and atomic write operations for durability.
//!
//! Queue items, destination configs and the token cache all become visible
//! through a rename. Both the file and its directory must be synced for the
//! rename to survive power loss.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Syncs a file's contents and metadata to disk.
pub fn fsync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Syncs a directory so that entries created, renamed or removed in it are durable.
///
/// # Errors
///
/// Returns an error if the path doesn't exist or if the fsync system call fails.
#[cfg(unix)]
pub fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    let dir = OpenOptions::new().read(true).open(dir_path)?;
    dir.sync_all()
}

/// Directory handles cannot be synced on this platform; only existence is checked.
#[cfg(not(unix))]
pub fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    std::fs::metadata(dir_path).map(|_| ())
}

/// Writes `bytes` to `tmp_path`, syncs it, renames it to `path`, and syncs the
/// parent directory.
///
/// Readers observe either the old content of `path` or the complete new
/// content, never a partial write. `tmp_path` must live in the same directory
/// as `path` so the rename stays atomic.
pub fn write_atomic(tmp_path: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(tmp_path)?;
        file.write_all(bytes)?;
        fsync_file(&file)?;
    }

    if let Err(e) = std::fs::rename(tmp_path, path) {
        let _ = std::fs::remove_file(tmp_path);
        return Err(e);
    }

    if let Some(parent) = path.parent() {
        fsync_dir(parent)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fsync_file_works() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.txt");

        let mut file = File::create(&path).unwrap();
        file.write_all(b"test data").unwrap();

        fsync_file(&file).unwrap();
    }

    #[test]
    fn fsync_dir_works() {
        let dir = tempdir().unwrap();
        File::create(dir.path().join("test.txt")).unwrap();

        fsync_dir(dir.path()).unwrap();
    }

    #[test]
    fn fsync_dir_fails_on_nonexistent() {
        let result = fsync_dir(Path::new("/nonexistent/path/that/does/not/exist"));
        assert!(result.is_err());
    }

    #[test]
    fn write_atomic_replaces_content_and_removes_temp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let tmp = dir.path().join(".config.json.tmp");

        write_atomic(&tmp, &path, b"first").unwrap();
        write_atomic(&tmp, &path, b"second").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert!(!tmp.exists());
    }

    #[test]
    fn write_atomic_fails_when_directory_missing() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing");

        let result = write_atomic(&missing.join("a.tmp"), &missing.join("a"), b"x");

        assert!(result.is_err());
    }
}
