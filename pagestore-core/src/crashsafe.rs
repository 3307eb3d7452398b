//! Crash-safe file helpers
//!
//! A file becomes visible under its final name only after its contents and
//! the rename are durable.

use crate::Result;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Suffix of files that are still being written
pub const TEMP_SUFFIX: &str = "___temp";

/// Temporary sibling path for `path`
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(TEMP_SUFFIX);
    path.with_file_name(name)
}

pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map_or(false, |n| n.ends_with(TEMP_SUFFIX))
}

/// fsync a directory so renames and unlinks inside it are durable
pub fn fsync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Write `data` to `path` atomically: temp file, fsync, rename, fsync dir
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = temp_path(path);
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    durable_rename(&tmp, path)
}

/// Rename an already-fsynced file into place and fsync the parent
pub fn durable_rename(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to)?;
    if let Some(parent) = to.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}

/// Create a directory (and parents) and make the entry durable
pub fn create_dir_durable(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    if let Some(parent) = dir.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}
