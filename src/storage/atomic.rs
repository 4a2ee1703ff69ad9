//! Crash-safe whole-file replacement
//!
//! The new contents go to `<file>.tmp`, are fsynced, then renamed over the
//! target. Readers see either the previous document or the new one.

use crate::error::{Error, Result};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Indentation used when pretty-printing a JSON document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indent {
    Two,
    Four,
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T, indent: Indent) -> Result<()> {
    let spaces: &[u8] = match indent {
        Indent::Two => b"  ",
        Indent::Four => b"    ",
    };
    let mut bytes = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(spaces);
    let mut serializer = serde_json::Serializer::with_formatter(&mut bytes, formatter);
    value
        .serialize(&mut serializer)
        .map_err(|e| Error::Serialization(format!("Failed to encode {}: {}", path.display(), e)))?;

    write_atomic(path, &bytes)
}

/// Atomically replace `path` with `bytes`
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp_path = temp_path_for(path)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::Storage(format!("Failed to create {}: {}", parent.display(), e)))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&temp_path)
        .map_err(|e| Error::Storage(format!("Failed to create {}: {}", temp_path.display(), e)))?;

    file.write_all(bytes)
        .map_err(|e| Error::Storage(format!("Failed to write {}: {}", temp_path.display(), e)))?;

    // Fsync for durability
    file.sync_all()
        .map_err(|e| Error::Storage(format!("Failed to sync {}: {}", temp_path.display(), e)))?;
    drop(file);

    std::fs::rename(&temp_path, path).map_err(|e| {
        Error::Storage(format!(
            "Failed to rename {} to {}: {}",
            temp_path.display(),
            path.display(),
            e
        ))
    })?;

    sync_parent(path);

    debug!(path = %path.display(), bytes = bytes.len(), "Replaced file");
    Ok(())
}

/// Move an unreadable file to `<file>.corrupt-<timestamp>` so it is never overwritten
pub fn quarantine(path: &Path) -> Result<PathBuf> {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
    let mut name = path
        .file_name()
        .ok_or_else(|| Error::InvalidArgument(format!("Not a file path: {}", path.display())))?
        .to_os_string();
    name.push(format!(".corrupt-{}", stamp));
    let target = path.with_file_name(name);

    std::fs::rename(path, &target).map_err(|e| {
        Error::Storage(format!(
            "Failed to move corrupt file {} aside: {}",
            path.display(),
            e
        ))
    })?;
    warn!(from = %path.display(), to = %target.display(), "Quarantined corrupt file");
    Ok(target)
}

/// `<file>.tmp` next to the target
fn temp_path_for(path: &Path) -> Result<PathBuf> {
    let mut name = path
        .file_name()
        .ok_or_else(|| Error::InvalidArgument(format!("Not a file path: {}", path.display())))?
        .to_os_string();
    name.push(".tmp");
    Ok(path.with_file_name(name))
}

/// Make the rename itself durable
#[cfg(unix)]
fn sync_parent(path: &Path) {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    if let Ok(dir) = File::open(parent) {
        if let Err(e) = dir.sync_all() {
            debug!(dir = %parent.display(), error = %e, "Directory sync failed");
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("slotkeeper_{}_{}", name, uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_write_atomic_replaces_contents() -> Result<()> {
        let dir = temp_dir("atomic");
        let path = dir.join("nested").join("doc.json");

        write_atomic(&path, b"first")?;
        write_atomic(&path, b"second")?;

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert!(!dir.join("nested").join("doc.json.tmp").exists());

        std::fs::remove_dir_all(dir).ok();
        Ok(())
    }

    #[test]
    fn test_write_json_indent() -> Result<()> {
        let dir = temp_dir("indent");
        let path = dir.join("counts.json");

        write_json(&path, &serde_json::json!({"1": [1]}), Indent::Four)?;
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\n    \"1\": [\n        1\n    ]"));

        std::fs::remove_dir_all(dir).ok();
        Ok(())
    }

    #[test]
    fn test_quarantine_keeps_contents() -> Result<()> {
        let dir = temp_dir("quarantine");
        let path = dir.join("broken.json");
        write_atomic(&path, b"[{")?;

        let target = quarantine(&path)?;
        assert!(!path.exists());
        assert!(target.to_string_lossy().contains("broken.json.corrupt-"));
        assert_eq!(std::fs::read(&target).unwrap(), b"[{");

        std::fs::remove_dir_all(dir).ok();
        Ok(())
    }

    #[test]
    fn test_rejects_directory_path() {
        assert!(matches!(
            write_atomic(Path::new("/"), b"x"),
            Err(Error::InvalidArgument(_))
        ));
    }
}
