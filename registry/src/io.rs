//! Atomic file writes.
//!
//! Uses the temp-file + fsync + rename pattern so readers only ever observe
//! the previous or the next complete version of a file.

use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::error::{RegistryError, Result};

/// Write `data` to `target` atomically.
///
/// 1. Write to a hidden temporary sibling in the same directory
/// 2. fsync the temporary file
/// 3. Rename (atomic on POSIX) over the target
pub fn atomic_write(target: &Path, data: &[u8]) -> Result<()> {
    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(|e| RegistryError::io(&dir, e))?;

    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "registry".to_string());
    let temp_path = dir.join(format!(".{file_name}.tmp"));

    let mut file =
        std::fs::File::create(&temp_path).map_err(|e| RegistryError::io(&temp_path, e))?;
    file.write_all(data)
        .map_err(|e| RegistryError::io(&temp_path, e))?;
    file.sync_all()
        .map_err(|e| RegistryError::io(&temp_path, e))?;

    std::fs::rename(&temp_path, target).map_err(|e| RegistryError::io(target, e))?;
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: Serialize>(target: &Path, value: &T) -> Result<()> {
    let mut json = serde_json::to_string_pretty(value)?;
    json.push('\n');
    atomic_write(target, json.as_bytes())
}

/// Read a file to string, returning `None` when it does not exist.
pub fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(RegistryError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_and_leaves_no_temp() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("nested").join("registry.json");

        atomic_write(&target, b"first").unwrap();
        atomic_write(&target, b"second").unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "second");
        assert!(!tmp.path().join("nested/.registry.json.tmp").exists());
    }

    #[test]
    fn read_optional_missing_is_none() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(read_optional(&tmp.path().join("absent.json")).unwrap().is_none());
    }
}
