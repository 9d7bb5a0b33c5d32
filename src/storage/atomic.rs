//! Atomic file primitives.
//!
//! Every state file is written through a temp file in the same directory
//! followed by a rename, so a crash mid-write never leaves a half-written
//! file observable to a concurrent reader.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::StorageError;

/// Writes text using a temp file + rename so readers never observe partial data.
///
/// # Errors
/// Returns `StorageError::Io` if the parent directory cannot be created or
/// the temp file cannot be written or renamed.
pub fn write_text_atomic(path: &Path, content: &str) -> Result<(), StorageError> {
    if path.as_os_str().is_empty() {
        return Err(StorageError::io(
            path,
            std::io::Error::new(ErrorKind::InvalidInput, "destination path cannot be empty"),
        ));
    }
    if path.is_dir() {
        return Err(StorageError::io(
            path,
            std::io::Error::new(ErrorKind::InvalidInput, "destination path is a directory"),
        ));
    }

    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent_dir).map_err(|e| StorageError::io(parent_dir, e))?;

    let temp_name = format!(
        ".{}.tmp-{}-{}",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("kyrograph"),
        std::process::id(),
        Uuid::new_v4().simple()
    );
    let temp_path = parent_dir.join(temp_name);

    let written = fs::File::create(&temp_path).and_then(|mut file| {
        file.write_all(content.as_bytes())?;
        file.sync_all()
    });
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(StorageError::io(&temp_path, err));
    }

    fs::rename(&temp_path, path).map_err(|err| {
        let _ = fs::remove_file(&temp_path);
        StorageError::io(path, err)
    })
}

/// Serializes `value` as pretty JSON and writes it atomically.
///
/// # Errors
/// Returns `StorageError::Serialization` or any error from [`write_text_atomic`].
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let mut json = serde_json::to_string_pretty(value)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    json.push('\n');
    write_text_atomic(path, &json)
}

/// Reads a file, returning `None` if it does not exist.
///
/// # Errors
/// Returns `StorageError::Io` for any failure other than a missing file.
pub fn read_text_or_none(path: &Path) -> Result<Option<String>, StorageError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StorageError::io(path, err)),
    }
}

/// Reads and parses a JSON file, returning `None` if it does not exist.
///
/// # Errors
/// Returns `StorageError::Parse` if the file exists but is not valid JSON
/// for `T`, or `StorageError::Io` if it cannot be read.
pub fn read_json_or_none<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    let Some(text) = read_text_or_none(path)? else {
        return Ok(None);
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| StorageError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        count: u32,
    }

    #[test]
    fn test_write_text_atomic_writes_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/sample.txt");
        write_text_atomic(&path, "hello world").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello world");
    }

    #[test]
    fn test_write_text_atomic_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_text_atomic(&path, "one").unwrap();
        write_text_atomic(&path, "two").unwrap();
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["state.json".to_string()]);
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
    }

    #[test]
    fn test_write_text_atomic_rejects_directory() {
        let dir = tempdir().unwrap();
        assert!(write_text_atomic(dir.path(), "x").is_err());
    }

    #[test]
    fn test_read_json_or_none_missing_file() {
        let dir = tempdir().unwrap();
        let value: Option<Sample> = read_json_or_none(&dir.path().join("absent.json")).unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_read_json_or_none_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("corrupt.json");
        fs::write(&path, "{not json").unwrap();
        let err = read_json_or_none::<Sample>(&path).unwrap_err();
        assert!(matches!(err, StorageError::Parse { .. }));
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.json");
        write_json_atomic(&path, &Sample { count: 7 }).unwrap();
        let value: Option<Sample> = read_json_or_none(&path).unwrap();
        assert_eq!(value, Some(Sample { count: 7 }));
    }
}
