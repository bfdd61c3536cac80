//! JSON persistence helpers.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::{RehearsalError, Result};

/// Write `value` as pretty JSON, creating parent directories as needed.
pub fn save_json<T: Serialize, P: AsRef<Path>>(value: &T, path: P) -> Result<()> {
    let path = path.as_ref();
    let io_err = |source| RehearsalError::Persistence {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
    }

    let file = File::create(path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value).map_err(|source| {
        RehearsalError::Serialization {
            path: path.to_path_buf(),
            source,
        }
    })?;
    writer.flush().map_err(io_err)?;
    Ok(())
}

/// Read a JSON document written by [`save_json`].
pub fn load_json<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| RehearsalError::Persistence {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| {
        RehearsalError::Serialization {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_save_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("value.json");

        let mut value = BTreeMap::new();
        value.insert("a".to_string(), 0.1_f64);
        save_json(&value, &path).unwrap();

        let loaded: BTreeMap<String, f64> = load_json(&path).unwrap();
        assert_eq!(loaded, value);
    }

    #[test]
    fn test_load_missing_file_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let err = load_json::<Vec<f64>, _>(&path).unwrap_err();
        match err {
            RehearsalError::Persistence { path: p, .. } => assert_eq!(p, path),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_load_garbage_is_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            load_json::<Vec<f64>, _>(&path),
            Err(RehearsalError::Serialization { .. })
        ));
    }
}
