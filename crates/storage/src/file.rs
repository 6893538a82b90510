use std::{
    fs,
    io::Write,
    path::Path,
};

use relayer_types::{RelayerError, StorageOperation};
use serde::{de::DeserializeOwned, Serialize};

fn storage_err(
    operation: StorageOperation,
    path: &Path,
    reason: impl std::fmt::Display,
) -> RelayerError {
    RelayerError::Storage {
        operation,
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

/// Write `value` to `path` atomically: serialize into a sibling `*.tmp`,
/// fsync it, then rename over the target. A crash at any point leaves either
/// the previous file or the new one, never a partial write.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), RelayerError> {
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| storage_err(StorageOperation::Persist, path, e))?;

    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        // Windows refuses to rename over an existing file.
        #[cfg(windows)]
        if path.exists() {
            fs::remove_file(path)?;
        }
        fs::rename(&tmp, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(storage_err(StorageOperation::Persist, path, e));
    }
    Ok(())
}

/// Load a JSON file. A missing or empty file yields the default; a present
/// but malformed file is a load error that must block startup.
pub fn load_json_or_default<T>(path: &Path) -> Result<T, RelayerError>
where
    T: DeserializeOwned + Default,
{
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(storage_err(StorageOperation::Load, path, e)),
    };
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(T::default());
    }
    serde_json::from_slice(&bytes).map_err(|e| storage_err(StorageOperation::Load, path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swaps.json");

        let value = vec!["a".to_string(), "b".to_string()];
        write_json_atomic(&path, &value).unwrap();
        let back: Vec<String> = load_json_or_default(&path).unwrap();
        assert_eq!(back, value);

        // No temp file is left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn missing_and_empty_files_load_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        let loaded: Vec<String> = load_json_or_default(&missing).unwrap();
        assert!(loaded.is_empty());

        let empty = dir.path().join("empty.json");
        fs::write(&empty, "  \n").unwrap();
        let loaded: Vec<String> = load_json_or_default(&empty).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn malformed_file_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{not json").unwrap();
        let result: Result<Vec<String>, _> = load_json_or_default(&path);
        assert!(matches!(
            result,
            Err(RelayerError::Storage {
                operation: StorageOperation::Load,
                ..
            })
        ));
    }

    #[test]
    fn failed_write_preserves_the_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_json_atomic(&path, &vec![1u32, 2, 3]).unwrap();

        // Values that cannot serialize leave the old contents intact.
        let unserializable = std::collections::BTreeMap::from([(vec![1u8], "x")]);
        assert!(write_json_atomic(&path, &unserializable).is_err());
        let back: Vec<u32> = load_json_or_default(&path).unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }
}
