//! JSON files written by training: weights and checkpoint manifests.

use crate::error::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// `<path>.tmp`, kept next to the target so the final rename stays on one
/// filesystem.
fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Serialize `data` as pretty JSON and replace `path` with it in one rename.
/// Parent directories are created as needed.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(data)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let staging = staging_path(path);
    std::fs::write(&staging, json)?;
    std::fs::rename(&staging, path)?;
    Ok(())
}

/// `Ok(None)` when the file is absent; a file that exists but does not parse
/// is an error.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(path)?;
    Ok(Some(serde_json::from_slice(&bytes)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MlError;

    #[test]
    fn test_write_then_load_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("run_top_layer.h5");
        atomic_write_json(&path, &vec![1, 2, 3]).unwrap();
        let loaded: Option<Vec<i32>> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(vec![1, 2, 3]));
        assert!(!dir.path().join("a/b/run_top_layer.h5.tmp").exists());
    }

    #[test]
    fn test_staging_path_keeps_full_name() {
        assert_eq!(
            staging_path(Path::new("/w/run.checkpoints.json")),
            PathBuf::from("/w/run.checkpoints.json.tmp")
        );
    }

    #[test]
    fn test_load_missing_is_none() {
        let loaded: Option<Vec<i32>> = load_json(Path::new("/no/such/file.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_load_garbage_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = load_json::<Vec<i32>>(&path).unwrap_err();
        assert!(matches!(err, MlError::Serde(_)));
    }
}
