//! Durable file primitives.
//!
//! Every piece of authoritative state is written through these helpers so a
//! reader never observes a half-written file: content goes to a sibling
//! temporary file, is fsynced, and is then moved into place.

use crate::error::{ConductorError, ConductorResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()))
}

async fn write_temp(path: &Path, bytes: &[u8]) -> ConductorResult<PathBuf> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = temp_sibling(path);
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(tmp)
}

/// Replace `path` with `bytes` atomically.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> ConductorResult<()> {
    let tmp = write_temp(path, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Create `path` with `bytes` only if it does not exist yet.
///
/// Returns `Ok(false)` when the file was already present. The check and the
/// creation are a single filesystem operation (a hard link of a fully written
/// temporary file), so two concurrent writers can never both succeed.
pub async fn create_exclusive(path: &Path, bytes: &[u8]) -> ConductorResult<bool> {
    let tmp = write_temp(path, bytes).await?;
    let linked = tokio::fs::hard_link(&tmp, path).await;
    let _ = tokio::fs::remove_file(&tmp).await;
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Serialize `value` as pretty JSON and write it atomically.
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> ConductorResult<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &json).await
}

/// Read a JSON file, returning `None` if it does not exist.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> ConductorResult<Option<T>> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&data).map(Some).map_err(|e| {
        ConductorError::Store(format!("Failed to parse {}: {e}", path.display()))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_atomic_replaces_content() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"second");

        // No temporary files are left behind.
        let mut entries = tokio::fs::read_dir(tmp.path()).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_create_exclusive_only_once() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("TASK-1.done");
        assert!(create_exclusive(&path, b"one").await.unwrap());
        assert!(!create_exclusive(&path, b"two").await.unwrap());
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_read_json_missing_is_none() {
        let tmp = TempDir::new().unwrap();
        let value: Option<serde_json::Value> =
            read_json(&tmp.path().join("absent.json")).await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_read_json_corrupt_is_store_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        let err = read_json::<serde_json::Value>(&path).await.unwrap_err();
        assert!(matches!(err, ConductorError::Store(_)));
        assert!(err.is_integrity());
    }
}
