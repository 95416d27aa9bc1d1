//! Write-then-rename atomic primitives and an advisory file lock with bounded
//! exponential-backoff retry and an unlocked fallback for idempotent read-modify-write
//! cycles on small JSON documents.

use crate::domain::error::RecoveryStoreError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

fn io_err(path: &Path, source: std::io::Error) -> RecoveryStoreError {
    RecoveryStoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Write `bytes` to `path` via a temp-file + fsync + rename so readers never observe a
/// partially written file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RecoveryStoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| io_err(parent, e))?;
    }
    let tmp_path = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("json")
    ));

    let mut file = fs::File::create(&tmp_path)
        .await
        .map_err(|e| io_err(&tmp_path, e))?;
    file.write_all(bytes).await.map_err(|e| io_err(&tmp_path, e))?;
    file.sync_all().await.map_err(|e| io_err(&tmp_path, e))?;
    drop(file);

    fs::rename(&tmp_path, path)
        .await
        .map_err(|e| io_err(path, e))?;
    Ok(())
}

pub async fn write_json_atomic<T: Serialize>(
    path: &Path,
    value: &T,
) -> Result<(), RecoveryStoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes).await
}

pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, RecoveryStoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path).await.map_err(|e| io_err(path, e))?;
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Atomic rename between directories, used for the `active/` -> `completed/` move.
pub async fn move_atomic(src: &Path, dst: &Path) -> Result<(), RecoveryStoreError> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| io_err(parent, e))?;
    }
    fs::rename(src, dst).await.map_err(|e| io_err(dst, e))
}

/// Advisory lock over a path's companion `.lock` file, retried with exponential backoff.
/// If every attempt fails to acquire the lock, `f` still runs unlocked: this is the
/// documented fallback path for small, idempotent JSON read-modify-write cycles, and the
/// only path by which concurrent writers may race.
pub async fn with_file_lock<F, Fut, T>(path: &Path, attempts: u32, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    let lock_path = path.with_extension("lock");
    let mut delay_ms = 50u64;

    for attempt in 0..attempts {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .await
        {
            Ok(_guard) => {
                let result = f().await;
                let _ = fs::remove_file(&lock_path).await;
                return result;
            }
            Err(_) if attempt + 1 < attempts => {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(300);
            }
            Err(_) => break,
        }
    }

    warn!(path = %path.display(), "lock acquisition exhausted, proceeding unlocked");
    f().await
}

pub fn tmp_marker(path: &Path) -> PathBuf {
    path.with_extension("tmp")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        value: u32,
    }

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");
        write_json_atomic(&path, &Doc { value: 7 }).await.unwrap();
        let read: Option<Doc> = read_json(&path).await.unwrap();
        assert_eq!(read, Some(Doc { value: 7 }));
    }

    #[tokio::test]
    async fn read_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.json");
        let read: Option<Doc> = read_json(&path).await.unwrap();
        assert_eq!(read, None);
    }

    #[tokio::test]
    async fn move_atomic_relocates_file() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("active").join("t1.json");
        let dst = dir.path().join("completed").join("t1.json");
        write_json_atomic(&src, &Doc { value: 1 }).await.unwrap();
        move_atomic(&src, &dst).await.unwrap();
        assert!(!src.exists());
        assert!(dst.exists());
    }

    #[tokio::test]
    async fn with_file_lock_runs_closure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");
        let ran = with_file_lock(&path, 5, || async { 42 }).await;
        assert_eq!(ran, 42);
        assert!(!path.with_extension("lock").exists());
    }

    #[tokio::test]
    async fn double_write_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");
        write_json_atomic(&path, &Doc { value: 5 }).await.unwrap();
        let first = fs::read(&path).await.unwrap();
        write_json_atomic(&path, &Doc { value: 5 }).await.unwrap();
        let second = fs::read(&path).await.unwrap();
        assert_eq!(first, second);
    }
}
