//! Small filesystem helpers shared by the client and the host.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::Result;

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}

/// Write bytes via tmp file + fsync + rename so readers never observe a partial file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = tmp_path(path);
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes).await
}

/// Create `path` only if it does not exist yet. Returns `false` when someone else won.
pub async fn create_exclusive(path: &Path, bytes: &[u8]) -> Result<bool> {
    let file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await;
    match file {
        Ok(mut file) => {
            file.write_all(bytes).await?;
            file.sync_all().await?;
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Create an empty marker file, tolerating one that already exists.
pub async fn touch(path: &Path) -> Result<()> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await?;
    Ok(())
}

pub async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// `Ok(None)` when the file does not exist.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Time since the file was last modified, `None` if it is missing.
pub async fn age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).await.ok()?.modified().ok()?;
    Some(SystemTime::now().duration_since(modified).unwrap_or_default())
}

/// Remove a directory tree; a missing directory counts as removed.
pub async fn remove_dir_all(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_write_atomic_leaves_no_tmp() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("response.json");
        write_json_atomic(&path, &json!({"ok": true})).await.expect("write");

        let read: Option<Value> = read_json(&path).await.expect("read");
        assert_eq!(read, Some(json!({"ok": true})));

        let mut entries = fs::read_dir(dir.path()).await.expect("read_dir");
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.expect("entry") {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["response.json".to_string()]);
    }

    #[tokio::test]
    async fn test_create_exclusive_only_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("claimed.json");
        assert!(create_exclusive(&path, b"{}").await.expect("first claim"));
        assert!(!create_exclusive(&path, b"{}").await.expect("second claim"));
    }

    #[tokio::test]
    async fn test_missing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope.json");
        let read: Option<Value> = read_json(&missing).await.expect("read");
        assert!(read.is_none());
        assert!(age(&missing).await.is_none());
        assert!(!exists(&missing).await);
        remove_dir_all(&dir.path().join("gone")).await.expect("missing dir is fine");
    }
}
