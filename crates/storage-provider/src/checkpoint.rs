//! Crash-safe persistence primitives. State files are written to a temporary
//! sibling, fsynced, and renamed into place so a reader always observes
//! either the old or the new complete record. Append-only logs are
//! line-delimited JSON where a torn final line is discarded on recovery.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

async fn sync_parent_dir(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        let parent = parent.to_owned();
        // Directory fsync needs a std file handle
        tokio::task::spawn_blocking(move || {
            std::fs::File::open(parent)?.sync_all()
        })
        .await??;
    }
    Ok(())
}

/// Atomically replaces the file at `path` with the JSON serialization of
/// `value`, creating parent directories as needed.
pub async fn checkpoint<T: Serialize>(path: impl AsRef<Path>, value: &T) -> anyhow::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = tmp_sibling(path);
    let bytes = serde_json::to_vec(value)?;

    let mut file = File::create(&tmp).await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    sync_parent_dir(path).await
}

/// Reads back the last complete record written with [`checkpoint`].
/// A missing file is `Ok(None)`.
pub async fn recover<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<Option<T>> {
    let path = path.as_ref();
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Appends one record to a line-delimited JSON log, fsyncing before
/// returning so the record survives a crash.
pub async fn append_record<T: Serialize>(path: impl AsRef<Path>, value: &T) -> anyhow::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    file.sync_all().await?;
    Ok(())
}

/// Reads every complete record out of an append-only log. A record that was
/// torn by a crash mid-append (no trailing newline, or unparsable) is
/// dropped with a warning; a missing log yields an empty list.
pub async fn read_records<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<Vec<T>> {
    let path = path.as_ref();
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for (index, line) in bytes.split(|b| *b == b'\n').enumerate() {
        if line.is_empty() {
            continue;
        }
        match serde_json::from_slice(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(
                    error = %e,
                    path = %path.display(),
                    line = index,
                    "Dropping torn record from append log"
                );
                break;
            }
        }
    }
    Ok(records)
}
