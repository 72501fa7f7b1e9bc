//! Record snapshot storage + bounded batch execution for GymFuse.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod batch;

pub use batch::{
    BatchConfig, BatchError, BatchOrchestrator, BatchProgress, BatchRunReport, ConcurrencyLimiter,
    ItemOutcome, ItemReport,
};

pub const CRATE_NAME: &str = "gymfuse-storage";

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub record_count: usize,
    pub deduplicated: bool,
}

/// Hash-addressed, write-once store for merged record collections.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn snapshot_relative_path(
        &self,
        written_at: DateTime<Utc>,
        collection: &str,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = written_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(collection)
            .join(format!("{content_hash}.json"))
    }

    /// Serialize `records` as a JSON array and store it immutably.
    pub async fn store_records<T: Serialize>(
        &self,
        written_at: DateTime<Utc>,
        collection: &str,
        records: &[T],
    ) -> anyhow::Result<StoredSnapshot> {
        let bytes = serde_json::to_vec_pretty(records)
            .with_context(|| format!("serializing {collection} snapshot"))?;
        let mut stored = self.store_bytes(written_at, collection, &bytes).await?;
        stored.record_count = records.len();
        Ok(stored)
    }

    /// Store bytes immutably using a hash-addressed path and atomic temp-file rename.
    pub async fn store_bytes(
        &self,
        written_at: DateTime<Utc>,
        collection: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.snapshot_relative_path(written_at, collection, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let span = info_span!("snapshot_store", collection, hash = %content_hash);

        async move {
            let deduplicated = if fs::try_exists(&absolute_path)
                .await
                .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
            {
                true
            } else {
                !write_file_atomic(&absolute_path, bytes).await?
            };
            debug!(deduplicated, bytes = bytes.len(), "snapshot stored");

            Ok::<_, anyhow::Error>(StoredSnapshot {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                record_count: 0,
                deduplicated,
            })
        }
        .instrument(span)
        .await
    }
}

/// Write via a sibling temp file and rename. Returns `false` when another
/// writer created `dest` first.
pub async fn write_file_atomic(dest: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, dest).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(&temp_path).await;
            Ok(false)
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming temp file {} -> {}",
                    temp_path.display(),
                    dest.display()
                )
            })
        }
    }
}

/// Serialize `value` as pretty JSON and write it atomically to `dest`, replacing any previous file.
pub async fn write_json_atomic<T: Serialize + ?Sized>(dest: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", dest.display()))?;
    write_file_atomic(dest, &bytes).await?;
    Ok(())
}

/// Read a JSON document once. Shape checks belong to the caller.
pub async fn read_json_value(path: &Path) -> anyhow::Result<JsonValue> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn written_at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc)
    }

    #[test]
    fn snapshot_hashing_is_stable() {
        let hash = SnapshotStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_snapshots_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let records = vec![json!({"name": "Alpha Gym", "address": "12 Main St"})];

        let first = store.store_records(written_at(), "merged", &records).await.expect("first");
        let second = store.store_records(written_at(), "merged", &records).await.expect("second");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.record_count, 1);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
        assert!(first
            .relative_path
            .to_string_lossy()
            .starts_with("20260224_120000"));
    }

    #[tokio::test]
    async fn snapshots_can_be_stored_from_a_spawned_task() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let records = vec![json!({"name": "Alpha Gym", "address": "12 Main St"})];

        let task = tokio::spawn(async move {
            store.store_records(written_at(), "merged", &records).await
        });
        let stored = task
            .await
            .expect("join")
            .expect("store");
        assert_eq!(stored.record_count, 1);
        assert!(stored.absolute_path.exists());
    }

    #[tokio::test]
    async fn json_written_atomically_reads_back() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out/merged.json");
        write_json_atomic(&path, &json!([{"name": "Alpha Gym"}])).await.expect("write");
        write_json_atomic(&path, &json!([{"name": "Beta Gym"}])).await.expect("overwrite");

        let value = read_json_value(&path).await.expect("read");
        assert_eq!(value, json!([{"name": "Beta Gym"}]));
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("out"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn unreadable_json_reports_the_path() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = read_json_value(&path).await.unwrap_err();
        assert!(format!("{err:#}").contains("broken.json"));
    }
}
