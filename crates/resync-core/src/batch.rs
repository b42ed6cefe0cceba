//! Durable on-disk pages awaiting application to destinations.
//!
//! Layout: `<root>/<source>/<resource>/<kind>_batch_<batchId>_seq_<n>.json`.
//! A file stays in place until every destination has applied it, so a crashed
//! run is resumed by the next one.

use std::cmp::Ordering;
use std::fmt;
use std::iter::Peekable;
use std::path::{Path, PathBuf};
use std::str::Chars;

use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::AppError;
use crate::models::Page;

const BATCH_ID_FORMAT: &str = "%Y-%m-%d-T-%H-%M-%S-%3f";
const DONE_DIR: &str = "done";
const EXTENSION: &str = ".json";

/// Batch namespace; sync and purge files never mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchKind {
    Sync,
    Purge,
}

impl BatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchKind::Sync => "sync",
            BatchKind::Purge => "purge",
        }
    }

    fn from_prefix(s: &str) -> Option<Self> {
        match s {
            "sync" => Some(BatchKind::Sync),
            "purge" => Some(BatchKind::Purge),
            _ => None,
        }
    }
}

/// Run identifier derived from the run's start time, sortable as a string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchId(String);

impl BatchId {
    pub fn from_time(time: DateTime<Utc>) -> Self {
        Self(format!("{}Z", time.format(BATCH_ID_FORMAT)))
    }

    pub fn now() -> Self {
        Self::from_time(Utc::now())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_timestamp(&self) -> Option<DateTime<Utc>> {
        let raw = self.0.strip_suffix('Z')?;
        NaiveDateTime::parse_from_str(raw, BATCH_ID_FORMAT)
            .ok()
            .map(|t| t.and_utc())
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle to one persisted page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFile {
    pub path: PathBuf,
    pub kind: BatchKind,
    pub batch_id: BatchId,
    pub seq: u64,
}

impl BatchFile {
    pub fn file_name(kind: BatchKind, batch_id: &BatchId, seq: u64) -> String {
        format!("{}_batch_{}_seq_{}{}", kind.as_str(), batch_id, seq, EXTENSION)
    }

    /// Parses a path whose file name follows the batch naming pattern.
    pub fn from_path(path: PathBuf) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let stem = name.strip_suffix(EXTENSION)?;
        let (kind, rest) = stem.split_once("_batch_")?;
        let (batch_id, seq) = rest.rsplit_once("_seq_")?;
        Some(Self {
            kind: BatchKind::from_prefix(kind)?,
            batch_id: BatchId(batch_id.to_string()),
            seq: seq.parse().ok()?,
            path,
        })
    }

    pub fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

/// What happens to a file once applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneMode {
    /// Relocate into a sibling `done/` directory.
    Move,
    Delete,
}

#[derive(Debug, Clone)]
pub struct BatchStore {
    root: PathBuf,
    done_mode: DoneMode,
}

impl BatchStore {
    pub fn new(root: impl Into<PathBuf>, done_mode: DoneMode) -> Self {
        Self {
            root: root.into(),
            done_mode,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resource_dir(&self, source: &str, resource: &str) -> PathBuf {
        self.root.join(source).join(resource)
    }

    /// Persists a page. The file becomes visible under its final name only once
    /// fully written, so `list` never returns a partial file.
    pub async fn write(
        &self,
        source: &str,
        resource: &str,
        kind: BatchKind,
        batch_id: &BatchId,
        seq: u64,
        page: &Page,
    ) -> Result<BatchFile, AppError> {
        let dir = self.resource_dir(source, resource);
        fs::create_dir_all(&dir).await?;

        let name = BatchFile::file_name(kind, batch_id, seq);
        let tmp = dir.join(format!(".{}.tmp", name));
        let path = dir.join(&name);

        let bytes = serde_json::to_vec(page)?;
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;

        debug!(batch = %name, records = page.value.len(), "Wrote batch");
        Ok(BatchFile {
            path,
            kind,
            batch_id: batch_id.clone(),
            seq,
        })
    }

    /// Pending batches of one kind in natural file-name order.
    pub async fn list(
        &self,
        source: &str,
        resource: &str,
        kind: BatchKind,
    ) -> Result<Vec<BatchFile>, AppError> {
        let dir = self.resource_dir(source, resource);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            if let Some(file) = BatchFile::from_path(entry.path()) {
                if file.kind == kind {
                    files.push(file);
                }
            }
        }
        files.sort_by(|a, b| natural_cmp(a.name(), b.name()));
        Ok(files)
    }

    pub async fn read(&self, batch: &BatchFile) -> Result<Page, AppError> {
        let bytes = fs::read(&batch.path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Excludes a batch from future listings. Marking an already-done batch is
    /// a no-op.
    pub async fn mark_done(&self, batch: &BatchFile) -> Result<(), AppError> {
        let result = match self.done_mode {
            DoneMode::Delete => fs::remove_file(&batch.path).await,
            DoneMode::Move => {
                let Some(parent) = batch.path.parent() else {
                    return Err(AppError::Generic(format!(
                        "batch path has no parent: {}",
                        batch.path.display()
                    )));
                };
                let done_dir = parent.join(DONE_DIR);
                fs::create_dir_all(&done_dir).await?;
                fs::rename(&batch.path, done_dir.join(batch.name())).await
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Oldest pending batch id of `kind` across the given resources.
    pub async fn oldest_batch_id(
        &self,
        source: &str,
        resources: &[&str],
        kind: BatchKind,
    ) -> Result<Option<BatchId>, AppError> {
        let mut oldest: Option<BatchId> = None;
        for resource in resources {
            for file in self.list(source, resource, kind).await? {
                if oldest.as_ref().is_none_or(|o| file.batch_id < *o) {
                    oldest = Some(file.batch_id);
                }
            }
        }
        Ok(oldest)
    }
}

/// Numeric-aware, case-insensitive file name comparison: `seq_2` sorts before
/// `seq_10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut ai = a.chars().peekable();
    let mut bi = b.chars().peekable();
    loop {
        match (ai.peek().copied(), bi.peek().copied()) {
            (None, None) => break,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(ca), Some(cb)) if ca.is_ascii_digit() && cb.is_ascii_digit() => {
                let na = take_digits(&mut ai);
                let nb = take_digits(&mut bi);
                let ord = cmp_digits(&na, &nb);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(ca), Some(cb)) => {
                ai.next();
                bi.next();
                let ord = ca.to_lowercase().cmp(cb.to_lowercase());
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
    a.cmp(b)
}

fn take_digits(it: &mut Peekable<Chars<'_>>) -> String {
    let mut out = String::new();
    while let Some(c) = it.peek().copied() {
        if !c.is_ascii_digit() {
            break;
        }
        out.push(c);
        it.next();
    }
    out
}

fn cmp_digits(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    fn page(n: usize) -> Page {
        Page {
            value: (0..n)
                .map(|i| {
                    json!({ "ListingKey": i.to_string() })
                        .as_object()
                        .cloned()
                        .unwrap()
                })
                .collect(),
            next_link: None,
            count: None,
        }
    }

    #[test]
    fn test_natural_cmp_numeric_suffix() {
        let a = "sync_batch_2024-01-01-T-00-00-00-000Z_seq_2.json";
        let b = "sync_batch_2024-01-01-T-00-00-00-000Z_seq_10.json";
        assert_eq!(natural_cmp(a, b), Ordering::Less);
        // Plain lexical order inverts them.
        assert_eq!(a.cmp(b), Ordering::Greater);
    }

    #[test]
    fn test_natural_cmp_case_and_zeros() {
        assert_eq!(natural_cmp("A2", "a10"), Ordering::Less);
        assert_eq!(natural_cmp("x007", "x7"), Ordering::Less);
        assert_eq!(natural_cmp("seq", "seq_1"), Ordering::Less);
    }

    #[test]
    fn test_batch_id_round_trip() {
        let time = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap()
            + chrono::Duration::milliseconds(42);
        let id = BatchId::from_time(time);
        assert_eq!(id.as_str(), "2024-03-05-T-07-08-09-042Z");
        assert_eq!(id.to_timestamp().unwrap(), time);
    }

    #[test]
    fn test_batch_file_from_path() {
        let file = BatchFile::from_path(PathBuf::from(
            "/data/s/Property/purge_batch_2024-03-05-T-07-08-09-042Z_seq_12.json",
        ))
        .unwrap();
        assert_eq!(file.kind, BatchKind::Purge);
        assert_eq!(file.seq, 12);
        assert_eq!(file.batch_id.as_str(), "2024-03-05-T-07-08-09-042Z");
        assert!(BatchFile::from_path(PathBuf::from("/data/notes.txt")).is_none());
    }

    #[tokio::test]
    async fn test_write_then_list_in_natural_order() {
        let dir = TempDir::new().unwrap();
        let store = BatchStore::new(dir.path(), DoneMode::Delete);
        let id = BatchId::now();
        for seq in [10, 2, 1] {
            store
                .write("src", "Property", BatchKind::Sync, &id, seq, &page(1))
                .await
                .unwrap();
        }
        store
            .write("src", "Property", BatchKind::Purge, &id, 1, &page(1))
            .await
            .unwrap();

        let listed = store.list("src", "Property", BatchKind::Sync).await.unwrap();
        let seqs: Vec<u64> = listed.iter().map(|b| b.seq).collect();
        assert_eq!(seqs, vec![1, 2, 10]);

        let read = store.read(&listed[0]).await.unwrap();
        assert_eq!(read.value.len(), 1);
    }

    #[tokio::test]
    async fn test_list_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = BatchStore::new(dir.path(), DoneMode::Delete);
        assert!(store.list("nope", "Property", BatchKind::Sync).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_temp_files_are_not_listed() {
        let dir = TempDir::new().unwrap();
        let store = BatchStore::new(dir.path(), DoneMode::Delete);
        let resource_dir = store.resource_dir("src", "Property");
        std::fs::create_dir_all(&resource_dir).unwrap();
        std::fs::write(
            resource_dir.join(".sync_batch_2024-01-01-T-00-00-00-000Z_seq_1.json.tmp"),
            b"{",
        )
        .unwrap();
        assert!(store.list("src", "Property", BatchKind::Sync).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_done_move_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = BatchStore::new(dir.path(), DoneMode::Move);
        let id = BatchId::now();
        let batch = store
            .write("src", "Media", BatchKind::Sync, &id, 1, &page(2))
            .await
            .unwrap();

        store.mark_done(&batch).await.unwrap();
        store.mark_done(&batch).await.unwrap();

        assert!(store.list("src", "Media", BatchKind::Sync).await.unwrap().is_empty());
        let done = store.resource_dir("src", "Media").join("done").join(batch.name());
        assert!(done.exists());
    }

    #[tokio::test]
    async fn test_mark_done_delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = BatchStore::new(dir.path(), DoneMode::Delete);
        let batch = store
            .write("src", "Media", BatchKind::Sync, &BatchId::now(), 1, &page(1))
            .await
            .unwrap();
        store.mark_done(&batch).await.unwrap();
        store.mark_done(&batch).await.unwrap();
        assert!(!batch.path.exists());
    }

    #[tokio::test]
    async fn test_oldest_batch_id() {
        let dir = TempDir::new().unwrap();
        let store = BatchStore::new(dir.path(), DoneMode::Delete);
        let older = BatchId::from_time(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap());
        let newer = BatchId::from_time(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        store
            .write("src", "Property", BatchKind::Sync, &newer, 1, &page(1))
            .await
            .unwrap();
        store
            .write("src", "Media", BatchKind::Sync, &older, 1, &page(1))
            .await
            .unwrap();
        let oldest = store
            .oldest_batch_id("src", &["Property", "Media"], BatchKind::Sync)
            .await
            .unwrap();
        assert_eq!(oldest, Some(older));
    }
}
