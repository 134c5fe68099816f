//! Crash-safe JSON document store.
//!
//! Every document lives at `<root>/<key>.json`. Writes go to a uniquely named
//! temp file in the same directory, are fsynced and size-checked, and only
//! then renamed over the current file, so a reader sees either the old or the
//! new content and never a mix. A parsable current file is preserved as
//! `<key>.json.bak` first; older generations shift to `<key>.json.bak.2` and
//! so on up to the configured retention.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::error::StoreError;

/// A schema-flexible record. `serde_json::Map` keeps keys sorted, so the
/// on-disk form is stable and diffable regardless of insertion order.
pub type Document = serde_json::Map<String, Value>;

const CURRENT_EXT: &str = ".json";
const BACKUP_EXT: &str = ".json.bak";
const TEMP_MARKER: &str = ".json.tmp-";

pub struct DocumentStore {
    root: PathBuf,
    backup_retention: usize,
    write_retries: u32,
    retry_backoff: Duration,
}

impl DocumentStore {
    /// Open (or create) the storage root and sweep temp files left behind
    /// by an interrupted write.
    pub async fn open(config: &StorageConfig) -> Result<Self, StoreError> {
        let io_err = |source| StoreError::Io {
            key: config.root.display().to_string(),
            attempts: 1,
            source,
        };
        tokio::fs::create_dir_all(&config.root).await.map_err(io_err)?;

        let store = Self {
            root: config.root.clone(),
            backup_retention: config.backup_retention.max(1),
            write_retries: config.write_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        };

        let swept = store.sweep_temp_files().await.map_err(io_err)?;
        info!(root = %store.root.display(), swept, "document store opened");
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn current_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}{CURRENT_EXT}"))
    }

    /// Path of backup generation `generation` (1 = most recent).
    pub fn backup_path(&self, key: &str, generation: usize) -> PathBuf {
        if generation <= 1 {
            self.root.join(format!("{key}{BACKUP_EXT}"))
        } else {
            self.root.join(format!("{key}{BACKUP_EXT}.{generation}"))
        }
    }

    /// Read the current document, falling back to backups newest first.
    /// Returns `Ok(None)` when nothing usable exists.
    pub async fn read(&self, key: &str) -> Result<Option<Document>, StoreError> {
        validate_key(key)?;

        let candidates = std::iter::once(self.current_path(key))
            .chain((1..=self.backup_retention).map(|g| self.backup_path(key, g)));

        for (idx, path) in candidates.enumerate() {
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(key, path = %path.display(), error = %e, "failed to read document file");
                    continue;
                }
            };
            match parse_document(&bytes) {
                Ok(doc) => {
                    if idx > 0 {
                        warn!(key, generation = idx, "recovered document from backup");
                    }
                    return Ok(Some(doc));
                }
                Err(reason) => {
                    warn!(key, path = %path.display(), %reason, "unusable document file")
                }
            }
        }

        debug!(key, "no stored document");
        Ok(None)
    }

    /// Atomically replace the document at `key`. Transient I/O failures are
    /// retried with jittered backoff; on `Err` the prior version is intact.
    pub async fn write(&self, key: &str, doc: &Document) -> Result<(), StoreError> {
        validate_key(key)?;
        let bytes = serde_json::to_vec_pretty(doc)?;
        let current = self.current_path(key);

        let mut backed_up = false;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.write_once(key, &current, &bytes, &mut backed_up).await {
                Ok(()) => {
                    debug!(key, bytes = bytes.len(), attempt, "document written");
                    return Ok(());
                }
                Err(e) if attempt <= self.write_retries && is_transient(&e) => {
                    let delay = self.backoff(attempt);
                    warn!(key, attempt, error = %e, ?delay, "document write failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(source) => {
                    return Err(StoreError::Io {
                        key: key.to_string(),
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }

    /// Delete a document and all its backups.
    pub async fn remove(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        let paths = std::iter::once(self.current_path(key))
            .chain((1..=self.backup_retention).map(|g| self.backup_path(key, g)));
        for path in paths {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(StoreError::Io {
                        key: key.to_string(),
                        attempts: 1,
                        source,
                    })
                }
            }
        }
        Ok(())
    }

    /// List stored keys under `namespace` (keys of the form `namespace.<id>`),
    /// including documents that currently only survive as a backup.
    pub async fn keys(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        let prefix = format!("{namespace}.");
        let io_err = |source| StoreError::Io {
            key: namespace.to_string(),
            attempts: 1,
            source,
        };

        let mut found = BTreeSet::new();
        let mut dir = tokio::fs::read_dir(&self.root).await.map_err(io_err)?;
        while let Some(entry) = dir.next_entry().await.map_err(io_err)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.contains(TEMP_MARKER) {
                continue;
            }
            let key = name
                .strip_suffix(CURRENT_EXT)
                .or_else(|| name.strip_suffix(BACKUP_EXT))
                .or_else(|| {
                    let (head, generation) = name.rsplit_once('.')?;
                    generation.parse::<usize>().ok()?;
                    head.strip_suffix(BACKUP_EXT)
                });
            if let Some(key) = key {
                if key.starts_with(&prefix) && validate_key(key).is_ok() {
                    found.insert(key.to_string());
                }
            }
        }
        Ok(found.into_iter().collect())
    }

    /// One attempt: stage the bytes, back up the current file the first
    /// time through, then rename over it.
    async fn write_once(
        &self,
        key: &str,
        current: &Path,
        bytes: &[u8],
        backed_up: &mut bool,
    ) -> std::io::Result<()> {
        let staged = self.stage(key, bytes).await?;
        if !*backed_up {
            self.snapshot(key, current).await;
            *backed_up = true;
        }
        staged.commit(current).await?;

        // Persist the rename itself. Not every platform lets a directory be
        // opened for syncing, so this stays best-effort.
        if let Ok(dir) = tokio::fs::File::open(&self.root).await {
            let _ = dir.sync_all().await;
        }
        Ok(())
    }

    /// Write `bytes` to a fresh temp file next to the document, fsynced and
    /// size-checked. The file is removed unless it is committed.
    async fn stage(&self, key: &str, bytes: &[u8]) -> std::io::Result<TempFileGuard> {
        tokio::fs::create_dir_all(&self.root).await?;

        let tmp = format!("{key}{TEMP_MARKER}{}", Uuid::new_v4().simple());
        let guard = TempFileGuard::new(self.root.join(tmp));
        let mut file = tokio::fs::File::create(&guard.path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let written = tokio::fs::metadata(&guard.path).await?.len();
        if written != bytes.len() as u64 {
            return Err(std::io::Error::new(
                ErrorKind::WriteZero,
                format!("short write: {written} of {} bytes", bytes.len()),
            ));
        }
        Ok(guard)
    }

    /// Preserve the current file as backup generation 1, shifting older
    /// generations down. A current file that does not parse is left out so
    /// it can never push the last good version out of the backups. Failures
    /// are logged and never block the write.
    async fn snapshot(&self, key: &str, current: &Path) {
        let bytes = match tokio::fs::read(current).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return,
            Err(e) => {
                warn!(key, error = %e, "cannot read current document, skipping backup");
                return;
            }
        };
        if let Err(reason) = parse_document(&bytes) {
            warn!(key, %reason, "current document is unusable, keeping existing backups");
            return;
        }

        for generation in (1..self.backup_retention).rev() {
            let from = self.backup_path(key, generation);
            let to = self.backup_path(key, generation + 1);
            match tokio::fs::rename(&from, &to).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(key, generation, error = %e, "failed to rotate backup"),
            }
        }

        let backup = self.backup_path(key, 1);
        let copied = match self.stage(key, &bytes).await {
            Ok(staged) => staged.commit(&backup).await,
            Err(e) => Err(e),
        };
        if let Err(e) = copied {
            warn!(key, error = %e, "failed to snapshot document before replace");
        }
    }

    async fn sweep_temp_files(&self) -> std::io::Result<usize> {
        let mut swept = 0;
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let is_temp = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.contains(TEMP_MARKER));
            if is_temp {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => swept += 1,
                    Err(e) => {
                        let path = entry.path();
                        warn!(path = %path.display(), error = %e, "failed to sweep temp file");
                    }
                }
            }
        }
        Ok(swept)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.retry_backoff.saturating_mul(1 << (attempt - 1).min(6));
        let jitter_ms = self.retry_backoff.as_millis() as u64 / 2;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        base + Duration::from_millis(jitter)
    }
}

/// Keys become file names, so only a conservative character set is allowed.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && key.len() <= 200
        && !key.starts_with('.')
        && !key.contains(TEMP_MARKER)
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

/// Build a document key from a namespace and an id, e.g. `notes.1234`.
pub fn doc_key(namespace: &str, id: impl std::fmt::Display) -> String {
    format!("{namespace}.{id}")
}

fn is_transient(e: &std::io::Error) -> bool {
    !matches!(
        e.kind(),
        ErrorKind::PermissionDenied | ErrorKind::InvalidInput | ErrorKind::Unsupported
    )
}

/// Parse a stored file. Whitespace-only files, non-objects and invalid JSON
/// are all unusable.
fn parse_document(bytes: &[u8]) -> Result<Document, String> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err("empty file".to_string());
    }
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(doc)) => Ok(doc),
        Ok(_) => Err("not a JSON object".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

/// Removes the temp file on drop unless it was committed, covering error
/// returns and cancellation of the writing task alike.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// Atomically rename the staged file to `dest`.
    async fn commit(mut self, dest: &Path) -> std::io::Result<()> {
        tokio::fs::rename(&self.path, dest).await?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove temp file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn config(root: &Path, retention: usize) -> StorageConfig {
        StorageConfig {
            root: root.to_path_buf(),
            backup_retention: retention,
            write_retries: 2,
            retry_backoff_ms: 1,
        }
    }

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("test document must be an object"),
        }
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let store = DocumentStore::open(&config(dir.path(), 1)).await.unwrap();

        let d = doc(json!({
            "points": 10,
            "name": "nyx",
            "flags": [true, false, null],
            "nested": {"a": 1.5, "b": "x"}
        }));
        store.write("notes.1", &d).await.unwrap();
        assert_eq!(store.read("notes.1").await.unwrap(), Some(d));
    }

    #[tokio::test]
    async fn test_missing_is_none() {
        let dir = tempdir().unwrap();
        let store = DocumentStore::open(&config(dir.path(), 1)).await.unwrap();
        assert_eq!(store.read("notes.nobody").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_backup_holds_previous_version() {
        let dir = tempdir().unwrap();
        let store = DocumentStore::open(&config(dir.path(), 1)).await.unwrap();

        store.write("notes.1", &doc(json!({"v": 1}))).await.unwrap();
        store.write("notes.1", &doc(json!({"v": 2}))).await.unwrap();

        let backup = std::fs::read(store.backup_path("notes.1", 1)).unwrap();
        let backup: Value = serde_json::from_slice(&backup).unwrap();
        assert_eq!(backup, json!({"v": 1}));
    }

    #[tokio::test]
    async fn test_corrupt_current_falls_back_to_backup() {
        let dir = tempdir().unwrap();
        let store = DocumentStore::open(&config(dir.path(), 1)).await.unwrap();

        store.write("notes.1", &doc(json!({"v": 1}))).await.unwrap();
        store.write("notes.1", &doc(json!({"v": 2}))).await.unwrap();
        std::fs::write(store.current_path("notes.1"), b"{\"v\": 3, \"tor").unwrap();

        assert_eq!(store.read("notes.1").await.unwrap(), Some(doc(json!({"v": 1}))));
    }

    #[tokio::test]
    async fn test_both_unusable_is_none() {
        let dir = tempdir().unwrap();
        let store = DocumentStore::open(&config(dir.path(), 1)).await.unwrap();

        std::fs::write(store.current_path("notes.1"), b"   ").unwrap();
        std::fs::write(store.backup_path("notes.1", 1), b"[1, 2]").unwrap();
        assert_eq!(store.read("notes.1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_crash_before_rename_keeps_old_version() {
        let dir = tempdir().unwrap();
        let store = DocumentStore::open(&config(dir.path(), 1)).await.unwrap();
        store.write("notes.1", &doc(json!({"points": 10}))).await.unwrap();

        // A crash between temp write and rename leaves only a partial temp file.
        let tmp = dir.path().join(format!("notes.1{TEMP_MARKER}deadbeef"));
        std::fs::write(&tmp, b"{\"points\": 99").unwrap();

        assert_eq!(store.read("notes.1").await.unwrap(), Some(doc(json!({"points": 10}))));

        // Reopening sweeps the leftover.
        let reopened = DocumentStore::open(&config(dir.path(), 1)).await.unwrap();
        assert!(!tmp.exists());
        assert_eq!(reopened.read("notes.1").await.unwrap(), Some(doc(json!({"points": 10}))));
    }

    #[tokio::test]
    async fn test_backup_generations_rotate() {
        let dir = tempdir().unwrap();
        let store = DocumentStore::open(&config(dir.path(), 3)).await.unwrap();
        for v in 1..=4 {
            store.write("game.7", &doc(json!({"v": v}))).await.unwrap();
        }

        let read_gen = |g| -> Value {
            serde_json::from_slice(&std::fs::read(store.backup_path("game.7", g)).unwrap()).unwrap()
        };
        assert_eq!(read_gen(1), json!({"v": 3}));
        assert_eq!(read_gen(2), json!({"v": 2}));
        assert_eq!(read_gen(3), json!({"v": 1}));

        // Newest usable generation wins when current and gen 1 are broken.
        std::fs::write(store.current_path("game.7"), b"garbage").unwrap();
        std::fs::write(store.backup_path("game.7", 1), b"").unwrap();
        assert_eq!(store.read("game.7").await.unwrap(), Some(doc(json!({"v": 2}))));
    }

    #[tokio::test]
    async fn test_torn_current_never_overwrites_backup() {
        let dir = tempdir().unwrap();
        let store = DocumentStore::open(&config(dir.path(), 1)).await.unwrap();
        store.write("notes.1", &doc(json!({"points": 10}))).await.unwrap();
        store.write("notes.1", &doc(json!({"points": 15}))).await.unwrap();
        let current = store.current_path("notes.1");
        std::fs::write(&current, b"{\"points\": 1").unwrap();

        // The backup step of the next write runs, then the process dies
        // before the rename.
        store.snapshot("notes.1", &current).await;
        assert_eq!(
            store.read("notes.1").await.unwrap(),
            Some(doc(json!({"points": 10})))
        );

        store.write("notes.1", &doc(json!({"points": 16}))).await.unwrap();
        assert_eq!(
            store.read("notes.1").await.unwrap(),
            Some(doc(json!({"points": 16})))
        );
        let backup = std::fs::read(store.backup_path("notes.1", 1)).unwrap();
        let backup: Value = serde_json::from_slice(&backup).unwrap();
        assert_eq!(backup, json!({"points": 10}));
    }

    #[tokio::test]
    async fn test_failed_backup_does_not_block_write() {
        let dir = tempdir().unwrap();
        let store = DocumentStore::open(&config(dir.path(), 1)).await.unwrap();
        store.write("notes.1", &doc(json!({"v": 1}))).await.unwrap();

        // A directory squatting on the backup name makes the snapshot fail.
        let squat = store.backup_path("notes.1", 1);
        std::fs::create_dir(&squat).unwrap();
        std::fs::write(squat.join("keep"), b"x").unwrap();

        store.write("notes.1", &doc(json!({"v": 2}))).await.unwrap();
        assert_eq!(store.read("notes.1").await.unwrap(), Some(doc(json!({"v": 2}))));
        assert!(squat.is_dir());
    }

    #[tokio::test]
    async fn test_persistent_failure_is_bounded_and_keeps_prior_state() {
        let dir = tempdir().unwrap();
        let store = DocumentStore::open(&config(dir.path(), 1)).await.unwrap();
        store.write("notes.1", &doc(json!({"v": 1}))).await.unwrap();
        store.write("notes.1", &doc(json!({"v": 2}))).await.unwrap();

        // Every rename onto a directory fails.
        let current = store.current_path("notes.1");
        std::fs::remove_file(&current).unwrap();
        std::fs::create_dir(&current).unwrap();
        std::fs::write(current.join("keep"), b"x").unwrap();
        let before = store.read("notes.1").await.unwrap();
        assert_eq!(before, Some(doc(json!({"v": 1}))));

        let err = store
            .write("notes.1", &doc(json!({"v": 3})))
            .await
            .unwrap_err();
        match err {
            StoreError::Io { key, attempts, .. } => {
                assert_eq!(key, "notes.1");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.read("notes.1").await.unwrap(), before);

        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(TEMP_MARKER))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let dir = tempdir().unwrap();
        let store = DocumentStore::open(&StorageConfig {
            write_retries: 3,
            retry_backoff_ms: 300,
            ..config(dir.path(), 1)
        })
        .await
        .unwrap();

        let current = store.current_path("notes.1");
        std::fs::create_dir(&current).unwrap();
        let clear = {
            let current = current.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                std::fs::remove_dir(&current).unwrap();
            })
        };

        store.write("notes.1", &doc(json!({"v": 1}))).await.unwrap();
        clear.await.unwrap();
        assert_eq!(store.read("notes.1").await.unwrap(), Some(doc(json!({"v": 1}))));
    }

    #[tokio::test]
    async fn test_retries_rotate_backups_once() {
        let dir = tempdir().unwrap();
        let store = DocumentStore::open(&StorageConfig {
            write_retries: 3,
            retry_backoff_ms: 300,
            ..config(dir.path(), 3)
        })
        .await
        .unwrap();
        for v in 1..=3 {
            store.write("game.7", &doc(json!({"v": v}))).await.unwrap();
        }

        // Fail the first rename attempts of the next write.
        let current = store.current_path("game.7");
        std::fs::remove_file(&current).unwrap();
        std::fs::create_dir(&current).unwrap();
        let clear = {
            let current = current.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                std::fs::remove_dir(&current).unwrap();
            })
        };

        store.write("game.7", &doc(json!({"v": 4}))).await.unwrap();
        clear.await.unwrap();

        let read_gen = |g| -> Value {
            serde_json::from_slice(&std::fs::read(store.backup_path("game.7", g)).unwrap())
                .unwrap()
        };
        assert_eq!(read_gen(1), json!({"v": 2}));
        assert_eq!(read_gen(2), json!({"v": 1}));
    }

    #[tokio::test]
    async fn test_no_temp_files_left_after_writes() {
        let dir = tempdir().unwrap();
        let store = DocumentStore::open(&config(dir.path(), 1)).await.unwrap();
        for v in 0..5 {
            store.write("notes.1", &doc(json!({"v": v}))).await.unwrap();
        }
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(TEMP_MARKER))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_concurrent_writes_never_tear() {
        let dir = tempdir().unwrap();
        let store = Arc::new(DocumentStore::open(&config(dir.path(), 1)).await.unwrap());

        let writers: Vec<Document> = (0..16)
            .map(|i| doc(json!({"writer": i, "payload": "x".repeat(4096 + i * 97)})))
            .collect();

        let mut handles = Vec::new();
        for d in writers.clone() {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.write("race.1", &d).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let raw = std::fs::read(store.current_path("race.1")).unwrap();
        let parsed: Value = serde_json::from_slice(&raw).unwrap();
        let Value::Object(final_doc) = parsed else {
            panic!("current file is not an object")
        };
        assert!(writers.contains(&final_doc));
    }

    #[tokio::test]
    async fn test_keys_by_namespace() {
        let dir = tempdir().unwrap();
        let store = DocumentStore::open(&config(dir.path(), 1)).await.unwrap();
        store.write("notes.2", &doc(json!({}))).await.unwrap();
        store.write("notes.1", &doc(json!({}))).await.unwrap();
        store.write("notes.1", &doc(json!({"v": 1}))).await.unwrap();
        store.write("game.1", &doc(json!({}))).await.unwrap();

        assert_eq!(store.keys("notes").await.unwrap(), vec!["notes.1", "notes.2"]);
        assert_eq!(store.keys("game").await.unwrap(), vec!["game.1"]);
    }

    #[tokio::test]
    async fn test_remove_deletes_backups() {
        let dir = tempdir().unwrap();
        let store = DocumentStore::open(&config(dir.path(), 2)).await.unwrap();
        store.write("notes.1", &doc(json!({"v": 1}))).await.unwrap();
        store.write("notes.1", &doc(json!({"v": 2}))).await.unwrap();

        store.remove("notes.1").await.unwrap();
        assert_eq!(store.read("notes.1").await.unwrap(), None);
        assert!(store.keys("notes").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_keys_rejected() {
        let dir = tempdir().unwrap();
        let store = DocumentStore::open(&config(dir.path(), 1)).await.unwrap();
        for bad in ["", "../etc/passwd", ".hidden", "a/b", "sp ace"] {
            assert!(matches!(
                store.write(bad, &Document::new()).await,
                Err(StoreError::InvalidKey(_))
            ));
        }
        assert_eq!(doc_key("notes", 42), "notes.42");
        assert!(validate_key(&doc_key("notes", 42)).is_ok());
    }

    #[test]
    fn test_on_disk_form_is_sorted_and_pretty() {
        let mut d = Document::new();
        d.insert("zeta".into(), json!(1));
        d.insert("alpha".into(), json!(2));
        let text = String::from_utf8(serde_json::to_vec_pretty(&d).unwrap()).unwrap();
        assert!(text.find("alpha").unwrap() < text.find("zeta").unwrap());
        assert!(text.contains('\n'));
    }
}
