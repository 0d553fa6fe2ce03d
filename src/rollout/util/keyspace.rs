/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! File-backed keyspace used as the durable object store.
//!
//! Every key maps onto a directory below the partition root holding a single
//! `_value_` file. Writes go through a temp file plus rename so a crash leaves
//! either the previous or the next value on disk, never a torn one. A shared
//! lock file serialises writers across processes; readers take the shared
//! variant of the same lock.

use crate::rollout::logger::log_warn;
use crate::rollout::util::error::{new_error, BoxError, ResultExt};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

const VALUE_FILE_NAME: &str = "_value_";
const LOCK_FILE_NAME: &str = ".lock";
const KEYSPACE_COMPONENT: &str = "keyspace";
const MAX_KEY_DEPTH: usize = 16;
const MAX_KEY_LENGTH: usize = 512;
const WATCH_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyspaceEventType {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyspaceEvent {
    #[serde(rename = "type")]
    pub event_type: KeyspaceEventType,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Per-process ordering of events within the partition.
    pub sequence: u64,
}

impl KeyspaceEvent {
    /// True when the key equals `prefix` or lives below it.
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        let prefix = prefix.trim_end_matches('/');
        prefix.is_empty()
            || self.key == prefix
            || (self.key.starts_with(prefix) && self.key[prefix.len()..].starts_with('/'))
    }
}

struct PartitionWatch {
    sender: broadcast::Sender<KeyspaceEvent>,
    version: AtomicU64,
}

impl PartitionWatch {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            sender,
            version: AtomicU64::new(0),
        }
    }

    fn publish(&self, key: String, value: Option<String>, event_type: KeyspaceEventType) {
        let event = KeyspaceEvent {
            event_type,
            key,
            value,
            sequence: self.version.fetch_add(1, Ordering::SeqCst) + 1,
        };
        let _ = self.sender.send(event);
    }
}

/// Advisory lock on the keyspace lock file. Readers take the shared variant;
/// writers take the exclusive one. The lock is released on drop.
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(path: &Path, shared: bool) -> Result<Self, BoxError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .context(|| format!("Failed to open keyspace lock '{}'", path.display()))?;
        let locked = if shared {
            file.lock_shared()
        } else {
            file.lock_exclusive()
        };
        locked.context(|| format!("Failed to lock keyspace '{}'", path.display()))?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

struct KeyspaceInner {
    partition: String,
    partition_root: PathBuf,
    lock_path: PathBuf,
    watch: PartitionWatch,
}

/// Handle onto one partition of an on-disk keyspace. Clones share the same
/// event fan-out, so a process should open each partition once and clone the
/// handle.
#[derive(Clone)]
pub struct Keyspace {
    inner: Arc<KeyspaceInner>,
}

impl Keyspace {
    /// Opens (creating if needed) `partition` below `root` and runs a repair
    /// pass that discards leftovers of interrupted writes.
    pub fn open(root: impl Into<PathBuf>, partition: &str) -> Result<Self, BoxError> {
        let root = root.into();
        let lock_path = root.join(LOCK_FILE_NAME);
        Self::open_with_lock(root, lock_path, partition)
    }

    /// Like [`Keyspace::open`] but with the lock file placed at `lock_path`,
    /// which lets several roots share one writer lock.
    pub fn open_with_lock(
        root: impl Into<PathBuf>,
        lock_path: impl Into<PathBuf>,
        partition: &str,
    ) -> Result<Self, BoxError> {
        if !is_valid_segment(partition) {
            return Err(new_error(format!(
                "Keyspace partition \"{}\" must be a single alphanumeric segment",
                partition
            )));
        }

        let root = root.into();
        let lock_path = lock_path.into();
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).context(|| {
                format!("Failed to prepare keyspace lock directory '{}'", parent.display())
            })?;
        }
        let partition_root = root.join(partition);
        fs::create_dir_all(&partition_root).context(|| {
            format!(
                "Failed to prepare keyspace partition '{}'",
                partition_root.display()
            )
        })?;

        let keyspace = Keyspace {
            inner: Arc::new(KeyspaceInner {
                partition: partition.to_string(),
                partition_root,
                lock_path,
                watch: PartitionWatch::new(),
            }),
        };

        {
            let _lock = FileLock::acquire(&keyspace.inner.lock_path, false)?;
            repair_directory(
                &keyspace.inner.partition,
                &keyspace.inner.partition_root,
                true,
            )?;
        }

        Ok(keyspace)
    }

    pub fn partition(&self) -> &str {
        &self.inner.partition
    }

    /// Subscribes to every change in the partition. Slow receivers observe
    /// `RecvError::Lagged` and should resync from a full listing.
    pub fn subscribe(&self) -> broadcast::Receiver<KeyspaceEvent> {
        self.inner.watch.sender.subscribe()
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, BoxError> {
        let key_path = self.resolve(key)?;
        let _lock = FileLock::acquire(&self.inner.lock_path, true)?;
        read_value_if_exists(&key_path)
    }

    /// Lists every `(key, value)` pair stored at or below `prefix`, sorted by key.
    pub fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, BoxError> {
        let base = self.resolve(prefix)?;
        let _lock = FileLock::acquire(&self.inner.lock_path, true)?;
        self.collect_entries(&base)
    }

    pub fn put(&self, key: &str, value: &str) -> Result<(), BoxError> {
        self.write()?.put(key, value)
    }

    /// Removes `key`, returning `false` when nothing was stored there.
    pub fn delete(&self, key: &str) -> Result<bool, BoxError> {
        self.write()?.delete(key)
    }

    /// Takes the exclusive lock so a read-check-write sequence cannot
    /// interleave with another writer.
    pub fn write(&self) -> Result<KeyspaceWriter<'_>, BoxError> {
        let lock = FileLock::acquire(&self.inner.lock_path, false)?;
        Ok(KeyspaceWriter {
            keyspace: self,
            _lock: lock,
        })
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, BoxError> {
        validate_key(key)?;
        if key == "/" {
            Ok(self.inner.partition_root.clone())
        } else {
            Ok(self.inner.partition_root.join(&key[1..]))
        }
    }

    fn key_for(&self, path: &Path) -> Result<String, BoxError> {
        path.strip_prefix(&self.inner.partition_root)
            .map(|relative| format!("/{}", relative.to_string_lossy()))
            .map_err(|_| {
                new_error(format!(
                    "Path {} is not part of keyspace partition {}",
                    path.display(),
                    self.inner.partition
                ))
            })
    }

    fn collect_entries(&self, base: &Path) -> Result<Vec<(String, String)>, BoxError> {
        let mut entries = Vec::new();
        let mut pending = vec![base.to_path_buf()];
        while let Some(dir) = pending.pop() {
            if let Some(value) = read_value_if_exists(&dir)? {
                entries.push((self.key_for(&dir)?, value));
            }
            let read_dir = match fs::read_dir(&dir) {
                Ok(read_dir) => read_dir,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err)
                        .context(|| format!("Failed to read keyspace directory '{}'", dir.display()))
                }
            };
            for entry in read_dir {
                let entry = entry.context(|| {
                    format!("Failed to iterate keyspace directory '{}'", dir.display())
                })?;
                if entry.path().is_dir() {
                    pending.push(entry.path());
                }
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

/// Exclusive write session. Events are published as soon as each write lands.
pub struct KeyspaceWriter<'a> {
    keyspace: &'a Keyspace,
    _lock: FileLock,
}

impl KeyspaceWriter<'_> {
    pub fn get(&self, key: &str) -> Result<Option<String>, BoxError> {
        read_value_if_exists(&self.keyspace.resolve(key)?)
    }

    pub fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, BoxError> {
        let base = self.keyspace.resolve(prefix)?;
        self.keyspace.collect_entries(&base)
    }

    pub fn put(&self, key: &str, value: &str) -> Result<(), BoxError> {
        let key_path = self.keyspace.resolve(key)?;
        let existed = key_path.join(VALUE_FILE_NAME).exists();
        fs::create_dir_all(&key_path)
            .context(|| format!("Failed to create directories for '{}'", key_path.display()))?;
        persist_atomically(&key_path.join(VALUE_FILE_NAME), value.as_bytes())?;
        self.keyspace.inner.watch.publish(
            key.to_string(),
            Some(value.to_string()),
            if existed {
                KeyspaceEventType::Modified
            } else {
                KeyspaceEventType::Added
            },
        );
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<bool, BoxError> {
        let key_path = self.keyspace.resolve(key)?;
        let value_file = key_path.join(VALUE_FILE_NAME);
        match fs::remove_file(&value_file) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => {
                return Err(err).context(|| {
                    format!("Failed to remove value file '{}'", value_file.display())
                })
            }
        }
        sync_parent(&value_file)?;
        cleanup_empty_dirs(&self.keyspace.inner.partition_root, &key_path);
        self.keyspace
            .inner
            .watch
            .publish(key.to_string(), None, KeyspaceEventType::Deleted);
        Ok(true)
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

fn validate_key(key: &str) -> Result<(), BoxError> {
    if key.is_empty() {
        return Err(new_error("Key path is empty"));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(new_error(format!(
            "Key path \"{}\" exceeds max length of {} characters",
            key, MAX_KEY_LENGTH
        )));
    }
    if !key.starts_with('/') {
        return Err(new_error(format!("Key path \"{}\" must start with '/'", key)));
    }
    if key == "/" {
        return Ok(());
    }

    let segments: Vec<&str> = key.split('/').skip(1).collect();
    if !segments.iter().all(|segment| is_valid_segment(segment)) {
        return Err(new_error(format!(
            "Key path \"{}\" must contain only alphanumeric, '.', '-' or '_' segments",
            key
        )));
    }
    if segments.len() > MAX_KEY_DEPTH {
        return Err(new_error(format!(
            "Key path \"{}\" exceeds max depth of {} segments",
            key, MAX_KEY_DEPTH
        )));
    }
    Ok(())
}

fn read_value_if_exists(key_path: &Path) -> Result<Option<String>, BoxError> {
    let value_file = key_path.join(VALUE_FILE_NAME);
    match fs::read_to_string(&value_file) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).context(|| format!("Failed to read value file '{}'", value_file.display()))
        }
    }
}

fn cleanup_empty_dirs(partition_root: &Path, key_path: &Path) {
    let mut dir = key_path.to_path_buf();
    while dir != partition_root && dir.starts_with(partition_root) {
        if fs::remove_dir(&dir).is_err() {
            break;
        }
        match dir.parent() {
            Some(parent) => dir = parent.to_path_buf(),
            None => break,
        }
    }
}

/// Removes orphaned temp files and directories that lost their value file.
/// Returns `true` when `dir` itself was removed.
fn repair_directory(partition: &str, dir: &Path, is_root: bool) -> Result<bool, BoxError> {
    let read_dir = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(true),
        Err(err) => {
            return Err(err)
                .context(|| format!("Failed to read keyspace directory '{}'", dir.display()))
        }
    };

    let mut retained = false;
    for entry in read_dir {
        let entry = entry
            .context(|| format!("Failed to iterate keyspace directory '{}'", dir.display()))?;
        let path = entry.path();
        if path.is_dir() {
            if !repair_directory(partition, &path, false)? {
                retained = true;
            }
            continue;
        }

        let name = entry.file_name();
        if name.to_string_lossy().ends_with(".tmp") {
            fs::remove_file(&path)
                .context(|| format!("Failed to remove orphaned file '{}'", path.display()))?;
            let path_str = path.display().to_string();
            log_warn(
                KEYSPACE_COMPONENT,
                "Removed orphaned keyspace temp file",
                &[("partition", partition), ("path", &path_str)],
            );
            continue;
        }
        retained = true;
    }

    if retained || is_root {
        return Ok(false);
    }

    fs::remove_dir(dir)
        .context(|| format!("Failed to remove empty directory '{}'", dir.display()))?;
    Ok(true)
}

fn persist_atomically(target: &Path, data: &[u8]) -> Result<(), BoxError> {
    let tmp_path = target.with_extension("tmp");
    let mut guard = TempFileGuard {
        path: tmp_path.clone(),
        keep: false,
    };

    let mut tmp = File::create(&tmp_path)
        .context(|| format!("Failed to create temporary file '{}'", tmp_path.display()))?;
    tmp.write_all(data)
        .context(|| format!("Failed to write temporary file '{}'", tmp_path.display()))?;
    tmp.sync_all()
        .context(|| format!("Failed to sync temporary file '{}'", tmp_path.display()))?;
    drop(tmp);

    fs::rename(&tmp_path, target)
        .context(|| format!("Failed to replace file '{}'", target.display()))?;
    guard.keep = true;

    sync_parent(target)
}

fn sync_parent(path: &Path) -> Result<(), BoxError> {
    if let Some(dir) = path.parent() {
        let dir_file =
            File::open(dir).context(|| format!("Failed to open directory '{}'", dir.display()))?;
        dir_file
            .sync_all()
            .context(|| format!("Failed to sync directory '{}'", dir.display()))?;
    }
    Ok(())
}

struct TempFileGuard {
    path: PathBuf,
    keep: bool,
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp(partition: &str) -> (tempfile::TempDir, Keyspace) {
        let dir = tempfile::tempdir().expect("tempdir");
        let keyspace = Keyspace::open(dir.path(), partition).expect("open keyspace");
        (dir, keyspace)
    }

    #[test]
    fn put_get_delete_round_trip() {
        let (_dir, keyspace) = open_temp("objects");
        keyspace.put("/configmaps/config", "{}").expect("put");
        assert_eq!(
            keyspace.get("/configmaps/config").expect("get").as_deref(),
            Some("{}")
        );
        assert!(keyspace.delete("/configmaps/config").expect("delete"));
        assert!(!keyspace.delete("/configmaps/config").expect("second delete"));
        assert_eq!(keyspace.get("/configmaps/config").expect("get"), None);
    }

    #[test]
    fn list_returns_nested_keys_sorted() {
        let (_dir, keyspace) = open_temp("objects");
        keyspace.put("/secrets/b", "2").expect("put b");
        keyspace.put("/secrets/a", "1").expect("put a");
        keyspace.put("/nodes/master-0", "n").expect("put node");

        let secrets = keyspace.list("/secrets").expect("list");
        let keys: Vec<&str> = secrets.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, vec!["/secrets/a", "/secrets/b"]);
        assert!(keyspace.list("/missing").expect("list missing").is_empty());
    }

    #[test]
    fn rejects_traversal_and_invalid_segments() {
        let (_dir, keyspace) = open_temp("objects");
        assert!(keyspace.put("/a/../b", "x").is_err());
        assert!(keyspace.put("relative", "x").is_err());
        assert!(keyspace.put("/with space", "x").is_err());
        assert!(keyspace.put("/a//b", "x").is_err());
    }

    #[test]
    fn open_removes_orphaned_temp_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key_dir = dir.path().join("objects").join("configmaps").join("broken");
        fs::create_dir_all(&key_dir).expect("mkdir");
        fs::write(key_dir.join("_value_.tmp"), b"partial").expect("write tmp");

        let keyspace = Keyspace::open(dir.path(), "objects").expect("open");
        assert!(!key_dir.exists());
        assert_eq!(keyspace.get("/configmaps/broken").expect("get"), None);
    }

    #[test]
    fn subscribers_see_added_modified_deleted() {
        let (_dir, keyspace) = open_temp("objects");
        let mut events = keyspace.subscribe();

        keyspace.put("/nodes/a", "1").expect("put");
        keyspace.put("/nodes/a", "2").expect("update");
        keyspace.delete("/nodes/a").expect("delete");
        keyspace.delete("/nodes/a").expect("delete missing");

        let added = events.try_recv().expect("added");
        assert_eq!(added.event_type, KeyspaceEventType::Added);
        assert!(added.matches_prefix("/nodes"));
        assert!(!added.matches_prefix("/configmaps"));
        let modified = events.try_recv().expect("modified");
        assert_eq!(modified.event_type, KeyspaceEventType::Modified);
        assert!(modified.sequence > added.sequence);
        let deleted = events.try_recv().expect("deleted");
        assert_eq!(deleted.event_type, KeyspaceEventType::Deleted);
        assert_eq!(deleted.value, None);
        assert!(events.try_recv().is_err());
    }
}
