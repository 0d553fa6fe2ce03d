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

//! Object store capability used by every controller.
//!
//! Objects are JSON documents addressed by `<kind prefix>/<name>`. Updates are
//! guarded by `metadata.resourceVersion`: writing with a stale version fails
//! with [`StoreError::Conflict`] instead of clobbering a concurrent write.

use super::meta::ObjectMeta;
use crate::rollout::util::error::BoxError;
use crate::rollout::util::{Keyspace, KeyspaceEvent};

use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

const OBJECT_PARTITION: &str = "objects";

pub type StoreEvent = KeyspaceEvent;

#[derive(Debug)]
pub enum StoreError {
    NotFound(String),
    AlreadyExists(String),
    Conflict {
        key: String,
        expected: Option<String>,
        actual: Option<String>,
    },
    Io(BoxError),
    Serialization(String),
    InvalidKey(String),
    DeadlineExceeded,
}

impl StoreError {
    /// Errors worth retrying with backoff rather than reporting as a failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Conflict { .. } | StoreError::Io(_) | StoreError::DeadlineExceeded
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(key) => write!(f, "object {} not found", key),
            StoreError::AlreadyExists(key) => write!(f, "object {} already exists", key),
            StoreError::Conflict {
                key,
                expected,
                actual,
            } => write!(
                f,
                "object {} was modified concurrently (expected resourceVersion {}, found {})",
                key,
                expected.as_deref().unwrap_or("<none>"),
                actual.as_deref().unwrap_or("<none>")
            ),
            StoreError::Io(err) => write!(f, "store I/O failed: {}", err),
            StoreError::Serialization(msg) => write!(f, "object serialization failed: {}", msg),
            StoreError::InvalidKey(key) => write!(f, "invalid object key '{}'", key),
            StoreError::DeadlineExceeded => write!(f, "reconcile pass deadline exceeded"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StoreError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// A typed object kept in the store.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: &'static str;
    /// Key prefix under which objects of this kind live.
    const PREFIX: &'static str;

    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    fn name(&self) -> &str {
        &self.metadata().name
    }
}

/// Untyped create/get/update/delete/list over JSON documents.
pub trait ObjectStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    fn list(&self, prefix: &str) -> Result<Vec<Value>, StoreError>;
    /// Fails with `AlreadyExists` when the key is taken.
    fn create(&self, key: &str, object: Value) -> Result<Value, StoreError>;
    /// Replaces an existing object. A `resourceVersion` in the payload must
    /// match the stored one.
    fn update(&self, key: &str, object: Value) -> Result<Value, StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

/// [`ObjectStore`] backed by a [`Keyspace`] partition.
#[derive(Clone)]
pub struct KeyspaceStore {
    keyspace: Keyspace,
}

impl KeyspaceStore {
    pub fn new(keyspace: Keyspace) -> Self {
        Self { keyspace }
    }

    pub fn open(root: impl Into<PathBuf>, lock_file: impl Into<PathBuf>) -> Result<Self, BoxError> {
        Ok(Self::new(Keyspace::open_with_lock(
            root,
            lock_file,
            OBJECT_PARTITION,
        )?))
    }
}

fn validate_object_key(key: &str) -> Result<(), StoreError> {
    let mut segments = key.split('/');
    let valid = segments.next() == Some("")
        && segments.all(|segment| {
            !segment.is_empty()
                && segment != "."
                && segment != ".."
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        });
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

fn decode(key: &str, raw: &str) -> Result<Value, StoreError> {
    serde_json::from_str(raw).map_err(|err| StoreError::Serialization(format!("{}: {}", key, err)))
}

fn encode(key: &str, value: &Value) -> Result<String, StoreError> {
    serde_json::to_string(value)
        .map_err(|err| StoreError::Serialization(format!("{}: {}", key, err)))
}

fn metadata_string(object: &Value, field: &str) -> Option<String> {
    object
        .get("metadata")
        .and_then(|meta| meta.get(field))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn set_metadata_field(key: &str, object: &mut Value, field: &str, value: String) -> Result<(), StoreError> {
    let meta = object
        .get_mut("metadata")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| StoreError::Serialization(format!("{}: object has no metadata", key)))?;
    meta.insert(field.to_string(), Value::String(value));
    Ok(())
}

impl ObjectStore for KeyspaceStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        validate_object_key(key)?;
        match self.keyspace.get(key).map_err(StoreError::Io)? {
            Some(raw) => decode(key, &raw).map(Some),
            None => Ok(None),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<Value>, StoreError> {
        validate_object_key(prefix)?;
        self.keyspace
            .list(prefix)
            .map_err(StoreError::Io)?
            .into_iter()
            .map(|(key, raw)| decode(&key, &raw))
            .collect()
    }

    fn create(&self, key: &str, mut object: Value) -> Result<Value, StoreError> {
        validate_object_key(key)?;
        let writer = self.keyspace.write().map_err(StoreError::Io)?;
        if writer.get(key).map_err(StoreError::Io)?.is_some() {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        set_metadata_field(key, &mut object, "resourceVersion", "1".to_string())?;
        if metadata_string(&object, "creationTimestamp").is_none() {
            let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
            set_metadata_field(key, &mut object, "creationTimestamp", now)?;
        }
        writer
            .put(key, &encode(key, &object)?)
            .map_err(StoreError::Io)?;
        Ok(object)
    }

    fn update(&self, key: &str, mut object: Value) -> Result<Value, StoreError> {
        validate_object_key(key)?;
        let writer = self.keyspace.write().map_err(StoreError::Io)?;
        let current = match writer.get(key).map_err(StoreError::Io)? {
            Some(raw) => decode(key, &raw)?,
            None => return Err(StoreError::NotFound(key.to_string())),
        };
        let stored_version = metadata_string(&current, "resourceVersion");
        let requested = metadata_string(&object, "resourceVersion");
        if requested.is_some() && requested != stored_version {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                expected: requested,
                actual: stored_version,
            });
        }

        let next = stored_version
            .as_deref()
            .and_then(|version| version.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        set_metadata_field(key, &mut object, "resourceVersion", next.to_string())?;
        if let Some(created) = metadata_string(&current, "creationTimestamp") {
            set_metadata_field(key, &mut object, "creationTimestamp", created)?;
        }
        writer
            .put(key, &encode(key, &object)?)
            .map_err(StoreError::Io)?;
        Ok(object)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        validate_object_key(key)?;
        if self.keyspace.delete(key).map_err(StoreError::Io)? {
            Ok(())
        } else {
            Err(StoreError::NotFound(key.to_string()))
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.keyspace.subscribe()
    }
}

/// Typed access to an [`ObjectStore`], optionally bounded by a deadline that
/// every call checks before touching the store.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn ObjectStore>,
    deadline: Option<Instant>,
}

impl Client {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            deadline: None,
        }
    }

    /// Copy of this client whose calls fail with `DeadlineExceeded` once
    /// `deadline` has passed.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self {
            store: Arc::clone(&self.store),
            deadline: Some(deadline),
        }
    }

    fn check_deadline(&self) -> Result<(), StoreError> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(StoreError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    fn key<R: Resource>(name: &str) -> String {
        format!("{}/{}", R::PREFIX, name)
    }

    fn to_value<R: Resource>(object: &R) -> Result<Value, StoreError> {
        serde_json::to_value(object).map_err(|err| {
            StoreError::Serialization(format!("{} {}: {}", R::KIND, object.name(), err))
        })
    }

    fn from_value<R: Resource>(key: &str, value: Value) -> Result<R, StoreError> {
        serde_json::from_value(value)
            .map_err(|err| StoreError::Serialization(format!("{}: {}", key, err)))
    }

    pub fn get<R: Resource>(&self, name: &str) -> Result<Option<R>, StoreError> {
        self.check_deadline()?;
        let key = Self::key::<R>(name);
        self.store
            .get(&key)?
            .map(|value| Self::from_value(&key, value))
            .transpose()
    }

    pub fn list<R: Resource>(&self) -> Result<Vec<R>, StoreError> {
        self.check_deadline()?;
        self.store
            .list(R::PREFIX)?
            .into_iter()
            .map(|value| Self::from_value(R::PREFIX, value))
            .collect()
    }

    pub fn create<R: Resource>(&self, object: &R) -> Result<R, StoreError> {
        self.check_deadline()?;
        let key = Self::key::<R>(object.name());
        let stored = self.store.create(&key, Self::to_value(object)?)?;
        Self::from_value(&key, stored)
    }

    pub fn update<R: Resource>(&self, object: &R) -> Result<R, StoreError> {
        self.check_deadline()?;
        let key = Self::key::<R>(object.name());
        let stored = self.store.update(&key, Self::to_value(object)?)?;
        Self::from_value(&key, stored)
    }

    /// Creates the object or overwrites whatever is stored under its name.
    pub fn apply<R: Resource>(&self, object: &R) -> Result<R, StoreError> {
        match self.get::<R>(object.name())? {
            None => self.create(object),
            Some(existing) => {
                let mut replacement = object.clone();
                replacement.metadata_mut().resource_version =
                    existing.metadata().resource_version.clone();
                replacement.metadata_mut().creation_timestamp =
                    existing.metadata().creation_timestamp;
                self.update(&replacement)
            }
        }
    }

    /// Returns `false` when there was nothing to delete.
    pub fn delete<R: Resource>(&self, name: &str) -> Result<bool, StoreError> {
        self.check_deadline()?;
        match self.store.delete(&Self::key::<R>(name)) {
            Ok(()) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.subscribe()
    }
}
