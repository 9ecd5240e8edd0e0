//! Small persisted key/value state (install prompt dismissal, chat identity).
//!
//! Keys are typed: a [`StateKey<T>`] can only be read back as `T`. Values are
//! stored as JSON strings so any backing store only has to keep text.

use std::collections::BTreeMap;
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not encode state value: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("could not write state file: {0}")]
    Toml(#[from] toml::ser::Error),
}

pub struct StateKey<T> {
    pub name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StateKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self { name, _marker: PhantomData }
    }
}

pub const INSTALL_PROMPT_DISMISSED: StateKey<DateTime<Utc>> = StateKey::new("installPromptDismissed");
pub const CHAT_GUEST_ID: StateKey<String> = StateKey::new("livechat_guest_id");
pub const CHAT_SESSION_ID: StateKey<String> = StateKey::new("livechat_session_id");

pub trait StateStore: Send + Sync {
    fn get_raw(&self, key: &str) -> Option<String>;
    fn set_raw(&self, key: &str, value: String) -> Result<(), StateError>;
    fn remove(&self, key: &str) -> Result<(), StateError>;

    /// Unreadable values are treated as absent.
    fn get<T: DeserializeOwned>(&self, key: &StateKey<T>) -> Option<T>
    where
        Self: Sized,
    {
        let raw = self.get_raw(key.name)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key = key.name, error = %err, "ignoring unreadable state value");
                None
            }
        }
    }

    fn set<T: Serialize>(&self, key: &StateKey<T>, value: &T) -> Result<(), StateError>
    where
        Self: Sized,
    {
        self.set_raw(key.name, serde_json::to_string(value)?)
    }
}

impl<S: StateStore> StateStore for std::sync::Arc<S> {
    fn get_raw(&self, key: &str) -> Option<String> {
        (**self).get_raw(key)
    }
    fn set_raw(&self, key: &str, value: String) -> Result<(), StateError> {
        (**self).set_raw(key, value)
    }
    fn remove(&self, key: &str) -> Result<(), StateError> {
        (**self).remove(key)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub struct MemoryStateStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn get_raw(&self, key: &str) -> Option<String> {
        lock(&self.values).get(key).cloned()
    }

    fn set_raw(&self, key: &str, value: String) -> Result<(), StateError> {
        lock(&self.values).insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StateError> {
        lock(&self.values).remove(key);
        Ok(())
    }
}

/// A flat TOML table on disk, rewritten on every change.
pub struct FileStateStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FileStateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StateError> {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content).unwrap_or_else(|err| {
                warn!(path = %path.display(), error = %err, "state file unreadable, starting empty");
                BTreeMap::new()
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, values: Mutex::new(values) })
    }

    fn flush(&self, values: &BTreeMap<String, String>) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, toml::to_string_pretty(values)?)?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn get_raw(&self, key: &str) -> Option<String> {
        lock(&self.values).get(key).cloned()
    }

    fn set_raw(&self, key: &str, value: String) -> Result<(), StateError> {
        let mut values = lock(&self.values);
        values.insert(key.to_string(), value);
        self.flush(&values)
    }

    fn remove(&self, key: &str) -> Result<(), StateError> {
        let mut values = lock(&self.values);
        if values.remove(key).is_some() {
            self.flush(&values)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_round_trip() {
        let store = MemoryStateStore::new();
        assert!(store.get(&INSTALL_PROMPT_DISMISSED).is_none());

        let at = DateTime::parse_from_rfc3339("2024-05-10T10:00:00Z").unwrap().with_timezone(&Utc);
        store.set(&INSTALL_PROMPT_DISMISSED, &at).unwrap();
        assert_eq!(store.get(&INSTALL_PROMPT_DISMISSED), Some(at));

        store.remove(INSTALL_PROMPT_DISMISSED.name).unwrap();
        assert!(store.get(&INSTALL_PROMPT_DISMISSED).is_none());
    }

    #[test]
    fn garbage_reads_as_absent() {
        let store = MemoryStateStore::new();
        store.set_raw(INSTALL_PROMPT_DISMISSED.name, "1715335200000".into()).unwrap();
        assert!(store.get(&INSTALL_PROMPT_DISMISSED).is_none());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.toml");

        let store = FileStateStore::open(&path).unwrap();
        store.set(&CHAT_GUEST_ID, &"guest-1".to_string()).unwrap();
        drop(store);

        let reopened = FileStateStore::open(&path).unwrap();
        assert_eq!(reopened.get(&CHAT_GUEST_ID).as_deref(), Some("guest-1"));
    }
}
