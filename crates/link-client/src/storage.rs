//! Client-local key/value storage shared by every tab of one profile.
//!
//! This is the only resource tabs share. It is never locked; coordination on
//! top of it is advisory (leader election) or eventually consistent (the
//! progress record). Every successful write publishes a [`StorageEvent`] so
//! other instances can react without waiting for their next timer tick.

use crate::error::StorageError;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;
const STORAGE_FILE: &str = "local-storage.json";

/// Key written by some instance sharing the storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
}

pub trait LocalStorage: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;
}

pub type SharedStorage = Arc<dyn LocalStorage>;

/// In-process storage. Clones share the same map and event channel, which is
/// how several simulated tabs observe each other.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    items: Mutex<HashMap<String, String>>,
    events: broadcast::Sender<StorageEvent>,
    failing: AtomicBool,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(MemoryInner {
                items: Mutex::new(HashMap::new()),
                events,
                failing: AtomicBool::new(false),
            }),
        }
    }

    /// Makes every operation fail, as a browser does with storage disabled.
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.inner.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("storage disabled".to_string()));
        }
        Ok(())
    }

    fn items(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StorageError> {
        self.inner
            .items
            .lock()
            .map_err(|_| StorageError::Unavailable("storage lock poisoned".to_string()))
    }

    fn publish(&self, key: &str) {
        let _ = self.inner.events.send(StorageEvent {
            key: key.to_string(),
        });
    }
}

impl LocalStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check()?;
        Ok(self.items()?.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check()?;
        self.items()?.insert(key.to_string(), value.to_string());
        self.publish(key);
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.check()?;
        let removed = self.items()?.remove(key).is_some();
        if removed {
            self.publish(key);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.inner.events.subscribe()
    }
}

/// Storage persisted as one JSON object in a directory, used by `linkctl`.
///
/// Events are only delivered within the process that performed the write;
/// other processes pick changes up on their next read.
pub struct FileStorage {
    path: PathBuf,
    lock: Mutex<()>,
    events: broadcast::Sender<StorageEvent>,
}

impl FileStorage {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            path: dir.join(STORAGE_FILE),
            lock: Mutex::new(()),
            events,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, StorageError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, items: &BTreeMap<String, String>) -> Result<(), StorageError> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(items)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn modify<F>(&self, key: &str, change: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut BTreeMap<String, String>) -> bool,
    {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StorageError::Unavailable("storage lock poisoned".to_string()))?;
        let mut items = self.load()?;
        if change(&mut items) {
            self.save(&items)?;
            let _ = self.events.send(StorageEvent {
                key: key.to_string(),
            });
        }
        Ok(())
    }
}

impl LocalStorage for FileStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StorageError::Unavailable("storage lock poisoned".to_string()))?;
        Ok(self.load()?.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.modify(key, |items| {
            items.insert(key.to_string(), value.to_string());
            true
        })
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.modify(key, |items| items.remove(key).is_some())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}
