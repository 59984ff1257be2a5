//! Durable record of the last connected ring
//!
//! The record lives in four fields of a key-value store. Saves and clears are a
//! single atomic batch, so a reader never observes a half-written record. Storage
//! trouble is logged and reported as `false`/`None`; it never reaches the caller
//! as an error.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::types::{DeviceAddress, Peripheral};

// ----------------------------------------------------------------------------
// Record
// ----------------------------------------------------------------------------

pub const KEY_ADDRESS: &str = "last_device_address";
pub const KEY_NAME: &str = "last_device_name";
pub const KEY_CONNECTED_AT: &str = "last_connected_time";
pub const KEY_AUTO_RECONNECT: &str = "auto_reconnect";

/// The last successfully connected ring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceRecord {
    pub address: String,
    pub name: Option<String>,
    pub last_connected_ms: u64,
    pub auto_reconnect: bool,
}

impl PersistenceRecord {
    pub fn new(peripheral: &Peripheral, last_connected_ms: u64, auto_reconnect: bool) -> Self {
        Self {
            address: peripheral.address.to_string(),
            name: peripheral.name.clone(),
            last_connected_ms,
            auto_reconnect,
        }
    }

    /// Peripheral to reconnect to, `None` for a blank address
    pub fn peripheral(&self) -> Option<Peripheral> {
        let address = DeviceAddress::parse(&self.address)?;
        Some(Peripheral::new(address, self.name.clone()))
    }

    pub fn is_valid(&self) -> bool {
        !self.address.trim().is_empty()
    }
}

// ----------------------------------------------------------------------------
// Key-Value Store
// ----------------------------------------------------------------------------

/// A value in the key-value store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

/// Durable key-value storage provided by the host
pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Result<Option<StoredValue>, StorageError>;

    /// Apply every write (`Some`) and removal (`None`) atomically
    fn write_batch(&mut self, ops: Vec<(String, Option<StoredValue>)>) -> Result<(), StorageError>;

    fn is_available(&self) -> bool {
        true
    }
}

fn apply_batch(data: &mut BTreeMap<String, StoredValue>, ops: Vec<(String, Option<StoredValue>)>) {
    for (key, value) in ops {
        match value {
            Some(value) => {
                data.insert(key, value);
            }
            None => {
                data.remove(&key);
            }
        }
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    data: BTreeMap<String, StoredValue>,
    unavailable: bool,
}

/// In-memory store; clones share the same data
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the storage handle going away
    pub fn set_available(&self, available: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.unavailable = !available;
        }
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.data.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<StoredValue>, StorageError> {
        let inner = self.inner.lock().map_err(|_| StorageError::Unavailable)?;
        if inner.unavailable {
            return Err(StorageError::Unavailable);
        }
        Ok(inner.data.get(key).cloned())
    }

    fn write_batch(&mut self, ops: Vec<(String, Option<StoredValue>)>) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().map_err(|_| StorageError::Unavailable)?;
        if inner.unavailable {
            return Err(StorageError::Unavailable);
        }
        apply_batch(&mut inner.data, ops);
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.inner.lock().map(|i| !i.unavailable).unwrap_or(false)
    }
}

/// JSON file store; every batch rewrites the file through a temp-file rename
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    data: BTreeMap<String, StoredValue>,
}

impl JsonFileStore {
    /// Open the store, starting empty when the file does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let data = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("Opened device store at {}", path.display());
        Ok(Self { path, data })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, data: &BTreeMap<String, StoredValue>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(data)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<StoredValue>, StorageError> {
        Ok(self.data.get(key).cloned())
    }

    fn write_batch(&mut self, ops: Vec<(String, Option<StoredValue>)>) -> Result<(), StorageError> {
        let mut next = self.data.clone();
        apply_batch(&mut next, ops);
        self.flush(&next)?;
        self.data = next;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Device Record Store
// ----------------------------------------------------------------------------

/// Saves, loads and clears the [`PersistenceRecord`]
pub struct DeviceRecordStore {
    backend: Option<Box<dyn KeyValueStore>>,
}

impl DeviceRecordStore {
    pub fn new(backend: Box<dyn KeyValueStore>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    /// A store with no backend; every operation fails gracefully
    pub fn unavailable() -> Self {
        Self { backend: None }
    }

    /// Write all four fields; false without writing when the address is blank
    /// or the timestamp does not fit the stored integer
    pub fn save(&mut self, record: &PersistenceRecord) -> bool {
        if !record.is_valid() {
            warn!("Refusing to persist a device record without an address");
            return false;
        }
        let Ok(connected_at) = i64::try_from(record.last_connected_ms) else {
            warn!(
                "Refusing to persist a device record with timestamp {}",
                record.last_connected_ms
            );
            return false;
        };
        let Some(backend) = self.backend.as_mut() else {
            return false;
        };

        let ops = vec![
            (
                KEY_ADDRESS.to_string(),
                Some(StoredValue::Str(record.address.clone())),
            ),
            (KEY_NAME.to_string(), record.name.clone().map(StoredValue::Str)),
            (
                KEY_CONNECTED_AT.to_string(),
                Some(StoredValue::Int(connected_at)),
            ),
            (
                KEY_AUTO_RECONNECT.to_string(),
                Some(StoredValue::Bool(record.auto_reconnect)),
            ),
        ];
        match backend.write_batch(ops) {
            Ok(()) => {
                debug!("Persisted device record for {}", record.address);
                true
            }
            Err(e) => {
                warn!("Failed to persist device record: {}", e);
                false
            }
        }
    }

    /// The stored record; `None` when no address is stored or storage fails
    pub fn load(&self) -> Option<PersistenceRecord> {
        let backend = self.backend.as_ref()?;
        let read = |key: &str| match backend.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to read {}: {}", key, e);
                None
            }
        };

        let address = match read(KEY_ADDRESS)? {
            StoredValue::Str(address) if !address.trim().is_empty() => address,
            _ => return None,
        };
        let name = match read(KEY_NAME) {
            Some(StoredValue::Str(name)) => Some(name),
            _ => None,
        };
        let last_connected_ms = match read(KEY_CONNECTED_AT) {
            Some(StoredValue::Int(ms)) => u64::try_from(ms).unwrap_or(0),
            _ => 0,
        };
        let auto_reconnect = matches!(read(KEY_AUTO_RECONNECT), Some(StoredValue::Bool(true)));

        Some(PersistenceRecord {
            address,
            name,
            last_connected_ms,
            auto_reconnect,
        })
    }

    /// Remove all four fields in one batch
    pub fn clear(&mut self) -> bool {
        let Some(backend) = self.backend.as_mut() else {
            return false;
        };
        let ops = [KEY_ADDRESS, KEY_NAME, KEY_CONNECTED_AT, KEY_AUTO_RECONNECT]
            .iter()
            .map(|key| (key.to_string(), None))
            .collect();
        match backend.write_batch(ops) {
            Ok(()) => {
                debug!("Cleared device record");
                true
            }
            Err(e) => {
                warn!("Failed to clear device record: {}", e);
                false
            }
        }
    }
}

impl std::fmt::Debug for DeviceRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRecordStore")
            .field("available", &self.backend.is_some())
            .finish()
    }
}
