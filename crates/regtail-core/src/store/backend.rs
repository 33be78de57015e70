//! Key-value persistence contract and the in-memory backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::error::StorageError;

/// Persisted low-water-mark sequence (integer).
pub const KEY_LOW_WATER_MARK: &str = "low_water_mark";
/// Known relevant packages (object of package id to last seen sequence).
pub const KEY_KNOWN_PACKAGES: &str = "known_packages";
/// In-progress catch-up blocks (array).
pub const KEY_BLOCKS: &str = "blocks";

/// Durable key-value storage used by the progress store.
///
/// Implementations are owned by the store's writer thread, so they only need
/// to be `Send`. A successful `set` must be durable.
pub trait KvBackend: Send + 'static {
    fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

    fn set(&mut self, key: &str, value: &Value) -> Result<(), StorageError>;

    fn has(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key)?.is_some())
    }

    /// Write several keys. Backends that support transactions override this
    /// so the writes land together.
    fn set_many(&mut self, entries: &[(&str, Value)]) -> Result<(), StorageError> {
        for (key, value) in entries {
            self.set(key, value)?;
        }
        Ok(())
    }
}

/// In-memory backend. Clones share the same map, which lets tests drop a
/// store and reopen a new one over the same data to simulate a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    values: Arc<Mutex<HashMap<String, Value>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Raw value for inspection.
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<Value> {
        self.values().get(key).cloned()
    }

    fn values(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.values().get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &Value) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend(format!("write to {key} rejected")));
        }
        self.values().insert(key.to_string(), value.clone());
        Ok(())
    }

    fn set_many(&mut self, entries: &[(&str, Value)]) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("batched write rejected".to_string()));
        }
        let mut values = self.values();
        for (key, value) in entries {
            values.insert((*key).to_string(), value.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clones_share_values() {
        let mut a = MemoryBackend::new();
        let b = a.clone();
        a.set(KEY_LOW_WATER_MARK, &json!(42)).unwrap();
        assert_eq!(b.get(KEY_LOW_WATER_MARK).unwrap(), Some(json!(42)));
        assert!(b.has(KEY_LOW_WATER_MARK).unwrap());
        assert!(!b.has(KEY_BLOCKS).unwrap());
    }

    #[test]
    fn failing_writes_leave_values_untouched() {
        let mut backend = MemoryBackend::new();
        backend.set(KEY_LOW_WATER_MARK, &json!(1)).unwrap();
        backend.set_fail_writes(true);
        assert!(backend.set(KEY_LOW_WATER_MARK, &json!(2)).is_err());
        assert!(
            backend
                .set_many(&[(KEY_LOW_WATER_MARK, json!(3))])
                .is_err()
        );
        assert_eq!(backend.raw(KEY_LOW_WATER_MARK), Some(json!(1)));
    }
}
