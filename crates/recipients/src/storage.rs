use crate::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put(String, String),
    Del(String),
}

pub trait StorageAdapter: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: String) -> Result<()>;
    fn del(&self, key: &str) -> Result<()>;
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Applies `ops` in order. Adapters that can do so apply the batch atomically.
    fn write_batch(&self, ops: Vec<WriteOp>) -> Result<()> {
        for op in ops {
            match op {
                WriteOp::Put(key, value) => self.put(&key, value)?,
                WriteOp::Del(key) => self.del(&key)?,
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct InMemoryStorage {
    store: Arc<Mutex<HashMap<String, String>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageAdapter for InMemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries().get(key).cloned())
    }

    fn put(&self, key: &str, value: String) -> Result<()> {
        self.entries().insert(key.to_string(), value);
        Ok(())
    }

    fn del(&self, key: &str) -> Result<()> {
        self.entries().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn write_batch(&self, ops: Vec<WriteOp>) -> Result<()> {
        let mut entries = self.entries();
        for op in ops {
            match op {
                WriteOp::Put(key, value) => {
                    entries.insert(key, value);
                }
                WriteOp::Del(key) => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn load_json<T: serde::de::DeserializeOwned>(
    storage: &dyn StorageAdapter,
    key: &str,
) -> Result<Option<T>> {
    match storage.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub(crate) fn store_json<T: serde::Serialize>(
    storage: &dyn StorageAdapter,
    key: &str,
    value: &T,
) -> Result<()> {
    storage.put(key, serde_json::to_string(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_applies_puts_and_deletes_in_order() {
        let storage = InMemoryStorage::new();
        storage.put("a", "1".to_string()).unwrap();

        storage
            .write_batch(vec![
                WriteOp::Put("b".to_string(), "2".to_string()),
                WriteOp::Del("a".to_string()),
                WriteOp::Put("a".to_string(), "3".to_string()),
            ])
            .unwrap();

        assert_eq!(storage.get("a").unwrap(), Some("3".to_string()));
        assert_eq!(storage.get("b").unwrap(), Some("2".to_string()));
    }

    #[test]
    fn list_filters_by_prefix() {
        let storage = InMemoryStorage::new();
        storage.put("v1/recipient/1", "{}".to_string()).unwrap();
        storage.put("v1/recipient/2", "{}".to_string()).unwrap();
        storage.put("v1/session/1/1", "{}".to_string()).unwrap();

        let mut keys = storage.list("v1/recipient/").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["v1/recipient/1", "v1/recipient/2"]);
    }

    #[test]
    fn clones_share_contents() {
        let storage = InMemoryStorage::new();
        let other = storage.clone();
        storage.put("k", "v".to_string()).unwrap();
        assert_eq!(other.get("k").unwrap(), Some("v".to_string()));
    }
}
