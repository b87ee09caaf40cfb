//! Shared-storage client interface.
//!
//! The framework treats the storage service as an external collaborator and
//! consumes only this namespaced key-value surface. [`MemoryStorage`] is the
//! in-process fake for development and tests, so an app can run without any
//! backing service at all.

use std::collections::BTreeMap;
use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

/// Namespaced key-value storage consumed by message apps.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn set(&self, ns: &str, key: &str, value: Vec<u8>);

    async fn get(&self, ns: &str, key: &str) -> Option<Vec<u8>>;

    /// All pairs in `ns` whose key starts with `prefix`.
    async fn find_by_prefix(&self, ns: &str, prefix: &str) -> BTreeMap<String, Vec<u8>>;

    async fn delete(&self, ns: &str, key: &str);

    async fn healthcheck(&self) -> bool;
}

/// In-memory storage fake.
#[derive(Default)]
pub struct MemoryStorage {
    namespaces: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn set(&self, ns: &str, key: &str, value: Vec<u8>) {
        self.namespaces
            .write()
            .await
            .entry(ns.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    async fn get(&self, ns: &str, key: &str) -> Option<Vec<u8>> {
        self.namespaces.read().await.get(ns)?.get(key).cloned()
    }

    async fn find_by_prefix(&self, ns: &str, prefix: &str) -> BTreeMap<String, Vec<u8>> {
        let namespaces = self.namespaces.read().await;
        let Some(keys) = namespaces.get(ns) else {
            return BTreeMap::new();
        };
        keys.range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    async fn delete(&self, ns: &str, key: &str) {
        if let Some(keys) = self.namespaces.write().await.get_mut(ns) {
            keys.remove(key);
        }
    }

    async fn healthcheck(&self) -> bool {
        true
    }
}
