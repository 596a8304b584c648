//! Namespaced key/value store backing the `kv.*` syscalls
//!
//! Each namespace sits behind its own `RwLock`: one writer per namespace,
//! readers and writers of other namespaces proceed independently.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("kv key must not be empty")]
    EmptyKey,
    #[error("kv value of {size} bytes exceeds limit of {limit}")]
    ValueTooLarge { size: usize, limit: usize },
    #[error("namespace already holds {limit} keys")]
    KeyLimit { limit: usize },
}

impl KvError {
    pub fn reason(&self) -> &'static str {
        match self {
            KvError::EmptyKey => "kv_empty_key",
            KvError::ValueTooLarge { .. } => "kv_value_too_large",
            KvError::KeyLimit { .. } => "kv_key_limit",
        }
    }
}

type Namespace = Arc<RwLock<HashMap<String, String>>>;

#[derive(Default)]
pub struct KvStore {
    namespaces: RwLock<HashMap<String, Namespace>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn namespace(&self, ns: &str) -> Option<Namespace> {
        self.namespaces.read().await.get(ns).cloned()
    }

    async fn namespace_or_create(&self, ns: &str) -> Namespace {
        if let Some(existing) = self.namespace(ns).await {
            return existing;
        }
        let mut namespaces = self.namespaces.write().await;
        namespaces
            .entry(ns.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(HashMap::new())))
            .clone()
    }

    pub async fn get(&self, ns: &str, key: &str) -> Option<String> {
        let namespace = self.namespace(ns).await?;
        let entries = namespace.read().await;
        entries.get(key).cloned()
    }

    /// Write a value. New keys beyond `max_keys` are refused; existing keys
    /// can always be overwritten.
    pub async fn set(
        &self,
        ns: &str,
        key: &str,
        value: String,
        max_keys: usize,
        max_value_bytes: usize,
    ) -> Result<(), KvError> {
        if key.is_empty() {
            return Err(KvError::EmptyKey);
        }
        if value.len() > max_value_bytes {
            return Err(KvError::ValueTooLarge {
                size: value.len(),
                limit: max_value_bytes,
            });
        }
        let namespace = self.namespace_or_create(ns).await;
        let mut entries = namespace.write().await;
        if !entries.contains_key(key) && entries.len() >= max_keys {
            debug!("kv namespace {} is full ({} keys)", ns, max_keys);
            return Err(KvError::KeyLimit { limit: max_keys });
        }
        entries.insert(key.to_string(), value);
        Ok(())
    }

    pub async fn key_count(&self, ns: &str) -> usize {
        match self.namespace(ns).await {
            Some(namespace) => namespace.read().await.len(),
            None => 0,
        }
    }
}
