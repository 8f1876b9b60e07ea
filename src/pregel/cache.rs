//! Node result cache
//!
//! Nodes flagged `cacheable` may skip execution when the same node
//! signature was already evaluated on the same inputs.

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Output values stored for one cache key
pub type CachedOutputs = BTreeMap<String, Value>;

/// Storage for cached node outputs
#[async_trait]
pub trait NodeCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<CachedOutputs>;

    async fn put(&self, key: &str, outputs: CachedOutputs);
}

/// Cache key for a node signature evaluated on `inputs`.
///
/// Inputs are keyed by name in sorted order, so the key does not depend on
/// the order values were supplied in.
pub fn cache_key(signature: &str, inputs: &BTreeMap<String, Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(signature.as_bytes());
    hasher.update(b"\n");
    for (name, value) in inputs {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.to_string().as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Process-local cache
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, CachedOutputs>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[async_trait]
impl NodeCache for InMemoryCache {
    async fn get(&self, key: &str) -> Option<CachedOutputs> {
        self.entries.read().await.get(key).cloned()
    }

    async fn put(&self, key: &str, outputs: CachedOutputs) {
        self.entries.write().await.insert(key.to_string(), outputs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_cache_key_depends_on_signature_and_inputs() {
        let a = cache_key("embed|v1", &inputs(&[("query", json!("hi"))]));
        let b = cache_key("embed|v1", &inputs(&[("query", json!("hi"))]));
        let c = cache_key("embed|v2", &inputs(&[("query", json!("hi"))]));
        let d = cache_key("embed|v1", &inputs(&[("query", json!("hello"))]));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_in_memory_cache() {
        let cache = InMemoryCache::new();
        assert!(cache.get("k").await.is_none());

        cache.put("k", inputs(&[("vector", json!([1, 2]))])).await;
        assert_eq!(cache.get("k").await.unwrap()["vector"], json!([1, 2]));
        assert_eq!(cache.len().await, 1);

        cache.clear().await;
        assert!(cache.is_empty().await);
    }
}
