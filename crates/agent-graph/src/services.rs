//! Typed service registry and global state for one graph instance.
//!
//! `Services` lets hosts inject non-serializable runtime objects (LLM
//! executors, API clients) that node code resolves by key. `GlobalState`
//! is the JSON key/value map executors use to record request/response
//! state under well-known keys.

use std::any::Any;
use std::collections::HashMap;

use tokio::sync::RwLock;

/// Typed map of injected dependencies, resolved by key.
///
/// Values are stored as `dyn Any`; `get` clones, so register `Arc`-wrapped
/// services (or other cheap-to-clone handles).
#[derive(Default)]
pub struct Services {
    inner: RwLock<HashMap<String, Box<dyn Any + Send + Sync>>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a typed value under the given key, replacing any previous one.
    pub async fn set<T: Send + Sync + 'static>(&self, key: &str, value: T) {
        self.inner.write().await.insert(key.to_string(), Box::new(value));
    }

    /// Resolve a typed value by key.
    ///
    /// Returns `None` if the key doesn't exist or the type doesn't match.
    pub async fn get<T: Clone + Send + Sync + 'static>(&self, key: &str) -> Option<T> {
        self.inner
            .read()
            .await
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    pub async fn has(&self, key: &str) -> bool {
        self.inner.read().await.contains_key(key)
    }
}

/// Per-graph JSON state map.
#[derive(Default)]
pub struct GlobalState {
    inner: RwLock<HashMap<String, serde_json::Value>>,
}

impl GlobalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, key: &str, value: serde_json::Value) {
        self.inner.write().await.insert(key.to_string(), value);
    }

    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.read().await.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_set_and_get() {
        let services = Services::new();
        services.set("name", "hello".to_string()).await;

        assert_eq!(services.get::<String>("name").await, Some("hello".to_string()));
        assert!(services.has("name").await);
        assert!(!services.has("missing").await);
    }

    #[tokio::test]
    async fn test_type_mismatch_returns_none() {
        let services = Services::new();
        services.set("count", 42u32).await;

        assert!(services.get::<String>("count").await.is_none());
        assert_eq!(services.get::<u32>("count").await, Some(42));
    }

    #[tokio::test]
    async fn test_arc_services() {
        let services = Services::new();
        let value = Arc::new(vec![1, 2, 3]);
        services.set("data", value.clone()).await;

        let resolved = services.get::<Arc<Vec<i32>>>("data").await.unwrap();
        assert_eq!(resolved.as_ref(), &vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_global_state_roundtrip() {
        let state = GlobalState::new();
        state.set("core.llm.response.status", serde_json::json!(200)).await;
        assert_eq!(
            state.get("core.llm.response.status").await,
            Some(serde_json::json!(200))
        );
        assert!(state.get("missing").await.is_none());
    }
}
