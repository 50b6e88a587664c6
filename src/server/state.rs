//! Server state: shared app handle and the list response cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::app::App;

/// How long cached list responses stay valid.
pub const LIST_CACHE_TTL_SECS: u64 = 120;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "0.0.0.0:8080")
    pub listen_addr: String,
}

/// A cached list response.
pub struct CachedList {
    pub body: serde_json::Value,
    pub created: Instant,
    /// Cache-buster generation the entry was built under.
    pub generation: u64,
}

/// Application state shared across handlers.
pub struct AppState {
    pub app: Arc<App>,
    pub config: ServerConfig,
    /// List responses keyed by their query string.
    pub list_cache: RwLock<HashMap<String, CachedList>>,
    /// Bumped after every successful build to invalidate list responses.
    cache_generation: AtomicU64,
}

impl AppState {
    pub fn new(app: Arc<App>, config: ServerConfig) -> Self {
        AppState {
            app,
            config,
            list_cache: RwLock::new(HashMap::new()),
            cache_generation: AtomicU64::new(0),
        }
    }

    pub fn generation(&self) -> u64 {
        self.cache_generation.load(Ordering::SeqCst)
    }

    /// Invalidate all cached list responses.
    pub fn bust_cache(&self) {
        self.cache_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Fetch a cached list body if it is fresh and from this generation.
    pub async fn cached_list(&self, key: &str) -> Option<serde_json::Value> {
        let cache = self.list_cache.read().await;
        let entry = cache.get(key)?;
        let fresh = entry.created.elapsed() < Duration::from_secs(LIST_CACHE_TTL_SECS);
        if fresh && entry.generation == self.generation() {
            Some(entry.body.clone())
        } else {
            None
        }
    }

    /// Store a list body under its query key.
    pub async fn store_list(&self, key: String, body: serde_json::Value) {
        let mut cache = self.list_cache.write().await;
        cache.insert(
            key,
            CachedList {
                body,
                created: Instant::now(),
                generation: self.generation(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::{PdfEngine, RenderOptions};
    use crate::LibritoError;
    use async_trait::async_trait;

    struct NoopEngine;

    #[async_trait]
    impl PdfEngine for NoopEngine {
        async fn render(
            &self,
            _html: &str,
            _options: &RenderOptions,
        ) -> Result<Vec<u8>, LibritoError> {
            Ok(Vec::new())
        }
    }

    fn state(dir: &std::path::Path) -> AppState {
        let app = Arc::new(App::open_with_engine(dir, Arc::new(NoopEngine)).unwrap());
        AppState::new(
            app,
            ServerConfig {
                listen_addr: "127.0.0.1:0".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_cache_round_trip_and_bust() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());

        assert!(state.cached_list("page=1").await.is_none());
        state
            .store_list("page=1".to_string(), serde_json::json!({"total": 0}))
            .await;
        assert_eq!(
            state.cached_list("page=1").await,
            Some(serde_json::json!({"total": 0}))
        );

        // Busting invalidates every cached entry
        state.bust_cache();
        assert!(state.cached_list("page=1").await.is_none());
    }
}
