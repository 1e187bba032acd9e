mod file;
mod memory;
mod redis_store;
mod snapshot;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use snapshot::{StoredState, ALL_KEYS};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{PersistenceSettings, StorageBackend};
use crate::error::PersistenceError;

/// Flat string key-value storage the simulator persists into
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch the given keys; absent keys are omitted from the result
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, String>, PersistenceError>;

    /// Write the given keys, leaving every other key untouched
    async fn set(&self, values: HashMap<String, String>) -> Result<(), PersistenceError>;
}

/// Build the configured backend. A Redis connection failure falls back to memory.
pub async fn open_store(settings: &PersistenceSettings) -> Arc<dyn KeyValueStore> {
    match settings.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::File => {
            tracing::info!("Persisting state to {}", settings.path.display());
            Arc::new(FileStore::new(&settings.path))
        }
        StorageBackend::Redis => {
            match RedisStore::connect(&settings.redis_url, &settings.namespace).await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    tracing::warn!("Redis unavailable ({}), keeping state in memory", e);
                    Arc::new(MemoryStore::new())
                }
            }
        }
    }
}

/// Load persisted state. Storage failures yield an empty state.
pub async fn load_state(store: &dyn KeyValueStore) -> StoredState {
    match store.get(&ALL_KEYS).await {
        Ok(values) => {
            tracing::debug!("Loaded {} stored keys", values.len());
            StoredState::from_values(&values)
        }
        Err(e) => {
            tracing::warn!("Failed to load stored state, starting fresh: {}", e);
            StoredState::default()
        }
    }
}

/// Persist a snapshot. Returns false when the write failed; the failure is only logged.
pub async fn save_state(store: &dyn KeyValueStore, state: &StoredState) -> bool {
    let values = match state.to_values() {
        Ok(values) => values,
        Err(e) => {
            tracing::warn!("Failed to encode state: {}", e);
            return false;
        }
    };
    match store.set(values).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Failed to save state: {}", e);
            false
        }
    }
}
