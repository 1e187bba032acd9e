use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::KeyValueStore;
use crate::error::PersistenceError;

/// Process-local store; state is lost on exit
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values(values: HashMap<String, String>) -> Self {
        Self {
            data: RwLock::new(values),
        }
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, String>, PersistenceError> {
        let data = self.data.read().await;
        Ok(keys
            .iter()
            .filter_map(|k| data.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect())
    }

    async fn set(&self, values: HashMap<String, String>) -> Result<(), PersistenceError> {
        self.data.write().await.extend(values);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_only_requested_keys() {
        let store = MemoryStore::new();
        store
            .set(HashMap::from([
                ("balance".to_string(), "10".to_string()),
                ("stats".to_string(), "{}".to_string()),
            ]))
            .await
            .unwrap();

        let values = store.get(&["balance", "missing"]).await.unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values["balance"], "10");
    }

    #[tokio::test]
    async fn test_set_merges() {
        let store = MemoryStore::with_values(HashMap::from([("a".to_string(), "1".to_string())]));
        store
            .set(HashMap::from([("b".to_string(), "2".to_string())]))
            .await
            .unwrap();
        assert_eq!(store.len().await, 2);
    }
}
