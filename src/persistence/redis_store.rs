use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::future::Future;
use tokio::time::{timeout, Duration};

use super::KeyValueStore;
use crate::error::PersistenceError;

const REDIS_TIMEOUT: Duration = Duration::from_secs(5);

/// Redis persistence: one hash `{namespace}:state` holding every key
pub struct RedisStore {
    conn: ConnectionManager,
    key: String,
}

impl RedisStore {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    /// * `namespace` - prefix of the hash key
    pub async fn connect(redis_url: &str, namespace: &str) -> Result<Self, PersistenceError> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(REDIS_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| PersistenceError::Timeout)??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            key: state_key(namespace),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

fn state_key(namespace: &str) -> String {
    format!("{}:state", namespace)
}

async fn with_timeout<T, F>(fut: F) -> Result<T, PersistenceError>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    timeout(REDIS_TIMEOUT, fut)
        .await
        .map_err(|_| PersistenceError::Timeout)?
        .map_err(PersistenceError::from)
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, String>, PersistenceError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.conn.clone();
        let found: Vec<Option<String>> = with_timeout(
            redis::cmd("HMGET")
                .arg(&self.key)
                .arg(keys)
                .query_async(&mut conn),
        )
        .await?;

        Ok(keys
            .iter()
            .zip(found)
            .filter_map(|(k, v)| v.map(|v| (k.to_string(), v)))
            .collect())
    }

    async fn set(&self, values: HashMap<String, String>) -> Result<(), PersistenceError> {
        if values.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let items: Vec<(String, String)> = values.into_iter().collect();
        with_timeout(conn.hset_multiple::<_, _, _, ()>(&self.key, items.as_slice())).await?;

        tracing::debug!("Saved {} keys to Redis hash {}", items.len(), self.key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_key() {
        assert_eq!(state_key("coinsim"), "coinsim:state");
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_connection_timeout() {
        // Try to connect to non-existent Redis
        let result = RedisStore::connect("redis://192.0.2.1:6379", "test").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_set_and_get() {
        let store = RedisStore::connect("redis://127.0.0.1:6379", "coinsim-test")
            .await
            .expect("Failed to connect to Redis");

        store
            .set(HashMap::from([("balance".to_string(), "42".to_string())]))
            .await
            .unwrap();

        let values = store.get(&["balance", "missing"]).await.unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values["balance"], "42");
    }
}
