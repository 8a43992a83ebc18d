//! Redis-backed `RequestStore`: a single hash at `{process_name}.requests`,
//! field = `client_request_id`, value = JSON-serialized `Request`
//! (spec.md §6 key-value store layout).

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::request::Request;

use super::RequestStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub struct RedisStore {
    conn: ConnectionManager,
    hash_key: String,
}

impl RedisStore {
    /// `hash_key` is `{process_name}.requests` per spec.md §6.
    pub async fn connect(redis_url: &str, process_name: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            hash_key: format!("{process_name}.requests"),
        })
    }
}

#[async_trait::async_trait]
impl RequestStore for RedisStore {
    async fn save(&self, request: &Request) -> Result<(), StoreError> {
        let payload = serde_json::to_string(request)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(&self.hash_key, &request.client_request_id, payload)
            .await?;
        Ok(())
    }

    async fn delete(&self, client_request_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(&self.hash_key, client_request_id).await?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Request>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: std::collections::HashMap<String, String> = conn.hgetall(&self.hash_key).await?;
        let mut requests = Vec::with_capacity(raw.len());
        for (client_request_id, json) in raw {
            match serde_json::from_str::<Request>(&json) {
                Ok(request) => requests.push(request),
                Err(err) => {
                    tracing::warn!(%client_request_id, error = %err, "skipping malformed cache entry");
                }
            }
        }
        Ok(requests)
    }
}
