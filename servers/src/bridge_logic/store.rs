//! Telescope state store client.
//!
//! Keys are either immutable (write-once, rewriting with a different value is
//! a conflict) or mutable time series, where every accepted sample is kept
//! ordered by timestamp.

use std::future::Future;

use redis::AsyncCommands;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("immutable key '{key}' already holds a different value")]
    ImmutableKeyConflict { key: String },
    #[error("state store error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("value encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The one operation the bridge needs from the state store.
pub trait StateStore {
    fn add(
        &mut self,
        key: &str,
        value: &Value,
        timestamp: Option<f64>,
        immutable: bool,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Redis-backed telescope state.
#[derive(Clone)]
pub struct TelescopeState {
    conn: redis::aio::ConnectionManager,
}

impl TelescopeState {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

impl StateStore for TelescopeState {
    async fn add(
        &mut self,
        key: &str,
        value: &Value,
        timestamp: Option<f64>,
        immutable: bool,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(value)?;
        if immutable {
            let created: bool = redis::cmd("SET")
                .arg(key)
                .arg(&payload)
                .arg("NX")
                .query_async(&mut self.conn)
                .await?;
            if !created {
                let existing: Option<String> = self.conn.get(key).await?;
                if existing.as_deref() != Some(payload.as_str()) {
                    return Err(StoreError::ImmutableKeyConflict {
                        key: key.to_string(),
                    });
                }
            }
        } else {
            let timestamp = timestamp.unwrap_or_else(now_seconds);
            // Prefix the member with the timestamp so equal values sampled at
            // different times stay distinct in the sorted set.
            let member = format!("{}:{}", timestamp, payload);
            let _: () = self.conn.zadd(key, member, timestamp).await?;
        }
        Ok(())
    }
}

fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_seconds_is_sane() {
        let now = now_seconds();
        // After 2020-01-01 and before 2100
        assert!(now > 1.577e9 && now < 4.1e9);
    }
}
