use std::collections::VecDeque;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;

use super::ErrorContext;

/// Backing store for analyzed errors, read back for statistics and reports.
#[async_trait]
pub trait ErrorStore: Send + Sync {
    async fn persist(&self, context: &ErrorContext) -> Result<()>;

    /// Most recent first.
    async fn recent(&self, limit: usize) -> Result<Vec<ErrorContext>>;
}

/// Bounded in-process store; the oldest records are dropped first.
pub struct InMemoryErrorStore {
    records: Mutex<VecDeque<ErrorContext>>,
    capacity: usize,
}

impl InMemoryErrorStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }
}

#[async_trait]
impl ErrorStore for InMemoryErrorStore {
    async fn persist(&self, context: &ErrorContext) -> Result<()> {
        let mut records = self.records.lock();
        records.push_front(context.clone());
        records.truncate(self.capacity);
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ErrorContext>> {
        Ok(self.records.lock().iter().take(limit).cloned().collect())
    }
}

/// Keeps error records as JSON in a capped Redis list.
pub struct RedisErrorStore {
    client: redis::Client,
    key: String,
    capacity: usize,
}

impl RedisErrorStore {
    pub fn new(redis_url: &str, key: impl Into<String>, capacity: usize) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Invalid REDIS_URL")?;
        Ok(Self {
            client,
            key: key.into(),
            capacity: capacity.max(1),
        })
    }
}

#[async_trait]
impl ErrorStore for RedisErrorStore {
    async fn persist(&self, context: &ErrorContext) -> Result<()> {
        let payload = serde_json::to_string(context)?;
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("Redis connection failed")?;
        conn.lpush::<_, _, ()>(&self.key, payload).await?;
        conn.ltrim::<_, ()>(&self.key, 0, self.capacity as isize - 1)
            .await?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ErrorContext>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("Redis connection failed")?;
        let raw: Vec<String> = conn.lrange(&self.key, 0, limit as isize - 1).await?;
        raw.iter()
            .map(|item| serde_json::from_str(item).context("Corrupt error record in Redis"))
            .collect()
    }
}
