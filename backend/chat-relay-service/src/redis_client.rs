use crate::error::AppResult;
use crate::fanout::Broker;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use redis_utils::SharedConnectionManager;
use std::time::Duration;

/// [`Broker`] over the shared Redis connection manager.
#[derive(Clone)]
pub struct RedisClient {
    manager: SharedConnectionManager,
}

impl RedisClient {
    pub fn new(manager: SharedConnectionManager) -> Self {
        Self { manager }
    }

    async fn connection(&self) -> ConnectionManager {
        let guard = self.manager.lock().await;
        guard.clone()
    }
}

#[async_trait]
impl Broker for RedisClient {
    async fn publish(&self, channel: &str, payload: &str) -> AppResult<()> {
        let mut conn = self.connection().await;
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut conn = self.connection().await;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn publish_and_set(&self, channel: &str, payload: &str, ttl: Duration) -> AppResult<()> {
        let mut conn = self.connection().await;
        redis::pipe()
            .atomic()
            .publish(channel, payload)
            .ignore()
            .set_ex(channel, payload, ttl.as_secs().max(1))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}
