use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::{Client, IntoConnectionInfo};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

/// Shared Redis connection manager guarded by a Tokio mutex.
pub type SharedConnectionManager = Arc<Mutex<ConnectionManager>>;

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// Command connection plus the client used to open dedicated pub/sub connections.
///
/// Commands go through a single auto-reconnecting [`ConnectionManager`]. Pub/sub needs its own
/// socket, so callers ask for one via [`RedisPool::client`].
#[derive(Clone)]
pub struct RedisPool {
    client: Client,
    manager: SharedConnectionManager,
}

impl RedisPool {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let info = redis_url
            .into_connection_info()
            .context("failed to parse REDIS_URL connection string")?;
        let client = Client::open(info).context("failed to construct Redis client")?;

        let mut attempt = 0;
        let manager = loop {
            attempt += 1;
            match ConnectionManager::new(client.clone()).await {
                Ok(manager) => break manager,
                Err(err) if attempt < CONNECT_ATTEMPTS => {
                    warn!(attempt, error = %err, "Redis not reachable yet, retrying");
                    sleep(CONNECT_BACKOFF * attempt).await;
                }
                Err(err) => {
                    return Err(err).context("failed to initialize Redis connection manager")
                }
            }
        };

        info!("Redis connection manager ready");

        Ok(Self {
            client,
            manager: Arc::new(Mutex::new(manager)),
        })
    }

    pub fn manager(&self) -> SharedConnectionManager {
        self.manager.clone()
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}
