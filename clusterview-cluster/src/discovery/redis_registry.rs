//! Redis-backed peer registry
//!
//! Binds with `SET key value NX` so concurrent binders of one key race on
//! the server and exactly one wins.

use async_trait::async_trait;
use tokio::time::{timeout, Duration};
use tracing::debug;

use super::peer_registry::{Marker, PeerRegistry};
use crate::error::{Error, Result};
use clusterview_core::resilience::timeout::REGISTRY_OPERATION_TIMEOUT;

/// Registry whose keys live in Redis under a common prefix
pub struct RedisRegistry {
    client: redis::Client,
    key_prefix: String,
    operation_timeout: Duration,
}

impl RedisRegistry {
    pub fn new(redis_url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::Redis(format!("Invalid Redis URL: {e}")))?;

        Ok(Self {
            client,
            key_prefix: key_prefix.into(),
            operation_timeout: REGISTRY_OPERATION_TIMEOUT,
        })
    }

    #[must_use]
    pub const fn with_operation_timeout(mut self, operation_timeout: Duration) -> Self {
        self.operation_timeout = operation_timeout;
        self
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        timeout(
            self.operation_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| Error::Directory("Redis connection timed out".to_string()))?
        .map_err(|e| Error::Directory(format!("Redis connection failed: {e}")))
    }
}

#[async_trait]
impl PeerRegistry for RedisRegistry {
    async fn bind(&self, name: &str, marker: Marker) -> Result<()> {
        let mut conn = self.connection().await?;
        let key = self.key(name);

        let reply: Option<String> = timeout(
            self.operation_timeout,
            redis::cmd("SET")
                .arg(&key)
                .arg(marker.as_str())
                .arg("NX")
                .query_async(&mut conn),
        )
        .await
        .map_err(|_| Error::Directory("Redis SET timed out".to_string()))?
        .map_err(|e| Error::Directory(format!("Failed to bind {name}: {e}")))?;

        match reply {
            Some(_) => {
                debug!(key = %key, "Bound registry key");
                Ok(())
            }
            None => Err(Error::AlreadyBound(name.to_string())),
        }
    }

    async fn lookup(&self, name: &str) -> Result<Option<Marker>> {
        let mut conn = self.connection().await?;

        let value: Option<String> = timeout(
            self.operation_timeout,
            redis::cmd("GET").arg(self.key(name)).query_async(&mut conn),
        )
        .await
        .map_err(|_| Error::Directory("Redis GET timed out".to_string()))?
        .map_err(|e| Error::Directory(format!("Failed to look up {name}: {e}")))?;

        Ok(value.map(Marker))
    }

    async fn unbind(&self, name: &str) -> Result<()> {
        let mut conn = self.connection().await?;

        timeout(
            self.operation_timeout,
            redis::cmd("DEL")
                .arg(self.key(name))
                .query_async::<()>(&mut conn),
        )
        .await
        .map_err(|_| Error::Directory("Redis DEL timed out".to_string()))?
        .map_err(|e| Error::Directory(format!("Failed to unbind {name}: {e}")))?;

        Ok(())
    }
}
