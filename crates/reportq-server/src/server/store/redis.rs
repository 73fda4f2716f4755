use super::StatusStore;
use async_trait::async_trait;
use core::time::Duration;
use redis::Client;
use redis::aio::MultiplexedConnection;
use reportq_core::{Error, Result};

/// [`StatusStore`] on plain Redis string keys (`SET key value EX ttl`).
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    /// Connects and verifies the server with `PING`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| Error::Connection {
            context: format!("invalid Redis URL: {e}"),
        })?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::Connection {
                context: format!("failed to connect to Redis: {e}"),
            })?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Connection {
                context: format!("Redis PING failed: {e}"),
            })?;
        tracing::info!("connected to Redis status store");
        Ok(Self { conn })
    }
}

#[async_trait]
impl StatusStore for RedisStore {
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| Error::Store {
                context: format!("SET {key} failed: {e}"),
            })
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map_err(|e| Error::Store {
                context: format!("GET {key} failed: {e}"),
            })
    }
}
