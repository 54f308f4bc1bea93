//! JSON values in Redis under a service-wide key prefix.

use std::time::Duration;

use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use serde::{Serialize, de::DeserializeOwned};
use svckit_core::{Error, config::CacheConfig};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

fn cache_error(e: redis::RedisError) -> Error {
    Error::Cache(e.to_string())
}

pub struct CacheClient {
    client: Client,
    conn: Mutex<Option<MultiplexedConnection>>,
    key_prefix: String,
}

impl CacheClient {
    /// Creates a client. No connection is opened until the first command.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the URL cannot be parsed.
    pub fn new(config: &CacheConfig) -> Result<Self, Error> {
        let client = Client::open(config.url.expose())
            .map_err(|e| Error::Configuration(format!("invalid redis url: {e}")))?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
            key_prefix: config.key_prefix.clone(),
        })
    }

    async fn get_conn(&self) -> Result<MultiplexedConnection, Error> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(cache_error)?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    fn key(&self, key: &str) -> String {
        prefixed(&self.key_prefix, key)
    }

    /// Check Redis connection with PING command.
    #[instrument(skip(self))]
    pub async fn ping(&self) -> Result<(), Error> {
        let mut conn = self.get_conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(cache_error)?;
        Ok(())
    }

    /// Reads and decodes the value at `key`, `None` if absent.
    #[instrument(skip(self))]
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, Error> {
        let mut conn = self.get_conn().await?;
        let raw: Option<String> = conn.get(self.key(key)).await.map_err(cache_error)?;

        let Some(raw) = raw else {
            debug!(key, "Cache miss");
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Stores `value` as JSON. A `ttl` below one second is rounded up.
    #[instrument(skip(self, value))]
    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), Error> {
        let raw = serde_json::to_string(value)?;
        let mut conn = self.get_conn().await?;
        let key = self.key(key);

        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, raw, ttl_seconds(ttl))
                .await
                .map_err(cache_error)?,
            None => conn.set::<_, _, ()>(key, raw).await.map_err(cache_error)?,
        }
        Ok(())
    }
}

fn prefixed(prefix: &str, key: &str) -> String {
    format!("{prefix}{key}")
}

fn ttl_seconds(ttl: Duration) -> u64 {
    let secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 || secs == 0 {
        secs + 1
    } else {
        secs
    }
}
