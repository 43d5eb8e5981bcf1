use super::Store;
use crate::error::StoreError;
use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::MultiplexedConnection;
use std::future::Future;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Redis-backed store over a multiplexed async connection.
pub struct RedisStore {
    client: redis::Client,
    conn: RwLock<Option<MultiplexedConnection>>,
    /// Upper bound on connecting and on every command round trip
    timeout: Duration,
}

impl RedisStore {
    /// Parse the URL and try to connect. A failed first connection is not an
    /// error: the scheduler's ping/reconnect loop takes over.
    pub async fn open(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Connection(format!("failed to parse URL: {}", e)))?;

        let store = Self {
            client,
            conn: RwLock::new(None),
            timeout,
        };
        if let Err(e) = store.reconnect().await {
            warn!(error = %e, "redis not reachable at startup, will retry");
        }
        Ok(store)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        self.conn.read().await.clone().ok_or(StoreError::Unavailable)
    }

    /// A store that stops answering without closing the socket surfaces as a
    /// connection error instead of a hang.
    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Connection(format!(
                "{} timed out after {:?}",
                op, self.timeout
            ))),
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: String = self
            .bounded("PING", redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        let mut slot = self.conn.write().await;
        *slot = None;
        let conn = self
            .bounded("connect", self.client.get_multiplexed_async_connection())
            .await?;
        *slot = Some(conn);
        info!("connected to redis");
        Ok(())
    }

    async fn members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        self.bounded("SMEMBERS", redis::cmd("SMEMBERS").arg(key).query_async(&mut conn))
            .await
    }

    /// Not bounded here: the aggregator's worker deadline covers the fetch.
    async fn bulk_get(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let raw: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await?;
        Ok(raw.into_iter().map(|v| v.map(Bytes::from)).collect())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<Vec<u8>> = self
            .bounded("GET", redis::cmd("GET").arg(key).query_async(&mut conn))
            .await?;
        Ok(raw.map(Bytes::from))
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: Bytes,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = self
            .bounded(
                "SETEX",
                redis::cmd("SETEX")
                    .arg(key)
                    .arg(ttl_secs.max(1))
                    .arg(value.as_ref())
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accepts connections and never answers.
    async fn silent_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        port
    }

    #[tokio::test]
    async fn test_silent_server_does_not_hang_ping() {
        let port = silent_server().await;
        let url = format!("redis://127.0.0.1:{}", port);

        let store = RedisStore::open(&url, Duration::from_millis(200))
            .await
            .unwrap();
        let ping = tokio::time::timeout(Duration::from_secs(5), store.ping())
            .await
            .unwrap();
        assert!(ping.is_err());

        let members = tokio::time::timeout(
            Duration::from_secs(5),
            store.members("metrics.unique_metrics"),
        )
        .await
        .unwrap();
        assert!(members.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_store_still_opens() {
        // nothing listens on the discard port; startup degrades instead of failing
        let store = RedisStore::open("redis://127.0.0.1:9", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(store.ping().await, Err(StoreError::Unavailable)));
    }

    #[tokio::test]
    async fn test_bad_url_is_rejected() {
        assert!(matches!(
            RedisStore::open("not-a-url", Duration::from_secs(1)).await,
            Err(StoreError::Connection(_))
        ));
    }
}
