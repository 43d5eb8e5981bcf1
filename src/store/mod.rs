//! Shared time-series store.
//!
//! The analyzer only reads series and the metric universe; the one write it
//! performs is setting alert cooldown keys.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::error::StoreError;
use async_trait::async_trait;
use bytes::Bytes;

#[async_trait]
pub trait Store: Send + Sync {
    /// Liveness probe
    async fn ping(&self) -> Result<(), StoreError>;

    /// Drop any held connection and open a new one.
    async fn reconnect(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// All members of a set key, in no particular order.
    async fn members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Values for `keys`, in the same order, `None` where absent. One round trip.
    async fn bulk_get(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl_secs: u64)
    -> Result<(), StoreError>;
}
