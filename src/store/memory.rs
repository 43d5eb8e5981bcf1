use super::Store;
use crate::error::StoreError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

/// In-process store with key expiry on the tokio clock.
///
/// Used for local runs and tests; `set_available(false)` simulates an outage.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, Entry>>,
    sets: RwLock<HashMap<String, BTreeSet<String>>>,
    down: AtomicBool,
    bulk_gets: AtomicUsize,
    reconnects: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<Bytes>) {
        if let Ok(mut values) = self.values.write() {
            values.insert(
                key.into(),
                Entry {
                    value: value.into(),
                    expires_at: None,
                },
            );
        }
    }

    pub fn remove(&self, key: &str) {
        if let Ok(mut values) = self.values.write() {
            values.remove(key);
        }
    }

    pub fn add_member(&self, set: impl Into<String>, member: impl Into<String>) {
        if let Ok(mut sets) = self.sets.write() {
            sets.entry(set.into()).or_default().insert(member.into());
        }
    }

    pub fn set_available(&self, available: bool) {
        self.down.store(!available, Ordering::SeqCst);
    }

    /// Number of `bulk_get` round trips served so far.
    pub fn bulk_get_calls(&self) -> usize {
        self.bulk_gets.load(Ordering::SeqCst)
    }

    /// Number of `reconnect` calls so far.
    pub fn reconnect_calls(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }

    fn lookup(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let values = self
            .values
            .read()
            .map_err(|e| StoreError::Command(e.to_string()))?;
        let now = Instant::now();
        Ok(values
            .get(key)
            .filter(|e| e.expires_at.is_none_or(|at| at > now))
            .map(|e| e.value.clone()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.check()
    }

    async fn members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        let sets = self
            .sets
            .read()
            .map_err(|e| StoreError::Command(e.to_string()))?;
        Ok(sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn bulk_get(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>, StoreError> {
        self.check()?;
        self.bulk_gets.fetch_add(1, Ordering::SeqCst);
        keys.iter().map(|k| self.lookup(k)).collect()
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.check()?;
        self.lookup(key)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: Bytes,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut values = self
            .values
            .write()
            .map_err(|e| StoreError::Command(e.to_string()))?;
        values.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("last_alert.smtp.cpu", Bytes::from_static(b"x"), 60)
            .await
            .unwrap();

        assert!(store.get("last_alert.smtp.cpu").await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.get("last_alert.smtp.cpu").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bulk_get_preserves_order() {
        let store = MemoryStore::new();
        store.insert("b", Bytes::from_static(b"2"));
        store.insert("a", Bytes::from_static(b"1"));

        let keys = vec!["a".to_string(), "missing".to_string(), "b".to_string()];
        let got = store.bulk_get(&keys).await.unwrap();

        assert_eq!(got[0].as_deref(), Some(&b"1"[..]));
        assert!(got[1].is_none());
        assert_eq!(got[2].as_deref(), Some(&b"2"[..]));
        assert_eq!(store.bulk_get_calls(), 1);
    }

    #[tokio::test]
    async fn test_outage() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(store.ping().await.is_err());
        assert!(store.members("metrics.unique_metrics").await.is_err());
        assert!(store.reconnect().await.is_err());
        store.set_available(true);
        assert!(store.reconnect().await.is_ok());
        assert!(store.ping().await.is_ok());
        assert_eq!(store.reconnect_calls(), 2);
    }
}
