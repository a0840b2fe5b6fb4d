//! Persisted state: key-value stores, the legacy-store migration guard and the
//! unified per-flow store built on top of them.

mod encryption;
mod file;
mod flow_store;
mod memory;
mod migration;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;

pub use encryption::{decrypt, encrypt, ValueCipher};
pub use file::FileStore;
pub use flow_store::{FlowStore, StoredCredentials};
pub use memory::MemoryStore;
pub use migration::{LegacyKey, LegacyKeyMigration, Migration, MigrationGuard, MigrationReport};

/// String-keyed, string-valued async storage.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    async fn set(&self, key: &str, value: &str) -> Result<(), Error>;

    /// Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), Error>;

    async fn keys(&self) -> Result<Vec<String>, Error>;
}

/// Prefixes every key, so several stores can share one backend.
#[derive(Clone)]
pub struct Namespaced {
    inner: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl Namespaced {
    pub fn new(inner: Arc<dyn KeyValueStore>, namespace: &str) -> Self {
        Self {
            inner,
            prefix: format!("{namespace}:"),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl KeyValueStore for Namespaced {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        self.inner.get(&self.key(key)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.inner.set(&self.key(key), value).await
    }

    async fn remove(&self, key: &str) -> Result<(), Error> {
        self.inner.remove(&self.key(key)).await
    }

    async fn keys(&self) -> Result<Vec<String>, Error> {
        Ok(self
            .inner
            .keys()
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_namespaces_do_not_collide() {
        let backend: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let a = Namespaced::new(backend.clone(), "a");
        let b = Namespaced::new(backend.clone(), "b");

        a.set("k", "1").await.unwrap();
        b.set("k", "2").await.unwrap();

        assert_eq!(a.get("k").await.unwrap().as_deref(), Some("1"));
        assert_eq!(b.get("k").await.unwrap().as_deref(), Some("2"));
        assert_eq!(a.keys().await.unwrap(), vec!["k".to_string()]);
        assert_eq!(backend.get("a:k").await.unwrap().as_deref(), Some("1"));

        a.remove("k").await.unwrap();
        assert!(a.get("k").await.unwrap().is_none());
        assert!(b.get("k").await.unwrap().is_some());
    }
}
