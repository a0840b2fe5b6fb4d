//! Unified per-flow storage for credentials, PKCE verifiers and cached tokens.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{KeyValueStore, MigrationGuard, Namespaced};
use crate::error::{Error, ErrorKind, StorageErrorKind};
use crate::oauth::{ClientAuthMethod, ClientConfig, PkceVerifier};
use crate::token::CachedTokenRecord;

const CREDENTIALS: &str = "credentials";
const PKCE: &str = "pkce";
const TOKENS: &str = "tokens";

/// Client settings remembered per flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCredentials {
    pub environment_id: String,
    pub client_id: String,
    #[serde(default, with = "crate::token::optional_secret_string")]
    pub client_secret: Option<SecretString>,
    #[serde(default)]
    pub auth_method: ClientAuthMethod,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl StoredCredentials {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            auth_method: self.auth_method,
            signing_key: None,
            key_id: None,
        }
    }
}

/// The unified store. Every operation first makes sure legacy data has been
/// migrated, so nothing reads a half-migrated view.
#[derive(Clone)]
pub struct FlowStore {
    credentials: Namespaced,
    pkce: Namespaced,
    tokens: Namespaced,
    guard: Arc<MigrationGuard>,
}

impl FlowStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_migration(store, Arc::new(MigrationGuard::noop()))
    }

    pub fn with_migration(store: Arc<dyn KeyValueStore>, guard: Arc<MigrationGuard>) -> Self {
        Self {
            credentials: Namespaced::new(store.clone(), CREDENTIALS),
            pkce: Namespaced::new(store.clone(), PKCE),
            tokens: Namespaced::new(store, TOKENS),
            guard,
        }
    }

    pub fn guard(&self) -> &Arc<MigrationGuard> {
        &self.guard
    }

    pub async fn save_credentials(&self, flow: &str, credentials: &StoredCredentials) -> Result<(), Error> {
        self.put(&self.credentials, flow, credentials).await
    }

    pub async fn load_credentials(&self, flow: &str) -> Result<Option<StoredCredentials>, Error> {
        self.fetch(&self.credentials, flow).await
    }

    pub async fn remove_credentials(&self, flow: &str) -> Result<(), Error> {
        self.guard.ensure_migration().await?;
        self.credentials.remove(flow).await
    }

    /// Keep the verifier for an attempt until its code is exchanged.
    pub async fn save_pkce(&self, state: &str, verifier: &PkceVerifier) -> Result<(), Error> {
        self.put(&self.pkce, state, verifier).await
    }

    /// Return and forget the verifier, so it is used for at most one exchange.
    pub async fn take_pkce(&self, state: &str) -> Result<Option<PkceVerifier>, Error> {
        let verifier = self.fetch(&self.pkce, state).await?;
        if verifier.is_some() {
            self.pkce.remove(state).await?;
        }
        Ok(verifier)
    }

    pub async fn save_tokens(&self, cache_key: &str, record: &CachedTokenRecord) -> Result<(), Error> {
        self.put(&self.tokens, cache_key, record).await
    }

    pub async fn load_tokens(&self, cache_key: &str) -> Result<Option<CachedTokenRecord>, Error> {
        self.fetch(&self.tokens, cache_key).await
    }

    pub async fn remove_tokens(&self, cache_key: &str) -> Result<(), Error> {
        self.guard.ensure_migration().await?;
        self.tokens.remove(cache_key).await
    }

    /// Cache keys that have a persisted token record.
    pub async fn token_keys(&self) -> Result<Vec<String>, Error> {
        self.guard.ensure_migration().await?;
        self.tokens.keys().await
    }

    async fn put<T: Serialize + ?Sized>(
        &self,
        namespace: &Namespaced,
        key: &str,
        value: &T,
    ) -> Result<(), Error> {
        self.guard.ensure_migration().await?;
        let json = serde_json::to_string(value).map_err(|e| Error {
            source: Some(Box::new(e)),
            error_kind: ErrorKind::Storage(StorageErrorKind::Serialization),
        })?;
        namespace.set(key, &json).await
    }

    /// Malformed entries are treated as absent and removed.
    async fn fetch<T: DeserializeOwned>(
        &self,
        namespace: &Namespaced,
        key: &str,
    ) -> Result<Option<T>, Error> {
        self.guard.ensure_migration().await?;
        let Some(raw) = namespace.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("Discarding malformed stored entry {}: {}", key, e);
                namespace.remove(key).await?;
                Ok(None)
            }
        }
    }
}
