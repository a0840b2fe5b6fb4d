use config::Config;
use flow_auth::error::{token_error, Error, TokenErrorKind};
use flow_auth::http::HttpClientBuilder;
use flow_auth::oauth::{Builder, StateManager};
use flow_auth::polling::Coordinator;
use flow_auth::providers::discovery;
use flow_auth::storage::{
    FileStore, FlowStore, KeyValueStore, LegacyKey, LegacyKeyMigration, MigrationGuard,
    ValueCipher,
};
use flow_auth::token::{Exchanger, Grant, TokenCache, TokenEndpoint, TokenSet};
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;

pub mod config;
pub mod logging;

/// Cache key for client credentials (worker) tokens.
pub const WORKER_TOKEN_KEY: &str = "worker";

/// Where keys written by older versions live in the unified store.
pub fn legacy_keys() -> Vec<LegacyKey> {
    vec![
        LegacyKey::Exact {
            from: "pingone_worker_token".to_string(),
            to: format!("tokens:{WORKER_TOKEN_KEY}"),
        },
        LegacyKey::Prefix {
            from: "oauth_tokens_".to_string(),
            to: "tokens:".to_string(),
        },
        LegacyKey::Prefix {
            from: "flow_credentials_".to_string(),
            to: "credentials:".to_string(),
        },
        LegacyKey::Prefix {
            from: "oauth_pkce_".to_string(),
            to: "pkce:".to_string(),
        },
    ]
}

fn file_store(path: &Path, cipher: Option<&ValueCipher>) -> FileStore {
    let store = FileStore::new(path);
    match cipher {
        Some(cipher) => store.with_cipher(cipher.clone()),
        None => store,
    }
}

// Everything a command needs to drive a flow end to end
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub builder: Builder,
    pub exchanger: Arc<Exchanger>,
    pub cache: Arc<TokenCache>,
    pub flows: FlowStore,
    pub states: StateManager,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self, Error> {
        let http = HttpClientBuilder::with_config(config.http());
        let mut endpoints = config.endpoints()?;
        if config.discover {
            let metadata = discovery::fetch(&http.build_retrying()?, &endpoints.issuer).await?;
            if !metadata.supports_s256() {
                warn!("Authorization server does not advertise S256 PKCE");
            }
            endpoints = metadata.apply_to(endpoints);
            info!("Using discovered endpoints for issuer {}", endpoints.issuer);
        }
        let plain = http.build_plain()?;

        let cipher = config
            .store_encryption_key()
            .map(ValueCipher::from_hex)
            .transpose()?;
        let unified: Arc<dyn KeyValueStore> =
            Arc::new(file_store(&config.store_path, cipher.as_ref()));
        let guard = match &config.legacy_store_path {
            Some(legacy_path) => {
                let legacy: Arc<dyn KeyValueStore> =
                    Arc::new(file_store(legacy_path, cipher.as_ref()));
                MigrationGuard::new(Arc::new(LegacyKeyMigration::new(
                    legacy,
                    unified.clone(),
                    legacy_keys(),
                )))
            }
            None => MigrationGuard::noop(),
        };
        let flows = FlowStore::with_migration(unified, Arc::new(guard));

        let cache = TokenCache::new()
            .with_store(flows.clone())
            .with_ttl_percent(config.token_ttl_percent)?;
        let states = StateManager::new();
        let builder =
            Builder::new(endpoints.clone(), plain.clone()).with_state_manager(states.clone());
        let exchanger = Exchanger::new(endpoints, config.client()?, plain)
            .with_encoding(config.token_request_encoding());

        Ok(Self {
            config,
            builder,
            exchanger: Arc::new(exchanger),
            cache: Arc::new(cache),
            flows,
            states,
        })
    }

    pub fn coordinator(&self) -> Coordinator {
        match self.config.poll_timeout() {
            Some(timeout) => Coordinator::new().with_timeout(timeout),
            None => Coordinator::new(),
        }
    }

    /// A client credentials token, reused until it is due for refresh.
    pub async fn worker_token(&self) -> Result<TokenSet, Error> {
        let exchanger = self.exchanger.clone();
        let scopes = self.config.scopes.clone();
        self.cache
            .auto_refresh_if_needed(
                WORKER_TOKEN_KEY,
                |_| async move {
                    exchanger
                        .exchange(Grant::ClientCredentials { scopes })
                        .await?
                        .into_tokens()
                },
                self.cache.ttl_percent(),
            )
            .await
    }

    /// Tokens for `key`, refreshed with their refresh token once due.
    pub async fn tokens(&self, key: &str) -> Result<TokenSet, Error> {
        let exchanger = self.exchanger.clone();
        self.cache
            .auto_refresh_if_needed(
                key,
                |current| async move {
                    let refresh_token = current
                        .as_ref()
                        .and_then(|t| t.refresh_token_str())
                        .map(str::to_string)
                        .ok_or_else(|| {
                            token_error(
                                TokenErrorKind::NoRefreshToken,
                                "no refresh token cached for this flow",
                            )
                        })?;
                    let refreshed = exchanger
                        .exchange(Grant::RefreshToken {
                            refresh_token: refresh_token.clone(),
                            scopes: None,
                        })
                        .await?
                        .into_tokens()?;
                    // Servers that do not rotate refresh tokens omit them on refresh.
                    if refreshed.refresh_token.is_some() {
                        Ok(refreshed)
                    } else {
                        Ok::<_, Error>(refreshed.with_refresh_token(&refresh_token))
                    }
                },
                self.cache.ttl_percent(),
            )
            .await
    }
}
