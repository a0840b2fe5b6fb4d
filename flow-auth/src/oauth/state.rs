//! CSRF state management for OAuth flows.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::warn;
use url::Url;

use super::callback::{self, CallbackParams};
use super::flow::FlowKind;
use super::pkce::PkceVerifier;
use crate::error::{oauth_error, CryptoErrorKind, Error, ErrorKind, OAuthErrorKind};

/// Data kept for an authorization attempt between redirect and callback.
#[derive(Debug, Clone)]
pub struct PendingAttempt {
    /// Flow that issued the state.
    pub flow: FlowKind,
    /// PKCE verifier if PKCE was used.
    pub pkce_verifier: Option<PkceVerifier>,
    /// Nonce sent with OIDC requests.
    pub nonce: Option<String>,
    /// Redirect URI the code is bound to.
    pub redirect_uri: Option<String>,
    /// When this state expires.
    pub expires_at: DateTime<Utc>,
}

/// Manager for OAuth state parameters with expiration.
///
/// Each state is single-use: validation removes it, so a replayed callback or a
/// second exchange of the same code is rejected here before reaching the server.
#[derive(Clone)]
pub struct StateManager {
    states: Arc<DashMap<String, PendingAttempt>>,
    ttl: Duration,
}

impl StateManager {
    /// Create a new state manager with default TTL of 10 minutes.
    pub fn new() -> Self {
        Self::with_ttl(Duration::minutes(10))
    }

    /// Create a new state manager with custom TTL.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            states: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Remember an issued state and the attempt it belongs to.
    pub fn register(
        &self,
        state: &str,
        flow: FlowKind,
        pkce_verifier: Option<PkceVerifier>,
        nonce: Option<String>,
        redirect_uri: Option<String>,
    ) {
        let attempt = PendingAttempt {
            flow,
            pkce_verifier,
            nonce,
            redirect_uri,
            expires_at: Utc::now() + self.ttl,
        };
        self.states.insert(state.to_string(), attempt);
    }

    /// Validate and consume a state token.
    ///
    /// Unknown, expired and already-consumed states are all a `StateMismatch`.
    pub fn validate(&self, state: &str) -> Result<PendingAttempt, Error> {
        let (_, attempt) = self.states.remove(state).ok_or_else(|| {
            warn!("Rejected callback with unknown or reused state");
            oauth_error(OAuthErrorKind::StateMismatch, "state was not issued by this client")
        })?;

        if Utc::now() > attempt.expires_at {
            warn!("Rejected callback with expired state");
            return Err(oauth_error(OAuthErrorKind::StateMismatch, "state has expired"));
        }

        Ok(attempt)
    }

    /// Parse a redirect callback and match its state against a registered attempt.
    pub fn resolve_callback(&self, url: &Url) -> Result<(CallbackParams, PendingAttempt), Error> {
        let returned_state = callback::extract_state(url).ok_or_else(|| {
            oauth_error(OAuthErrorKind::StateMismatch, "callback carries no state")
        })?;
        let attempt = self.validate(&returned_state)?;
        let params = callback::parse(url, &returned_state)?;
        Ok((params, attempt))
    }

    /// Clean up expired states.
    pub fn cleanup_expired(&self) {
        let now = Utc::now();
        self.states.retain(|_, attempt| attempt.expires_at > now);
    }

    /// Number of attempts currently in flight.
    pub fn pending(&self) -> usize {
        self.states.len()
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a cryptographically random token for `state`, `nonce` or `jti`.
pub fn random_token() -> Result<String, Error> {
    let mut random_bytes = [0u8; 32];
    OsRng.try_fill_bytes(&mut random_bytes).map_err(|e| Error {
        source: Some(Box::new(e)),
        error_kind: ErrorKind::Crypto(CryptoErrorKind::RandomUnavailable),
    })?;
    Ok(hex::encode(random_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_token() {
        let state = random_token().unwrap();
        assert_eq!(state.len(), 64); // 32 bytes hex encoded
        assert_ne!(state, random_token().unwrap());
    }

    #[test]
    fn test_validate_state() {
        let manager = StateManager::new();
        let verifier = PkceVerifier::from_string("verifier".to_string());
        manager.register("s1", FlowKind::AuthorizationCode, Some(verifier.clone()), None, None);

        let attempt = manager.validate("s1").unwrap();
        assert_eq!(attempt.pkce_verifier, Some(verifier));
        assert_eq!(attempt.flow, FlowKind::AuthorizationCode);
    }

    #[test]
    fn test_validate_invalid_state() {
        let manager = StateManager::new();
        let err = manager.validate("invalid_state").unwrap_err();
        assert_eq!(err.error_kind, ErrorKind::OAuth(OAuthErrorKind::StateMismatch));
    }

    #[test]
    fn test_state_consumed_after_validation() {
        let manager = StateManager::new();
        manager.register("s1", FlowKind::Implicit, None, Some("n".to_string()), None);

        assert!(manager.validate("s1").is_ok());
        assert!(manager.validate("s1").is_err());
    }

    #[test]
    fn test_expired_state() {
        let manager = StateManager::with_ttl(Duration::seconds(-1));
        manager.register("s1", FlowKind::AuthorizationCode, None, None, None);

        assert!(manager.validate("s1").is_err());
    }

    #[test]
    fn test_cleanup_expired() {
        let manager = StateManager::with_ttl(Duration::seconds(-1));
        manager.register("s1", FlowKind::AuthorizationCode, None, None, None);
        manager.cleanup_expired();
        assert_eq!(manager.pending(), 0);
    }

    #[test]
    fn test_resolve_callback_matches_registered_state() {
        let manager = StateManager::new();
        manager.register("abc", FlowKind::AuthorizationCode, None, None, None);

        let url = Url::parse("https://app.example/callback?code=xyz&state=abc").unwrap();
        let (params, attempt) = manager.resolve_callback(&url).unwrap();
        assert_eq!(params.code.as_deref(), Some("xyz"));
        assert_eq!(attempt.flow, FlowKind::AuthorizationCode);

        // replay is rejected
        assert!(manager.resolve_callback(&url).is_err());
    }

    #[test]
    fn test_resolve_callback_rejects_foreign_state() {
        let manager = StateManager::new();
        manager.register("abc", FlowKind::AuthorizationCode, None, None, None);

        let url = Url::parse("https://app.example/callback?code=xyz&state=evil").unwrap();
        let err = manager.resolve_callback(&url).unwrap_err();
        assert_eq!(err.error_kind, ErrorKind::OAuth(OAuthErrorKind::StateMismatch));
        assert_eq!(manager.pending(), 1);
    }
}
