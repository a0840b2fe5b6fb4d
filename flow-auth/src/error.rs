//! Error types for the `flow-auth` crate.
//!
//! Follows the same pattern as the service layers: a root `Error` struct holding an
//! error kind tree plus an optional source for chaining. OAuth error objects returned
//! by the authorization server are kept as the `source` so the RFC error code and
//! description stay available for display.

use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::oauth::ClientAuthMethod;

/// Top-level error type for the flow-auth crate.
/// Holds error kind and optional source for error chaining.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

/// Major categories of errors in flow-auth.
#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    Configuration(ConfigErrorKind),
    Protocol(ProtocolErrorKind),
    OAuth(OAuthErrorKind),
    Token(TokenErrorKind),
    Storage(StorageErrorKind),
    Crypto(CryptoErrorKind),
    Http(HttpErrorKind),
}

/// Missing or invalid local setup. Never retried.
#[derive(Debug, PartialEq)]
pub enum ConfigErrorKind {
    MissingField(&'static str),
    InvalidValue(&'static str),
}

/// The server answered, but not with something this crate can use.
#[derive(Debug, PartialEq)]
pub enum ProtocolErrorKind {
    MissingField(&'static str),
    MalformedResponse,
    UnexpectedStatus(u16),
}

/// Errors defined by the OAuth 2.0 / OIDC protocols.
#[derive(Debug, PartialEq)]
pub enum OAuthErrorKind {
    InvalidClient(ClientAuthDiagnostic),
    StateMismatch,
    AuthorizationPending,
    SlowDown,
    AccessDenied,
    ExpiredToken,
    GrantAlreadyConsumed,
    InvalidGrant,
    InvalidRequest,
    /// `server_error` or `temporarily_unavailable`; worth another attempt.
    TemporarilyUnavailable,
    /// The user must change their password before tokens are issued.
    PasswordChangeRequired,
    Server(String),
}

/// Points at the client authentication setting that does not line up.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientAuthDiagnostic {
    /// The method needs a client secret but none is configured.
    MissingClientSecret { method: ClientAuthMethod },
    /// `private_key_jwt` without a PEM signing key.
    MissingSigningKey,
    /// The signing key could not be parsed for the configured method.
    UnusableSigningKey { method: ClientAuthMethod },
    /// The authorization server rejected the client with `invalid_client`.
    RejectedByServer { method: ClientAuthMethod },
}

/// Errors from token handling and the token cache.
#[derive(Debug, PartialEq)]
pub enum TokenErrorKind {
    NotFound,
    Expired,
    NoRefreshToken,
    Refresh,
}

/// Errors from key-value storage and migration.
#[derive(Debug, PartialEq)]
pub enum StorageErrorKind {
    Io,
    Serialization,
    EncryptionFailed,
    DecryptionFailed,
    WriteNotConfirmed,
    MigrationFailed,
}

/// Errors from cryptographic primitives.
#[derive(Debug, PartialEq)]
pub enum CryptoErrorKind {
    RandomUnavailable,
    AssertionSigning,
}

/// Errors from HTTP client operations.
#[derive(Debug, PartialEq)]
pub enum HttpErrorKind {
    BuilderFailed,
    RequestFailed,
    Network,
    Timeout,
    /// A 5xx answer without an OAuth error object.
    ServerUnavailable(u16),
}

/// OAuth error object as returned by the token, device and backchannel endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_uri: Option<String>,
    /// HTTP status the error arrived with. Not part of the wire format.
    #[serde(skip)]
    pub status: Option<u16>,
    /// Vendor extensions (PingOne `details`, `id`, partial token material).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl OAuthErrorResponse {
    pub fn new(error: &str, description: Option<&str>) -> Self {
        Self {
            error: error.to_string(),
            error_description: description.map(str::to_string),
            error_uri: None,
            status: None,
            extra: serde_json::Map::new(),
        }
    }
}

impl fmt::Display for OAuthErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error_description {
            Some(description) => write!(f, "{}: {}", self.error, description),
            None => write!(f, "{}", self.error),
        }
    }
}

impl StdError for OAuthErrorResponse {}

impl Error {
    /// Transient failures are worth another polling tick; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.error_kind,
            ErrorKind::Http(HttpErrorKind::Network)
                | ErrorKind::Http(HttpErrorKind::Timeout)
                | ErrorKind::Http(HttpErrorKind::RequestFailed)
                | ErrorKind::Http(HttpErrorKind::ServerUnavailable(_))
                | ErrorKind::OAuth(OAuthErrorKind::TemporarilyUnavailable)
        )
    }

    /// The OAuth error object that caused this error, if the server sent one.
    pub fn oauth_response(&self) -> Option<&OAuthErrorResponse> {
        self.source
            .as_ref()
            .and_then(|source| source.downcast_ref::<OAuthErrorResponse>())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error_kind {
            ErrorKind::Configuration(kind) => write!(f, "Configuration error: {:?}", kind)?,
            ErrorKind::Protocol(kind) => write!(f, "Protocol violation: {:?}", kind)?,
            ErrorKind::OAuth(kind) => write!(f, "OAuth error: {:?}", kind)?,
            ErrorKind::Token(kind) => write!(f, "Token error: {:?}", kind)?,
            ErrorKind::Storage(kind) => write!(f, "Storage error: {:?}", kind)?,
            ErrorKind::Crypto(kind) => write!(f, "Crypto error: {:?}", kind)?,
            ErrorKind::Http(kind) => write!(f, "HTTP error: {:?}", kind)?,
        }
        if let Some(source) = &self.source {
            write!(f, " ({})", source)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let error_kind = if err.is_builder() {
            ErrorKind::Http(HttpErrorKind::BuilderFailed)
        } else if err.is_timeout() {
            ErrorKind::Http(HttpErrorKind::Timeout)
        } else if err.is_decode() {
            ErrorKind::Protocol(ProtocolErrorKind::MalformedResponse)
        } else if err.is_request() {
            ErrorKind::Http(HttpErrorKind::RequestFailed)
        } else {
            ErrorKind::Http(HttpErrorKind::Network)
        };

        Error {
            source: Some(Box::new(err)),
            error_kind,
        }
    }
}

impl From<reqwest_middleware::Error> for Error {
    fn from(err: reqwest_middleware::Error) -> Self {
        match err {
            reqwest_middleware::Error::Reqwest(err) => err.into(),
            other => Error {
                source: Some(Box::new(other)),
                error_kind: ErrorKind::Http(HttpErrorKind::Network),
            },
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Protocol(ProtocolErrorKind::MalformedResponse),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Storage(StorageErrorKind::Io),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Crypto(CryptoErrorKind::AssertionSigning),
        }
    }
}

/// Helper function to create configuration errors.
pub fn config_error(kind: ConfigErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Configuration(kind),
    }
}

/// Helper function to create protocol violation errors.
pub fn protocol_error(kind: ProtocolErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Protocol(kind),
    }
}

/// Helper function to create OAuth errors.
pub fn oauth_error(kind: OAuthErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::OAuth(kind),
    }
}

/// Helper function to create token errors.
pub fn token_error(kind: TokenErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Token(kind),
    }
}

/// Helper function to create storage errors.
pub fn storage_error(kind: StorageErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Storage(kind),
    }
}

/// Helper function to create crypto errors.
pub fn crypto_error(kind: CryptoErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Crypto(kind),
    }
}

/// Helper function to create client authentication errors.
pub fn invalid_client(diagnostic: ClientAuthDiagnostic, message: &str) -> Error {
    oauth_error(OAuthErrorKind::InvalidClient(diagnostic), message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_errors_are_transient() {
        let err = Error {
            source: None,
            error_kind: ErrorKind::Http(HttpErrorKind::Network),
        };
        assert!(err.is_transient());

        let err = protocol_error(ProtocolErrorKind::MalformedResponse, "bad json");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_server_side_outages_are_transient() {
        let err = Error {
            source: None,
            error_kind: ErrorKind::Http(HttpErrorKind::ServerUnavailable(503)),
        };
        assert!(err.is_transient());

        let err = oauth_error(OAuthErrorKind::TemporarilyUnavailable, "try later");
        assert!(err.is_transient());

        let err = oauth_error(OAuthErrorKind::AccessDenied, "no");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_oauth_response_is_recoverable_from_source() {
        let response = OAuthErrorResponse::new("access_denied", Some("user said no"));
        let err = Error {
            source: Some(Box::new(response.clone())),
            error_kind: ErrorKind::OAuth(OAuthErrorKind::AccessDenied),
        };

        assert_eq!(err.oauth_response(), Some(&response));
        assert!(err.to_string().contains("access_denied: user said no"));
    }

    #[test]
    fn test_oauth_response_keeps_vendor_fields() {
        let body = r#"{"error":"invalid_grant","error_description":"used","id":"abc"}"#;
        let response: OAuthErrorResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.error, "invalid_grant");
        assert_eq!(response.extra.get("id").and_then(|v| v.as_str()), Some("abc"));
    }
}
