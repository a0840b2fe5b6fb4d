//! Token types.

use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::{protocol_error, Error, ProtocolErrorKind};
use crate::oauth::response::missing_field;

/// `issued_at + expires_in`, or `None` when the lifetime is negative or out of range.
pub(crate) fn checked_expiry(issued_at: DateTime<Utc>, expires_in: i64) -> Option<DateTime<Utc>> {
    if expires_in < 0 {
        return None;
    }
    Duration::try_seconds(expires_in).and_then(|lifetime| issued_at.checked_add_signed(lifetime))
}

/// Expiry of a server-announced lifetime. Unusable values are a protocol violation.
pub(crate) fn expiry_after(now: DateTime<Utc>, expires_in: i64) -> Result<DateTime<Utc>, Error> {
    checked_expiry(now, expires_in).ok_or_else(|| {
        protocol_error(
            ProtocolErrorKind::MalformedResponse,
            "expires_in is negative or out of range",
        )
    })
}

/// Tokens issued by the token endpoint.
///
/// `issued_at` and `expires_at` are computed locally from `expires_in` when the
/// response arrives; an absolute expiry asserted by the server is never used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    #[serde(with = "secret_string")]
    pub access_token: SecretString,
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default, with = "optional_secret_string")]
    pub refresh_token: Option<SecretString>,
    #[serde(default, with = "optional_secret_string")]
    pub id_token: Option<SecretString>,
    #[serde(default)]
    pub scope: Option<String>,
    pub issued_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenSet {
    /// Tokens issued at `issued_at`, expiring `expires_in` seconds later.
    /// An unusable `expires_in` leaves the expiry unknown.
    pub fn new(access_token: &str, expires_in: Option<i64>, issued_at: DateTime<Utc>) -> Self {
        Self {
            access_token: SecretString::new(access_token.to_string()),
            token_type: "Bearer".to_string(),
            expires_in,
            refresh_token: None,
            id_token: None,
            scope: None,
            issued_at,
            expires_at: expires_in.and_then(|secs| checked_expiry(issued_at, secs)),
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: &str) -> Self {
        self.refresh_token = Some(SecretString::new(refresh_token.to_string()));
        self
    }

    pub fn with_id_token(mut self, id_token: &str) -> Self {
        self.id_token = Some(SecretString::new(id_token.to_string()));
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|expires| now >= expires).unwrap_or(false)
    }

    /// Total lifetime from issue to expiry, if the server sent `expires_in`.
    pub fn lifetime(&self) -> Option<Duration> {
        self.expires_at.map(|expires| expires - self.issued_at)
    }

    /// Granted scopes, split on whitespace.
    pub fn scopes(&self) -> Vec<&str> {
        self.scope
            .as_deref()
            .map(|s| s.split_whitespace().collect())
            .unwrap_or_default()
    }

    pub fn refresh_token_str(&self) -> Option<&str> {
        self.refresh_token.as_ref().map(|t| t.expose_secret().as_str())
    }
}

/// Successful token endpoint response as sent on the wire.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Stamp the response with the local clock.
    pub fn into_token_set(self, now: DateTime<Utc>) -> Result<TokenSet, Error> {
        let access_token = self
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| missing_field("access_token"))?;

        let expires_at = self
            .expires_in
            .map(|secs| expiry_after(now, secs))
            .transpose()?;

        Ok(TokenSet {
            access_token: SecretString::new(access_token),
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_in: self.expires_in,
            refresh_token: self.refresh_token.map(SecretString::new),
            id_token: self.id_token.map(SecretString::new),
            scope: self.scope,
            issued_at: now,
            expires_at,
        })
    }
}

// `SecretString` does not implement `Serialize`; persisted records need the raw value.
pub(crate) mod secret_string {
    use secrecy::{ExposeSecret, SecretString};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(secret.expose_secret())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SecretString, D::Error> {
        String::deserialize(deserializer).map(SecretString::new)
    }
}

pub(crate) mod optional_secret_string {
    use secrecy::{ExposeSecret, SecretString};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        secret: &Option<SecretString>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match secret {
            Some(secret) => serializer.serialize_some(secret.expose_secret()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<SecretString>, D::Error> {
        Option::<String>::deserialize(deserializer).map(|value| value.map(SecretString::new))
    }
}
