//! Unverified ID token inspection.
//!
//! The engine only reads hints out of the ID token (nonce, password-change
//! flags). Signature validation belongs to the relying party.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::Deserialize;

use crate::error::{protocol_error, Error, ErrorKind, ProtocolErrorKind};

const PASSWORD_CHANGE_CLAIMS: [&str; 2] = ["password_change_required", "must_change_password"];

#[derive(Debug, Clone, Deserialize)]
pub struct IdTokenClaims {
    pub iss: Option<String>,
    pub sub: Option<String>,
    pub nonce: Option<String>,
    pub exp: Option<i64>,
    pub iat: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl IdTokenClaims {
    /// Decode the payload segment without checking the signature.
    pub fn decode_unverified(id_token: &str) -> Result<Self, Error> {
        let payload = id_token.split('.').nth(1).ok_or_else(|| {
            protocol_error(
                ProtocolErrorKind::MalformedResponse,
                "id_token is not a compact JWS",
            )
        })?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| Error {
                source: Some(Box::new(e)),
                error_kind: ErrorKind::Protocol(ProtocolErrorKind::MalformedResponse),
            })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn requires_password_change(&self) -> bool {
        PASSWORD_CHANGE_CLAIMS.iter().any(|claim| {
            self.extra
                .get(*claim)
                .and_then(|value| value.as_bool())
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
pub(crate) fn unsigned_id_token(claims: serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_claims() {
        let token = unsigned_id_token(serde_json::json!({"sub": "u1", "nonce": "n1"}));
        let claims = IdTokenClaims::decode_unverified(&token).unwrap();
        assert_eq!(claims.sub.as_deref(), Some("u1"));
        assert_eq!(claims.nonce.as_deref(), Some("n1"));
        assert!(!claims.requires_password_change());
    }

    #[test]
    fn test_password_change_claim() {
        let token = unsigned_id_token(serde_json::json!({"sub": "u1", "must_change_password": true}));
        let claims = IdTokenClaims::decode_unverified(&token).unwrap();
        assert!(claims.requires_password_change());
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(IdTokenClaims::decode_unverified("not-a-jwt").is_err());
        assert!(IdTokenClaims::decode_unverified("a.!!!.c").is_err());
    }
}
