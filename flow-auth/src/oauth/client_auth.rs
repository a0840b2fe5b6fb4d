//! Client authentication at the token endpoint.
//!
//! Every method is checked locally before a request is built, so a client that
//! is misconfigured for its method fails with a diagnostic naming the missing
//! setting instead of an opaque `invalid_client` from the server.

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::state::random_token;
use crate::error::{config_error, invalid_client, ClientAuthDiagnostic, ConfigErrorKind, Error};

pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Client assertions are valid for five minutes.
const ASSERTION_LIFETIME_SECS: i64 = 300;

/// Token endpoint authentication method (RFC 6749 §2.3, OIDC Core §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    /// Public client: only `client_id` is sent.
    None,
    #[default]
    ClientSecretPost,
    ClientSecretBasic,
    ClientSecretJwt,
    PrivateKeyJwt,
}

impl ClientAuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientAuthMethod::None => "none",
            ClientAuthMethod::ClientSecretPost => "client_secret_post",
            ClientAuthMethod::ClientSecretBasic => "client_secret_basic",
            ClientAuthMethod::ClientSecretJwt => "client_secret_jwt",
            ClientAuthMethod::PrivateKeyJwt => "private_key_jwt",
        }
    }
}

impl fmt::Display for ClientAuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ClientAuthMethodParseError(String);

impl fmt::Display for ClientAuthMethodParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unknown client authentication method `{}`", self.0)
    }
}

impl std::error::Error for ClientAuthMethodParseError {}

impl FromStr for ClientAuthMethod {
    type Err = ClientAuthMethodParseError;

    fn from_str(method: &str) -> Result<Self, Self::Err> {
        match method.to_lowercase().as_str() {
            "none" => Ok(ClientAuthMethod::None),
            "client_secret_post" | "post" => Ok(ClientAuthMethod::ClientSecretPost),
            "client_secret_basic" | "basic" => Ok(ClientAuthMethod::ClientSecretBasic),
            "client_secret_jwt" => Ok(ClientAuthMethod::ClientSecretJwt),
            "private_key_jwt" => Ok(ClientAuthMethod::PrivateKeyJwt),
            other => Err(ClientAuthMethodParseError(other.to_string())),
        }
    }
}

/// Registered client and how it proves its identity.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub client_id: String,
    pub client_secret: Option<SecretString>,
    pub auth_method: ClientAuthMethod,
    /// PEM-encoded RSA private key for `private_key_jwt`.
    pub signing_key: Option<SecretString>,
    /// `kid` header for `private_key_jwt` assertions.
    pub key_id: Option<String>,
}

impl ClientConfig {
    /// A public client authenticating with `client_id` only.
    pub fn public(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            client_secret: None,
            auth_method: ClientAuthMethod::None,
            signing_key: None,
            key_id: None,
        }
    }

    /// A confidential client using one of the shared-secret methods.
    pub fn confidential(client_id: &str, client_secret: &str, auth_method: ClientAuthMethod) -> Self {
        Self {
            client_id: client_id.to_string(),
            client_secret: Some(SecretString::new(client_secret.to_string())),
            auth_method,
            signing_key: None,
            key_id: None,
        }
    }

    pub fn with_signing_key(mut self, pem: &str, key_id: Option<&str>) -> Self {
        self.signing_key = Some(SecretString::new(pem.to_string()));
        self.key_id = key_id.map(str::to_string);
        self
    }

    fn secret(&self) -> Option<&str> {
        self.client_secret
            .as_ref()
            .map(|s| s.expose_secret().as_str())
            .filter(|s| !s.is_empty())
    }

    /// Check that the configured method has the material it needs.
    pub fn validate(&self) -> Result<(), Error> {
        if self.client_id.trim().is_empty() {
            return Err(config_error(
                ConfigErrorKind::MissingField("client_id"),
                "a client id is required",
            ));
        }

        match self.auth_method {
            ClientAuthMethod::None => Ok(()),
            method @ (ClientAuthMethod::ClientSecretPost
            | ClientAuthMethod::ClientSecretBasic
            | ClientAuthMethod::ClientSecretJwt) => {
                if self.secret().is_none() {
                    return Err(invalid_client(
                        ClientAuthDiagnostic::MissingClientSecret { method },
                        "the configured client authentication method needs a client secret",
                    ));
                }
                Ok(())
            }
            ClientAuthMethod::PrivateKeyJwt => {
                let pem = self.signing_key.as_ref().ok_or_else(|| {
                    invalid_client(
                        ClientAuthDiagnostic::MissingSigningKey,
                        "private_key_jwt needs a PEM private key",
                    )
                })?;
                rsa_key(pem.expose_secret()).map(|_| ())
            }
        }
    }

    /// Produce the header and body parameters that authenticate this client at
    /// `audience` (the token or revocation endpoint).
    pub fn authenticate(&self, audience: &str, now: DateTime<Utc>) -> Result<ClientAuthentication, Error> {
        self.validate()?;

        let mut auth = ClientAuthentication::default();
        match self.auth_method {
            ClientAuthMethod::None => {
                auth.params.push(("client_id", self.client_id.clone()));
            }
            ClientAuthMethod::ClientSecretPost => {
                auth.params.push(("client_id", self.client_id.clone()));
                auth.params
                    .push(("client_secret", self.secret().unwrap_or_default().to_string()));
            }
            ClientAuthMethod::ClientSecretBasic => {
                auth.authorization = Some(basic_header(
                    &self.client_id,
                    self.secret().unwrap_or_default(),
                ));
            }
            ClientAuthMethod::ClientSecretJwt => {
                let key = EncodingKey::from_secret(self.secret().unwrap_or_default().as_bytes());
                let assertion = self.sign(Header::new(Algorithm::HS256), &key, audience, now)?;
                auth.push_assertion(&self.client_id, assertion);
            }
            ClientAuthMethod::PrivateKeyJwt => {
                let pem = self
                    .signing_key
                    .as_ref()
                    .map(|k| k.expose_secret().as_str())
                    .unwrap_or_default();
                let key = rsa_key(pem)?;
                let mut header = Header::new(Algorithm::RS256);
                header.kid = self.key_id.clone();
                let assertion = self.sign(header, &key, audience, now)?;
                auth.push_assertion(&self.client_id, assertion);
            }
        }
        Ok(auth)
    }

    fn sign(
        &self,
        header: Header,
        key: &EncodingKey,
        audience: &str,
        now: DateTime<Utc>,
    ) -> Result<String, Error> {
        let iat = now.timestamp();
        let claims = AssertionClaims {
            iss: self.client_id.clone(),
            sub: self.client_id.clone(),
            aud: audience.to_string(),
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
            jti: random_token()?,
        };
        Ok(encode(&header, &claims, key)?)
    }
}

/// Credentials to attach to one token endpoint request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientAuthentication {
    /// Value for the `Authorization` header.
    pub authorization: Option<String>,
    /// Parameters to add to the request body.
    pub params: Vec<(&'static str, String)>,
}

impl ClientAuthentication {
    fn push_assertion(&mut self, client_id: &str, assertion: String) {
        self.params.push(("client_id", client_id.to_string()));
        self.params
            .push(("client_assertion_type", CLIENT_ASSERTION_TYPE.to_string()));
        self.params.push(("client_assertion", assertion));
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AssertionClaims {
    iss: String,
    sub: String,
    aud: String,
    iat: i64,
    exp: i64,
    jti: String,
}

/// Basic credentials per RFC 6749 §2.3.1: both parts are form-urlencoded first.
pub fn basic_header(client_id: &str, client_secret: &str) -> String {
    let credentials = format!(
        "{}:{}",
        urlencoding::encode(client_id),
        urlencoding::encode(client_secret)
    );
    format!("Basic {}", STANDARD.encode(credentials))
}

fn rsa_key(pem: &str) -> Result<EncodingKey, Error> {
    EncodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| {
        let mut err = invalid_client(
            ClientAuthDiagnostic::UnusableSigningKey {
                method: ClientAuthMethod::PrivateKeyJwt,
            },
            "the signing key is not a PEM-encoded RSA private key",
        );
        err.source = Some(Box::new(e));
        err
    })
}
