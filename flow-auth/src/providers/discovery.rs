//! OpenID Connect discovery.

use serde::Deserialize;
use tracing::debug;

use super::Endpoints;
use crate::error::{protocol_error, Error, ProtocolErrorKind};
use crate::http::AuthenticatedClient;

/// Subset of the discovery document the engine uses.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub device_authorization_endpoint: Option<String>,
    #[serde(default)]
    pub backchannel_authentication_endpoint: Option<String>,
    #[serde(default)]
    pub revocation_endpoint: Option<String>,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
    #[serde(default)]
    pub token_endpoint_auth_methods_supported: Vec<String>,
}

impl ProviderMetadata {
    /// Overlay discovered URLs onto endpoints derived from the environment layout.
    pub fn apply_to(&self, mut endpoints: Endpoints) -> Endpoints {
        endpoints.issuer = self.issuer.clone();
        endpoints.authorization = self.authorization_endpoint.clone();
        endpoints.token = self.token_endpoint.clone();
        if let Some(url) = &self.device_authorization_endpoint {
            endpoints.device_authorization = url.clone();
        }
        if let Some(url) = &self.backchannel_authentication_endpoint {
            endpoints.backchannel_authentication = url.clone();
        }
        if let Some(url) = &self.revocation_endpoint {
            endpoints.revocation = url.clone();
        }
        if let Some(url) = &self.userinfo_endpoint {
            endpoints.userinfo = url.clone();
        }
        endpoints
    }

    /// Whether the server advertises S256 PKCE. An empty list means "not advertised".
    pub fn supports_s256(&self) -> bool {
        self.code_challenge_methods_supported.is_empty()
            || self
                .code_challenge_methods_supported
                .iter()
                .any(|m| m == "S256")
    }
}

/// Fetch `{issuer}/.well-known/openid-configuration`.
///
/// Uses the retrying client: the document is static and the GET is idempotent.
pub async fn fetch(client: &AuthenticatedClient, issuer: &str) -> Result<ProviderMetadata, Error> {
    let url = format!(
        "{}/.well-known/openid-configuration",
        issuer.trim_end_matches('/')
    );
    debug!("Fetching discovery document from {}", url);

    let response = client.get(&url).send().await?;
    if !response.status().is_success() {
        let status = response.status().as_u16();
        return Err(protocol_error(
            ProtocolErrorKind::UnexpectedStatus(status),
            "discovery document could not be loaded",
        ));
    }

    let metadata: ProviderMetadata = response.json().await?;
    if metadata.issuer.trim_end_matches('/') != issuer.trim_end_matches('/') {
        return Err(protocol_error(
            ProtocolErrorKind::MalformedResponse,
            "discovery issuer does not match the requested issuer",
        ));
    }
    Ok(metadata)
}
