//! Token exchange engine.
//!
//! Turns a [`Grant`] into tokens at the token endpoint, authenticating the client
//! with its configured method. One call issues at most one token request; retry
//! policy lives in the polling coordinator and the caller, never here, because a
//! replayed code or device grant is not idempotent.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, LOCATION};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use super::id_token::IdTokenClaims;
use super::tokens::{TokenResponse, TokenSet};
use crate::clock::{Clock, SystemClock};
use crate::error::{oauth_error, Error, ErrorKind, OAuthErrorKind, ProtocolErrorKind};
use crate::oauth::request::FlowObject;
use crate::oauth::response::{
    classify, error_from_body, missing_field, parse_error_body, requires_password_change,
};
use crate::oauth::{callback, ClientConfig, PkceVerifier};
use crate::providers::Endpoints;

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const CIBA_GRANT: &str = "urn:openid:params:grant-type:ciba";

/// Grant presented to the token endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum Grant {
    AuthorizationCode {
        code: String,
        code_verifier: Option<PkceVerifier>,
        redirect_uri: String,
    },
    RefreshToken {
        refresh_token: String,
        scopes: Option<Vec<String>>,
    },
    DeviceCode {
        device_code: String,
    },
    Ciba {
        auth_req_id: String,
    },
    /// Worker token for the client itself.
    ClientCredentials {
        scopes: Vec<String>,
    },
    /// Resume a redirectless flow; the code it yields is exchanged in the same call.
    /// `state` is the value sent when the flow started and must come back unchanged.
    RedirectlessResume {
        resume_url: String,
        flow_id: String,
        state: String,
        code_verifier: Option<PkceVerifier>,
        redirect_uri: Option<String>,
    },
}

impl Grant {
    pub fn grant_type(&self) -> &'static str {
        match self {
            Grant::AuthorizationCode { .. } | Grant::RedirectlessResume { .. } => {
                "authorization_code"
            }
            Grant::RefreshToken { .. } => "refresh_token",
            Grant::DeviceCode { .. } => DEVICE_CODE_GRANT,
            Grant::Ciba { .. } => CIBA_GRANT,
            Grant::ClientCredentials { .. } => "client_credentials",
        }
    }
}

/// Wire encoding of token endpoint requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenRequestEncoding {
    #[default]
    Form,
    Json,
}

/// Details handed back when the user must change their password first.
#[derive(Debug, Clone, Default)]
pub struct PasswordChange {
    /// Limited token the password-change UI may use, if the server issued one.
    pub access_token: Option<SecretString>,
    pub id_token: Option<SecretString>,
    pub flow_id: Option<String>,
    pub resume_url: Option<String>,
    pub description: Option<String>,
}

/// Result of a successful token request.
#[derive(Debug, Clone)]
pub enum ExchangeOutcome {
    Tokens(TokenSet),
    PasswordChangeRequired(PasswordChange),
}

impl ExchangeOutcome {
    pub fn into_tokens(self) -> Result<TokenSet, Error> {
        match self {
            ExchangeOutcome::Tokens(tokens) => Ok(tokens),
            ExchangeOutcome::PasswordChangeRequired(change) => Err(oauth_error(
                OAuthErrorKind::PasswordChangeRequired,
                change
                    .description
                    .as_deref()
                    .unwrap_or("the user must change their password"),
            )),
        }
    }
}

/// Anything that can redeem a grant for tokens.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn exchange(&self, grant: Grant) -> Result<ExchangeOutcome, Error>;
}

#[derive(Debug, Deserialize)]
struct ResumeResponse {
    #[serde(rename = "authorizeResponse")]
    authorize_response: Option<ResumeCode>,
}

#[derive(Debug, Deserialize)]
struct ResumeCode {
    code: Option<String>,
    state: Option<String>,
}

/// Token endpoint client for one registered client.
#[derive(Clone)]
pub struct Exchanger {
    endpoints: Endpoints,
    client: ClientConfig,
    http: reqwest::Client,
    encoding: TokenRequestEncoding,
    clock: Arc<dyn Clock>,
}

impl Exchanger {
    pub fn new(endpoints: Endpoints, client: ClientConfig, http: reqwest::Client) -> Self {
        Self {
            endpoints,
            client,
            http,
            encoding: TokenRequestEncoding::Form,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_encoding(mut self, encoding: TokenRequestEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn client(&self) -> &ClientConfig {
        &self.client
    }

    /// Revoke an access or refresh token (RFC 7009).
    pub async fn revoke(&self, token: &str, token_type_hint: Option<&str>) -> Result<(), Error> {
        let audience = &self.endpoints.revocation;
        let auth = self.client.authenticate(audience, self.clock.now())?;

        let mut params = auth.params;
        params.push(("token", token.to_string()));
        if let Some(hint) = token_type_hint {
            params.push(("token_type_hint", hint.to_string()));
        }

        let mut request = self.http.post(audience.as_str()).form(&params);
        if let Some(authorization) = auth.authorization {
            request = request.header(AUTHORIZATION, authorization);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            debug!("Token revoked");
            return Ok(());
        }
        let body = response.text().await?;
        Err(error_from_body(status.as_u16(), &body, self.client.auth_method))
    }

    fn grant_params(grant: &Grant) -> Vec<(&'static str, String)> {
        let mut params = vec![("grant_type", grant.grant_type().to_string())];
        match grant {
            Grant::AuthorizationCode {
                code,
                code_verifier,
                redirect_uri,
            } => {
                params.push(("code", code.clone()));
                params.push(("redirect_uri", redirect_uri.clone()));
                if let Some(verifier) = code_verifier {
                    params.push(("code_verifier", verifier.as_str().to_string()));
                }
            }
            Grant::RefreshToken {
                refresh_token,
                scopes,
            } => {
                params.push(("refresh_token", refresh_token.clone()));
                if let Some(scopes) = scopes.as_ref().filter(|s| !s.is_empty()) {
                    params.push(("scope", scopes.join(" ")));
                }
            }
            Grant::DeviceCode { device_code } => {
                params.push(("device_code", device_code.clone()));
            }
            Grant::Ciba { auth_req_id } => {
                params.push(("auth_req_id", auth_req_id.clone()));
            }
            Grant::ClientCredentials { scopes } => {
                if !scopes.is_empty() {
                    params.push(("scope", scopes.join(" ")));
                }
            }
            // Resolved into an authorization code grant before reaching here.
            Grant::RedirectlessResume { .. } => {}
        }
        params
    }

    async fn request_tokens(&self, grant: &Grant) -> Result<ExchangeOutcome, Error> {
        let audience = &self.endpoints.token;
        // Fails before any request when the client is misconfigured.
        let auth = self.client.authenticate(audience, self.clock.now())?;

        let mut params = Self::grant_params(grant);
        params.extend(auth.params);

        let mut request = self.http.post(audience.as_str());
        request = match self.encoding {
            TokenRequestEncoding::Form => request.form(&params),
            TokenRequestEncoding::Json => {
                let body: serde_json::Map<String, serde_json::Value> = params
                    .into_iter()
                    .map(|(name, value)| (name.to_string(), serde_json::Value::String(value)))
                    .collect();
                request.json(&body)
            }
        };
        if let Some(authorization) = auth.authorization {
            request = request.header(AUTHORIZATION, authorization);
        }

        debug!("Requesting tokens with grant type {}", grant.grant_type());
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        let now = self.clock.now();

        if !status.is_success() {
            let error = parse_error_body(status.as_u16(), &body)?;
            if requires_password_change(&error) {
                info!("Token endpoint reports a required password change");
                return Ok(ExchangeOutcome::PasswordChangeRequired(PasswordChange {
                    access_token: string_field(&error.extra, "access_token").map(SecretString::new),
                    id_token: string_field(&error.extra, "id_token").map(SecretString::new),
                    flow_id: string_field(&error.extra, "flowId"),
                    resume_url: string_field(&error.extra, "resumeUrl"),
                    description: error.error_description.clone(),
                }));
            }
            return Err(classify(error, self.client.auth_method));
        }

        let tokens = serde_json::from_str::<TokenResponse>(&body)?.into_token_set(now)?;
        if let Some(id_token) = &tokens.id_token {
            match IdTokenClaims::decode_unverified(id_token.expose_secret()) {
                Ok(claims) if claims.requires_password_change() => {
                    info!("ID token carries a password change requirement");
                    return Ok(ExchangeOutcome::PasswordChangeRequired(PasswordChange {
                        access_token: Some(tokens.access_token.clone()),
                        id_token: Some(id_token.clone()),
                        ..PasswordChange::default()
                    }));
                }
                Ok(_) => {}
                Err(e) => warn!("Could not inspect id_token claims: {}", e),
            }
        }
        Ok(ExchangeOutcome::Tokens(tokens))
    }

    /// Check a redirectless flow and, once completed, redeem its code.
    async fn resume(
        &self,
        resume_url: &str,
        flow_id: &str,
        state: &str,
        code_verifier: Option<PkceVerifier>,
        redirect_uri: Option<String>,
    ) -> Result<ExchangeOutcome, Error> {
        let response = self.http.get(self.endpoints.flow_url(flow_id)).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(error_from_body(status.as_u16(), &body, self.client.auth_method));
        }
        let flow: FlowObject = serde_json::from_str(&body)?;
        let flow_status = flow.status.unwrap_or_default();
        debug!("Redirectless flow {} is {}", flow_id, flow_status);

        match flow_status.as_str() {
            "COMPLETED" => {}
            "MUST_CHANGE_PASSWORD" => {
                return Ok(ExchangeOutcome::PasswordChangeRequired(PasswordChange {
                    flow_id: Some(flow_id.to_string()),
                    resume_url: Some(resume_url.to_string()),
                    ..PasswordChange::default()
                }))
            }
            "FAILED" | "DENIED" => {
                return Err(oauth_error(OAuthErrorKind::AccessDenied, "redirectless flow failed"))
            }
            "EXPIRED" => {
                return Err(oauth_error(OAuthErrorKind::ExpiredToken, "redirectless flow expired"))
            }
            _ => {
                return Err(oauth_error(
                    OAuthErrorKind::AuthorizationPending,
                    "redirectless flow is still waiting on the user",
                ))
            }
        }

        let code = self.resume_code(resume_url, state).await?;
        self.request_tokens(&Grant::AuthorizationCode {
            code,
            code_verifier,
            redirect_uri: redirect_uri.unwrap_or_default(),
        })
        .await
    }

    /// The resume endpoint answers either with a redirect to the callback URL or
    /// with the authorize response as JSON.
    async fn resume_code(&self, resume_url: &str, expected_state: &str) -> Result<String, Error> {
        let response = self.http.get(resume_url).send().await?;
        let status = response.status();

        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| missing_field("location"))?;
            let url = Url::parse(location).map_err(|e| Error {
                source: Some(Box::new(e)),
                error_kind: ErrorKind::Protocol(ProtocolErrorKind::MalformedResponse),
            })?;
            let params = callback::parse(&url, expected_state)?;
            return params.code.ok_or_else(|| missing_field("code"));
        }

        let body = response.text().await?;
        if !status.is_success() {
            return Err(error_from_body(status.as_u16(), &body, self.client.auth_method));
        }
        let resumed: ResumeResponse = serde_json::from_str(&body)?;
        let authorize = resumed
            .authorize_response
            .ok_or_else(|| missing_field("authorizeResponse"))?;
        if authorize.state.as_deref() != Some(expected_state) {
            return Err(oauth_error(
                OAuthErrorKind::StateMismatch,
                "resumed flow returned a state that was not issued for it",
            ));
        }
        authorize.code.ok_or_else(|| missing_field("code"))
    }
}

#[async_trait]
impl TokenEndpoint for Exchanger {
    async fn exchange(&self, grant: Grant) -> Result<ExchangeOutcome, Error> {
        match grant {
            Grant::RedirectlessResume {
                resume_url,
                flow_id,
                state,
                code_verifier,
                redirect_uri,
            } => {
                self.resume(&resume_url, &flow_id, &state, code_verifier, redirect_uri)
                    .await
            }
            grant => self.request_tokens(&grant).await,
        }
    }
}

fn string_field(extra: &serde_json::Map<String, serde_json::Value>, name: &str) -> Option<String> {
    extra.get(name).and_then(|v| v.as_str()).map(str::to_string)
}
