//! Authorization request construction and grant initiation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use super::client_auth::ClientConfig;
use super::flow::{FlowKind, FlowVariant, ResponseMode, ScopeDefaults};
use super::pkce::PkcePair;
use super::response::{error_from_body, missing_field};
use super::state::{random_token, StateManager};
use crate::clock::{Clock, SystemClock};
use crate::error::{config_error, ConfigErrorKind, Error};
use crate::providers::Endpoints;
use crate::token::expiry_after;

/// Polling interval used when the server does not send one (RFC 8628 §3.2).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Everything the caller decides about one authorization attempt.
#[derive(Debug, Clone)]
pub struct AuthorizationRequestContext {
    pub environment_id: String,
    pub client: ClientConfig,
    pub redirect_uri: Option<String>,
    /// Requested scopes; empty means "use the flow defaults".
    pub scopes: Vec<String>,
    pub flow: FlowVariant,
    pub response_mode: Option<ResponseMode>,
    pub login_hint: Option<String>,
    pub prompt: Option<String>,
    pub extra_params: Vec<(String, String)>,
}

impl AuthorizationRequestContext {
    pub fn new(environment_id: &str, client: ClientConfig, flow: FlowVariant) -> Self {
        Self {
            environment_id: environment_id.to_string(),
            client,
            redirect_uri: None,
            scopes: Vec::new(),
            flow,
            response_mode: None,
            login_hint: None,
            prompt: None,
            extra_params: Vec::new(),
        }
    }

    pub fn with_redirect_uri(mut self, redirect_uri: &str) -> Self {
        self.redirect_uri = Some(redirect_uri.to_string());
        self
    }

    pub fn with_scopes(mut self, scopes: &[&str]) -> Self {
        self.scopes = scopes.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// A ready-to-visit authorization URL plus the per-attempt secrets behind it.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: Url,
    pub state: String,
    pub nonce: Option<String>,
    pub pkce: Option<PkcePair>,
    pub scopes: Vec<String>,
}

/// Device authorization grant started at the device authorization endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceGrantHandle {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub interval: Duration,
}

/// CIBA request accepted by the backchannel authentication endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct CibaGrantHandle {
    pub auth_req_id: String,
    pub expires_at: DateTime<Utc>,
    pub interval: Duration,
}

/// Redirectless (`pi.flow`) flow object returned by the authorization endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct RedirectlessGrantHandle {
    pub resume_url: String,
    pub flow_id: String,
    pub status: String,
    pub expires_at: DateTime<Utc>,
    pub interval: Duration,
}

/// Result of starting a redirectless flow. The verifier is needed again when
/// the code is exchanged after resume.
#[derive(Debug, Clone)]
pub struct RedirectlessStart {
    pub handle: RedirectlessGrantHandle,
    pub state: String,
    pub pkce: PkcePair,
    pub redirect_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceAuthorizationResponse {
    device_code: Option<String>,
    user_code: Option<String>,
    verification_uri: Option<String>,
    verification_uri_complete: Option<String>,
    expires_in: Option<i64>,
    interval: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BackchannelResponse {
    auth_req_id: Option<String>,
    expires_in: Option<i64>,
    interval: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FlowObject {
    pub id: Option<String>,
    pub status: Option<String>,
    pub resume_url: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(rename = "_links", default)]
    pub links: Option<FlowLinks>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FlowLinks {
    #[serde(rename = "self")]
    pub self_link: Option<FlowLink>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FlowLink {
    pub href: String,
}

/// Redirectless flows live for 30 minutes unless the server says otherwise.
const REDIRECTLESS_LIFETIME_SECS: i64 = 1800;

/// Builds authorization URLs and starts the grants that need a preliminary call.
#[derive(Clone)]
pub struct Builder {
    endpoints: Endpoints,
    http: reqwest::Client,
    scope_defaults: ScopeDefaults,
    states: Option<StateManager>,
    clock: Arc<dyn Clock>,
}

impl Builder {
    pub fn new(endpoints: Endpoints, http: reqwest::Client) -> Self {
        Self {
            endpoints,
            http,
            scope_defaults: ScopeDefaults::default(),
            states: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_scope_defaults(mut self, scope_defaults: ScopeDefaults) -> Self {
        self.scope_defaults = scope_defaults;
        self
    }

    /// Register every issued `state` so callbacks can be matched to their attempt.
    pub fn with_state_manager(mut self, states: StateManager) -> Self {
        self.states = Some(states);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Build the front-channel URL for code, implicit and hybrid flows.
    pub fn build(&self, ctx: &AuthorizationRequestContext) -> Result<AuthorizationRequest, Error> {
        let response_type = match &ctx.flow {
            FlowVariant::AuthorizationCode
            | FlowVariant::Implicit { .. }
            | FlowVariant::Hybrid { .. } => ctx.flow.response_type(),
            _ => None,
        }
        .ok_or_else(|| {
            config_error(
                ConfigErrorKind::InvalidValue("flow"),
                "only redirecting flows produce an authorization URL",
            )
        })?;
        self.validate(ctx, true)?;

        let scopes = self.scopes_for(ctx);
        let state = random_token()?;
        let nonce = if response_type.includes_id_token() || scopes.iter().any(|s| s == "openid") {
            Some(random_token()?)
        } else {
            None
        };
        let pkce = if response_type.includes_code() {
            Some(PkcePair::generate()?)
        } else {
            None
        };

        let mut url = self.authorization_url()?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", response_type.as_str())
                .append_pair("client_id", &ctx.client.client_id)
                .append_pair("redirect_uri", ctx.redirect_uri.as_deref().unwrap_or_default())
                .append_pair("scope", &scopes.join(" "))
                .append_pair("state", &state);
            if let Some(nonce) = &nonce {
                query.append_pair("nonce", nonce);
            }
            if let Some(pkce) = &pkce {
                query
                    .append_pair("code_challenge", pkce.challenge.as_str())
                    .append_pair("code_challenge_method", pkce.method.as_str());
            }
            if let Some(mode) = ctx.response_mode {
                query.append_pair("response_mode", mode.as_str());
            }
            append_common(&mut query, ctx);
        }

        if let Some(states) = &self.states {
            states.register(
                &state,
                ctx.flow.kind(),
                pkce.as_ref().map(|p| p.verifier.clone()),
                nonce.clone(),
                ctx.redirect_uri.clone(),
            );
        }

        debug!(
            "Built {} authorization request for client {}",
            ctx.flow.kind().as_str(),
            ctx.client.client_id
        );
        Ok(AuthorizationRequest {
            url,
            state,
            nonce,
            pkce,
            scopes,
        })
    }

    /// Start a device authorization grant (RFC 8628 §3.1).
    pub async fn start_device(&self, ctx: &AuthorizationRequestContext) -> Result<DeviceGrantHandle, Error> {
        self.expect_flow(ctx, FlowKind::DeviceCode)?;
        self.validate(ctx, false)?;

        let audience = &self.endpoints.device_authorization;
        let scopes = self.scopes_for(ctx);
        let auth = ctx.client.authenticate(audience, self.clock.now())?;
        let mut params: Vec<(&str, String)> = auth.params;
        params.push(("scope", scopes.join(" ")));

        let mut request = self.http.post(audience.as_str()).form(&params);
        if let Some(authorization) = auth.authorization {
            request = request.header(reqwest::header::AUTHORIZATION, authorization);
        }
        let body: DeviceAuthorizationResponse = self.send(request, ctx).await?;

        let device_code = body.device_code.ok_or_else(|| missing_field("device_code"))?;
        let user_code = body.user_code.ok_or_else(|| missing_field("user_code"))?;
        let verification_uri = body
            .verification_uri
            .ok_or_else(|| missing_field("verification_uri"))?;
        let expires_in = body.expires_in.ok_or_else(|| missing_field("expires_in"))?;

        info!("Device authorization started, user code {}", user_code);
        Ok(DeviceGrantHandle {
            device_code,
            user_code,
            verification_uri,
            verification_uri_complete: body.verification_uri_complete,
            expires_at: expiry_after(self.clock.now(), expires_in)?,
            interval: body
                .interval
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
        })
    }

    /// Start a client-initiated backchannel authentication request.
    pub async fn start_ciba(&self, ctx: &AuthorizationRequestContext) -> Result<CibaGrantHandle, Error> {
        let (login_hint, binding_message) = match &ctx.flow {
            FlowVariant::Ciba {
                login_hint,
                binding_message,
            } => (login_hint.clone(), binding_message.clone()),
            _ => {
                return Err(config_error(
                    ConfigErrorKind::InvalidValue("flow"),
                    "start_ciba needs a CIBA flow variant",
                ))
            }
        };
        self.validate(ctx, false)?;

        let audience = &self.endpoints.backchannel_authentication;
        let auth = ctx.client.authenticate(audience, self.clock.now())?;
        let mut params: Vec<(&str, String)> = auth.params;
        params.push(("scope", self.scopes_for(ctx).join(" ")));
        params.push(("login_hint", login_hint));
        if let Some(message) = binding_message {
            params.push(("binding_message", message));
        }

        let mut request = self.http.post(audience.as_str()).form(&params);
        if let Some(authorization) = auth.authorization {
            request = request.header(reqwest::header::AUTHORIZATION, authorization);
        }
        let body: BackchannelResponse = self.send(request, ctx).await?;

        let auth_req_id = body.auth_req_id.ok_or_else(|| missing_field("auth_req_id"))?;
        let expires_in = body.expires_in.ok_or_else(|| missing_field("expires_in"))?;
        debug!("Backchannel authentication request accepted");
        Ok(CibaGrantHandle {
            auth_req_id,
            expires_at: expiry_after(self.clock.now(), expires_in)?,
            interval: body
                .interval
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
        })
    }

    /// Start a redirectless flow: the authorization endpoint answers with a
    /// flow object instead of redirecting the browser.
    pub async fn start_redirectless(&self, ctx: &AuthorizationRequestContext) -> Result<RedirectlessStart, Error> {
        let response_type = match &ctx.flow {
            FlowVariant::Redirectless { response_type } => *response_type,
            _ => {
                return Err(config_error(
                    ConfigErrorKind::InvalidValue("flow"),
                    "start_redirectless needs a redirectless flow variant",
                ))
            }
        };
        self.validate(ctx, true)?;

        let scopes = self.scopes_for(ctx);
        let state = random_token()?;
        let pkce = PkcePair::generate()?;
        let mut params: Vec<(&str, String)> = vec![
            ("response_type", response_type.as_str().to_string()),
            ("response_mode", ResponseMode::PiFlow.as_str().to_string()),
            ("client_id", ctx.client.client_id.clone()),
            ("redirect_uri", ctx.redirect_uri.clone().unwrap_or_default()),
            ("scope", scopes.join(" ")),
            ("state", state.clone()),
            ("code_challenge", pkce.challenge.as_str().to_string()),
            ("code_challenge_method", pkce.method.as_str().to_string()),
        ];
        if let Some(hint) = &ctx.login_hint {
            params.push(("login_hint", hint.clone()));
        }
        for (name, value) in &ctx.extra_params {
            params.push((name.as_str(), value.clone()));
        }

        let request = self.http.post(self.endpoints.authorization.as_str()).form(&params);
        let body: FlowObject = self.send(request, ctx).await?;

        let flow_id = body.id.ok_or_else(|| missing_field("id"))?;
        let resume_url = body
            .resume_url
            .or_else(|| body.links.and_then(|l| l.self_link).map(|l| l.href))
            .unwrap_or_else(|| self.endpoints.flow_url(&flow_id));
        let expires_at = body.expires_at.unwrap_or_else(|| {
            self.clock.now() + chrono::Duration::seconds(REDIRECTLESS_LIFETIME_SECS)
        });

        if let Some(states) = &self.states {
            states.register(
                &state,
                FlowKind::Redirectless,
                Some(pkce.verifier.clone()),
                None,
                ctx.redirect_uri.clone(),
            );
        }

        Ok(RedirectlessStart {
            handle: RedirectlessGrantHandle {
                resume_url,
                flow_id,
                status: body.status.unwrap_or_default(),
                expires_at,
                interval: Duration::from_secs(2),
            },
            state,
            pkce,
            redirect_uri: ctx.redirect_uri.clone(),
        })
    }

    /// Requested scopes, or the flow defaults, with `openid` forced in for
    /// user-facing flows.
    fn scopes_for(&self, ctx: &AuthorizationRequestContext) -> Vec<String> {
        let kind = ctx.flow.kind();
        let mut scopes: Vec<String> = if ctx.scopes.is_empty() {
            self.scope_defaults.for_flow(kind).to_vec()
        } else {
            ctx.scopes.clone()
        };
        if kind.is_user_facing() && !scopes.iter().any(|s| s == "openid") {
            info!("Adding openid scope to {} request", kind.as_str());
            scopes.insert(0, "openid".to_string());
        }
        scopes
    }

    fn validate(&self, ctx: &AuthorizationRequestContext, needs_redirect: bool) -> Result<(), Error> {
        if ctx.environment_id.trim().is_empty() {
            return Err(config_error(
                ConfigErrorKind::MissingField("environment_id"),
                "an environment id is required",
            ));
        }
        if ctx.environment_id != self.endpoints.environment_id {
            return Err(config_error(
                ConfigErrorKind::InvalidValue("environment_id"),
                "request environment does not match the configured endpoints",
            ));
        }
        if ctx.client.client_id.trim().is_empty() {
            return Err(config_error(
                ConfigErrorKind::MissingField("client_id"),
                "a client id is required",
            ));
        }
        if needs_redirect && ctx.redirect_uri.as_deref().map_or(true, |r| r.trim().is_empty()) {
            return Err(config_error(
                ConfigErrorKind::MissingField("redirect_uri"),
                "redirecting flows need a redirect URI",
            ));
        }
        ctx.flow.validate()
    }

    fn expect_flow(&self, ctx: &AuthorizationRequestContext, kind: FlowKind) -> Result<(), Error> {
        if ctx.flow.kind() != kind {
            return Err(config_error(
                ConfigErrorKind::InvalidValue("flow"),
                "request flow does not match the started grant",
            ));
        }
        Ok(())
    }

    fn authorization_url(&self) -> Result<Url, Error> {
        Url::parse(&self.endpoints.authorization).map_err(|e| Error {
            source: Some(Box::new(e)),
            error_kind: crate::error::ErrorKind::Configuration(ConfigErrorKind::InvalidValue(
                "authorization_endpoint",
            )),
        })
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        ctx: &AuthorizationRequestContext,
    ) -> Result<T, Error> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(error_from_body(status.as_u16(), &body, ctx.client.auth_method));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

fn append_common(
    query: &mut url::form_urlencoded::Serializer<'_, url::UrlQuery<'_>>,
    ctx: &AuthorizationRequestContext,
) {
    if let Some(hint) = &ctx.login_hint {
        query.append_pair("login_hint", hint);
    }
    if let Some(prompt) = &ctx.prompt {
        query.append_pair("prompt", prompt);
    }
    for (name, value) in &ctx.extra_params {
        query.append_pair(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, OAuthErrorKind, ProtocolErrorKind};
    use crate::oauth::client_auth::ClientAuthMethod;
    use crate::oauth::flow::ResponseType;
    use std::collections::HashMap;

    fn builder(base: &str) -> Builder {
        let endpoints = Endpoints::from_base(base, "env").unwrap();
        Builder::new(endpoints, reqwest::Client::new())
    }

    fn query(url: &Url) -> HashMap<String, String> {
        url.query_pairs().into_owned().collect()
    }

    fn code_ctx() -> AuthorizationRequestContext {
        AuthorizationRequestContext::new(
            "env",
            ClientConfig::public("app"),
            FlowVariant::AuthorizationCode,
        )
        .with_redirect_uri("https://app.example/cb")
    }

    #[test]
    fn test_authorization_code_url() {
        let request = builder("https://auth.example").build(&code_ctx()).unwrap();
        let params = query(&request.url);

        assert_eq!(params["response_type"], "code");
        assert_eq!(params["client_id"], "app");
        assert_eq!(params["state"], request.state);
        assert_eq!(params["scope"], "openid profile email");
        assert_eq!(params["code_challenge_method"], "S256");

        let pkce = request.pkce.unwrap();
        assert!(PkcePair::verify(
            pkce.verifier.as_str(),
            &params["code_challenge"],
            pkce.method
        ));
        assert_eq!(params.get("nonce"), request.nonce.as_ref());
    }

    #[test]
    fn test_openid_injected_for_user_flows() {
        let ctx = code_ctx().with_scopes(&["profile"]);
        let request = builder("https://auth.example").build(&ctx).unwrap();
        assert_eq!(request.scopes, vec!["openid", "profile"]);
    }

    #[test]
    fn test_states_are_unique_per_attempt() {
        let builder = builder("https://auth.example");
        let first = builder.build(&code_ctx()).unwrap();
        let second = builder.build(&code_ctx()).unwrap();
        assert_ne!(first.state, second.state);
    }

    #[test]
    fn test_registers_state_with_manager() {
        let states = StateManager::new();
        let builder = builder("https://auth.example").with_state_manager(states.clone());
        let request = builder.build(&code_ctx()).unwrap();

        let attempt = states.validate(&request.state).unwrap();
        assert_eq!(attempt.pkce_verifier, request.pkce.map(|p| p.verifier));
    }

    #[test]
    fn test_implicit_has_nonce_and_no_pkce() {
        let mut ctx = code_ctx();
        ctx.flow = FlowVariant::Implicit {
            response_type: ResponseType::IdTokenToken,
        };
        let request = builder("https://auth.example").build(&ctx).unwrap();
        assert!(request.pkce.is_none());
        assert!(request.nonce.is_some());
        assert_eq!(query(&request.url)["response_type"], "id_token token");
    }

    #[test]
    fn test_missing_redirect_uri() {
        let mut ctx = code_ctx();
        ctx.redirect_uri = None;
        let err = builder("https://auth.example").build(&ctx).unwrap_err();
        assert_eq!(
            err.error_kind,
            ErrorKind::Configuration(ConfigErrorKind::MissingField("redirect_uri"))
        );
    }

    #[test]
    fn test_missing_environment_id() {
        let mut ctx = code_ctx();
        ctx.environment_id = String::new();
        let err = builder("https://auth.example").build(&ctx).unwrap_err();
        assert_eq!(
            err.error_kind,
            ErrorKind::Configuration(ConfigErrorKind::MissingField("environment_id"))
        );
    }

    #[test]
    fn test_device_flow_cannot_build_url() {
        let mut ctx = code_ctx();
        ctx.flow = FlowVariant::DeviceCode;
        assert!(builder("https://auth.example").build(&ctx).is_err());
    }

    fn device_ctx() -> AuthorizationRequestContext {
        AuthorizationRequestContext::new("env", ClientConfig::public("tv"), FlowVariant::DeviceCode)
    }

    #[tokio::test]
    async fn test_start_device() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/env/as/device_authorization")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("client_id".into(), "tv".into()),
                mockito::Matcher::UrlEncoded("scope".into(), "openid profile email".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"device_code":"dc","user_code":"WDJB-MJHT","verification_uri":"https://auth.example/device","expires_in":600}"#,
            )
            .create_async()
            .await;

        let handle = builder(&server.url()).start_device(&device_ctx()).await.unwrap();
        assert_eq!(handle.device_code, "dc");
        assert_eq!(handle.user_code, "WDJB-MJHT");
        assert_eq!(handle.interval, DEFAULT_POLL_INTERVAL);
        assert!(handle.expires_at > Utc::now());
    }

    #[tokio::test]
    async fn test_start_device_rejects_unusable_lifetime() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/env/as/device_authorization")
            .with_status(200)
            .with_body(
                r#"{"device_code":"dc","user_code":"U","verification_uri":"https://x","expires_in":9223372036854775807}"#,
            )
            .create_async()
            .await;

        let err = builder(&server.url())
            .start_device(&device_ctx())
            .await
            .unwrap_err();
        assert_eq!(
            err.error_kind,
            ErrorKind::Protocol(ProtocolErrorKind::MalformedResponse)
        );
    }

    #[tokio::test]
    async fn test_start_device_missing_user_code() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/env/as/device_authorization")
            .with_status(200)
            .with_body(r#"{"device_code":"dc","verification_uri":"https://x","expires_in":600}"#)
            .create_async()
            .await;

        let err = builder(&server.url())
            .start_device(&device_ctx())
            .await
            .unwrap_err();
        assert_eq!(
            err.error_kind,
            ErrorKind::Protocol(ProtocolErrorKind::MissingField("user_code"))
        );
    }

    #[tokio::test]
    async fn test_start_ciba() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/env/as/bc-authorize")
            .match_header("authorization", mockito::Matcher::Regex("^Basic ".into()))
            .match_body(mockito::Matcher::UrlEncoded(
                "login_hint".into(),
                "alice@example.com".into(),
            ))
            .with_status(200)
            .with_body(r#"{"auth_req_id":"req-1","expires_in":120,"interval":2}"#)
            .create_async()
            .await;

        let ctx = AuthorizationRequestContext::new(
            "env",
            ClientConfig::confidential("svc", "secret", ClientAuthMethod::ClientSecretBasic),
            FlowVariant::Ciba {
                login_hint: "alice@example.com".to_string(),
                binding_message: Some("1234".to_string()),
            },
        );
        let handle = builder(&server.url()).start_ciba(&ctx).await.unwrap();
        assert_eq!(handle.auth_req_id, "req-1");
        assert_eq!(handle.interval, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_start_ciba_denied() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/env/as/bc-authorize")
            .with_status(400)
            .with_body(r#"{"error":"access_denied"}"#)
            .create_async()
            .await;

        let ctx = AuthorizationRequestContext::new(
            "env",
            ClientConfig::confidential("svc", "secret", ClientAuthMethod::ClientSecretPost),
            FlowVariant::Ciba {
                login_hint: "bob".to_string(),
                binding_message: None,
            },
        );
        let err = builder(&server.url()).start_ciba(&ctx).await.unwrap_err();
        assert_eq!(err.error_kind, ErrorKind::OAuth(OAuthErrorKind::AccessDenied));
    }

    #[tokio::test]
    async fn test_start_redirectless() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/env/as/authorize")
            .match_body(mockito::Matcher::UrlEncoded(
                "response_mode".into(),
                "pi.flow".into(),
            ))
            .with_status(200)
            .with_body(r#"{"id":"flow-1","status":"USERNAME_PASSWORD_REQUIRED","resumeUrl":"https://auth.example/resume?flowId=flow-1"}"#)
            .create_async()
            .await;

        let mut ctx = code_ctx();
        ctx.flow = FlowVariant::Redirectless {
            response_type: ResponseType::Code,
        };
        let start = builder(&server.url()).start_redirectless(&ctx).await.unwrap();
        assert_eq!(start.handle.flow_id, "flow-1");
        assert_eq!(start.handle.status, "USERNAME_PASSWORD_REQUIRED");
        assert!(start.handle.resume_url.ends_with("flowId=flow-1"));
    }
}
