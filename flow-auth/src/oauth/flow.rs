//! Flow variants, response types and default scopes.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{config_error, ConfigErrorKind, Error};

/// The flow families the engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    AuthorizationCode,
    Implicit,
    Hybrid,
    DeviceCode,
    Ciba,
    Redirectless,
    ClientCredentials,
}

impl FlowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowKind::AuthorizationCode => "authorization_code",
            FlowKind::Implicit => "implicit",
            FlowKind::Hybrid => "hybrid",
            FlowKind::DeviceCode => "device_code",
            FlowKind::Ciba => "ciba",
            FlowKind::Redirectless => "redirectless",
            FlowKind::ClientCredentials => "client_credentials",
        }
    }

    /// User-facing flows authenticate a person and therefore always carry `openid`.
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, FlowKind::ClientCredentials)
    }
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OAuth 2.0 / OIDC `response_type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseType {
    Code,
    Token,
    IdToken,
    IdTokenToken,
    CodeIdToken,
    CodeToken,
    CodeIdTokenToken,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Code => "code",
            ResponseType::Token => "token",
            ResponseType::IdToken => "id_token",
            ResponseType::IdTokenToken => "id_token token",
            ResponseType::CodeIdToken => "code id_token",
            ResponseType::CodeToken => "code token",
            ResponseType::CodeIdTokenToken => "code id_token token",
        }
    }

    pub fn includes_code(&self) -> bool {
        matches!(
            self,
            ResponseType::Code
                | ResponseType::CodeIdToken
                | ResponseType::CodeToken
                | ResponseType::CodeIdTokenToken
        )
    }

    /// Any response type returning an ID token needs a nonce.
    pub fn includes_id_token(&self) -> bool {
        matches!(
            self,
            ResponseType::IdToken
                | ResponseType::IdTokenToken
                | ResponseType::CodeIdToken
                | ResponseType::CodeIdTokenToken
        )
    }

    /// Default response mode: front-channel tokens travel in the fragment.
    pub fn default_mode(&self) -> ResponseMode {
        match self {
            ResponseType::Code => ResponseMode::Query,
            _ => ResponseMode::Fragment,
        }
    }
}

/// OAuth 2.0 `response_mode` values, including PingOne's redirectless `pi.flow`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseMode {
    Query,
    Fragment,
    FormPost,
    PiFlow,
}

impl ResponseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseMode::Query => "query",
            ResponseMode::Fragment => "fragment",
            ResponseMode::FormPost => "form_post",
            ResponseMode::PiFlow => "pi.flow",
        }
    }
}

/// Per-flow request shape. Each variant carries only what that flow needs.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowVariant {
    AuthorizationCode,
    Implicit {
        response_type: ResponseType,
    },
    Hybrid {
        response_type: ResponseType,
    },
    DeviceCode,
    Ciba {
        login_hint: String,
        binding_message: Option<String>,
    },
    Redirectless {
        response_type: ResponseType,
    },
    ClientCredentials,
}

impl FlowVariant {
    pub fn kind(&self) -> FlowKind {
        match self {
            FlowVariant::AuthorizationCode => FlowKind::AuthorizationCode,
            FlowVariant::Implicit { .. } => FlowKind::Implicit,
            FlowVariant::Hybrid { .. } => FlowKind::Hybrid,
            FlowVariant::DeviceCode => FlowKind::DeviceCode,
            FlowVariant::Ciba { .. } => FlowKind::Ciba,
            FlowVariant::Redirectless { .. } => FlowKind::Redirectless,
            FlowVariant::ClientCredentials => FlowKind::ClientCredentials,
        }
    }

    /// The `response_type` sent to the authorization endpoint, if the flow uses one.
    pub fn response_type(&self) -> Option<ResponseType> {
        match self {
            FlowVariant::AuthorizationCode => Some(ResponseType::Code),
            FlowVariant::Implicit { response_type }
            | FlowVariant::Hybrid { response_type }
            | FlowVariant::Redirectless { response_type } => Some(*response_type),
            FlowVariant::DeviceCode | FlowVariant::Ciba { .. } | FlowVariant::ClientCredentials => {
                None
            }
        }
    }

    /// Reject response types that do not belong to the chosen flow.
    pub fn validate(&self) -> Result<(), Error> {
        match self {
            FlowVariant::Implicit { response_type } if response_type.includes_code() => {
                Err(config_error(
                    ConfigErrorKind::InvalidValue("response_type"),
                    "implicit flows must not request an authorization code",
                ))
            }
            FlowVariant::Hybrid { response_type }
                if !response_type.includes_code() || *response_type == ResponseType::Code =>
            {
                Err(config_error(
                    ConfigErrorKind::InvalidValue("response_type"),
                    "hybrid flows need `code` plus at least one token type",
                ))
            }
            FlowVariant::Ciba { login_hint, .. } if login_hint.trim().is_empty() => {
                Err(config_error(
                    ConfigErrorKind::MissingField("login_hint"),
                    "CIBA requests need a login hint identifying the user",
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Flow-keyed default scopes, applied when the caller supplies none.
#[derive(Debug, Clone)]
pub struct ScopeDefaults {
    defaults: HashMap<FlowKind, Vec<String>>,
}

impl ScopeDefaults {
    /// An empty table: no flow gets default scopes beyond the `openid` injection.
    pub fn empty() -> Self {
        Self {
            defaults: HashMap::new(),
        }
    }

    /// Override the defaults for one flow.
    pub fn with(mut self, kind: FlowKind, scopes: &[&str]) -> Self {
        self.defaults
            .insert(kind, scopes.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn for_flow(&self, kind: FlowKind) -> &[String] {
        self.defaults.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl Default for ScopeDefaults {
    fn default() -> Self {
        let user = ["openid", "profile", "email"];
        Self::empty()
            .with(FlowKind::AuthorizationCode, &user)
            .with(FlowKind::Implicit, &user)
            .with(FlowKind::Hybrid, &user)
            .with(FlowKind::DeviceCode, &user)
            .with(FlowKind::Ciba, &user)
            .with(FlowKind::Redirectless, &user)
            .with(FlowKind::ClientCredentials, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_credentials_is_machine_flow() {
        assert!(!FlowKind::ClientCredentials.is_user_facing());
        assert!(FlowKind::DeviceCode.is_user_facing());
    }

    #[test]
    fn test_implicit_rejects_code() {
        let variant = FlowVariant::Implicit {
            response_type: ResponseType::CodeIdToken,
        };
        assert!(variant.validate().is_err());

        let variant = FlowVariant::Implicit {
            response_type: ResponseType::IdTokenToken,
        };
        assert!(variant.validate().is_ok());
    }

    #[test]
    fn test_hybrid_requires_code_and_token() {
        let variant = FlowVariant::Hybrid {
            response_type: ResponseType::Code,
        };
        assert!(variant.validate().is_err());

        let variant = FlowVariant::Hybrid {
            response_type: ResponseType::CodeIdToken,
        };
        assert!(variant.validate().is_ok());
    }

    #[test]
    fn test_default_scopes_are_flow_keyed() {
        let defaults = ScopeDefaults::default();
        assert_eq!(defaults.for_flow(FlowKind::AuthorizationCode), ["openid", "profile", "email"]);
        assert!(defaults.for_flow(FlowKind::ClientCredentials).is_empty());
    }

    #[test]
    fn test_response_type_strings() {
        assert_eq!(ResponseType::CodeIdTokenToken.as_str(), "code id_token token");
        assert_eq!(ResponseMode::PiFlow.as_str(), "pi.flow");
    }
}
