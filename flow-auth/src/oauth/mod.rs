//! OAuth 2.0 / OpenID Connect front half: everything up to the token endpoint.
//!
//! PKCE pairs, per-attempt `state` tracking, client authentication and the
//! authorization request builder that starts each flow.

pub mod callback;
mod client_auth;
mod flow;
mod pkce;
pub mod request;
pub mod response;
mod state;

pub use client_auth::{
    basic_header, ClientAuthMethod, ClientAuthMethodParseError, ClientAuthentication,
    ClientConfig, CLIENT_ASSERTION_TYPE,
};
pub use flow::{FlowKind, FlowVariant, ResponseMode, ResponseType, ScopeDefaults};
pub use pkce::{is_valid_verifier, ChallengeMethod, PkceChallenge, PkcePair, PkceVerifier};
pub use request::{
    AuthorizationRequest, AuthorizationRequestContext, Builder, CibaGrantHandle,
    DeviceGrantHandle, RedirectlessGrantHandle, RedirectlessStart,
};
pub use state::{random_token, PendingAttempt, StateManager};
