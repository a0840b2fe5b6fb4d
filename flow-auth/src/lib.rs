//! # flow-auth
//!
//! OAuth 2.0 / OpenID Connect flow orchestration and token lifecycle:
//! - Authorization request building (authorization code, implicit, hybrid, device,
//!   CIBA and redirectless flows) with PKCE, state and nonce
//! - Token exchange for every grant, including client authentication
//! - Polling for device, CIBA and redirectless grants
//! - A token cache with proactive refresh
//! - Unified flow storage with a one-shot legacy key migration
//!
//! ## Usage
//!
//! ```rust,ignore
//! use flow_auth::{
//!     oauth::{AuthorizationRequestContext, Builder, ClientConfig, FlowVariant},
//!     polling::{Coordinator, GrantPoll, Pollable},
//!     token::{Exchanger, TokenCache},
//! };
//! ```

pub mod clock;
pub mod error;
pub mod http;
pub mod oauth;
pub mod polling;
pub mod providers;
pub mod storage;
pub mod token;

// Re-export commonly used types
pub use error::{Error, ErrorKind};
