//! Tokens: types, the exchange engine and the refresh-aware cache.

pub mod cache;
mod exchange;
mod id_token;
mod tokens;

pub use cache::{
    should_refresh, CacheStats, CachedTokenRecord, Freshness, TokenCache, DEFAULT_TTL_PERCENT,
};
pub use exchange::{
    ExchangeOutcome, Exchanger, Grant, PasswordChange, TokenEndpoint, TokenRequestEncoding,
};
pub use id_token::IdTokenClaims;
pub use tokens::{TokenResponse, TokenSet};

pub(crate) use tokens::{expiry_after, optional_secret_string};
