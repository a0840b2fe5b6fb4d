//! Mapping of authorization server error bodies onto the error tree.

use tracing::debug;

use super::client_auth::ClientAuthMethod;
use crate::error::{
    protocol_error, ClientAuthDiagnostic, Error, ErrorKind, HttpErrorKind, OAuthErrorKind,
    OAuthErrorResponse, ProtocolErrorKind,
};

/// Error codes and PingOne detail codes that mean the user must change their password.
const PASSWORD_CHANGE_ERRORS: [&str; 2] = ["password_change_required", "must_change_password"];
const PASSWORD_CHANGE_DETAIL: &str = "PASSWORD_MUST_CHANGE";

/// Parse an error body. Non-JSON bodies become a protocol error carrying the status,
/// or a transient HTTP error when the server itself failed.
pub fn parse_error_body(status: u16, body: &str) -> Result<OAuthErrorResponse, Error> {
    let mut response: OAuthErrorResponse = serde_json::from_str(body).map_err(|e| {
        debug!("Unparseable error body with status {}: {}", status, body);
        let error_kind = if status >= 500 {
            ErrorKind::Http(HttpErrorKind::ServerUnavailable(status))
        } else {
            ErrorKind::Protocol(ProtocolErrorKind::UnexpectedStatus(status))
        };
        Error {
            source: Some(Box::new(e)),
            error_kind,
        }
    })?;
    response.status = Some(status);
    Ok(response)
}

/// Whether a structured error says the user must change their password first.
pub fn requires_password_change(response: &OAuthErrorResponse) -> bool {
    if PASSWORD_CHANGE_ERRORS.contains(&response.error.as_str()) {
        return true;
    }
    response
        .extra
        .get("details")
        .and_then(|details| details.as_array())
        .map(|details| {
            details.iter().any(|detail| {
                detail.get("code").and_then(|code| code.as_str()) == Some(PASSWORD_CHANGE_DETAIL)
            })
        })
        .unwrap_or(false)
}

/// Classify an OAuth error object. The response is kept as the error source.
pub fn classify(response: OAuthErrorResponse, method: ClientAuthMethod) -> Error {
    let kind = match response.error.as_str() {
        "authorization_pending" => OAuthErrorKind::AuthorizationPending,
        "slow_down" => OAuthErrorKind::SlowDown,
        "access_denied" => OAuthErrorKind::AccessDenied,
        "expired_token" => OAuthErrorKind::ExpiredToken,
        "invalid_client" | "unauthorized_client" => {
            OAuthErrorKind::InvalidClient(ClientAuthDiagnostic::RejectedByServer { method })
        }
        "invalid_grant" if mentions_reuse(&response) => OAuthErrorKind::GrantAlreadyConsumed,
        "invalid_grant" => OAuthErrorKind::InvalidGrant,
        "invalid_request" => OAuthErrorKind::InvalidRequest,
        "server_error" | "temporarily_unavailable" => OAuthErrorKind::TemporarilyUnavailable,
        other => OAuthErrorKind::Server(other.to_string()),
    };
    Error {
        source: Some(Box::new(response)),
        error_kind: ErrorKind::OAuth(kind),
    }
}

/// Turn a non-success response into an error.
pub fn error_from_body(status: u16, body: &str, method: ClientAuthMethod) -> Error {
    match parse_error_body(status, body) {
        Ok(response) => classify(response, method),
        Err(err) => err,
    }
}

pub fn missing_field(field: &'static str) -> Error {
    protocol_error(
        ProtocolErrorKind::MissingField(field),
        "authorization server response is missing a required field",
    )
}

fn mentions_reuse(response: &OAuthErrorResponse) -> bool {
    response
        .error_description
        .as_deref()
        .map(|description| {
            let description = description.to_lowercase();
            ["already been used", "already used", "consumed", "redeemed"]
                .iter()
                .any(|needle| description.contains(needle))
        })
        .unwrap_or(false)
}
