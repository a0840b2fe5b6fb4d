//! Redirect callback parsing for code, implicit and hybrid flows.

use std::collections::HashMap;

use url::Url;

use super::client_auth::ClientAuthMethod;
use crate::error::{
    oauth_error, ClientAuthDiagnostic, Error, ErrorKind, OAuthErrorKind, OAuthErrorResponse,
};

/// Parameters returned to the redirect URI, from the query or the fragment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallbackParams {
    pub state: String,
    pub code: Option<String>,
    pub access_token: Option<String>,
    pub token_type: Option<String>,
    pub expires_in: Option<i64>,
    pub id_token: Option<String>,
    pub scope: Option<String>,
}

/// Collect callback parameters. Fragment values win over query values, since
/// front-channel tokens are always delivered in the fragment.
fn collect(url: &Url) -> HashMap<String, String> {
    let mut params: HashMap<String, String> = url.query_pairs().into_owned().collect();
    if let Some(fragment) = url.fragment() {
        params.extend(url::form_urlencoded::parse(fragment.as_bytes()).into_owned());
    }
    params
}

/// The `state` echoed by the authorization server, if any.
pub fn extract_state(url: &Url) -> Option<String> {
    collect(url).remove("state")
}

/// Parse a callback URL and check that it echoes `expected_state` exactly.
///
/// An `error` parameter is mapped into the OAuth error taxonomy; the state is
/// checked first so a forged error response cannot bypass CSRF protection.
pub fn parse(url: &Url, expected_state: &str) -> Result<CallbackParams, Error> {
    let mut params = collect(url);

    let state = params.remove("state").unwrap_or_default();
    if state.is_empty() || state != expected_state {
        return Err(oauth_error(
            OAuthErrorKind::StateMismatch,
            "returned state does not match the issued state",
        ));
    }

    if let Some(error) = params.remove("error") {
        let description = params.get("error_description").map(String::as_str);
        let response = OAuthErrorResponse::new(&error, description);
        let kind = match error.as_str() {
            "access_denied" => OAuthErrorKind::AccessDenied,
            "invalid_request" => OAuthErrorKind::InvalidRequest,
            "invalid_client" | "unauthorized_client" => {
                OAuthErrorKind::InvalidClient(ClientAuthDiagnostic::RejectedByServer {
                    method: ClientAuthMethod::None,
                })
            }
            "server_error" | "temporarily_unavailable" => OAuthErrorKind::TemporarilyUnavailable,
            other => OAuthErrorKind::Server(other.to_string()),
        };
        return Err(Error {
            source: Some(Box::new(response)),
            error_kind: ErrorKind::OAuth(kind),
        });
    }

    Ok(CallbackParams {
        state,
        code: params.remove("code"),
        access_token: params.remove("access_token"),
        token_type: params.remove("token_type"),
        expires_in: params.get("expires_in").and_then(|v| v.parse().ok()),
        id_token: params.remove("id_token"),
        scope: params.remove("scope"),
    })
}
