//! Bearer-token extraction and the HTTP-upgrade rejection mapping (§6).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

const BEARER_PREFIX: &str = "Bearer ";

/// Extracts the bearer token from an `x-authorization` header value
/// (preferred) or a `token` query parameter (fallback, used only when the
/// header is absent or empty — scenario 8).
pub fn extract_token(header_value: Option<&str>, query_token: Option<&str>) -> Option<String> {
    if let Some(header) = header_value {
        if let Some(token) = header.strip_prefix(BEARER_PREFIX).filter(|t| !t.is_empty()) {
            return Some(token.to_string());
        }
    }
    query_token.filter(|t| !t.is_empty()).map(str::to_string)
}

/// The HTTP-upgrade rejection taxonomy (§6), mapped to the specified
/// status code and body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeRejection {
    InvalidToken,
    MissingToken,
    AccountDisabled,
    Unauthenticated,
    RateLimit,
}

impl IntoResponse for UpgradeRejection {
    fn into_response(self) -> Response {
        match self {
            UpgradeRejection::InvalidToken => {
                (StatusCode::UNAUTHORIZED, "Invalid token").into_response()
            }
            UpgradeRejection::MissingToken => {
                (StatusCode::UNAUTHORIZED, "Missing token").into_response()
            }
            UpgradeRejection::AccountDisabled => {
                (StatusCode::FORBIDDEN, "The account is disabled").into_response()
            }
            UpgradeRejection::Unauthenticated => {
                (StatusCode::FORBIDDEN, "Forbidden").into_response()
            }
            UpgradeRejection::RateLimit => (
                StatusCode::SERVICE_UNAVAILABLE,
                [("retry-after", "1")],
                "Service Unavailable",
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_bearer_token_takes_precedence_over_query_param() {
        let token = extract_token(Some("Bearer H"), Some("P"));

        assert_eq!(token.as_deref(), Some("H"));
    }

    #[test]
    fn empty_header_falls_back_to_query_param() {
        let token = extract_token(Some(""), Some("P"));

        assert_eq!(token.as_deref(), Some("P"));
    }

    #[test]
    fn neither_header_nor_query_yields_none() {
        assert_eq!(extract_token(None, None), None);
    }

    #[test]
    fn non_bearer_header_falls_back_to_query_param() {
        let token = extract_token(Some("Basic xyz"), Some("P"));

        assert_eq!(token.as_deref(), Some("P"));
    }
}
