//! Pre-shared token authenticator
//! Mission: one static token, compared without leaking timing information

use subtle::ConstantTimeEq;

/// Header carrying the token, checked before falling back to
/// `Authorization: Bearer`.
const TOKEN_HEADER: &str = "x-sysmon-token";

#[derive(Clone)]
pub struct TokenAuthenticator {
    token: String,
}

impl TokenAuthenticator {
    pub fn new(token: impl Into<String>) -> Self {
        TokenAuthenticator { token: token.into() }
    }

    /// Constant-time comparison against the configured token. Length
    /// differences are not short-circuited before the comparison.
    pub fn validate(&self, provided: &str) -> bool {
        let expected = self.token.as_bytes();
        let given = provided.as_bytes();

        if expected.len() != given.len() {
            // Still run a comparison of equal length so this branch costs
            // roughly the same as the equal-length case.
            let filler = vec![0u8; expected.len()];
            let _ = filler.ct_eq(expected);
            return false;
        }

        expected.ct_eq(given).into()
    }

    pub fn extract_from_headers(headers: &axum::http::HeaderMap) -> Option<String> {
        if let Some(token) = headers
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            return Some(token.to_string());
        }

        headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "))
            .map(|t| t.to_string())
    }
}
