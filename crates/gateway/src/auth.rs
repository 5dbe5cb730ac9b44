//! Boundary to the external authentication middleware.
//!
//! The hub does not own authentication; a deployment wires a
//! [`TokenVerifier`] that fronts its real middleware. With no verifier
//! configured, upgrades are admitted (development mode).

use {async_trait::async_trait, axum::http::HeaderMap};

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Whether the presented bearer token is valid.
    async fn verify(&self, token: &str) -> bool;
}

/// Extract the bearer token from the `Authorization` header.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer sometoken".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers), Some("sometoken"));
    }

    #[test]
    fn rejects_missing_or_malformed_header() {
        assert_eq!(bearer_token(&HeaderMap::new()), None);

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Basic dXNlcjpwdw==".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers), None);

        headers.insert(axum::http::header::AUTHORIZATION, "Bearer ".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}
