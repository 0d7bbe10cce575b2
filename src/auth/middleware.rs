//! Authentication extractor
//!
//! Protects routes that act on behalf of the local owner.

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{HeaderMap, request::Parts},
};

use crate::AppState;
use crate::error::AppError;

fn extract_token_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Compare two tokens without short-circuiting on the first differing byte
pub fn tokens_match(presented: &str, expected: &str) -> bool {
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Extractor for the authenticated owner
///
/// # Usage
/// ```ignore
/// async fn handler(_owner: Owner) -> impl IntoResponse {
///     "hello, owner"
/// }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Owner;

#[async_trait]
impl<S> FromRequestParts<S> for Owner
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = AppState::from_ref(state);
        let token = extract_token_from_headers(&parts.headers).ok_or(AppError::Unauthorized)?;

        if !tokens_match(token, &state.config.auth.owner_token) {
            tracing::info!("Rejected owner API request with invalid token");
            return Err(AppError::Unauthorized);
        }

        Ok(Owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_comparison() {
        assert!(tokens_match("secret-token", "secret-token"));
        assert!(!tokens_match("secret-tokem", "secret-token"));
        assert!(!tokens_match("secret", "secret-token"));
        assert!(!tokens_match("", "secret-token"));
    }

    #[test]
    fn bearer_prefix_is_required() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", "Token abc".parse().unwrap());
        assert_eq!(extract_token_from_headers(&headers), None);

        headers.insert("Authorization", "Bearer abc".parse().unwrap());
        assert_eq!(extract_token_from_headers(&headers), Some("abc"));
    }
}
