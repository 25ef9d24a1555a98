//! Bearer-token authentication.
//!
//! The service never mints or validates tokens itself; both sides are
//! injected. A [`LoginHandler`] exchanges credentials for a token, an
//! [`AuthHandler`] judges the token presented on later requests. When no
//! auth handler is configured every request is allowed through.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};

use super::handlers::{ApiError, AppState};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("login credentials not authorized")]
    NotAuthorized,

    #[error("bearer token rejected")]
    InvalidToken,
}

/// Judges the bearer token on a request; `Ok` admits it.
pub type AuthHandler = Arc<dyn Fn(&str) -> Result<(), AuthError> + Send + Sync>;

/// Exchanges a username and password for a token.
pub type LoginHandler = Arc<dyn Fn(&str, &str) -> Result<String, AuthError> + Send + Sync>;

/// Middleware guarding the data routes.
pub(crate) async fn require_bearer(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(handler) = state.auth.clone() else {
        return Ok(next.run(request).await);
    };

    let token = bearer_token(request.headers()).ok_or(ApiError::Unauthorized)?;
    handler(token).map_err(|_| ApiError::Unauthorized)?;

    Ok(next.run(request).await)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_bearer_token_extracted() {
        let headers = headers_with("Bearer abc123");
        assert_eq!(bearer_token(&headers), Some("abc123"));
    }

    #[test]
    fn test_bearer_token_missing_header() {
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn test_bearer_token_wrong_scheme() {
        let headers = headers_with("Basic dXNlcjpwYXNz");
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_bearer_token_empty() {
        let headers = headers_with("Bearer ");
        assert_eq!(bearer_token(&headers), None);
    }
}
