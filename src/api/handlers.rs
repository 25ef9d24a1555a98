use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::auth::{AuthHandler, LoginHandler};
use crate::storage::{Engine, EngineError, Sample, NO_UPPER_BOUND};

/// Application state shared across handlers.
pub struct AppState {
    pub engine: Arc<Engine>,
    pub auth: Option<AuthHandler>,
    pub login: Option<LoginHandler>,
}

// ============================================================================
// Health Check
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================================
// Search
// ============================================================================

#[derive(Deserialize)]
pub struct SearchRequest {
    pub key: String,
    /// Inclusive lower bound, ns since the Unix epoch. Omitted = unbounded.
    #[serde(default)]
    pub oldest: u64,
    /// Exclusive upper bound, ns since the Unix epoch. Omitted = unbounded.
    #[serde(default = "no_upper_bound")]
    pub newest: u64,
}

fn no_upper_bound() -> u64 {
    NO_UPPER_BOUND
}

#[derive(Serialize)]
pub struct SearchResponse {
    pub key: String,
    pub elements: Vec<Element>,
}

#[derive(Serialize)]
pub struct Element {
    pub timestamp: i64,
    pub data: String,
}

impl From<Sample> for Element {
    fn from(sample: Sample) -> Self {
        Self {
            timestamp: sample.timestamp,
            data: String::from_utf8_lossy(&sample.payload).into_owned(),
        }
    }
}

pub async fn search(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    let samples = state
        .engine
        .search(&request.key, request.oldest, request.newest)
        .await?;

    Ok(Json(SearchResponse {
        key: request.key,
        elements: samples.into_iter().map(Element::from).collect(),
    }))
}

// ============================================================================
// Login
// ============================================================================

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub token: String,
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let Some(handler) = state.login.clone() else {
        return Err(ApiError::NotImplemented);
    };

    let token = handler(&request.username, &request.password)
        .map_err(|_| ApiError::Unauthorized)?;

    Ok(Json(LoginResponse { token }))
}

// ============================================================================
// Stats
// ============================================================================

#[derive(Serialize)]
pub struct StatsResponse {
    pub keys: usize,
    pub shards: usize,
    pub max_age_secs: u64,
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<StatsResponse>, ApiError> {
    let keys = state.engine.keys().await?;

    Ok(Json(StatsResponse {
        keys: keys.len(),
        shards: state.engine.shard_count(),
        max_age_secs: state.engine.max_age().as_secs(),
    }))
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    InvalidArguments,
    Unauthorized,
    NotImplemented,
    Unavailable,
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound { key } => ApiError::NotFound(key),
            EngineError::InvalidSearch => ApiError::InvalidArguments,
            EngineError::Closed => ApiError::Unavailable,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::NotFound(key) => (
                StatusCode::NOT_FOUND,
                format!("key '{}' does not exist", key),
            ),
            ApiError::InvalidArguments => (
                StatusCode::BAD_REQUEST,
                "search arguments are not valid".to_string(),
            ),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::NotImplemented => (
                StatusCode::NOT_IMPLEMENTED,
                "login is not implemented".to_string(),
            ),
            ApiError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "storage is shutting down".to_string(),
            ),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_element_from_sample() {
        let element = Element::from(Sample::new(100, Bytes::from_static(b"175.32")));
        assert_eq!(element.timestamp, 100);
        assert_eq!(element.data, "175.32");
    }

    #[test]
    fn test_api_error_from_engine_error() {
        assert!(matches!(
            ApiError::from(EngineError::NotFound { key: "k".into() }),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from(EngineError::InvalidSearch),
            ApiError::InvalidArguments
        ));
        assert!(matches!(
            ApiError::from(EngineError::Closed),
            ApiError::Unavailable
        ));
    }

    #[test]
    fn test_search_request_defaults() {
        let request: SearchRequest = serde_json::from_str(r#"{"key": "AAPL"}"#).unwrap();
        assert_eq!(request.oldest, 0);
        assert_eq!(request.newest, NO_UPPER_BOUND);
    }
}
