use axum::{
    error_handling::HandleErrorLayer,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tower::{BoxError, ServiceBuilder};
use tracing::warn;

use crate::{
    error::RateLimitError,
    limiter::Limiter,
    middleware::{header_key, RateLimitLayer},
};

/// Header carrying the caller identity used as the rate limit key
pub const API_KEY_HEADER: &str = "x-api-key";

/// Key shared by every request without an API key
pub const ANONYMOUS_KEY: &str = "anonymous";

#[derive(Clone)]
struct AppState {
    limiter: Arc<dyn Limiter>,
}

/// HTTP application: `/` is rate limited per API key, `/healthcheck` is not.
pub fn app(limiter: Arc<dyn Limiter>) -> Router {
    let limited = Router::new().route("/", get(index)).route_layer(
        ServiceBuilder::new()
            .layer(HandleErrorLayer::new(handle_rate_limit_error))
            .layer(RateLimitLayer::new(
                Some(limiter.clone()),
                header_key::<axum::body::Body>(API_KEY_HEADER, ANONYMOUS_KEY),
            )),
    );

    Router::new()
        .route("/healthcheck", get(health_check))
        .with_state(AppState { limiter })
        .merge(limited)
}

/// Map errors raised by the rate limit layer to HTTP responses.
pub async fn handle_rate_limit_error(err: BoxError) -> Response {
    match err.downcast::<RateLimitError>() {
        Ok(err) => (*err).into_response(),
        Err(err) => {
            warn!("Unhandled middleware error: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

async fn index() -> &'static str {
    "ok"
}

async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.limiter.health_check().await {
        Ok(()) => Ok(Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))),
        Err(e) => {
            warn!("Health check failed: {}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}
