use crate::config::ApiConfig;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct AuthState {
    pub config: ApiConfig,
}

/// Primary authentication boundary: every request except a CORS
/// preflight must carry a bearer token matching `config.bearer_token`.
/// Comparison is constant-time to avoid leaking the token one byte at a
/// time through response latency.
pub async fn auth_middleware(
    State(auth_state): State<Arc<AuthState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let client_ip = headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    if method == Method::OPTIONS {
        return Ok(next.run(request).await);
    }

    if !auth_state.config.enable_auth {
        return Ok(next.run(request).await);
    }

    let unauthorized = || {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Unauthorized"})),
        )
            .into_response()
    };

    let provided_token = if let Some(header_value) = headers.get("x-api-key") {
        header_value.to_str().map_err(|_| unauthorized())?.to_string()
    } else if let Some(header_value) = headers.get("authorization") {
        let auth_str = header_value.to_str().map_err(|_| unauthorized())?;
        match auth_str.strip_prefix("Bearer ") {
            Some(token) => token.to_string(),
            None => {
                warn!("malformed authorization header from {} for {}", client_ip, path);
                return Err(unauthorized());
            }
        }
    } else {
        warn!("missing bearer token in request to {}", path);
        return Err(unauthorized());
    };

    match &auth_state.config.bearer_token {
        Some(expected) => {
            use subtle::ConstantTimeEq;
            if provided_token.as_bytes().ct_eq(expected.as_bytes()).into() {
                Ok(next.run(request).await)
            } else {
                warn!("authentication failed for {} from {}", path, client_ip);
                Err(unauthorized())
            }
        }
        None => {
            warn!("auth enabled but no bearer token configured");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Internal Server Error"})),
            )
                .into_response())
        }
    }
}

pub fn create_auth_state(config: ApiConfig) -> Arc<AuthState> {
    Arc::new(AuthState { config })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(token: Option<&str>) -> ApiConfig {
        ApiConfig {
            host: "127.0.0.1".to_string(),
            port: 4500,
            bearer_token: token.map(|t| t.to_string()),
            enable_auth: true,
            allowed_origins: vec![],
        }
    }

    #[test]
    fn test_auth_state_carries_config() {
        let state = create_auth_state(config(Some("secret-token-that-is-long-enough")));
        assert_eq!(state.config.bearer_token.as_deref(), Some("secret-token-that-is-long-enough"));
    }
}
