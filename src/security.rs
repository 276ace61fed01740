use crate::{
    clock::SharedClock,
    models::ApiError,
    ratelimit::{RateExceeded, RatePermit, TokenBuckets},
};
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc};
use tracing::{info, warn};

#[derive(Clone)]
pub struct AuthState {
    keys: Arc<HashMap<String, AuthContext>>,
    limiter: TokenBuckets,
}

/// Tenant the presented key belongs to.
#[derive(Clone, Debug, PartialEq)]
pub struct AuthContext {
    pub shop: String,
    pub api_key_id: String,
}

impl AuthState {
    pub fn new(keys: HashMap<String, AuthContext>, limiter: TokenBuckets) -> Self {
        Self {
            keys: Arc::new(keys),
            limiter,
        }
    }

    pub fn from_env(clock: SharedClock) -> Self {
        let raw = env::var("API_KEYS").unwrap_or_default();
        let keys = parse_api_keys(&raw);
        if keys.is_empty() {
            warn!(target = "smartenrich.api", "api_keys_missing_protected_routes_closed");
        } else {
            info!(target = "smartenrich.api", key_count = keys.len(), "api_keys_loaded");
        }
        Self::new(keys, TokenBuckets::from_env(clock))
    }

    fn authenticate(&self, presented: &str) -> Option<AuthContext> {
        self.keys.get(presented).cloned()
    }
}

/// Parses `shop:key` pairs separated by commas. Malformed entries are skipped.
pub fn parse_api_keys(raw: &str) -> HashMap<String, AuthContext> {
    let mut entries = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(2, ':');
        let shop = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let key = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (shop, key) {
            (Some(shop), Some(secret)) => {
                entries.insert(
                    secret.to_string(),
                    AuthContext {
                        shop: shop.to_string(),
                        api_key_id: format!("key-{:02}", idx + 1),
                    },
                );
            }
            _ => warn!(target = "smartenrich.api", entry = idx + 1, "api_key_entry_malformed"),
        }
    }
    entries
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(error_response(
            StatusCode::UNAUTHORIZED,
            "missing_api_key",
            "Provide X-Api-Key or Bearer token",
        ));
    };

    let Some(context) = state.authenticate(&presented) else {
        return Ok(error_response(StatusCode::UNAUTHORIZED, "invalid_api_key", "Key not recognized"));
    };

    match state.limiter.consume(&context.shop).await {
        Ok(permit) => {
            request.extensions_mut().insert(context);
            let mut response = next.run(request).await;
            permit_headers(&permit, response.headers_mut());
            Ok(response)
        }
        Err(exceeded) => {
            let mut response = error_response(StatusCode::TOO_MANY_REQUESTS, "rate_limited", "Too many requests");
            exceeded_headers(&exceeded, response.headers_mut());
            Ok(response)
        }
    }
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get("X-Api-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (status, Json(payload)).into_response()
}

fn numeric_header(value: u64) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

pub fn retry_after_header(headers: &mut http::HeaderMap, secs: u64) {
    headers.insert(http::header::RETRY_AFTER, numeric_header(secs.max(1)));
}

fn permit_headers(permit: &RatePermit, headers: &mut http::HeaderMap) {
    let remaining = permit.tokens.max(0.0).floor() as u64;
    let reset = ((permit.capacity - permit.tokens) / permit.rate).ceil().max(0.0) as u64;
    headers.insert("X-RateLimit-Limit", numeric_header(permit.capacity as u64));
    headers.insert("X-RateLimit-Remaining", numeric_header(remaining));
    headers.insert("X-RateLimit-Reset", numeric_header(reset));
}

fn exceeded_headers(exceeded: &RateExceeded, headers: &mut http::HeaderMap) {
    retry_after_header(headers, exceeded.retry_after.ceil().max(0.0) as u64);
    let reset = ((exceeded.capacity - exceeded.tokens) / exceeded.rate).ceil().max(0.0) as u64;
    headers.insert("X-RateLimit-Limit", numeric_header(exceeded.capacity as u64));
    headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
    headers.insert("X-RateLimit-Reset", numeric_header(reset));
}
