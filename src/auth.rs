//! Authentication middleware for API key validation.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use std::collections::HashSet;
use std::env;
use tracing::info;

#[derive(Clone)]
pub struct AuthConfig {
    pub api_keys: HashSet<String>,
    pub require_auth: bool,
}

impl AuthConfig {
    pub fn new() -> Self {
        let mut api_keys = HashSet::new();

        if let Ok(keys_str) = env::var("CHAINRAG_API_KEYS") {
            for key in keys_str.split(',') {
                let key = key.trim();
                if !key.is_empty() {
                    api_keys.insert(key.to_string());
                }
            }
        }

        if let Ok(key) = env::var("CHAINRAG_API_KEY") {
            let key = key.trim();
            if !key.is_empty() {
                api_keys.insert(key.to_string());
            }
        }

        let require_auth = !api_keys.is_empty() || env::var("CHAINRAG_REQUIRE_AUTH").is_ok();

        if require_auth {
            info!("authentication enabled ({} api keys configured)", api_keys.len());
        } else {
            info!("authentication disabled (no api keys configured)");
        }

        Self { api_keys, require_auth }
    }

    pub fn validate_key(&self, key: &str) -> bool {
        if !self.require_auth {
            return true;
        }
        self.api_keys.contains(key)
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn require_api_key(
    State(auth): State<AuthConfig>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if !auth.require_auth {
        return Ok(next.run(request).await);
    }

    let key = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| request.headers().get("x-api-key").and_then(|v| v.to_str().ok()));

    match key {
        Some(k) if auth.validate_key(k) => Ok(next.run(request).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_key_allows_everything_when_auth_disabled() {
        let cfg = AuthConfig { api_keys: HashSet::new(), require_auth: false };
        assert!(cfg.validate_key("anything"));
    }

    #[test]
    fn validate_key_checks_membership_when_enabled() {
        let mut keys = HashSet::new();
        keys.insert("secret".to_string());
        let cfg = AuthConfig { api_keys: keys, require_auth: true };
        assert!(cfg.validate_key("secret"));
        assert!(!cfg.validate_key("nope"));
    }
}
