//! Inbound API-key authentication.
//!
//! Keys are configured as comma-separated plaintext, hashed with SHA-256 at
//! startup, and compared by hash only. Admin endpoints use a separate key
//! list that falls back to the regular one when unset.

use crate::config::AuthConfig;
use crate::error::AppError;
use crate::server::Server;
use axum::{
    body::Body,
    http::Request,
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Hash an API key using SHA-256
pub fn hash_api_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct ApiKeyValidator {
    key_hashes: HashSet<String>,
    admin_key_hashes: HashSet<String>,
}

impl ApiKeyValidator {
    pub fn from_config(config: &AuthConfig) -> Self {
        let key_hashes = config
            .api_key_list()
            .iter()
            .map(|key| hash_api_key(key))
            .collect();
        let admin_key_hashes = config
            .admin_key_list()
            .iter()
            .map(|key| hash_api_key(key))
            .collect();
        Self {
            key_hashes,
            admin_key_hashes,
        }
    }

    pub fn has_keys(&self) -> bool {
        !self.key_hashes.is_empty()
    }

    pub fn check(&self, api_key: &str) -> bool {
        self.key_hashes.contains(&hash_api_key(api_key))
    }

    pub fn check_admin(&self, api_key: &str) -> bool {
        self.admin_key_hashes.contains(&hash_api_key(api_key))
    }
}

fn bearer_token(req: &Request<Body>) -> Result<&str, AppError> {
    let header = req
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            AppError::AuthenticationRequired("missing authorization header".to_string())
        })?;

    header.strip_prefix("Bearer ").ok_or_else(|| {
        AppError::AuthenticationRequired("authorization header must use Bearer scheme".to_string())
    })
}

/// Middleware guarding the OpenAI-compatible surface.
pub async fn auth_middleware(
    axum::extract::State(server): axum::extract::State<Server>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    if !server.api_keys.has_keys() {
        return Err(AppError::Internal("API keys not configured".to_string()));
    }
    let token = bearer_token(&req)?;
    if !server.api_keys.check(token) {
        return Err(AppError::AuthenticationRequired(
            "invalid API key".to_string(),
        ));
    }
    Ok(next.run(req).await)
}

/// Middleware guarding the admin surface.
pub async fn admin_auth_middleware(
    axum::extract::State(server): axum::extract::State<Server>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    if !server.api_keys.has_keys() {
        return Err(AppError::Internal("API keys not configured".to_string()));
    }
    let token = bearer_token(&req)?;
    if !server.api_keys.check_admin(token) {
        return Err(AppError::AuthenticationRequired(
            "invalid admin API key".to_string(),
        ));
    }
    Ok(next.run(req).await)
}
