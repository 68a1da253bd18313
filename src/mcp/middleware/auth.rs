//! Bearer token authentication for the HTTP transport

use axum::http::{header, HeaderMap};

use crate::config::Config;
use crate::error::ToolError;

/// Checks `Authorization: Bearer <token>` against the configured token
#[derive(Debug, Clone, Default)]
pub struct BearerAuth {
    required: bool,
    token: Option<String>,
}

impl BearerAuth {
    pub fn new(required: bool, token: Option<String>) -> Self {
        Self { required, token }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.auth_required, config.auth_token.clone())
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Accept or reject a request by its headers
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<(), ToolError> {
        if !self.required {
            return Ok(());
        }

        let expected = self
            .token
            .as_deref()
            .ok_or_else(|| ToolError::unauthenticated("No API token is configured"))?;

        let value = headers
            .get(header::AUTHORIZATION)
            .ok_or_else(|| ToolError::unauthenticated("Missing Authorization header"))?
            .to_str()
            .map_err(|_| ToolError::unauthenticated("Malformed Authorization header"))?;

        let presented = bearer_token(value)
            .ok_or_else(|| ToolError::unauthenticated("Authorization must use the Bearer scheme"))?;

        if constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
            Ok(())
        } else {
            Err(ToolError::unauthenticated("Invalid API token"))
        }
    }
}

fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
