//! Middleware for alyx-api
//!
//! Authentication middleware for protected endpoints.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::AppState;

/// Authentication status for the current request.
///
/// Inserted into request extensions by the auth middleware and extracted
/// by handlers to make authorization decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    /// Unauthenticated public request
    Public,
    /// Valid admin Bearer token
    Admin,
    /// Valid short-lived internal token (a function calling back in)
    Internal,
}

impl AuthStatus {
    /// Whether the request may invoke functions and read files.
    pub fn can_invoke(&self) -> bool {
        matches!(self, AuthStatus::Admin | AuthStatus::Internal)
    }
}

/// Authentication middleware.
///
/// Resolves the `Authorization: Bearer <token>` header against the
/// configured admin token first (constant-time, hashed before comparison
/// so length is not observable), then against the internal token store.
/// The resulting [`AuthStatus`] lands in request extensions.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let mut auth_status = AuthStatus::Public;

    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string());

    if let Some(provided) = bearer {
        if let Some(expected) = admin_token(&state) {
            let provided_hash = Sha256::digest(provided.as_bytes());
            let expected_hash = Sha256::digest(expected.as_bytes());
            if provided_hash.ct_eq(&expected_hash).into() {
                auth_status = AuthStatus::Admin;
            }
        }
        if auth_status == AuthStatus::Public && state.alyx.tokens().validate(&provided) {
            auth_status = AuthStatus::Internal;
        }
    }

    request.extensions_mut().insert(auth_status);

    next.run(request).await
}

/// Resolve the configured admin token, if any.
fn admin_token(state: &AppState) -> Option<String> {
    let token_config = state.config().auth.as_ref()?.api_token.as_ref()?;
    match token_config.resolve() {
        Ok(token) if token.is_empty() => {
            tracing::warn!("API token resolves to empty string. Admin auth disabled.");
            None
        }
        Ok(token) => Some(token),
        Err(e) => {
            tracing::warn!("Failed to resolve API token: {}. Admin auth disabled.", e);
            None
        }
    }
}

/// Whether admin auth is configured at all. Endpoints that are open in
/// unconfigured development mode check this.
pub fn auth_configured(state: &AppState) -> bool {
    state
        .config()
        .auth
        .as_ref()
        .is_some_and(|a| a.api_token.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_status_invoke_rights() {
        assert!(!AuthStatus::Public.can_invoke());
        assert!(AuthStatus::Admin.can_invoke());
        assert!(AuthStatus::Internal.can_invoke());
    }
}
