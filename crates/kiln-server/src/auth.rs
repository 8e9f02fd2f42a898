//! Bearer-token authentication.
//!
//! Every request carries `Authorization: Bearer kiln_tk_...`; the token
//! resolves to `{tenant_id, user_id, role}` and every handler applies the
//! tenant filter from there.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use kiln_core::token::{self, Claims};

use crate::error::AppError;
use crate::state::AppState;

/// Authenticated caller identity, extracted from the bearer token.
#[derive(Debug, Clone)]
pub struct AuthContext(pub Claims);

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::unauthenticated("missing Authorization header"))?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| AppError::unauthenticated("expected a bearer token"))?;

        let claims = token::validate_token(&state.token_config, token)
            .map_err(|e| AppError::unauthenticated(format!("invalid token: {e}")))?;

        Ok(Self(claims))
    }
}
