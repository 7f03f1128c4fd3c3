use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use tracing::warn;

use crate::{auth::jwt::JwtKeys, error::ApiError, state::AppState, users::repo::User};

/// Token guard: extracts the bearer token, validates it, and resolves the
/// subject to a live store record.
///
/// Every failure along the way is the same `Unauthorized`: a missing or
/// malformed header, a bad signature, an expired token, or a subject whose
/// account has since been deleted.
pub struct CurrentUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;

        let token = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))
            .ok_or(ApiError::Unauthorized)?;

        let keys = JwtKeys::from_ref(state);
        let claims = keys.verify(token).map_err(|e| {
            warn!(error = %e, "token rejected");
            ApiError::Unauthorized
        })?;

        // Token validity is the signer's claim only; the account must still
        // exist right now.
        let user = User::find_by_email(&state.db, &claims.sub)
            .await
            .map_err(|e| ApiError::Internal(e.into()))?
            .ok_or_else(|| {
                warn!("token subject no longer resolves to a user");
                ApiError::Unauthorized
            })?;

        Ok(CurrentUser(user))
    }
}

/// Role gate for administrative operations. Runs the token guard first, so
/// a bad token is `Unauthorized` while a valid non-admin identity is
/// `Forbidden`.
pub struct AdminUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let CurrentUser(user) = CurrentUser::from_request_parts(parts, state).await?;
        if !user.role.is_admin() {
            warn!(user_id = %user.id, "admin operation refused");
            return Err(ApiError::Forbidden);
        }
        Ok(AdminUser(user))
    }
}
