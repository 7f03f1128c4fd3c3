use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    auth::extractors::{AdminUser, CurrentUser},
    error::ApiError,
    state::AppState,
    users::{
        dto::{UserUpdate, UserView},
        repo::User,
    },
    validate::{normalize_email, validate_email},
};

pub fn read_routes() -> Router<AppState> {
    Router::new()
        .route("/users", get(list_users))
        .route("/users/me", get(me))
}

pub fn write_routes() -> Router<AppState> {
    Router::new().route("/users/:id", put(update_user).delete(delete_user))
}

/// The caller's own record, as resolved by the token guard.
#[instrument(skip_all)]
async fn me(CurrentUser(user): CurrentUser) -> Json<UserView> {
    Json(UserView::from(user))
}

/// Read-through listing: serve the cached snapshot when present, otherwise
/// read the store, fill the cache with the configured TTL and return the
/// fresh snapshot. A hit is returned verbatim without store revalidation.
#[instrument(skip_all)]
async fn list_users(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
) -> Result<Json<Vec<UserView>>, ApiError> {
    if let Some(cached) = state.cache.get_listing().await {
        return Ok(Json(cached));
    }

    let users = User::list(&state.db).await?;
    let views: Vec<UserView> = users.into_iter().map(UserView::from).collect();
    state.cache.put_listing(&views).await;
    Ok(Json(views))
}

/// Write-invalidate: the store mutation commits first; the listing cache is
/// dropped only after success, so a rejected update leaves a still-valid
/// entry untouched.
#[instrument(skip(state, patch))]
async fn update_user(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<Uuid>,
    Json(mut patch): Json<UserUpdate>,
) -> Result<Json<UserView>, ApiError> {
    if let Some(email) = patch.email.take() {
        let email = normalize_email(&email);
        validate_email(&email)?;
        patch.email = Some(email);
    }

    let user = User::update(&state.db, id, &patch)
        .await?
        .ok_or(ApiError::NotFound)?;
    state.cache.invalidate().await?;

    info!(user_id = %user.id, admin_id = %admin.id, "user updated");
    Ok(Json(UserView::from(user)))
}

#[instrument(skip(state))]
async fn delete_user(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let user = User::delete(&state.db, id)
        .await?
        .ok_or(ApiError::NotFound)?;
    state.cache.invalidate().await?;

    info!(user_id = %user.id, admin_id = %admin.id, "user deleted");
    Ok(StatusCode::NO_CONTENT)
}
