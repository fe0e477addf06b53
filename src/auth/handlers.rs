use axum::{
    extract::{FromRef, State},
    routing::{get, post},
    Json, Router,
};
use tracing::{error, info, instrument, warn};

use crate::{
    auth::{
        dto::{AuthResponse, LoginRequest, RefreshRequest},
        jwt::{AuthUser, JwtKeys},
    },
    error::{ApiError, ApiResult},
    state::AppState,
    users::{
        dto::{SerializedUser, UserDto},
        repo_types::Permission,
        services::CredentialCheck,
    },
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
}

pub fn me_routes() -> Router<AppState> {
    Router::new()
        .route("/me", get(get_me))
        .route("/me/permissions", get(get_my_permissions))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> ApiResult<Json<AuthResponse>> {
    let check = state
        .users
        .validate_credentials(&payload.username, &payload.password)
        .await
        .map_err(|e| state.api_error(e))?;

    let user = match check {
        CredentialCheck::Valid(user) => user,
        CredentialCheck::NotFound => {
            warn!(username = %payload.username, "login unknown username");
            return Err(ApiError::not_found("Unknown username"));
        }
        CredentialCheck::Invalid => {
            warn!(username = %payload.username, "login invalid password");
            return Err(ApiError::unauthorized("Invalid password"));
        }
    };

    let response = issue_tokens(&state, &user, Some(state.config.home_path.clone()))?;
    info!(username = %payload.username, "user logged in");
    Ok(Json(response))
}

#[instrument(skip(state, payload))]
pub async fn refresh(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> ApiResult<Json<AuthResponse>> {
    let keys = JwtKeys::from_ref(&state);
    let claims = keys
        .verify_refresh(&payload.refresh_token)
        .map_err(|e| ApiError::unauthorized(e.to_string()))?;

    let user = state
        .users
        .get_by_id(claims.sub)
        .await
        .map_err(|e| state.api_error(e))?
        .ok_or_else(|| ApiError::unauthorized("User not found"))?;

    Ok(Json(issue_tokens(&state, &user, None)?))
}

#[instrument(skip(state))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> ApiResult<Json<SerializedUser>> {
    let user = state
        .users
        .get_by_id(user_id)
        .await
        .map_err(|e| state.api_error(e))?
        .ok_or_else(|| {
            error!(user_id, "token for missing user");
            ApiError::unauthorized("User not found")
        })?;
    Ok(Json(render(&user)?))
}

#[instrument(skip(state))]
pub async fn get_my_permissions(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> ApiResult<Json<Vec<Permission>>> {
    let permissions = state
        .users
        .get_permissions_by_user_id(user_id)
        .await
        .map_err(|e| state.api_error(e))?;
    Ok(Json(permissions))
}

fn issue_tokens(
    state: &AppState,
    user: &UserDto,
    navigate_to: Option<String>,
) -> ApiResult<AuthResponse> {
    let user_id = user
        .id()
        .ok_or_else(|| ApiError::internal("stored user has no id"))?;
    let keys = JwtKeys::from_ref(state);
    let access_token = keys.sign_access(user_id).map_err(|e| {
        error!(error = %e, "jwt sign access failed");
        ApiError::internal(e.to_string())
    })?;
    let refresh_token = keys.sign_refresh(user_id).map_err(|e| {
        error!(error = %e, "jwt sign refresh failed");
        ApiError::internal(e.to_string())
    })?;
    Ok(AuthResponse {
        navigate_to,
        access_token,
        refresh_token,
        user: render(user)?,
    })
}

pub(crate) fn render(user: &UserDto) -> ApiResult<SerializedUser> {
    user.serialize().map_err(|e| {
        error!(error = %e, "user serialization failed");
        ApiError::internal("could not serialize user")
    })
}
