use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{
    auth::{handlers::render, jwt::AuthUser},
    error::{ApiError, ApiResult},
    state::AppState,
    users::{dto::SerializedUser, repo_types::Permission},
};

/// Body of `POST /users` and `PUT /users/:id`.
#[derive(Debug, Deserialize)]
pub struct UserPayload {
    pub username: String,
    pub password: String,
    pub email: String,
    #[serde(default)]
    pub permissions: Vec<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResponse {
    pub navigate_to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<SerializedUser>,
}

pub fn users_routes() -> Router<AppState> {
    Router::new()
        .route("/users", get(list_users).post(create_user))
        .route(
            "/users/:id",
            get(get_user).put(update_user).delete(delete_user),
        )
        .route("/users/:id/permissions", get(user_permissions))
}

#[instrument(skip(state))]
pub async fn list_users(
    State(state): State<AppState>,
    AuthUser(_caller): AuthUser,
) -> ApiResult<Json<Vec<SerializedUser>>> {
    let users = state.users.list_all().await.map_err(|e| state.api_error(e))?;
    let items = users.iter().map(render).collect::<ApiResult<Vec<_>>>()?;
    Ok(Json(items))
}

#[instrument(skip(state))]
pub async fn get_user(
    State(state): State<AppState>,
    AuthUser(_caller): AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<SerializedUser>> {
    let user = state
        .users
        .get_by_id(id)
        .await
        .map_err(|e| state.api_error(e))?
        .ok_or_else(|| ApiError::not_found(format!("user {id} does not exist")))?;
    Ok(Json(render(&user)?))
}

#[instrument(skip(state))]
pub async fn user_permissions(
    State(state): State<AppState>,
    AuthUser(_caller): AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<Permission>>> {
    let Some(mut user) = state
        .users
        .get_by_id(id)
        .await
        .map_err(|e| state.api_error(e))?
    else {
        return Err(ApiError::not_found(format!("user {id} does not exist")));
    };
    let permissions = state
        .users
        .get_permissions(&mut user)
        .await
        .map_err(|e| state.api_error(e))?;
    Ok(Json(permissions))
}

#[instrument(skip(state, payload))]
pub async fn create_user(
    State(state): State<AppState>,
    AuthUser(_caller): AuthUser,
    Json(payload): Json<UserPayload>,
) -> ApiResult<(StatusCode, Json<MutationResponse>)> {
    let user = state
        .users
        .create(
            &payload.username,
            &payload.password,
            &payload.email,
            &payload.permissions,
        )
        .await
        .map_err(|e| state.api_error(e))?;
    let body = MutationResponse {
        navigate_to: state.config.users_path.clone(),
        user: Some(render(&user)?),
    };
    Ok((StatusCode::CREATED, Json(body)))
}

#[instrument(skip(state, payload))]
pub async fn update_user(
    State(state): State<AppState>,
    AuthUser(_caller): AuthUser,
    Path(id): Path<i64>,
    Json(payload): Json<UserPayload>,
) -> ApiResult<Json<MutationResponse>> {
    let user = state
        .users
        .update(
            id,
            &payload.username,
            &payload.password,
            &payload.email,
            &payload.permissions,
        )
        .await
        .map_err(|e| state.api_error(e))?;
    Ok(Json(MutationResponse {
        navigate_to: state.config.users_path.clone(),
        user: Some(render(&user)?),
    }))
}

#[instrument(skip(state))]
pub async fn delete_user(
    State(state): State<AppState>,
    AuthUser(_caller): AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<MutationResponse>> {
    state.users.delete(id).await.map_err(|e| state.api_error(e))?;
    Ok(Json(MutationResponse {
        navigate_to: state.config.users_path.clone(),
        user: None,
    }))
}
