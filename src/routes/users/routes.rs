use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use uuid::Uuid;

use super::{User, UserResponse};
use crate::routes::middleware_auth::JwtUser;
use crate::state::AppState;

const USER_COLUMNS: &str = "id, email, name, attributes, created_at, updated_at";

/// List all users
pub async fn list(
    State(state): State<AppState>,
    JwtUser(_user_id): JwtUser,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let users = sqlx::query_as::<_, User>(&format!(
        r#"
        SELECT {USER_COLUMNS}
        FROM users
        ORDER BY created_at DESC
        "#,
    ))
    .fetch_all(&state.db)
    .await
    .map_err(|e| {
        tracing::error!("Failed to fetch users: {e:?}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to fetch users".to_string(),
        )
    })?;

    let response: Vec<UserResponse> = users.into_iter().map(UserResponse::from).collect();

    Ok(Json(response))
}

/// Get a single user by ID
pub async fn get(
    State(state): State<AppState>,
    JwtUser(_user_id): JwtUser,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let user = sqlx::query_as::<_, User>(&format!(
        r#"
        SELECT {USER_COLUMNS}
        FROM users
        WHERE id = $1
        "#,
    ))
    .bind(user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(|e| {
        tracing::error!("Failed to fetch user: {e:?}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to fetch user".to_string(),
        )
    })?;

    match user {
        Some(u) => Ok(Json(UserResponse::from(u))),
        None => Err((StatusCode::NOT_FOUND, "User not found".to_string())),
    }
}

/// Delete a user (cascades to group memberships)
pub async fn delete(
    State(state): State<AppState>,
    JwtUser(_user_id): JwtUser,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let result = sqlx::query("DELETE FROM users WHERE id = $1")
        .bind(user_id)
        .execute(&state.db)
        .await
        .map_err(|e| {
            tracing::error!("Failed to delete user: {e:?}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to delete user".to_string(),
            )
        })?;

    if result.rows_affected() == 0 {
        return Err((StatusCode::NOT_FOUND, "User not found".to_string()));
    }

    Ok(StatusCode::NO_CONTENT)
}
