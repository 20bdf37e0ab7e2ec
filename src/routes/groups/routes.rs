use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    validate_group_key, CreateGroupRequest, GroupResponse, MemberUser, MembershipResponse,
    UpdateGroupRequest, UserGroup,
};
use crate::routes::middleware_auth::JwtUser;
use crate::state::AppState;

const GROUP_COLUMNS: &str = r#"
    g.id, g.key, g.name, g.description, g.is_active, g.created_at, g.updated_at,
    (SELECT COUNT(*) FROM user_group_memberships m WHERE m.group_id = g.id) AS member_count
"#;

#[derive(Debug, sqlx::FromRow)]
struct MemberRow {
    id: Uuid,
    user_id: Uuid,
    group_id: Uuid,
    created_at: DateTime<Utc>,
    email: String,
    name: Option<String>,
}

// HANDLERS

/// Create a new user group
pub async fn create(
    State(state): State<AppState>,
    JwtUser(_user_id): JwtUser,
    Json(payload): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    validate_group_key(&payload.key).map_err(|e| (StatusCode::BAD_REQUEST, e))?;

    if payload.name.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "Group name cannot be empty".to_string(),
        ));
    }

    let group = match sqlx::query_as::<_, UserGroup>(
        r#"
        INSERT INTO user_groups (key, name, description, is_active)
        VALUES ($1, $2, $3, $4)
        RETURNING id, key, name, description, is_active, created_at, updated_at,
                  0::bigint AS member_count
        "#,
    )
    .bind(&payload.key)
    .bind(&payload.name)
    .bind(&payload.description)
    .bind(payload.is_active.unwrap_or(true))
    .fetch_one(&state.db)
    .await
    {
        Ok(group) => group,
        Err(e) => {
            if let Some(db_error) = e.as_database_error() {
                if db_error.code() == Some(std::borrow::Cow::Borrowed("23505")) {
                    return Err((
                        StatusCode::CONFLICT,
                        "Group with this key already exists".to_string(),
                    ));
                }
            }
            tracing::error!("Failed to create group: {e:?}");
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
            ));
        }
    };

    Ok((StatusCode::CREATED, Json(GroupResponse::from(group))))
}

/// List all user groups
pub async fn list(
    State(state): State<AppState>,
    JwtUser(_user_id): JwtUser,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let groups = sqlx::query_as::<_, UserGroup>(&format!(
        r#"
        SELECT {GROUP_COLUMNS}
        FROM user_groups g
        ORDER BY g.created_at DESC
        "#,
    ))
    .fetch_all(&state.db)
    .await
    .map_err(|e| {
        tracing::error!("Failed to fetch groups: {e:?}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to fetch groups".to_string(),
        )
    })?;

    let response: Vec<GroupResponse> = groups.into_iter().map(GroupResponse::from).collect();

    Ok(Json(response))
}

/// Get a single group by ID
pub async fn get(
    State(state): State<AppState>,
    JwtUser(_user_id): JwtUser,
    Path(group_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let group = fetch_group(&state, group_id).await?;

    Ok(Json(GroupResponse::from(group)))
}

/// Update a group
pub async fn update(
    State(state): State<AppState>,
    JwtUser(_user_id): JwtUser,
    Path(group_id): Path<Uuid>,
    Json(payload): Json<UpdateGroupRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let group = sqlx::query_as::<_, UserGroup>(&format!(
        r#"
        UPDATE user_groups AS g
        SET
            name = COALESCE($2, name),
            description = COALESCE($3, description),
            is_active = COALESCE($4, is_active),
            updated_at = NOW()
        WHERE id = $1
        RETURNING {GROUP_COLUMNS}
        "#,
    ))
    .bind(group_id)
    .bind(payload.name.as_deref())
    .bind(payload.description.as_deref())
    .bind(payload.is_active)
    .fetch_optional(&state.db)
    .await
    .map_err(|e| {
        tracing::error!("Failed to update group: {e:?}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to update group".to_string(),
        )
    })?;

    match group {
        Some(g) => Ok(Json(GroupResponse::from(g))),
        None => Err((StatusCode::NOT_FOUND, "Group not found".to_string())),
    }
}

/// Delete a group (cascades to memberships; targeting rules referencing it go too)
pub async fn delete(
    State(state): State<AppState>,
    JwtUser(_user_id): JwtUser,
    Path(group_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let result = sqlx::query("DELETE FROM user_groups WHERE id = $1")
        .bind(group_id)
        .execute(&state.db)
        .await
        .map_err(|e| {
            tracing::error!("Failed to delete group: {e:?}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to delete group".to_string(),
            )
        })?;

    if result.rows_affected() == 0 {
        return Err((StatusCode::NOT_FOUND, "Group not found".to_string()));
    }

    Ok(StatusCode::NO_CONTENT)
}

/// List the members of a group
pub async fn members(
    State(state): State<AppState>,
    JwtUser(_user_id): JwtUser,
    Path(group_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    // 404 for unknown groups rather than an empty list
    fetch_group(&state, group_id).await?;

    let rows = sqlx::query_as::<_, MemberRow>(
        r#"
        SELECT m.id, m.user_id, m.group_id, m.created_at, u.email, u.name
        FROM user_group_memberships m
        JOIN users u ON u.id = m.user_id
        WHERE m.group_id = $1
        ORDER BY m.created_at DESC
        "#,
    )
    .bind(group_id)
    .fetch_all(&state.db)
    .await
    .map_err(|e| {
        tracing::error!("Failed to fetch members: {e:?}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to fetch members".to_string(),
        )
    })?;

    let response: Vec<MembershipResponse> = rows
        .into_iter()
        .map(|r| MembershipResponse {
            id: r.id,
            user_id: r.user_id,
            group_id: r.group_id,
            created_at: r.created_at,
            user: MemberUser {
                id: r.user_id,
                email: r.email,
                name: r.name,
            },
        })
        .collect();

    Ok(Json(response))
}

/// Add a user to a group
pub async fn add_member(
    State(state): State<AppState>,
    JwtUser(_user_id): JwtUser,
    Path((group_id, member_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let user_exists =
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1)")
            .bind(member_id)
            .fetch_one(&state.db)
            .await
            .map_err(|e| {
                tracing::error!("Failed to check user: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                )
            })?;

    if !user_exists {
        return Err((StatusCode::NOT_FOUND, "User not found".to_string()));
    }

    fetch_group(&state, group_id).await?;

    let membership = match sqlx::query_as::<_, (Uuid, DateTime<Utc>)>(
        r#"
        INSERT INTO user_group_memberships (user_id, group_id)
        VALUES ($1, $2)
        RETURNING id, created_at
        "#,
    )
    .bind(member_id)
    .bind(group_id)
    .fetch_one(&state.db)
    .await
    {
        Ok(m) => m,
        Err(e) => {
            if let Some(db_error) = e.as_database_error() {
                if db_error.code() == Some(std::borrow::Cow::Borrowed("23505")) {
                    return Err((
                        StatusCode::CONFLICT,
                        "User is already a member of this group".to_string(),
                    ));
                }
            }
            tracing::error!("Failed to add member: {e:?}");
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
            ));
        }
    };

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "id": membership.0,
            "userId": member_id,
            "groupId": group_id,
            "createdAt": membership.1,
        })),
    ))
}

/// Remove a user from a group
pub async fn remove_member(
    State(state): State<AppState>,
    JwtUser(_user_id): JwtUser,
    Path((group_id, member_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let result =
        sqlx::query("DELETE FROM user_group_memberships WHERE user_id = $1 AND group_id = $2")
            .bind(member_id)
            .bind(group_id)
            .execute(&state.db)
            .await
            .map_err(|e| {
                tracing::error!("Failed to remove member: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to remove member".to_string(),
                )
            })?;

    if result.rows_affected() == 0 {
        return Err((StatusCode::NOT_FOUND, "Membership not found".to_string()));
    }

    Ok(StatusCode::NO_CONTENT)
}

async fn fetch_group(state: &AppState, group_id: Uuid) -> Result<UserGroup, (StatusCode, String)> {
    let group = sqlx::query_as::<_, UserGroup>(&format!(
        r#"
        SELECT {GROUP_COLUMNS}
        FROM user_groups g
        WHERE g.id = $1
        "#,
    ))
    .bind(group_id)
    .fetch_optional(&state.db)
    .await
    .map_err(|e| {
        tracing::error!("Failed to fetch group: {e:?}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to fetch group".to_string(),
        )
    })?;

    group.ok_or((StatusCode::NOT_FOUND, "Group not found".to_string()))
}
