use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::Value;
use uuid::Uuid;

use super::{
    resolve_update_fields, validate_flag_key, validate_flag_payload, validate_rollout_percentage,
    CreateFlagRequest, FeatureFlag, FlagResponse, UpdateFlagRequest,
};
use crate::evaluation::FlagType;
use crate::routes::middleware_auth::JwtUser;
use crate::state::AppState;

const FLAG_COLUMNS: &str =
    "id, key, description, flag_type, is_enabled, rollout_percentage, config_json, created_at, updated_at";

/// Create a new feature flag
pub async fn create(
    State(state): State<AppState>,
    JwtUser(_user_id): JwtUser,
    Json(payload): Json<CreateFlagRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    validate_flag_key(&payload.key).map_err(|e| (StatusCode::BAD_REQUEST, e))?;
    validate_flag_payload(&payload).map_err(|e| (StatusCode::BAD_REQUEST, e))?;

    // Only the field matching the flag's type is persisted.
    let (is_enabled, rollout_percentage, config_json) = match payload.flag_type {
        FlagType::Boolean => (payload.is_enabled, None, None),
        FlagType::Percentage => (None, payload.rollout_percentage, None),
        FlagType::Config => (None, None, payload.config_json.clone()),
    };

    let flag = match sqlx::query_as::<_, FeatureFlag>(&format!(
        r#"
        INSERT INTO feature_flags (key, description, flag_type, is_enabled, rollout_percentage, config_json)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {FLAG_COLUMNS}
        "#,
    ))
    .bind(&payload.key)
    .bind(&payload.description)
    .bind(payload.flag_type)
    .bind(is_enabled)
    .bind(rollout_percentage)
    .bind(config_json)
    .fetch_one(&state.db)
    .await
    {
        Ok(flag) => flag,
        Err(e) => {
            if let Some(db_error) = e.as_database_error() {
                if db_error.code() == Some(std::borrow::Cow::Borrowed("23505")) {
                    return Err((
                        StatusCode::CONFLICT,
                        "Flag with this key already exists".to_string(),
                    ));
                }
            }
            tracing::error!("Failed to create flag: {e:?}");
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
            ));
        }
    };

    Ok((StatusCode::CREATED, Json(FlagResponse::from(flag))))
}

/// List all feature flags
pub async fn list(
    State(state): State<AppState>,
    JwtUser(_user_id): JwtUser,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let flags = sqlx::query_as::<_, FeatureFlag>(&format!(
        r#"
        SELECT {FLAG_COLUMNS}
        FROM feature_flags
        ORDER BY created_at DESC
        "#,
    ))
    .fetch_all(&state.db)
    .await
    .map_err(|e| {
        tracing::error!("Failed to fetch flags: {e:?}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to fetch flags".to_string(),
        )
    })?;

    let response: Vec<FlagResponse> = flags.into_iter().map(FlagResponse::from).collect();

    Ok(Json(response))
}

/// Get a single flag by ID
pub async fn get(
    State(state): State<AppState>,
    JwtUser(_user_id): JwtUser,
    Path(flag_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let flag = fetch_flag(&state, flag_id).await?;

    Ok(Json(FlagResponse::from(flag)))
}

/// Update a feature flag. Changing the type resets the value fields that no
/// longer apply.
pub async fn update(
    State(state): State<AppState>,
    JwtUser(user_id): JwtUser,
    Path(flag_id): Path<Uuid>,
    Json(payload): Json<UpdateFlagRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if let Some(percentage) = payload.rollout_percentage {
        validate_rollout_percentage(percentage).map_err(|e| (StatusCode::BAD_REQUEST, e))?;
    }

    let existing = fetch_flag(&state, flag_id).await?;

    let (new_type, is_enabled, rollout_percentage, config_json) =
        resolve_update_fields(&payload, &existing);
    let description = payload.description.clone().or_else(|| existing.description.clone());

    let updated = sqlx::query_as::<_, FeatureFlag>(&format!(
        r#"
        UPDATE feature_flags
        SET
            description = $2,
            flag_type = $3,
            is_enabled = $4,
            rollout_percentage = $5,
            config_json = $6,
            updated_at = NOW()
        WHERE id = $1
        RETURNING {FLAG_COLUMNS}
        "#,
    ))
    .bind(flag_id)
    .bind(&description)
    .bind(new_type)
    .bind(is_enabled)
    .bind(rollout_percentage)
    .bind(&config_json)
    .fetch_one(&state.db)
    .await
    .map_err(|e| {
        tracing::error!("Failed to update flag: {e:?}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to update flag".to_string(),
        )
    })?;

    record_change(&state, flag_id, user_id, &existing, &updated).await;

    Ok(Json(FlagResponse::from(updated)))
}

/// Toggle a BOOLEAN flag's enabled state
pub async fn toggle(
    State(state): State<AppState>,
    JwtUser(user_id): JwtUser,
    Path(flag_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let existing = fetch_flag(&state, flag_id).await?;

    if existing.flag_type != FlagType::Boolean {
        return Err((
            StatusCode::BAD_REQUEST,
            "Only BOOLEAN flags can be toggled".to_string(),
        ));
    }

    let new_state = !existing.is_enabled.unwrap_or(false);

    let updated = sqlx::query_as::<_, FeatureFlag>(&format!(
        r#"
        UPDATE feature_flags
        SET is_enabled = $2, updated_at = NOW()
        WHERE id = $1
        RETURNING {FLAG_COLUMNS}
        "#,
    ))
    .bind(flag_id)
    .bind(new_state)
    .fetch_one(&state.db)
    .await
    .map_err(|e| {
        tracing::error!("Failed to toggle flag: {e:?}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to toggle flag".to_string(),
        )
    })?;

    record_change(&state, flag_id, user_id, &existing, &updated).await;

    Ok(Json(FlagResponse::from(updated)))
}

/// Delete a feature flag (cascades to its rules and logs)
pub async fn delete(
    State(state): State<AppState>,
    JwtUser(_user_id): JwtUser,
    Path(flag_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let result = sqlx::query("DELETE FROM feature_flags WHERE id = $1")
        .bind(flag_id)
        .execute(&state.db)
        .await
        .map_err(|e| {
            tracing::error!("Failed to delete flag: {e:?}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to delete flag".to_string(),
            )
        })?;

    if result.rows_affected() == 0 {
        return Err((StatusCode::NOT_FOUND, "Flag not found".to_string()));
    }

    Ok(StatusCode::NO_CONTENT)
}

async fn fetch_flag(state: &AppState, flag_id: Uuid) -> Result<FeatureFlag, (StatusCode, String)> {
    let flag = sqlx::query_as::<_, FeatureFlag>(&format!(
        r#"
        SELECT {FLAG_COLUMNS}
        FROM feature_flags
        WHERE id = $1
        "#,
    ))
    .bind(flag_id)
    .fetch_optional(&state.db)
    .await
    .map_err(|e| {
        tracing::error!("Failed to fetch flag: {e:?}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to fetch flag".to_string(),
        )
    })?;

    flag.ok_or((StatusCode::NOT_FOUND, "Flag not found".to_string()))
}

// Best-effort change history; a failed insert never fails the mutation.
async fn record_change(
    state: &AppState,
    flag_id: Uuid,
    changed_by: Uuid,
    old: &FeatureFlag,
    new: &FeatureFlag,
) {
    let old_value = serde_json::to_value(old).unwrap_or(Value::Null);
    let new_value = serde_json::to_value(new).unwrap_or(Value::Null);

    if let Err(e) = sqlx::query(
        r#"
        INSERT INTO flag_change_history (flag_id, changed_by, old_value, new_value)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(flag_id)
    .bind(changed_by.to_string())
    .bind(old_value)
    .bind(new_value)
    .execute(&state.db)
    .await
    {
        tracing::warn!("Failed to record flag change: {e:?}");
    }
}
