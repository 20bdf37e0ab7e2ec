use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use uuid::Uuid;

use super::{validate_rule, CreateRuleRequest, RuleResponse, TargetingRule};
use crate::routes::middleware_auth::JwtUser;
use crate::state::AppState;

// HANDLERS

/// Add a targeting rule to a flag
pub async fn create(
    State(state): State<AppState>,
    JwtUser(_user_id): JwtUser,
    Path(flag_id): Path<Uuid>,
    Json(payload): Json<CreateRuleRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    validate_rule(&payload).map_err(|e| (StatusCode::BAD_REQUEST, e))?;

    let flag_exists =
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM feature_flags WHERE id = $1)")
            .bind(flag_id)
            .fetch_one(&state.db)
            .await
            .map_err(|e| {
                tracing::error!("Failed to check flag: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                )
            })?;

    if !flag_exists {
        return Err((StatusCode::NOT_FOUND, "Flag not found".to_string()));
    }

    if let Some(group_id) = payload.group_id {
        let group_exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM user_groups WHERE id = $1)",
        )
        .bind(group_id)
        .fetch_one(&state.db)
        .await
        .map_err(|e| {
            tracing::error!("Failed to check group: {e:?}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
            )
        })?;

        if !group_exists {
            return Err((StatusCode::NOT_FOUND, "Group not found".to_string()));
        }
    }

    let rule = sqlx::query_as::<_, TargetingRule>(
        r#"
        INSERT INTO targeting_rules (flag_id, targeting_type, attribute, operator, value, group_id)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id, flag_id, targeting_type, attribute, operator, value, group_id, created_at
        "#,
    )
    .bind(flag_id)
    .bind(payload.targeting_type)
    .bind(&payload.attribute)
    .bind(payload.operator)
    .bind(&payload.value)
    .bind(payload.group_id)
    .fetch_one(&state.db)
    .await
    .map_err(|e| {
        tracing::error!("Failed to create rule: {e:?}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Database error".to_string(),
        )
    })?;

    Ok((StatusCode::CREATED, Json(RuleResponse::from(rule))))
}

/// List all targeting rules for a flag, in evaluation order
pub async fn list(
    State(state): State<AppState>,
    JwtUser(_user_id): JwtUser,
    Path(flag_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let flag_exists =
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM feature_flags WHERE id = $1)")
            .bind(flag_id)
            .fetch_one(&state.db)
            .await
            .map_err(|e| {
                tracing::error!("Failed to check flag: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                )
            })?;

    if !flag_exists {
        return Err((StatusCode::NOT_FOUND, "Flag not found".to_string()));
    }

    let rules = sqlx::query_as::<_, TargetingRule>(
        r#"
        SELECT id, flag_id, targeting_type, attribute, operator, value, group_id, created_at
        FROM targeting_rules
        WHERE flag_id = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(flag_id)
    .fetch_all(&state.db)
    .await
    .map_err(|e| {
        tracing::error!("Failed to fetch rules: {e:?}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to fetch rules".to_string(),
        )
    })?;

    let response: Vec<RuleResponse> = rules.into_iter().map(RuleResponse::from).collect();

    Ok(Json(response))
}

/// Remove a targeting rule
pub async fn delete(
    State(state): State<AppState>,
    JwtUser(_user_id): JwtUser,
    Path(rule_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let result = sqlx::query("DELETE FROM targeting_rules WHERE id = $1")
        .bind(rule_id)
        .execute(&state.db)
        .await
        .map_err(|e| {
            tracing::error!("Failed to delete rule: {e:?}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to delete rule".to_string(),
            )
        })?;

    if result.rows_affected() == 0 {
        return Err((
            StatusCode::NOT_FOUND,
            "Targeting rule not found".to_string(),
        ));
    }

    Ok(StatusCode::NO_CONTENT)
}
