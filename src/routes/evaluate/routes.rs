use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use super::EvaluationRequest;
use crate::evaluation::{
    evaluate_flag, FlagSnapshot, FlagType, MembershipStore, Operator, RuleSnapshot, TargetingType,
};
use crate::state::AppState;

#[derive(Debug, sqlx::FromRow)]
struct FlagRow {
    id: Uuid,
    key: String,
    flag_type: FlagType,
    is_enabled: Option<bool>,
    rollout_percentage: Option<i32>,
    config_json: Option<Value>,
}

#[derive(Debug, sqlx::FromRow)]
struct RuleRow {
    targeting_type: TargetingType,
    attribute: Option<String>,
    operator: Option<Operator>,
    value: Option<Value>,
    group_id: Option<Uuid>,
}

/// Membership lookup backed by the memberships table. Ids that are not
/// UUIDs cannot belong to any group.
pub struct PgMemberships<'a>(pub &'a PgPool);

impl MembershipStore for PgMemberships<'_> {
    async fn is_member(&self, user_id: &str, group_id: Uuid) -> Result<bool, sqlx::Error> {
        let Ok(user_id) = Uuid::parse_str(user_id) else {
            return Ok(false);
        };

        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM user_group_memberships WHERE user_id = $1 AND group_id = $2)",
        )
        .bind(user_id)
        .bind(group_id)
        .fetch_one(self.0)
        .await
    }
}

/// Evaluate a flag for a user / attribute context.
/// Body: `{flagKey, userId?, userAttributes?}` → `{flagKey, result, matched}`
pub async fn evaluate(
    State(state): State<AppState>,
    Json(request): Json<EvaluationRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if request.flag_key.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "Flag key is required and cannot be empty".to_string(),
        ));
    }

    let flag: Option<FlagRow> = sqlx::query_as(
        r#"
        SELECT id, key, flag_type, is_enabled, rollout_percentage, config_json
        FROM feature_flags
        WHERE key = $1
        "#,
    )
    .bind(&request.flag_key)
    .fetch_optional(&state.db)
    .await
    .map_err(|e| {
        tracing::error!("Failed to fetch flag: {e:?}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to fetch flag".to_string(),
        )
    })?;

    let Some(flag) = flag else {
        return Err((StatusCode::NOT_FOUND, "Flag not found".to_string()));
    };

    let rules: Vec<RuleRow> = sqlx::query_as(
        r#"
        SELECT targeting_type, attribute, operator, value, group_id
        FROM targeting_rules
        WHERE flag_id = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(flag.id)
    .fetch_all(&state.db)
    .await
    .map_err(|e| {
        tracing::error!("Failed to fetch rules: {e:?}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to fetch rules".to_string(),
        )
    })?;

    let snapshot = FlagSnapshot {
        id: flag.id,
        key: flag.key,
        flag_type: flag.flag_type,
        is_enabled: flag.is_enabled,
        rollout_percentage: flag.rollout_percentage,
        config_json: flag.config_json,
        rules: rules
            .into_iter()
            .map(|r| RuleSnapshot {
                targeting_type: r.targeting_type,
                attribute: r.attribute,
                operator: r.operator,
                value: r.value,
                group_id: r.group_id,
            })
            .collect(),
    };

    let evaluation = evaluate_flag(&snapshot, &request, &PgMemberships(&state.db))
        .await
        .map_err(|e| {
            tracing::error!("Membership lookup failed: {e:?}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
            )
        })?;

    // Best-effort audit trail; a failed insert never fails the evaluation.
    if let Some(user_id) = &request.user_id {
        let logged = sqlx::query(
            r#"
            INSERT INTO flag_evaluation_logs (flag_id, user_id, result)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(snapshot.id)
        .bind(user_id)
        .bind(serde_json::to_value(&evaluation.result).unwrap_or(Value::Null))
        .execute(&state.db)
        .await;

        if let Err(e) = logged {
            tracing::warn!("Failed to record evaluation log: {e:?}");
        }
    }

    Ok(Json(evaluation))
}
