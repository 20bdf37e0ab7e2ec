pub mod routes;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::evaluation::FlagType;

// MODELS

#[derive(Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct FeatureFlag {
    pub id: Uuid,
    pub key: String,
    pub description: Option<String>,
    pub flag_type: FlagType,
    pub is_enabled: Option<bool>,
    pub rollout_percentage: Option<i32>,
    pub config_json: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFlagRequest {
    pub key: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub flag_type: FlagType,
    pub is_enabled: Option<bool>,
    pub rollout_percentage: Option<i32>,
    pub config_json: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFlagRequest {
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub flag_type: Option<FlagType>,
    pub is_enabled: Option<bool>,
    pub rollout_percentage: Option<i32>,
    pub config_json: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagResponse {
    pub id: Uuid,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub flag_type: FlagType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollout_percentage: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_json: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<FeatureFlag> for FlagResponse {
    fn from(f: FeatureFlag) -> Self {
        FlagResponse {
            id: f.id,
            key: f.key,
            description: f.description,
            flag_type: f.flag_type,
            is_enabled: f.is_enabled,
            rollout_percentage: f.rollout_percentage,
            config_json: f.config_json,
            created_at: f.created_at,
            updated_at: f.updated_at,
        }
    }
}

// HELPER FUNCTIONS

// Validating the flag key
pub fn validate_flag_key(key: &str) -> Result<(), String> {
    if key.is_empty() {
        return Err("Flag key cannot be empty".to_string());
    }

    if key.len() > 64 {
        return Err("Flag key is too long (Max: 64 characters)".to_string());
    }

    if !key.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        return Err("Flag key must start with a letter".to_string());
    }

    if !key
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err(
            "Flag key can only contain lowercase letters, numbers, underscores, and hyphens"
                .to_string(),
        );
    }

    Ok(())
}

// Checks if percentage number is between 0 and 100 inclusive
pub fn validate_rollout_percentage(percentage: i32) -> Result<(), String> {
    if !(0..=100).contains(&percentage) {
        return Err("Rollout percentage must be between 0 and 100".to_string());
    }

    Ok(())
}

/// Each flag type requires its own value field on creation.
pub fn validate_flag_payload(payload: &CreateFlagRequest) -> Result<(), String> {
    match payload.flag_type {
        FlagType::Boolean => {
            if payload.is_enabled.is_none() {
                return Err("isEnabled is required for BOOLEAN flags".to_string());
            }
        }
        FlagType::Percentage => match payload.rollout_percentage {
            None => return Err("rolloutPercentage is required for PERCENTAGE flags".to_string()),
            Some(percentage) => validate_rollout_percentage(percentage)?,
        },
        FlagType::Config => {
            if payload.config_json.is_none() {
                return Err("configJson is required for CONFIG flags".to_string());
            }
        }
    }

    Ok(())
}

/// Resolve the value fields for an update. Only the field matching the
/// effective type survives; the other two are cleared, so a stray
/// `rolloutPercentage` in a BOOLEAN update cannot land in the row.
pub fn resolve_update_fields(
    payload: &UpdateFlagRequest,
    existing: &FeatureFlag,
) -> (FlagType, Option<bool>, Option<i32>, Option<Value>) {
    let new_type = payload.flag_type.unwrap_or(existing.flag_type);

    let (is_enabled, rollout_percentage, config_json) = if payload.flag_type.is_some() {
        // Type change: drop the old type's value, take only the new one's.
        match new_type {
            FlagType::Boolean => (payload.is_enabled, None, None),
            FlagType::Percentage => (None, payload.rollout_percentage, None),
            FlagType::Config => (None, None, payload.config_json.clone()),
        }
    } else {
        // Same type: merge the applicable field, ignore the rest.
        match new_type {
            FlagType::Boolean => (payload.is_enabled.or(existing.is_enabled), None, None),
            FlagType::Percentage => (
                None,
                payload.rollout_percentage.or(existing.rollout_percentage),
                None,
            ),
            FlagType::Config => (
                None,
                None,
                payload
                    .config_json
                    .clone()
                    .or_else(|| existing.config_json.clone()),
            ),
        }
    };

    (new_type, is_enabled, rollout_percentage, config_json)
}
