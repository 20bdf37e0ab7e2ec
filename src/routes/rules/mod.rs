pub mod routes;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::evaluation::{Operator, TargetingType};

// MODELS

#[derive(Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct TargetingRule {
    pub id: Uuid,
    pub flag_id: Uuid,
    pub targeting_type: TargetingType,
    pub attribute: Option<String>,
    pub operator: Option<Operator>,
    pub value: Option<Value>,
    pub group_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRuleRequest {
    pub targeting_type: TargetingType,
    pub attribute: Option<String>,
    pub operator: Option<Operator>,
    pub value: Option<Value>,
    pub group_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleResponse {
    pub id: Uuid,
    pub flag_id: Uuid,
    pub targeting_type: TargetingType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator: Option<Operator>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<TargetingRule> for RuleResponse {
    fn from(r: TargetingRule) -> Self {
        RuleResponse {
            id: r.id,
            flag_id: r.flag_id,
            targeting_type: r.targeting_type,
            attribute: r.attribute,
            operator: r.operator,
            value: r.value,
            group_id: r.group_id,
            created_at: r.created_at,
        }
    }
}

// HELPER FUNCTIONS

/// ATTRIBUTE rules need all three comparison parts, GROUP rules a group.
pub fn validate_rule(payload: &CreateRuleRequest) -> Result<(), String> {
    match payload.targeting_type {
        TargetingType::Attribute => {
            if payload.attribute.as_deref().map_or(true, |a| a.trim().is_empty()) {
                return Err("Attribute is required for ATTRIBUTE targeting".to_string());
            }
            if payload.operator.is_none() {
                return Err("Operator is required for ATTRIBUTE targeting".to_string());
            }
            if payload.value.is_none() {
                return Err("Value is required for ATTRIBUTE targeting".to_string());
            }
        }
        TargetingType::Group => {
            if payload.group_id.is_none() {
                return Err("Group ID is required for GROUP targeting".to_string());
            }
        }
    }

    Ok(())
}
