pub mod routes;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// MODELS

#[derive(Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserGroup {
    pub id: Uuid,
    pub key: String,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub member_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupRequest {
    pub key: String,
    pub name: String,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateGroupRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupResponse {
    pub id: Uuid,
    pub key: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub is_active: bool,
    pub member_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<UserGroup> for GroupResponse {
    fn from(g: UserGroup) -> Self {
        GroupResponse {
            id: g.id,
            key: g.key,
            name: g.name,
            description: g.description,
            is_active: g.is_active,
            member_count: g.member_count,
            created_at: g.created_at,
            updated_at: g.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipResponse {
    pub id: Uuid,
    pub user_id: Uuid,
    pub group_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub user: MemberUser,
}

#[derive(Debug, Serialize)]
pub struct MemberUser {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

// HELPER FUNCTIONS

/// Validate group key format
pub fn validate_group_key(key: &str) -> Result<(), String> {
    if key.is_empty() {
        return Err("Group key cannot be empty".to_string());
    }

    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(
            "Group key must contain only alphanumeric characters, hyphens, and underscores"
                .to_string(),
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_group_key() {
        assert!(validate_group_key("beta-testers").is_ok());
        assert!(validate_group_key("internal_users").is_ok());
        assert!(validate_group_key("Team42").is_ok());

        assert!(validate_group_key("").is_err());
        assert!(validate_group_key("has space").is_err());
        assert!(validate_group_key("has.dot").is_err());
    }
}
