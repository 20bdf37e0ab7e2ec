use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use uuid::Uuid;

// Flag value kinds. Exactly one of the type-specific columns is set per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "flag_type", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum FlagType {
    Boolean,
    Percentage,
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "targeting_type", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum TargetingType {
    Attribute,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "rule_operator", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    Equals,
    In,
    NotIn,
    GreaterThan,
    LessThan,
}

/// A flag loaded for evaluation, with its rules in creation order.
#[derive(Debug, Clone)]
pub struct FlagSnapshot {
    pub id: Uuid,
    pub key: String,
    pub flag_type: FlagType,
    pub is_enabled: Option<bool>,
    pub rollout_percentage: Option<i32>,
    pub config_json: Option<Value>,
    pub rules: Vec<RuleSnapshot>,
}

#[derive(Debug, Clone)]
pub struct RuleSnapshot {
    pub targeting_type: TargetingType,
    pub attribute: Option<String>,
    pub operator: Option<Operator>,
    pub value: Option<Value>,
    pub group_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationRequest {
    pub flag_key: String,
    pub user_id: Option<String>,
    pub user_attributes: Option<HashMap<String, Value>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub flag_key: String,
    pub result: EvaluationValue,
    pub matched: bool,
}

/// Typed evaluation outcome. Serializes untagged, so the wire shape is
/// `true`/`false` for BOOLEAN and PERCENTAGE flags, an object for CONFIG
/// flags and `null` when a CONFIG flag does not apply.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EvaluationValue {
    Bool(bool),
    Config(Value),
    None,
}

/// Membership lookup needed by GROUP rules. Injected so the engine can be
/// exercised without a database.
pub trait MembershipStore {
    fn is_member(
        &self,
        user_id: &str,
        group_id: Uuid,
    ) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;
}

/// Evaluate a flag against a request context.
///
/// Rules are OR'ed with first-match-wins; a flag with no rules at all applies
/// to everyone. A matched flag yields its type-specific value, an unmatched
/// one the type's default (false, or null for CONFIG). Membership lookup
/// failures propagate; they affect the correctness of the verdict.
pub async fn evaluate_flag<M: MembershipStore>(
    flag: &FlagSnapshot,
    request: &EvaluationRequest,
    memberships: &M,
) -> Result<EvaluationResult, sqlx::Error> {
    let mut matched = any_rule_matches(&flag.rules, request, memberships).await?;

    // No targeting rules means the flag applies unconditionally.
    if !matched && flag.rules.is_empty() {
        matched = true;
    }

    let result = if matched {
        matched_value(flag, request)
    } else {
        default_value(flag.flag_type)
    };

    Ok(EvaluationResult {
        flag_key: flag.key.clone(),
        result,
        matched,
    })
}

async fn any_rule_matches<M: MembershipStore>(
    rules: &[RuleSnapshot],
    request: &EvaluationRequest,
    memberships: &M,
) -> Result<bool, sqlx::Error> {
    // Rules can only target an identified user.
    let Some(user_id) = request.user_id.as_deref() else {
        return Ok(false);
    };

    for rule in rules {
        if rule_matches(rule, user_id, request.user_attributes.as_ref(), memberships).await? {
            return Ok(true);
        }
    }

    Ok(false)
}

async fn rule_matches<M: MembershipStore>(
    rule: &RuleSnapshot,
    user_id: &str,
    user_attributes: Option<&HashMap<String, Value>>,
    memberships: &M,
) -> Result<bool, sqlx::Error> {
    match rule.targeting_type {
        TargetingType::Group => match rule.group_id {
            Some(group_id) => memberships.is_member(user_id, group_id).await,
            None => Ok(false),
        },
        TargetingType::Attribute => Ok(attribute_matches(rule, user_attributes)),
    }
}

/// Compare a user attribute against a rule operand. Unset pieces of the rule
/// and malformed operands never match.
fn attribute_matches(rule: &RuleSnapshot, user_attributes: Option<&HashMap<String, Value>>) -> bool {
    let (Some(attributes), Some(attribute), Some(operator), Some(rule_value)) = (
        user_attributes,
        rule.attribute.as_deref(),
        rule.operator,
        rule.value.as_ref(),
    ) else {
        return false;
    };

    let user_value = attributes.get(attribute);

    match operator {
        // Strict equality: "1" is not 1.
        Operator::Equals => user_value == Some(rule_value),
        Operator::In => rule_value
            .as_array()
            .is_some_and(|values| user_value.is_some_and(|v| values.contains(v))),
        Operator::NotIn => rule_value
            .as_array()
            .is_some_and(|values| !user_value.is_some_and(|v| values.contains(v))),
        Operator::GreaterThan => {
            match (user_value.and_then(coerce_number), coerce_number(rule_value)) {
                (Some(user), Some(operand)) => user > operand,
                _ => false,
            }
        }
        Operator::LessThan => {
            match (user_value.and_then(coerce_number), coerce_number(rule_value)) {
                (Some(user), Some(operand)) => user < operand,
                _ => false,
            }
        }
    }
}

// Loose numeric coercion for the ordering operators. Values that do not
// coerce to a number never satisfy a comparison.
fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn matched_value(flag: &FlagSnapshot, request: &EvaluationRequest) -> EvaluationValue {
    match flag.flag_type {
        FlagType::Boolean => EvaluationValue::Bool(flag.is_enabled.unwrap_or(false)),
        FlagType::Percentage => match (request.user_id.as_deref(), flag.rollout_percentage) {
            (Some(user_id), Some(percentage)) => {
                EvaluationValue::Bool((bucket(user_id) as i32) < percentage)
            }
            _ => EvaluationValue::Bool(false),
        },
        FlagType::Config => match &flag.config_json {
            Some(config) => EvaluationValue::Config(config.clone()),
            None => EvaluationValue::None,
        },
    }
}

fn default_value(flag_type: FlagType) -> EvaluationValue {
    match flag_type {
        FlagType::Boolean | FlagType::Percentage => EvaluationValue::Bool(false),
        FlagType::Config => EvaluationValue::None,
    }
}

/// Map a user id to a stable bucket in [0, 100).
///
/// 32-bit rolling hash over UTF-16 code units (`h = h * 31 + c` with signed
/// wraparound, then `|h| % 100`), bit-compatible with the assignments already
/// stored in the evaluation log. Because rollout membership is decided by
/// `bucket < percentage`, raising a percentage never drops a user out.
pub fn bucket(user_id: &str) -> u32 {
    let mut hash: i32 = 0;
    for unit in user_id.encode_utf16() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit));
    }
    hash.unsigned_abs() % 100
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StaticMemberships(Vec<(String, Uuid)>);

    impl MembershipStore for StaticMemberships {
        async fn is_member(&self, user_id: &str, group_id: Uuid) -> Result<bool, sqlx::Error> {
            Ok(self
                .0
                .iter()
                .any(|(member, group)| member == user_id && *group == group_id))
        }
    }

    struct FailingMemberships;

    impl MembershipStore for FailingMemberships {
        async fn is_member(&self, _user_id: &str, _group_id: Uuid) -> Result<bool, sqlx::Error> {
            Err(sqlx::Error::PoolClosed)
        }
    }

    fn no_memberships() -> StaticMemberships {
        StaticMemberships(Vec::new())
    }

    fn boolean_flag(key: &str, enabled: bool, rules: Vec<RuleSnapshot>) -> FlagSnapshot {
        FlagSnapshot {
            id: Uuid::new_v4(),
            key: key.to_string(),
            flag_type: FlagType::Boolean,
            is_enabled: Some(enabled),
            rollout_percentage: None,
            config_json: None,
            rules,
        }
    }

    fn attribute_rule(attribute: &str, operator: Operator, value: Value) -> RuleSnapshot {
        RuleSnapshot {
            targeting_type: TargetingType::Attribute,
            attribute: Some(attribute.to_string()),
            operator: Some(operator),
            value: Some(value),
            group_id: None,
        }
    }

    fn request(
        flag_key: &str,
        user_id: Option<&str>,
        attributes: Option<Value>,
    ) -> EvaluationRequest {
        EvaluationRequest {
            flag_key: flag_key.to_string(),
            user_id: user_id.map(str::to_string),
            user_attributes: attributes
                .map(|v| serde_json::from_value(v).expect("attributes must be an object")),
        }
    }

    #[tokio::test]
    async fn flag_without_rules_applies_to_everyone() {
        let flag = boolean_flag("beta", true, vec![]);
        let result = evaluate_flag(&flag, &request("beta", None, None), &no_memberships())
            .await
            .unwrap();

        assert!(result.matched);
        assert_eq!(result.result, EvaluationValue::Bool(true));
        assert_eq!(result.flag_key, "beta");
    }

    #[tokio::test]
    async fn attribute_equals_mismatch_falls_back_to_default() {
        let flag = boolean_flag(
            "geo",
            true,
            vec![attribute_rule("country", Operator::Equals, json!("PL"))],
        );
        let req = request("geo", Some("u1"), Some(json!({"country": "DE"})));
        let result = evaluate_flag(&flag, &req, &no_memberships()).await.unwrap();

        assert!(!result.matched);
        assert_eq!(result.result, EvaluationValue::Bool(false));
    }

    #[tokio::test]
    async fn attribute_equals_match_returns_enabled_value() {
        let flag = boolean_flag(
            "geo",
            true,
            vec![attribute_rule("country", Operator::Equals, json!("PL"))],
        );
        let req = request("geo", Some("u1"), Some(json!({"country": "PL"})));
        let result = evaluate_flag(&flag, &req, &no_memberships()).await.unwrap();

        assert!(result.matched);
        assert_eq!(result.result, EvaluationValue::Bool(true));
    }

    #[tokio::test]
    async fn rules_never_match_without_a_user_id() {
        let flag = boolean_flag(
            "geo",
            true,
            vec![attribute_rule("country", Operator::Equals, json!("PL"))],
        );
        // Attributes alone are not enough to target a rule.
        let req = request("geo", None, Some(json!({"country": "PL"})));
        let result = evaluate_flag(&flag, &req, &no_memberships()).await.unwrap();

        assert!(!result.matched);
        assert_eq!(result.result, EvaluationValue::Bool(false));
    }

    #[tokio::test]
    async fn equals_is_type_sensitive() {
        let flag = boolean_flag(
            "strict",
            true,
            vec![attribute_rule("version", Operator::Equals, json!("1"))],
        );
        let req = request("strict", Some("u1"), Some(json!({"version": 1})));
        let result = evaluate_flag(&flag, &req, &no_memberships()).await.unwrap();

        assert!(!result.matched);
    }

    #[tokio::test]
    async fn in_operator_matches_array_element() {
        let flag = boolean_flag(
            "regions",
            true,
            vec![attribute_rule("country", Operator::In, json!(["PL", "DE"]))],
        );
        let req = request("regions", Some("u1"), Some(json!({"country": "DE"})));
        let result = evaluate_flag(&flag, &req, &no_memberships()).await.unwrap();

        assert!(result.matched);
    }

    #[tokio::test]
    async fn not_in_with_non_array_operand_fails_closed() {
        let flag = boolean_flag(
            "blocklist",
            true,
            vec![attribute_rule("country", Operator::NotIn, json!("PL"))],
        );
        let req = request("blocklist", Some("u1"), Some(json!({"country": "DE"})));
        let result = evaluate_flag(&flag, &req, &no_memberships()).await.unwrap();

        assert!(!result.matched);
    }

    #[tokio::test]
    async fn not_in_matches_value_outside_array() {
        let flag = boolean_flag(
            "blocklist",
            true,
            vec![attribute_rule("country", Operator::NotIn, json!(["PL"]))],
        );
        let req = request("blocklist", Some("u1"), Some(json!({"country": "DE"})));
        let result = evaluate_flag(&flag, &req, &no_memberships()).await.unwrap();

        assert!(result.matched);
    }

    #[tokio::test]
    async fn ordering_operators_coerce_numeric_strings() {
        let flag = boolean_flag(
            "seats",
            true,
            vec![attribute_rule("seats", Operator::GreaterThan, json!(10))],
        );
        let req = request("seats", Some("u1"), Some(json!({"seats": "42"})));
        let result = evaluate_flag(&flag, &req, &no_memberships()).await.unwrap();

        assert!(result.matched);
    }

    #[tokio::test]
    async fn ordering_operator_with_non_numeric_value_never_matches() {
        let flag = boolean_flag(
            "seats",
            true,
            vec![attribute_rule("seats", Operator::LessThan, json!(10))],
        );
        let req = request("seats", Some("u1"), Some(json!({"seats": "lots"})));
        let result = evaluate_flag(&flag, &req, &no_memberships()).await.unwrap();

        assert!(!result.matched);
    }

    #[tokio::test]
    async fn ordering_operator_with_null_value_never_matches() {
        // An attribute explicitly set to null is not coerced to 0.
        let flag = boolean_flag(
            "seats",
            true,
            vec![attribute_rule("seats", Operator::LessThan, json!(10))],
        );
        let req = request("seats", Some("u1"), Some(json!({"seats": null})));
        let result = evaluate_flag(&flag, &req, &no_memberships()).await.unwrap();

        assert!(!result.matched);
    }

    #[tokio::test]
    async fn group_rule_matches_only_members() {
        let group_id = Uuid::new_v4();
        let rule = RuleSnapshot {
            targeting_type: TargetingType::Group,
            attribute: None,
            operator: None,
            value: None,
            group_id: Some(group_id),
        };
        let flag = boolean_flag("internal", true, vec![rule]);
        let memberships = StaticMemberships(vec![("member-1".to_string(), group_id)]);

        let hit = evaluate_flag(
            &flag,
            &request("internal", Some("member-1"), None),
            &memberships,
        )
        .await
        .unwrap();
        assert!(hit.matched);
        assert_eq!(hit.result, EvaluationValue::Bool(true));

        let miss = evaluate_flag(
            &flag,
            &request("internal", Some("outsider"), None),
            &memberships,
        )
        .await
        .unwrap();
        assert!(!miss.matched);
        assert_eq!(miss.result, EvaluationValue::Bool(false));
    }

    #[tokio::test]
    async fn group_rule_without_group_id_never_matches() {
        let rule = RuleSnapshot {
            targeting_type: TargetingType::Group,
            attribute: None,
            operator: None,
            value: None,
            group_id: None,
        };
        let flag = boolean_flag("internal", true, vec![rule]);
        let result = evaluate_flag(
            &flag,
            &request("internal", Some("u1"), None),
            &no_memberships(),
        )
        .await
        .unwrap();

        assert!(!result.matched);
    }

    #[tokio::test]
    async fn membership_lookup_failure_propagates() {
        let rule = RuleSnapshot {
            targeting_type: TargetingType::Group,
            attribute: None,
            operator: None,
            value: None,
            group_id: Some(Uuid::new_v4()),
        };
        let flag = boolean_flag("internal", true, vec![rule]);
        let result =
            evaluate_flag(&flag, &request("internal", Some("u1"), None), &FailingMemberships).await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn first_matching_rule_wins() {
        let group_rule = RuleSnapshot {
            targeting_type: TargetingType::Group,
            attribute: None,
            operator: None,
            value: None,
            group_id: Some(Uuid::new_v4()),
        };
        let flag = boolean_flag(
            "mixed",
            true,
            vec![
                attribute_rule("country", Operator::Equals, json!("PL")),
                group_rule,
            ],
        );
        // First rule matches; the group lookup would fail if it were reached.
        let req = request("mixed", Some("u1"), Some(json!({"country": "PL"})));
        let result = evaluate_flag(&flag, &req, &FailingMemberships).await.unwrap();

        assert!(result.matched);
    }

    fn percentage_flag(key: &str, percentage: Option<i32>) -> FlagSnapshot {
        FlagSnapshot {
            id: Uuid::new_v4(),
            key: key.to_string(),
            flag_type: FlagType::Percentage,
            is_enabled: None,
            rollout_percentage: percentage,
            config_json: None,
            rules: vec![],
        }
    }

    #[tokio::test]
    async fn zero_percent_rollout_is_always_false() {
        let flag = percentage_flag("rollout", Some(0));
        for user in ["u1", "u2", "another-user", "x"] {
            let result = evaluate_flag(
                &flag,
                &request("rollout", Some(user), None),
                &no_memberships(),
            )
            .await
            .unwrap();
            assert!(result.matched);
            assert_eq!(result.result, EvaluationValue::Bool(false));
        }
    }

    #[tokio::test]
    async fn full_rollout_is_always_true_for_identified_users() {
        let flag = percentage_flag("rollout", Some(100));
        for user in ["u1", "u2", "another-user", "x"] {
            let result = evaluate_flag(
                &flag,
                &request("rollout", Some(user), None),
                &no_memberships(),
            )
            .await
            .unwrap();
            assert_eq!(result.result, EvaluationValue::Bool(true));
        }
    }

    #[tokio::test]
    async fn percentage_without_user_id_is_false() {
        let flag = percentage_flag("rollout", Some(100));
        let result = evaluate_flag(&flag, &request("rollout", None, None), &no_memberships())
            .await
            .unwrap();

        // No rules, so the flag matches, but there is nobody to bucket.
        assert!(result.matched);
        assert_eq!(result.result, EvaluationValue::Bool(false));
    }

    #[tokio::test]
    async fn percentage_without_configured_percentage_is_false() {
        let flag = percentage_flag("rollout", None);
        let result = evaluate_flag(&flag, &request("rollout", Some("u1"), None), &no_memberships())
            .await
            .unwrap();

        assert!(result.matched);
        assert_eq!(result.result, EvaluationValue::Bool(false));
    }

    #[tokio::test]
    async fn config_flag_returns_blob_when_matched_and_null_otherwise() {
        let config = json!({"theme": "dark", "retries": 3});
        let mut flag = FlagSnapshot {
            id: Uuid::new_v4(),
            key: "ui-config".to_string(),
            flag_type: FlagType::Config,
            is_enabled: None,
            rollout_percentage: None,
            config_json: Some(config.clone()),
            rules: vec![],
        };

        let matched = evaluate_flag(&flag, &request("ui-config", None, None), &no_memberships())
            .await
            .unwrap();
        assert_eq!(matched.result, EvaluationValue::Config(config));

        flag.rules = vec![attribute_rule("plan", Operator::Equals, json!("pro"))];
        let unmatched = evaluate_flag(
            &flag,
            &request("ui-config", Some("u1"), Some(json!({"plan": "free"}))),
            &no_memberships(),
        )
        .await
        .unwrap();
        assert!(!unmatched.matched);
        assert_eq!(unmatched.result, EvaluationValue::None);
        assert_eq!(
            serde_json::to_value(&unmatched.result).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn bucket_is_deterministic_and_in_range() {
        for user in ["u1", "user123", "someone@example.com", "", "żółw"] {
            let first = bucket(user);
            assert!(first < 100);
            assert_eq!(first, bucket(user));
        }
    }

    #[test]
    fn bucket_matches_reference_hash() {
        // h("") = 0, h("a") = 97, h("ab") = 97 * 31 + 98 = 3105
        assert_eq!(bucket(""), 0);
        assert_eq!(bucket("a"), 97);
        assert_eq!(bucket("ab"), 5);
    }

    #[test]
    fn rollout_membership_is_monotonic_in_the_percentage() {
        for i in 0..200 {
            let user = format!("user-{i}");
            let b = bucket(&user) as i32;
            for x in 0..100 {
                if b < x {
                    for y in (x + 1)..=100 {
                        assert!(b < y, "user in {x}% rollout must stay in {y}% rollout");
                    }
                }
            }
        }
    }
}
