//! Visibility evaluation (C2).
//!
//! Rules run in declared order over the submitted data; a rule whose
//! quantified conditions hold applies its actions, overwriting visibility
//! for the targeted fields. Later rules win for the same target. There is no
//! dependency analysis between rules.

use std::collections::HashMap;

use chrono::DateTime;
use formsandbox_contracts::canonical::json_structurally_equal;
use serde_json::Value;

use crate::{ConditionMode, ConditionOperator, NormalizedContract, RuleCondition, VisibilityAction};

/// Computes the visibility mapping for one submission.
pub fn evaluate_visibility(
    contract: &NormalizedContract,
    data: &serde_json::Map<String, Value>,
) -> HashMap<String, bool> {
    let mut visibility: HashMap<String, bool> = contract
        .fields()
        .map(|field| (field.id.clone(), field.default_visible))
        .collect();

    for rule in &contract.rules {
        let fired = match rule.mode {
            ConditionMode::All => rule.conditions.iter().all(|c| condition_holds(c, data)),
            ConditionMode::Any => rule.conditions.iter().any(|c| condition_holds(c, data)),
        };
        if !fired {
            continue;
        }
        for action in &rule.actions {
            visibility.insert(
                action.target_field_id.clone(),
                action.action == VisibilityAction::Show,
            );
        }
    }

    visibility
}

fn condition_holds(condition: &RuleCondition, data: &serde_json::Map<String, Value>) -> bool {
    let actual = data.get(&condition.field_id);
    let expected = condition.value.as_ref();

    match condition.operator {
        ConditionOperator::Eq => {
            let Some(expected) = expected else {
                return false;
            };
            json_structurally_equal(actual.unwrap_or(&Value::Null), expected)
        }
        ConditionOperator::Neq => {
            let Some(expected) = expected else {
                return false;
            };
            !json_structurally_equal(actual.unwrap_or(&Value::Null), expected)
        }
        ConditionOperator::In => member_of(actual.unwrap_or(&Value::Null), expected),
        ConditionOperator::NotIn => !member_of(actual.unwrap_or(&Value::Null), expected),
        ConditionOperator::Gt => ordered_compare(actual, expected, |ord| ord.is_gt()),
        ConditionOperator::Gte => ordered_compare(actual, expected, |ord| ord.is_ge()),
        ConditionOperator::Lt => ordered_compare(actual, expected, |ord| ord.is_lt()),
        ConditionOperator::Lte => ordered_compare(actual, expected, |ord| ord.is_le()),
        ConditionOperator::Contains => contains(actual, expected),
        ConditionOperator::NotContains => {
            if is_empty_actual(actual) {
                return true;
            }
            !contains(actual, expected)
        }
        ConditionOperator::Exists => value_exists(actual),
        ConditionOperator::NotExists => !value_exists(actual),
    }
}

fn member_of(actual: &Value, expected: Option<&Value>) -> bool {
    expected
        .and_then(Value::as_array)
        .map(|entries| entries.iter().any(|e| json_structurally_equal(actual, e)))
        .unwrap_or(false)
}

/// Ordered comparison: numeric when both sides coerce to finite numbers,
/// otherwise ISO-datetime when both sides parse with an offset, otherwise
/// the condition is false.
fn ordered_compare(
    actual: Option<&Value>,
    expected: Option<&Value>,
    check: fn(std::cmp::Ordering) -> bool,
) -> bool {
    let (Some(actual), Some(expected)) = (actual, expected) else {
        return false;
    };

    if let (Some(a), Some(b)) = (coerce_number(actual), coerce_number(expected)) {
        return a.partial_cmp(&b).map(check).unwrap_or(false);
    }

    if let (Some(a), Some(b)) = (coerce_datetime(actual), coerce_datetime(expected)) {
        return check(a.cmp(&b));
    }

    false
}

fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

fn coerce_datetime(value: &Value) -> Option<DateTime<chrono::FixedOffset>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
}

fn contains(actual: Option<&Value>, expected: Option<&Value>) -> bool {
    let (Some(actual), Some(expected)) = (actual, expected) else {
        return false;
    };

    match actual {
        Value::String(haystack) => expected
            .as_str()
            .map(|needle| haystack.contains(needle))
            .unwrap_or(false),
        Value::Array(entries) => entries.iter().any(|e| json_structurally_equal(e, expected)),
        _ => false,
    }
}

fn is_empty_actual(actual: Option<&Value>) -> bool {
    match actual {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(entries)) => entries.is_empty(),
        _ => false,
    }
}

/// `exists` semantics: non-null, non-empty-string-after-trim,
/// non-empty-array. Objects, numbers and booleans always exist.
fn value_exists(actual: Option<&Value>) -> bool {
    match actual {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Array(entries)) => !entries.is_empty(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_contract;
    use serde_json::json;

    fn data(value: Value) -> serde_json::Map<String, Value> {
        value.as_object().expect("test data must be an object").clone()
    }

    #[test]
    fn default_visibility_without_rules() {
        let contract = parse_contract(&json!({
            "fields": [
                {"id": "a", "type": "text"},
                {"id": "b", "type": "text", "hidden": true}
            ]
        }))
        .unwrap();

        let visibility = evaluate_visibility(&contract, &data(json!({})));
        assert_eq!(visibility["a"], true);
        assert_eq!(visibility["b"], false);
    }

    #[test]
    fn hide_rule_fires_on_eq_match() {
        let contract = parse_contract(&json!({
            "fields": [
                {"id": "contact_method", "type": "radio", "options": ["phone", "email"]},
                {"id": "details", "type": "text"}
            ],
            "logic": [{
                "if": [{"field_id": "contact_method", "operator": "eq", "value": "phone"}],
                "then": [{"type": "hide_field", "target": "details"}]
            }]
        }))
        .unwrap();

        let visibility =
            evaluate_visibility(&contract, &data(json!({"contact_method": "phone"})));
        assert_eq!(visibility["details"], false);

        let visibility =
            evaluate_visibility(&contract, &data(json!({"contact_method": "email"})));
        assert_eq!(visibility["details"], true);
    }

    #[test]
    fn later_rules_override_earlier_ones() {
        let contract = parse_contract(&json!({
            "fields": [{"id": "a", "type": "text"}, {"id": "b", "type": "text"}],
            "logic": [
                {"if": [{"id": "a", "operator": "exists"}], "then": {"type": "hide", "target": "b"}},
                {"if": [{"id": "a", "operator": "exists"}], "then": {"type": "show", "target": "b"}}
            ]
        }))
        .unwrap();

        let visibility = evaluate_visibility(&contract, &data(json!({"a": "x"})));
        assert_eq!(visibility["b"], true);
    }

    #[test]
    fn any_mode_needs_one_condition() {
        let contract = parse_contract(&json!({
            "fields": [{"id": "n", "type": "number"}, {"id": "b", "type": "text"}],
            "logic": [{
                "when": {"any": [
                    {"id": "n", "operator": "gt", "value": 10},
                    {"id": "n", "operator": "lt", "value": 0}
                ]},
                "then": {"type": "hide", "target": "b"}
            }]
        }))
        .unwrap();

        assert_eq!(evaluate_visibility(&contract, &data(json!({"n": 11})))["b"], false);
        assert_eq!(evaluate_visibility(&contract, &data(json!({"n": -1})))["b"], false);
        assert_eq!(evaluate_visibility(&contract, &data(json!({"n": 5})))["b"], true);
    }

    #[test]
    fn numeric_compare_coerces_strings() {
        let contract = parse_contract(&json!({
            "fields": [{"id": "n", "type": "text"}, {"id": "b", "type": "text"}],
            "logic": [{
                "if": [{"id": "n", "operator": ">=", "value": "10"}],
                "then": {"type": "hide", "target": "b"}
            }]
        }))
        .unwrap();

        assert_eq!(evaluate_visibility(&contract, &data(json!({"n": "12"})))["b"], false);
        assert_eq!(evaluate_visibility(&contract, &data(json!({"n": 9})))["b"], true);
        // Non-numeric, non-datetime operands never fire an ordered compare.
        assert_eq!(evaluate_visibility(&contract, &data(json!({"n": "abc"})))["b"], true);
    }

    #[test]
    fn datetime_compare_applies_when_not_numeric() {
        let contract = parse_contract(&json!({
            "fields": [{"id": "t", "type": "datetime"}, {"id": "b", "type": "text"}],
            "logic": [{
                "if": [{"id": "t", "operator": "gt", "value": "2026-01-01T00:00:00Z"}],
                "then": {"type": "hide", "target": "b"}
            }]
        }))
        .unwrap();

        let visibility =
            evaluate_visibility(&contract, &data(json!({"t": "2026-06-01T12:00:00+02:00"})));
        assert_eq!(visibility["b"], false);

        let visibility =
            evaluate_visibility(&contract, &data(json!({"t": "2025-06-01T00:00:00Z"})));
        assert_eq!(visibility["b"], true);
    }

    #[test]
    fn membership_uses_structural_equality() {
        let contract = parse_contract(&json!({
            "fields": [{"id": "v", "type": "text"}, {"id": "b", "type": "text"}],
            "logic": [{
                "if": [{"id": "v", "operator": "in", "value": ["x", 3]}],
                "then": {"type": "hide", "target": "b"}
            }]
        }))
        .unwrap();

        assert_eq!(evaluate_visibility(&contract, &data(json!({"v": "x"})))["b"], false);
        assert_eq!(evaluate_visibility(&contract, &data(json!({"v": 3})))["b"], false);
        assert_eq!(evaluate_visibility(&contract, &data(json!({"v": "3"})))["b"], true);
    }

    #[test]
    fn contains_covers_substring_and_array_membership() {
        let contract = parse_contract(&json!({
            "fields": [{"id": "v", "type": "text"}, {"id": "b", "type": "text"}],
            "logic": [{
                "if": [{"id": "v", "operator": "contains", "value": "needle"}],
                "then": {"type": "hide", "target": "b"}
            }]
        }))
        .unwrap();

        assert_eq!(
            evaluate_visibility(&contract, &data(json!({"v": "a needle here"})))["b"],
            false
        );
        assert_eq!(
            evaluate_visibility(&contract, &data(json!({"v": ["needle", "other"]})))["b"],
            false
        );
        assert_eq!(evaluate_visibility(&contract, &data(json!({"v": 7})))["b"], true);
    }

    #[test]
    fn not_contains_is_true_for_absent_or_empty_actual() {
        let contract = parse_contract(&json!({
            "fields": [{"id": "v", "type": "text"}, {"id": "b", "type": "text"}],
            "logic": [{
                "if": [{"id": "v", "operator": "not_contains", "value": "x"}],
                "then": {"type": "hide", "target": "b"}
            }]
        }))
        .unwrap();

        assert_eq!(evaluate_visibility(&contract, &data(json!({})))["b"], false);
        assert_eq!(evaluate_visibility(&contract, &data(json!({"v": ""})))["b"], false);
        assert_eq!(evaluate_visibility(&contract, &data(json!({"v": []})))["b"], false);
        assert_eq!(evaluate_visibility(&contract, &data(json!({"v": "has x"})))["b"], true);
    }

    #[test]
    fn exists_ignores_blank_strings_and_empty_arrays() {
        let contract = parse_contract(&json!({
            "fields": [{"id": "v", "type": "text"}, {"id": "b", "type": "text"}],
            "logic": [{
                "if": [{"id": "v", "operator": "exists"}],
                "then": {"type": "hide", "target": "b"}
            }]
        }))
        .unwrap();

        assert_eq!(evaluate_visibility(&contract, &data(json!({})))["b"], true);
        assert_eq!(evaluate_visibility(&contract, &data(json!({"v": null})))["b"], true);
        assert_eq!(evaluate_visibility(&contract, &data(json!({"v": "  "})))["b"], true);
        assert_eq!(evaluate_visibility(&contract, &data(json!({"v": []})))["b"], true);
        assert_eq!(evaluate_visibility(&contract, &data(json!({"v": "x"})))["b"], false);
        assert_eq!(evaluate_visibility(&contract, &data(json!({"v": 0})))["b"], false);
        assert_eq!(evaluate_visibility(&contract, &data(json!({"v": false})))["b"], false);
    }
}
