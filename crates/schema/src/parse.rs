//! Fail-closed normalization of a published schema (C1).
//!
//! The input is an arbitrary JSON value claimed to be a published schema.
//! The output is either a [`NormalizedContract`] or a [`ContractIssues`]
//! naming the first fault. Alias resolution is a fixed lookup; nothing is
//! inferred from runtime object shape.

use regex::Regex;
use serde_json::Value;

use crate::{
    CompiledPattern, ConditionMode, ConditionOperator, ContractIssues, FieldType, NormalizedContract,
    NormalizedField, NormalizedRule, RuleAction, RuleCondition, VisibilityAction,
};

/// Field-id aliases, in resolution order. First non-empty trimmed string wins.
const ID_ALIASES: [&str; 5] = ["id", "field_id", "fieldId", "key", "name"];

/// Field-type aliases, in resolution order.
const TYPE_ALIASES: [&str; 3] = ["type", "field_type", "fieldType"];

/// Keys allowed inside a `validation`/`rules` container.
const VALIDATION_KEYS: [&str; 7] = [
    "required",
    "min",
    "max",
    "minLength",
    "maxLength",
    "pattern",
    "options",
];

/// Condition-container aliases on a logic rule.
const CONDITION_ALIASES: [&str; 3] = ["if", "when", "conditions"];

/// Action-container aliases on a logic rule.
const ACTION_ALIASES: [&str; 3] = ["then", "action", "actions"];

/// Action-target aliases, checked before falling back to the id alias set.
const TARGET_ALIASES: [&str; 3] = ["target", "target_field_id", "targetFieldId"];

pub fn parse_contract(schema: &Value) -> Result<NormalizedContract, ContractIssues> {
    let Some(root) = schema.as_object() else {
        return Err(ContractIssues::one("schema root must be an object"));
    };

    let mut contract = NormalizedContract::default();

    if let Some(fields) = root.get("fields") {
        let Some(entries) = fields.as_array() else {
            return Err(ContractIssues::one("`fields` must be an array"));
        };
        for (idx, entry) in entries.iter().enumerate() {
            parse_field_into(&mut contract, entry, &format!("fields[{}]", idx))?;
        }
    }

    if let Some(steps) = root.get("steps") {
        let Some(entries) = steps.as_array() else {
            return Err(ContractIssues::one("`steps` must be an array"));
        };
        for (step_idx, step) in entries.iter().enumerate() {
            let Some(step_obj) = step.as_object() else {
                return Err(ContractIssues::one(format!(
                    "steps[{}] must be an object",
                    step_idx
                )));
            };
            let Some(step_fields) = step_obj.get("fields") else {
                continue;
            };
            let Some(step_entries) = step_fields.as_array() else {
                return Err(ContractIssues::one(format!(
                    "steps[{}].fields must be an array",
                    step_idx
                )));
            };
            for (idx, entry) in step_entries.iter().enumerate() {
                parse_field_into(
                    &mut contract,
                    entry,
                    &format!("steps[{}].fields[{}]", step_idx, idx),
                )?;
            }
        }
    }

    if let Some(logic) = root.get("logic") {
        parse_logic_into(&mut contract, logic)?;
    }

    Ok(contract)
}

fn parse_field_into(
    contract: &mut NormalizedContract,
    entry: &Value,
    at: &str,
) -> Result<(), ContractIssues> {
    let Some(field) = entry.as_object() else {
        return Err(ContractIssues::one(format!("{} must be an object", at)));
    };

    let Some(id) = resolve_alias_string(field, &ID_ALIASES) else {
        return Err(ContractIssues::one(format!(
            "{} is missing a non-empty field id",
            at
        )));
    };

    let Some(type_raw) = resolve_alias_string(field, &TYPE_ALIASES) else {
        return Err(ContractIssues::one(format!(
            "field `{}` is missing a field type",
            id
        )));
    };
    let Some(field_type) = FieldType::parse(&type_raw) else {
        return Err(ContractIssues::one(format!(
            "field `{}` has unsupported type `{}`",
            id, type_raw
        )));
    };

    let mut normalized = NormalizedField {
        id: id.clone(),
        field_type,
        default_visible: true,
        required: false,
        min: None,
        max: None,
        min_length: None,
        max_length: None,
        pattern: None,
        options: None,
    };

    // Validators may sit in a `validation` object, a `rules` object, or on
    // the field itself. The containers are strict: any key outside the
    // supported set fails the parse. Later containers override earlier ones.
    apply_validation_keys(&mut normalized, field, &id)?;
    for container_key in ["validation", "rules"] {
        let Some(container) = field.get(container_key) else {
            continue;
        };
        let Some(container_obj) = container.as_object() else {
            return Err(ContractIssues::one(format!(
                "field `{}` `{}` must be an object",
                id, container_key
            )));
        };
        for key in container_obj.keys() {
            if !VALIDATION_KEYS.contains(&key.as_str()) {
                return Err(ContractIssues::one(format!(
                    "field `{}` has unsupported validation key `{}`",
                    id, key
                )));
            }
        }
        apply_validation_keys(&mut normalized, container_obj, &id)?;
    }

    match field.get("hidden") {
        None => {}
        Some(Value::Bool(hidden)) => normalized.default_visible = !hidden,
        Some(_) => {
            return Err(ContractIssues::one(format!(
                "field `{}` `hidden` must be a boolean",
                id
            )));
        }
    }

    if normalized.field_type.requires_options()
        && normalized.options.as_ref().map_or(true, |o| o.is_empty())
    {
        return Err(ContractIssues::one(format!(
            "field `{}` of type `{}` requires a non-empty options list",
            id,
            normalized.field_type.as_str()
        )));
    }

    if !contract.push_field(normalized) {
        return Err(ContractIssues::one(format!("duplicate field id `{}`", id)));
    }

    Ok(())
}

/// Applies the supported validation keys found in `source`. The source may
/// be the field object itself (unrelated presentation keys are skipped) or a
/// `validation`/`rules` container; the value checks are strict either way.
fn apply_validation_keys(
    normalized: &mut NormalizedField,
    source: &serde_json::Map<String, Value>,
    field_id: &str,
) -> Result<(), ContractIssues> {
    if let Some(required) = source.get("required") {
        let Some(required) = required.as_bool() else {
            return Err(ContractIssues::one(format!(
                "field `{}` `required` must be a boolean",
                field_id
            )));
        };
        normalized.required = required;
    }

    for (key, slot) in [("min", 0usize), ("max", 1), ("minLength", 2), ("maxLength", 3)] {
        let Some(raw) = source.get(key) else {
            continue;
        };
        let Some(value) = raw.as_f64().filter(|v| v.is_finite()) else {
            return Err(ContractIssues::one(format!(
                "field `{}` `{}` must be a finite number",
                field_id, key
            )));
        };
        match slot {
            0 => normalized.min = Some(value),
            1 => normalized.max = Some(value),
            2 => normalized.min_length = Some(value),
            _ => normalized.max_length = Some(value),
        }
    }

    if let Some(pattern) = source.get("pattern") {
        let Some(pattern) = pattern.as_str() else {
            return Err(ContractIssues::one(format!(
                "field `{}` `pattern` must be a string",
                field_id
            )));
        };
        let regex = Regex::new(pattern).map_err(|_| {
            ContractIssues::one(format!(
                "field `{}` `pattern` is not a valid regular expression",
                field_id
            ))
        })?;
        normalized.pattern = Some(CompiledPattern {
            source: pattern.to_string(),
            regex,
        });
    }

    if let Some(options) = source.get("options") {
        normalized.options = Some(parse_options(options, field_id)?);
    }

    Ok(())
}

/// Option entries are primitives, or objects from which a primitive is
/// extractable under the id alias set (plus `value`/`label`, which option
/// objects conventionally carry).
fn parse_options(options: &Value, field_id: &str) -> Result<Vec<Value>, ContractIssues> {
    let Some(entries) = options.as_array() else {
        return Err(ContractIssues::one(format!(
            "field `{}` `options` must be an array",
            field_id
        )));
    };

    let mut out = Vec::with_capacity(entries.len());
    for (idx, entry) in entries.iter().enumerate() {
        if is_primitive(entry) {
            out.push(entry.clone());
            continue;
        }
        if let Some(obj) = entry.as_object() {
            let extracted = ["value", "label"]
                .iter()
                .chain(ID_ALIASES.iter())
                .find_map(|key| obj.get(*key).filter(|v| is_primitive(v)));
            if let Some(primitive) = extracted {
                out.push(primitive.clone());
                continue;
            }
        }
        return Err(ContractIssues::one(format!(
            "field `{}` options[{}] must be a primitive or an object holding one",
            field_id, idx
        )));
    }

    Ok(out)
}

fn is_primitive(value: &Value) -> bool {
    matches!(
        value,
        Value::String(_) | Value::Number(_) | Value::Bool(_)
    )
}

fn parse_logic_into(contract: &mut NormalizedContract, logic: &Value) -> Result<(), ContractIssues> {
    let Some(rules) = logic.as_array() else {
        return Err(ContractIssues::one("`logic` must be an array"));
    };

    for (idx, raw_rule) in rules.iter().enumerate() {
        let Some(rule) = raw_rule.as_object() else {
            return Err(ContractIssues::one(format!(
                "logic[{}] must be an object",
                idx
            )));
        };

        if rule.get("enabled") == Some(&Value::Bool(false))
            || rule.get("isActive") == Some(&Value::Bool(false))
        {
            continue;
        }

        let Some(condition_src) = CONDITION_ALIASES.iter().find_map(|key| rule.get(*key)) else {
            return Err(ContractIssues::one(format!(
                "logic[{}] is missing a condition",
                idx
            )));
        };
        let (mode, conditions) = parse_conditions(contract, condition_src, idx)?;

        let Some(action_src) = ACTION_ALIASES.iter().find_map(|key| rule.get(*key)) else {
            return Err(ContractIssues::one(format!(
                "logic[{}] is missing an action",
                idx
            )));
        };
        let actions = parse_actions(contract, action_src, idx)?;

        contract.rules.push(NormalizedRule {
            mode,
            conditions,
            actions,
        });
    }

    Ok(())
}

fn parse_conditions(
    contract: &NormalizedContract,
    src: &Value,
    rule_idx: usize,
) -> Result<(ConditionMode, Vec<RuleCondition>), ContractIssues> {
    match src {
        Value::Array(entries) => {
            let mut conditions = Vec::with_capacity(entries.len());
            for entry in entries {
                conditions.push(parse_condition(contract, entry, rule_idx)?);
            }
            Ok((ConditionMode::All, conditions))
        }
        Value::Object(obj) => {
            let all = obj.get("all");
            let any = obj.get("any");
            match (all, any) {
                (Some(_), Some(_)) => Err(ContractIssues::one(format!(
                    "logic[{}] condition must use `all` or `any`, not both",
                    rule_idx
                ))),
                (Some(list), None) => {
                    Ok((ConditionMode::All, parse_condition_list(contract, list, rule_idx, "all")?))
                }
                (None, Some(list)) => {
                    Ok((ConditionMode::Any, parse_condition_list(contract, list, rule_idx, "any")?))
                }
                (None, None) => {
                    let condition = parse_condition(contract, src, rule_idx)?;
                    Ok((ConditionMode::All, vec![condition]))
                }
            }
        }
        _ => Err(ContractIssues::one(format!(
            "logic[{}] condition must be an array or object",
            rule_idx
        ))),
    }
}

fn parse_condition_list(
    contract: &NormalizedContract,
    list: &Value,
    rule_idx: usize,
    quantifier: &str,
) -> Result<Vec<RuleCondition>, ContractIssues> {
    let Some(entries) = list.as_array() else {
        return Err(ContractIssues::one(format!(
            "logic[{}] `{}` must be an array",
            rule_idx, quantifier
        )));
    };
    let mut conditions = Vec::with_capacity(entries.len());
    for entry in entries {
        conditions.push(parse_condition(contract, entry, rule_idx)?);
    }
    Ok(conditions)
}

fn parse_condition(
    contract: &NormalizedContract,
    entry: &Value,
    rule_idx: usize,
) -> Result<RuleCondition, ContractIssues> {
    let Some(obj) = entry.as_object() else {
        return Err(ContractIssues::one(format!(
            "logic[{}] condition entries must be objects",
            rule_idx
        )));
    };

    let Some(field_id) = resolve_alias_string(obj, &ID_ALIASES) else {
        return Err(ContractIssues::one(format!(
            "logic[{}] condition is missing a source field id",
            rule_idx
        )));
    };
    if !contract.contains(&field_id) {
        return Err(ContractIssues::one(format!(
            "logic[{}] condition references unknown field `{}`",
            rule_idx, field_id
        )));
    }

    let Some(op_raw) = obj.get("operator").and_then(Value::as_str) else {
        return Err(ContractIssues::one(format!(
            "logic[{}] condition on `{}` is missing an operator",
            rule_idx, field_id
        )));
    };
    let Some(operator) = ConditionOperator::parse(op_raw) else {
        return Err(ContractIssues::one(format!(
            "logic[{}] condition on `{}` has unsupported operator `{}`",
            rule_idx, field_id, op_raw
        )));
    };

    if operator.is_unary() {
        return Ok(RuleCondition {
            field_id,
            operator,
            value: None,
        });
    }

    let Some(value) = obj.get("value") else {
        return Err(ContractIssues::one(format!(
            "logic[{}] condition on `{}` is missing a value",
            rule_idx, field_id
        )));
    };

    match operator {
        ConditionOperator::In | ConditionOperator::NotIn => {
            let ok = value
                .as_array()
                .map(|entries| entries.iter().all(is_primitive))
                .unwrap_or(false);
            if !ok {
                return Err(ContractIssues::one(format!(
                    "logic[{}] condition on `{}` requires an array of primitives",
                    rule_idx, field_id
                )));
            }
        }
        ConditionOperator::Contains | ConditionOperator::NotContains => {
            if !is_primitive(value) {
                return Err(ContractIssues::one(format!(
                    "logic[{}] condition on `{}` requires a primitive value",
                    rule_idx, field_id
                )));
            }
        }
        ConditionOperator::Gt
        | ConditionOperator::Gte
        | ConditionOperator::Lt
        | ConditionOperator::Lte => {
            if !matches!(value, Value::Number(_) | Value::String(_)) {
                return Err(ContractIssues::one(format!(
                    "logic[{}] condition on `{}` requires a number or string value",
                    rule_idx, field_id
                )));
            }
        }
        _ => {}
    }

    Ok(RuleCondition {
        field_id,
        operator,
        value: Some(value.clone()),
    })
}

fn parse_actions(
    contract: &NormalizedContract,
    src: &Value,
    rule_idx: usize,
) -> Result<Vec<RuleAction>, ContractIssues> {
    let entries: Vec<&Value> = match src {
        Value::Array(entries) => entries.iter().collect(),
        Value::Object(_) => vec![src],
        _ => {
            return Err(ContractIssues::one(format!(
                "logic[{}] action must be an object or array of objects",
                rule_idx
            )));
        }
    };

    let mut actions = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(obj) = entry.as_object() else {
            return Err(ContractIssues::one(format!(
                "logic[{}] action entries must be objects",
                rule_idx
            )));
        };

        let Some(type_raw) = obj.get("type").and_then(Value::as_str) else {
            return Err(ContractIssues::one(format!(
                "logic[{}] action is missing a type",
                rule_idx
            )));
        };

        let action = match type_raw {
            "show" | "show_field" => VisibilityAction::Show,
            "hide" | "hide_field" => VisibilityAction::Hide,
            "set_visibility" => match obj.get("visible") {
                Some(Value::Bool(true)) => VisibilityAction::Show,
                Some(Value::Bool(false)) => VisibilityAction::Hide,
                _ => {
                    return Err(ContractIssues::one(format!(
                        "logic[{}] set_visibility requires a boolean `visible`",
                        rule_idx
                    )));
                }
            },
            other => {
                return Err(ContractIssues::one(format!(
                    "logic[{}] has unsupported action type `{}`",
                    rule_idx, other
                )));
            }
        };

        let target = TARGET_ALIASES
            .iter()
            .chain(ID_ALIASES.iter())
            .find_map(|key| obj.get(*key).and_then(Value::as_str))
            .map(|s| s.trim())
            .filter(|s| !s.is_empty());
        let Some(target) = target else {
            return Err(ContractIssues::one(format!(
                "logic[{}] action is missing a target field",
                rule_idx
            )));
        };
        if !contract.contains(target) {
            return Err(ContractIssues::one(format!(
                "logic[{}] action targets unknown field `{}`",
                rule_idx, target
            )));
        }

        actions.push(RuleAction {
            action,
            target_field_id: target.to_string(),
        });
    }

    Ok(actions)
}

fn resolve_alias_string(
    obj: &serde_json::Map<String, Value>,
    aliases: &[&str],
) -> Option<String> {
    aliases
        .iter()
        .filter_map(|key| obj.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_flat_fields_with_aliases() {
        let schema = json!({
            "fields": [
                {"id": "email", "type": "email", "required": true},
                {"fieldId": "age", "field_type": "number", "validation": {"min": 18, "max": 120}},
                {"name": "bio", "type": "textarea", "rules": {"maxLength": 500}}
            ]
        });

        let contract = parse_contract(&schema).expect("schema should parse");
        assert_eq!(contract.len(), 3);

        let email = contract.field("email").expect("email field");
        assert!(email.required);
        assert_eq!(email.field_type, FieldType::Email);

        let age = contract.field("age").expect("age field");
        assert_eq!(age.min, Some(18.0));
        assert_eq!(age.max, Some(120.0));

        let bio = contract.field("bio").expect("bio field");
        assert_eq!(bio.max_length, Some(500.0));
    }

    #[test]
    fn collects_fields_from_steps_in_order() {
        let schema = json!({
            "steps": [
                {"fields": [{"id": "a", "type": "text"}]},
                {"title": "no fields here"},
                {"fields": [{"id": "b", "type": "text"}]}
            ]
        });

        let contract = parse_contract(&schema).expect("schema should parse");
        let ids: Vec<&str> = contract.fields().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn rejects_non_object_root() {
        let err = parse_contract(&json!([1, 2])).unwrap_err();
        assert!(err.issues[0].contains("root must be an object"));
    }

    #[test]
    fn rejects_unsupported_field_type() {
        let schema = json!({"fields": [{"id": "doc", "type": "file_upload"}]});
        let err = parse_contract(&schema).unwrap_err();
        assert!(err.issues[0].contains("unsupported type `file_upload`"));
    }

    #[test]
    fn rejects_duplicate_field_ids() {
        let schema = json!({
            "fields": [
                {"id": "x", "type": "text"},
                {"key": "x", "type": "number"}
            ]
        });
        let err = parse_contract(&schema).unwrap_err();
        assert!(err.issues[0].contains("duplicate field id `x`"));
    }

    #[test]
    fn rejects_unknown_validation_keys_in_container() {
        let schema = json!({
            "fields": [{"id": "x", "type": "text", "validation": {"maxLenght": 10}}]
        });
        let err = parse_contract(&schema).unwrap_err();
        assert!(err.issues[0].contains("unsupported validation key `maxLenght`"));
    }

    #[test]
    fn ignores_presentation_keys_on_field_itself() {
        let schema = json!({
            "fields": [{"id": "x", "type": "text", "label": "Name", "placeholder": "…"}]
        });
        assert!(parse_contract(&schema).is_ok());
    }

    #[test]
    fn rejects_non_boolean_required() {
        let schema = json!({"fields": [{"id": "x", "type": "text", "required": "yes"}]});
        let err = parse_contract(&schema).unwrap_err();
        assert!(err.issues[0].contains("`required` must be a boolean"));
    }

    #[test]
    fn rejects_non_finite_numeric_validator() {
        let schema = json!({"fields": [{"id": "x", "type": "number", "min": "low"}]});
        let err = parse_contract(&schema).unwrap_err();
        assert!(err.issues[0].contains("`min` must be a finite number"));
    }

    #[test]
    fn rejects_uncompilable_pattern() {
        let schema = json!({"fields": [{"id": "x", "type": "text", "pattern": "("}]});
        let err = parse_contract(&schema).unwrap_err();
        assert!(err.issues[0].contains("not a valid regular expression"));
    }

    #[test]
    fn choice_types_require_options() {
        for field_type in ["radio", "select", "multiselect"] {
            let schema = json!({"fields": [{"id": "x", "type": field_type}]});
            let err = parse_contract(&schema).unwrap_err();
            assert!(
                err.issues[0].contains("requires a non-empty options list"),
                "{} should require options",
                field_type
            );

            let schema = json!({"fields": [{"id": "x", "type": field_type, "options": []}]});
            assert!(parse_contract(&schema).is_err());
        }
    }

    #[test]
    fn option_objects_yield_primitives() {
        let schema = json!({
            "fields": [{
                "id": "color",
                "type": "select",
                "options": [
                    "red",
                    {"value": "green", "label": "Green"},
                    {"id": "blue"}
                ]
            }]
        });
        let contract = parse_contract(&schema).expect("schema should parse");
        let options = contract.field("color").unwrap().options.as_ref().unwrap();
        assert_eq!(options.len(), 3);
        assert_eq!(options[0], json!("red"));
        assert_eq!(options[1], json!("green"));
        assert_eq!(options[2], json!("blue"));
    }

    #[test]
    fn rejects_option_object_without_primitive() {
        let schema = json!({
            "fields": [{"id": "x", "type": "select", "options": [{"nested": {"value": 1}}]}]
        });
        let err = parse_contract(&schema).unwrap_err();
        assert!(err.issues[0].contains("options[0]"));
    }

    #[test]
    fn hidden_flag_controls_default_visibility() {
        let schema = json!({
            "fields": [
                {"id": "a", "type": "text", "hidden": true},
                {"id": "b", "type": "text"}
            ]
        });
        let contract = parse_contract(&schema).expect("schema should parse");
        assert!(!contract.field("a").unwrap().default_visible);
        assert!(contract.field("b").unwrap().default_visible);
    }

    #[test]
    fn parses_rule_with_condition_array_and_action_list() {
        let schema = json!({
            "fields": [
                {"id": "contact_method", "type": "radio", "options": ["phone", "email"]},
                {"id": "details", "type": "text"}
            ],
            "logic": [{
                "if": [{"field_id": "contact_method", "operator": "eq", "value": "phone"}],
                "then": [{"type": "hide_field", "target": "details"}]
            }]
        });
        let contract = parse_contract(&schema).expect("schema should parse");
        assert_eq!(contract.rules.len(), 1);
        let rule = &contract.rules[0];
        assert_eq!(rule.mode, ConditionMode::All);
        assert_eq!(rule.conditions[0].operator, ConditionOperator::Eq);
        assert_eq!(rule.actions[0].action, VisibilityAction::Hide);
        assert_eq!(rule.actions[0].target_field_id, "details");
    }

    #[test]
    fn parses_any_quantifier_and_single_condition_object() {
        let schema = json!({
            "fields": [
                {"id": "a", "type": "number"},
                {"id": "b", "type": "text"}
            ],
            "logic": [
                {
                    "when": {"any": [
                        {"id": "a", "operator": ">", "value": 5},
                        {"id": "a", "operator": "<", "value": 1}
                    ]},
                    "action": {"type": "show", "target": "b"}
                },
                {
                    "if": {"id": "a", "operator": "exists"},
                    "then": {"type": "hide", "target": "b"}
                }
            ]
        });
        let contract = parse_contract(&schema).expect("schema should parse");
        assert_eq!(contract.rules.len(), 2);
        assert_eq!(contract.rules[0].mode, ConditionMode::Any);
        assert_eq!(contract.rules[0].conditions.len(), 2);
        assert_eq!(contract.rules[1].mode, ConditionMode::All);
        assert_eq!(contract.rules[1].conditions.len(), 1);
        assert!(contract.rules[1].conditions[0].value.is_none());
    }

    #[test]
    fn skips_inactive_rules() {
        let schema = json!({
            "fields": [{"id": "a", "type": "text"}],
            "logic": [
                {"enabled": false, "if": [{"id": "a", "operator": "exists"}], "then": {"type": "hide", "target": "a"}},
                {"isActive": false, "if": [{"id": "a", "operator": "exists"}], "then": {"type": "hide", "target": "a"}}
            ]
        });
        let contract = parse_contract(&schema).expect("schema should parse");
        assert!(contract.rules.is_empty());
    }

    #[test]
    fn rejects_condition_on_unknown_field() {
        let schema = json!({
            "fields": [{"id": "a", "type": "text"}],
            "logic": [{"if": [{"id": "ghost", "operator": "exists"}], "then": {"type": "hide", "target": "a"}}]
        });
        let err = parse_contract(&schema).unwrap_err();
        assert!(err.issues[0].contains("unknown field `ghost`"));
    }

    #[test]
    fn rejects_unsupported_operator() {
        let schema = json!({
            "fields": [{"id": "a", "type": "text"}],
            "logic": [{"if": [{"id": "a", "operator": "matches", "value": "x"}], "then": {"type": "hide", "target": "a"}}]
        });
        let err = parse_contract(&schema).unwrap_err();
        assert!(err.issues[0].contains("unsupported operator `matches`"));
    }

    #[test]
    fn operator_aliases_are_case_insensitive() {
        let schema = json!({
            "fields": [{"id": "a", "type": "number"}, {"id": "b", "type": "text"}],
            "logic": [{"if": [{"id": "a", "operator": "NIN", "value": [1, 2]}], "then": {"type": "hide", "target": "b"}}]
        });
        let contract = parse_contract(&schema).expect("schema should parse");
        assert_eq!(contract.rules[0].conditions[0].operator, ConditionOperator::NotIn);
    }

    #[test]
    fn rejects_in_with_non_primitive_entries() {
        let schema = json!({
            "fields": [{"id": "a", "type": "text"}],
            "logic": [{"if": [{"id": "a", "operator": "in", "value": [["nested"]]}], "then": {"type": "hide", "target": "a"}}]
        });
        let err = parse_contract(&schema).unwrap_err();
        assert!(err.issues[0].contains("array of primitives"));
    }

    #[test]
    fn rejects_both_all_and_any() {
        let schema = json!({
            "fields": [{"id": "a", "type": "text"}],
            "logic": [{"if": {"all": [], "any": []}, "then": {"type": "hide", "target": "a"}}]
        });
        let err = parse_contract(&schema).unwrap_err();
        assert!(err.issues[0].contains("not both"));
    }

    #[test]
    fn set_visibility_requires_boolean_visible() {
        let base_fields = json!([{"id": "a", "type": "text"}]);
        let schema = json!({
            "fields": base_fields,
            "logic": [{"if": [{"id": "a", "operator": "exists"}], "then": {"type": "set_visibility", "target": "a"}}]
        });
        let err = parse_contract(&schema).unwrap_err();
        assert!(err.issues[0].contains("boolean `visible`"));

        let schema = json!({
            "fields": base_fields,
            "logic": [{"if": [{"id": "a", "operator": "exists"}], "then": {"type": "set_visibility", "target": "a", "visible": false}}]
        });
        let contract = parse_contract(&schema).expect("schema should parse");
        assert_eq!(contract.rules[0].actions[0].action, VisibilityAction::Hide);
    }

    #[test]
    fn rejects_action_with_unknown_target() {
        let schema = json!({
            "fields": [{"id": "a", "type": "text"}],
            "logic": [{"if": [{"id": "a", "operator": "exists"}], "then": {"type": "hide", "target": "ghost"}}]
        });
        let err = parse_contract(&schema).unwrap_err();
        assert!(err.issues[0].contains("unknown field `ghost`"));
    }
}
