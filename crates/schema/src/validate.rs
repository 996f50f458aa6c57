//! Type-specific value validation (C3).
//!
//! Runs over the visible fields only; hidden fields were already stripped by
//! the pipeline. Every failure carries the field id and a human-readable
//! message; the submission surface wraps the list as
//! `FIELD_VALIDATION_FAILED`.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate};
use serde_json::Value;
use url::Url;

use crate::{FieldType, NormalizedContract, NormalizedField};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field_id: String,
    pub message: String,
}

pub const REQUIRED_MISSING: &str = "Required field is missing";

/// Validates the visible submitted values against the registry. Fields whose
/// visibility resolves to false are skipped entirely.
pub fn validate_values(
    contract: &NormalizedContract,
    data: &serde_json::Map<String, Value>,
    visibility: &HashMap<String, bool>,
) -> Vec<FieldError> {
    let mut errors = Vec::new();

    for field in contract.fields() {
        if !visibility.get(&field.id).copied().unwrap_or(field.default_visible) {
            continue;
        }

        match data.get(&field.id) {
            None | Some(Value::Null) => {
                if field.required {
                    errors.push(FieldError {
                        field_id: field.id.clone(),
                        message: REQUIRED_MISSING.to_string(),
                    });
                }
            }
            Some(value) => {
                if let Some(message) = validate_value(field, value) {
                    errors.push(FieldError {
                        field_id: field.id.clone(),
                        message,
                    });
                }
            }
        }
    }

    errors
}

fn validate_value(field: &NormalizedField, value: &Value) -> Option<String> {
    match field.field_type {
        FieldType::Text
        | FieldType::Textarea
        | FieldType::Email
        | FieldType::Tel
        | FieldType::Url
        | FieldType::Date
        | FieldType::Datetime
        | FieldType::Time => validate_string(field, value),
        FieldType::Number | FieldType::Rating => validate_number(field, value),
        FieldType::Checkbox | FieldType::Boolean => validate_boolean(field, value),
        FieldType::Radio | FieldType::Select => validate_choice(field, value),
        FieldType::Multiselect => validate_multiselect(field, value),
    }
}

fn validate_string(field: &NormalizedField, value: &Value) -> Option<String> {
    let Some(s) = value.as_str() else {
        return Some("Expected a text value".to_string());
    };

    if field.required && s.trim().is_empty() {
        return Some(REQUIRED_MISSING.to_string());
    }

    match field.field_type {
        FieldType::Email => {
            if !is_email(s) {
                return Some("Invalid email address".to_string());
            }
        }
        FieldType::Url => {
            if Url::parse(s).is_err() {
                return Some("Invalid URL".to_string());
            }
        }
        FieldType::Date => {
            if NaiveDate::parse_from_str(s, "%Y-%m-%d").is_err() {
                return Some("Invalid date (expected YYYY-MM-DD)".to_string());
            }
        }
        FieldType::Datetime => {
            if DateTime::parse_from_rfc3339(s).is_err() {
                return Some("Invalid datetime (expected ISO-8601 with offset)".to_string());
            }
        }
        FieldType::Time => {
            if !is_time(s) {
                return Some("Invalid time (expected HH:mm or HH:mm:ss)".to_string());
            }
        }
        _ => {}
    }

    let length = s.chars().count() as f64;
    if let Some(min_length) = field.min_length {
        if length < min_length {
            return Some(format!("Must be at least {} characters", min_length));
        }
    }
    if let Some(max_length) = field.max_length {
        if length > max_length {
            return Some(format!("Must be at most {} characters", max_length));
        }
    }
    if let Some(pattern) = &field.pattern {
        if !pattern.regex.is_match(s) {
            return Some("Value does not match the required pattern".to_string());
        }
    }

    None
}

fn validate_number(field: &NormalizedField, value: &Value) -> Option<String> {
    let number = match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        _ => None,
    };
    let Some(number) = number else {
        return Some("Expected a number".to_string());
    };

    if field.field_type == FieldType::Rating && number.fract() != 0.0 {
        return Some("Rating must be a whole number".to_string());
    }

    if let Some(min) = field.min {
        if number < min {
            return Some(format!("Must be at least {}", min));
        }
    }
    if let Some(max) = field.max {
        if number > max {
            return Some(format!("Must be at most {}", max));
        }
    }

    None
}

fn validate_boolean(field: &NormalizedField, value: &Value) -> Option<String> {
    let Some(b) = value.as_bool() else {
        return Some("Expected a boolean".to_string());
    };

    if field.field_type == FieldType::Checkbox && field.required && !b {
        return Some("This field must be checked".to_string());
    }

    None
}

fn validate_choice(field: &NormalizedField, value: &Value) -> Option<String> {
    if option_key(value).is_none() {
        return Some("Expected a primitive value".to_string());
    }
    if !matches_option(field, value) {
        return Some("Value is not one of the allowed options".to_string());
    }
    None
}

fn validate_multiselect(field: &NormalizedField, value: &Value) -> Option<String> {
    let Some(entries) = value.as_array() else {
        return Some("Expected a list of values".to_string());
    };

    if field.required && entries.is_empty() {
        return Some(REQUIRED_MISSING.to_string());
    }

    for entry in entries {
        if option_key(entry).is_none() {
            return Some("Expected a list of primitive values".to_string());
        }
        if !matches_option(field, entry) {
            return Some("Value is not one of the allowed options".to_string());
        }
    }

    let count = entries.len() as f64;
    if let Some(min) = field.min {
        if count < min {
            return Some(format!("Select at least {} options", min));
        }
    }
    if let Some(max) = field.max {
        if count > max {
            return Some(format!("Select at most {} options", max));
        }
    }

    None
}

fn matches_option(field: &NormalizedField, value: &Value) -> bool {
    let Some(key) = option_key(value) else {
        return false;
    };
    field
        .options
        .as_ref()
        .map(|options| options.iter().filter_map(option_key).any(|k| k == key))
        .unwrap_or(false)
}

/// Options match by `(type, string(value))` canonicalization, so the string
/// `"3"` and the number `3` stay distinct.
fn option_key(value: &Value) -> Option<(&'static str, String)> {
    match value {
        Value::String(s) => Some(("string", s.clone())),
        Value::Number(n) => Some(("number", n.to_string())),
        Value::Bool(b) => Some(("boolean", b.to_string())),
        _ => None,
    }
}

fn is_email(s: &str) -> bool {
    // ^[^\s@]+@[^\s@]+\.[^\s@]+$ without a regex allocation per call.
    let mut parts = s.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    if local.is_empty() || local.chars().any(char::is_whitespace) {
        return false;
    }
    let Some(dot) = domain.rfind('.') else {
        return false;
    };
    let (host, tld) = domain.split_at(dot);
    let tld = &tld[1..];
    !host.is_empty()
        && !tld.is_empty()
        && !domain.chars().any(char::is_whitespace)
}

fn is_time(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 5 && bytes.len() != 8 {
        return false;
    }
    let two_digits = |b: &[u8], max: u32| -> bool {
        if !b[0].is_ascii_digit() || !b[1].is_ascii_digit() {
            return false;
        }
        let v = (b[0] - b'0') as u32 * 10 + (b[1] - b'0') as u32;
        v <= max
    };
    if !two_digits(&bytes[0..2], 23) || bytes[2] != b':' || !two_digits(&bytes[3..5], 59) {
        return false;
    }
    if bytes.len() == 8 {
        if bytes[5] != b':' || !two_digits(&bytes[6..8], 59) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_contract;
    use serde_json::json;

    fn validate(schema: Value, data: Value) -> Vec<FieldError> {
        let contract = parse_contract(&schema).expect("test schema should parse");
        let data = data.as_object().expect("test data must be an object").clone();
        let visibility = crate::logic::evaluate_visibility(&contract, &data);
        validate_values(&contract, &data, &visibility)
    }

    fn single_field(field: Value) -> Value {
        json!({"fields": [field]})
    }

    #[test]
    fn required_missing_message_is_stable() {
        let errors = validate(
            single_field(json!({"id": "email", "type": "email", "required": true})),
            json!({}),
        );
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field_id, "email");
        assert_eq!(errors[0].message, REQUIRED_MISSING);
    }

    #[test]
    fn optional_missing_is_fine() {
        let errors = validate(
            single_field(json!({"id": "bio", "type": "textarea"})),
            json!({}),
        );
        assert!(errors.is_empty());
    }

    #[test]
    fn email_validation() {
        let schema = single_field(json!({"id": "e", "type": "email"}));
        assert!(validate(schema.clone(), json!({"e": "a@b.co"})).is_empty());
        for bad in ["plain", "a@b", "a b@c.d", "@b.co", "a@.co", "a@b."] {
            let errors = validate(schema.clone(), json!({"e": bad}));
            assert_eq!(errors.len(), 1, "{} should be rejected", bad);
            assert_eq!(errors[0].message, "Invalid email address");
        }
    }

    #[test]
    fn url_must_be_absolute() {
        let schema = single_field(json!({"id": "u", "type": "url"}));
        assert!(validate(schema.clone(), json!({"u": "https://example.com/x"})).is_empty());
        let errors = validate(schema, json!({"u": "/relative/path"}));
        assert_eq!(errors[0].message, "Invalid URL");
    }

    #[test]
    fn date_datetime_and_time_formats() {
        let date = single_field(json!({"id": "d", "type": "date"}));
        assert!(validate(date.clone(), json!({"d": "2026-03-01"})).is_empty());
        assert!(!validate(date.clone(), json!({"d": "2026-3-1"})).is_empty());
        assert!(!validate(date, json!({"d": "2026-13-01"})).is_empty());

        let datetime = single_field(json!({"id": "t", "type": "datetime"}));
        assert!(validate(datetime.clone(), json!({"t": "2026-03-01T10:00:00Z"})).is_empty());
        assert!(validate(datetime.clone(), json!({"t": "2026-03-01T10:00:00+02:00"})).is_empty());
        assert!(!validate(datetime, json!({"t": "2026-03-01 10:00:00"})).is_empty());

        let time = single_field(json!({"id": "t", "type": "time"}));
        assert!(validate(time.clone(), json!({"t": "09:30"})).is_empty());
        assert!(validate(time.clone(), json!({"t": "23:59:59"})).is_empty());
        assert!(!validate(time.clone(), json!({"t": "24:00"})).is_empty());
        assert!(!validate(time, json!({"t": "9:30"})).is_empty());
    }

    #[test]
    fn length_bounds_count_characters() {
        let schema = single_field(json!({"id": "s", "type": "text", "minLength": 2, "maxLength": 4}));
        assert!(validate(schema.clone(), json!({"s": "abc"})).is_empty());
        assert_eq!(
            validate(schema.clone(), json!({"s": "a"}))[0].message,
            "Must be at least 2 characters"
        );
        assert_eq!(
            validate(schema, json!({"s": "abcde"}))[0].message,
            "Must be at most 4 characters"
        );
    }

    #[test]
    fn pattern_is_applied() {
        let schema = single_field(json!({"id": "s", "type": "text", "pattern": "^[a-z]+$"}));
        assert!(validate(schema.clone(), json!({"s": "abc"})).is_empty());
        assert_eq!(
            validate(schema, json!({"s": "abc1"}))[0].message,
            "Value does not match the required pattern"
        );
    }

    #[test]
    fn number_and_rating_rules() {
        let number = single_field(json!({"id": "n", "type": "number", "min": 0, "max": 10}));
        assert!(validate(number.clone(), json!({"n": 5})).is_empty());
        assert!(validate(number.clone(), json!({"n": 2.5})).is_empty());
        assert_eq!(validate(number.clone(), json!({"n": "5"}))[0].message, "Expected a number");
        assert_eq!(validate(number.clone(), json!({"n": -1}))[0].message, "Must be at least 0");
        assert_eq!(validate(number, json!({"n": 11}))[0].message, "Must be at most 10");

        let rating = single_field(json!({"id": "r", "type": "rating", "min": 1, "max": 5}));
        assert!(validate(rating.clone(), json!({"r": 4})).is_empty());
        assert_eq!(
            validate(rating, json!({"r": 3.5}))[0].message,
            "Rating must be a whole number"
        );
    }

    #[test]
    fn checkbox_required_must_be_true() {
        let schema = single_field(json!({"id": "c", "type": "checkbox", "required": true}));
        assert!(validate(schema.clone(), json!({"c": true})).is_empty());
        assert_eq!(
            validate(schema.clone(), json!({"c": false}))[0].message,
            "This field must be checked"
        );
        assert_eq!(validate(schema, json!({"c": "yes"}))[0].message, "Expected a boolean");
    }

    #[test]
    fn choice_matching_is_type_aware() {
        let schema = single_field(json!({"id": "c", "type": "select", "options": ["phone", 3]}));
        assert!(validate(schema.clone(), json!({"c": "phone"})).is_empty());
        assert!(validate(schema.clone(), json!({"c": 3})).is_empty());
        assert_eq!(
            validate(schema.clone(), json!({"c": "3"}))[0].message,
            "Value is not one of the allowed options"
        );
        assert_eq!(
            validate(schema, json!({"c": {"value": "phone"}}))[0].message,
            "Expected a primitive value"
        );
    }

    #[test]
    fn multiselect_counts_and_membership() {
        let schema = single_field(json!({
            "id": "m", "type": "multiselect",
            "options": ["a", "b", "c"], "min": 1, "max": 2
        }));
        assert!(validate(schema.clone(), json!({"m": ["a", "b"]})).is_empty());
        assert_eq!(
            validate(schema.clone(), json!({"m": "a"}))[0].message,
            "Expected a list of values"
        );
        assert_eq!(
            validate(schema.clone(), json!({"m": ["a", "z"]}))[0].message,
            "Value is not one of the allowed options"
        );
        assert_eq!(
            validate(schema.clone(), json!({"m": []}))[0].message,
            "Select at least 1 options"
        );
        assert_eq!(
            validate(schema, json!({"m": ["a", "b", "c"]}))[0].message,
            "Select at most 2 options"
        );
    }

    #[test]
    fn required_multiselect_empty_is_missing() {
        let schema = single_field(json!({
            "id": "m", "type": "multiselect", "options": ["a"], "required": true
        }));
        assert_eq!(validate(schema, json!({"m": []}))[0].message, REQUIRED_MISSING);
    }

    #[test]
    fn hidden_fields_are_not_validated() {
        let schema = json!({
            "fields": [
                {"id": "toggle", "type": "boolean"},
                {"id": "detail", "type": "number", "required": true}
            ],
            "logic": [{
                "if": [{"id": "toggle", "operator": "eq", "value": false}],
                "then": {"type": "hide", "target": "detail"}
            }]
        });
        // Hidden: no error even though required and invalid value absent.
        assert!(validate(schema.clone(), json!({"toggle": false})).is_empty());
        // Visible again: required applies.
        let errors = validate(schema, json!({"toggle": true}));
        assert_eq!(errors[0].field_id, "detail");
        assert_eq!(errors[0].message, REQUIRED_MISSING);
    }
}
