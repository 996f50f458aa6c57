//! Published-schema handling for the public runner: normalization of an
//! arbitrary JSON schema into a strict field registry plus rule list
//! ([`parse`]), logic-driven visibility evaluation ([`logic`]), and
//! type-specific value validation ([`validate`]).
//!
//! Everything in this crate is pure: no I/O, no clocks beyond parsing
//! submitted timestamps. The parser is fail-closed — the first unsupported
//! shape aborts with a human-readable issue and the submission surface maps
//! that to `UNSUPPORTED_FORM_SCHEMA`.

use std::collections::HashMap;

use regex::Regex;

pub mod logic;
pub mod parse;
pub mod validate;

pub use parse::parse_contract;

/// The exact set of supported field types. Anything else fails the parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Textarea,
    Email,
    Number,
    Tel,
    Url,
    Date,
    Datetime,
    Time,
    Radio,
    Select,
    Multiselect,
    Checkbox,
    Boolean,
    Rating,
}

impl FieldType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "text" => Some(FieldType::Text),
            "textarea" => Some(FieldType::Textarea),
            "email" => Some(FieldType::Email),
            "number" => Some(FieldType::Number),
            "tel" => Some(FieldType::Tel),
            "url" => Some(FieldType::Url),
            "date" => Some(FieldType::Date),
            "datetime" => Some(FieldType::Datetime),
            "time" => Some(FieldType::Time),
            "radio" => Some(FieldType::Radio),
            "select" => Some(FieldType::Select),
            "multiselect" => Some(FieldType::Multiselect),
            "checkbox" => Some(FieldType::Checkbox),
            "boolean" => Some(FieldType::Boolean),
            "rating" => Some(FieldType::Rating),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Textarea => "textarea",
            FieldType::Email => "email",
            FieldType::Number => "number",
            FieldType::Tel => "tel",
            FieldType::Url => "url",
            FieldType::Date => "date",
            FieldType::Datetime => "datetime",
            FieldType::Time => "time",
            FieldType::Radio => "radio",
            FieldType::Select => "select",
            FieldType::Multiselect => "multiselect",
            FieldType::Checkbox => "checkbox",
            FieldType::Boolean => "boolean",
            FieldType::Rating => "rating",
        }
    }

    /// Types whose submitted value must be a JSON string.
    pub fn is_string_valued(&self) -> bool {
        matches!(
            self,
            FieldType::Text
                | FieldType::Textarea
                | FieldType::Email
                | FieldType::Tel
                | FieldType::Url
                | FieldType::Date
                | FieldType::Datetime
                | FieldType::Time
        )
    }

    /// Types that require a non-empty `options` list.
    pub fn requires_options(&self) -> bool {
        matches!(
            self,
            FieldType::Radio | FieldType::Select | FieldType::Multiselect
        )
    }
}

/// A single normalized field. `pattern` is compiled eagerly at parse time so
/// validation never recompiles.
#[derive(Debug, Clone)]
pub struct NormalizedField {
    pub id: String,
    pub field_type: FieldType,
    pub default_visible: bool,
    pub required: bool,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub min_length: Option<f64>,
    pub max_length: Option<f64>,
    pub pattern: Option<CompiledPattern>,
    pub options: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pub source: String,
    pub regex: Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionMode {
    All,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOperator {
    Eq,
    Neq,
    In,
    NotIn,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    NotContains,
    Exists,
    NotExists,
}

impl ConditionOperator {
    /// Resolves an operator name. Input is lower-cased before lookup; the
    /// alias table is fixed.
    pub fn parse(raw: &str) -> Option<Self> {
        let lowered = raw.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "eq" | "=" | "==" => Some(ConditionOperator::Eq),
            "neq" | "!=" | "<>" => Some(ConditionOperator::Neq),
            "in" => Some(ConditionOperator::In),
            "not_in" | "nin" => Some(ConditionOperator::NotIn),
            "gt" | ">" => Some(ConditionOperator::Gt),
            "gte" | ">=" => Some(ConditionOperator::Gte),
            "lt" | "<" => Some(ConditionOperator::Lt),
            "lte" | "<=" => Some(ConditionOperator::Lte),
            "contains" | "includes" => Some(ConditionOperator::Contains),
            "not_contains" | "not_includes" => Some(ConditionOperator::NotContains),
            "exists" => Some(ConditionOperator::Exists),
            "not_exists" => Some(ConditionOperator::NotExists),
            _ => None,
        }
    }

    /// Operators that carry no comparison value.
    pub fn is_unary(&self) -> bool {
        matches!(
            self,
            ConditionOperator::Exists | ConditionOperator::NotExists
        )
    }
}

#[derive(Debug, Clone)]
pub struct RuleCondition {
    pub field_id: String,
    pub operator: ConditionOperator,
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityAction {
    Show,
    Hide,
}

#[derive(Debug, Clone)]
pub struct RuleAction {
    pub action: VisibilityAction,
    pub target_field_id: String,
}

#[derive(Debug, Clone)]
pub struct NormalizedRule {
    pub mode: ConditionMode,
    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<RuleAction>,
}

/// Field registry (insertion-order preserved for stable error output) plus
/// the ordered rule list.
#[derive(Debug, Clone, Default)]
pub struct NormalizedContract {
    fields: Vec<NormalizedField>,
    index: HashMap<String, usize>,
    pub rules: Vec<NormalizedRule>,
}

impl NormalizedContract {
    pub(crate) fn push_field(&mut self, field: NormalizedField) -> bool {
        if self.index.contains_key(&field.id) {
            return false;
        }
        self.index.insert(field.id.clone(), self.fields.len());
        self.fields.push(field);
        true
    }

    pub fn field(&self, id: &str) -> Option<&NormalizedField> {
        self.index.get(id).map(|idx| &self.fields[*idx])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn fields(&self) -> impl Iterator<Item = &NormalizedField> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A fail-closed contract violation. The parser stops at the first fault, so
/// `issues` usually carries exactly one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractIssues {
    pub issues: Vec<String>,
}

impl ContractIssues {
    pub fn one(issue: impl Into<String>) -> Self {
        Self {
            issues: vec![issue.into()],
        }
    }
}

impl std::fmt::Display for ContractIssues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unsupported form schema: {}", self.issues.join("; "))
    }
}

impl std::error::Error for ContractIssues {}
