//! `{{variable}}` message templates.
//!
//! Content is the source of truth: the variable list of a template is always
//! re-derived from the placeholders found in it. Declarations only add a type,
//! a required flag and a default to a name that already appears in the content.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    #[default]
    String,
    Number,
    Date,
    Boolean,
    Currency,
}

impl VariableType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Date => "date",
            Self::Boolean => "boolean",
            Self::Currency => "currency",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateVariable {
    pub name: String,
    #[serde(rename = "type", default)]
    pub var_type: VariableType,
    #[serde(default = "default_required")]
    pub required: bool,
    pub default: Option<Value>,
}

impl TemplateVariable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            var_type: VariableType::String,
            required: true,
            default: None,
        }
    }

    pub fn with_type(mut self, var_type: VariableType) -> Self {
        self.var_type = var_type;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateValidation {
    pub valid: bool,
    pub missing_required: Vec<String>,
    pub invalid: Vec<String>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("Missing required template variables: {}", .0.join(", "))]
    MissingRequired(Vec<String>),

    #[error("Value for `{name}` is not a valid {expected}")]
    InvalidValue { name: String, expected: &'static str },
}

/// Placeholder names in order of first appearance, without duplicates.
pub fn extract_variables(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    PLACEHOLDER
        .captures_iter(content)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .filter(|name| seen.insert(*name))
        .map(str::to_string)
        .collect()
}

/// Rebuilds the variable list from `content`, keeping the declaration of every
/// name that is still referenced and dropping the rest.
pub fn derive_variables(content: &str, declared: &[TemplateVariable]) -> Vec<TemplateVariable> {
    extract_variables(content)
        .into_iter()
        .map(|name| {
            declared
                .iter()
                .find(|v| v.name == name)
                .cloned()
                .unwrap_or_else(|| TemplateVariable::new(name))
        })
        .collect()
}

/// Checks `values` against the placeholders in `content` without rendering.
pub fn validate(
    content: &str,
    declared: &[TemplateVariable],
    values: &Map<String, Value>,
) -> TemplateValidation {
    let mut missing_required = Vec::new();
    let mut invalid = Vec::new();

    for variable in derive_variables(content, declared) {
        match resolve(&variable, values) {
            None if variable.required => missing_required.push(variable.name.clone()),
            None => {}
            Some(value) => {
                if format_value(&variable, value).is_err() {
                    invalid.push(variable.name.clone());
                }
            }
        }
    }

    TemplateValidation {
        valid: missing_required.is_empty() && invalid.is_empty(),
        missing_required,
        invalid,
    }
}

/// Substitutes every placeholder with its formatted value.
///
/// Values for names the content does not reference are ignored. A placeholder
/// with no declaration is treated as a required string.
pub fn render(
    content: &str,
    declared: &[TemplateVariable],
    values: &Map<String, Value>,
) -> Result<String, TemplateError> {
    let variables = derive_variables(content, declared);

    let missing: Vec<String> = variables
        .iter()
        .filter(|v| v.required && resolve(v, values).is_none())
        .map(|v| v.name.clone())
        .collect();
    if !missing.is_empty() {
        return Err(TemplateError::MissingRequired(missing));
    }

    let mut formatted = Vec::with_capacity(variables.len());
    for variable in &variables {
        let text = match resolve(variable, values) {
            Some(value) => format_value(variable, value)?,
            None => String::new(),
        };
        formatted.push((variable.name.as_str(), text));
    }

    let rendered = PLACEHOLDER.replace_all(content, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        formatted
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, text)| text.clone())
            .unwrap_or_default()
    });

    Ok(rendered.into_owned())
}

fn resolve<'a>(variable: &'a TemplateVariable, values: &'a Map<String, Value>) -> Option<&'a Value> {
    values
        .get(&variable.name)
        .filter(|v| !v.is_null())
        .or(variable.default.as_ref().filter(|v| !v.is_null()))
}

fn format_value(variable: &TemplateVariable, value: &Value) -> Result<String, TemplateError> {
    let invalid = || TemplateError::InvalidValue {
        name: variable.name.clone(),
        expected: variable.var_type.as_str(),
    };

    match variable.var_type {
        VariableType::String | VariableType::Number => Ok(literal(value)),
        VariableType::Boolean => as_bool(value)
            .map(|b| if b { "Sim" } else { "Não" }.to_string())
            .ok_or_else(invalid),
        VariableType::Currency => as_f64(value)
            .filter(|amount| amount.abs() <= MAX_CURRENCY)
            .map(format_brl)
            .ok_or_else(invalid),
        VariableType::Date => as_date(value)
            .map(|d| d.format("%d/%m/%Y").to_string())
            .ok_or_else(invalid),
    }
}

fn literal(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "sim" | "yes" => Some(true),
            "false" | "0" | "não" | "nao" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    let amount: Option<f64> = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', ".").parse().ok(),
        _ => None,
    };
    amount.filter(|f| f.is_finite())
}

fn as_date(value: &Value) -> Option<NaiveDate> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .map(|dt| dt.date_naive()),
        Value::String(s) => {
            let s = s.trim();
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .or_else(|| NaiveDate::parse_from_str(s, "%d/%m/%Y").ok())
                .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive()))
        }
        _ => None,
    }
}

/// Largest amount whose cents are still exact in an `f64`.
const MAX_CURRENCY: f64 = 1e13;

/// Brazilian real, e.g. `R$ 1.234,50`.
fn format_brl(amount: f64) -> String {
    let cents = (amount.abs() * 100.0).round() as u64;
    let (units, fraction) = (cents / 100, cents % 100);

    let digits = units.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }

    let sign = if amount < 0.0 && cents > 0 { "-" } else { "" };
    format!("{sign}R$ {grouped},{fraction:02}")
}
