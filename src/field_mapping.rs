//! Configuration-driven field mapping between local fields and CRM properties.
//!
//! A mapping is an ordered list of [`FieldRule`]s stored on the sync config.
//! Only fields with a rule are written, and the only conversion applied is
//! the one declared for the destination side.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value as JsonValue};
use utoipa::ToSchema;

use crate::error::EngineError;
use crate::models::SyncDirection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RuleDirection {
    #[default]
    Both,
    ToExternal,
    FromExternal,
}

impl RuleDirection {
    fn applies_to(self, direction: SyncDirection) -> bool {
        match self {
            RuleDirection::Both => true,
            RuleDirection::ToExternal => direction == SyncDirection::ToExternal,
            RuleDirection::FromExternal => direction == SyncDirection::FromExternal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    #[default]
    Any,
    String,
    Number,
    Integer,
    Boolean,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    Trim,
    Lowercase,
    Uppercase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct FieldRule {
    pub local_field: String,
    pub external_field: String,
    #[serde(default)]
    pub direction: RuleDirection,
    #[serde(default)]
    pub local_type: ValueType,
    #[serde(default)]
    pub external_type: ValueType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
}

/// Parsed rule set of one sync config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMapping {
    rules: Vec<FieldRule>,
}

impl FieldMapping {
    pub fn new(rules: Vec<FieldRule>) -> Self {
        Self { rules }
    }

    /// Parses the `field_mappings` column. `null` means no rules.
    pub fn from_json(value: &JsonValue) -> Result<Self, EngineError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        let rules: Vec<FieldRule> = serde_json::from_value(value.clone())
            .map_err(|e| EngineError::FieldMapping(format!("invalid field mapping rules: {e}")))?;
        for rule in &rules {
            if rule.local_field.trim().is_empty() || rule.external_field.trim().is_empty() {
                return Err(EngineError::FieldMapping(
                    "field rule with empty field name".to_string(),
                ));
            }
        }
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }

    /// CRM properties to request when reading records.
    pub fn external_properties(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .rules
            .iter()
            .filter(|r| r.direction.applies_to(SyncDirection::FromExternal))
            .map(|r| r.external_field.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Local fields to CRM properties.
    pub fn to_external(
        &self,
        fields: &Map<String, JsonValue>,
    ) -> Result<Map<String, JsonValue>, EngineError> {
        self.apply(fields, SyncDirection::ToExternal)
    }

    /// CRM properties to local fields.
    pub fn to_local(
        &self,
        properties: &Map<String, JsonValue>,
    ) -> Result<Map<String, JsonValue>, EngineError> {
        self.apply(properties, SyncDirection::FromExternal)
    }

    fn apply(
        &self,
        source: &Map<String, JsonValue>,
        direction: SyncDirection,
    ) -> Result<Map<String, JsonValue>, EngineError> {
        let mut out = Map::new();

        for rule in self.rules.iter().filter(|r| r.direction.applies_to(direction)) {
            let (from, to, target) = match direction {
                SyncDirection::FromExternal => {
                    (&rule.external_field, &rule.local_field, rule.local_type)
                }
                _ => (&rule.local_field, &rule.external_field, rule.external_type),
            };

            let Some(value) = source.get(from.as_str()) else {
                if rule.required {
                    return Err(EngineError::FieldMapping(format!(
                        "required field '{from}' is missing"
                    )));
                }
                continue;
            };

            let value = match rule.transform {
                Some(transform) => apply_transform(value, transform),
                None => value.clone(),
            };
            let converted = convert(&value, target)
                .map_err(|msg| EngineError::FieldMapping(format!("field '{from}': {msg}")))?;
            out.insert(to.clone(), converted);
        }

        Ok(out)
    }
}

fn apply_transform(value: &JsonValue, transform: Transform) -> JsonValue {
    match value {
        JsonValue::String(s) => JsonValue::String(match transform {
            Transform::Trim => s.trim().to_string(),
            Transform::Lowercase => s.to_lowercase(),
            Transform::Uppercase => s.to_uppercase(),
        }),
        other => other.clone(),
    }
}

/// Converts `value` to `target`. `null` always passes through.
pub fn convert(value: &JsonValue, target: ValueType) -> Result<JsonValue, String> {
    if value.is_null() || target == ValueType::Any {
        return Ok(value.clone());
    }

    match target {
        ValueType::Any => Ok(value.clone()),
        ValueType::String => match value {
            JsonValue::String(_) => Ok(value.clone()),
            JsonValue::Number(n) => Ok(JsonValue::String(n.to_string())),
            JsonValue::Bool(b) => Ok(JsonValue::String(b.to_string())),
            _ => Err(format!("cannot convert {} to string", kind(value))),
        },
        ValueType::Number => match value {
            JsonValue::Number(_) => Ok(value.clone()),
            JsonValue::String(s) => parse_number(s.trim())
                .ok_or_else(|| format!("'{s}' is not a number")),
            _ => Err(format!("cannot convert {} to number", kind(value))),
        },
        ValueType::Integer => match value {
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(JsonValue::from(i))
                } else if let Some(f) = n.as_f64()
                    && f.fract() == 0.0
                    && f.abs() < i64::MAX as f64
                {
                    Ok(JsonValue::from(f as i64))
                } else {
                    Err(format!("{n} is not an integer"))
                }
            }
            JsonValue::String(s) => s
                .trim()
                .parse::<i64>()
                .map(JsonValue::from)
                .map_err(|_| format!("'{s}' is not an integer")),
            _ => Err(format!("cannot convert {} to integer", kind(value))),
        },
        ValueType::Boolean => match value {
            JsonValue::Bool(_) => Ok(value.clone()),
            JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(JsonValue::Bool(true)),
                "false" => Ok(JsonValue::Bool(false)),
                _ => Err(format!("'{s}' is not a boolean")),
            },
            _ => Err(format!("cannot convert {} to boolean", kind(value))),
        },
        ValueType::Timestamp => {
            let parsed = match value {
                JsonValue::String(s) => parse_timestamp_str(s.trim()),
                JsonValue::Number(n) => n
                    .as_i64()
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
                _ => None,
            };
            parsed
                .map(|dt| JsonValue::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)))
                .ok_or_else(|| format!("{value} is not a timestamp"))
        }
    }
}

fn parse_number(s: &str) -> Option<JsonValue> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(JsonValue::from(i));
    }
    s.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(JsonValue::Number)
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    s.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
