//! Declarative parameter schemas: validation, defaults and string coercion.

use serde::Serialize;
use serde_json::{json, Map, Number, Value};

use crate::codes::ErrorCode;
use crate::error::ScriptError;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Enum(&'static [&'static str]),
}

impl FieldType {
    fn name(&self) -> &'static str {
        match self {
            FieldType::String | FieldType::Enum(_) => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: &'static str,
    pub ty: FieldType,
    pub required: bool,
    pub default: Option<Value>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub description: &'static str,
}

impl Field {
    fn new(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            required: false,
            default: None,
            min: None,
            max: None,
            description: "",
        }
    }

    pub fn string(name: &'static str) -> Self {
        Self::new(name, FieldType::String)
    }

    pub fn integer(name: &'static str) -> Self {
        Self::new(name, FieldType::Integer)
    }

    pub fn number(name: &'static str) -> Self {
        Self::new(name, FieldType::Number)
    }

    pub fn boolean(name: &'static str) -> Self {
        Self::new(name, FieldType::Boolean)
    }

    pub fn array(name: &'static str) -> Self {
        Self::new(name, FieldType::Array)
    }

    pub fn object(name: &'static str) -> Self {
        Self::new(name, FieldType::Object)
    }

    pub fn one_of(name: &'static str, values: &'static [&'static str]) -> Self {
        Self::new(name, FieldType::Enum(values))
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn describe(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Coerce and check one present value.
    fn check(&self, value: Value) -> Result<Value, FieldIssue> {
        let value = coerce(&self.ty, value);
        let type_error = || FieldIssue::new(self.name, format!("Expected {}", self.ty.name()), "invalid_type");

        match &self.ty {
            FieldType::String => value.is_string().then_some(()).ok_or_else(type_error)?,
            FieldType::Boolean => value.is_boolean().then_some(()).ok_or_else(type_error)?,
            FieldType::Array => value.is_array().then_some(()).ok_or_else(type_error)?,
            FieldType::Object => value.is_object().then_some(()).ok_or_else(type_error)?,
            FieldType::Number => value.is_number().then_some(()).ok_or_else(type_error)?,
            FieldType::Integer => {
                let is_integer = value.is_i64()
                    || value.is_u64()
                    || value.as_f64().is_some_and(|f| f.fract() == 0.0);
                if !is_integer {
                    return Err(type_error());
                }
            }
            FieldType::Enum(values) => {
                let matches = value.as_str().is_some_and(|s| values.contains(&s));
                if !matches {
                    return Err(FieldIssue::new(
                        self.name,
                        format!("Expected one of: {}", values.join(", ")),
                        "invalid_enum_value",
                    ));
                }
            }
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = self.min.filter(|min| n < *min) {
                return Err(FieldIssue::new(self.name, format!("Must be >= {min}"), "too_small"));
            }
            if let Some(max) = self.max.filter(|max| n > *max) {
                return Err(FieldIssue::new(self.name, format!("Must be <= {max}"), "too_big"));
            }
        }

        // Integers given as 5.0 are normalized so typed params deserialize.
        if self.ty == FieldType::Integer && !value.is_i64() && !value.is_u64() {
            if let Some(f) = value.as_f64() {
                return Ok(Value::Number(Number::from(f as i64)));
            }
        }
        Ok(value)
    }

    fn to_json(&self) -> Value {
        let mut schema = Map::new();
        schema.insert("type".into(), json!(self.ty.name()));
        if let FieldType::Enum(values) = &self.ty {
            schema.insert("enum".into(), json!(values));
        }
        if !self.description.is_empty() {
            schema.insert("description".into(), json!(self.description));
        }
        if let Some(default) = &self.default {
            schema.insert("default".into(), default.clone());
        }
        if let Some(min) = self.min {
            schema.insert("minimum".into(), json!(min));
        }
        if let Some(max) = self.max {
            schema.insert("maximum".into(), json!(max));
        }
        Value::Object(schema)
    }
}

/// The CLI passes everything as strings.
fn coerce(ty: &FieldType, value: Value) -> Value {
    let Value::String(s) = &value else {
        return value;
    };
    let trimmed = s.trim();
    match ty {
        FieldType::Integer => trimmed
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or(value),
        FieldType::Number => trimmed
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(value),
        FieldType::Boolean => match trimmed {
            "true" | "1" | "yes" => Value::Bool(true),
            "false" | "0" | "no" => Value::Bool(false),
            _ => value,
        },
        FieldType::Array | FieldType::Object => {
            serde_json::from_str::<Value>(trimmed)
                .ok()
                .filter(|v| v.is_array() || v.is_object())
                .unwrap_or(value)
        }
        FieldType::String | FieldType::Enum(_) => value,
    }
}

/// One entry of `details.errors` on an `E_INVALID_PARAMS` failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldIssue {
    pub path: String,
    pub message: String,
    pub code: String,
}

impl FieldIssue {
    fn new(path: &str, message: impl Into<String>, code: &str) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
            code: code.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSchema {
    fields: Vec<Field>,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Validate `params`, returning them with defaults applied and strings
    /// coerced. Unknown keys pass through untouched.
    pub fn validate(&self, params: Value) -> Result<Value, ScriptError> {
        let mut map = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(invalid(vec![FieldIssue::new(
                    "",
                    format!("Expected object, got {}", kind_of(&other)),
                    "invalid_type",
                )]))
            }
        };

        let mut issues = Vec::new();
        for field in &self.fields {
            match map.remove(field.name).filter(|v| !v.is_null()) {
                Some(value) => match field.check(value) {
                    Ok(value) => {
                        map.insert(field.name.to_string(), value);
                    }
                    Err(issue) => issues.push(issue),
                },
                None => {
                    if let Some(default) = &field.default {
                        map.insert(field.name.to_string(), default.clone());
                    } else if field.required {
                        issues.push(FieldIssue::new(field.name, "Required", "invalid_type"));
                    }
                }
            }
        }

        if issues.is_empty() {
            Ok(Value::Object(map))
        } else {
            Err(invalid(issues))
        }
    }

    /// JSON-schema-like description used by `script.list` and tool listings.
    pub fn to_json(&self) -> Value {
        let properties: Map<String, Value> = self
            .fields
            .iter()
            .map(|f| (f.name.to_string(), f.to_json()))
            .collect();
        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name)
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn invalid(issues: Vec<FieldIssue>) -> ScriptError {
    let summary = issues
        .iter()
        .map(|i| {
            if i.path.is_empty() {
                i.message.clone()
            } else {
                format!("{}: {}", i.path, i.message)
            }
        })
        .collect::<Vec<_>>()
        .join("; ");
    ScriptError::new(ErrorCode::InvalidParams, format!("Invalid parameters: {summary}"))
        .with_details(json!({ "errors": issues }))
}
