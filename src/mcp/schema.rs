//! Tool input schemas
//!
//! Tool arguments are described by JSON Schema documents. [`Schema`] builds
//! such a document in code; [`CompiledSchema`] is the form held by the
//! registry, compiled once with `jsonschema` and then used to validate every
//! incoming call.
//!
//! Validation is pure: it never touches the network and reports *every*
//! violated field, not just the first one.

use std::fmt;

use jsonschema::error::ValidationErrorKind;
use jsonschema::{JSONSchema, ValidationError};
use serde_json::{json, Map, Value};

use crate::error::FieldError;

/// Field name used when the whole argument payload is wrong
const ROOT: &str = "arguments";

/// JSON Schema document under construction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema(Map<String, Value>);

impl Schema {
    fn of(ty: &str) -> Self {
        let mut doc = Map::new();
        doc.insert("type".into(), json!(ty));
        Self(doc)
    }

    // ==================== Builders ====================

    pub fn object() -> Self {
        let mut schema = Self::of("object");
        schema.0.insert("properties".into(), json!({}));
        schema
    }

    pub fn string() -> Self {
        Self::of("string")
    }

    pub fn integer() -> Self {
        Self::of("integer")
    }

    /// Add an optional property
    pub fn property(mut self, name: impl Into<String>, schema: Schema) -> Self {
        let props = self
            .0
            .entry("properties")
            .or_insert_with(|| json!({}));
        if let Value::Object(props) = props {
            props.insert(name.into(), schema.to_json());
        }
        self
    }

    /// Add a property that must be present
    pub fn required_property(mut self, name: impl Into<String>, schema: Schema) -> Self {
        let name = name.into();
        let required = self.0.entry("required").or_insert_with(|| json!([]));
        if let Value::Array(required) = required {
            required.push(json!(name));
        }
        self.property(name, schema)
    }

    /// Reject properties that are not declared
    pub fn deny_additional(self) -> Self {
        self.set("additionalProperties", json!(false))
    }

    pub fn range(self, min: Option<f64>, max: Option<f64>) -> Self {
        self.set_opt("minimum", min.map(|n| json!(n)))
            .set_opt("maximum", max.map(|n| json!(n)))
    }

    fn set(mut self, key: &str, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    fn set_opt(self, key: &str, value: Option<Value>) -> Self {
        match value {
            Some(value) => self.set(key, value),
            None => self,
        }
    }

    // ==================== Conversion ====================

    /// Wrap an existing JSON Schema document
    pub fn from_json(doc: &Value) -> Result<Self, String> {
        doc.as_object()
            .map(|map| Self(map.clone()))
            .ok_or_else(|| "schema must be a JSON object".to_string())
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Compile for validation; malformed documents are rejected here
    pub fn compile(&self) -> Result<CompiledSchema, String> {
        CompiledSchema::compile(self.to_json())
    }
}

/// A schema ready to validate arguments
pub struct CompiledSchema {
    doc: Value,
    validator: JSONSchema,
}

impl CompiledSchema {
    pub fn compile(doc: Value) -> Result<Self, String> {
        let validator = JSONSchema::compile(&doc).map_err(|e| e.to_string())?;
        Ok(Self { doc, validator })
    }

    /// The document this schema was compiled from
    pub fn to_json(&self) -> Value {
        self.doc.clone()
    }

    /// Whether the root of the schema describes an object
    pub fn is_object(&self) -> bool {
        declares(&self.doc, "object")
    }

    /// Validate an argument payload
    ///
    /// Returns the normalized arguments (missing object payload becomes `{}`,
    /// integral floats become integers where an integer is expected, declared
    /// defaults are filled in) or every field that violates the schema.
    pub fn validate(&self, args: &Value) -> Result<Value, Vec<FieldError>> {
        let args = match args {
            Value::Null if self.is_object() => Value::Object(Map::new()),
            other => normalize(&self.doc, other.clone()),
        };

        let errors: Vec<FieldError> = match self.validator.validate(&args) {
            Ok(()) => Vec::new(),
            Err(errors) => errors.flat_map(|e| field_errors(&args, e)).collect(),
        };
        if errors.is_empty() {
            Ok(args)
        } else {
            Err(errors)
        }
    }
}

impl fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledSchema")
            .field("doc", &self.doc)
            .finish_non_exhaustive()
    }
}

// ==================== Normalization ====================

fn declares(schema: &Value, ty: &str) -> bool {
    match schema.get("type") {
        Some(Value::String(name)) => name == ty,
        Some(Value::Array(names)) => names.iter().any(|n| n == ty),
        _ => false,
    }
}

fn is_integral(f: f64) -> bool {
    f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64
}

fn normalize(schema: &Value, value: Value) -> Value {
    match value {
        Value::Number(n) if declares(schema, "integer") && !declares(schema, "number") => {
            match n.as_f64() {
                Some(f) if n.is_f64() && is_integral(f) => json!(f as i64),
                _ => Value::Number(n),
            }
        }
        Value::Object(mut map) => {
            if let Some(props) = schema.get("properties").and_then(Value::as_object) {
                for (name, sub) in props {
                    match map.get_mut(name) {
                        Some(field) => *field = normalize(sub, field.take()),
                        None => {
                            if let Some(default) = sub.get("default") {
                                map.insert(name.clone(), default.clone());
                            }
                        }
                    }
                }
            }
            Value::Object(map)
        }
        Value::Array(items) => match schema.get("items") {
            Some(item_schema) if item_schema.is_object() => Value::Array(
                items
                    .into_iter()
                    .map(|item| normalize(item_schema, item))
                    .collect(),
            ),
            _ => Value::Array(items),
        },
        other => other,
    }
}

// ==================== Error mapping ====================

fn field_errors(instance: &Value, error: ValidationError<'_>) -> Vec<FieldError> {
    let pointer = error.instance_path.to_string();
    match &error.kind {
        ValidationErrorKind::Required { property } => {
            let name = property.as_str().map(str::to_string).unwrap_or_else(|| property.to_string());
            vec![FieldError::new(field_path(instance, &pointer, Some(&name)), "is required")]
        }
        ValidationErrorKind::AdditionalProperties { unexpected } => unexpected
            .iter()
            .map(|name| FieldError::new(field_path(instance, &pointer, Some(name)), "is not an allowed field"))
            .collect(),
        _ => vec![FieldError::new(field_path(instance, &pointer, None), error.to_string())],
    }
}

/// Render a JSON pointer as `target.host` / `tags[1]`
fn field_path(instance: &Value, pointer: &str, child: Option<&str>) -> String {
    let mut out = String::new();
    let mut current = Some(instance);

    for raw in pointer.split('/').skip(1) {
        let segment = raw.replace("~1", "/").replace("~0", "~");
        match current {
            Some(Value::Array(items)) => {
                out.push('[');
                out.push_str(&segment);
                out.push(']');
                current = segment.parse::<usize>().ok().and_then(|i| items.get(i));
            }
            other => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(&segment);
                current = other.and_then(|v| v.get(segment.as_str()));
            }
        }
    }

    if let Some(child) = child {
        if !out.is_empty() {
            out.push('.');
        }
        out.push_str(child);
    }

    if out.is_empty() {
        ROOT.to_string()
    } else {
        out
    }
}
