//! Structural schemas for plugin option validation.
//!
//! Each protection plugin publishes schemas for its backup options, restore
//! options, and saved metadata. Callers validate user input against these
//! before invoking the plugin.

use serde_json::Value;
use thiserror::Error;

/// Schema validation errors.
#[derive(Error, Debug)]
pub enum SchemaError {
    /// A required field was not supplied.
    #[error("missing required field: {0}")]
    MissingField(String),

    /// A field value has the wrong type.
    #[error("field '{field}' has invalid type: expected {expected}, got {actual}")]
    InvalidType {
        /// Name of the offending field.
        field: String,
        /// Expected type name.
        expected: String,
        /// Actual type name of the supplied value.
        actual: String,
    },

    /// A string value is not one of the allowed options.
    #[error("field '{field}' value '{value}' is not a valid option. Valid: {valid:?}")]
    InvalidEnum {
        /// Name of the offending field.
        field: String,
        /// The supplied value.
        value: String,
        /// Allowed values.
        valid: Vec<String>,
    },
}

/// Type of a schema field.
#[derive(Debug, Clone)]
pub enum FieldType {
    /// A JSON string.
    String,
    /// A JSON integer.
    Integer,
    /// A JSON boolean.
    Boolean,
    /// A string restricted to the given options.
    Enum(Vec<String>),
    /// A JSON object with unspecified shape.
    Object,
    /// A JSON array with unspecified element shape.
    Array,
    /// Any JSON value.
    Any,
}

impl FieldType {
    fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (FieldType::String, Value::String(_)) => true,
            (FieldType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (FieldType::Boolean, Value::Bool(_)) => true,
            (FieldType::Enum(options), Value::String(s)) => options.contains(s),
            (FieldType::Object, Value::Object(_)) => true,
            (FieldType::Array, Value::Array(_)) => true,
            (FieldType::Any, _) => true,
            _ => false,
        }
    }

    fn type_name(&self) -> String {
        match self {
            FieldType::String => "string".to_string(),
            FieldType::Integer => "integer".to_string(),
            FieldType::Boolean => "boolean".to_string(),
            FieldType::Enum(opts) => format!("enum({opts:?})"),
            FieldType::Object => "object".to_string(),
            FieldType::Array => "array".to_string(),
            FieldType::Any => "any".to_string(),
        }
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One field of a schema.
#[derive(Debug, Clone)]
pub struct Field {
    /// Field name.
    pub name: String,
    /// Expected value type.
    pub field_type: FieldType,
    /// Whether the field must be present.
    pub required: bool,
    /// Human-readable description.
    pub description: String,
}

/// A named structural schema.
#[derive(Debug, Clone)]
pub struct Schema {
    /// Schema name, for error reporting.
    pub name: String,
    /// Declared fields.
    pub fields: Vec<Field>,
}

impl Schema {
    /// Create an empty schema called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Add a required field.
    pub fn field(
        mut self,
        name: impl Into<String>,
        field_type: FieldType,
        description: impl Into<String>,
    ) -> Self {
        self.fields.push(Field {
            name: name.into(),
            field_type,
            required: true,
            description: description.into(),
        });
        self
    }

    /// Add an optional field.
    pub fn optional(
        mut self,
        name: impl Into<String>,
        field_type: FieldType,
        description: impl Into<String>,
    ) -> Self {
        self.fields.push(Field {
            name: name.into(),
            field_type,
            required: false,
            description: description.into(),
        });
        self
    }

    /// Validate `options` against this schema.
    pub fn validate(&self, options: &serde_json::Map<String, Value>) -> Result<(), SchemaError> {
        for field in &self.fields {
            match options.get(&field.name) {
                None => {
                    if field.required {
                        return Err(SchemaError::MissingField(field.name.clone()));
                    }
                }
                Some(value) => {
                    if !field.field_type.matches(value) {
                        if let (FieldType::Enum(options), Value::String(s)) =
                            (&field.field_type, value)
                        {
                            return Err(SchemaError::InvalidEnum {
                                field: field.name.clone(),
                                value: s.clone(),
                                valid: options.clone(),
                            });
                        }
                        return Err(SchemaError::InvalidType {
                            field: field.name.clone(),
                            expected: field.field_type.type_name(),
                            actual: value_type_name(value).to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
