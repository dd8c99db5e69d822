//! Field typing: configured casts applied to raw event values before any
//! rule sees them, plus runtime-type naming for drift observation.
//!
//! Unconfigured fields pass through with their JSON type preserved, which
//! matches the historical contract (the rule author owns the type). A
//! configured cast that fails rejects the whole event with a [`CastError`];
//! no rule runs against a half-cast payload.

use std::collections::HashMap;
use std::fmt;

use chrono::{NaiveDateTime, TimeZone, Utc};

use crate::rules::Value;

/// Configured scalar type for one event field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Int,
    Float,
    Bool,
    String,
    /// Format string per `chrono::format::strftime`, e.g. `%Y-%m-%d %H:%M:%S`.
    Datetime { format: String },
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::Bool => "bool",
            FieldType::String => "string",
            FieldType::Datetime { .. } => "datetime",
        }
    }

    /// Parse a stored (name, optional format) pair back into a type.
    pub fn from_parts(name: &str, format: Option<&str>) -> Option<Self> {
        match name {
            "int" => Some(FieldType::Int),
            "float" => Some(FieldType::Float),
            "bool" => Some(FieldType::Bool),
            "string" => Some(FieldType::String),
            "datetime" => format.map(|f| FieldType::Datetime {
                format: f.to_string(),
            }),
            _ => None,
        }
    }

    pub fn format(&self) -> Option<&str> {
        match self {
            FieldType::Datetime { format } => Some(format),
            _ => None,
        }
    }
}

/// Field name -> configured type, as loaded from storage.
pub type FieldTypeConfig = HashMap<String, FieldType>;

/// A raw event value that does not fit its configured type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CastError {
    pub field: String,
    pub value: String,
    pub target: &'static str,
}

impl fmt::Display for CastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot cast field '{}' value {} to {}",
            self.field, self.value, self.target
        )
    }
}

impl std::error::Error for CastError {}

/// JSON runtime type name as recorded by observation counting.
pub fn runtime_type(raw: &serde_json::Value) -> &'static str {
    match raw {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        serde_json::Value::Number(_) => "float",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Cast one raw field value per its configuration (or pass it through).
pub fn cast(
    field: &str,
    raw: &serde_json::Value,
    config: Option<&FieldType>,
) -> Result<Value, CastError> {
    let Some(target) = config else {
        return Ok(passthrough(raw));
    };

    let fail = || CastError {
        field: field.to_string(),
        value: raw.to_string(),
        target: target.as_str(),
    };

    match target {
        FieldType::Int => match raw {
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Int(i))
                } else {
                    // Accept float-typed JSON with an integral value.
                    let f = n.as_f64().ok_or_else(fail)?;
                    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                        Ok(Value::Int(f as i64))
                    } else {
                        Err(fail())
                    }
                }
            }
            serde_json::Value::String(s) => {
                s.trim().parse::<i64>().map(Value::Int).map_err(|_| fail())
            }
            _ => Err(fail()),
        },
        FieldType::Float => match raw {
            serde_json::Value::Number(n) => n.as_f64().map(Value::Float).ok_or_else(fail),
            serde_json::Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| fail()),
            _ => Err(fail()),
        },
        FieldType::Bool => match raw {
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" => Ok(Value::Bool(false)),
                _ => Err(fail()),
            },
            _ => Err(fail()),
        },
        FieldType::String => match raw {
            serde_json::Value::String(s) => Ok(Value::Str(s.clone())),
            serde_json::Value::Number(n) => Ok(Value::Str(n.to_string())),
            serde_json::Value::Bool(b) => Ok(Value::Str(b.to_string())),
            _ => Err(fail()),
        },
        FieldType::Datetime { format } => match raw {
            serde_json::Value::String(s) => NaiveDateTime::parse_from_str(s, format)
                .map(|naive| Value::Timestamp(Utc.from_utc_datetime(&naive)))
                .map_err(|_| fail()),
            _ => Err(fail()),
        },
    }
}

/// Lift an unconfigured JSON value into the rule value space unchanged.
/// Nested objects are carried as their JSON text; rules see them as opaque
/// strings.
fn passthrough(raw: &serde_json::Value) -> Value {
    match raw {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Array(items) => Value::List(items.iter().map(passthrough).collect()),
        serde_json::Value::Object(_) => Value::Str(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_amount_casts_to_float() {
        let v = cast("amount", &json!("9999"), Some(&FieldType::Float)).unwrap();
        assert_eq!(v, Value::Float(9999.0));
    }

    #[test]
    fn unparseable_float_is_a_cast_error() {
        let err = cast("amount", &json!("not-a-number"), Some(&FieldType::Float)).unwrap_err();
        assert_eq!(err.field, "amount");
        assert_eq!(err.target, "float");
        assert!(err.to_string().contains("amount"));
        assert!(err.to_string().contains("not-a-number"));
    }

    #[test]
    fn unconfigured_fields_pass_through() {
        assert_eq!(cast("x", &json!("9999"), None).unwrap(), Value::Str("9999".into()));
        assert_eq!(cast("x", &json!(7), None).unwrap(), Value::Int(7));
        assert_eq!(cast("x", &json!(1.5), None).unwrap(), Value::Float(1.5));
        assert_eq!(
            cast("x", &json!(["a", 1]), None).unwrap(),
            Value::List(vec![Value::Str("a".into()), Value::Int(1)])
        );
    }

    #[test]
    fn int_cast_accepts_integral_floats_and_strings() {
        assert_eq!(cast("n", &json!(5.0), Some(&FieldType::Int)).unwrap(), Value::Int(5));
        assert_eq!(cast("n", &json!(" 42 "), Some(&FieldType::Int)).unwrap(), Value::Int(42));
        assert!(cast("n", &json!(5.5), Some(&FieldType::Int)).is_err());
    }

    #[test]
    fn bool_cast_from_strings() {
        assert_eq!(
            cast("b", &json!("True"), Some(&FieldType::Bool)).unwrap(),
            Value::Bool(true)
        );
        assert!(cast("b", &json!("yes"), Some(&FieldType::Bool)).is_err());
    }

    #[test]
    fn datetime_cast_requires_matching_format() {
        let ty = FieldType::Datetime {
            format: "%Y-%m-%d %H:%M:%S".to_string(),
        };
        let v = cast("ts", &json!("2026-08-25 10:30:00"), Some(&ty)).unwrap();
        assert!(matches!(v, Value::Timestamp(_)));

        let err = cast("ts", &json!("25/08/2026"), Some(&ty)).unwrap_err();
        assert_eq!(err.target, "datetime");
    }

    #[test]
    fn runtime_type_names() {
        assert_eq!(runtime_type(&json!("a")), "string");
        assert_eq!(runtime_type(&json!(1)), "int");
        assert_eq!(runtime_type(&json!(1.5)), "float");
        assert_eq!(runtime_type(&json!(null)), "null");
        assert_eq!(runtime_type(&json!({"a": 1})), "object");
    }

    #[test]
    fn field_type_round_trips_through_parts() {
        let ty = FieldType::Datetime {
            format: "%Y-%m-%d".to_string(),
        };
        let back = FieldType::from_parts(ty.as_str(), ty.format()).unwrap();
        assert_eq!(back, ty);
        assert_eq!(FieldType::from_parts("float", None), Some(FieldType::Float));
        assert_eq!(FieldType::from_parts("datetime", None), None);
    }
}
