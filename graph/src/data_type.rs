use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

const OBJECT_ID_LEN: usize = 24;

/// Declared type of a field.
///
/// Each variant knows how to coerce an incoming value to its own type;
/// values that can't be coerced are rejected rather than defaulted.
#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    String,
    Integer,
    Float,
    Boolean,
    ObjectId,
    Object,
    #[default]
    Unknown,
}

impl DataType {
    /// Coerce `value` to this type, returning `None` if that isn't possible.
    pub fn cast(&self, value: &Value) -> Option<Value> {
        if value.is_null() {
            return None;
        }
        match self {
            Self::String => cast_string(value),
            Self::Integer => cast_integer(value),
            Self::Float => cast_float(value),
            Self::Boolean => cast_boolean(value),
            Self::ObjectId => cast_object_id(value),
            Self::Object => value.is_object().then(|| value.clone()),
            Self::Unknown => Some(value.clone()),
        }
    }
}

fn cast_string(value: &Value) -> Option<Value> {
    match value {
        Value::String(_) => Some(value.clone()),
        Value::Number(n) => Some(Value::String(n.to_string())),
        Value::Bool(b) => Some(Value::String(b.to_string())),
        _ => None,
    }
}

fn cast_integer(value: &Value) -> Option<Value> {
    match value {
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                Some(value.clone())
            } else {
                let f = n.as_f64()?;
                // only accept floats that are already whole numbers:
                (f.fract() == 0.0 && f.is_finite()).then(|| Value::from(f as i64))
            }
        }
        Value::String(s) => s.trim().parse::<i64>().ok().map(Value::from),
        _ => None,
    }
}

fn cast_float(value: &Value) -> Option<Value> {
    match value {
        Value::Number(n) => n.as_f64().and_then(Number::from_f64).map(Value::Number),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),
        _ => None,
    }
}

fn cast_boolean(value: &Value) -> Option<Value> {
    match value {
        Value::Bool(_) => Some(value.clone()),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(Value::Bool(false)),
            Some(1) => Some(Value::Bool(true)),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(Value::Bool(true)),
            "false" | "0" => Some(Value::Bool(false)),
            _ => None,
        },
        _ => None,
    }
}

fn cast_object_id(value: &Value) -> Option<Value> {
    match value {
        Value::String(s)
            if s.len() == OBJECT_ID_LEN && s.chars().all(|c| c.is_ascii_hexdigit()) =>
        {
            Some(Value::String(s.to_ascii_lowercase()))
        }
        _ => None,
    }
}
