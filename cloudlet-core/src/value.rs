//! Wire values: the typed field maps carried by every protocol frame.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One wire value. Anything a frame header can carry is one of these kinds;
/// unrepresentable data is rejected at build time, not on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    /// Wide enough for server-assigned session identifiers.
    Int(i128),
    Float(f64),
    Str(String),
    Array(Vec<Value>),
    Map(Fields),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(fields) => {
                write!(f, "{{")?;
                for (i, (key, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i128> for Value {
    fn from(v: i128) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v.into())
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl From<Fields> for Value {
    fn from(v: Fields) -> Self {
        Value::Map(v)
    }
}

/// Ordered field map. Keys are unique and keep their first insertion position;
/// inserting an existing key overwrites the value in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fields(Vec<(String, Value)>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    /// Builder form of `insert`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Value)> {
        self.0.iter()
    }

    pub fn require(&self, key: &str) -> Result<&Value, FieldError> {
        self.get(key).ok_or_else(|| FieldError::Missing(key.to_owned()))
    }

    pub fn require_bool(&self, key: &str) -> Result<bool, FieldError> {
        match self.require(key)? {
            Value::Bool(b) => Ok(*b),
            other => Err(FieldError::wrong_kind(key, "bool", other)),
        }
    }

    pub fn require_int(&self, key: &str) -> Result<i128, FieldError> {
        match self.require(key)? {
            Value::Int(n) => Ok(*n),
            other => Err(FieldError::wrong_kind(key, "int", other)),
        }
    }

    /// Integer field constrained to an unsigned 64-bit range (sizes, counts).
    pub fn require_u64(&self, key: &str) -> Result<u64, FieldError> {
        let n = self.require_int(key)?;
        u64::try_from(n).map_err(|_| FieldError::OutOfRange {
            key: key.to_owned(),
            expected: "u64",
        })
    }

    pub fn require_str(&self, key: &str) -> Result<&str, FieldError> {
        match self.require(key)? {
            Value::Str(s) => Ok(s),
            other => Err(FieldError::wrong_kind(key, "str", other)),
        }
    }

    pub fn require_array(&self, key: &str) -> Result<&[Value], FieldError> {
        match self.require(key)? {
            Value::Array(items) => Ok(items),
            other => Err(FieldError::wrong_kind(key, "array", other)),
        }
    }

    pub fn require_map(&self, key: &str) -> Result<&Fields, FieldError> {
        match self.require(key)? {
            Value::Map(fields) => Ok(fields),
            other => Err(FieldError::wrong_kind(key, "map", other)),
        }
    }
}

impl FromIterator<(String, Value)> for Fields {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut fields = Fields::new();
        for (key, value) in iter {
            fields.insert(key, value);
        }
        fields
    }
}

/// Field lookup or shape mismatch. The frame arrived intact but does not
/// carry what the protocol requires.
#[derive(Debug, Error)]
pub enum FieldError {
    #[error("missing field `{0}`")]
    Missing(String),
    #[error("field `{key}` is {found}, expected {expected}")]
    WrongKind {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("field `{key}` is out of range for {expected}")]
    OutOfRange { key: String, expected: &'static str },
}

impl FieldError {
    fn wrong_kind(key: &str, expected: &'static str, found: &Value) -> Self {
        FieldError::WrongKind {
            key: key.to_owned(),
            expected,
            found: found.kind(),
        }
    }
}
