//! Field values held by snapshots.
//!
//! Canonical columns and free-form extra data share one value type. Matching
//! compares values through [`Value::match_token`], which gives every populated
//! value a canonical textual form.

use serde::{Deserialize, Serialize};

/// A single field value.
///
/// # Examples
///
/// ```
/// use matchlink::Value;
///
/// assert!(Value::from("123MatchID").is_populated());
/// assert!(!Value::from("   ").is_populated());
/// assert!(!Value::Null.is_populated());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Text.
    String(String),
    /// Arbitrary JSON.
    Json(serde_json::Value),
    /// Absent value.
    Null,
}

impl Value {
    /// Returns true for [`Value::Null`].
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns true when the value carries information.
    ///
    /// Blank strings and JSON nulls count as unpopulated.
    #[must_use]
    pub fn is_populated(&self) -> bool {
        match self {
            Self::Null | Self::Json(serde_json::Value::Null) => false,
            Self::String(s) => !s.trim().is_empty(),
            _ => true,
        }
    }

    /// Borrows the text of a string value.
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the integer, if any.
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the number, widening integers.
    pub const fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Canonical token used for equality during matching.
    ///
    /// Integral floats compare equal to the same integer.
    #[must_use]
    pub fn match_token(&self) -> Option<String> {
        if !self.is_populated() {
            return None;
        }
        let token = match self {
            Self::Bool(v) => v.to_string(),
            Self::Int(v) => v.to_string(),
            #[allow(clippy::cast_possible_truncation)]
            Self::Float(v) if v.fract() == 0.0 && v.abs() < 9.0e15 => (*v as i64).to_string(),
            Self::Float(v) => v.to_string(),
            Self::String(v) => v.trim().to_string(),
            Self::Json(v) => v.to_string(),
            Self::Null => return None,
        };
        Some(token)
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Json(_) => "json",
            Self::Null => "null",
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::Null
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v:?}"),
            Self::Json(v) => write!(f, "{v}"),
            Self::Null => write!(f, "null"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}
