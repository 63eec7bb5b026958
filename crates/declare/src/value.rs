//! Value model shared by declarations, scopes, and diffing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A resolved configuration value.
///
/// Everything a declaration body can evaluate to is one of these. Resource
/// handles are first-class values so a field can hold a pointer to another
/// declared resource without owning it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Handle to another declared resource, produced by resolving a
    /// resource reference that has no attribute projection.
    Resource { type_name: String, name: String },
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Borrow the string content, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Render the value as a resource name component.
    ///
    /// Only scalars make usable names; compound values return `None` and
    /// the caller reports the declaration as invalid.
    pub fn to_name(&self) -> Option<String> {
        match self {
            Self::String(s) => Some(s.clone()),
            Self::Int(n) => Some(n.to_string()),
            Self::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Map(entries) => {
                write!(f, "{{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                write!(f, "}}")
            }
            Self::Resource { type_name, name } => write!(f, "$({type_name} {name})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_scalars() {
        assert_eq!(Value::Null.to_string(), "null");
        assert_eq!(Value::from("ab").to_string(), "ab");
        assert_eq!(Value::from(7).to_string(), "7");
    }

    #[test]
    fn test_display_compound() {
        let list = Value::List(vec![Value::from(1), Value::from("x")]);
        assert_eq!(list.to_string(), "[1, x]");

        let mut entries = BTreeMap::new();
        entries.insert("a".to_string(), Value::from(true));
        assert_eq!(Value::Map(entries).to_string(), "{a: true}");
    }

    #[test]
    fn test_to_name_rejects_compound_values() {
        assert_eq!(Value::from("web").to_name().as_deref(), Some("web"));
        assert_eq!(Value::from(2).to_name().as_deref(), Some("2"));
        assert!(Value::List(vec![]).to_name().is_none());
        assert!(Value::Null.to_name().is_none());
    }
}
