//! Symbolic references between declarations.
//!
//! A reference is a deferred pointer: it holds no value until resolution
//! succeeds against a scope chain. Resolution returns an explicit
//! [`Resolution`] tag instead of unwinding, so the evaluator can defer and
//! retry declarations whose targets are not materialized yet.

use crate::node::Expr;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A symbolic reference as written in a declaration body.
#[derive(Debug, Clone, PartialEq)]
pub enum Reference {
    /// Bare name, looked up through the scope chain.
    Simple { name: String },
    /// `$(type name | attribute)` resource reference.
    ///
    /// The name may itself be a computed expression and is optional: a
    /// type-only reference yields every resource of the type.
    Resource {
        type_name: String,
        name: Option<Box<Expr>>,
        attribute: Option<String>,
    },
}

impl Reference {
    pub fn simple(name: impl Into<String>) -> Self {
        Self::Simple { name: name.into() }
    }

    pub fn resource(type_name: impl Into<String>, name: Expr) -> Self {
        Self::Resource {
            type_name: type_name.into(),
            name: Some(Box::new(name)),
            attribute: None,
        }
    }

    pub fn resource_attr(type_name: impl Into<String>, name: Expr, attribute: impl Into<String>) -> Self {
        Self::Resource {
            type_name: type_name.into(),
            name: Some(Box::new(name)),
            attribute: Some(attribute.into()),
        }
    }

    /// Reference to every resource of a type, optionally projected.
    pub fn all_of(type_name: impl Into<String>, attribute: Option<String>) -> Self {
        Self::Resource {
            type_name: type_name.into(),
            name: None,
            attribute,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple { name } => write!(f, "$({name})"),
            Self::Resource { type_name, name, attribute } => {
                write!(f, "$({type_name}")?;
                if let Some(name) = name {
                    write!(f, " {name}")?;
                }
                if let Some(attribute) = attribute {
                    write!(f, " | {attribute}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Outcome of one resolution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The reference produced a value.
    Resolved(crate::value::Value),
    /// The target resource exists but the projected attribute has no value
    /// yet (typically provider-assigned). Resolves to null for now; the
    /// reference is kept on the owning resource and re-resolved at
    /// execution time.
    Late,
    /// The reference cannot be satisfied yet. Recoverable: the evaluator
    /// defers the declaration and retries on a later pass. The reason is
    /// kept for the deadlock report.
    Unresolved(String),
}

/// A reference that survived evaluation unresolved because its value is
/// only known after the target resource is realized by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LateRef {
    pub type_name: String,
    pub name: String,
    pub attribute: String,
}

impl fmt::Display for LateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "$({} {} | {})", self.type_name, self.name, self.attribute)
    }
}
