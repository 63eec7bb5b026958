//! Declaration nodes handed to the evaluator.
//!
//! A parser (external to this crate) turns configuration text into these
//! nodes; the engine never reparses text. Tests and embedders can also
//! build bodies programmatically with the constructors below.

use crate::reference::Reference;
use crate::value::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Where a declaration came from, for error reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self { file: file.into(), line, column }
    }

    /// Placeholder for programmatically built bodies.
    pub fn synthetic() -> Self {
        Self::new("<builtin>", 0, 0)
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// An unevaluated expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Reference(Reference),
    List(Vec<Expr>),
    Map(BTreeMap<String, Expr>),
}

impl Expr {
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    pub fn reference(reference: Reference) -> Self {
        Self::Reference(reference)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => write!(f, "{value}"),
            Self::Reference(reference) => write!(f, "{reference}"),
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
        }
    }
}

/// Kind tag for one declaration.
#[derive(Debug, Clone, PartialEq)]
pub enum DeclarationKind {
    /// `key: value`. At file level this binds a scope value; inside a
    /// resource body it also becomes a field of the resource.
    Pair { name: String, value: Expr },
    /// `type "name" { body }`. The name may be a computed expression.
    Resource {
        type_name: String,
        name: Expr,
        body: Vec<Declaration>,
    },
    /// Nested repeated block inside a resource body; each occurrence
    /// contributes one composite entry to the named field.
    Block { field: String, body: Vec<Declaration> },
}

/// One declaration in a configuration body.
#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub kind: DeclarationKind,
    pub location: SourceLocation,
}

impl Declaration {
    pub fn pair(name: impl Into<String>, value: Expr, location: SourceLocation) -> Self {
        Self {
            kind: DeclarationKind::Pair { name: name.into(), value },
            location,
        }
    }

    pub fn resource(
        type_name: impl Into<String>,
        name: Expr,
        body: Vec<Declaration>,
        location: SourceLocation,
    ) -> Self {
        Self {
            kind: DeclarationKind::Resource {
                type_name: type_name.into(),
                name,
                body,
            },
            location,
        }
    }

    pub fn block(field: impl Into<String>, body: Vec<Declaration>, location: SourceLocation) -> Self {
        Self {
            kind: DeclarationKind::Block { field: field.into(), body },
            location,
        }
    }

    /// One-line rendition of the declaration used in error reports.
    pub fn describe(&self) -> String {
        match &self.kind {
            DeclarationKind::Pair { name, value } => format!("{name}: {value}"),
            DeclarationKind::Resource { type_name, name, .. } => {
                format!("{type_name} {name} {{ ... }}")
            }
            DeclarationKind::Block { field, .. } => format!("{field} {{ ... }}"),
        }
    }
}
