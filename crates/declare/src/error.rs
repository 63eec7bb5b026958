//! Error types for the declare crate

use crate::node::SourceLocation;
use std::fmt;
use thiserror::Error;

/// A declaration that could not be resolved when evaluation deadlocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedDeclaration {
    pub location: SourceLocation,
    pub summary: String,
    pub reason: String,
}

impl fmt::Display for UnresolvedDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}: {}", self.summary, self.location, self.reason)
    }
}

/// Errors that can occur while evaluating declarations
#[derive(Error, Debug)]
pub enum Error {
    /// Two declarations registered the same resource identity.
    #[error("duplicate resource '{type_name} {name}' at {location}")]
    DuplicateResource {
        type_name: String,
        name: String,
        location: SourceLocation,
    },

    /// No evaluation pass made progress; every remaining declaration is
    /// listed with its source location.
    #[error("unable to resolve {} declaration(s):\n{}", .declarations.len(), format_unresolved(.declarations))]
    Unresolved {
        declarations: Vec<UnresolvedDeclaration>,
    },

    /// A resource name expression evaluated to something unusable.
    #[error("invalid resource name at {location}: {reason}")]
    InvalidName {
        location: SourceLocation,
        reason: String,
    },

    /// A declaration appeared somewhere its kind is not allowed, for
    /// example a resource block nested inside another resource body.
    #[error("misplaced declaration at {location}: {reason}")]
    Misplaced {
        location: SourceLocation,
        reason: String,
    },
}

fn format_unresolved(declarations: &[UnresolvedDeclaration]) -> String {
    declarations
        .iter()
        .map(|d| format!("  {d}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Result type for evaluation operations
pub type Result<T> = std::result::Result<T, Error>;
