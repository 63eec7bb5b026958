//! Error types for the reconcile crate

use thiserror::Error;

/// Errors that can occur while planning or executing changes
#[derive(Error, Debug)]
pub enum Error {
    /// Two items on the same side of a diff share an identity that is
    /// supposed to be unique. A configuration error, never retried.
    #[error("identity conflict: two {side} resources match '{display}'")]
    IdentityConflict { side: &'static str, display: String },

    /// A resource type or its field metadata is missing or inconsistent.
    /// A provider-definition defect, fatal at plan-build time.
    #[error("classification error for '{display}': {reason}")]
    Classification { display: String, reason: String },

    /// A provider refresh of a recorded asset failed during planning.
    #[error("failed to refresh '{display}': {reason}")]
    Refresh { display: String, reason: String },

    /// The planned changes form a dependency cycle and cannot be ordered.
    #[error("dependency cycle involving '{display}'")]
    Cycle { display: String },

    /// A provider call failed while executing a change. Aborts every
    /// change that transitively depends on this one.
    #[error("failed to apply '{display}': {reason}")]
    Execution { display: String, reason: String },

    /// A change result was requested before the plan was confirmed.
    /// A programming error, not a user-facing condition.
    #[error("plan not confirmed before accessing result of '{display}'")]
    Premature { display: String },
}

/// Result type for reconciliation operations
pub type Result<T> = std::result::Result<T, Error>;
