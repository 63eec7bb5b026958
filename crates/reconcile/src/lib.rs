//! Reconciliation engine: match, diff, classify, execute
//!
//! Given a recorded ("current") and a declared ("pending") collection of
//! resource specs, this crate pairs them by identity, classifies each pair
//! as Create/Update/Replace/Delete/Keep, and executes the resulting plan
//! in dependency order with memoized, at-most-once side effects.
//!
//! Providers plug in through the [`resource::ResourceType`] capability
//! trait; the engine never depends on concrete resource implementations.

pub mod change;
pub mod diff;
pub mod error;
pub mod execute;
pub mod identity;
pub mod report;
pub mod resource;

pub use change::{Change, ChangeId, ChangeKind, FieldDiff, Outcome, SubDiff};
pub use diff::{plan, Plan, PlanOptions};
pub use error::{Error, Result};
pub use execute::{execute, run_change, ExecuteOptions, ExecuteSummary};
pub use identity::{match_specs, IdentityKey, MatchOutcome};
pub use report::{LogReporter, NullReporter, Reporter};
pub use resource::{FieldDescriptor, ResourceKey, ResourceSpec, ResourceType, TypeRegistry};
