//! Declaration model, scope resolution, and fixed-point evaluation.
//!
//! This crate turns a body of [`node::Declaration`]s into a materialized
//! resource graph. Declarations may reference each other in any order;
//! [`eval::evaluate`] retries deferred declarations in passes until the
//! graph converges or deadlocks. Everything downstream (diffing, change
//! execution) consumes the resulting [`scope::Graph`].

pub mod error;
pub mod eval;
pub mod node;
pub mod reference;
pub mod scope;
pub mod value;

pub use error::{Error, Result, UnresolvedDeclaration};
pub use eval::evaluate;
pub use node::{Declaration, DeclarationKind, Expr, SourceLocation};
pub use reference::{LateRef, Reference, Resolution};
pub use scope::{Graph, Resource, ResourceId, ScopeId};
pub use value::Value;
