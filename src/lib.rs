//! Converge: declarative infrastructure reconciliation
//!
//! Declarations are evaluated into a resource graph (`declare`), the graph
//! is diffed against previously recorded state, and the resulting plan is
//! executed in dependency order with at-most-once side effects
//! (`reconcile`). This crate ties the two together behind an [`Engine`]
//! and provides state persistence.
//!
//! ```ignore
//! use converge::{Engine, FileBackend, TypeRegistry};
//!
//! let mut registry = TypeRegistry::new();
//! registry.register(std::sync::Arc::new(MyVpcType));
//!
//! let engine = Engine::new(registry, Box::new(FileBackend::new(".converge")));
//! let plan = engine.plan("network", &body, &Default::default())?;
//! for line in plan.summaries() {
//!     println!("{line}");
//! }
//! engine.apply("network", &plan, &Default::default(), &converge::LogReporter)?;
//! ```

pub mod engine;
pub mod state;

pub use engine::{specs_from_graph, Engine};
pub use state::{FileBackend, MemoryBackend, StateBackend};

// The language core and the reconciliation engine, re-exported whole for
// embedders that need more than the facade.
pub use declare;
pub use reconcile;

pub use declare::{Declaration, DeclarationKind, Expr, Graph, Reference, SourceLocation, Value};
pub use reconcile::{
    Change, ChangeId, ChangeKind, ExecuteOptions, ExecuteSummary, FieldDescriptor, LogReporter,
    NullReporter, Outcome, Plan, PlanOptions, Reporter, ResourceKey, ResourceSpec, ResourceType,
    TypeRegistry,
};
