//! Plan/apply glue: evaluate declarations, diff against recorded state,
//! execute the plan, and persist the realized graph.

use crate::state::StateBackend;
use anyhow::Result;
use declare::{evaluate, Declaration, Graph};
use reconcile::{
    execute, ExecuteOptions, ExecuteSummary, Outcome, Plan, PlanOptions, Reporter, ResourceKey,
    ResourceSpec, TypeRegistry,
};

/// Engine facade wiring evaluation, diffing, and execution together.
pub struct Engine {
    registry: TypeRegistry,
    backend: Box<dyn StateBackend>,
}

impl Engine {
    pub fn new(registry: TypeRegistry, backend: Box<dyn StateBackend>) -> Self {
        Self { registry, backend }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Evaluate a declaration body and diff it against the recorded state
    /// of `root`.
    pub fn plan(&self, root: &str, body: &[Declaration], options: &PlanOptions) -> Result<Plan> {
        let mut graph = Graph::new();
        let scope = graph.root();
        evaluate(&mut graph, scope, body)?;

        let pending = specs_from_graph(&graph);
        let current = self.backend.load(root)?;
        log::debug!(
            "planning '{root}': {} recorded, {} declared",
            current.len(),
            pending.len()
        );
        Ok(reconcile::plan(&self.registry, current, pending, options)?)
    }

    /// Confirm and execute a plan, then persist the realized graph.
    ///
    /// Dry runs execute nothing and leave the recorded state untouched.
    pub fn apply(
        &self,
        root: &str,
        plan: &Plan,
        options: &ExecuteOptions,
        reporter: &dyn Reporter,
    ) -> Result<ExecuteSummary> {
        plan.confirm();
        let summary = execute(plan, &self.registry, options, reporter)?;
        if !options.dry_run {
            let resources = realized_state(plan);
            self.backend.save(root, &resources)?;
        }
        Ok(summary)
    }
}

/// Flatten an evaluated graph into planner specs.
///
/// Dependency edges become identity references and late references travel
/// with the spec that owns them, so the planner needs no access to the
/// graph itself.
pub fn specs_from_graph(graph: &Graph) -> Vec<ResourceSpec> {
    graph
        .pending_ids()
        .into_iter()
        .map(|id| {
            let resource = graph.resource(id);
            let mut spec = ResourceSpec::new(resource.type_name.as_str(), resource.name.as_str());
            spec.fields = resource.fields.clone();
            spec.late = resource.late_refs.clone();
            spec.depends_on = resource
                .dependencies
                .iter()
                .map(|&dep| {
                    let target = graph.resource(dep);
                    ResourceKey::new(target.type_name.as_str(), target.name.as_str())
                })
                .collect();
            spec
        })
        .collect()
}

/// The recorded state after execution: realized specs for creates and
/// updates, nothing for deletes, and the previous state for anything that
/// failed or was skipped.
fn realized_state(plan: &Plan) -> Vec<ResourceSpec> {
    let mut resources = Vec::new();
    for (id, change) in plan.changes() {
        let Ok(outcome) = plan.outcome(id) else {
            if let Some(current) = &change.current {
                resources.push(current.clone());
            }
            continue;
        };
        match outcome {
            Outcome::Created(spec) | Outcome::Updated(spec) => resources.push(spec),
            Outcome::Deleted(_) => {}
            // Keeps persist the recorded side: it carries provider-assigned
            // fields the declaration never mentions.
            Outcome::Kept => {
                if let Some(spec) = change.current.as_ref().or(change.pending.as_ref()) {
                    resources.push(spec.clone());
                }
            }
            Outcome::Skipped { .. } => {
                if let Some(current) = &change.current {
                    resources.push(current.clone());
                }
            }
        }
    }
    resources
}
