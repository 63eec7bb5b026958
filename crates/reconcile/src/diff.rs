//! Diff engine: compare recorded state against declared state
//!
//! One planning session pairs current and pending specs by identity,
//! classifies every pair field-by-field using the type's descriptor table,
//! and wires dependency edges between the resulting changes. The output is
//! a [`Plan`] the execution engine can run.

use crate::change::{summarize_field, Change, ChangeId, ChangeKind, FieldDiff, MemoState, Outcome, SubDiff};
use crate::error::{Error, Result};
use crate::identity::match_specs;
use crate::resource::{ResourceKey, ResourceSpec, ResourceType, TypeRegistry};
use declare::Value;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Re-read each recorded asset from its provider before diffing; an
    /// asset the provider no longer finds is dropped, so its pending
    /// counterpart becomes a Create.
    pub refresh: bool,
}

/// The full set of planned changes for one reconciliation.
///
/// Changes live in an arena addressed by [`ChangeId`]; dependency edges are
/// id lists, so the bidirectional resource graph cannot create ownership
/// cycles here. A plan must be confirmed before any change may execute.
#[derive(Debug)]
pub struct Plan {
    changes: Vec<Change>,
    /// Topological order, dependencies first. Also the display order.
    order: Vec<ChangeId>,
    by_key: HashMap<ResourceKey, ChangeId>,
    confirmed: AtomicBool,
}

impl Plan {
    pub fn change(&self, id: ChangeId) -> &Change {
        &self.changes[id.0]
    }

    /// All changes, dependencies first.
    pub fn changes(&self) -> impl Iterator<Item = (ChangeId, &Change)> {
        self.order.iter().map(|&id| (id, &self.changes[id.0]))
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// False when every change (including nested sub-diffs) is a Keep.
    pub fn has_changes(&self) -> bool {
        self.changes.iter().any(Change::has_changes)
    }

    /// The change acting on a given resource identity, if any.
    pub fn change_for(&self, key: &ResourceKey) -> Option<ChangeId> {
        self.by_key.get(key).copied()
    }

    /// Per-change summary lines in dependency order, Keeps omitted.
    pub fn summaries(&self) -> Vec<String> {
        self.changes()
            .filter(|(_, change)| change.has_changes())
            .map(|(_, change)| change.summary())
            .collect()
    }

    /// The memoized result of one change.
    ///
    /// Requesting a result before the plan is confirmed is a programming
    /// error and fails fast, distinct from a provider failure.
    pub fn outcome(&self, id: ChangeId) -> Result<Outcome> {
        let change = self.change(id);
        if !self.is_confirmed() {
            return Err(Error::Premature {
                display: change.display().to_string(),
            });
        }
        match change.memo.snapshot() {
            MemoState::Completed(outcome) => Ok(outcome),
            MemoState::Failed(reason) => Err(Error::Execution {
                display: change.display().to_string(),
                reason,
            }),
            MemoState::Pending | MemoState::Running => Err(Error::Execution {
                display: change.display().to_string(),
                reason: "change has not executed".to_string(),
            }),
        }
    }

    /// Authorize execution. Until this is called, requesting any change's
    /// result fails fast.
    pub fn confirm(&self) {
        self.confirmed.store(true, Ordering::SeqCst);
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed.load(Ordering::SeqCst)
    }
}

/// Compare recorded state against declared state and produce a plan.
pub fn plan(
    registry: &TypeRegistry,
    current: Vec<ResourceSpec>,
    pending: Vec<ResourceSpec>,
    options: &PlanOptions,
) -> Result<Plan> {
    let current = if options.refresh {
        refresh_current(registry, current)?
    } else {
        current
    };

    let mut changes = Vec::new();

    // Compare per type so identity semantics stay type-local.
    let mut type_names = BTreeSet::new();
    for spec in current.iter().chain(&pending) {
        type_names.insert(spec.type_name.clone());
    }

    for type_name in &type_names {
        let resource_type = registry.require(type_name, "")?;
        let current_of_type: Vec<ResourceSpec> =
            current.iter().filter(|s| &s.type_name == type_name).cloned().collect();
        let pending_of_type: Vec<ResourceSpec> =
            pending.iter().filter(|s| &s.type_name == type_name).cloned().collect();

        let outcome = match_specs(resource_type.as_ref(), current_of_type, pending_of_type)?;

        for (matched_current, matched_pending) in outcome.pairs {
            changes.push(classify_pair(registry, resource_type.as_ref(), matched_current, matched_pending)?);
        }

        for spec in outcome.unmatched_pending {
            // Re-check with the provider before creating: an equivalent
            // live asset retargets this into an update.
            match resource_type.lookup(&spec).map_err(|e| Error::Refresh {
                display: resource_type.display(&spec),
                reason: e.to_string(),
            })? {
                Some(found) => {
                    log::debug!(
                        "retargeting create of {} to update of existing asset",
                        resource_type.display(&spec)
                    );
                    changes.push(classify_pair(registry, resource_type.as_ref(), found, spec)?);
                }
                None => {
                    let display = resource_type.display(&spec);
                    let mut change = Change::new(ChangeKind::Create, None, Some(spec), display);
                    if let Some(pending_spec) = &change.pending {
                        change.changed_fields = pending_spec.fields.keys().cloned().collect();
                    }
                    changes.push(change);
                }
            }
        }

        for spec in outcome.unmatched_current {
            if !resource_type.is_deletable(&spec) {
                log::debug!("{} is not deletable, leaving in place", resource_type.display(&spec));
                continue;
            }
            let display = resource_type.display(&spec);
            changes.push(Change::new(ChangeKind::Delete, Some(spec), None, display));
        }
    }

    link_dependencies(&mut changes);
    let (order, by_key) = validate_order(&changes)?;

    Ok(Plan {
        changes,
        order,
        by_key,
        confirmed: AtomicBool::new(false),
    })
}

fn refresh_current(registry: &TypeRegistry, current: Vec<ResourceSpec>) -> Result<Vec<ResourceSpec>> {
    let mut refreshed = Vec::with_capacity(current.len());
    for mut spec in current {
        let resource_type = registry.require(&spec.type_name, &spec.name)?;
        let found = resource_type.refresh(&mut spec).map_err(|e| Error::Refresh {
            display: resource_type.display(&spec),
            reason: e.to_string(),
        })?;
        if found {
            refreshed.push(spec);
        } else {
            log::debug!("{} no longer exists, dropping from recorded state", resource_type.display(&spec));
        }
    }
    Ok(refreshed)
}

/// Classify a matched pair as Update, Replace, or Keep.
fn classify_pair(
    registry: &TypeRegistry,
    resource_type: &dyn ResourceType,
    current: ResourceSpec,
    mut pending: ResourceSpec,
) -> Result<Change> {
    let descriptors = resource_type.fields();

    // Back-fill: a non-nullable field the declaration left unset keeps its
    // current value. Late-reference nulls are left alone; execution fills
    // them from realized outcomes.
    for descriptor in descriptors {
        if descriptor.nullable || pending.has_late(descriptor.name) {
            continue;
        }
        let unset = pending.field(descriptor.name).is_none_or(Value::is_null);
        if unset {
            if let Some(value) = current.field(descriptor.name) {
                pending.fields.insert(descriptor.name.to_string(), value.clone());
            }
        }
    }

    let mut field_diffs = Vec::new();
    let mut changed_fields = Vec::new();
    let mut sub_diffs = Vec::new();
    let mut replace = false;

    for descriptor in descriptors {
        // A pending late reference, anywhere inside the field, compares as
        // equal for planning; its real value is unknown until the target
        // is realized.
        if pending.has_late(descriptor.name) {
            continue;
        }

        if let Some(nested_type_name) = descriptor.nested {
            let nested_type = registry.require(nested_type_name, descriptor.name)?;
            let sub = diff_elements(
                registry,
                nested_type.as_ref(),
                descriptor.name,
                current.field(descriptor.name),
                pending.field(descriptor.name),
            )?;
            if sub.has_changes() {
                changed_fields.push(descriptor.name.to_string());
                if !descriptor.updatable {
                    replace = true;
                }
            }
            sub_diffs.push(sub);
            continue;
        }

        let old = current.field(descriptor.name);
        let new = pending.field(descriptor.name);
        let differs = match (old, new) {
            (None, None) => false,
            (Some(a), Some(b)) => a != b,
            (Some(a), None) => !a.is_null(),
            (None, Some(b)) => !b.is_null(),
        };
        if differs {
            log::trace!("{}: field {} differs", resource_type.display(&pending), descriptor.name);
            field_diffs.push(FieldDiff {
                field: descriptor.name.to_string(),
                summary: summarize_field(descriptor.name, old, new),
                updatable: descriptor.updatable,
            });
            changed_fields.push(descriptor.name.to_string());
            if !descriptor.updatable {
                replace = true;
            }
        }
    }

    let kind = if replace {
        ChangeKind::Replace
    } else if changed_fields.is_empty() {
        ChangeKind::Keep
    } else {
        ChangeKind::Update
    };

    let display = resource_type.display(&pending);
    let mut change = Change::new(kind, Some(current), Some(pending), display);
    change.field_diffs = field_diffs;
    change.changed_fields = changed_fields;
    change.sub_diffs = sub_diffs;
    Ok(change)
}

/// Recursive sub-diff over one composite field's elements.
fn diff_elements(
    registry: &TypeRegistry,
    nested_type: &dyn ResourceType,
    field: &str,
    current: Option<&Value>,
    pending: Option<&Value>,
) -> Result<SubDiff> {
    let current_elements = element_specs(nested_type, field, current)?;
    let pending_elements = element_specs(nested_type, field, pending)?;

    let outcome = match_specs(nested_type, current_elements, pending_elements)?;
    let mut changes = Vec::new();
    for (matched_current, matched_pending) in outcome.pairs {
        changes.push(classify_pair(registry, nested_type, matched_current, matched_pending)?);
    }
    for spec in outcome.unmatched_pending {
        let display = nested_type.display(&spec);
        changes.push(Change::new(ChangeKind::Create, None, Some(spec), display));
    }
    for spec in outcome.unmatched_current {
        let display = nested_type.display(&spec);
        changes.push(Change::new(ChangeKind::Delete, Some(spec), None, display));
    }
    Ok(SubDiff {
        field: field.to_string(),
        changes,
    })
}

/// Turn a composite field value into nameless element specs of the nested
/// type. The nested type's identity() pairs them up.
fn element_specs(nested_type: &dyn ResourceType, field: &str, value: Option<&Value>) -> Result<Vec<ResourceSpec>> {
    let items = match value {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::List(items)) => items,
        Some(other) => {
            return Err(Error::Classification {
                display: format!("{} (field {field})", nested_type.type_name()),
                reason: format!("composite field holds '{other}', expected a list of blocks"),
            });
        }
    };

    let mut specs = Vec::with_capacity(items.len());
    for item in items {
        let Value::Map(entries) = item else {
            return Err(Error::Classification {
                display: format!("{} (field {field})", nested_type.type_name()),
                reason: format!("composite element '{item}' is not a block"),
            });
        };
        let mut spec = ResourceSpec::new(nested_type.type_name(), "");
        spec.fields = entries.clone();
        specs.push(spec);
    }
    Ok(specs)
}

/// Wire dependency edges between changes.
///
/// Create/Update changes depend on the changes of the resources they refer
/// to. Delete edges run the other way: a deleted resource's change depends
/// on the changes of everything that referred to it, so consumers are torn
/// down before the resource they depend on.
fn link_dependencies(changes: &mut [Change]) {
    let mut by_key: HashMap<ResourceKey, ChangeId> = HashMap::new();
    for (i, change) in changes.iter().enumerate() {
        if let Some(key) = change.key() {
            by_key.entry(key).or_insert(ChangeId(i));
        }
    }

    let mut edges: Vec<(usize, ChangeId)> = Vec::new();
    for (i, change) in changes.iter().enumerate() {
        match change.kind {
            ChangeKind::Delete => {
                let Some(current) = &change.current else { continue };
                let key = current.key();
                for (j, other) in changes.iter().enumerate() {
                    if i == j {
                        continue;
                    }
                    let refers = other
                        .current
                        .as_ref()
                        .is_some_and(|spec| spec.depends_on.contains(&key));
                    if refers {
                        edges.push((i, ChangeId(j)));
                    }
                }
            }
            _ => {
                let Some(pending) = &change.pending else { continue };
                for dep_key in &pending.depends_on {
                    if let Some(&dep_id) = by_key.get(dep_key) {
                        if dep_id.0 != i {
                            edges.push((i, dep_id));
                        }
                    }
                }
            }
        }
    }

    for (i, dep) in edges {
        changes[i].dependencies.push(dep);
    }
}

/// Validate acyclicity and compute a dependencies-first order.
fn validate_order(changes: &[Change]) -> Result<(Vec<ChangeId>, HashMap<ResourceKey, ChangeId>)> {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..changes.len()).map(|i| graph.add_node(i)).collect();
    for (i, change) in changes.iter().enumerate() {
        for dep in &change.dependencies {
            graph.add_edge(nodes[dep.0], nodes[i], ());
        }
    }

    let order = match toposort(&graph, None) {
        Ok(sorted) => sorted.into_iter().map(|node| ChangeId(graph[node])).collect(),
        Err(cycle) => {
            let culprit = graph[cycle.node_id()];
            return Err(Error::Cycle {
                display: changes[culprit].display().to_string(),
            });
        }
    };

    let mut by_key = HashMap::new();
    for (i, change) in changes.iter().enumerate() {
        if let Some(key) = change.key() {
            by_key.entry(key).or_insert(ChangeId(i));
        }
    }
    Ok((order, by_key))
}
