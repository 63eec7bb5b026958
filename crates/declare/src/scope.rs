//! Scope chain, resource registries, and reference resolution.
//!
//! All evaluation state for one reconciliation lives in a [`Graph`]: an
//! arena of scope frames chained by parent links, an arena of resources,
//! and the root-owned registries that map resource identity to arena ids.
//! Resources and scopes refer to each other by index, never by pointer, so
//! the bidirectional dependency sets cannot form ownership cycles.

use crate::error::{Error, Result};
use crate::node::SourceLocation;
use crate::reference::{LateRef, Resolution};
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Index of a scope frame inside a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(usize);

/// Index of a resource inside a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(usize);

/// One declared infrastructure object, materialized by evaluation.
#[derive(Debug, Clone, Default)]
pub struct Resource {
    pub type_name: String,
    pub name: String,
    /// Resolved field values.
    pub fields: BTreeMap<String, Value>,
    /// Field positions whose referenced attribute is only known after the
    /// target resource is realized by a provider; re-resolved at execution
    /// time. Keyed by field name, extended with a dotted path (list index
    /// or map key per level) for positions inside compound values.
    pub late_refs: BTreeMap<String, LateRef>,
    /// Resources this one refers to.
    pub dependencies: BTreeSet<ResourceId>,
    /// Resources that refer to this one. Kept mutually consistent with
    /// `dependencies` by [`Graph::add_dependency`].
    pub dependents: BTreeSet<ResourceId>,
}

impl Resource {
    pub fn new(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            name: name.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct Frame {
    parent: Option<ScopeId>,
    values: BTreeMap<String, Value>,
}

/// Evaluation state for one resource graph.
///
/// The root frame (index 0) plays the role of the root scope: it owns the
/// `current` and `pending` registries and the global settings map. Child
/// frames are created per resource body and per nested block and are
/// abandoned when their declaration finishes; values promoted into the
/// registries outlive them.
#[derive(Debug, Default)]
pub struct Graph {
    frames: Vec<Frame>,
    resources: Vec<Resource>,
    current: HashMap<(String, String), ResourceId>,
    pending: HashMap<(String, String), ResourceId>,
    settings: BTreeMap<String, Value>,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            frames: vec![Frame::default()],
            ..Self::default()
        }
    }

    /// The root scope frame.
    pub fn root(&self) -> ScopeId {
        ScopeId(0)
    }

    /// Create a child frame chained to `parent`.
    pub fn push_scope(&mut self, parent: ScopeId) -> ScopeId {
        self.frames.push(Frame {
            parent: Some(parent),
            values: BTreeMap::new(),
        });
        ScopeId(self.frames.len() - 1)
    }

    /// Bind a value in exactly one frame.
    pub fn set(&mut self, scope: ScopeId, name: impl Into<String>, value: Value) {
        self.frames[scope.0].values.insert(name.into(), value);
    }

    /// Look a name up in one frame only.
    pub fn get_local(&self, scope: ScopeId, name: &str) -> Option<&Value> {
        self.frames[scope.0].values.get(name)
    }

    /// Look a name up through the scope chain, innermost first.
    pub fn lookup(&self, scope: ScopeId, name: &str) -> Option<&Value> {
        let mut frame = Some(scope);
        while let Some(id) = frame {
            if let Some(value) = self.frames[id.0].values.get(name) {
                return Some(value);
            }
            frame = self.frames[id.0].parent;
        }
        None
    }

    pub fn set_setting(&mut self, name: impl Into<String>, value: Value) {
        self.settings.insert(name.into(), value);
    }

    pub fn setting(&self, name: &str) -> Option<&Value> {
        self.settings.get(name)
    }

    // -- Resource registries

    pub fn resource(&self, id: ResourceId) -> &Resource {
        &self.resources[id.0]
    }

    pub fn resource_mut(&mut self, id: ResourceId) -> &mut Resource {
        &mut self.resources[id.0]
    }

    /// Register a resource materialized from the previously recorded state.
    pub fn insert_current(&mut self, resource: Resource) -> Result<ResourceId> {
        let key = (resource.type_name.clone(), resource.name.clone());
        if self.current.contains_key(&key) {
            return Err(Error::DuplicateResource {
                type_name: key.0,
                name: key.1,
                location: SourceLocation::synthetic(),
            });
        }
        let id = ResourceId(self.resources.len());
        self.resources.push(resource);
        self.current.insert(key, id);
        Ok(id)
    }

    /// Register a freshly declared resource. Fails on identity conflict.
    pub fn register_pending(&mut self, resource: Resource, location: &SourceLocation) -> Result<ResourceId> {
        let key = (resource.type_name.clone(), resource.name.clone());
        if self.pending.contains_key(&key) {
            return Err(Error::DuplicateResource {
                type_name: key.0,
                name: key.1,
                location: location.clone(),
            });
        }
        log::debug!("registering {} {}", key.0, key.1);
        let id = ResourceId(self.resources.len());
        self.resources.push(resource);
        self.pending.insert(key, id);
        Ok(id)
    }

    /// Exact identity lookup, pending registry first.
    pub fn find_resource(&self, type_name: &str, name: &str) -> Option<ResourceId> {
        let key = (type_name.to_string(), name.to_string());
        self.pending.get(&key).or_else(|| self.current.get(&key)).copied()
    }

    /// All registered resources of a type; a pending resource shadows a
    /// current one with the same identity.
    pub fn resources_of_type(&self, type_name: &str) -> Vec<ResourceId> {
        let mut ids: BTreeMap<&str, ResourceId> = BTreeMap::new();
        for ((ty, name), &id) in &self.current {
            if ty == type_name {
                ids.insert(name.as_str(), id);
            }
        }
        for ((ty, name), &id) in &self.pending {
            if ty == type_name {
                ids.insert(name.as_str(), id);
            }
        }
        ids.into_values().collect()
    }

    pub fn pending_ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = self.pending.values().copied().collect();
        ids.sort();
        ids
    }

    pub fn current_ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = self.current.values().copied().collect();
        ids.sort();
        ids
    }

    /// Record that `referrer` depends on `target`, updating both sides.
    /// Self-edges are ignored.
    pub fn add_dependency(&mut self, referrer: ResourceId, target: ResourceId) {
        if referrer == target {
            return;
        }
        self.resources[referrer.0].dependencies.insert(target);
        self.resources[target.0].dependents.insert(referrer);
    }

    // -- Reference resolution

    /// Resolve a bare name through the scope chain.
    pub fn resolve_simple(&self, scope: ScopeId, name: &str) -> Resolution {
        match self.lookup(scope, name) {
            Some(value) => Resolution::Resolved(value.clone()),
            None => Resolution::Unresolved(format!("no binding named '{name}' in scope")),
        }
    }

    /// Resolve a resource reference against the root registries.
    ///
    /// Returns the resolution together with the matched resource ids; the
    /// evaluator turns those into dependency edges once the referring
    /// declaration succeeds as a whole.
    pub fn resolve_resource(
        &self,
        type_name: &str,
        name: Option<&str>,
        attribute: Option<&str>,
    ) -> (Resolution, Vec<ResourceId>) {
        match name {
            Some(name) => {
                let Some(id) = self.find_resource(type_name, name) else {
                    log::trace!("reference $({type_name} {name}) unresolved");
                    return (
                        Resolution::Unresolved(format!(
                            "no resource '{type_name} {name}' registered yet"
                        )),
                        Vec::new(),
                    );
                };

                let resource = self.resource(id);
                let resolution = match attribute {
                    None => Resolution::Resolved(Value::Resource {
                        type_name: resource.type_name.clone(),
                        name: resource.name.clone(),
                    }),
                    Some(attribute) => match resource.fields.get(attribute) {
                        Some(value) if !value.is_null() => Resolution::Resolved(value.clone()),
                        // The target exists but the attribute is not known
                        // until the provider realizes it.
                        _ => Resolution::Late,
                    },
                };
                (resolution, vec![id])
            }
            None => {
                // Type-only references always yield a list, even when it
                // is empty or has exactly one element.
                let ids = self.resources_of_type(type_name);
                let values = ids
                    .iter()
                    .map(|&id| {
                        let resource = self.resource(id);
                        match attribute {
                            None => Value::Resource {
                                type_name: resource.type_name.clone(),
                                name: resource.name.clone(),
                            },
                            Some(attribute) => {
                                resource.fields.get(attribute).cloned().unwrap_or(Value::Null)
                            }
                        }
                    })
                    .collect();
                (Resolution::Resolved(Value::List(values)), ids)
            }
        }
    }

    // -- Scope composition (cross-file imports)

    /// Graft another graph into this one in full: root bindings, resources,
    /// and registries all become visible here.
    pub fn import_all(&mut self, other: &Graph) -> Result<()> {
        let bindings: Vec<(String, Value)> = other.frames[0]
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (name, value) in bindings {
            self.set(self.root(), name, value);
        }

        // Clone the resource arena with remapped ids so edges stay valid.
        let offset = self.resources.len();
        let remap = |id: ResourceId| ResourceId(id.0 + offset);

        for resource in &other.resources {
            let mut copied = resource.clone();
            copied.dependencies = copied.dependencies.iter().map(|&d| remap(d)).collect();
            copied.dependents = copied.dependents.iter().map(|&d| remap(d)).collect();
            self.resources.push(copied);
        }
        for (key, &id) in &other.current {
            if self.current.contains_key(key) {
                return Err(Error::DuplicateResource {
                    type_name: key.0.clone(),
                    name: key.1.clone(),
                    location: SourceLocation::synthetic(),
                });
            }
            self.current.insert(key.clone(), remap(id));
        }
        for (key, &id) in &other.pending {
            if self.pending.contains_key(key) {
                return Err(Error::DuplicateResource {
                    type_name: key.0.clone(),
                    name: key.1.clone(),
                    location: SourceLocation::synthetic(),
                });
            }
            self.pending.insert(key.clone(), remap(id));
        }
        Ok(())
    }

    /// Bind another graph's root bindings as a single map under a local
    /// name, so references can reach them as `$(name)` projections.
    pub fn import_named(&mut self, name: impl Into<String>, other: &Graph) {
        let entries: BTreeMap<String, Value> = other.frames[0]
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.set(self.root(), name, Value::Map(entries));
    }

    /// Merge another graph's non-private root bindings into this root.
    /// Names starting with `_` are private and skipped.
    pub fn import_flatten(&mut self, other: &Graph) {
        let bindings: Vec<(String, Value)> = other.frames[0]
            .values
            .iter()
            .filter(|(name, _)| !name.starts_with('_'))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (name, value) in bindings {
            self.set(self.root(), name, value);
        }
    }
}
