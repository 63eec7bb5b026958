//! ResourceType trait and the specs it operates on
//!
//! A ResourceType is the capability interface a provider implements for one
//! kind of infrastructure object: lifecycle calls plus a statically declared
//! field-descriptor table that drives diff classification. The engine
//! depends only on this trait, never on concrete provider types.

use crate::identity::IdentityKey;
use anyhow::Result;
use declare::{LateRef, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Identity of one declared resource: type tag plus declared name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub type_name: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.type_name, self.name)
    }
}

/// One materialized resource as the planner sees it: resolved fields plus
/// the references that stay unresolved until a provider realizes their
/// target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub type_name: String,
    pub name: String,
    pub fields: BTreeMap<String, Value>,
    /// Field positions whose value is only known after the referenced
    /// resource is realized; rebound from completed outcomes at execution
    /// time. Keyed by field name, extended with a dotted path for positions
    /// inside compound values (`ingress.0.source-vpc`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub late: BTreeMap<String, LateRef>,
    /// Identities of the resources this one refers to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<ResourceKey>,
}

impl ResourceSpec {
    pub fn new(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            name: name.into(),
            fields: BTreeMap::new(),
            late: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }

    /// Builder-style field assignment, mainly for tests and providers.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.type_name.clone(), self.name.clone())
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    /// True when the field itself, or any position nested inside it, awaits
    /// a late reference.
    pub fn has_late(&self, field: &str) -> bool {
        self.late.keys().any(|path| {
            path == field
                || path
                    .strip_prefix(field)
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }
}

/// Per-field metadata driving classification.
#[derive(Debug, Clone, Copy)]
pub struct FieldDescriptor {
    pub name: &'static str,
    /// A differing updatable field makes the change an Update; a differing
    /// non-updatable field forces a Replace.
    pub updatable: bool,
    /// Nullable fields left unset stay unset; non-nullable unset fields
    /// are back-filled from the current side before classification.
    pub nullable: bool,
    /// For composite fields: the registered type of the nested elements.
    /// Such fields are compared by a recursive sub-diff, not by equality.
    pub nested: Option<&'static str>,
}

impl FieldDescriptor {
    pub const fn updatable(name: &'static str) -> Self {
        Self { name, updatable: true, nullable: false, nested: None }
    }

    pub const fn immutable(name: &'static str) -> Self {
        Self { name, updatable: false, nullable: false, nested: None }
    }

    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub const fn nested(mut self, type_name: &'static str) -> Self {
        self.nested = Some(type_name);
        self
    }
}

/// Capability interface implemented once per resource type.
///
/// Lifecycle methods receive the spec they act on and mutate it in place so
/// provider-assigned fields (ids, addresses) become visible to late
/// references and to state persistence.
pub trait ResourceType: Send + Sync {
    /// Type tag matching the declaration's type name.
    fn type_name(&self) -> &'static str;

    /// Statically declared field table. Order is the display order of
    /// field-change summaries.
    fn fields(&self) -> &'static [FieldDescriptor];

    /// Identity components used to pair current and pending specs.
    ///
    /// The default identity is the declared name. Types whose elements
    /// carry no name (nested blocks) or that gain a provider-assigned id
    /// override this to compare on field values instead.
    fn identity(&self, spec: &ResourceSpec) -> IdentityKey {
        IdentityKey::new(vec![Some(spec.name.clone())])
    }

    /// Re-read the live asset behind `spec`, updating its fields. Returns
    /// `false` when the asset no longer exists.
    fn refresh(&self, spec: &mut ResourceSpec) -> Result<bool>;

    fn create(&self, spec: &mut ResourceSpec) -> Result<()>;

    /// Apply the named changed fields in place.
    fn update(&self, current: &ResourceSpec, pending: &mut ResourceSpec, changed: &[String]) -> Result<()>;

    fn delete(&self, spec: &ResourceSpec) -> Result<()>;

    /// Externally managed assets report `false` and are never deleted.
    fn is_deletable(&self, _spec: &ResourceSpec) -> bool {
        true
    }

    /// Provider-side search for an existing asset equivalent to a pending
    /// spec that matched nothing in recorded state. A hit retargets the
    /// would-be Create into an Update, avoiding a duplicate create.
    fn lookup(&self, _pending: &ResourceSpec) -> Result<Option<ResourceSpec>> {
        Ok(None)
    }

    fn display(&self, spec: &ResourceSpec) -> String {
        if spec.name.is_empty() {
            // Nested block elements have no declared name.
            self.type_name().to_string()
        } else {
            format!("{} {}", self.type_name(), spec.name)
        }
    }
}

/// Explicit registry of resource types, built at startup and passed through
/// planning and execution as a parameter. No ambient global state.
#[derive(Default, Clone)]
pub struct TypeRegistry {
    types: HashMap<&'static str, Arc<dyn ResourceType>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, resource_type: Arc<dyn ResourceType>) {
        self.types.insert(resource_type.type_name(), resource_type);
    }

    pub fn get(&self, type_name: &str) -> Option<&Arc<dyn ResourceType>> {
        self.types.get(type_name)
    }

    /// Lookup that treats an unregistered type as a provider-definition
    /// defect.
    pub fn require(&self, type_name: &str, name: &str) -> crate::error::Result<&Arc<dyn ResourceType>> {
        self.get(type_name).ok_or_else(|| crate::error::Error::Classification {
            display: format!("{type_name} {name}"),
            reason: format!("no resource type '{type_name}' registered"),
        })
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.types.keys().collect();
        names.sort();
        f.debug_struct("TypeRegistry").field("types", &names).finish()
    }
}
