//! Planned changes and their memoized execution state
//!
//! A Change pairs a current asset with a pending config and carries the
//! field-level differences that justify it. Its side effect runs at most
//! once: the memo's `Pending -> Running -> Completed/Failed` transition is
//! mutex-guarded, and callers racing on the same change block until the
//! winner reaches a terminal state.

use crate::resource::{ResourceKey, ResourceSpec};
use declare::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Condvar, Mutex, PoisonError};

/// Index of a change inside a [`crate::diff::Plan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChangeId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Update,
    /// A non-updatable field differs; cannot be applied in place and is
    /// never executed automatically.
    Replace,
    Delete,
    Keep,
}

impl ChangeKind {
    pub fn sigil(self) -> char {
        match self {
            Self::Create => '+',
            Self::Update => '*',
            Self::Replace => '!',
            Self::Delete => '-',
            Self::Keep => '=',
        }
    }
}

/// One field-level difference between current and pending.
#[derive(Debug, Clone)]
pub struct FieldDiff {
    pub field: String,
    /// Human-readable rendition, structural for maps and lists.
    pub summary: String,
    pub updatable: bool,
}

/// Result of executing one change, cached in the memo.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The provider created the asset; the spec carries any fields it
    /// assigned (ids, addresses).
    Created(ResourceSpec),
    Updated(ResourceSpec),
    Deleted(ResourceSpec),
    Kept,
    Skipped { reason: String },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Updated(_) => "updated",
            Self::Deleted(_) => "deleted",
            Self::Kept => "kept",
            Self::Skipped { .. } => "skipped",
        }
    }

    /// The realized spec, for outcomes that produce one.
    pub fn spec(&self) -> Option<&ResourceSpec> {
        match self {
            Self::Created(spec) | Self::Updated(spec) => Some(spec),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum MemoState {
    Pending,
    Running,
    Completed(Outcome),
    Failed(String),
}

/// What a caller gets back from claiming a memo.
pub(crate) enum MemoClaim {
    /// This caller won the transition to Running and must execute.
    Execute,
    Done(Outcome),
    Failed(String),
}

#[derive(Debug)]
pub(crate) struct Memo {
    state: Mutex<MemoState>,
    done: Condvar,
}

impl Memo {
    fn new() -> Self {
        Self {
            state: Mutex::new(MemoState::Pending),
            done: Condvar::new(),
        }
    }

    /// Claim the right to execute, or wait for whoever holds it.
    ///
    /// Lock poisoning is ignored: waiters must still observe the terminal
    /// state after another thread panicked while holding the lock.
    pub(crate) fn begin(&self) -> MemoClaim {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match &*state {
                MemoState::Pending => {
                    *state = MemoState::Running;
                    return MemoClaim::Execute;
                }
                MemoState::Running => {
                    state = self.done.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
                MemoState::Completed(outcome) => return MemoClaim::Done(outcome.clone()),
                MemoState::Failed(reason) => return MemoClaim::Failed(reason.clone()),
            }
        }
    }

    pub(crate) fn complete(&self, outcome: Outcome) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = MemoState::Completed(outcome);
        self.done.notify_all();
    }

    pub(crate) fn fail(&self, reason: String) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = MemoState::Failed(reason);
        self.done.notify_all();
    }

    pub(crate) fn snapshot(&self) -> MemoState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// A recursive comparison of one composite field's elements, attached as a
/// child of the owning change.
#[derive(Debug)]
pub struct SubDiff {
    pub field: String,
    pub changes: Vec<Change>,
}

impl SubDiff {
    pub fn has_changes(&self) -> bool {
        self.changes.iter().any(Change::has_changes)
    }
}

/// One unit of planned work.
#[derive(Debug)]
pub struct Change {
    pub kind: ChangeKind,
    /// Absent for Create.
    pub current: Option<ResourceSpec>,
    /// Absent for Delete.
    pub pending: Option<ResourceSpec>,
    pub field_diffs: Vec<FieldDiff>,
    /// Field names passed to the provider's update call.
    pub changed_fields: Vec<String>,
    pub sub_diffs: Vec<SubDiff>,
    /// Changes that must reach Completed before this one may run.
    pub dependencies: Vec<ChangeId>,
    display: String,
    pub(crate) memo: Memo,
}

impl Change {
    pub fn new(
        kind: ChangeKind,
        current: Option<ResourceSpec>,
        pending: Option<ResourceSpec>,
        display: String,
    ) -> Self {
        Self {
            kind,
            current,
            pending,
            field_diffs: Vec::new(),
            changed_fields: Vec::new(),
            sub_diffs: Vec::new(),
            dependencies: Vec::new(),
            display,
            memo: Memo::new(),
        }
    }

    pub fn display(&self) -> &str {
        &self.display
    }

    /// Identity of the resource this change acts on.
    pub fn key(&self) -> Option<ResourceKey> {
        self.pending
            .as_ref()
            .or(self.current.as_ref())
            .map(ResourceSpec::key)
    }

    /// True unless this change (and every nested sub-diff) is a pure Keep.
    pub fn has_changes(&self) -> bool {
        self.kind != ChangeKind::Keep || self.sub_diffs.iter().any(SubDiff::has_changes)
    }

    /// One-line summary: sigil, display string, and field differences.
    pub fn summary(&self) -> String {
        let mut line = format!("{} {}", self.kind.sigil(), self.display);
        if !self.field_diffs.is_empty() {
            let details: Vec<&str> = self.field_diffs.iter().map(|d| d.summary.as_str()).collect();
            line.push_str(&format!(" ({})", details.join(", ")));
        }
        line
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Render one field difference. Scalar values print `field: old -> new`;
/// lists and maps print element-wise additions, removals, and changes
/// instead of dumping both values whole.
pub(crate) fn summarize_field(field: &str, current: Option<&Value>, pending: Option<&Value>) -> String {
    let null = Value::Null;
    let current = current.unwrap_or(&null);
    let pending = pending.unwrap_or(&null);

    match (current, pending) {
        (Value::List(old), Value::List(new)) => {
            let mut parts = Vec::new();
            let added: Vec<String> = new
                .iter()
                .filter(|v| !old.contains(v))
                .map(ToString::to_string)
                .collect();
            let removed: Vec<String> = old
                .iter()
                .filter(|v| !new.contains(v))
                .map(ToString::to_string)
                .collect();
            if !added.is_empty() {
                parts.push(format!("+[{}]", added.join(", ")));
            }
            if !removed.is_empty() {
                parts.push(format!("-[{}]", removed.join(", ")));
            }
            format!("{field}: {}", parts.join(", "))
        }
        (Value::Map(old), Value::Map(new)) => {
            format!("{field}: {}", summarize_map(old, new))
        }
        _ => format!("{field}: {current} -> {pending}"),
    }
}

fn summarize_map(old: &BTreeMap<String, Value>, new: &BTreeMap<String, Value>) -> String {
    let mut added = Vec::new();
    let mut changed = Vec::new();
    for (key, value) in new {
        match old.get(key) {
            None => added.push(format!("+[{key} => {value}]")),
            Some(previous) if previous != value => {
                changed.push(format!("*[{key}: {previous} => {value}]"));
            }
            Some(_) => {}
        }
    }
    let removed: Vec<String> = old
        .iter()
        .filter(|(key, _)| !new.contains_key(*key))
        .map(|(key, value)| format!("-[{key} => {value}]"))
        .collect();

    let mut parts = added;
    parts.extend(removed);
    parts.extend(changed);
    parts.join(", ")
}
