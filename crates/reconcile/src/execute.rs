//! Execution engine: run a confirmed plan's side effects
//!
//! Each change runs at most once, after all of its dependencies have
//! completed. Independent changes run concurrently on a rayon pool; the
//! memo on each change serializes racing callers so exactly one performs
//! the provider call and everyone observes the same result.

use crate::change::{Change, ChangeId, ChangeKind, MemoClaim, MemoState, Outcome};
use crate::diff::Plan;
use crate::error::{Error, Result};
use crate::report::Reporter;
use crate::resource::{ResourceKey, ResourceSpec, TypeRegistry};
use anyhow::Context;
use declare::Value;
use rayon::prelude::*;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Maximum number of changes applied concurrently.
    pub jobs: usize,
    /// Plan everything, execute nothing.
    pub dry_run: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            jobs: 4,
            dry_run: false,
        }
    }
}

/// Tally of execution results.
#[derive(Debug, Clone, Default)]
pub struct ExecuteSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub kept: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Display string and reason for every failed change.
    pub failures: Vec<String>,
}

impl ExecuteSummary {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Created(_) => self.created += 1,
            Outcome::Updated(_) => self.updated += 1,
            Outcome::Deleted(_) => self.deleted += 1,
            Outcome::Kept => self.kept += 1,
            Outcome::Skipped { .. } => self.skipped += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.created + self.updated + self.deleted + self.kept + self.skipped + self.failed
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

/// Execute every change in the plan, dependencies first.
///
/// A provider failure marks the change Failed and aborts everything that
/// transitively depends on it; independent changes still run. The summary
/// carries the failures, so a partial apply is visible to the caller
/// without losing the work that did succeed.
pub fn execute(
    plan: &Plan,
    registry: &TypeRegistry,
    options: &ExecuteOptions,
    reporter: &dyn Reporter,
) -> Result<ExecuteSummary> {
    if !plan.is_confirmed() {
        return Err(Error::Premature {
            display: "plan".to_string(),
        });
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.jobs.max(1))
        .build()
        .map_err(|e| Error::Execution {
            display: "executor".to_string(),
            reason: e.to_string(),
        })?;

    let ids: Vec<ChangeId> = plan.changes().map(|(id, _)| id).collect();
    pool.install(|| {
        ids.par_iter().for_each(|&id| {
            // Failures are recorded in the memo; collected below.
            let _ = run_change(plan, registry, id, options, reporter);
        });
    });

    let mut summary = ExecuteSummary::default();
    for (_, change) in plan.changes() {
        match change.memo.snapshot() {
            MemoState::Completed(outcome) => summary.record(&outcome),
            MemoState::Failed(reason) => {
                summary.failed += 1;
                summary.failures.push(format!("{}: {reason}", change.display()));
            }
            MemoState::Pending | MemoState::Running => {
                // Every id was driven above; a non-terminal state here is a
                // bug in the state machine.
                summary.failed += 1;
                summary.failures.push(format!("{}: never reached a terminal state", change.display()));
            }
        }
    }
    Ok(summary)
}

/// Execute one change (and, recursively, its dependencies), returning the
/// memoized outcome.
pub fn run_change(
    plan: &Plan,
    registry: &TypeRegistry,
    id: ChangeId,
    options: &ExecuteOptions,
    reporter: &dyn Reporter,
) -> Result<Outcome> {
    let change = plan.change(id);
    if !plan.is_confirmed() {
        return Err(Error::Premature {
            display: change.display().to_string(),
        });
    }

    match change.memo.begin() {
        MemoClaim::Done(outcome) => Ok(outcome),
        MemoClaim::Failed(reason) => Err(Error::Execution {
            display: change.display().to_string(),
            reason,
        }),
        MemoClaim::Execute => {
            for &dep in &change.dependencies {
                if let Err(e) = run_change(plan, registry, dep, options, reporter) {
                    let reason = format!("dependency failed: {e}");
                    change.memo.fail(reason.clone());
                    reporter.on_change_failed(change.display(), &reason);
                    return Err(Error::Execution {
                        display: change.display().to_string(),
                        reason,
                    });
                }
            }

            reporter.on_change_start(change.display());
            match perform(plan, registry, change, options) {
                Ok(outcome) => {
                    log::info!("{} {}", outcome.label(), change.display());
                    reporter.on_change_complete(change.display(), &outcome);
                    change.memo.complete(outcome.clone());
                    Ok(outcome)
                }
                Err(e) => {
                    let reason = e.to_string();
                    change.memo.fail(reason.clone());
                    reporter.on_change_failed(change.display(), &reason);
                    Err(Error::Execution {
                        display: change.display().to_string(),
                        reason,
                    })
                }
            }
        }
    }
}

/// The type-specific side effect. Runs exactly once per change.
fn perform(
    plan: &Plan,
    registry: &TypeRegistry,
    change: &Change,
    options: &ExecuteOptions,
) -> anyhow::Result<Outcome> {
    match change.kind {
        ChangeKind::Keep => Ok(Outcome::Kept),
        // Replacement is destructive and is never applied automatically;
        // the operator resolves it as an explicit create-then-delete.
        ChangeKind::Replace => Ok(Outcome::Skipped {
            reason: "requires replacement, not applied automatically".to_string(),
        }),
        _ if options.dry_run => Ok(Outcome::Skipped {
            reason: "dry run".to_string(),
        }),
        ChangeKind::Create => {
            let Some(pending) = &change.pending else {
                anyhow::bail!("create change has no pending spec");
            };
            let resource_type = registry.require(&pending.type_name, &pending.name)?;
            let mut spec = pending.clone();
            bind_late(plan, &mut spec)?;
            resource_type.create(&mut spec)?;
            Ok(Outcome::Created(spec))
        }
        ChangeKind::Update => {
            let (Some(current), Some(pending)) = (&change.current, &change.pending) else {
                anyhow::bail!("update change is missing a side");
            };
            let resource_type = registry.require(&pending.type_name, &pending.name)?;
            let mut spec = pending.clone();
            bind_late(plan, &mut spec)?;
            resource_type.update(current, &mut spec, &change.changed_fields)?;
            Ok(Outcome::Updated(spec))
        }
        ChangeKind::Delete => {
            let Some(current) = &change.current else {
                anyhow::bail!("delete change has no current spec");
            };
            let resource_type = registry.require(&current.type_name, &current.name)?;
            resource_type.delete(current)?;
            Ok(Outcome::Deleted(current.clone()))
        }
    }
}

/// Re-resolve the spec's late references from realized outcomes.
///
/// Dependency edges guarantee the target change is terminal by the time
/// its dependents run, so a missing value here means the reference points
/// at something the plan never realized.
fn bind_late(plan: &Plan, spec: &mut ResourceSpec) -> anyhow::Result<()> {
    if spec.late.is_empty() {
        return Ok(());
    }
    for (path, late) in spec.late.clone() {
        let key = ResourceKey::new(late.type_name.clone(), late.name.clone());
        let Some(target_id) = plan.change_for(&key) else {
            anyhow::bail!("late reference {late} points at a resource outside the plan");
        };
        let target = plan.change(target_id);

        let value = match target.memo.snapshot() {
            MemoState::Completed(outcome) => outcome
                .spec()
                .and_then(|realized| realized.field(&late.attribute).cloned())
                .or_else(|| {
                    // Keeps and skips have no realized spec; fall back to
                    // the recorded state.
                    target
                        .current
                        .as_ref()
                        .and_then(|current| current.field(&late.attribute).cloned())
                })
                .unwrap_or(Value::Null),
            _ => anyhow::bail!("late reference {late} read before its target completed"),
        };
        write_field_path(&mut spec.fields, &path, value)?;
    }
    Ok(())
}

/// Write a value at a dotted field path. The first segment names a field;
/// later segments index into the lists and maps that blocks and compound
/// expressions produce.
fn write_field_path(fields: &mut BTreeMap<String, Value>, path: &str, value: Value) -> anyhow::Result<()> {
    let mut segments = path.split('.');
    let Some(field) = segments.next() else {
        anyhow::bail!("empty late reference path");
    };
    let Some(mut cursor) = fields.get_mut(field) else {
        anyhow::bail!("late reference path '{path}' names an absent field");
    };
    for segment in segments {
        cursor = match cursor {
            Value::List(items) => {
                let index: usize = segment
                    .parse()
                    .with_context(|| format!("late reference path '{path}' has a non-numeric list index"))?;
                items
                    .get_mut(index)
                    .with_context(|| format!("late reference path '{path}' runs past the end of a list"))?
            }
            Value::Map(entries) => entries
                .get_mut(segment)
                .with_context(|| format!("late reference path '{path}' names an absent key"))?,
            _ => anyhow::bail!("late reference path '{path}' does not match the field's shape"),
        };
    }
    *cursor = value;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{plan, PlanOptions};
    use crate::report::NullReporter;
    use crate::resource::{FieldDescriptor, ResourceType};
    use anyhow::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counts provider calls so tests can assert at-most-once execution.
    #[derive(Default)]
    struct CountingType {
        creates: AtomicUsize,
        updates: AtomicUsize,
        deletes: AtomicUsize,
        fail_create_of: Option<&'static str>,
    }

    impl ResourceType for CountingType {
        fn type_name(&self) -> &'static str {
            "counted"
        }

        fn fields(&self) -> &'static [FieldDescriptor] {
            const FIELDS: &[FieldDescriptor] = &[
                FieldDescriptor::immutable("az"),
                FieldDescriptor::updatable("cidr"),
            ];
            FIELDS
        }

        fn refresh(&self, _spec: &mut ResourceSpec) -> Result<bool> {
            Ok(true)
        }

        fn create(&self, spec: &mut ResourceSpec) -> Result<()> {
            if self.fail_create_of == Some(spec.name.as_str()) {
                anyhow::bail!("provider rejected the request");
            }
            self.creates.fetch_add(1, Ordering::SeqCst);
            // Provider-assigned id, visible to late references.
            spec.set_field("asset-id", format!("id-{}", spec.name));
            Ok(())
        }

        fn update(&self, _current: &ResourceSpec, _pending: &mut ResourceSpec, _changed: &[String]) -> Result<()> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn delete(&self, _spec: &ResourceSpec) -> Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn registry_with(counting: Arc<CountingType>) -> TypeRegistry {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut registry = TypeRegistry::new();
        registry.register(counting);
        registry
    }

    fn spec(name: &str) -> ResourceSpec {
        ResourceSpec::new("counted", name)
            .with_field("az", "a")
            .with_field("cidr", "10.0.0.0/16")
    }

    #[test]
    fn test_unconfirmed_plan_fails_fast() {
        let counting = Arc::new(CountingType::default());
        let registry = registry_with(counting);
        let plan = plan(&registry, Vec::new(), vec![spec("a")], &PlanOptions::default()).unwrap();

        let err = execute(&plan, &registry, &ExecuteOptions::default(), &NullReporter).unwrap_err();
        assert!(matches!(err, Error::Premature { .. }));
    }

    #[test]
    fn test_create_executes_once_and_summarizes() {
        let counting = Arc::new(CountingType::default());
        let registry = registry_with(counting.clone());
        let plan = plan(&registry, Vec::new(), vec![spec("a")], &PlanOptions::default()).unwrap();
        plan.confirm();

        let summary = execute(&plan, &registry, &ExecuteOptions::default(), &NullReporter).unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(counting.creates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_repeated_execution_is_memoized() {
        let counting = Arc::new(CountingType::default());
        let registry = registry_with(counting.clone());
        let plan = plan(&registry, Vec::new(), vec![spec("a")], &PlanOptions::default()).unwrap();
        plan.confirm();

        let options = ExecuteOptions::default();
        execute(&plan, &registry, &options, &NullReporter).unwrap();
        execute(&plan, &registry, &options, &NullReporter).unwrap();
        assert_eq!(counting.creates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_callers_observe_one_execution() {
        let counting = Arc::new(CountingType::default());
        let registry = registry_with(counting.clone());
        let plan = plan(&registry, Vec::new(), vec![spec("a")], &PlanOptions::default()).unwrap();
        plan.confirm();

        let id = plan.changes().next().unwrap().0;
        let options = ExecuteOptions::default();
        let outcomes: Vec<Outcome> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| run_change(&plan, &registry, id, &options, &NullReporter).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(counting.creates.load(Ordering::SeqCst), 1);
        for outcome in &outcomes {
            assert_eq!(outcome, &outcomes[0]);
        }
    }

    #[test]
    fn test_dependency_failure_aborts_dependents() {
        let counting = Arc::new(CountingType {
            fail_create_of: Some("base"),
            ..CountingType::default()
        });
        let registry = registry_with(counting.clone());

        let mut dependent = spec("leaf");
        dependent.depends_on.push(ResourceKey::new("counted", "base"));
        let plan = plan(
            &registry,
            Vec::new(),
            vec![spec("base"), dependent],
            &PlanOptions::default(),
        )
        .unwrap();
        plan.confirm();

        let summary = execute(&plan, &registry, &ExecuteOptions::default(), &NullReporter).unwrap();
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.created, 0);
        assert_eq!(counting.creates.load(Ordering::SeqCst), 0);
        assert!(summary.failures.iter().any(|f| f.contains("dependency failed")));
    }

    #[test]
    fn test_replace_is_never_auto_applied() {
        let counting = Arc::new(CountingType::default());
        let registry = registry_with(counting.clone());

        let current = vec![spec("a")];
        let pending = vec![spec("a").with_field("az", "b")];
        let plan = plan(&registry, current, pending, &PlanOptions::default()).unwrap();
        plan.confirm();

        let summary = execute(&plan, &registry, &ExecuteOptions::default(), &NullReporter).unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(counting.creates.load(Ordering::SeqCst), 0);
        assert_eq!(counting.updates.load(Ordering::SeqCst), 0);
        assert_eq!(counting.deletes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dry_run_skips_side_effects() {
        let counting = Arc::new(CountingType::default());
        let registry = registry_with(counting.clone());
        let plan = plan(&registry, Vec::new(), vec![spec("a")], &PlanOptions::default()).unwrap();
        plan.confirm();

        let options = ExecuteOptions {
            dry_run: true,
            ..ExecuteOptions::default()
        };
        let summary = execute(&plan, &registry, &options, &NullReporter).unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(counting.creates.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_late_reference_bound_from_realized_outcome() {
        let counting = Arc::new(CountingType::default());
        let registry = registry_with(counting.clone());

        let mut dependent = spec("leaf");
        dependent.depends_on.push(ResourceKey::new("counted", "base"));
        dependent.fields.insert("parent-id".to_string(), Value::Null);
        dependent.late.insert(
            "parent-id".to_string(),
            declare::LateRef {
                type_name: "counted".to_string(),
                name: "base".to_string(),
                attribute: "asset-id".to_string(),
            },
        );

        let plan = plan(
            &registry,
            Vec::new(),
            vec![spec("base"), dependent],
            &PlanOptions::default(),
        )
        .unwrap();
        plan.confirm();

        let summary = execute(&plan, &registry, &ExecuteOptions::default(), &NullReporter).unwrap();
        assert_eq!(summary.created, 2);

        let leaf_id = plan.change_for(&ResourceKey::new("counted", "leaf")).unwrap();
        match plan.change(leaf_id).memo.snapshot() {
            MemoState::Completed(Outcome::Created(realized)) => {
                assert_eq!(realized.field("parent-id"), Some(&Value::from("id-base")));
            }
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[test]
    fn test_late_reference_bound_inside_a_block_entry() {
        let counting = Arc::new(CountingType::default());
        let registry = registry_with(counting.clone());

        let mut dependent = spec("leaf");
        dependent.depends_on.push(ResourceKey::new("counted", "base"));
        let mut entry = BTreeMap::new();
        entry.insert("port".to_string(), Value::from(443));
        entry.insert("source".to_string(), Value::Null);
        dependent
            .fields
            .insert("ingress".to_string(), Value::List(vec![Value::Map(entry)]));
        dependent.late.insert(
            "ingress.0.source".to_string(),
            declare::LateRef {
                type_name: "counted".to_string(),
                name: "base".to_string(),
                attribute: "asset-id".to_string(),
            },
        );

        let plan = plan(
            &registry,
            Vec::new(),
            vec![spec("base"), dependent],
            &PlanOptions::default(),
        )
        .unwrap();
        plan.confirm();
        execute(&plan, &registry, &ExecuteOptions::default(), &NullReporter).unwrap();

        let leaf_id = plan.change_for(&ResourceKey::new("counted", "leaf")).unwrap();
        match plan.change(leaf_id).memo.snapshot() {
            MemoState::Completed(Outcome::Created(realized)) => {
                let rules = realized.field("ingress").and_then(Value::as_list).unwrap();
                assert_eq!(
                    rules[0].as_map().and_then(|m| m.get("source")),
                    Some(&Value::from("id-base"))
                );
            }
            other => panic!("unexpected state: {other:?}"),
        }
    }
}
