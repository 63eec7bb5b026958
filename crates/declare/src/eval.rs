//! Fixed-point evaluation of declaration bodies.
//!
//! Declarations are attempted in body order. Any declaration whose
//! references cannot be satisfied yet is deferred to the next pass instead
//! of failing; passes repeat until a pass completes with nothing deferred,
//! or a pass makes no progress, which is a genuine deadlock and fails with
//! every remaining declaration listed.

use crate::error::{Error, Result, UnresolvedDeclaration};
use crate::node::{Declaration, DeclarationKind, Expr};
use crate::reference::{LateRef, Reference, Resolution};
use crate::scope::{Graph, Resource, ResourceId, ScopeId};
use crate::value::Value;
use std::collections::BTreeMap;

enum Outcome {
    Done,
    Deferred(String),
}

enum ExprResult {
    Value(Value),
    /// A resource-attribute projection whose value is provider-assigned
    /// and not known yet; stands in as null until execution.
    Late(LateRef),
    Deferred(String),
}

/// Evaluate a declaration body against a scope, materializing resources
/// into the graph's pending registry.
///
/// Worst case this runs O(n) passes over n declarations; n is the size of
/// one configuration body, so the quadratic bound is acceptable.
pub fn evaluate(graph: &mut Graph, scope: ScopeId, body: &[Declaration]) -> Result<()> {
    let mut pending: Vec<&Declaration> = body.iter().collect();
    let mut pass = 1u32;

    loop {
        let mut deferred: Vec<(&Declaration, String)> = Vec::new();

        for &decl in &pending {
            match eval_declaration(graph, scope, decl)? {
                Outcome::Done => {}
                Outcome::Deferred(reason) => deferred.push((decl, reason)),
            }
        }

        if deferred.is_empty() {
            log::debug!("evaluation complete after {pass} pass(es)");
            return Ok(());
        }

        if deferred.len() == pending.len() {
            // No declaration made progress this pass; retrying cannot help.
            return Err(Error::Unresolved {
                declarations: deferred
                    .into_iter()
                    .map(|(decl, reason)| UnresolvedDeclaration {
                        location: decl.location.clone(),
                        summary: decl.describe(),
                        reason,
                    })
                    .collect(),
            });
        }

        log::debug!(
            "pass {pass}: {} of {} declaration(s) deferred",
            deferred.len(),
            pending.len()
        );
        pending = deferred.into_iter().map(|(decl, _)| decl).collect();
        pass += 1;
    }
}

fn eval_declaration(graph: &mut Graph, scope: ScopeId, decl: &Declaration) -> Result<Outcome> {
    match &decl.kind {
        DeclarationKind::Pair { name, value } => {
            let mut targets = Vec::new();
            // A late projection at file level has no resource to carry
            // it; it stays null, as do any nested within the value.
            match eval_expr(graph, scope, value, &mut targets, &mut Vec::new()) {
                ExprResult::Value(value) => {
                    graph.set(scope, name.clone(), value);
                    Ok(Outcome::Done)
                }
                ExprResult::Late(_) => {
                    graph.set(scope, name.clone(), Value::Null);
                    Ok(Outcome::Done)
                }
                ExprResult::Deferred(reason) => Ok(Outcome::Deferred(reason)),
            }
        }
        DeclarationKind::Resource { type_name, name, body } => {
            eval_resource(graph, scope, decl, type_name, name, body)
        }
        DeclarationKind::Block { .. } => Err(Error::Misplaced {
            location: decl.location.clone(),
            reason: "blocks are only allowed inside a resource body".to_string(),
        }),
    }
}

fn eval_resource(
    graph: &mut Graph,
    scope: ScopeId,
    decl: &Declaration,
    type_name: &str,
    name_expr: &Expr,
    body: &[Declaration],
) -> Result<Outcome> {
    let mut targets = Vec::new();

    let name = match eval_expr(graph, scope, name_expr, &mut targets, &mut Vec::new()) {
        ExprResult::Value(value) => match value.to_name() {
            Some(name) => name,
            None => {
                return Err(Error::InvalidName {
                    location: decl.location.clone(),
                    reason: format!("expected a scalar name, got '{value}'"),
                });
            }
        },
        ExprResult::Late(_) => {
            return Ok(Outcome::Deferred("resource name is not yet known".to_string()));
        }
        ExprResult::Deferred(reason) => return Ok(Outcome::Deferred(reason)),
    };

    // One scope per resource body; abandoned if the body defers, so a
    // failed attempt leaves no visible state behind.
    let body_scope = graph.push_scope(scope);
    let mut resource = Resource::new(type_name, name);

    if let Some(reason) = eval_body_into(graph, body_scope, body, &mut resource, &mut targets)? {
        return Ok(Outcome::Deferred(reason));
    }

    let id = graph.register_pending(resource, &decl.location)?;
    for target in targets {
        graph.add_dependency(id, target);
    }
    Ok(Outcome::Done)
}

/// Evaluate a resource body, filling fields on `resource`. Returns
/// `Some(reason)` when any inner declaration must defer; the caller then
/// defers the whole resource declaration.
fn eval_body_into(
    graph: &mut Graph,
    scope: ScopeId,
    body: &[Declaration],
    resource: &mut Resource,
    targets: &mut Vec<ResourceId>,
) -> Result<Option<String>> {
    for decl in body {
        match &decl.kind {
            DeclarationKind::Pair { name, value } => {
                let mut lates = Vec::new();
                match eval_expr(graph, scope, value, targets, &mut lates) {
                    ExprResult::Value(value) => {
                        graph.set(scope, name.clone(), value.clone());
                        resource.fields.insert(name.clone(), value);
                        for (path, late) in lates {
                            resource.late_refs.insert(format!("{name}.{path}"), late);
                        }
                    }
                    ExprResult::Late(late) => {
                        graph.set(scope, name.clone(), Value::Null);
                        resource.fields.insert(name.clone(), Value::Null);
                        resource.late_refs.insert(name.clone(), late);
                    }
                    ExprResult::Deferred(reason) => return Ok(Some(reason)),
                }
            }
            DeclarationKind::Block { field, body } => {
                let block_scope = graph.push_scope(scope);
                let mut entries = BTreeMap::new();
                // Position this occurrence will take in the list field.
                let index = resource.fields.get(field).and_then(Value::as_list).map_or(0, <[Value]>::len);

                for inner in body {
                    let DeclarationKind::Pair { name, value } = &inner.kind else {
                        return Err(Error::Misplaced {
                            location: inner.location.clone(),
                            reason: "only key/value pairs are allowed inside a block".to_string(),
                        });
                    };
                    let mut lates = Vec::new();
                    match eval_expr(graph, block_scope, value, targets, &mut lates) {
                        ExprResult::Value(value) => {
                            graph.set(block_scope, name.clone(), value.clone());
                            entries.insert(name.clone(), value);
                        }
                        ExprResult::Late(late) => {
                            entries.insert(name.clone(), Value::Null);
                            resource.late_refs.insert(format!("{field}.{index}.{name}"), late);
                        }
                        ExprResult::Deferred(reason) => return Ok(Some(reason)),
                    }
                    for (path, late) in lates {
                        resource.late_refs.insert(format!("{field}.{index}.{name}.{path}"), late);
                    }
                }

                // Repeated blocks accumulate into a list-valued field.
                let slot = resource
                    .fields
                    .entry(field.clone())
                    .or_insert_with(|| Value::List(Vec::new()));
                if let Value::List(items) = slot {
                    items.push(Value::Map(entries));
                }
            }
            DeclarationKind::Resource { .. } => {
                return Err(Error::Misplaced {
                    location: decl.location.clone(),
                    reason: "resource declarations cannot be nested inside a resource body"
                        .to_string(),
                });
            }
        }
    }
    Ok(None)
}

/// Evaluate one expression.
///
/// Late projections nested inside compound values stand in as null; their
/// position is pushed onto `lates` as a dotted path (list index or map key
/// per level, relative to the expression root) so the owning resource can
/// record them for re-resolution at execution time.
fn eval_expr(
    graph: &Graph,
    scope: ScopeId,
    expr: &Expr,
    targets: &mut Vec<ResourceId>,
    lates: &mut Vec<(String, LateRef)>,
) -> ExprResult {
    match expr {
        Expr::Literal(value) => ExprResult::Value(value.clone()),
        Expr::Reference(reference) => eval_reference(graph, scope, reference, targets),
        Expr::List(items) => {
            let mut values = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let mut nested = Vec::new();
                match eval_expr(graph, scope, item, targets, &mut nested) {
                    ExprResult::Value(value) => values.push(value),
                    ExprResult::Late(late) => {
                        values.push(Value::Null);
                        lates.push((i.to_string(), late));
                    }
                    deferred @ ExprResult::Deferred(_) => return deferred,
                }
                for (path, late) in nested {
                    lates.push((format!("{i}.{path}"), late));
                }
            }
            ExprResult::Value(Value::List(values))
        }
        Expr::Map(entries) => {
            let mut values = BTreeMap::new();
            for (key, item) in entries {
                let mut nested = Vec::new();
                match eval_expr(graph, scope, item, targets, &mut nested) {
                    ExprResult::Value(value) => {
                        values.insert(key.clone(), value);
                    }
                    ExprResult::Late(late) => {
                        values.insert(key.clone(), Value::Null);
                        lates.push((key.clone(), late));
                    }
                    deferred @ ExprResult::Deferred(_) => return deferred,
                }
                for (path, late) in nested {
                    lates.push((format!("{key}.{path}"), late));
                }
            }
            ExprResult::Value(Value::Map(values))
        }
    }
}

fn eval_reference(
    graph: &Graph,
    scope: ScopeId,
    reference: &Reference,
    targets: &mut Vec<ResourceId>,
) -> ExprResult {
    match reference {
        Reference::Simple { name } => match graph.resolve_simple(scope, name) {
            Resolution::Resolved(value) => ExprResult::Value(value),
            Resolution::Late => ExprResult::Value(Value::Null),
            Resolution::Unresolved(reason) => ExprResult::Deferred(reason),
        },
        Reference::Resource { type_name, name, attribute } => {
            let resolved_name = match name {
                None => None,
                Some(expr) => match eval_expr(graph, scope, expr, targets, &mut Vec::new()) {
                    ExprResult::Value(value) => match value.to_name() {
                        Some(name) => Some(name),
                        None => {
                            return ExprResult::Deferred(format!(
                                "resource name in {reference} evaluated to '{value}'"
                            ));
                        }
                    },
                    ExprResult::Late(_) => {
                        return ExprResult::Deferred(format!(
                            "resource name in {reference} is not yet known"
                        ));
                    }
                    deferred @ ExprResult::Deferred(_) => return deferred,
                },
            };

            let (resolution, matched) =
                graph.resolve_resource(type_name, resolved_name.as_deref(), attribute.as_deref());
            match resolution {
                Resolution::Resolved(value) => {
                    targets.extend(matched);
                    ExprResult::Value(value)
                }
                Resolution::Late => {
                    targets.extend(matched);
                    ExprResult::Late(LateRef {
                        type_name: type_name.clone(),
                        name: resolved_name.unwrap_or_default(),
                        attribute: attribute.clone().unwrap_or_default(),
                    })
                }
                Resolution::Unresolved(reason) => ExprResult::Deferred(reason),
            }
        }
    }
}
