//! Composite identity keys and current/pending matching
//!
//! A resource's full identity (a provider-assigned id) may not be known
//! until after creation, so planning matches on partial keys: positions
//! where either side is unknown are skipped, and a comparison that skipped
//! every position counts as a mismatch.

use crate::error::{Error, Result};
use crate::resource::{ResourceSpec, ResourceType};
use std::fmt;

/// Ordered list of optional scalar identity components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityKey {
    components: Vec<Option<String>>,
}

impl IdentityKey {
    pub fn new(components: Vec<Option<String>>) -> Self {
        Self { components }
    }

    /// Partial equality: positions where either side is null are skipped;
    /// any position where both sides are known and differ is a mismatch;
    /// and at least one real comparison must have happened, otherwise the
    /// match is vacuous and rejected.
    pub fn matches(&self, other: &IdentityKey) -> bool {
        let mut compared = false;
        for (a, b) in self.components.iter().zip(&other.components) {
            match (a, b) {
                (Some(a), Some(b)) => {
                    if a != b {
                        return false;
                    }
                    compared = true;
                }
                _ => {}
            }
        }
        compared
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match component {
                Some(c) => write!(f, "{c}")?,
                None => write!(f, "?")?,
            }
        }
        write!(f, "]")
    }
}

/// Result of pairing a current collection against a pending collection.
#[derive(Debug, Default)]
pub struct MatchOutcome {
    /// Matched (current, pending) pairs, in pending order.
    pub pairs: Vec<(ResourceSpec, ResourceSpec)>,
    /// Current assets no pending config claimed; candidates for deletion.
    pub unmatched_current: Vec<ResourceSpec>,
    /// Pending configs with no current counterpart; candidates for creation.
    pub unmatched_pending: Vec<ResourceSpec>,
}

/// Pair current assets with pending configs of one type by identity.
///
/// Each current asset can be consumed by at most one pending config. Two
/// items on the same side with matching identities are a configuration
/// error.
pub fn match_specs(
    resource_type: &dyn ResourceType,
    current: Vec<ResourceSpec>,
    pending: Vec<ResourceSpec>,
) -> Result<MatchOutcome> {
    check_unique(resource_type, &current, "current")?;
    check_unique(resource_type, &pending, "pending")?;

    let mut remaining: Vec<(IdentityKey, ResourceSpec)> = current
        .into_iter()
        .map(|spec| (resource_type.identity(&spec), spec))
        .collect();

    let mut outcome = MatchOutcome::default();
    for spec in pending {
        let key = resource_type.identity(&spec);
        match remaining.iter().position(|(candidate, _)| candidate.matches(&key)) {
            Some(i) => {
                let (_, matched) = remaining.remove(i);
                log::trace!("matched {} against recorded state", resource_type.display(&spec));
                outcome.pairs.push((matched, spec));
            }
            None => outcome.unmatched_pending.push(spec),
        }
    }
    outcome.unmatched_current = remaining.into_iter().map(|(_, spec)| spec).collect();
    Ok(outcome)
}

fn check_unique(
    resource_type: &dyn ResourceType,
    specs: &[ResourceSpec],
    side: &'static str,
) -> Result<()> {
    for (i, a) in specs.iter().enumerate() {
        let key = resource_type.identity(a);
        for b in &specs[i + 1..] {
            if resource_type.identity(b).matches(&key) {
                return Err(Error::IdentityConflict {
                    side,
                    display: resource_type.display(a),
                });
            }
        }
    }
    Ok(())
}
