//! Reporting hooks for plan execution
//!
//! The engine emits per-change notifications through this trait and never
//! formats console output itself; renderers live with the embedding
//! application.

use crate::change::Outcome;

pub trait Reporter: Send + Sync {
    fn on_change_start(&self, _summary: &str) {}

    fn on_change_complete(&self, _summary: &str, _outcome: &Outcome) {}

    fn on_change_failed(&self, _summary: &str, _reason: &str) {}
}

/// Discards all notifications.
pub struct NullReporter;

impl Reporter for NullReporter {}

/// Forwards notifications to the log facade.
pub struct LogReporter;

impl Reporter for LogReporter {
    fn on_change_start(&self, summary: &str) {
        log::info!("applying {summary}");
    }

    fn on_change_complete(&self, summary: &str, outcome: &Outcome) {
        log::info!("{} {summary}", outcome.label());
    }

    fn on_change_failed(&self, summary: &str, reason: &str) {
        log::error!("failed {summary}: {reason}");
    }
}
