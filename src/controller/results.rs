//! Outcome of one reconciliation pass.
//!
//! Steps of a pass each contribute a `Results`: an optional requeue with a
//! human-readable reason, and any errors. Steps keep running after an
//! independent step failed; the first error is returned to the controller.

use std::time::Duration;

use kube::runtime::controller::Action;
use tracing::warn;

use super::error::Error;

/// Requeue delay used while a topology change is in flight.
pub const DEFAULT_REQUEUE: Duration = Duration::from_secs(10);

/// Resync interval once nothing is left to do.
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
pub struct Results {
    requeue_after: Option<Duration>,
    reason: Option<String>,
    errors: Vec<Error>,
}

impl Results {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error(&mut self, error: impl Into<Error>) -> &mut Self {
        self.errors.push(error.into());
        self
    }

    /// Requeue after `DEFAULT_REQUEUE`, replacing any previous reason.
    pub fn with_requeue(&mut self, reason: impl Into<String>) -> &mut Self {
        self.with_requeue_after(DEFAULT_REQUEUE, reason)
    }

    /// Keeps the shortest requeue delay seen so far.
    pub fn with_requeue_after(&mut self, after: Duration, reason: impl Into<String>) -> &mut Self {
        self.requeue_after = Some(match self.requeue_after {
            Some(current) => current.min(after),
            None => after,
        });
        self.reason = Some(reason.into());
        self
    }

    pub fn merge(&mut self, other: Results) -> &mut Self {
        if let Some(after) = other.requeue_after {
            let reason = other
                .reason
                .unwrap_or_else(|| self.reason.clone().unwrap_or_default());
            self.with_requeue_after(after, reason);
        }
        self.errors.extend(other.errors);
        self
    }

    pub fn has_error(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_requeue(&self) -> bool {
        self.requeue_after.is_some()
    }

    /// Nothing left to do: no error and no requeue requested.
    pub fn is_reconciled(&self) -> bool {
        !self.has_error() && !self.has_requeue()
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Converts into the controller outcome. Errors beyond the first are logged.
    pub fn into_action(self) -> Result<Action, Error> {
        let mut errors = self.errors.into_iter();
        if let Some(first) = errors.next() {
            for other in errors {
                warn!(error = %other, "Additional reconciliation error");
            }
            return Err(first);
        }
        Ok(Action::requeue(self.requeue_after.unwrap_or(RESYNC_INTERVAL)))
    }
}
