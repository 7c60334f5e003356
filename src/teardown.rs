//! Guaranteed teardown of created fixtures
//!
//! Every created resource registers an action here. The registry is owned by
//! the top-level test scope (usually through
//! [`FixtureContext`](crate::context::FixtureContext)) and run on orderly
//! shutdown or when the process is interrupted.
//!
//! Actions are never deduplicated. Each one must be idempotent against a
//! resource that was already removed.

use crate::resource::FixtureError;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

type TeardownFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), FixtureError>> + Send>;

struct TeardownAction {
    label: String,
    action: TeardownFn,
}

/// Outcome of running all registered teardown actions
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TeardownReport {
    /// Labels of actions that succeeded
    pub completed: Vec<String>,
    /// (label, error message) of actions that failed
    pub failed: Vec<(String, String)>,
}

impl TeardownReport {
    /// Whether every action succeeded
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Registry of teardown actions, run last-registered first
#[derive(Clone, Default)]
pub struct TeardownRegistry {
    actions: Arc<Mutex<Vec<TeardownAction>>>,
}

impl fmt::Debug for TeardownRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeardownRegistry")
            .field("pending", &self.len())
            .finish()
    }
}

impl TeardownRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action
    pub fn register<F>(&self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> BoxFuture<'static, Result<(), FixtureError>> + Send + 'static,
    {
        let label = label.into();
        debug!(label = %label, "Registered teardown action");
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(TeardownAction {
                label,
                action: Box::new(action),
            });
    }

    /// Number of pending actions
    pub fn len(&self) -> usize {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no action is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Labels of pending actions, in registration order
    pub fn labels(&self) -> Vec<String> {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|a| a.label.clone())
            .collect()
    }

    /// Run every pending action, newest first
    ///
    /// A failing action is logged and recorded; the remaining actions still run.
    pub async fn run_all(&self) -> TeardownReport {
        let drained: Vec<TeardownAction> = {
            let mut actions = self.actions.lock().unwrap_or_else(PoisonError::into_inner);
            actions.drain(..).collect()
        };

        let mut report = TeardownReport::default();

        for TeardownAction { label, action } in drained.into_iter().rev() {
            match action().await {
                Ok(()) => {
                    debug!(label = %label, "Teardown action completed");
                    report.completed.push(label);
                }
                Err(e) => {
                    warn!(label = %label, error = %e, "Teardown action failed");
                    report.failed.push((label, e.to_string()));
                }
            }
        }

        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            "Teardown finished"
        );

        report
    }

    /// Wait for Ctrl-C, then run every pending action
    pub async fn run_on_shutdown_signal(&self) -> std::io::Result<TeardownReport> {
        tokio::signal::ctrl_c().await?;
        info!(pending = self.len(), "Shutdown signal received, tearing down fixtures");
        Ok(self.run_all().await)
    }
}
