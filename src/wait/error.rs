//! Rich wait errors with debugging context
//!
//! A failed readiness wait reports what was being waited for, why it stopped,
//! the last state observed and how long it took.

use k8s_openapi::api::core::v1::{Pod, Service};
use std::fmt;
use std::time::Duration;

/// Why a readiness wait stopped without success
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitFailure {
    /// The condition was never observed before the deadline
    NeverReached,
    /// The resource started but the condition was met fewer times than required
    ConditionUnmet { expected: usize, observed: usize },
    /// The event or log stream ended before the condition was met
    StreamClosed,
    /// The resource was deleted while waiting
    Deleted,
}

impl fmt::Display for WaitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NeverReached => write!(f, "condition never reached"),
            Self::ConditionUnmet {
                expected,
                observed: 0,
            } => write!(f, "no matching line seen (expected {expected})"),
            Self::ConditionUnmet { expected, observed } => {
                write!(f, "matched {observed} of {expected} required times")
            }
            Self::StreamClosed => write!(f, "stream closed before the condition was met"),
            Self::Deleted => write!(f, "resource was deleted while waiting"),
        }
    }
}

/// Rich error context for readiness waits
#[derive(Debug, Clone)]
pub struct WaitError {
    /// Resource reference (e.g., "pod/kube-fixtures-pod-1a2b3c4d")
    pub resource: String,
    /// The condition being waited for
    pub condition: String,
    /// Why the wait stopped
    pub failure: WaitFailure,
    /// Description of the last observed state
    pub last_state: String,
    /// How long we waited before giving up
    pub elapsed: Duration,
    /// The timeout that was configured
    pub timeout: Duration,
}

impl WaitError {
    /// Create a new WaitError
    pub fn new(
        resource: impl Into<String>,
        condition: impl Into<String>,
        failure: WaitFailure,
        timeout: Duration,
        elapsed: Duration,
    ) -> Self {
        Self {
            resource: resource.into(),
            condition: condition.into(),
            failure,
            last_state: "no event received".to_string(),
            elapsed,
            timeout,
        }
    }

    /// Set the last observed state
    #[must_use]
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.last_state = state.into();
        self
    }

    /// Whether the wait ran into its deadline
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.failure,
            WaitFailure::NeverReached | WaitFailure::ConditionUnmet { .. }
        )
    }
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "Wait failed for {}: {}", self.resource, self.failure)?;
        writeln!(f, "├─ Condition: {}", self.condition)?;
        writeln!(f, "├─ Last state: {}", self.last_state)?;
        writeln!(f, "├─ Elapsed: {:?}", self.elapsed)?;
        writeln!(f, "└─ Timeout: {:?}", self.timeout)
    }
}

impl std::error::Error for WaitError {}

/// Helper trait for extracting state description from K8s resources
pub trait ResourceState {
    /// Get a human-readable description of the resource's current state
    fn state_description(&self) -> String;
}

impl ResourceState for Pod {
    fn state_description(&self) -> String {
        let phase = self
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Unknown");

        let containers = self
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref());

        match containers {
            Some(statuses) => {
                let total = statuses.len();
                let ready = statuses.iter().filter(|c| c.ready).count();

                let waiting_reasons: Vec<&str> = statuses
                    .iter()
                    .filter_map(|c| {
                        c.state
                            .as_ref()
                            .and_then(|s| s.waiting.as_ref())
                            .and_then(|w| w.reason.as_deref())
                    })
                    .collect();

                if waiting_reasons.is_empty() {
                    format!("phase={phase}, containers {ready}/{total} ready")
                } else {
                    format!(
                        "phase={phase}, containers {ready}/{total} ready, waiting: {}",
                        waiting_reasons.join(", ")
                    )
                }
            }
            None => format!("phase={phase}, no container status"),
        }
    }
}

impl ResourceState for Service {
    fn state_description(&self) -> String {
        let service_type = self
            .spec
            .as_ref()
            .and_then(|s| s.type_.as_deref())
            .unwrap_or("ClusterIP");
        let cluster_ip = self
            .spec
            .as_ref()
            .and_then(|s| s.cluster_ip.as_deref())
            .unwrap_or("none");
        let external = super::service::external_addresses(self);

        if external.is_empty() {
            format!("type={service_type}, clusterIP={cluster_ip}, no external address")
        } else {
            format!(
                "type={service_type}, clusterIP={cluster_ip}, external: {}",
                external.join(", ")
            )
        }
    }
}
