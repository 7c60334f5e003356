//! Readiness strategies
//!
//! A [`WaitStrategy`] decides when a freshly created resource is usable. Each
//! strategy consumes the watch stream of the resource's kind and checks its
//! predicate on every received event, bounded by a deadline measured from
//! the moment creation started.
//!
//! # Example
//!
//! ```
//! use kube_fixtures::wait::WaitStrategy;
//! use std::time::Duration;
//!
//! // Two "ready to accept connections" lines within a minute
//! let strategy = WaitStrategy::log(".*ready to accept connections.*")
//!     .times(2)
//!     .with_timeout(Duration::from_secs(60));
//! assert_eq!(strategy.timeout(), Duration::from_secs(60));
//! ```

mod error;
mod pod;
mod service;

pub use error::{ResourceState, WaitError, WaitFailure};
pub use pod::wait_for_pod;
pub use service::wait_for_service;

pub(crate) use service::external_addresses;

use crate::client::{WatchEvent, WatchStream};
use crate::config::DEFAULT_TIMEOUT;
use crate::resource::FixtureError;
use futures::{Stream, StreamExt};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Delay between reads while waiting for an external address
pub const EXTERNAL_IP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// What a strategy waits for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitKind {
    /// Pod phase becomes `Running`
    RunningStatus,
    /// Listed containers (all when empty) report ready
    ReadyContainers(BTreeSet<String>),
    /// Log lines matching `pattern`, at least `times` of them
    LogMatch { pattern: String, times: usize },
    /// Service has at least one external address
    ExternalIp,
}

impl fmt::Display for WaitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunningStatus => write!(f, "phase Running"),
            Self::ReadyContainers(names) if names.is_empty() => {
                write!(f, "all containers ready")
            }
            Self::ReadyContainers(names) => {
                let names: Vec<&str> = names.iter().map(String::as_str).collect();
                write!(f, "containers ready: {}", names.join(", "))
            }
            Self::LogMatch { pattern, times } => {
                write!(f, "log matches '{pattern}' {times} time(s)")
            }
            Self::ExternalIp => write!(f, "external IP assigned"),
        }
    }
}

/// A readiness condition plus the time allowed to reach it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitStrategy {
    kind: WaitKind,
    timeout: Duration,
}

impl WaitStrategy {
    fn of(kind: WaitKind) -> Self {
        Self {
            kind,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Wait for the pod phase `Running`
    pub fn running() -> Self {
        Self::of(WaitKind::RunningStatus)
    }

    /// Wait for the named containers to be ready; no names means all of them
    pub fn ready_containers<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::of(WaitKind::ReadyContainers(
            names.into_iter().map(Into::into).collect(),
        ))
    }

    /// Wait for one log line matching `pattern`
    ///
    /// A line matches when the whole line matches `pattern` as a regular
    /// expression, or when it contains `pattern` literally.
    pub fn log(pattern: impl Into<String>) -> Self {
        Self::of(WaitKind::LogMatch {
            pattern: pattern.into(),
            times: 1,
        })
    }

    /// Wait for the service to get an external address
    pub fn external_ip() -> Self {
        Self::of(WaitKind::ExternalIp)
    }

    /// Number of matching log lines required (at least 1)
    ///
    /// Only meaningful for [`WaitStrategy::log`].
    #[must_use]
    pub fn times(mut self, n: usize) -> Self {
        if let WaitKind::LogMatch { times, .. } = &mut self.kind {
            *times = n.max(1);
        }
        self
    }

    /// Set the timeout (default 30s)
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The condition waited for
    pub fn kind(&self) -> &WaitKind {
        &self.kind
    }

    /// The time allowed to reach the condition
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Point in time a wait must finish by
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    timeout: Duration,
}

impl Deadline {
    /// Deadline `timeout` after `started`
    pub fn new(started: Instant, timeout: Duration) -> Self {
        Self { started, timeout }
    }

    /// Deadline `timeout` from now
    pub fn after(timeout: Duration) -> Self {
        Self::new(Instant::now(), timeout)
    }

    /// The instant the wait must finish by
    pub fn at(&self) -> Instant {
        self.started + self.timeout
    }

    /// Whether the deadline has passed
    pub fn expired(&self) -> bool {
        Instant::now() >= self.at()
    }

    /// Time since the wait started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Configured timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn fail(
        &self,
        resource: &str,
        condition: &str,
        failure: WaitFailure,
        last_state: &str,
    ) -> WaitError {
        WaitError::new(resource, condition, failure, self.timeout, self.elapsed())
            .with_state(last_state)
    }
}

/// One step of a deadline-bounded stream read
pub(crate) enum Next<T> {
    Item(T),
    Closed,
    Expired,
}

/// Read the next item unless the deadline passes first
pub(crate) async fn next_before<S>(stream: &mut S, deadline: &Deadline) -> Next<S::Item>
where
    S: Stream + Unpin,
{
    if deadline.expired() {
        return Next::Expired;
    }

    match tokio::time::timeout_at(deadline.at(), stream.next()).await {
        Ok(Some(item)) => Next::Item(item),
        Ok(None) => Next::Closed,
        Err(_) => Next::Expired,
    }
}

/// Consume watch events until `satisfied` holds for the object named `name`
///
/// Events for other objects are ignored. Returns the satisfying snapshot.
pub(crate) async fn watch_until<K, F>(
    events: &mut WatchStream<K>,
    name: &str,
    resource: &str,
    condition: &str,
    deadline: &Deadline,
    mut satisfied: F,
) -> Result<K, FixtureError>
where
    K: kube::Resource + ResourceState + 'static,
    F: FnMut(&K) -> bool,
{
    let mut last_state = String::from("no event received");

    loop {
        match next_before(events, deadline).await {
            Next::Item(Ok(event)) if event.name() == Some(name) => match event {
                WatchEvent::Applied(obj) => {
                    last_state = obj.state_description();
                    debug!(
                        resource = %resource,
                        state = %last_state,
                        elapsed = ?deadline.elapsed(),
                        "Observed event"
                    );
                    if satisfied(&obj) {
                        return Ok(obj);
                    }
                }
                WatchEvent::Deleted(_) => {
                    return Err(deadline
                        .fail(resource, condition, WaitFailure::Deleted, &last_state)
                        .into());
                }
            },
            Next::Item(Ok(_)) => {}
            Next::Item(Err(e)) => return Err(e.into()),
            Next::Closed => {
                return Err(deadline
                    .fail(resource, condition, WaitFailure::StreamClosed, &last_state)
                    .into());
            }
            Next::Expired => {
                return Err(deadline
                    .fail(resource, condition, WaitFailure::NeverReached, &last_state)
                    .into());
            }
        }
    }
}
