//! Pod readiness: running phase, ready containers and log matching

use super::{next_before, watch_until, Deadline, Next, WaitFailure, WaitKind, WaitStrategy};
use crate::client::{LogStream, PodClient, WatchStream};
use crate::resource::FixtureError;
use futures::stream::BoxStream;
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use regex::Regex;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Run `strategy` for the pod `name` against its kind's watch stream
///
/// The watch subscription is dropped on every exit path. Fails with
/// [`FixtureError::WaitFailed`] when the condition is not met before the
/// deadline and with [`FixtureError::UnsupportedStrategy`] for strategies that
/// only apply to services.
pub async fn wait_for_pod(
    client: &dyn PodClient,
    name: &str,
    strategy: &WaitStrategy,
    mut events: WatchStream<Pod>,
    deadline: &Deadline,
) -> Result<(), FixtureError> {
    let resource = format!("pod/{name}");
    let condition = strategy.kind().to_string();

    debug!(
        namespace = %client.namespace(),
        pod = %name,
        condition = %condition,
        timeout = ?deadline.timeout(),
        "Waiting for pod"
    );

    match strategy.kind() {
        WaitKind::RunningStatus => {
            watch_until(&mut events, name, &resource, &condition, deadline, is_running).await?;
        }
        WaitKind::ReadyContainers(filter) => {
            watch_until(&mut events, name, &resource, &condition, deadline, |pod| {
                containers_ready(pod, filter)
            })
            .await?;
        }
        WaitKind::LogMatch { pattern, times } => {
            let started = watch_until(
                &mut events,
                name,
                &resource,
                "pod started (phase past Pending)",
                deadline,
                has_started,
            )
            .await?;
            drop(events);

            let container = started
                .spec
                .as_ref()
                .and_then(|s| s.containers.first())
                .map(|c| c.name.clone());
            let logs = client.log_stream(name, container.as_deref()).await?;

            count_matches(
                logs,
                &LineMatcher::new(pattern),
                *times,
                &resource,
                &condition,
                deadline,
            )
            .await?;
        }
        WaitKind::ExternalIp => {
            return Err(FixtureError::UnsupportedStrategy(format!(
                "'{condition}' does not apply to pods"
            )));
        }
    }

    info!(
        namespace = %client.namespace(),
        pod = %name,
        condition = %condition,
        elapsed = ?deadline.elapsed(),
        "Pod ready"
    );

    Ok(())
}

fn phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

fn is_running(pod: &Pod) -> bool {
    phase(pod).is_some_and(|p| p.eq_ignore_ascii_case("running"))
}

/// Past `Pending`/`Unknown`; a missing status or phase still counts as waiting
fn has_started(pod: &Pod) -> bool {
    phase(pod).is_some_and(|p| {
        !p.eq_ignore_ascii_case("pending") && !p.eq_ignore_ascii_case("unknown")
    })
}

/// Every filtered container is ready (an empty filter selects all of them)
fn containers_ready(pod: &Pod, filter: &BTreeSet<String>) -> bool {
    let Some(statuses) = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
    else {
        return false;
    };

    statuses
        .iter()
        .filter(|c| filter.is_empty() || filter.contains(&c.name))
        .all(|c| c.ready)
}

/// Whole-line regex match, or literal substring
struct LineMatcher {
    literal: String,
    regex: Option<Regex>,
}

impl LineMatcher {
    fn new(pattern: &str) -> Self {
        let regex = match Regex::new(&format!("^(?:{pattern})$")) {
            Ok(regex) => Some(regex),
            Err(e) => {
                debug!(pattern = %pattern, error = %e, "Not a valid regex, matching literally");
                None
            }
        };

        Self {
            literal: pattern.to_string(),
            regex,
        }
    }

    fn matches(&self, line: &str) -> bool {
        self.regex.as_ref().is_some_and(|r| r.is_match(line)) || line.contains(&self.literal)
    }
}

/// Log lines, decoded leniently; only read failures surface as errors
fn log_lines(logs: LogStream) -> BoxStream<'static, std::io::Result<String>> {
    futures::stream::unfold(logs, |mut logs| async move {
        let mut buf = Vec::new();
        match logs.read_until(b'\n', &mut buf).await {
            Ok(0) => None,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                Some((Ok(String::from_utf8_lossy(&buf).into_owned()), logs))
            }
            Err(e) => Some((Err(e), logs)),
        }
    })
    .boxed()
}

async fn count_matches(
    logs: LogStream,
    matcher: &LineMatcher,
    times: usize,
    resource: &str,
    condition: &str,
    deadline: &Deadline,
) -> Result<(), FixtureError> {
    let mut lines = log_lines(logs);
    let mut observed = 0;
    let mut last_line: Option<String> = None;

    while observed < times {
        match next_before(&mut lines, deadline).await {
            Next::Item(Ok(line)) => {
                if matcher.matches(&line) {
                    observed += 1;
                    debug!(
                        resource = %resource,
                        observed = observed,
                        required = times,
                        line = %line,
                        "Log line matched"
                    );
                }
                last_line = Some(line);
            }
            Next::Item(Err(e)) => return Err(FixtureError::Io(e)),
            Next::Closed | Next::Expired => {
                let state = last_line
                    .map(|l| format!("last log line: {l}"))
                    .unwrap_or_else(|| "no log output".to_string());
                return Err(deadline
                    .fail(
                        resource,
                        condition,
                        WaitFailure::ConditionUnmet {
                            expected: times,
                            observed,
                        },
                        &state,
                    )
                    .into());
            }
        }
    }

    Ok(())
}
