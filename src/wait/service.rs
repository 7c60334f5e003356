//! Service readiness: external address assignment

use super::{
    watch_until, Deadline, ResourceState, WaitFailure, WaitKind, WaitStrategy,
    EXTERNAL_IP_POLL_INTERVAL,
};
use crate::client::{ResourceClient, WatchStream};
use crate::resource::FixtureError;
use k8s_openapi::api::core::v1::Service;
use tracing::{debug, info};

/// Run `strategy` for the service `name`
///
/// External address assignment does not always show up promptly on the watch
/// stream, so once the service has been seen the object is re-read every
/// [`EXTERNAL_IP_POLL_INTERVAL`] until an address appears or the deadline
/// passes.
pub async fn wait_for_service(
    client: &dyn ResourceClient<Service>,
    name: &str,
    strategy: &WaitStrategy,
    mut events: WatchStream<Service>,
    deadline: &Deadline,
) -> Result<(), FixtureError> {
    let resource = format!("service/{name}");
    let condition = strategy.kind().to_string();

    if *strategy.kind() != WaitKind::ExternalIp {
        return Err(FixtureError::UnsupportedStrategy(format!(
            "'{condition}' does not apply to services"
        )));
    }

    debug!(
        namespace = %client.namespace(),
        service = %name,
        condition = %condition,
        timeout = ?deadline.timeout(),
        "Waiting for service"
    );

    let seen = watch_until(&mut events, name, &resource, &condition, deadline, |_| true).await?;
    drop(events);

    let mut last_state = seen.state_description();

    loop {
        match client.read(name).await? {
            Some(service) => {
                last_state = service.state_description();
                if !external_addresses(&service).is_empty() {
                    break;
                }
            }
            None => {
                return Err(deadline
                    .fail(&resource, &condition, WaitFailure::Deleted, &last_state)
                    .into());
            }
        }

        if deadline.expired() {
            return Err(deadline
                .fail(&resource, &condition, WaitFailure::NeverReached, &last_state)
                .into());
        }

        let next_poll = tokio::time::Instant::now() + EXTERNAL_IP_POLL_INTERVAL;
        tokio::time::sleep_until(next_poll.min(deadline.at())).await;
    }

    info!(
        namespace = %client.namespace(),
        service = %name,
        state = %last_state,
        elapsed = ?deadline.elapsed(),
        "Service ready"
    );

    Ok(())
}

/// Externally reachable addresses: fixed external IPs, then load balancer
/// ingress IPs or hostnames
pub(crate) fn external_addresses(service: &Service) -> Vec<String> {
    let fixed = service
        .spec
        .as_ref()
        .and_then(|s| s.external_ips.clone())
        .unwrap_or_default();

    let ingress = service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|i| i.ip.clone().or_else(|| i.hostname.clone()));

    fixed.into_iter().chain(ingress).collect()
}
