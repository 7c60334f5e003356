//! Managed services

use super::{
    claim, creation_failed, delete_quietly, generate_name, Fixture, FixtureError, NoHooks,
    ServiceHooks, SERVICE_NAME_PREFIX,
};
use crate::client::ResourceClient;
use crate::config::FixtureConfig;
use crate::teardown::TeardownRegistry;
use crate::wait::{external_addresses, wait_for_service, Deadline, WaitStrategy};
use crate::worker::{WorkerId, WorkerMap};
use async_trait::async_trait;
use futures::FutureExt;
use k8s_openapi::api::core::v1::Service;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
struct ServiceInstance {
    name: String,
    service: Service,
}

/// A service used as a test fixture
pub struct ManagedService {
    spec: Service,
    config: Arc<FixtureConfig>,
    services: Arc<dyn ResourceClient<Service>>,
    teardown: TeardownRegistry,
    wait: Option<WaitStrategy>,
    hooks: Arc<dyn ServiceHooks>,
    instances: WorkerMap<ServiceInstance>,
}

impl fmt::Debug for ManagedService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedService")
            .field("namespace", &self.services.namespace())
            .field("wait", &self.wait)
            .field("running", &self.instances.len())
            .finish_non_exhaustive()
    }
}

impl ManagedService {
    /// Managed service created from `spec`, without a wait strategy
    pub fn new(
        spec: Service,
        config: Arc<FixtureConfig>,
        services: Arc<dyn ResourceClient<Service>>,
        teardown: TeardownRegistry,
    ) -> Self {
        Self {
            spec,
            config,
            services,
            teardown,
            wait: None,
            hooks: Arc::new(NoHooks),
            instances: WorkerMap::new(),
        }
    }

    /// Wait for `strategy` during `create`
    #[must_use]
    pub fn with_wait(mut self, strategy: WaitStrategy) -> Self {
        self.wait = Some(strategy);
        self
    }

    /// Return from `create` as soon as the service is accepted
    #[must_use]
    pub fn without_wait(mut self) -> Self {
        self.wait = None;
        self
    }

    /// Install creation hooks
    #[must_use]
    pub fn with_hooks(mut self, hooks: impl ServiceHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// The spec services are created from
    pub fn spec(&self) -> &Service {
        &self.spec
    }

    /// The attached wait strategy
    pub fn wait_strategy(&self) -> Option<&WaitStrategy> {
        self.wait.as_ref()
    }

    /// Create the service for `worker` and wait for readiness
    pub async fn create(&self, worker: &WorkerId) -> Result<String, FixtureError> {
        if let Some(name) = self.instances.with(worker, |i| i.name.clone()) {
            return Err(FixtureError::AlreadyRunning(name));
        }

        let started = Instant::now();
        let name = generate_name(SERVICE_NAME_PREFIX);

        let mut service = self.spec.clone();
        service.metadata.name = Some(name.clone());
        service.metadata.namespace = Some(self.services.namespace().to_string());
        self.hooks.before_create(&mut service, worker)?;
        claim(&mut service.metadata, &name, self.services.namespace());

        info!(
            namespace = %self.services.namespace(),
            service = %name,
            worker = %worker,
            "Creating service"
        );

        let created = self
            .services
            .create(&service)
            .await
            .map_err(|e| creation_failed("service", &name, e))?;

        self.register_teardown(&name);
        self.instances.insert(
            worker,
            ServiceInstance {
                name: name.clone(),
                service: created,
            },
        );

        if let Some(strategy) = &self.wait {
            let events = self.services.watch().await?;
            let deadline = Deadline::new(started, strategy.timeout());

            if let Err(e) =
                wait_for_service(self.services.as_ref(), &name, strategy, events, &deadline).await
            {
                error!(
                    namespace = %self.services.namespace(),
                    service = %name,
                    error = %e,
                    "Service did not become ready"
                );
                return Err(e);
            }

            if let Some(current) = self.services.read(&name).await? {
                self.instances.with_mut(worker, |i| i.service = current);
            }
        }

        self.hooks.on_ready(self, worker).await?;

        info!(
            namespace = %self.services.namespace(),
            service = %name,
            elapsed = ?started.elapsed(),
            "Service created"
        );

        Ok(name)
    }

    /// Delete the service created by `worker`; a no-op when there is none
    pub async fn remove(&self, worker: &WorkerId) -> Result<(), FixtureError> {
        let Some(instance) = self.instances.remove(worker) else {
            debug!(worker = %worker, "No service to remove");
            return Ok(());
        };

        info!(
            namespace = %self.services.namespace(),
            service = %instance.name,
            "Removing service"
        );

        delete_quietly::<Service, _>(self.services.as_ref(), "service", &instance.name).await
    }

    /// Name of the service created by `worker`
    pub fn object_name(&self, worker: &WorkerId) -> Result<String, FixtureError> {
        self.instances
            .with(worker, |i| i.name.clone())
            .ok_or(FixtureError::NotRunning)
    }

    /// Latest snapshot of the service created by `worker`
    pub fn created(&self, worker: &WorkerId) -> Result<Service, FixtureError> {
        self.instances
            .with(worker, |i| i.service.clone())
            .ok_or(FixtureError::NotRunning)
    }

    /// Address of the service
    ///
    /// The cluster IP when running inside the cluster, otherwise the first
    /// external address.
    pub async fn host_ip(&self, worker: &WorkerId) -> Result<String, FixtureError> {
        let name = self.object_name(worker)?;
        let Some(service) = self.services.read(&name).await? else {
            return Err(FixtureError::NoAddress(name));
        };

        let address = if self.config.in_cluster {
            service
                .spec
                .and_then(|s| s.cluster_ip)
                .filter(|ip| !ip.is_empty() && ip != "None")
        } else {
            external_addresses(&service).into_iter().next()
        };

        address.ok_or(FixtureError::NoAddress(name))
    }

    fn register_teardown(&self, name: &str) {
        let services = Arc::clone(&self.services);
        let name = name.to_string();

        self.teardown.register(format!("service/{name}"), move || {
            async move { delete_quietly::<Service, _>(services.as_ref(), "service", &name).await }
                .boxed()
        });
    }
}

#[async_trait]
impl Fixture for ManagedService {
    async fn create(&self, worker: &WorkerId) -> Result<String, FixtureError> {
        ManagedService::create(self, worker).await
    }

    async fn remove(&self, worker: &WorkerId) -> Result<(), FixtureError> {
        ManagedService::remove(self, worker).await
    }

    fn object_name(&self, worker: &WorkerId) -> Result<String, FixtureError> {
        ManagedService::object_name(self, worker)
    }

    async fn host_ip(&self, worker: &WorkerId) -> Result<String, FixtureError> {
        ManagedService::host_ip(self, worker).await
    }
}
