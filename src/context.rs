//! Fixture context
//!
//! Bundles what every managed resource needs: the configuration, the cluster
//! clients, a port allocator and the teardown registry. Create one per test
//! process (or per test group), hand out fixtures from it and call
//! [`FixtureContext::shutdown`] at the end.
//!
//! # Example
//!
//! ```ignore
//! use kube_fixtures::{FixtureConfig, FixtureContext, PodTemplate, WaitStrategy, WorkerId};
//!
//! let ctx = FixtureContext::connect(FixtureConfig::from_env()).await?;
//!
//! let rabbit = ctx
//!     .pod(PodTemplate::new("rabbitmq", "rabbitmq:3-management").port(5672).build())
//!     .with_wait(WaitStrategy::log(".*Server startup complete.*"));
//!
//! let worker = WorkerId::current_thread();
//! rabbit.create(&worker).await?;
//! // ... test body ...
//! rabbit.remove(&worker).await?;
//!
//! ctx.shutdown().await;
//! ```

#![allow(clippy::missing_errors_doc)]

use crate::client::{KubeClient, PodClient, ResourceClient};
use crate::config::FixtureConfig;
use crate::ports::PortAllocator;
use crate::resource::{delete_quietly, FixtureError, ManagedPod, ManagedService, FIXTURE_LABEL};
use crate::teardown::{TeardownRegistry, TeardownReport};
use crate::wait::WaitStrategy;
use k8s_openapi::api::core::v1::{Pod, Service};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared state for creating fixtures
#[derive(Clone)]
pub struct FixtureContext {
    config: Arc<FixtureConfig>,
    pods: Arc<dyn PodClient>,
    services: Arc<dyn ResourceClient<Service>>,
    ports: Arc<PortAllocator>,
    teardown: TeardownRegistry,
}

impl std::fmt::Debug for FixtureContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixtureContext")
            .field("config", &self.config)
            .field("teardown", &self.teardown)
            .finish_non_exhaustive()
    }
}

impl FixtureContext {
    /// Connect to the cluster from the inferred kubeconfig
    pub async fn connect(config: FixtureConfig) -> Result<Self, FixtureError> {
        let client = Arc::new(KubeClient::connect(&config).await?);

        info!(namespace = %config.namespace, "Fixture context ready");

        Ok(Self::with_clients(config, client.clone(), client))
    }

    /// Context over explicit client implementations
    pub fn with_clients(
        config: FixtureConfig,
        pods: Arc<dyn PodClient>,
        services: Arc<dyn ResourceClient<Service>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            pods,
            services,
            ports: Arc::new(PortAllocator::new()),
            teardown: TeardownRegistry::new(),
        }
    }

    /// The configuration fixtures are created with
    pub fn config(&self) -> &FixtureConfig {
        &self.config
    }

    /// Port allocator shared by every fixture of this context
    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// The teardown registry fixtures register with
    pub fn teardown(&self) -> &TeardownRegistry {
        &self.teardown
    }

    /// Managed pod waiting for the `Running` phase within the default timeout
    pub fn pod(&self, spec: Pod) -> ManagedPod {
        ManagedPod::new(
            spec,
            Arc::clone(&self.config),
            Arc::clone(&self.pods),
            Arc::clone(&self.services),
            self.teardown.clone(),
        )
        .with_wait(WaitStrategy::running().with_timeout(self.config.default_timeout))
    }

    /// Managed service without a wait strategy
    pub fn service(&self, spec: Service) -> ManagedService {
        ManagedService::new(
            spec,
            Arc::clone(&self.config),
            Arc::clone(&self.services),
            self.teardown.clone(),
        )
    }

    /// Run every registered teardown action, newest first
    pub async fn shutdown(&self) -> TeardownReport {
        self.teardown.run_all().await
    }

    /// Delete fixture pods and services left behind by earlier runs
    ///
    /// Everything carrying the fixture label in the namespace is deleted,
    /// whoever created it. Returns how many objects were deleted.
    pub async fn sweep_leftovers(&self) -> Result<usize, FixtureError> {
        let mut deleted = 0;

        for service in self.services.list(FIXTURE_LABEL).await? {
            if let Some(name) = service.metadata.name {
                delete_quietly::<Service, _>(self.services.as_ref(), "service", &name).await?;
                deleted += 1;
            }
        }

        for pod in self.pods.list(FIXTURE_LABEL).await? {
            if let Some(name) = pod.metadata.name {
                delete_quietly::<Pod, _>(self.pods.as_ref(), "pod", &name).await?;
                deleted += 1;
            }
        }

        if deleted > 0 {
            warn!(
                namespace = %self.pods.namespace(),
                deleted = deleted,
                "Deleted leftover fixtures"
            );
        }

        Ok(deleted)
    }
}
