//! Managed pods

use super::{
    claim, creation_failed, delete_quietly, generate_name, validate_remote_path, ExecResult,
    Fixture, FixtureError, NoHooks, PodHooks, FIXTURE_LABEL, POD_NAME_PREFIX,
};
use crate::client::{LogStream, PodClient, ResourceClient};
use crate::config::FixtureConfig;
use crate::teardown::TeardownRegistry;
use crate::template::ServiceTemplate;
use crate::wait::{wait_for_pod, Deadline, WaitStrategy};
use crate::worker::{WorkerId, WorkerMap};
use async_trait::async_trait;
use futures::FutureExt;
use k8s_openapi::api::core::v1::{ContainerPort, LocalObjectReference, Pod, Service};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// A local file copied into a container once the pod is ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMount {
    /// Target container
    pub container: String,
    /// Local file
    pub source: PathBuf,
    /// Absolute path inside the container
    pub destination: PathBuf,
}

/// What one worker created
#[derive(Debug, Clone)]
struct PodInstance {
    name: String,
    pod: Pod,
    port_service: Option<String>,
    mapped_ports: BTreeMap<u16, u16>,
}

/// A pod used as a test fixture
///
/// # Example
///
/// ```ignore
/// let postgres = ctx
///     .pod(PodTemplate::new("postgres", "postgres:16").port(5432).build())
///     .with_wait(WaitStrategy::log(".*ready to accept connections.*").times(2));
///
/// let worker = WorkerId::current_thread();
/// postgres.create(&worker).await?;
/// let port = postgres.mapped_ports(&worker)?[&5432];
/// postgres.remove(&worker).await?;
/// ```
pub struct ManagedPod {
    spec: Pod,
    config: Arc<FixtureConfig>,
    pods: Arc<dyn PodClient>,
    services: Arc<dyn ResourceClient<Service>>,
    teardown: TeardownRegistry,
    wait: Option<WaitStrategy>,
    mounts: Vec<FileMount>,
    hooks: Arc<dyn PodHooks>,
    instances: WorkerMap<PodInstance>,
}

impl fmt::Debug for ManagedPod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedPod")
            .field("namespace", &self.pods.namespace())
            .field("wait", &self.wait)
            .field("mounts", &self.mounts)
            .field("running", &self.instances.len())
            .finish_non_exhaustive()
    }
}

impl ManagedPod {
    /// Managed pod created from `spec`, without a wait strategy
    pub fn new(
        spec: Pod,
        config: Arc<FixtureConfig>,
        pods: Arc<dyn PodClient>,
        services: Arc<dyn ResourceClient<Service>>,
        teardown: TeardownRegistry,
    ) -> Self {
        Self {
            spec,
            config,
            pods,
            services,
            teardown,
            wait: None,
            mounts: Vec::new(),
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

    /// Return from `create` as soon as the pod is accepted
    #[must_use]
    pub fn without_wait(mut self) -> Self {
        self.wait = None;
        self
    }

    /// Install creation hooks
    #[must_use]
    pub fn with_hooks(mut self, hooks: impl PodHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Copy `source` to `destination` in `container` once the pod is ready
    #[must_use]
    pub fn with_copy_file_to_container(
        mut self,
        container: impl Into<String>,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        self.mounts.push(FileMount {
            container: container.into(),
            source: source.into(),
            destination: destination.into(),
        });
        self
    }

    /// The spec pods are created from
    pub fn spec(&self) -> &Pod {
        &self.spec
    }

    /// The attached wait strategy
    pub fn wait_strategy(&self) -> Option<&WaitStrategy> {
        self.wait.as_ref()
    }

    /// File copies applied after readiness, in order
    pub fn pending_mounts(&self) -> &[FileMount] {
        &self.mounts
    }

    /// Create the pod for `worker`, wait for readiness and apply file copies
    ///
    /// Teardown is registered as soon as the cluster accepted the pod, so a
    /// pod that never becomes ready is still deleted by the registry. A
    /// failed create leaves the worker's instance in place for `remove`.
    pub async fn create(&self, worker: &WorkerId) -> Result<String, FixtureError> {
        if let Some(name) = self.instances.with(worker, |i| i.name.clone()) {
            return Err(FixtureError::AlreadyRunning(name));
        }

        let started = Instant::now();
        let name = generate_name(POD_NAME_PREFIX);
        let pod = self.prepare(&name, worker)?;

        info!(
            namespace = %self.pods.namespace(),
            pod = %name,
            worker = %worker,
            "Creating pod"
        );

        let created = self
            .pods
            .create(&pod)
            .await
            .map_err(|e| creation_failed("pod", &name, e))?;

        self.register_teardown(&name);
        self.instances.insert(
            worker,
            PodInstance {
                name: name.clone(),
                pod: created.clone(),
                port_service: None,
                mapped_ports: BTreeMap::new(),
            },
        );

        if self.config.use_port_service {
            if let Some(mapped) = self.create_port_service(&name, &created).await? {
                self.instances.with_mut(worker, |i| {
                    i.port_service = Some(name.clone());
                    i.mapped_ports = mapped;
                });
            }
        }

        if let Some(strategy) = &self.wait {
            let events = self.pods.watch().await?;
            let deadline = Deadline::new(started, strategy.timeout());

            if let Err(e) =
                wait_for_pod(self.pods.as_ref(), &name, strategy, events, &deadline).await
            {
                error!(
                    namespace = %self.pods.namespace(),
                    pod = %name,
                    error = %e,
                    "Pod did not become ready"
                );
                return Err(e);
            }

            if let Some(current) = self.pods.read(&name).await? {
                self.instances.with_mut(worker, |i| i.pod = current);
            }
        }

        for mount in &self.mounts {
            self.copy_into(&name, &mount.container, &mount.source, &mount.destination)
                .await?;
        }

        self.hooks.on_ready(self, worker).await?;

        info!(
            namespace = %self.pods.namespace(),
            pod = %name,
            elapsed = ?started.elapsed(),
            "Pod created"
        );

        Ok(name)
    }

    /// Delete the pod (and its port service) created by `worker`
    ///
    /// A no-op without any API call when `worker` has nothing running.
    pub async fn remove(&self, worker: &WorkerId) -> Result<(), FixtureError> {
        let Some(instance) = self.instances.remove(worker) else {
            debug!(worker = %worker, "No pod to remove");
            return Ok(());
        };

        info!(
            namespace = %self.pods.namespace(),
            pod = %instance.name,
            "Removing pod"
        );

        let service_result = match &instance.port_service {
            Some(service) => {
                delete_quietly::<Service, _>(self.services.as_ref(), "service", service).await
            }
            None => Ok(()),
        };
        delete_quietly::<Pod, _>(self.pods.as_ref(), "pod", &instance.name).await?;

        service_result
    }

    /// Name of the pod created by `worker`
    pub fn object_name(&self, worker: &WorkerId) -> Result<String, FixtureError> {
        self.instances
            .with(worker, |i| i.name.clone())
            .ok_or(FixtureError::NotRunning)
    }

    /// Latest snapshot of the pod created by `worker`
    pub fn created(&self, worker: &WorkerId) -> Result<Pod, FixtureError> {
        self.instances
            .with(worker, |i| i.pod.clone())
            .ok_or(FixtureError::NotRunning)
    }

    /// Container port to node port, filled when a port service was created
    pub fn mapped_ports(&self, worker: &WorkerId) -> Result<BTreeMap<u16, u16>, FixtureError> {
        self.instances
            .with(worker, |i| i.mapped_ports.clone())
            .ok_or(FixtureError::NotRunning)
    }

    /// IP of the node running the pod
    pub async fn host_ip(&self, worker: &WorkerId) -> Result<String, FixtureError> {
        let name = self.object_name(worker)?;

        self.pods
            .read(&name)
            .await?
            .and_then(|pod| pod.status)
            .and_then(|status| status.host_ip)
            .ok_or(FixtureError::NoAddress(name))
    }

    /// Snapshot of a container's logs (the default container when `None`)
    pub async fn logs(
        &self,
        worker: &WorkerId,
        container: Option<&str>,
    ) -> Result<String, FixtureError> {
        let name = self.object_name(worker)?;
        Ok(self.pods.logs(&name, container).await?)
    }

    /// Follow a container's logs
    pub async fn log_stream(
        &self,
        worker: &WorkerId,
        container: Option<&str>,
    ) -> Result<LogStream, FixtureError> {
        let name = self.object_name(worker)?;
        Ok(self.pods.log_stream(&name, container).await?)
    }

    /// Run `command` in the primary container and capture its output
    pub async fn exec_in_pod(
        &self,
        worker: &WorkerId,
        command: &[&str],
    ) -> Result<ExecResult, FixtureError> {
        let container = self.primary_container();
        self.exec_in_container(worker, container.as_deref(), command)
            .await
    }

    /// Run `command` in `container` and capture its output
    pub async fn exec_in_container(
        &self,
        worker: &WorkerId,
        container: Option<&str>,
        command: &[&str],
    ) -> Result<ExecResult, FixtureError> {
        let name = self.object_name(worker)?;
        let command: Vec<String> = command.iter().map(|s| (*s).to_string()).collect();

        debug!(
            namespace = %self.pods.namespace(),
            pod = %name,
            container = ?container,
            command = ?command,
            "Executing command"
        );

        let process = self
            .pods
            .exec(&name, container, &command)
            .await
            .map_err(|e| FixtureError::Exec(format!("{name}: {e}")))?;

        ExecResult::capture(process).await
    }

    /// Copy a local file into a container of the running pod now
    pub async fn copy_file_to_container(
        &self,
        worker: &WorkerId,
        container: &str,
        source: &Path,
        destination: &Path,
    ) -> Result<(), FixtureError> {
        let name = self.object_name(worker)?;
        self.copy_into(&name, container, source, destination).await
    }

    fn primary_container(&self) -> Option<String> {
        self.spec
            .spec
            .as_ref()
            .and_then(|s| s.containers.first())
            .map(|c| c.name.clone())
    }

    /// Named, labelled copy of the spec with config and hooks applied
    ///
    /// The hook sees the assigned name. Name, namespace and fixture label are
    /// set again after it runs, so a hook replacing the metadata cannot detach
    /// the pod from its port service or from `sweep_leftovers`.
    fn prepare(&self, name: &str, worker: &WorkerId) -> Result<Pod, FixtureError> {
        let namespace = self.pods.namespace();
        let mut pod = self.spec.clone();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some(namespace.to_string());

        if let Some(spec) = pod.spec.as_mut() {
            if !self.config.pull_secrets.is_empty() {
                spec.image_pull_secrets
                    .get_or_insert_with(Vec::new)
                    .extend(self.config.pull_secrets.iter().map(|secret| {
                        LocalObjectReference {
                            name: secret.clone(),
                        }
                    }));
            }
        }

        self.hooks.before_create(&mut pod, worker)?;
        claim(&mut pod.metadata, name, namespace);

        // The port service publishes the ports; keep only the bare container ports
        if self.config.use_port_service {
            for port in pod
                .spec
                .iter_mut()
                .flat_map(|s| s.containers.iter_mut())
                .filter_map(|c| c.ports.as_mut())
                .flatten()
            {
                *port = ContainerPort {
                    container_port: port.container_port,
                    ..Default::default()
                };
            }
        }

        Ok(pod)
    }

    /// NodePort service selecting the pod, named like it
    ///
    /// Returns container port to node port, or `None` when the pod exposes no
    /// ports.
    async fn create_port_service(
        &self,
        name: &str,
        pod: &Pod,
    ) -> Result<Option<BTreeMap<u16, u16>>, FixtureError> {
        let ports = container_ports(pod);
        if ports.is_empty() {
            debug!(pod = %name, "Pod exposes no ports, skipping port service");
            return Ok(None);
        }

        let mut template = ServiceTemplate::new()
            .selector(FIXTURE_LABEL, name)
            .node_port();
        for port in &ports {
            template = template.port(*port, *port);
        }

        let mut service = template.build();
        service.metadata.name = Some(name.to_string());
        service.metadata.namespace = Some(self.services.namespace().to_string());
        service.metadata.labels = Some(BTreeMap::from([(
            FIXTURE_LABEL.to_string(),
            name.to_string(),
        )]));

        let created = self
            .services
            .create(&service)
            .await
            .map_err(|e| creation_failed("service", name, e))?;

        let mapped = node_ports(&created);
        debug!(
            namespace = %self.services.namespace(),
            service = %name,
            ports = ?mapped,
            "Created port service"
        );

        Ok(Some(mapped))
    }

    async fn copy_into(
        &self,
        name: &str,
        container: &str,
        source: &Path,
        destination: &Path,
    ) -> Result<(), FixtureError> {
        validate_remote_path(destination)?;

        self.pods
            .copy_to_container(name, container, source, destination)
            .await
            .map_err(|e| {
                FixtureError::Copy(format!(
                    "{} -> {name}/{container}:{}: {e}",
                    source.display(),
                    destination.display()
                ))
            })?;

        debug!(
            pod = %name,
            container = %container,
            source = %source.display(),
            destination = %destination.display(),
            "Copied file into container"
        );

        Ok(())
    }

    fn register_teardown(&self, name: &str) {
        let pods = Arc::clone(&self.pods);
        let services = Arc::clone(&self.services);
        let with_service = self.config.use_port_service;
        let name = name.to_string();

        self.teardown.register(format!("pod/{name}"), move || {
            async move {
                let service_result = if with_service {
                    delete_quietly::<Service, _>(services.as_ref(), "service", &name).await
                } else {
                    Ok(())
                };
                delete_quietly::<Pod, _>(pods.as_ref(), "pod", &name).await?;
                service_result
            }
            .boxed()
        });
    }
}

#[async_trait]
impl Fixture for ManagedPod {
    async fn create(&self, worker: &WorkerId) -> Result<String, FixtureError> {
        ManagedPod::create(self, worker).await
    }

    async fn remove(&self, worker: &WorkerId) -> Result<(), FixtureError> {
        ManagedPod::remove(self, worker).await
    }

    fn object_name(&self, worker: &WorkerId) -> Result<String, FixtureError> {
        ManagedPod::object_name(self, worker)
    }

    async fn host_ip(&self, worker: &WorkerId) -> Result<String, FixtureError> {
        ManagedPod::host_ip(self, worker).await
    }
}

fn container_ports(pod: &Pod) -> Vec<u16> {
    let mut ports: Vec<u16> = pod
        .spec
        .iter()
        .flat_map(|s| s.containers.iter())
        .filter_map(|c| c.ports.as_ref())
        .flatten()
        .filter_map(|p| u16::try_from(p.container_port).ok())
        .filter(|p| *p > 0)
        .collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}

fn node_ports(service: &Service) -> BTreeMap<u16, u16> {
    service
        .spec
        .iter()
        .filter_map(|s| s.ports.as_ref())
        .flatten()
        .filter_map(|p| {
            let port = u16::try_from(p.port).ok()?;
            let node_port = u16::try_from(p.node_port?).ok()?;
            Some((port, node_port))
        })
        .collect()
}
