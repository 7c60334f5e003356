//! Managed fixture resources
//!
//! A managed resource owns the lifecycle of one cluster object used as a
//! test fixture: it assigns a unique name, submits the object, waits for its
//! readiness condition, registers guaranteed teardown and exposes accessors
//! once ready.
//!
//! One definition can be shared by parallel workers. Every operation takes
//! the [`WorkerId`] of the caller and only ever sees the instance that worker
//! created.
//!
//! Flavors (a database image with credentials, a broker with an allocated
//! port) are expressed as [`PodHooks`] / [`ServiceHooks`] rather than new
//! resource types.

mod exec;
mod pod;
mod service;

pub use exec::ExecResult;
pub use pod::{FileMount, ManagedPod};
pub use service::ManagedService;

use crate::client::{ClientError, DeleteOutcome, ResourceClient};
use crate::ports::AllocationError;
use crate::wait::WaitError;
use crate::worker::WorkerId;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Label carried by every fixture object, valued with the object's name
pub const FIXTURE_LABEL: &str = "kube-fixtures";

/// Name prefix of managed pods
pub const POD_NAME_PREFIX: &str = "kube-fixtures-pod-";

/// Name prefix of managed services
pub const SERVICE_NAME_PREFIX: &str = "kube-fixtures-svc-";

/// Errors from managed resources
#[derive(Debug, thiserror::Error)]
pub enum FixtureError {
    #[error("Fixture is not running; call create() first")]
    NotRunning,

    #[error("Fixture is already running as '{0}' for this worker")]
    AlreadyRunning(String),

    #[error("Failed to create {0}")]
    CreationFailed(String),

    #[error("Wait failed: {0}")]
    WaitFailed(#[from] WaitError),

    #[error("Unsupported wait strategy: {0}")]
    UnsupportedStrategy(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Failed to exec in pod: {0}")]
    Exec(String),

    #[error("Failed to copy file: {0}")]
    Copy(String),

    #[error("Fixture '{0}' has no reachable address")]
    NoAddress(String),

    #[error("Kubernetes client error: {0}")]
    Client(#[from] ClientError),

    #[error("Port allocation failed: {0}")]
    Allocation(#[from] AllocationError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle operations shared by every managed resource kind
#[async_trait]
pub trait Fixture: Send + Sync {
    /// Create the resource for `worker` and wait until it is ready
    ///
    /// Returns the generated object name.
    async fn create(&self, worker: &WorkerId) -> Result<String, FixtureError>;

    /// Delete the resource created by `worker`; a no-op when there is none
    async fn remove(&self, worker: &WorkerId) -> Result<(), FixtureError>;

    /// Name of the object created by `worker`
    fn object_name(&self, worker: &WorkerId) -> Result<String, FixtureError>;

    /// Address tests use to reach the resource
    async fn host_ip(&self, worker: &WorkerId) -> Result<String, FixtureError>;
}

/// Extension points around pod creation
///
/// `before_create` runs on the named spec right before submission. The
/// fixture name, namespace and label are reapplied after it.
/// `on_ready` runs once the pod is ready and pending file copies are done.
#[async_trait]
pub trait PodHooks: Send + Sync {
    fn before_create(&self, _pod: &mut Pod, _worker: &WorkerId) -> Result<(), FixtureError> {
        Ok(())
    }

    async fn on_ready(&self, _pod: &ManagedPod, _worker: &WorkerId) -> Result<(), FixtureError> {
        Ok(())
    }
}

/// Extension points around service creation
#[async_trait]
pub trait ServiceHooks: Send + Sync {
    fn before_create(
        &self,
        _service: &mut Service,
        _worker: &WorkerId,
    ) -> Result<(), FixtureError> {
        Ok(())
    }

    async fn on_ready(
        &self,
        _service: &ManagedService,
        _worker: &WorkerId,
    ) -> Result<(), FixtureError> {
        Ok(())
    }
}

/// Hooks that do nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl PodHooks for NoHooks {}
impl ServiceHooks for NoHooks {}

/// `prefix` followed by 8 random hex characters
pub(crate) fn generate_name(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}{}", &id[..8])
}

/// Stamp name, namespace and fixture label onto `meta`, keeping other labels
pub(crate) fn claim(meta: &mut ObjectMeta, name: &str, namespace: &str) {
    meta.name = Some(name.to_string());
    meta.namespace = Some(namespace.to_string());
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .insert(FIXTURE_LABEL.to_string(), name.to_string());
}

/// Remote paths must be absolute and safe to quote in a shell
pub(crate) fn validate_remote_path(path: &Path) -> Result<(), FixtureError> {
    if !path.is_absolute() {
        return Err(FixtureError::InvalidPath(format!(
            "'{}' is not absolute",
            path.display()
        )));
    }

    let rendered = path.to_string_lossy();
    if rendered
        .chars()
        .any(|c| matches!(c, '\'' | ';' | '`' | '$' | '|' | '&' | '\n' | '\r'))
    {
        return Err(FixtureError::InvalidPath(format!(
            "'{rendered}' contains shell metacharacters"
        )));
    }

    Ok(())
}

/// Log the server's diagnostic payload and wrap a failed create call
pub(crate) fn creation_failed(kind: &str, name: &str, err: ClientError) -> FixtureError {
    match &err {
        ClientError::Api { code, body, .. } => {
            error!(
                kind = %kind,
                name = %name,
                code = code,
                body = %body,
                "Kubernetes API rejected create"
            );
        }
        other => {
            error!(kind = %kind, name = %name, error = %other, "Create request failed");
        }
    }

    FixtureError::CreationFailed(format!("{kind} '{name}': {err}"))
}

/// Delete `name`, treating "already gone" and the known delete-status decode
/// quirk as success
pub(crate) async fn delete_quietly<K, C>(
    client: &C,
    kind: &str,
    name: &str,
) -> Result<(), FixtureError>
where
    C: ResourceClient<K> + ?Sized,
{
    match client.delete(name).await {
        Ok(DeleteOutcome::Deleted) => {
            info!(namespace = %client.namespace(), kind = %kind, name = %name, "Deleted");
            Ok(())
        }
        Ok(DeleteOutcome::NotFound) => {
            debug!(kind = %kind, name = %name, "Already gone");
            Ok(())
        }
        Err(e) if e.is_delete_status_quirk() => {
            debug!(kind = %kind, name = %name, error = %e, "Ignoring delete status decode quirk");
            Ok(())
        }
        Err(e) => {
            warn!(kind = %kind, name = %name, error = %e, "Failed to delete");
            Err(e.into())
        }
    }
}
