//! Cluster API boundary
//!
//! Managed resources talk to the cluster only through these traits, so the
//! lifecycle and readiness logic can run against [`KubeClient`] or any other
//! implementation.

mod kubernetes;

pub use kubernetes::{exit_code_from_status, KubeClient};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::AsyncBufRead;
use k8s_openapi::api::core::v1::Pod;
use std::path::Path;
use std::pin::Pin;
use tokio::io::AsyncRead;

/// Message serde produces when a delete response carries a `Status` object
/// where a plain string was expected
pub const DELETE_STATUS_QUIRK: &str = "invalid type: map, expected a string";

/// Errors from the cluster API boundary
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Kubernetes API replied with {code} status code ({reason}): {message}")]
    Api {
        code: u16,
        reason: String,
        message: String,
        /// Raw response body, kept for diagnostics
        body: String,
    },

    #[error("Failed to decode API response: {0}")]
    Decode(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Status code for API rejections
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the API replied 404
    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    /// Whether this is the known delete-response decoding quirk
    ///
    /// Only this exact shape may be swallowed on delete; every other decode
    /// failure is a real error.
    pub fn is_delete_status_quirk(&self) -> bool {
        matches!(self, Self::Decode(message) if message.contains(DELETE_STATUS_QUIRK))
    }
}

/// A change reported by a watch subscription
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    /// Object created or updated
    Applied(K),
    /// Object deleted
    Deleted(K),
}

impl<K: kube::Resource> WatchEvent<K> {
    /// The object snapshot carried by the event
    pub fn object(&self) -> &K {
        match self {
            Self::Applied(obj) | Self::Deleted(obj) => obj,
        }
    }

    /// Name of the object the event is about
    pub fn name(&self) -> Option<&str> {
        self.object().meta().name.as_deref()
    }
}

/// Live watch subscription; dropping it closes the subscription
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, ClientError>>;

/// Live log byte stream of a container
pub type LogStream = Pin<Box<dyn AsyncBufRead + Send>>;

/// Output stream of a remote process
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Result of deleting an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The object was deleted (or deletion started)
    Deleted,
    /// The object did not exist
    NotFound,
}

/// A process started inside a container
pub struct RemoteProcess {
    /// Standard output, if attached
    pub stdout: Option<OutputStream>,
    /// Standard error, if attached
    pub stderr: Option<OutputStream>,
    /// Resolves to the exit code once the process is gone
    pub exit: futures::future::BoxFuture<'static, Result<i32, ClientError>>,
}

impl std::fmt::Debug for RemoteProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProcess")
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish_non_exhaustive()
    }
}

/// Create/read/delete/list/watch for one namespaced resource kind
#[async_trait]
pub trait ResourceClient<K>: Send + Sync {
    /// Namespace all calls are scoped to
    fn namespace(&self) -> &str;

    /// Submit a new object, returning the server's copy
    async fn create(&self, resource: &K) -> Result<K, ClientError>;

    /// Read an object; `None` when it does not exist
    async fn read(&self, name: &str) -> Result<Option<K>, ClientError>;

    /// Delete an object
    async fn delete(&self, name: &str) -> Result<DeleteOutcome, ClientError>;

    /// List objects matching a label selector
    async fn list(&self, label_selector: &str) -> Result<Vec<K>, ClientError>;

    /// Subscribe to changes of every object of this kind in the namespace
    async fn watch(&self) -> Result<WatchStream<K>, ClientError>;
}

/// Pod-only operations
#[async_trait]
pub trait PodClient: ResourceClient<Pod> {
    /// Snapshot of a container's logs
    async fn logs(&self, name: &str, container: Option<&str>) -> Result<String, ClientError>;

    /// Follow a container's logs
    async fn log_stream(&self, name: &str, container: Option<&str>)
        -> Result<LogStream, ClientError>;

    /// Start a command inside a container
    async fn exec(
        &self,
        name: &str,
        container: Option<&str>,
        command: &[String],
    ) -> Result<RemoteProcess, ClientError>;

    /// Copy a local file to an absolute path inside a container
    async fn copy_to_container(
        &self,
        name: &str,
        container: &str,
        local: &Path,
        remote: &Path,
    ) -> Result<(), ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    #[test]
    fn test_delete_quirk_detection() {
        let quirk = ClientError::Decode(format!(
            "{DELETE_STATUS_QUIRK} at line 1 column 1"
        ));
        assert!(quirk.is_delete_status_quirk());

        let other = ClientError::Decode("missing field `metadata`".to_string());
        assert!(!other.is_delete_status_quirk());

        let transport = ClientError::Transport(DELETE_STATUS_QUIRK.to_string());
        assert!(!transport.is_delete_status_quirk());
    }

    #[test]
    fn test_not_found() {
        let err = ClientError::Api {
            code: 404,
            reason: "NotFound".to_string(),
            message: "pods \"x\" not found".to_string(),
            body: "{}".to_string(),
        };
        assert!(err.is_not_found());
        assert_eq!(err.status_code(), Some(404));
        assert!(err.to_string().contains("404"));
        assert!(!ClientError::Watch("gone".to_string()).is_not_found());
    }

    #[test]
    fn test_watch_event_accessors() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let applied = WatchEvent::Applied(pod.clone());
        assert_eq!(applied.name(), Some("web"));
        assert_eq!(applied.object(), &pod);

        let deleted = WatchEvent::Deleted(Pod::default());
        assert_eq!(deleted.name(), None);
    }
}
