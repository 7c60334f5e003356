use super::{
    ClientError, DeleteOutcome, LogStream, OutputStream, PodClient, RemoteProcess,
    ResourceClient, WatchEvent, WatchStream,
};
use crate::config::FixtureConfig;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, LogParams, PostParams};
use kube::core::NamespaceResourceScope;
use kube::runtime::watcher;
use kube::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Raw bytes per exec round trip when copying files into a container
const COPY_CHUNK_SIZE: usize = 48 * 1024;

/// Exit code reported when the API signals failure without a code
const UNKNOWN_EXIT_CODE: i32 = -1;

/// One API client per process, built on first use
static SHARED_CLIENT: OnceCell<Client> = OnceCell::const_new();

/// Cluster access through `kube`
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    namespace: String,
}

impl Debug for KubeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClient")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl KubeClient {
    /// Wrap an existing client
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Connect using the inferred kubeconfig, sharing one client per process
    ///
    /// The read timeout is disabled so long-lived watches and log follows are
    /// never cut by the transport; readiness strategies enforce their own
    /// deadlines.
    pub async fn connect(config: &FixtureConfig) -> Result<Self, ClientError> {
        let client = SHARED_CLIENT
            .get_or_try_init(|| build_client(config))
            .await?
            .clone();

        Ok(Self::new(client, config.namespace.clone()))
    }

    /// The underlying kube client
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Run `sh -c script` in a container, failing on a non-zero exit code
    async fn run_shell(
        &self,
        name: &str,
        container: &str,
        script: &str,
        summary: &str,
    ) -> Result<(), ClientError> {
        let command = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        let mut process = self.exec(name, Some(container), &command).await?;

        let stdout = process.stdout.take();
        let stderr = process.stderr.take();

        let drain_stdout = async {
            if let Some(mut out) = stdout {
                tokio::io::copy(&mut out, &mut tokio::io::sink()).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let read_stderr = async {
            let mut buf = Vec::new();
            if let Some(mut err) = stderr {
                err.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(String::from_utf8_lossy(&buf).into_owned())
        };

        let (drained, stderr, code) = tokio::join!(drain_stdout, read_stderr, process.exit);
        drained?;
        let stderr = stderr?;
        let code = code?;

        if code != 0 {
            return Err(ClientError::Transport(format!(
                "{summary} exited with code {code}: {}",
                stderr.trim()
            )));
        }

        Ok(())
    }
}

async fn build_client(config: &FixtureConfig) -> Result<Client, ClientError> {
    let mut kube_config = kube::Config::infer()
        .await
        .map_err(|e| ClientError::Transport(e.to_string()))?;

    // infinite timeout
    kube_config.read_timeout = None;

    if config.disable_http2 {
        // kube's connector only negotiates HTTP/1.1, nothing to switch off
        debug!("HTTP/2 disabled; API connection stays on HTTP/1.1");
    }

    let client = Client::try_from(kube_config).map_err(ClientError::from)?;

    info!(
        namespace = %config.namespace,
        debug = config.debug,
        "Connected to Kubernetes API"
    );

    Ok(client)
}

impl From<kube::Error> for ClientError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) => {
                let body = serde_json::to_string(&response)
                    .unwrap_or_else(|_| response.message.clone());
                ClientError::Api {
                    code: response.code,
                    reason: response.reason.clone(),
                    message: response.message.clone(),
                    body,
                }
            }
            kube::Error::SerdeError(e) => ClientError::Decode(e.to_string()),
            other => ClientError::Transport(other.to_string()),
        }
    }
}

#[async_trait]
impl<K> ResourceClient<K> for KubeClient
where
    K: kube::Resource<Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
    <K as kube::Resource>::DynamicType: Default,
{
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn create(&self, resource: &K) -> Result<K, ClientError> {
        let api: Api<K> = self.api();
        let created = api.create(&PostParams::default(), resource).await?;

        debug!(
            namespace = %self.namespace,
            kind = %K::kind(&Default::default()),
            name = ?created.meta().name,
            "Created resource"
        );

        Ok(created)
    }

    async fn read(&self, name: &str) -> Result<Option<K>, ClientError> {
        let api: Api<K> = self.api();
        Ok(api.get_opt(name).await?)
    }

    async fn delete(&self, name: &str) -> Result<DeleteOutcome, ClientError> {
        let api: Api<K> = self.api();
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(DeleteOutcome::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, label_selector: &str) -> Result<Vec<K>, ClientError> {
        let api: Api<K> = self.api();
        let list = api.list(&ListParams::default().labels(label_selector)).await?;
        Ok(list.items)
    }

    async fn watch(&self) -> Result<WatchStream<K>, ClientError> {
        let api: Api<K> = self.api();

        debug!(
            namespace = %self.namespace,
            kind = %K::kind(&Default::default()),
            "Starting watch"
        );

        let stream = watcher::watcher(api, watcher::Config::default())
            .filter_map(|event| async move {
                match event {
                    Ok(watcher::Event::Apply(obj) | watcher::Event::InitApply(obj)) => {
                        Some(Ok(WatchEvent::Applied(obj)))
                    }
                    Ok(watcher::Event::Delete(obj)) => Some(Ok(WatchEvent::Deleted(obj))),
                    Ok(watcher::Event::Init | watcher::Event::InitDone) => None,
                    Err(e) => Some(Err(ClientError::Watch(e.to_string()))),
                }
            })
            .boxed();

        Ok(stream)
    }
}

#[async_trait]
impl PodClient for KubeClient {
    async fn logs(&self, name: &str, container: Option<&str>) -> Result<String, ClientError> {
        let pods: Api<Pod> = self.api();
        let params = LogParams {
            container: container.map(ToString::to_string),
            ..Default::default()
        };

        Ok(pods.logs(name, &params).await?)
    }

    async fn log_stream(
        &self,
        name: &str,
        container: Option<&str>,
    ) -> Result<LogStream, ClientError> {
        let pods: Api<Pod> = self.api();
        let params = LogParams {
            container: container.map(ToString::to_string),
            follow: true,
            ..Default::default()
        };

        debug!(namespace = %self.namespace, pod = %name, "Starting log stream");

        let stream = pods.log_stream(name, &params).await?;
        Ok(Box::pin(stream))
    }

    async fn exec(
        &self,
        name: &str,
        container: Option<&str>,
        command: &[String],
    ) -> Result<RemoteProcess, ClientError> {
        let pods: Api<Pod> = self.api();

        let mut params = AttachParams::default()
            .stdin(false)
            .stdout(true)
            .stderr(true);
        if let Some(container) = container {
            params = params.container(container);
        }

        let mut attached = pods.exec(name, command.to_vec(), &params).await?;

        debug!(
            namespace = %self.namespace,
            pod = %name,
            command = ?command,
            "Started command in pod"
        );

        let stdout = attached.stdout().map(|s| Box::new(s) as OutputStream);
        let stderr = attached.stderr().map(|s| Box::new(s) as OutputStream);
        let status = attached.take_status();

        let exit = async move {
            let status = match status {
                Some(status) => status.await,
                None => None,
            };
            attached
                .join()
                .await
                .map_err(|e| ClientError::Transport(e.to_string()))?;

            status.as_ref().map(exit_code_from_status).ok_or_else(|| {
                ClientError::Transport("exec finished without reporting a status".to_string())
            })
        }
        .boxed();

        Ok(RemoteProcess {
            stdout,
            stderr,
            exit,
        })
    }

    async fn copy_to_container(
        &self,
        name: &str,
        container: &str,
        local: &Path,
        remote: &Path,
    ) -> Result<(), ClientError> {
        let dest = shell_safe_path(remote)?;
        let parent = remote
            .parent()
            .map(shell_safe_path)
            .transpose()?
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/".to_string());

        let bytes = tokio::fs::read(local).await?;

        self.run_shell(
            name,
            container,
            &format!("mkdir -p '{parent}' && : > '{dest}'"),
            &format!("preparing {dest}"),
        )
        .await?;

        for chunk in bytes.chunks(COPY_CHUNK_SIZE) {
            let encoded = STANDARD.encode(chunk);
            self.run_shell(
                name,
                container,
                &format!("printf '%s' '{encoded}' | base64 -d >> '{dest}'"),
                &format!("writing {dest}"),
            )
            .await?;
        }

        debug!(
            namespace = %self.namespace,
            pod = %name,
            container = %container,
            local = %local.display(),
            remote = %dest,
            bytes = bytes.len(),
            "Copied file into container"
        );

        Ok(())
    }
}

/// Render a path for single-quoted shell use, rejecting anything that could
/// break out of the quotes
fn shell_safe_path(path: &Path) -> Result<String, ClientError> {
    let rendered = path.to_string_lossy().to_string();
    if rendered
        .chars()
        .any(|c| matches!(c, '\'' | ';' | '`' | '$' | '|' | '&' | '\n' | '\r'))
    {
        return Err(ClientError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid path '{rendered}': contains shell metacharacters"),
        )));
    }
    Ok(rendered)
}

/// Exit code carried by the `Status` an exec session ends with
///
/// `Success` maps to 0, a `NonZeroExitCode` status to the code in its
/// `ExitCode` cause, anything else to -1.
pub fn exit_code_from_status(status: &Status) -> i32 {
    if status.status.as_deref() == Some("Success") {
        return 0;
    }

    status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|c| c.message.as_deref())
        .and_then(|m| m.trim().parse().ok())
        .unwrap_or(UNKNOWN_EXIT_CODE)
}
