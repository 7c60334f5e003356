//! In-memory cluster for unit tests
//!
//! Implements the client traits against plain maps. Every call is recorded
//! as a short string (`"create pod <name>"`, `"watch pod"`, ...) so tests can
//! assert on what reached the API.

use crate::client::{
    ClientError, DeleteOutcome, LogStream, PodClient, RemoteProcess, ResourceClient, WatchEvent,
    WatchStream,
};
use async_trait::async_trait;
use futures::{FutureExt, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{
    Container, ContainerStatus, LoadBalancerIngress, LoadBalancerStatus, Pod, PodSpec, PodStatus,
    Service, ServiceSpec, ServiceStatus,
};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::Mutex;

/// Node IP reported by scripted pod statuses
pub(crate) const FAKE_HOST_IP: &str = "192.168.49.2";

/// Cluster IP assigned to created services
pub(crate) const FAKE_CLUSTER_IP: &str = "10.96.0.10";

/// Pod status with a phase and (name, ready) container statuses
pub(crate) fn pod_status(phase: &str, containers: &[(&str, bool)]) -> PodStatus {
    PodStatus {
        phase: Some(phase.to_string()),
        host_ip: Some(FAKE_HOST_IP.to_string()),
        container_statuses: if containers.is_empty() {
            None
        } else {
            Some(
                containers
                    .iter()
                    .map(|(name, ready)| ContainerStatus {
                        name: (*name).to_string(),
                        ready: *ready,
                        ..Default::default()
                    })
                    .collect(),
            )
        },
        ..Default::default()
    }
}

fn named(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        ..Default::default()
    }
}

struct FakeState {
    calls: Vec<String>,
    pods: BTreeMap<String, Pod>,
    services: BTreeMap<String, Service>,
    statuses: Vec<Option<PodStatus>>,
    delete_after_statuses: bool,
    close_watch: bool,
    log_lines: Vec<String>,
    close_logs: bool,
    exec_output: (String, String, i32),
    delete_decode_error: Option<String>,
    create_error: Option<(u16, String)>,
    external_ip: Option<(usize, String)>,
    service_reads: usize,
    copied: BTreeMap<String, String>,
}

pub(crate) struct FakeCluster {
    namespace: String,
    state: Mutex<FakeState>,
}

impl FakeCluster {
    /// Pods go `Running` with their `main` container ready right away
    pub(crate) fn new() -> Self {
        Self {
            namespace: "default".to_string(),
            state: Mutex::new(FakeState {
                calls: Vec::new(),
                pods: BTreeMap::new(),
                services: BTreeMap::new(),
                statuses: vec![Some(pod_status("Running", &[("main", true)]))],
                delete_after_statuses: false,
                close_watch: false,
                log_lines: Vec::new(),
                close_logs: false,
                exec_output: (String::new(), String::new(), 0),
                delete_decode_error: None,
                create_error: None,
                external_ip: None,
                service_reads: 0,
                copied: BTreeMap::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn record(&self, call: String) {
        self.state().calls.push(call);
    }

    /// Statuses every pod goes through on the watch stream, in order
    pub(crate) fn with_statuses(self, statuses: Vec<PodStatus>) -> Self {
        self.with_status_events(statuses.into_iter().map(Some).collect())
    }

    /// Like `with_statuses`, allowing events without any status
    pub(crate) fn with_status_events(self, statuses: Vec<Option<PodStatus>>) -> Self {
        self.state().statuses = statuses;
        self
    }

    /// Emit a delete event after the scripted statuses
    pub(crate) fn delete_after_statuses(self) -> Self {
        self.state().delete_after_statuses = true;
        self
    }

    /// End watch streams after the scripted events instead of holding them open
    pub(crate) fn close_watch(self) -> Self {
        self.state().close_watch = true;
        self
    }

    pub(crate) fn with_log_lines(self, lines: &[&str]) -> Self {
        self.state().log_lines = lines.iter().map(|l| (*l).to_string()).collect();
        self
    }

    /// End log streams after the scripted lines instead of following forever
    pub(crate) fn close_logs(self) -> Self {
        self.state().close_logs = true;
        self
    }

    pub(crate) fn with_exec_output(self, stdout: &str, stderr: &str, exit_code: i32) -> Self {
        self.state().exec_output = (stdout.to_string(), stderr.to_string(), exit_code);
        self
    }

    /// Every delete fails to decode with `message`
    pub(crate) fn with_delete_decode_error(self, message: &str) -> Self {
        self.state().delete_decode_error = Some(message.to_string());
        self
    }

    /// Every create is rejected with `code`
    pub(crate) fn with_create_error(self, code: u16, reason: &str) -> Self {
        self.state().create_error = Some((code, reason.to_string()));
        self
    }

    /// Service reads report `ip` once `reads` reads have gone by without it
    pub(crate) fn with_external_ip_after(self, reads: usize, ip: &str) -> Self {
        self.state().external_ip = Some((reads, ip.to_string()));
        self
    }

    /// Store a pod with a `main` container without recording a call
    pub(crate) fn seed_pod(&self, name: &str) {
        let pod = Pod {
            metadata: named(name),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "main".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };
        self.state().pods.insert(name.to_string(), pod);
    }

    /// Store a load balancer service without recording a call
    pub(crate) fn seed_service(&self, name: &str) {
        let service = Service {
            metadata: named(name),
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                cluster_ip: Some(FAKE_CLUSTER_IP.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.state().services.insert(name.to_string(), service);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub(crate) fn pod(&self, name: &str) -> Option<Pod> {
        self.state().pods.get(name).cloned()
    }

    pub(crate) fn service(&self, name: &str) -> Option<Service> {
        self.state().services.get(name).cloned()
    }

    /// Contents copied to `remote`, in any pod
    pub(crate) fn copied(&self, remote: &str) -> Option<String> {
        self.state().copied.get(remote).cloned()
    }

    fn with_last_status(&self, mut pod: Pod) -> Pod {
        pod.status = self.state().statuses.last().cloned().flatten();
        pod
    }

    fn hold_open<T: Send + 'static>(
        items: Vec<T>,
        close: bool,
    ) -> futures::stream::BoxStream<'static, T> {
        let stream = futures::stream::iter(items);
        if close {
            stream.boxed()
        } else {
            stream.chain(futures::stream::pending()).boxed()
        }
    }
}

fn matches_selector(meta: &ObjectMeta, selector: &str) -> bool {
    let labels = meta.labels.clone().unwrap_or_default();
    match selector.split_once('=') {
        Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
        None => labels.contains_key(selector),
    }
}

#[async_trait]
impl ResourceClient<Pod> for FakeCluster {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn create(&self, pod: &Pod) -> Result<Pod, ClientError> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.record(format!("create pod {name}"));

        if let Some((code, reason)) = self.state().create_error.clone() {
            return Err(ClientError::Api {
                code,
                reason,
                message: format!("pods \"{name}\" is invalid"),
                body: format!("{{\"kind\":\"Status\",\"code\":{code}}}"),
            });
        }

        self.state().pods.insert(name, pod.clone());
        Ok(pod.clone())
    }

    async fn read(&self, name: &str) -> Result<Option<Pod>, ClientError> {
        self.record(format!("read pod {name}"));
        let pod = self.pod(name);
        Ok(pod.map(|p| self.with_last_status(p)))
    }

    async fn delete(&self, name: &str) -> Result<DeleteOutcome, ClientError> {
        self.record(format!("delete pod {name}"));
        let mut state = self.state();
        if let Some(message) = state.delete_decode_error.clone() {
            state.pods.remove(name);
            return Err(ClientError::Decode(message));
        }
        Ok(match state.pods.remove(name) {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::NotFound,
        })
    }

    async fn list(&self, label_selector: &str) -> Result<Vec<Pod>, ClientError> {
        self.record(format!("list pod {label_selector}"));
        Ok(self
            .state()
            .pods
            .values()
            .filter(|p| matches_selector(&p.metadata, label_selector))
            .cloned()
            .collect())
    }

    async fn watch(&self) -> Result<WatchStream<Pod>, ClientError> {
        self.record("watch pod".to_string());
        let state = self.state();

        // An unrelated pod that is already running
        let mut events = vec![WatchEvent::Applied(Pod {
            metadata: named("unrelated-pod"),
            status: Some(pod_status("Running", &[("main", true)])),
            ..Default::default()
        })];

        for pod in state.pods.values() {
            for status in &state.statuses {
                let mut snapshot = pod.clone();
                snapshot.status = status.clone();
                events.push(WatchEvent::Applied(snapshot));
            }
            if state.delete_after_statuses {
                events.push(WatchEvent::Deleted(pod.clone()));
            }
        }

        let events = events.into_iter().map(Ok).collect();
        Ok(Self::hold_open(events, state.close_watch))
    }
}

#[async_trait]
impl PodClient for FakeCluster {
    async fn logs(&self, name: &str, container: Option<&str>) -> Result<String, ClientError> {
        self.record(format!("logs {name} {}", container.unwrap_or("-")));
        Ok(self
            .state()
            .log_lines
            .iter()
            .map(|l| format!("{l}\n"))
            .collect())
    }

    async fn log_stream(
        &self,
        name: &str,
        container: Option<&str>,
    ) -> Result<LogStream, ClientError> {
        self.record(format!("log_stream {name} {}", container.unwrap_or("-")));
        let state = self.state();

        let chunks: Vec<std::io::Result<Vec<u8>>> = state
            .log_lines
            .iter()
            .map(|l| Ok(format!("{l}\n").into_bytes()))
            .collect();

        Ok(Box::pin(
            Self::hold_open(chunks, state.close_logs).into_async_read(),
        ))
    }

    async fn exec(
        &self,
        name: &str,
        container: Option<&str>,
        command: &[String],
    ) -> Result<RemoteProcess, ClientError> {
        self.record(format!(
            "exec {name} {} {}",
            container.unwrap_or("-"),
            command.join(" ")
        ));
        let (stdout, stderr, code) = self.state().exec_output.clone();

        Ok(RemoteProcess {
            stdout: Some(Box::new(Cursor::new(stdout.into_bytes()))),
            stderr: Some(Box::new(Cursor::new(stderr.into_bytes()))),
            exit: async move { Ok(code) }.boxed(),
        })
    }

    async fn copy_to_container(
        &self,
        name: &str,
        container: &str,
        local: &Path,
        remote: &Path,
    ) -> Result<(), ClientError> {
        self.record(format!("copy {name} {container} {}", remote.display()));
        let contents = tokio::fs::read_to_string(local).await?;
        self.state()
            .copied
            .insert(remote.display().to_string(), contents);
        Ok(())
    }
}

#[async_trait]
impl ResourceClient<Service> for FakeCluster {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn create(&self, service: &Service) -> Result<Service, ClientError> {
        let name = service.metadata.name.clone().unwrap_or_default();
        self.record(format!("create service {name}"));

        if let Some((code, reason)) = self.state().create_error.clone() {
            return Err(ClientError::Api {
                code,
                reason,
                message: format!("services \"{name}\" is invalid"),
                body: format!("{{\"kind\":\"Status\",\"code\":{code}}}"),
            });
        }

        let mut created = service.clone();
        if let Some(spec) = created.spec.as_mut() {
            spec.cluster_ip = Some(FAKE_CLUSTER_IP.to_string());
            for port in spec.ports.iter_mut().flatten() {
                port.node_port = Some(port.port + 30000);
            }
        }

        self.state().services.insert(name, created.clone());
        Ok(created)
    }

    async fn read(&self, name: &str) -> Result<Option<Service>, ClientError> {
        self.record(format!("read service {name}"));
        let mut state = self.state();
        state.service_reads += 1;
        let reads = state.service_reads;

        let Some(mut service) = state.services.get(name).cloned() else {
            return Ok(None);
        };

        if let Some((after, ip)) = &state.external_ip {
            if reads > *after {
                service.status = Some(ServiceStatus {
                    load_balancer: Some(LoadBalancerStatus {
                        ingress: Some(vec![LoadBalancerIngress {
                            ip: Some(ip.clone()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
            }
        }

        Ok(Some(service))
    }

    async fn delete(&self, name: &str) -> Result<DeleteOutcome, ClientError> {
        self.record(format!("delete service {name}"));
        let mut state = self.state();
        if let Some(message) = state.delete_decode_error.clone() {
            state.services.remove(name);
            return Err(ClientError::Decode(message));
        }
        Ok(match state.services.remove(name) {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::NotFound,
        })
    }

    async fn list(&self, label_selector: &str) -> Result<Vec<Service>, ClientError> {
        self.record(format!("list service {label_selector}"));
        Ok(self
            .state()
            .services
            .values()
            .filter(|s| matches_selector(&s.metadata, label_selector))
            .cloned()
            .collect())
    }

    async fn watch(&self) -> Result<WatchStream<Service>, ClientError> {
        self.record("watch service".to_string());
        let state = self.state();
        let events = state
            .services
            .values()
            .cloned()
            .map(|s| Ok(WatchEvent::Applied(s)))
            .collect();
        Ok(Self::hold_open(events, state.close_watch))
    }
}
