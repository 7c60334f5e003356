//! Resource templates for fixtures
//!
//! Small fluent builders producing the `Pod` / `Service` specifications that
//! managed resources are created from. Names are left empty - a managed
//! resource assigns a unique one at creation.
//!
//! # Example
//!
//! ```
//! use kube_fixtures::template::{PodTemplate, ServiceTemplate};
//!
//! let pod = PodTemplate::new("nginx", "nginx:1.27")
//!     .port(80)
//!     .env("LOG_LEVEL", "debug")
//!     .build();
//!
//! let svc = ServiceTemplate::new()
//!     .selector("app", "nginx")
//!     .port(80, 80)
//!     .load_balancer()
//!     .build();
//! # let _ = (pod, svc);
//! ```

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, Pod, PodSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

/// Builder for a single-container pod specification
#[derive(Debug, Clone)]
pub struct PodTemplate {
    container: String,
    image: String,
    command: Vec<String>,
    args: Vec<String>,
    env: Vec<(String, String)>,
    labels: BTreeMap<String, String>,
    ports: Vec<(i32, Option<i32>)>,
    restart_policy: Option<String>,
}

impl PodTemplate {
    /// Pod with one container named `container` running `image`
    #[must_use]
    pub fn new(container: &str, image: &str) -> Self {
        Self {
            container: container.to_string(),
            image: image.to_string(),
            command: Vec::new(),
            args: Vec::new(),
            env: Vec::new(),
            labels: BTreeMap::new(),
            ports: Vec::new(),
            restart_policy: Some("Never".to_string()),
        }
    }

    /// Set the container command
    #[must_use]
    pub fn command(mut self, cmd: &[&str]) -> Self {
        self.command = cmd.iter().map(|s| (*s).to_string()).collect();
        self
    }

    /// Set the container args
    #[must_use]
    pub fn args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|s| (*s).to_string()).collect();
        self
    }

    /// Add an environment variable
    #[must_use]
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Add a label
    #[must_use]
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Expose a container port
    #[must_use]
    pub fn port(mut self, container_port: u16) -> Self {
        self.ports.push((i32::from(container_port), None));
        self
    }

    /// Expose a container port on a host port of the node
    #[must_use]
    pub fn host_port(mut self, container_port: u16, host_port: u16) -> Self {
        self.ports
            .push((i32::from(container_port), Some(i32::from(host_port))));
        self
    }

    /// Set the pod restart policy (default `Never`)
    #[must_use]
    pub fn restart_policy(mut self, policy: &str) -> Self {
        self.restart_policy = Some(policy.to_string());
        self
    }

    /// Build the Pod specification
    #[must_use]
    pub fn build(&self) -> Pod {
        let env: Vec<EnvVar> = self
            .env
            .iter()
            .map(|(k, v)| EnvVar {
                name: k.clone(),
                value: Some(v.clone()),
                ..Default::default()
            })
            .collect();

        let ports: Vec<ContainerPort> = self
            .ports
            .iter()
            .map(|(container_port, host_port)| ContainerPort {
                container_port: *container_port,
                host_port: *host_port,
                ..Default::default()
            })
            .collect();

        let container = Container {
            name: self.container.clone(),
            image: Some(self.image.clone()),
            command: non_empty(self.command.clone()),
            args: non_empty(self.args.clone()),
            env: non_empty(env),
            ports: non_empty(ports),
            ..Default::default()
        };

        Pod {
            metadata: ObjectMeta {
                labels: if self.labels.is_empty() {
                    None
                } else {
                    Some(self.labels.clone())
                },
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![container],
                restart_policy: self.restart_policy.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Builder for a service specification
#[derive(Debug, Clone, Default)]
pub struct ServiceTemplate {
    selector: BTreeMap<String, String>,
    ports: Vec<(u16, u16)>,
    service_type: Option<String>,
    external_ips: Vec<String>,
}

impl ServiceTemplate {
    /// Empty service
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a selector
    #[must_use]
    pub fn selector(mut self, key: &str, value: &str) -> Self {
        self.selector.insert(key.to_string(), value.to_string());
        self
    }

    /// Add a port mapping (port -> targetPort), named `port-<port>`
    ///
    /// # Panics
    /// Panics if port or `target_port` is zero
    #[must_use]
    pub fn port(mut self, port: u16, target_port: u16) -> Self {
        assert!(port > 0, "port must be in range 1-65535, got {port}");
        assert!(
            target_port > 0,
            "target_port must be in range 1-65535, got {target_port}"
        );
        self.ports.push((port, target_port));
        self
    }

    /// Set service type to `NodePort`
    #[must_use]
    pub fn node_port(mut self) -> Self {
        self.service_type = Some("NodePort".to_string());
        self
    }

    /// Set service type to `LoadBalancer`
    #[must_use]
    pub fn load_balancer(mut self) -> Self {
        self.service_type = Some("LoadBalancer".to_string());
        self
    }

    /// Add a fixed external IP
    #[must_use]
    pub fn external_ip(mut self, ip: &str) -> Self {
        self.external_ips.push(ip.to_string());
        self
    }

    /// Build the Service specification
    #[must_use]
    pub fn build(&self) -> Service {
        let ports: Vec<ServicePort> = self
            .ports
            .iter()
            .map(|(port, target_port)| ServicePort {
                name: Some(format!("port-{port}")),
                port: i32::from(*port),
                target_port: Some(IntOrString::Int(i32::from(*target_port))),
                ..Default::default()
            })
            .collect();

        Service {
            metadata: ObjectMeta::default(),
            spec: Some(ServiceSpec {
                selector: if self.selector.is_empty() {
                    None
                } else {
                    Some(self.selector.clone())
                },
                ports: non_empty(ports),
                type_: self.service_type.clone(),
                external_ips: non_empty(self.external_ips.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_template_basic() {
        let pod = PodTemplate::new("main", "busybox")
            .command(&["sleep", "infinity"])
            .build();

        assert!(pod.metadata.name.is_none());
        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.containers.len(), 1);
        assert_eq!(spec.containers[0].name, "main");
        assert_eq!(spec.containers[0].image.as_deref(), Some("busybox"));
        assert_eq!(
            spec.containers[0].command,
            Some(vec!["sleep".to_string(), "infinity".to_string()])
        );
        assert!(spec.containers[0].ports.is_none());
    }

    #[test]
    fn test_pod_template_ports_env_labels() {
        let pod = PodTemplate::new("pg", "postgres:16")
            .port(5432)
            .host_port(8080, 31000)
            .env("POSTGRES_PASSWORD", "test")
            .label("tier", "db")
            .build();

        assert_eq!(
            pod.metadata.labels.unwrap().get("tier").map(String::as_str),
            Some("db")
        );
        let container = &pod.spec.unwrap().containers[0];
        let ports = container.ports.as_ref().unwrap();
        assert_eq!(ports[0].container_port, 5432);
        assert_eq!(ports[0].host_port, None);
        assert_eq!(ports[1].container_port, 8080);
        assert_eq!(ports[1].host_port, Some(31000));
        let env = container.env.as_ref().unwrap();
        assert_eq!(env[0].name, "POSTGRES_PASSWORD");
        assert_eq!(env[0].value.as_deref(), Some("test"));
    }

    #[test]
    fn test_service_template() {
        let svc = ServiceTemplate::new()
            .selector("app", "web")
            .port(80, 8080)
            .load_balancer()
            .external_ip("10.0.0.10")
            .build();

        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("LoadBalancer"));
        assert_eq!(spec.external_ips, Some(vec!["10.0.0.10".to_string()]));
        let ports = spec.ports.unwrap();
        assert_eq!(ports[0].port, 80);
        assert_eq!(ports[0].name.as_deref(), Some("port-80"));
        assert_eq!(ports[0].target_port, Some(IntOrString::Int(8080)));
        assert_eq!(
            spec.selector.unwrap().get("app").map(String::as_str),
            Some("web")
        );
    }

    #[test]
    #[should_panic(expected = "port must be in range")]
    fn test_service_template_rejects_zero_port() {
        let _ = ServiceTemplate::new().port(0, 80);
    }
}
