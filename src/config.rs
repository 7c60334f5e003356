//! Configuration for fixture provisioning
//!
//! Everything the fixtures need to know about their environment lives in
//! [`FixtureConfig`]. Build it programmatically or read it from the
//! environment - it is then passed explicitly to the client, the context and
//! every managed resource.
//!
//! # Example
//!
//! ```
//! use kube_fixtures::config::FixtureConfig;
//!
//! let config = FixtureConfig::default()
//!     .namespace("integration")
//!     .pull_secret("registry-creds")
//!     .use_port_service(true);
//!
//! assert_eq!(config.namespace, "integration");
//! ```

use std::time::Duration;

/// Target namespace
pub const NAMESPACE_ENV: &str = "KUBERNETES_NAMESPACE";
/// Comma separated image pull secret names
pub const PULL_SECRETS_ENV: &str = "KUBERNETES_PULL_SECRETS";
/// Verbose transport logging
pub const DEBUG_ENV: &str = "KUBE_FIXTURES_DEBUG";
/// Force HTTP/1.1 against the API server
pub const DISABLE_HTTP2_ENV: &str = "KUBE_FIXTURES_DISABLE_HTTP2";
/// Create a companion NodePort service next to every pod
pub const USE_PORT_SERVICE_ENV: &str = "KUBE_FIXTURES_USE_PORT_SERVICE";
/// Set by the kubelet inside every pod; its presence means we run in-cluster
pub const IN_CLUSTER_ENV: &str = "KUBERNETES_PORT";

/// Namespace used when none is configured
pub const DEFAULT_NAMESPACE: &str = "default";

/// Readiness timeout used when a strategy doesn't set one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Fixture configuration
#[derive(Debug, Clone, PartialEq)]
pub struct FixtureConfig {
    /// Namespace every fixture is created in
    pub namespace: String,

    /// Image pull secrets appended to every pod
    pub pull_secrets: Vec<String>,

    /// Verbose transport logging
    pub debug: bool,

    /// Restrict the API connection to HTTP/1.1
    pub disable_http2: bool,

    /// Expose pod container ports through a companion NodePort service
    pub use_port_service: bool,

    /// Tests run inside the cluster (service host IP resolves to the cluster IP)
    pub in_cluster: bool,

    /// Default readiness timeout
    pub default_timeout: Duration,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            pull_secrets: Vec::new(),
            debug: false,
            disable_http2: false,
            use_port_service: false,
            in_cluster: false,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl FixtureConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary lookup function
    ///
    /// Blank namespaces fall back to `"default"`, toggles are enabled only by
    /// a case-insensitive `true`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let namespace = lookup(NAMESPACE_ENV)
            .map(|ns| ns.trim().to_string())
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        let pull_secrets = lookup(PULL_SECRETS_ENV)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let flag = |key: &str| lookup(key).is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));

        Self {
            namespace,
            pull_secrets,
            debug: flag(DEBUG_ENV),
            disable_http2: flag(DISABLE_HTTP2_ENV),
            use_port_service: flag(USE_PORT_SERVICE_ENV),
            in_cluster: lookup(IN_CLUSTER_ENV).is_some(),
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the namespace
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Add an image pull secret
    #[must_use]
    pub fn pull_secret(mut self, name: impl Into<String>) -> Self {
        self.pull_secrets.push(name.into());
        self
    }

    /// Enable verbose transport logging
    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Restrict the API connection to HTTP/1.1
    #[must_use]
    pub fn disable_http2(mut self, disable: bool) -> Self {
        self.disable_http2 = disable;
        self
    }

    /// Create a companion NodePort service next to every pod
    #[must_use]
    pub fn use_port_service(mut self, enabled: bool) -> Self {
        self.use_port_service = enabled;
        self
    }

    /// Mark the tests as running inside the cluster
    #[must_use]
    pub fn in_cluster(mut self, in_cluster: bool) -> Self {
        self.in_cluster = in_cluster;
        self
    }

    /// Set the default readiness timeout
    #[must_use]
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}
