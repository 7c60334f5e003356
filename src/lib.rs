//! kube-fixtures - Kubernetes pods and services as test fixtures
//!
//! Provisions short-lived pods and services for a test, waits until each is
//! actually usable, exposes connection details and guarantees teardown.
//!
//! # Example
//!
//! ```no_run
//! use kube_fixtures::{FixtureConfig, FixtureContext, PodTemplate, WaitStrategy, WorkerId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     kube_fixtures::init_logging();
//!
//!     let ctx = FixtureContext::connect(FixtureConfig::from_env()).await?;
//!
//!     let postgres = ctx
//!         .pod(
//!             PodTemplate::new("postgres", "postgres:16")
//!                 .env("POSTGRES_PASSWORD", "test")
//!                 .port(5432)
//!                 .build(),
//!         )
//!         .with_wait(WaitStrategy::log(".*ready to accept connections.*").times(2));
//!
//!     let worker = WorkerId::current_thread();
//!     postgres.create(&worker).await?;
//!
//!     let result = postgres.exec_in_pod(&worker, &["pg_isready"]).await?;
//!     println!("pg_isready exited with {}", result.exit_code());
//!
//!     postgres.remove(&worker).await?;
//!     ctx.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod context;
pub mod ports;
pub mod resource;
pub mod teardown;
pub mod telemetry;
pub mod template;
pub mod wait;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use client::{ClientError, KubeClient, PodClient, ResourceClient, WatchEvent};
pub use config::FixtureConfig;
pub use context::FixtureContext;
pub use ports::{AllocationError, PortAllocator};
pub use resource::{
    ExecResult, Fixture, FixtureError, ManagedPod, ManagedService, NoHooks, PodHooks,
    ServiceHooks,
};
pub use teardown::{TeardownRegistry, TeardownReport};
pub use telemetry::{init_logging, init_logging_for};
pub use template::{PodTemplate, ServiceTemplate};
pub use wait::{WaitError, WaitFailure, WaitKind, WaitStrategy};
pub use worker::WorkerId;
