//! Ephemeral host port allocation
//!
//! Hands out OS-assigned ports by logical name. Each worker has its own
//! name → port table, so a single allocator can be shared by parallel tests.
//!
//! Ports are claimed by binding a socket and releasing it straight away.
//! Another process may grab the port before the consumer binds it - this is
//! best effort, not a reservation.
//!
//! # Example
//!
//! ```no_run
//! use kube_fixtures::ports::PortAllocator;
//! use kube_fixtures::worker::WorkerId;
//!
//! let ports = PortAllocator::new();
//! let worker = WorkerId::new("worker-1");
//!
//! let http = ports.allocate(&worker, "nginx-80")?;
//! assert_eq!(ports.lookup(&worker, "nginx-80")?, http);
//! # Ok::<(), kube_fixtures::ports::AllocationError>(())
//! ```

use crate::worker::{WorkerId, WorkerMap};
use std::collections::HashMap;
use std::net::{Ipv4Addr, TcpListener};
use tracing::debug;

/// Errors from port allocation
#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    #[error("Port '{0}' was already allocated")]
    AlreadyAllocated(String),

    #[error("Port '{0}' was never allocated")]
    NotAllocated(String),

    #[error("Failed to bind an ephemeral port: {0}")]
    Bind(String),
}

/// Allocates ephemeral host ports by name, per worker
#[derive(Debug, Default)]
pub struct PortAllocator {
    tables: WorkerMap<HashMap<String, u16>>,
}

impl PortAllocator {
    /// Create an allocator with no ports
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a free port and record it under `name`
    ///
    /// Each name can be allocated once per worker.
    pub fn allocate(&self, worker: &WorkerId, name: &str) -> Result<u16, AllocationError> {
        self.tables.with_or_default(worker, |table| {
            if table.contains_key(name) {
                return Err(AllocationError::AlreadyAllocated(name.to_string()));
            }

            let port = ephemeral_port()?;
            table.insert(name.to_string(), port);

            debug!(worker = %worker, name = %name, port = port, "Allocated host port");
            Ok(port)
        })
    }

    /// Port previously allocated under `name`
    pub fn lookup(&self, worker: &WorkerId, name: &str) -> Result<u16, AllocationError> {
        self.tables
            .with(worker, |table| table.get(name).copied())
            .flatten()
            .ok_or_else(|| AllocationError::NotAllocated(name.to_string()))
    }

    /// Whether `name` was allocated by `worker`
    pub fn has(&self, worker: &WorkerId, name: &str) -> bool {
        self.tables
            .with(worker, |table| table.contains_key(name))
            .unwrap_or(false)
    }
}

fn ephemeral_port() -> Result<u16, AllocationError> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
        .map_err(|e| AllocationError::Bind(e.to_string()))?;
    let port = listener
        .local_addr()
        .map_err(|e| AllocationError::Bind(e.to_string()))?
        .port();
    drop(listener);
    Ok(port)
}
