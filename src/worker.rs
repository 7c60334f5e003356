//! Worker identity and per-worker state
//!
//! A single fixture definition may be shared by several parallel test
//! workers. Each worker only ever sees what it created itself, so fixture
//! state is keyed by a [`WorkerId`] that callers pass explicitly.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Identifies one test worker (thread, task, or anything else the caller picks)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(String);

impl WorkerId {
    /// Create a worker id from an arbitrary label
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Worker id derived from the current OS thread
    pub fn current_thread() -> Self {
        Self(format!("{:?}", std::thread::current().id()))
    }

    /// The raw id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A map from worker to that worker's private value
///
/// Critical sections are short and never cross an `.await`.
#[derive(Debug)]
pub struct WorkerMap<T> {
    entries: Mutex<HashMap<WorkerId, T>>,
}

impl<T> Default for WorkerMap<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> WorkerMap<T> {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<WorkerId, T>> {
        // A panicking test worker must not wedge the others
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `worker` has a value
    pub fn contains(&self, worker: &WorkerId) -> bool {
        self.lock().contains_key(worker)
    }

    /// Store a value for `worker`, returning the previous one
    pub fn insert(&self, worker: &WorkerId, value: T) -> Option<T> {
        self.lock().insert(worker.clone(), value)
    }

    /// Take the value for `worker` out of the map
    pub fn remove(&self, worker: &WorkerId) -> Option<T> {
        self.lock().remove(worker)
    }

    /// Run `f` against the value for `worker`, if any
    pub fn with<R>(&self, worker: &WorkerId, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.lock().get(worker).map(f)
    }

    /// Run `f` against the value for `worker`, if any, mutably
    pub fn with_mut<R>(&self, worker: &WorkerId, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.lock().get_mut(worker).map(f)
    }

    /// Number of workers holding a value
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no worker holds a value
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl<T: Clone> WorkerMap<T> {
    /// Clone of the value for `worker`
    pub fn get(&self, worker: &WorkerId) -> Option<T> {
        self.lock().get(worker).cloned()
    }
}

impl<T: Default> WorkerMap<T> {
    /// Run `f` against the value for `worker`, creating it on first use
    pub fn with_or_default<R>(&self, worker: &WorkerId, f: impl FnOnce(&mut T) -> R) -> R {
        f(self.lock().entry(worker.clone()).or_default())
    }
}
