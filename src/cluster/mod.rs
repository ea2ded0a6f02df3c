//! Cluster API abstraction used by the build steps.
//!
//! The [`Cluster`] trait covers the handful of verbs the builder needs:
//! create, get, list, delete, watch, the KubeVirt `stop` subresource, and a
//! way to reach a port inside a pod.
//! [`RestCluster`] implements it over plain HTTP; tests substitute an
//! in-memory double.

mod error;
mod rest;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::resources::Resource;
use crate::tunnel::Dialer;

pub use error::ClusterError;
pub use rest::RestCluster;

/// Boxed future returned by [`Cluster`] operations.
pub type ClusterFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ClusterError>> + Send + 'a>>;

/// Garbage-collection policy applied to dependents on delete.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum Propagation {
    /// Dependents are deleted before the owner disappears.
    Foreground,
    /// Owner disappears immediately; dependents are collected afterwards.
    Background,
    /// Dependents are left in place.
    Orphan,
}

/// Address of a single object.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ObjectRef {
    /// Namespace, `None` for cluster-scoped kinds.
    pub namespace: Option<String>,
    /// Object name.
    pub name: String,
}

impl ObjectRef {
    /// Reference to a namespaced object.
    #[must_use]
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self {
            namespace: Some(namespace.to_owned()),
            name: name.to_owned(),
        }
    }

    /// Reference to a cluster-scoped object.
    #[must_use]
    pub fn cluster_scoped(name: &str) -> Self {
        Self {
            namespace: None,
            name: name.to_owned(),
        }
    }

    /// Reference to an existing object.
    #[must_use]
    pub fn of<R: Resource>(resource: &R) -> Self {
        let metadata = resource.metadata();
        Self {
            namespace: metadata.namespace.clone(),
            name: metadata.name.clone(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Change notification for a watched object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent<R> {
    /// Object observed for the first time.
    Added(R),
    /// Object changed.
    Modified(R),
    /// Object removed.
    Deleted(R),
}

impl<R> WatchEvent<R> {
    /// Object carried by the event.
    #[must_use]
    pub const fn object(&self) -> &R {
        match self {
            Self::Added(object) | Self::Modified(object) | Self::Deleted(object) => object,
        }
    }

    /// Consumes the event, returning the object.
    #[must_use]
    pub fn into_object(self) -> R {
        match self {
            Self::Added(object) | Self::Modified(object) | Self::Deleted(object) => object,
        }
    }
}

/// Stream of watch events for one object.
///
/// Dropping the subscription stops the task feeding it.
#[derive(Debug)]
pub struct Subscription<R> {
    events: mpsc::Receiver<Result<WatchEvent<R>, ClusterError>>,
    feeder: Option<JoinHandle<()>>,
}

impl<R> Subscription<R> {
    /// Wraps a receiver and the optional task that feeds it.
    #[must_use]
    pub const fn new(
        events: mpsc::Receiver<Result<WatchEvent<R>, ClusterError>>,
        feeder: Option<JoinHandle<()>>,
    ) -> Self {
        Self { events, feeder }
    }

    /// Waits for the next event; `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Result<WatchEvent<R>, ClusterError>> {
        self.events.recv().await
    }
}

impl<R> Drop for Subscription<R> {
    fn drop(&mut self) {
        self.events.close();
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
    }
}

/// Cluster operations required by the builder.
pub trait Cluster: Send + Sync {
    /// Creates `resource` and returns the stored object.
    fn create<'a, R: Resource>(&'a self, resource: &'a R) -> ClusterFuture<'a, R>;

    /// Fetches one object.
    fn get<'a, R: Resource>(&'a self, target: &'a ObjectRef) -> ClusterFuture<'a, R>;

    /// Lists objects matching `label_selector` in `namespace`.
    fn list<'a, R: Resource>(
        &'a self,
        namespace: Option<&'a str>,
        label_selector: &'a str,
    ) -> ClusterFuture<'a, Vec<R>>;

    /// Deletes one object with the given propagation policy.
    fn delete<'a, R: Resource>(
        &'a self,
        target: &'a ObjectRef,
        propagation: Propagation,
    ) -> ClusterFuture<'a, ()>;

    /// Opens a watch scoped to the named object.
    fn watch<'a, R: Resource>(&'a self, target: &'a ObjectRef) -> ClusterFuture<'a, Subscription<R>>;

    /// Requests a graceful stop of a virtual machine.
    fn stop_virtual_machine<'a>(&'a self, target: &'a ObjectRef) -> ClusterFuture<'a, ()>;

    /// Dialer reaching `port` inside `pod`. `address` is the pod IP, for
    /// implementations that connect to it directly.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] when no connection path to the pod exists.
    fn pod_dialer(
        &self,
        pod: &ObjectRef,
        address: &str,
        port: u16,
    ) -> Result<Arc<dyn Dialer>, ClusterError>;
}
