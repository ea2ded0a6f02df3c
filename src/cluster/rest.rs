//! HTTP implementation of [`Cluster`].
//!
//! Requests are sent to an API endpoint that already handles
//! authentication, typically `kubectl proxy`. An optional bearer token is
//! attached verbatim when configured.
//!
//! Every request except watches carries the configured request timeout.
//! Watch streams are bounded by the caller's deadline instead.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::ClusterConfig;
use crate::resources::core::Pod;
use crate::resources::{ObjectList, Resource, to_wire};
use crate::tunnel::{Dialer, PortForwardDialer};

use super::{Cluster, ClusterError, ClusterFuture, ObjectRef, Propagation, Subscription, WatchEvent};

const WATCH_BUFFER: usize = 16;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Longest watch line accepted before the stream is abandoned.
const MAX_WATCH_LINE: usize = 4 * 1024 * 1024;
const VM_STOP_API: &str = "apis/subresources.kubevirt.io/v1";

/// Cluster client speaking the REST API directly.
#[derive(Clone, Debug)]
pub struct RestCluster {
    client: Client,
    base_url: String,
    token: Option<String>,
    request_timeout: Duration,
}

#[derive(Deserialize)]
struct RawWatchEvent {
    #[serde(rename = "type")]
    type_: String,
    object: Value,
}

impl RestCluster {
    /// Creates a client for the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Transport`] when the HTTP client cannot be
    /// constructed.
    pub fn new(config: &ClusterConfig) -> Result<Self, ClusterError> {
        let request_timeout = config.request_timeout();
        // The endpoint is usually `kubectl proxy` on loopback, reached directly.
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(request_timeout))
            .no_proxy()
            .build()?;
        Ok(Self {
            request_timeout,
            client,
            base_url: config.api_url.trim_end_matches('/').to_owned(),
            token: config
                .token
                .as_ref()
                .filter(|token| !token.trim().is_empty())
                .cloned(),
        })
    }

    fn api_root<R: Resource>(&self) -> String {
        let group = if R::API_VERSION.contains('/') {
            "apis"
        } else {
            "api"
        };
        format!("{}/{group}/{}", self.base_url, R::API_VERSION)
    }

    fn collection_url<R: Resource>(&self, namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) if R::NAMESPACED => {
                format!("{}/namespaces/{ns}/{}", self.api_root::<R>(), R::PLURAL)
            }
            _ => format!("{}/{}", self.api_root::<R>(), R::PLURAL),
        }
    }

    fn object_url<R: Resource>(&self, target: &ObjectRef) -> String {
        format!(
            "{}/{}",
            self.collection_url::<R>(target.namespace.as_deref()),
            target.name
        )
    }

    fn watch_request(&self, url: &str) -> RequestBuilder {
        let builder = self.client.request(Method::GET, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url).timeout(self.request_timeout);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn transport_error<R: Resource>(
        &self,
        err: reqwest::Error,
        operation: &'static str,
        target: &ObjectRef,
    ) -> ClusterError {
        if err.is_timeout() {
            ClusterError::Timeout {
                operation,
                kind: R::KIND,
                target: target.to_string(),
                seconds: self.request_timeout.as_secs(),
            }
        } else {
            err.into()
        }
    }

    async fn send<R: Resource>(
        &self,
        builder: RequestBuilder,
        operation: &'static str,
        target: &ObjectRef,
    ) -> Result<Response, ClusterError> {
        let response = builder
            .send()
            .await
            .map_err(|err| self.transport_error::<R>(err, operation, target))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::CONFLICT if operation == "create" => ClusterError::AlreadyExists {
                kind: R::KIND,
                target: target.to_string(),
            },
            StatusCode::NOT_FOUND => ClusterError::NotFound {
                kind: R::KIND,
                target: target.to_string(),
            },
            other => ClusterError::Api {
                operation,
                kind: R::KIND,
                target: target.to_string(),
                status: other.as_u16(),
                message,
            },
        })
    }

    async fn decode<T: serde::de::DeserializeOwned, R: Resource>(
        &self,
        response: Response,
        operation: &'static str,
        target: &ObjectRef,
    ) -> Result<T, ClusterError> {
        let body = response
            .bytes()
            .await
            .map_err(|err| self.transport_error::<R>(err, operation, target))?;
        serde_json::from_slice(&body).map_err(|err| ClusterError::Decode {
            kind: R::KIND,
            message: err.to_string(),
        })
    }

    async fn pump_watch<R: Resource>(
        mut response: Response,
        target: ObjectRef,
        tx: mpsc::Sender<Result<WatchEvent<R>, ClusterError>>,
    ) {
        let mut lines = LineBuffer::new(MAX_WATCH_LINE);
        loop {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(err) => {
                    tx.send(Err(err.into())).await.ok();
                    break;
                }
            };
            let complete = match lines.push(&chunk) {
                Ok(complete) => complete,
                Err(buffered) => {
                    warn!(kind = R::KIND, %target, buffered, "watch line exceeds limit");
                    let overflow = ClusterError::Decode {
                        kind: R::KIND,
                        message: format!(
                            "watch event longer than {MAX_WATCH_LINE} bytes ({buffered} bytes without a newline)"
                        ),
                    };
                    tx.send(Err(overflow)).await.ok();
                    return;
                }
            };

            for line in complete {
                let Some(event) = parse_watch_line::<R>(&line, &target) else {
                    continue;
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
        debug!(kind = R::KIND, %target, "watch stream closed");
    }
}

/// Splits a byte stream into newline-terminated lines, refusing to buffer
/// more than `limit` bytes of an unterminated line.
#[derive(Debug)]
struct LineBuffer {
    pending: Vec<u8>,
    limit: usize,
}

impl LineBuffer {
    const fn new(limit: usize) -> Self {
        Self {
            pending: Vec::new(),
            limit,
        }
    }

    /// Appends `chunk` and returns the lines it completed. Fails with the
    /// buffered length once the unterminated remainder exceeds the limit.
    fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, usize> {
        self.pending.extend_from_slice(chunk);
        let mut complete = Vec::new();
        while let Some(pos) = self.pending.iter().position(|byte| *byte == b'\n') {
            complete.push(self.pending.drain(..=pos).collect());
        }
        if self.pending.len() > self.limit {
            return Err(self.pending.len());
        }
        Ok(complete)
    }
}

fn websocket_url(http_url: &str) -> String {
    http_url.strip_prefix("https://").map_or_else(
        || {
            http_url
                .strip_prefix("http://")
                .map_or_else(|| http_url.to_owned(), |rest| format!("ws://{rest}"))
        },
        |rest| format!("wss://{rest}"),
    )
}

fn parse_watch_line<R: Resource>(
    line: &[u8],
    target: &ObjectRef,
) -> Option<Result<WatchEvent<R>, ClusterError>> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }

    let raw: RawWatchEvent = match serde_json::from_slice(line) {
        Ok(raw) => raw,
        Err(err) => {
            return Some(Err(ClusterError::Decode {
                kind: R::KIND,
                message: err.to_string(),
            }));
        }
    };

    if raw.type_ == "ERROR" {
        let message = raw
            .object
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown watch error")
            .to_owned();
        return Some(Err(ClusterError::Watch {
            kind: R::KIND,
            target: target.to_string(),
            message,
        }));
    }

    let wrap: fn(R) -> WatchEvent<R> = match raw.type_.as_str() {
        "ADDED" => WatchEvent::Added,
        "MODIFIED" => WatchEvent::Modified,
        "DELETED" => WatchEvent::Deleted,
        other => {
            debug!(kind = R::KIND, event = other, "ignoring watch event");
            return None;
        }
    };

    Some(
        serde_json::from_value::<R>(raw.object)
            .map(wrap)
            .map_err(|err| ClusterError::Decode {
                kind: R::KIND,
                message: err.to_string(),
            }),
    )
}

impl Cluster for RestCluster {
    fn create<'a, R: Resource>(&'a self, resource: &'a R) -> ClusterFuture<'a, R> {
        Box::pin(async move {
            let target = ObjectRef::of(resource);
            let body = to_wire(resource).map_err(|err| ClusterError::Decode {
                kind: R::KIND,
                message: err.to_string(),
            })?;
            let url = self.collection_url::<R>(target.namespace.as_deref());
            debug!(kind = R::KIND, %target, "creating object");
            let response = self
                .send::<R>(self.request(Method::POST, &url).json(&body), "create", &target)
                .await?;
            self.decode::<R, R>(response, "create", &target).await
        })
    }

    fn get<'a, R: Resource>(&'a self, target: &'a ObjectRef) -> ClusterFuture<'a, R> {
        Box::pin(async move {
            let url = self.object_url::<R>(target);
            let response = self
                .send::<R>(self.request(Method::GET, &url), "get", target)
                .await?;
            self.decode::<R, R>(response, "get", target).await
        })
    }

    fn list<'a, R: Resource>(
        &'a self,
        namespace: Option<&'a str>,
        label_selector: &'a str,
    ) -> ClusterFuture<'a, Vec<R>> {
        Box::pin(async move {
            let url = self.collection_url::<R>(namespace);
            let target = ObjectRef {
                namespace: namespace.map(str::to_owned),
                name: format!("[{label_selector}]"),
            };
            let builder = self
                .request(Method::GET, &url)
                .query(&[("labelSelector", label_selector)]);
            let response = self.send::<R>(builder, "list", &target).await?;
            let list: ObjectList<R> = self
                .decode::<ObjectList<R>, R>(response, "list", &target)
                .await?;
            Ok(list.items)
        })
    }

    fn delete<'a, R: Resource>(
        &'a self,
        target: &'a ObjectRef,
        propagation: Propagation,
    ) -> ClusterFuture<'a, ()> {
        Box::pin(async move {
            let url = self.object_url::<R>(target);
            let options = json!({
                "apiVersion": "v1",
                "kind": "DeleteOptions",
                "propagationPolicy": propagation,
            });
            debug!(kind = R::KIND, %target, ?propagation, "deleting object");
            self.send::<R>(
                self.request(Method::DELETE, &url).json(&options),
                "delete",
                target,
            )
            .await?;
            Ok(())
        })
    }

    fn watch<'a, R: Resource>(&'a self, target: &'a ObjectRef) -> ClusterFuture<'a, Subscription<R>> {
        Box::pin(async move {
            let url = self.collection_url::<R>(target.namespace.as_deref());
            let selector = format!("metadata.name={}", target.name);
            let builder = self
                .watch_request(&url)
                .query(&[("watch", "true"), ("fieldSelector", selector.as_str())]);
            let response = self.send::<R>(builder, "watch", target).await?;

            let (tx, rx) = mpsc::channel(WATCH_BUFFER);
            let feeder = tokio::spawn(Self::pump_watch::<R>(response, target.clone(), tx));
            Ok(Subscription::new(rx, Some(feeder)))
        })
    }

    fn stop_virtual_machine<'a>(&'a self, target: &'a ObjectRef) -> ClusterFuture<'a, ()> {
        Box::pin(async move {
            let Some(namespace) = target.namespace.as_deref() else {
                warn!(%target, "stop requested for a VM without namespace");
                return Err(ClusterError::NotFound {
                    kind: "VirtualMachine",
                    target: target.to_string(),
                });
            };
            let url = format!(
                "{}/{VM_STOP_API}/namespaces/{namespace}/virtualmachines/{}/stop",
                self.base_url, target.name
            );
            self.send::<crate::resources::kubevirt::VirtualMachine>(
                self.request(Method::PUT, &url).json(&json!({})),
                "stop",
                target,
            )
            .await?;
            Ok(())
        })
    }

    fn pod_dialer(
        &self,
        pod: &ObjectRef,
        _address: &str,
        port: u16,
    ) -> Result<Arc<dyn Dialer>, ClusterError> {
        let url = format!(
            "{}/portforward?ports={port}",
            websocket_url(&self.object_url::<Pod>(pod))
        );
        debug!(%pod, port, "dialing through the portforward subresource");
        Ok(Arc::new(PortForwardDialer::new(url, self.token.clone())))
    }
}
