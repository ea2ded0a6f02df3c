//! Local TCP relay exposing a cluster-internal endpoint.
//!
//! [`start_tunnel`] binds `127.0.0.1:<local_port>`, then relays every
//! accepted connection to a fresh upstream stream obtained from a
//! [`Dialer`]. The relay runs on a background task; the returned
//! [`TunnelHandle`] stops it.
//!
//! [`TcpDialer`] connects straight to an address; [`PortForwardDialer`]
//! goes through the API server's pod `portforward` subresource.

mod portforward;

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, copy_bidirectional};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// How long [`start_tunnel`] waits for the listener by default.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

pub use portforward::{PORT_FORWARD_PROTOCOL, PortForwardDialer};

/// Byte stream to the tunnel target.
pub trait Upstream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Upstream for T {}

/// Boxed future returned by [`Dialer::dial`].
pub type DialFuture<'a> = Pin<Box<dyn Future<Output = io::Result<Box<dyn Upstream>>> + Send + 'a>>;

/// Opens the upstream side of a relayed connection.
pub trait Dialer: Send + Sync + 'static {
    /// Connects to the tunnel target.
    fn dial(&self) -> DialFuture<'_>;
}

impl<D: Dialer + ?Sized> Dialer for Arc<D> {
    fn dial(&self) -> DialFuture<'_> {
        self.as_ref().dial()
    }
}

/// Dials a fixed socket address, such as a launcher pod's IP and guest port.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TcpDialer {
    addr: SocketAddr,
}

impl TcpDialer {
    /// Creates a dialer for `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl Dialer for TcpDialer {
    fn dial(&self) -> DialFuture<'_> {
        Box::pin(async move {
            let stream = TcpStream::connect(self.addr).await?;
            Ok(Box::new(stream) as Box<dyn Upstream>)
        })
    }
}

/// Running relay. Stopping is idempotent; dropping the handle stops it.
#[derive(Debug)]
pub struct TunnelHandle {
    local_port: u16,
    stop: Option<oneshot::Sender<()>>,
    relay: Option<JoinHandle<()>>,
}

impl TunnelHandle {
    /// Port the relay listens on.
    #[must_use]
    pub const fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Returns true once [`Self::stop`] has run.
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        self.relay.is_none()
    }

    /// Stops the relay and every connection it carries.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.send(()).ok();
        }
        if let Some(relay) = self.relay.take() {
            relay.abort();
            debug!(local_port = self.local_port, "tunnel stopped");
        }
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Errors returned by [`start_tunnel`].
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The local listener could not be created.
    #[error("failed to listen on 127.0.0.1:{local_port}: {message}")]
    Bind {
        /// Requested local port.
        local_port: u16,
        /// Underlying error.
        message: String,
    },
    /// The relay did not signal readiness in time. The handle is returned so
    /// the caller can stop it.
    #[error("tunnel on 127.0.0.1:{local_port} not ready after {timeout:?}")]
    NotReady {
        /// Requested local port.
        local_port: u16,
        /// Readiness timeout that elapsed.
        timeout: Duration,
        /// Handle of the still-starting relay.
        handle: TunnelHandle,
    },
}

/// Starts a relay from `127.0.0.1:local_port` to `dialer` and waits until it
/// listens. Port `0` picks an ephemeral port, reported by
/// [`TunnelHandle::local_port`].
///
/// # Errors
///
/// Returns [`TunnelError::Bind`] when the listener cannot be created and
/// [`TunnelError::NotReady`] when `ready_timeout` elapses first.
pub async fn start_tunnel<D: Dialer>(
    dialer: D,
    local_port: u16,
    ready_timeout: Duration,
) -> Result<TunnelHandle, TunnelError> {
    let (ready_tx, ready_rx) = oneshot::channel();
    let (stop_tx, stop_rx) = oneshot::channel();
    let relay = tokio::spawn(run_relay(Arc::new(dialer), local_port, ready_tx, stop_rx));
    let mut handle = TunnelHandle {
        local_port,
        stop: Some(stop_tx),
        relay: Some(relay),
    };

    match timeout(ready_timeout, ready_rx).await {
        Ok(Ok(Ok(bound_port))) => {
            handle.local_port = bound_port;
            info!(local_port = bound_port, "tunnel ready");
            Ok(handle)
        }
        Ok(Ok(Err(err))) => {
            handle.stop();
            Err(TunnelError::Bind {
                local_port,
                message: err.to_string(),
            })
        }
        Ok(Err(_)) => {
            handle.stop();
            Err(TunnelError::Bind {
                local_port,
                message: String::from("relay exited before listening"),
            })
        }
        Err(_) => Err(TunnelError::NotReady {
            local_port,
            timeout: ready_timeout,
            handle,
        }),
    }
}

async fn run_relay<D: Dialer>(
    dialer: Arc<D>,
    local_port: u16,
    ready: oneshot::Sender<io::Result<u16>>,
    mut stop: oneshot::Receiver<()>,
) {
    let bound = TcpListener::bind((Ipv4Addr::LOCALHOST, local_port))
        .await
        .and_then(|listener| {
            let port = listener.local_addr()?.port();
            Ok((listener, port))
        });
    let listener = match bound {
        Ok((listener, port)) => {
            if ready.send(Ok(port)).is_err() {
                return;
            }
            listener
        }
        Err(err) => {
            ready.send(Err(err)).ok();
            return;
        }
    };

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = &mut stop => break,
            accepted = listener.accept() => match accepted {
                Ok((client, peer)) => {
                    connections.spawn(forward(Arc::clone(&dialer), client, peer));
                }
                Err(err) => {
                    warn!(local_port, error = %err, "tunnel accept failed");
                    break;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn forward<D: Dialer>(dialer: Arc<D>, mut client: TcpStream, peer: SocketAddr) {
    let mut upstream = match dialer.dial().await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%peer, error = %err, "failed to dial tunnel target");
            return;
        }
    };
    match copy_bidirectional(&mut client, &mut upstream).await {
        Ok((sent, received)) => debug!(%peer, sent, received, "tunnel connection closed"),
        Err(err) => debug!(%peer, error = %err, "tunnel connection ended"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind echo server");
        let addr = listener.local_addr().expect("echo address");
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    tokio::io::copy(&mut reader, &mut writer).await.ok();
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn relays_bytes_both_ways() {
        let upstream = echo_server().await;
        let handle = start_tunnel(TcpDialer::new(upstream), 0, DEFAULT_READY_TIMEOUT)
            .await
            .expect("tunnel should start");
        assert_ne!(handle.local_port(), 0);

        let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, handle.local_port()))
            .await
            .expect("connect to tunnel");
        client.write_all(b"ping").await.expect("write");
        let mut reply = [0_u8; 4];
        client.read_exact(&mut reply).await.expect("read");
        assert_eq!(&reply, b"ping");
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_closes_listener() {
        let upstream = echo_server().await;
        let mut handle = start_tunnel(TcpDialer::new(upstream), 0, DEFAULT_READY_TIMEOUT)
            .await
            .expect("tunnel should start");
        let port = handle.local_port();

        handle.stop();
        handle.stop();
        assert!(handle.is_stopped());

        let mut refused = false;
        for _ in 0..50 {
            if TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(refused, "listener should close after stop");
    }

    #[tokio::test]
    async fn occupied_port_fails_to_bind() {
        let occupied = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind placeholder");
        let port = occupied.local_addr().expect("placeholder address").port();
        let upstream = echo_server().await;

        let result = start_tunnel(TcpDialer::new(upstream), port, DEFAULT_READY_TIMEOUT).await;
        assert!(
            matches!(result, Err(TunnelError::Bind { local_port, .. }) if local_port == port),
            "unexpected result: {result:?}"
        );
    }
}
