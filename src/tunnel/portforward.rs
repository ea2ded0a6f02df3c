//! Dialer speaking the Kubernetes `portforward` websocket protocol.
//!
//! Each dial opens one websocket to
//! `.../pods/<name>/portforward?ports=<port>` with the
//! `v4.channel.k8s.io` subprotocol. Binary frames carry a channel byte:
//! `0` for data and `1` for errors. The first frame on each channel holds
//! only the two-byte port number. The socket is bridged to an in-memory
//! pipe whose other end is handed to the relay.

use std::io;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, duplex, split};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::{WebSocketStream, connect_async};
use tracing::{debug, warn};

use super::{DialFuture, Dialer, Upstream};

/// Websocket subprotocol of the port-forward stream.
pub const PORT_FORWARD_PROTOCOL: &str = "v4.channel.k8s.io";

const DATA_CHANNEL: u8 = 0;
const ERROR_CHANNEL: u8 = 1;
const PORT_PREFIX_LEN: usize = 2;
const PIPE_CAPACITY: usize = 64 * 1024;

/// Reaches a pod port through the API server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PortForwardDialer {
    url: String,
    token: Option<String>,
}

impl PortForwardDialer {
    /// Creates a dialer for the `ws://` or `wss://` portforward `url`,
    /// sending `token` as a bearer credential when present.
    #[must_use]
    pub const fn new(url: String, token: Option<String>) -> Self {
        Self { url, token }
    }

    async fn connect(&self) -> io::Result<Box<dyn Upstream>> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(io::Error::other)?;
        let headers = request.headers_mut();
        headers.insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(PORT_FORWARD_PROTOCOL),
        );
        if let Some(token) = &self.token {
            let bearer =
                HeaderValue::from_str(&format!("Bearer {token}")).map_err(io::Error::other)?;
            headers.insert(AUTHORIZATION, bearer);
        }

        let (socket, _) = connect_async(request).await.map_err(io::Error::other)?;
        debug!(url = %self.url, "portforward stream open");
        let (local, remote) = duplex(PIPE_CAPACITY);
        tokio::spawn(bridge(socket, remote));
        Ok(Box::new(local))
    }
}

impl Dialer for PortForwardDialer {
    fn dial(&self) -> DialFuture<'_> {
        Box::pin(self.connect())
    }
}

/// Decoded port-forward frame.
#[derive(Debug, Eq, PartialEq)]
enum Frame<'a> {
    Data(&'a [u8]),
    Error(String),
    Skip,
}

/// Tracks which channels have already sent their port prefix.
#[derive(Debug, Default)]
struct FrameDecoder {
    data_open: bool,
    error_open: bool,
}

impl FrameDecoder {
    fn decode<'a>(&mut self, message: &'a [u8]) -> Frame<'a> {
        let Some((&channel, payload)) = message.split_first() else {
            return Frame::Skip;
        };
        let open = match channel {
            DATA_CHANNEL => &mut self.data_open,
            ERROR_CHANNEL => &mut self.error_open,
            _ => return Frame::Skip,
        };
        let body = if *open {
            payload
        } else {
            *open = true;
            payload.get(PORT_PREFIX_LEN..).unwrap_or_default()
        };

        if body.is_empty() {
            Frame::Skip
        } else if channel == ERROR_CHANNEL {
            Frame::Error(String::from_utf8_lossy(body).into_owned())
        } else {
            Frame::Data(body)
        }
    }
}

fn data_frame(bytes: &[u8]) -> Message {
    let mut frame = Vec::with_capacity(bytes.len() + 1);
    frame.push(DATA_CHANNEL);
    frame.extend_from_slice(bytes);
    Message::Binary(frame)
}

async fn bridge<S>(socket: WebSocketStream<S>, pipe: DuplexStream)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = socket.split();
    let (mut reader, mut writer) = split(pipe);
    let mut decoder = FrameDecoder::default();
    let mut buf = vec![0_u8; PIPE_CAPACITY];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(len) => {
                    let chunk = buf.get(..len).unwrap_or_default();
                    if sink.send(data_frame(chunk)).await.is_err() {
                        break;
                    }
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Binary(bytes))) => match decoder.decode(&bytes) {
                    Frame::Data(data) => {
                        if writer.write_all(data).await.is_err() {
                            break;
                        }
                    }
                    Frame::Error(reason) => {
                        warn!(%reason, "portforward reported an error");
                        break;
                    }
                    Frame::Skip => {}
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(error = %err, "portforward stream failed");
                    break;
                }
            },
        }
    }

    sink.close().await.ok();
    writer.shutdown().await.ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{DEFAULT_READY_TIMEOUT, start_tunnel};
    use rstest::rstest;
    use std::net::Ipv4Addr;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::oneshot;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    #[rstest]
    #[case::port_prefix(&[0, 22, 0], Frame::Skip)]
    #[case::empty(&[], Frame::Skip)]
    #[case::unknown_channel(&[3, 1, 2, 3], Frame::Skip)]
    fn opening_frames_carry_no_payload(#[case] message: &[u8], #[case] expected: Frame<'_>) {
        assert_eq!(FrameDecoder::default().decode(message), expected);
    }

    #[rstest]
    fn data_follows_the_port_prefix() {
        let mut decoder = FrameDecoder::default();
        assert_eq!(decoder.decode(&[0, 22, 0, b'h', b'i']), Frame::Data(b"hi"));
        assert_eq!(decoder.decode(&[0, 22, 0]), Frame::Data(&[22, 0]));
    }

    #[rstest]
    fn error_channel_messages_are_surfaced() {
        let mut decoder = FrameDecoder::default();
        assert_eq!(decoder.decode(&[1, 22, 0]), Frame::Skip);
        assert_eq!(
            decoder.decode(b"\x01connection refused"),
            Frame::Error(String::from("connection refused"))
        );
    }

    /// Accepts one port-forward websocket and echoes its data channel.
    async fn echoing_api_server() -> (u16, oneshot::Receiver<(String, Option<String>)>) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind api server");
        let port = listener.local_addr().expect("api address").port();
        let (seen_tx, seen_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept websocket");
            let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
                let protocol = request
                    .headers()
                    .get(SEC_WEBSOCKET_PROTOCOL)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_owned);
                seen_tx.send((request.uri().to_string(), protocol)).ok();
                response.headers_mut().insert(
                    SEC_WEBSOCKET_PROTOCOL,
                    HeaderValue::from_static(PORT_FORWARD_PROTOCOL),
                );
                Ok(response)
            };
            let mut socket = accept_hdr_async(stream, callback)
                .await
                .expect("websocket handshake");
            socket.send(Message::Binary(vec![0, 22, 0])).await.ok();
            socket.send(Message::Binary(vec![1, 22, 0])).await.ok();
            while let Some(Ok(message)) = socket.next().await {
                if let Message::Binary(bytes) = message {
                    socket.send(Message::Binary(bytes)).await.ok();
                }
            }
        });
        (port, seen_rx)
    }

    #[tokio::test]
    async fn relays_through_the_portforward_stream() {
        let (port, seen) = echoing_api_server().await;
        let dialer = PortForwardDialer::new(
            format!("ws://127.0.0.1:{port}/api/v1/namespaces/build/pods/virt-launcher-img1/portforward?ports=22"),
            None,
        );
        let handle = start_tunnel(dialer, 0, DEFAULT_READY_TIMEOUT)
            .await
            .expect("tunnel should start");

        let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, handle.local_port()))
            .await
            .expect("connect to tunnel");
        client.write_all(b"ping").await.expect("write");
        let mut reply = [0_u8; 4];
        client.read_exact(&mut reply).await.expect("read");
        assert_eq!(&reply, b"ping");

        let (uri, protocol) = seen.await.expect("handshake observed");
        assert!(uri.ends_with("/pods/virt-launcher-img1/portforward?ports=22"), "{uri}");
        assert_eq!(protocol.as_deref(), Some(PORT_FORWARD_PROTOCOL));
    }
}
