//! Transport endpoints for the relay engine
//!
//! Every concrete transport (plain TCP, TLS, WebSocket, UDP) is exposed to the
//! engine through the [`Relay`] trait. An endpoint is owned by exactly one
//! engine session, which drives it from two tasks at once: one receiving, one
//! sending. Implementations therefore take `&self` and lock internally.
//!
//! # Deadlines and teardown
//!
//! Each send and receive runs under the endpoint's configured timeout and
//! fails with [`RelayError::Timeout`] rather than blocking forever.
//! [`Relay::close`] is synchronous and idempotent; it cancels every pending
//! and future operation on the endpoint, so a task blocked in `recv_msg`
//! returns [`RelayError::ConnectionClosed`] as soon as the other task closes.

pub mod debug_log;
pub mod stream;
pub mod tls;
pub mod udp;
pub mod websocket;

pub use debug_log::DebugLog;
pub use stream::StreamRelay;
pub use tls::TlsClientConfig;
pub use udp::{UdpClientRelay, UdpListenerRelay};
pub use websocket::WebSocketRelay;

use async_trait::async_trait;
use bytes::Bytes;
use relaykit_proto::RouteId;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// Transport errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Unsupported peer for this endpoint: {0:?}")]
    UnsupportedPeer(Option<Peer>),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

pub type RelayResult<T> = Result<T, RelayError>;

/// Source or destination of a message on an address-aware endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Peer {
    /// A UDP socket address
    Addr(SocketAddr),
    /// A route on the remote side of a UDP tunnel
    Route(RouteId),
}

/// A connected transport endpoint
#[async_trait]
pub trait Relay: Send + Sync {
    /// Dial the endpoint. Endpoints wrapped around an existing connection
    /// are already connected and return `Ok(())`.
    async fn connect(&self) -> RelayResult<()>;

    /// Close the endpoint. Safe to call repeatedly and from any task.
    fn close(&self);

    /// Send one message
    async fn send_msg(&self, data: &[u8]) -> RelayResult<()>;

    /// Send one message to a specific peer. Stream endpoints have a single
    /// peer and ignore `to`.
    async fn send_msg_to(&self, data: &[u8], to: Peer) -> RelayResult<()> {
        let _ = to;
        self.send_msg(data).await
    }

    /// Receive one message, with its source when the transport knows it
    async fn recv_msg(&self) -> RelayResult<(Bytes, Option<Peer>)>;

    /// Toggle per-endpoint diagnostic logging
    fn enable_debug_logs(&self, enabled: bool, correlation_id: &str);
}

/// Byte streams a [`StreamRelay`] or [`WebSocketRelay`] can run over
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Boxed byte stream (plain TCP, TLS, in-memory duplex, ...)
pub type BoxedIo = Box<dyn Io>;

/// Run `fut` under a deadline, aborting early when `shutdown` fires
pub(crate) async fn guarded<T, F>(
    shutdown: &CancellationToken,
    timeout: Duration,
    fut: F,
) -> RelayResult<T>
where
    F: Future<Output = RelayResult<T>>,
{
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(RelayError::ConnectionClosed),
        res = tokio::time::timeout(timeout, fut) => match res {
            Ok(inner) => inner,
            Err(_) => Err(RelayError::Timeout),
        },
    }
}
