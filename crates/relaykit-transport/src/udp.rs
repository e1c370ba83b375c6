//! UDP endpoints
//!
//! [`UdpListenerRelay`] is the local side of a UDP tunnel: one bound socket
//! that many clients send datagrams to, each identified by its address.
//!
//! [`UdpClientRelay`] is the remote side: it talks to a single target, but
//! gives every tunnel route its own ephemeral socket so replies can be told
//! apart and routed back to the right client.

use crate::{guarded, DebugLog, Peer, Relay, RelayError, RelayResult};
use async_trait::async_trait;
use bytes::Bytes;
use relaykit_proto::{RouteId, MAX_PAYLOAD_SIZE};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Datagrams buffered between route readers and `recv_msg`
const CLIENT_QUEUE_DEPTH: usize = 256;

async fn resolve(addr: &str) -> RelayResult<SocketAddr> {
    lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| RelayError::InvalidAddress(addr.to_string()))
}

/// Bound UDP socket serving many peers
#[derive(Debug)]
pub struct UdpListenerRelay {
    bind_addr: String,
    socket: OnceLock<Arc<UdpSocket>>,
    last_peer: RwLock<Option<SocketAddr>>,
    timeout: Duration,
    shutdown: CancellationToken,
    debug: DebugLog,
}

impl UdpListenerRelay {
    /// Listener that binds `bind_addr` on [`Relay::connect`]
    pub fn bind(bind_addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            socket: OnceLock::new(),
            last_peer: RwLock::new(None),
            timeout,
            shutdown: CancellationToken::new(),
            debug: DebugLog::new(),
        }
    }

    /// Wrap a socket that is already bound
    pub fn from_socket(socket: UdpSocket, timeout: Duration) -> RelayResult<Self> {
        let relay = Self::bind(socket.local_addr()?.to_string(), timeout);
        let _ = relay.socket.set(Arc::new(socket));
        Ok(relay)
    }

    pub fn local_addr(&self) -> RelayResult<SocketAddr> {
        Ok(self.socket()?.local_addr()?)
    }

    fn socket(&self) -> RelayResult<&Arc<UdpSocket>> {
        self.socket.get().ok_or(RelayError::NotConnected)
    }

    fn last_peer(&self) -> Option<SocketAddr> {
        self.last_peer.read().map(|p| *p).unwrap_or_default()
    }
}

#[async_trait]
impl Relay for UdpListenerRelay {
    async fn connect(&self) -> RelayResult<()> {
        if self.socket.get().is_some() {
            return Ok(());
        }

        let socket = UdpSocket::bind(self.bind_addr.as_str()).await?;
        debug!("UDP listener bound on {}", socket.local_addr()?);
        let _ = self.socket.set(Arc::new(socket));
        Ok(())
    }

    fn close(&self) {
        self.shutdown.cancel();
    }

    async fn send_msg(&self, data: &[u8]) -> RelayResult<()> {
        match self.last_peer() {
            Some(addr) => self.send_msg_to(data, Peer::Addr(addr)).await,
            None => Err(RelayError::UnsupportedPeer(None)),
        }
    }

    async fn send_msg_to(&self, data: &[u8], to: Peer) -> RelayResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(RelayError::ConnectionClosed);
        }
        let Peer::Addr(addr) = to else {
            return Err(RelayError::UnsupportedPeer(Some(to)));
        };

        let socket = self.socket()?;
        self.debug.log_data(data, &format!("send {}", addr));
        guarded(&self.shutdown, self.timeout, async {
            socket.send_to(data, addr).await?;
            Ok(())
        })
        .await
    }

    async fn recv_msg(&self) -> RelayResult<(Bytes, Option<Peer>)> {
        if self.shutdown.is_cancelled() {
            return Err(RelayError::ConnectionClosed);
        }

        let socket = self.socket()?;
        let mut buf = vec![0u8; MAX_PAYLOAD_SIZE];
        let (n, from) = guarded(&self.shutdown, self.timeout, async {
            Ok(socket.recv_from(&mut buf).await?)
        })
        .await?;

        if let Ok(mut last) = self.last_peer.write() {
            *last = Some(from);
        }

        let data = Bytes::copy_from_slice(&buf[..n]);
        self.debug.log_data(&data, &format!("recv {}", from));
        Ok((data, Some(Peer::Addr(from))))
    }

    fn enable_debug_logs(&self, enabled: bool, correlation_id: &str) {
        self.debug.enable(enabled, correlation_id);
    }
}

/// UDP client fanning tunnel routes out over one socket per route
#[derive(Debug)]
pub struct UdpClientRelay {
    target: String,
    resolved: OnceLock<SocketAddr>,
    routes: Mutex<HashMap<RouteId, Arc<UdpSocket>>>,
    tx: mpsc::Sender<(RouteId, Bytes)>,
    rx: Mutex<mpsc::Receiver<(RouteId, Bytes)>>,
    timeout: Duration,
    shutdown: CancellationToken,
    debug: Arc<DebugLog>,
}

impl UdpClientRelay {
    /// Client for `target` (`host:port`), resolved on [`Relay::connect`]
    pub fn new(target: impl Into<String>, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        Self {
            target: target.into(),
            resolved: OnceLock::new(),
            routes: Mutex::new(HashMap::new()),
            tx,
            rx: Mutex::new(rx),
            timeout,
            shutdown: CancellationToken::new(),
            debug: Arc::new(DebugLog::new()),
        }
    }

    /// Number of routes that currently own a socket
    pub async fn route_count(&self) -> usize {
        self.routes.lock().await.len()
    }

    fn target(&self) -> RelayResult<SocketAddr> {
        self.resolved.get().copied().ok_or(RelayError::NotConnected)
    }

    async fn route_socket(&self, route: RouteId) -> RelayResult<Arc<UdpSocket>> {
        let mut routes = self.routes.lock().await;
        if let Some(socket) = routes.get(&route) {
            return Ok(socket.clone());
        }

        let target = self.target()?;
        let bind: SocketAddr = if target.is_ipv4() {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        socket.connect(target).await?;
        debug!(
            "Route {} -> {} via {}",
            route,
            target,
            socket.local_addr()?
        );

        tokio::spawn(read_route(
            route,
            socket.clone(),
            self.tx.clone(),
            self.shutdown.child_token(),
            self.debug.clone(),
        ));

        routes.insert(route, socket.clone());
        Ok(socket)
    }
}

async fn read_route(
    route: RouteId,
    socket: Arc<UdpSocket>,
    tx: mpsc::Sender<(RouteId, Bytes)>,
    shutdown: CancellationToken,
    debug: Arc<DebugLog>,
) {
    let mut buf = vec![0u8; MAX_PAYLOAD_SIZE];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            res = socket.recv(&mut buf) => match res {
                Ok(n) => {
                    debug.log_data(&buf[..n], &format!("recv route {}", route));
                    if tx.send((route, Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Route {} reader stopped: {}", route, e);
                    break;
                }
            },
        }
    }
    trace!("Route {} reader exited", route);
}

#[async_trait]
impl Relay for UdpClientRelay {
    async fn connect(&self) -> RelayResult<()> {
        if self.resolved.get().is_some() {
            return Ok(());
        }

        let target = guarded(&self.shutdown, self.timeout, resolve(&self.target)).await?;
        debug!("UDP client targeting {}", target);
        let _ = self.resolved.set(target);
        Ok(())
    }

    fn close(&self) {
        self.shutdown.cancel();
    }

    async fn send_msg(&self, data: &[u8]) -> RelayResult<()> {
        self.send_msg_to(data, Peer::Route(0)).await
    }

    async fn send_msg_to(&self, data: &[u8], to: Peer) -> RelayResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(RelayError::ConnectionClosed);
        }
        let Peer::Route(route) = to else {
            return Err(RelayError::UnsupportedPeer(Some(to)));
        };

        let socket = self.route_socket(route).await?;
        self.debug.log_data(data, &format!("send route {}", route));
        guarded(&self.shutdown, self.timeout, async {
            socket.send(data).await?;
            Ok(())
        })
        .await
    }

    async fn recv_msg(&self) -> RelayResult<(Bytes, Option<Peer>)> {
        if self.shutdown.is_cancelled() {
            return Err(RelayError::ConnectionClosed);
        }

        let mut rx = self.rx.lock().await;
        let (route, data) = guarded(&self.shutdown, self.timeout, async {
            rx.recv().await.ok_or(RelayError::ConnectionClosed)
        })
        .await?;
        Ok((data, Some(Peer::Route(route))))
    }

    fn enable_debug_logs(&self, enabled: bool, correlation_id: &str) {
        self.debug.enable(enabled, correlation_id);
    }
}
