//! Listeners that accept sessions and hand them to engines

use crate::config::{
    GeneralConfig, ListenerConfig, ListenerKind, NorthConfig, NorthTransport, ServerTlsConfig,
    ServiceConfig,
};
use anyhow::{Context, Result};
use relaykit_engine::{Engine, SessionIdGenerator, TunnelSide};
use relaykit_router::UdpRoutes;
use relaykit_rules::Processor;
use relaykit_transport::tls::build_acceptor;
use relaykit_transport::{
    Relay, StreamRelay, TlsClientConfig, UdpClientRelay, UdpListenerRelay, WebSocketRelay,
};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// State shared by all listeners
#[derive(Clone)]
struct Shared {
    general: Arc<GeneralConfig>,
    tls: TlsClientConfig,
    rules: Arc<Processor>,
    ids: SessionIdGenerator,
}

impl Shared {
    fn new(config: &ServiceConfig) -> Result<Self> {
        let rules = Processor::from_config(&config.rules).context("Invalid rules")?;
        Ok(Self {
            general: Arc::new(config.general.clone()),
            tls: config.general.tls_client(),
            rules: Arc::new(rules),
            ids: SessionIdGenerator::new(),
        })
    }

    /// Build the north endpoint of a new session (not yet connected)
    fn north(&self, north: &NorthConfig) -> Result<Box<dyn Relay>> {
        let timeout = self.general.timeout();
        let buffer_size = self.general.buffer_size;

        let relay: Box<dyn Relay> = match north.transport {
            NorthTransport::Tcp => {
                Box::new(StreamRelay::tcp(&north.endpoint, timeout).with_buffer_size(buffer_size))
            }
            NorthTransport::Tls => Box::new(
                StreamRelay::tls(&north.endpoint, &self.tls, timeout)?
                    .with_buffer_size(buffer_size),
            ),
            NorthTransport::Ws => Box::new(WebSocketRelay::dial(
                &north.endpoint,
                &self.tls,
                timeout,
            )?),
        };
        Ok(relay)
    }
}

/// The relay service: one task per configured listener
pub struct Service {
    listeners: Vec<ListenerConfig>,
    shared: Shared,
}

impl Service {
    pub fn new(config: ServiceConfig) -> Result<Self> {
        let shared = Shared::new(&config)?;
        Ok(Self {
            listeners: config.listeners,
            shared,
        })
    }

    /// Run every listener until one fails
    pub async fn run(self) -> Result<()> {
        let mut tasks = JoinSet::new();

        for listener in self.listeners {
            let shared = self.shared.clone();
            tasks.spawn(async move {
                let name = listener.name.clone();
                run_listener(listener, shared)
                    .await
                    .with_context(|| format!("Listener {} failed", name))
            });
        }

        while let Some(joined) = tasks.join_next().await {
            joined.context("Listener task panicked")??;
        }
        Ok(())
    }
}

async fn run_listener(listener: ListenerConfig, shared: Shared) -> Result<()> {
    match listener.kind {
        ListenerKind::Tcp {
            north,
            tls,
            websocket,
        } => {
            let acceptor = tls.as_ref().map(server_acceptor).transpose()?;
            let tcp = bind_tcp(&listener.name, &listener.bind).await?;
            serve_tcp(tcp, north, acceptor, websocket, shared).await
        }
        ListenerKind::UdpLocal { north } => {
            serve_udp_local(&listener.name, &listener.bind, north, shared).await
        }
        ListenerKind::UdpRemote {
            target,
            tls,
            websocket,
        } => {
            let acceptor = tls.as_ref().map(server_acceptor).transpose()?;
            let tcp = bind_tcp(&listener.name, &listener.bind).await?;
            serve_udp_remote(tcp, target, acceptor, websocket, shared).await
        }
    }
}

fn server_acceptor(tls: &ServerTlsConfig) -> Result<TlsAcceptor> {
    build_acceptor(&tls.cert, &tls.key).context("Failed to load tunnel certificate")
}

async fn bind_tcp(name: &str, bind: &str) -> Result<TcpListener> {
    let tcp = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("Listener {} accepting on {}", name, tcp.local_addr()?);
    Ok(tcp)
}

/// Relay each accepted client to its own north connection
async fn serve_tcp(
    tcp: TcpListener,
    north: NorthConfig,
    acceptor: Option<TlsAcceptor>,
    websocket: bool,
    shared: Shared,
) -> Result<()> {
    loop {
        let (socket, peer_addr) = tcp.accept().await.context("Accept failed")?;
        let _ = socket.set_nodelay(true);
        let conn_id = format!("conn-{}", Uuid::new_v4());
        debug!("[{}] Accepted TCP connection from {}", conn_id, peer_addr);

        let north = north.clone();
        let acceptor = acceptor.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            let south = match accept_tunnel(socket, acceptor, websocket, &shared).await {
                Ok(relay) => relay,
                Err(e) => {
                    warn!("[{}] Client handshake failed: {:#}", conn_id, e);
                    return;
                }
            };

            let north_relay = match shared.north(&north) {
                Ok(relay) => relay,
                Err(e) => {
                    error!("[{}] Invalid north endpoint: {:#}", conn_id, e);
                    return;
                }
            };
            if let Err(e) = north_relay.connect().await {
                warn!(
                    "[{}] Failed to connect to {}: {}",
                    conn_id, north.endpoint, e
                );
                return;
            }

            let engine = Arc::new(Engine::new(
                &shared.ids,
                north_relay,
                south,
                shared.rules.clone(),
                shared.general.engine_config(),
            ));
            debug!("[{}] Session e-{} started", conn_id, engine.id());
            engine.run().await;
        });
    }
}

/// Carry datagrams on `bind` through a north tunnel, re-dialing the tunnel
/// whenever it fails
async fn serve_udp_local(
    name: &str,
    bind: &str,
    north: NorthConfig,
    shared: Shared,
) -> Result<()> {
    let routes = Arc::new(UdpRoutes::new());
    let general = shared.general.clone();

    loop {
        let north_relay = shared.north(&north)?;
        match north_relay.connect().await {
            Ok(()) => {
                let south = UdpListenerRelay::bind(bind, general.timeout());
                south
                    .connect()
                    .await
                    .with_context(|| format!("Failed to bind UDP {}", bind))?;
                info!(
                    "Listener {} tunneling UDP {} via {}",
                    name, bind, north.endpoint
                );

                let engine = Arc::new(Engine::new_udp(
                    &shared.ids,
                    north_relay,
                    Box::new(south),
                    shared.rules.clone(),
                    general.engine_config(),
                    routes.clone(),
                    TunnelSide::Local,
                    general.buffer_size,
                ));
                engine.run().await;
                info!(
                    "Listener {} tunnel closed, redialing in {:?}",
                    name,
                    general.redial_delay()
                );
            }
            Err(e) => {
                warn!(
                    "Listener {} failed to dial {}: {}, retrying in {:?}",
                    name,
                    north.endpoint,
                    e,
                    general.redial_delay()
                );
            }
        }
        tokio::time::sleep(general.redial_delay()).await;
    }
}

/// Accept tunnel connections and deliver their datagrams to `target`
async fn serve_udp_remote(
    tcp: TcpListener,
    target: String,
    acceptor: Option<TlsAcceptor>,
    websocket: bool,
    shared: Shared,
) -> Result<()> {
    let routes = Arc::new(UdpRoutes::new());

    loop {
        let (socket, peer_addr) = tcp.accept().await.context("Accept failed")?;
        let _ = socket.set_nodelay(true);
        let conn_id = format!("conn-{}", Uuid::new_v4());
        debug!("[{}] Accepted tunnel connection from {}", conn_id, peer_addr);

        let target = target.clone();
        let acceptor = acceptor.clone();
        let routes = routes.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            let timeout = shared.general.timeout();
            let south = accept_tunnel(socket, acceptor, websocket, &shared).await;
            let south = match south {
                Ok(relay) => relay,
                Err(e) => {
                    warn!("[{}] Tunnel handshake failed: {:#}", conn_id, e);
                    return;
                }
            };

            let north = UdpClientRelay::new(target.as_str(), timeout);
            if let Err(e) = north.connect().await {
                warn!("[{}] Failed to resolve {}: {}", conn_id, target, e);
                return;
            }

            let engine = Arc::new(Engine::new_udp(
                &shared.ids,
                Box::new(north),
                south,
                shared.rules.clone(),
                shared.general.engine_config(),
                routes,
                TunnelSide::Remote,
                shared.general.buffer_size,
            ));
            debug!("[{}] Session e-{} started", conn_id, engine.id());
            engine.run().await;
        });
    }
}

/// Run the TLS and WebSocket handshakes an accepted connection needs
async fn accept_tunnel(
    socket: TcpStream,
    acceptor: Option<TlsAcceptor>,
    websocket: bool,
    shared: &Shared,
) -> Result<Box<dyn Relay>> {
    let timeout = shared.general.timeout();
    let buffer_size = shared.general.buffer_size;

    let relay: Box<dyn Relay> = match (acceptor, websocket) {
        (Some(acceptor), true) => {
            let tls = acceptor.accept(socket).await?;
            Box::new(WebSocketRelay::accept(tls, timeout).await?)
        }
        (Some(acceptor), false) => {
            let tls = acceptor.accept(socket).await?;
            Box::new(StreamRelay::from_stream(tls, timeout).with_buffer_size(buffer_size))
        }
        (None, true) => Box::new(WebSocketRelay::accept(socket, timeout).await?),
        (None, false) => {
            Box::new(StreamRelay::from_stream(socket, timeout).with_buffer_size(buffer_size))
        }
    };
    Ok(relay)
}
