//! Session engine: two pumps between a north and a south endpoint

use crate::{EngineConfig, EngineError, PumpExit, SessionIdGenerator};
use bytes::{Buf, BytesMut};
use relaykit_proto::{Decoded, TunnelCodec};
use relaykit_router::UdpRoutes;
use relaykit_rules::{Processor, RuleResponse};
use relaykit_transport::{DebugLog, Peer, Relay};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Sent north when a rule rejects the session
pub const FORBIDDEN_RESPONSE: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\r\n";

/// Which end of a UDP tunnel this engine runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelSide {
    /// South is a UDP listener, north is the tunnel
    Local,
    /// South is the tunnel, north fans out to the UDP target
    Remote,
}

enum Mode {
    Plain,
    Udp {
        side: TunnelSide,
        codec: Mutex<TunnelCodec>,
        routes: Arc<UdpRoutes>,
    },
}

/// One proxied session
pub struct Engine {
    id: u64,
    north: Box<dyn Relay>,
    south: Box<dyn Relay>,
    rules: Arc<Processor>,
    config: EngineConfig,
    mode: Mode,
    released: AtomicBool,
    debug: DebugLog,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("side", &self.side())
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}

/// Releases the engine's endpoints when a pump exits, even by unwinding
struct ReleaseOnExit<'a>(&'a Engine);

impl Drop for ReleaseOnExit<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

impl Engine {
    /// Plain session forwarding messages unchanged
    pub fn new(
        ids: &SessionIdGenerator,
        north: Box<dyn Relay>,
        south: Box<dyn Relay>,
        rules: Arc<Processor>,
        config: EngineConfig,
    ) -> Self {
        Self::build(ids.generate(), north, south, rules, config, Mode::Plain)
    }

    /// Session at one end of a UDP tunnel
    #[allow(clippy::too_many_arguments)]
    pub fn new_udp(
        ids: &SessionIdGenerator,
        north: Box<dyn Relay>,
        south: Box<dyn Relay>,
        rules: Arc<Processor>,
        config: EngineConfig,
        routes: Arc<UdpRoutes>,
        side: TunnelSide,
        buffer_size: usize,
    ) -> Self {
        let mode = Mode::Udp {
            side,
            codec: Mutex::new(TunnelCodec::new(buffer_size)),
            routes,
        };
        Self::build(ids.generate(), north, south, rules, config, mode)
    }

    fn build(
        id: u64,
        north: Box<dyn Relay>,
        south: Box<dyn Relay>,
        rules: Arc<Processor>,
        config: EngineConfig,
        mode: Mode,
    ) -> Self {
        north.enable_debug_logs(config.log_north, &format!("e-{}-n", id));
        south.enable_debug_logs(config.log_south, &format!("e-{}-s", id));

        let debug = DebugLog::new();
        debug.enable(config.log_debug, &format!("e-{}", id));

        Self {
            id,
            north,
            south,
            rules,
            config,
            mode,
            released: AtomicBool::new(false),
            debug,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Tunnel side, or `None` for a plain session
    pub fn side(&self) -> Option<TunnelSide> {
        match &self.mode {
            Mode::Plain => None,
            Mode::Udp { side, .. } => Some(*side),
        }
    }

    /// Close both endpoints. Only the first call has any effect.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("[e-{}] Releasing endpoints", self.id);
        self.north.close();
        self.south.close();
    }

    /// Forward south → north until an error or a rule ends the session
    pub async fn process_northbound(&self) -> Result<PumpExit, EngineError> {
        let _release = ReleaseOnExit(self);

        let result = match &self.mode {
            Mode::Plain => self.northbound_plain().await,
            Mode::Udp {
                side: TunnelSide::Local,
                codec,
                routes,
            } => self.northbound_local(codec, routes).await,
            Mode::Udp {
                side: TunnelSide::Remote,
                routes,
                ..
            } => self.northbound_remote(routes).await,
        };

        self.log_exit("northbound", &result);
        result
    }

    /// Forward north → south until an error ends the session
    pub async fn process_southbound(&self) -> Result<PumpExit, EngineError> {
        let _release = ReleaseOnExit(self);

        let result = match &self.mode {
            Mode::Plain => self.southbound_plain().await,
            Mode::Udp {
                side: TunnelSide::Local,
                ..
            } => self.southbound_local().await,
            Mode::Udp {
                side: TunnelSide::Remote,
                codec,
                routes,
            } => self.southbound_remote(codec, routes).await,
        };

        self.log_exit("southbound", &result);
        result
    }

    /// Run both pumps to completion
    pub async fn run(self: Arc<Self>) {
        let northbound = {
            let engine = self.clone();
            tokio::spawn(async move { engine.process_northbound().await })
        };

        let _ = self.process_southbound().await;

        if let Err(e) = northbound.await {
            error!("[e-{}] Northbound pump failed: {}", self.id, e);
        }
        info!("[e-{}] Session ended", self.id);
    }

    fn log_exit(&self, pump: &str, result: &Result<PumpExit, EngineError>) {
        match result {
            Ok(exit) => debug!("[e-{}] {} pump ended: {:?}", self.id, pump, exit),
            Err(e) if e.is_closed() => debug!("[e-{}] {} pump ended: {}", self.id, pump, e),
            Err(e) => warn!("[e-{}] {} pump failed: {}", self.id, pump, e),
        }
    }

    /// Apply the admission rules. `None` means forward the message.
    async fn admit(&self, message: &[u8]) -> Option<PumpExit> {
        match self.rules.allow(message) {
            RuleResponse::Allow | RuleResponse::Undefined => None,
            RuleResponse::DropFlat => {
                self.debug.log_debug("Message dropped by rule", "rules");
                Some(PumpExit::Dropped)
            }
            RuleResponse::RespondFail => {
                self.debug.log_debug("Message rejected by rule", "rules");
                if let Err(e) = self.north.send_msg(FORBIDDEN_RESPONSE).await {
                    debug!("[e-{}] Failed to send rejection: {}", self.id, e);
                }
                Some(PumpExit::Rejected)
            }
        }
    }

    async fn northbound_plain(&self) -> Result<PumpExit, EngineError> {
        loop {
            let (message, _) = self.south.recv_msg().await?;
            if let Some(exit) = self.admit(&message).await {
                return Ok(exit);
            }
            self.north.send_msg(&message).await?;
        }
    }

    async fn southbound_plain(&self) -> Result<PumpExit, EngineError> {
        loop {
            let (message, _) = self.north.recv_msg().await?;
            self.south.send_msg(&message).await?;
        }
    }

    /// Local side: datagrams from local peers become tunnel frames
    async fn northbound_local(
        &self,
        codec: &Mutex<TunnelCodec>,
        routes: &UdpRoutes,
    ) -> Result<PumpExit, EngineError> {
        loop {
            let (datagram, from) = self.south.recv_msg().await?;
            let Some(Peer::Addr(addr)) = from else {
                return Err(EngineError::MissingSource);
            };

            if let Some(exit) = self.admit(&datagram).await {
                return Ok(exit);
            }

            let route = routes.find_or_add_route_by_addr(addr);
            self.debug.log_debug(
                &format!("{} bytes from {} (route {})", datagram.len(), addr, route),
                "north",
            );

            let mut codec = codec.lock().await;
            let frame = codec.encode(&datagram, addr)?;
            self.north.send_msg(frame).await?;
        }
    }

    /// Local side: tunnel frames become datagrams to local peers
    async fn southbound_local(&self) -> Result<PumpExit, EngineError> {
        let mut pending = BytesMut::with_capacity(self.config.buffer_size);
        loop {
            let (message, _) = self.north.recv_msg().await?;
            pending.extend_from_slice(&message);

            while let Decoded::Frame(frame) = TunnelCodec::decode(&pending)? {
                self.south
                    .send_msg_to(frame.payload, Peer::Addr(frame.addr))
                    .await?;
                let consumed = frame.frame_len;
                pending.advance(consumed);
            }
        }
    }

    /// Remote side: tunnel frames become datagrams on per-route sockets
    async fn northbound_remote(&self, routes: &UdpRoutes) -> Result<PumpExit, EngineError> {
        let mut pending = BytesMut::with_capacity(self.config.buffer_size);
        loop {
            let (message, _) = self.south.recv_msg().await?;
            pending.extend_from_slice(&message);

            while let Decoded::Frame(frame) = TunnelCodec::decode(&pending)? {
                if let Some(exit) = self.admit(frame.payload).await {
                    return Ok(exit);
                }

                let route = routes.find_or_add_route_by_addr(frame.addr);
                self.debug.log_debug(
                    &format!("{} bytes for {} (route {})", frame.payload.len(), frame.addr, route),
                    "north",
                );
                self.north
                    .send_msg_to(frame.payload, Peer::Route(route))
                    .await?;
                let consumed = frame.frame_len;
                pending.advance(consumed);
            }
        }
    }

    /// Remote side: replies from the target are framed back into the tunnel
    async fn southbound_remote(
        &self,
        codec: &Mutex<TunnelCodec>,
        routes: &UdpRoutes,
    ) -> Result<PumpExit, EngineError> {
        loop {
            let (datagram, from) = self.north.recv_msg().await?;
            let Some(Peer::Route(route)) = from else {
                return Err(EngineError::MissingSource);
            };
            let addr = routes.find_route_by_id(route)?;

            let mut codec = codec.lock().await;
            let frame = codec.encode(&datagram, addr)?;
            self.south.send_msg(frame).await?;
        }
    }
}
