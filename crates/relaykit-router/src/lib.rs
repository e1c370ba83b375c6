//! Routing for tunnel-multiplexed UDP flows
//!
//! Maps UDP peer addresses to short numeric route identifiers so that replies
//! coming back through the tunnel can be delivered to the right peer.

pub mod udp;

pub use udp::{RouteError, UdpRoutes};
pub use relaykit_proto::RouteId;
