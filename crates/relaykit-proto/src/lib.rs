//! Tunnel Protocol Definitions
//!
//! This crate defines the wire format used to carry UDP datagrams, together
//! with their origin address, over a single reliable stream tunnel.

pub mod codec;

pub use codec::{Decoded, FrameError, TunnelCodec, UdpFrame};

/// Identifier of a UDP route on the remote side of a tunnel
pub type RouteId = u64;

/// Frame header size: flags (2) + address (16) + port (4) + length (4) = 26 bytes
pub const HEADER_SIZE: usize = 26;

/// Largest payload a single frame may declare (one UDP datagram)
pub const MAX_PAYLOAD_SIZE: usize = 65_535;

/// Flag bit: the frame carries a UDP datagram
pub const FLAG_UDP: u16 = 1;

/// Flag bit: the address slot holds an IPv6 address
pub const FLAG_IPV6: u16 = 1 << 1;
