//! UDP-over-tunnel framing
//!
//! Every datagram that crosses the tunnel is prefixed with a fixed 26 byte
//! little-endian header:
//!
//! | Field   | Size | Meaning                                   |
//! |---------|------|-------------------------------------------|
//! | flags   | 2    | bit0 = UDP frame, bit1 = IPv6 address      |
//! | address | 16   | IPv4 in the first 4 bytes, or full IPv6    |
//! | port    | 4    | UDP port                                  |
//! | length  | 4    | payload bytes that follow the header      |

use crate::{FLAG_IPV6, FLAG_UDP, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use bytes::{BufMut, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

const ADDR_SLOT: usize = 16;
const ADDR_OFFSET: usize = 2;
const PORT_OFFSET: usize = ADDR_OFFSET + ADDR_SLOT;
const LEN_OFFSET: usize = PORT_OFFSET + 4;

/// Framing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Not a UDP frame (flags {0:#06x})")]
    NotUdp(u16),

    #[error("Invalid port in frame header: {0}")]
    InvalidPort(u32),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

/// A complete frame found at the start of a decode buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpFrame<'a> {
    /// Address carried in the header
    pub addr: SocketAddr,
    /// Exactly the declared number of payload bytes
    pub payload: &'a [u8],
    /// Header plus payload; the offset of the next frame in the buffer
    pub frame_len: usize,
}

/// Result of a decode attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<'a> {
    /// The buffer does not hold a complete frame yet. Append more bytes and
    /// decode the enlarged buffer again.
    NeedMore,
    Frame(UdpFrame<'a>),
}

/// Per-session frame encoder/decoder
///
/// The encoder keeps a header scratch area and one output buffer that is
/// reset on every [`TunnelCodec::encode`] call.
#[derive(Debug)]
pub struct TunnelCodec {
    header: [u8; HEADER_SIZE],
    buf: BytesMut,
}

impl TunnelCodec {
    /// Create a codec whose output buffer starts with room for `capacity`
    /// payload bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            header: [0u8; HEADER_SIZE],
            buf: BytesMut::with_capacity(HEADER_SIZE + capacity),
        }
    }

    fn put_header(&mut self, from: SocketAddr, payload_len: usize) {
        let (flags, slot) = match from.ip() {
            IpAddr::V4(ip) => {
                let mut slot = [0u8; ADDR_SLOT];
                slot[..4].copy_from_slice(&ip.octets());
                (FLAG_UDP, slot)
            }
            IpAddr::V6(ip) => (FLAG_UDP | FLAG_IPV6, ip.octets()),
        };

        self.header[..ADDR_OFFSET].copy_from_slice(&flags.to_le_bytes());
        self.header[ADDR_OFFSET..PORT_OFFSET].copy_from_slice(&slot);
        self.header[PORT_OFFSET..LEN_OFFSET].copy_from_slice(&u32::from(from.port()).to_le_bytes());
        self.header[LEN_OFFSET..].copy_from_slice(&(payload_len as u32).to_le_bytes());
    }

    /// Encode `payload` sent by `from` into a single frame.
    ///
    /// The returned slice borrows the codec's output buffer and is overwritten
    /// by the next call.
    pub fn encode(&mut self, payload: &[u8], from: SocketAddr) -> Result<&[u8], FrameError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }

        self.put_header(from, payload.len());
        self.buf.clear();
        self.buf.reserve(HEADER_SIZE + payload.len());
        self.buf.put_slice(&self.header);
        self.buf.put_slice(payload);
        Ok(&self.buf[..])
    }

    /// Decode the frame at the start of `data`.
    ///
    /// Bytes beyond the first frame are left for the caller, who owns any
    /// accumulation across reads.
    pub fn decode(data: &[u8]) -> Result<Decoded<'_>, FrameError> {
        if data.len() < HEADER_SIZE {
            return Ok(Decoded::NeedMore);
        }

        let flags = u16::from_le_bytes([data[0], data[1]]);
        if flags & FLAG_UDP == 0 {
            return Err(FrameError::NotUdp(flags));
        }

        let mut slot = [0u8; ADDR_SLOT];
        slot.copy_from_slice(&data[ADDR_OFFSET..PORT_OFFSET]);
        let ip = if flags & FLAG_IPV6 != 0 {
            IpAddr::V6(Ipv6Addr::from(slot))
        } else {
            IpAddr::V4(Ipv4Addr::new(slot[0], slot[1], slot[2], slot[3]))
        };

        let port = read_u32(&data[PORT_OFFSET..LEN_OFFSET]);
        let port = u16::try_from(port).map_err(|_| FrameError::InvalidPort(port))?;

        let len = read_u32(&data[LEN_OFFSET..HEADER_SIZE]) as usize;
        if len > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge(len));
        }

        let candidate = &data[HEADER_SIZE..];
        if candidate.len() < len {
            return Ok(Decoded::NeedMore);
        }

        Ok(Decoded::Frame(UdpFrame {
            addr: SocketAddr::new(ip, port),
            payload: &candidate[..len],
            frame_len: HEADER_SIZE + len,
        }))
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(raw)
}
