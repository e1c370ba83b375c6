//! Relay engine
//!
//! An [`Engine`] is one proxied session between a south endpoint (facing the
//! client) and a north endpoint (facing the destination). It runs two pumps:
//!
//! - northbound: south → admission rules → north
//! - southbound: north → south
//!
//! In UDP mode the engine sits at one end of a stream tunnel and translates
//! between datagrams and tunnel frames (see [`relaykit_proto::codec`]).

pub mod config;
pub mod engine;
pub mod error;

pub use config::EngineConfig;
pub use engine::{Engine, TunnelSide, FORBIDDEN_RESPONSE};
pub use error::{EngineError, PumpExit};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Hands out session ids for log correlation
#[derive(Debug, Clone)]
pub struct SessionIdGenerator {
    next_id: Arc<AtomicU64>,
}

impl SessionIdGenerator {
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn generate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_increment() {
        let ids = SessionIdGenerator::new();
        assert_eq!(ids.generate(), 1);
        assert_eq!(ids.generate(), 2);

        // Clones share the counter
        let other = ids.clone();
        assert_eq!(other.generate(), 3);
        assert_eq!(ids.generate(), 4);
    }
}
