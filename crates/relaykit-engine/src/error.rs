use relaykit_proto::FrameError;
use relaykit_router::RouteError;
use relaykit_transport::RelayError;
use thiserror::Error;

/// Errors that end a pump
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Transport error: {0}")]
    Relay(#[from] RelayError),

    #[error("Tunnel frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Route error: {0}")]
    Route(#[from] RouteError),

    #[error("Datagram without a usable source peer")]
    MissingSource,
}

impl EngineError {
    /// The peer went away or the session was torn down
    pub fn is_closed(&self) -> bool {
        matches!(self, EngineError::Relay(RelayError::ConnectionClosed))
    }
}

/// How a pump ended without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// A rule dropped the session silently
    Dropped,
    /// A rule rejected the session and the rejection response was sent
    Rejected,
}
