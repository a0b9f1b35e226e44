//! Connections: transport adapters that accept envelopes and yield responses.

pub mod dispatch;
pub mod stub;

use async_trait::async_trait;
use thiserror::Error;

use crate::dispatcher::DispatchError;
use crate::protocol::{ConnectionId, Envelope, EnvelopeError, ProtocolId};

pub use dispatch::DispatchConnection;
pub use stub::StubConnection;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Connection is not connected")]
    NotConnected,

    #[error("Connection {connection} does not support protocol {protocol}")]
    UnsupportedProtocol {
        connection: ConnectionId,
        protocol: ProtocolId,
    },

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        write!(f, "{}", name)
    }
}

/// Transport adapter driven by the multiplexer.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Identity used for routing.
    fn connection_id(&self) -> &ConnectionId;

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    async fn connect(&self) -> Result<(), ConnectionError>;

    /// Tear down; outstanding work is dropped.
    async fn disconnect(&self) -> Result<(), ConnectionError>;

    /// Hand an envelope to the transport without waiting for its outcome.
    async fn send(&self, envelope: Envelope) -> Result<(), ConnectionError>;

    /// Wait for the next result. `Ok(None)` is a slot that produced no envelope.
    async fn receive(&self) -> Result<Option<Envelope>, ConnectionError>;
}
