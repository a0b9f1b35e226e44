//! Error types for agentmux.

use thiserror::Error;

use crate::connection::ConnectionError;
use crate::dispatcher::DispatchError;
use crate::multiplexer::MultiplexerError;
use crate::protocol::{EnvelopeError, MessageError, PublicIdError, SchemaViolation};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    PublicId(#[from] PublicIdError),

    #[error("Schema violation: {0}")]
    Schema(#[from] SchemaViolation),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Multiplexer error: {0}")]
    Multiplexer(#[from] MultiplexerError),
}
