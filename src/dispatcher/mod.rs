//! Request dispatchers: turn an envelope into a pending operation against an
//! external service.
//!
//! Dispatchers never fail an operation for a backend error; the operation
//! resolves to the protocol's `error` message instead. Only requests the
//! dispatcher cannot understand are rejected synchronously.

pub mod contract;
pub mod ledger;

use futures::future::BoxFuture;
use thiserror::Error;

use crate::protocol::{
    Body, CustomType, Envelope, Message, MessageError, Payload, ProtocolId, ProtocolSchema,
    SchemaViolation,
};

pub use contract::{ContractApi, ContractApiRequestDispatcher, ContractCall};
pub use ledger::{LedgerApi, LedgerApiRequestDispatcher, Settlement};

/// Backend call failed.
pub const ERROR_CODE_BACKEND: i64 = 1;
/// No backend configured for the requested ledger.
pub const ERROR_CODE_UNKNOWN_LEDGER: i64 = 2;
/// Backend did not produce a result in time.
pub const ERROR_CODE_TIMEOUT: i64 = 3;

/// Asynchronous work started from one envelope. Resolves to the response
/// message, or `None` when the request expects no response.
pub type PendingOperation = BoxFuture<'static, Option<Message>>;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Protocol not supported: {0}")]
    UnsupportedProtocol(ProtocolId),

    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] MessageError),

    #[error("Performative '{0}' is not a request")]
    NotARequest(String),
}

/// Failure reported by an external backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (code {code})")]
pub struct BackendError {
    pub code: i64,
    pub message: String,
}

impl BackendError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Generic backend failure.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::new(ERROR_CODE_BACKEND, message)
    }
}

/// Executes the requests of one protocol.
pub trait RequestDispatcher: Send + Sync {
    /// Protocol this dispatcher serves.
    fn protocol_id(&self) -> ProtocolId;

    /// Start the operation for a request envelope without waiting for it.
    fn dispatch(&self, envelope: &Envelope) -> Result<PendingOperation, DispatchError>;
}

/// The request message of an envelope, checked to belong to `schema`.
pub(crate) fn request_message(
    envelope: &Envelope,
    schema: &'static ProtocolSchema,
) -> Result<Message, DispatchError> {
    if envelope.protocol_id != schema.protocol_id() {
        return Err(DispatchError::UnsupportedProtocol(envelope.protocol_id.clone()));
    }
    let request = match &envelope.message {
        Payload::Message(message) if std::ptr::eq(message.protocol(), schema) => message.clone(),
        Payload::Message(message) => {
            return Err(DispatchError::UnsupportedProtocol(message.protocol_id()))
        }
        Payload::Bytes(bytes) => Message::decode(schema, bytes)?,
    };

    // Every outcome is a reply, which needs the next message id.
    if request.message_id() == i64::MAX {
        return Err(MessageError::from(SchemaViolation::DialogueExhausted {
            message_id: request.message_id(),
        })
        .into());
    }
    Ok(request)
}

/// Reply contents holding a single custom-typed field.
pub(crate) fn custom_body<T: CustomType>(field: &str, value: &T) -> Result<Body, BackendError> {
    Body::new()
        .with_custom(field, value)
        .map_err(|e| BackendError::backend(format!("Could not encode '{}': {}", field, e)))
}
