//! Addressed envelopes and the `to,sender,protocol_id,payload` line format.

use std::fmt;

use thiserror::Error;

use super::message::{Message, MessageError};
use super::schema::SchemaRegistry;
use super::types::{Address, ProtocolId, PublicIdError};

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Malformed envelope line: {0}")]
    Malformed(String),

    #[error(transparent)]
    ProtocolId(#[from] PublicIdError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("Payload cannot be written on one line: {0}")]
    Payload(String),
}

/// Envelope contents: a validated message or its serialized bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Message(Message),
    Bytes(Vec<u8>),
}

impl Payload {
    /// Serialized form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        match self {
            Payload::Message(message) => message.encode(),
            Payload::Bytes(bytes) => Ok(bytes.clone()),
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Payload::Message(message) => Some(message),
            Payload::Bytes(_) => None,
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Message(message) => write!(f, "{}", message),
            Payload::Bytes(bytes) => write!(f, "{}", String::from_utf8_lossy(bytes)),
        }
    }
}

/// Addressed container for one protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Recipient address
    pub to: Address,
    /// Sender address
    pub sender: Address,
    /// Protocol the payload obeys
    pub protocol_id: ProtocolId,
    /// The payload
    pub message: Payload,
}

impl Envelope {
    /// Wrap a message; the protocol id is taken from it.
    pub fn new(to: impl Into<Address>, sender: impl Into<Address>, message: Message) -> Self {
        Self {
            to: to.into(),
            sender: sender.into(),
            protocol_id: message.protocol_id(),
            message: Payload::Message(message),
        }
    }

    /// Wrap already serialized bytes.
    pub fn with_bytes(
        to: impl Into<Address>,
        sender: impl Into<Address>,
        protocol_id: ProtocolId,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            to: to.into(),
            sender: sender.into(),
            protocol_id,
            message: Payload::Bytes(bytes),
        }
    }

    /// Response to this envelope: addresses reversed, protocol from the reply.
    pub fn response(&self, message: Message) -> Self {
        Self::new(self.sender.clone(), self.to.clone(), message)
    }

    /// Same envelope sent back to its sender.
    pub fn mirrored(&self) -> Self {
        Self {
            to: self.sender.clone(),
            sender: self.to.clone(),
            protocol_id: self.protocol_id.clone(),
            message: self.message.clone(),
        }
    }

    /// The payload as a validated message, decoding bytes when needed.
    pub fn decode_message(&self, registry: &SchemaRegistry) -> Result<Message, MessageError> {
        match &self.message {
            Payload::Message(message) => Ok(message.clone()),
            Payload::Bytes(bytes) => registry.decode(&self.protocol_id, bytes),
        }
    }

    /// Encode as a single `to,sender,protocol_id,payload` line, without newline.
    pub fn encode_line(&self) -> Result<String, EnvelopeError> {
        for (name, address) in [("to", &self.to), ("sender", &self.sender)] {
            if address.contains(',') || address.contains('\n') {
                return Err(EnvelopeError::Malformed(format!(
                    "'{}' address '{}' contains a separator",
                    name, address
                )));
            }
        }

        let payload = String::from_utf8(self.message.to_bytes()?)
            .map_err(|e| EnvelopeError::Payload(e.to_string()))?;
        if payload.contains('\n') {
            return Err(EnvelopeError::Payload("payload contains a newline".to_string()));
        }

        Ok(format!(
            "{},{},{},{}",
            self.to, self.sender, self.protocol_id, payload
        ))
    }

    /// Decode one line. Payloads of registered protocols are validated into
    /// messages; other payloads stay as bytes.
    pub fn decode_line(line: &str, registry: &SchemaRegistry) -> Result<Self, EnvelopeError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut parts = line.splitn(4, ',');

        let (to, sender, protocol_id, payload) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(to), Some(sender), Some(protocol_id), Some(payload)) => {
                    (to, sender, protocol_id, payload)
                }
                _ => {
                    return Err(EnvelopeError::Malformed(format!(
                        "expected 4 comma separated fields in '{}'",
                        line
                    )))
                }
            };

        let protocol_id: ProtocolId = protocol_id.parse()?;
        let message = if registry.contains(&protocol_id) {
            Payload::Message(registry.decode(&protocol_id, payload.as_bytes())?)
        } else {
            Payload::Bytes(payload.as_bytes().to_vec())
        };

        Ok(Self {
            to: to.to_string(),
            sender: sender.to_string(),
            protocol_id,
            message,
        })
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Envelope(to={}, sender={}, protocol_id={}, message={})",
            self.to, self.sender, self.protocol_id, self.message
        )
    }
}
