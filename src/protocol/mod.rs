//! Message schema layer and envelopes.
//!
//! This module defines what may travel over a connection:
//! - Public ids for protocols and connections
//! - Static protocol schemas and typed message contents
//! - Validated messages (the Light Protocol rules)
//! - Addressed envelopes and their line wire format

pub mod envelope;
pub mod message;
pub mod schema;
pub mod types;

pub use envelope::{Envelope, EnvelopeError, Payload};
pub use message::{DialogueReference, Message, MessageError, SchemaViolation};
pub use schema::SchemaRegistry;
pub use types::{
    Address, Body, ConnectionId, CustomKind, CustomType, CustomValue, Encoding, FieldKind, FieldSpec,
    Performative, PerformativeSpec, ProtocolId, ProtocolSchema, PublicId, PublicIdError, Value,
};
