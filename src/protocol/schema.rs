//! Registry of known protocol schemas, keyed by protocol id.

use std::collections::HashMap;

use super::message::{Message, MessageError};
use super::types::{ProtocolId, ProtocolSchema};

#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    schemas: HashMap<ProtocolId, &'static ProtocolSchema>,
}

impl SchemaRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            schemas: HashMap::new(),
        }
    }

    /// Registry with every built-in protocol.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for schema in crate::protocols::builtin() {
            registry.register(schema);
        }
        registry
    }

    /// Register a schema, replacing any previous one with the same id.
    pub fn register(&mut self, schema: &'static ProtocolSchema) {
        if self.schemas.insert(schema.protocol_id(), schema).is_some() {
            tracing::warn!("Replaced schema for protocol {}", schema);
        }
    }

    pub fn get(&self, protocol_id: &ProtocolId) -> Option<&'static ProtocolSchema> {
        self.schemas.get(protocol_id).copied()
    }

    pub fn contains(&self, protocol_id: &ProtocolId) -> bool {
        self.schemas.contains_key(protocol_id)
    }

    /// Decode and validate a serialized message of a registered protocol.
    pub fn decode(&self, protocol_id: &ProtocolId, bytes: &[u8]) -> Result<Message, MessageError> {
        let schema = self
            .get(protocol_id)
            .ok_or_else(|| MessageError::UnknownProtocol(protocol_id.to_string()))?;
        Message::decode(schema, bytes)
    }

    /// Registered schemas, sorted by protocol id.
    pub fn schemas(&self) -> Vec<&'static ProtocolSchema> {
        let mut schemas: Vec<_> = self.schemas.values().copied().collect();
        schemas.sort_by_key(|s| s.protocol_id());
        schemas
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_registered() {
        let registry = SchemaRegistry::with_defaults();
        let oef: ProtocolId = "fetchai/oef:0.1.0".parse().unwrap();
        assert!(registry.contains(&oef));
        assert_eq!(registry.schemas().len(), 4);
    }

    #[test]
    fn test_decode_unknown_protocol() {
        let registry = SchemaRegistry::new();
        let id: ProtocolId = "fetchai/oef:0.1.0".parse().unwrap();
        assert!(matches!(
            registry.decode(&id, b"{}"),
            Err(MessageError::UnknownProtocol(_))
        ));
    }
}
