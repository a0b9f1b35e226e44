//! Protocol messages and the Light Protocol consistency rules.
//!
//! A [`Message`] can only be obtained through a constructor that validates it
//! against its protocol schema:
//! - the performative belongs to the protocol
//! - the contents are exactly the fields declared for the performative, each
//!   with its declared type
//! - `message_id == 1` implies `target == 0`, otherwise `0 < target < message_id`

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use super::types::{
    json_type_name, Body, CustomType, Encoding, FieldKind, Performative, PerformativeSpec, ProtocolId,
    ProtocolSchema, Value,
};

/// Conversation identifier pair (starter reference, responder reference).
pub type DialogueReference = (String, String);

/// Bookkeeping keys every message carries besides its contents.
const STRUCTURAL_FIELDS: [&str; 4] = ["performative", "dialogue_reference", "message_id", "target"];

/// A rule of the message schema that an instance broke.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaViolation {
    #[error("Invalid 'performative' for protocol '{protocol}'. Expected either of '{expected}'. Found '{found}'.")]
    Performative {
        protocol: String,
        expected: String,
        found: String,
    },

    #[error("Invalid type for '{field}'. Expected '{expected}'. Found '{found}'.")]
    FieldType {
        field: String,
        expected: String,
        found: String,
    },

    #[error("Incorrect number of contents for '{performative}'. Expected {expected}. Found {found} (missing: {missing:?}, unexpected: {unexpected:?}).")]
    Arity {
        performative: String,
        expected: usize,
        found: usize,
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    #[error("Invalid 'message_id'. Expected a positive integer. Found {message_id}.")]
    MessageId { message_id: i64 },

    #[error("Cannot reply to message {message_id}. The dialogue has no message id left.")]
    DialogueExhausted { message_id: i64 },

    #[error("Invalid 'target'. Expected 0 (because 'message_id' is 1). Found {target}.")]
    OpeningTarget { target: i64 },

    #[error("Invalid 'target'. Expected an integer between 1 and {} inclusive. Found {target}.", .message_id - 1)]
    Target { message_id: i64, target: i64 },

    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// Errors raised when reading or encoding messages.
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Schema violation: {0}")]
    Schema(#[from] SchemaViolation),

    #[error("'{0}' content is not set.")]
    FieldNotSet(String),

    #[error("Content '{field}' is '{found}', not '{expected}'.")]
    FieldType {
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A validated protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    protocol: &'static ProtocolSchema,
    performative: &'static PerformativeSpec,
    dialogue_reference: DialogueReference,
    message_id: i64,
    target: i64,
    body: Body,
}

impl Message {
    /// Construct and validate a message.
    pub fn new<P: Performative>(
        performative: P,
        dialogue_reference: DialogueReference,
        message_id: i64,
        target: i64,
        body: Body,
    ) -> Result<Self, SchemaViolation> {
        Self::from_parts(
            P::schema(),
            performative.as_str(),
            dialogue_reference,
            message_id,
            target,
            body,
        )
    }

    /// Construct the opening message of a dialogue with default bookkeeping
    /// (`("", "")`, id 1, target 0).
    pub fn opening<P: Performative>(performative: P, body: Body) -> Result<Self, SchemaViolation> {
        Self::new(performative, (String::new(), String::new()), 1, 0, body)
    }

    /// Construct a message when the performative is only known by name.
    pub fn from_parts(
        protocol: &'static ProtocolSchema,
        performative: &str,
        dialogue_reference: DialogueReference,
        message_id: i64,
        target: i64,
        body: Body,
    ) -> Result<Self, SchemaViolation> {
        let result = lookup_performative(protocol, performative).and_then(|spec| {
            check_contents(spec, &body)?;
            check_target(message_id, target)?;
            Ok(spec)
        });

        match result {
            Ok(spec) => Ok(Self {
                protocol,
                performative: spec,
                dialogue_reference,
                message_id,
                target,
                body,
            }),
            Err(violation) => {
                tracing::debug!("Rejected '{}' message: {}", protocol, violation);
                Err(violation)
            }
        }
    }

    /// Reply within the same dialogue, responding to this message.
    pub fn reply<P: Performative>(&self, performative: P, body: Body) -> Result<Self, SchemaViolation> {
        let message_id = self
            .message_id
            .checked_add(1)
            .ok_or(SchemaViolation::DialogueExhausted {
                message_id: self.message_id,
            })?;
        Self::new(
            performative,
            self.dialogue_reference.clone(),
            message_id,
            self.message_id,
            body,
        )
    }

    /// Fresh dialogue reference for a dialogue opener.
    pub fn starter_reference() -> DialogueReference {
        (ulid::Ulid::new().to_string(), String::new())
    }

    pub fn protocol(&self) -> &'static ProtocolSchema {
        self.protocol
    }

    pub fn protocol_id(&self) -> ProtocolId {
        self.protocol.protocol_id()
    }

    /// Performative name.
    pub fn performative(&self) -> &'static str {
        self.performative.name
    }

    /// Check the performative against a typed tag.
    pub fn is<P: Performative>(&self, performative: P) -> bool {
        std::ptr::eq(self.protocol, P::schema()) && self.performative.name == performative.as_str()
    }

    pub fn dialogue_reference(&self) -> &DialogueReference {
        &self.dialogue_reference
    }

    pub fn message_id(&self) -> i64 {
        self.message_id
    }

    pub fn target(&self) -> i64 {
        self.target
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn is_set(&self, field: &str) -> bool {
        self.body.contains(field)
    }

    /// Get a content value, failing with `FieldNotSet` when absent.
    pub fn get(&self, field: &str) -> Result<&Value, MessageError> {
        self.body
            .get(field)
            .ok_or_else(|| MessageError::FieldNotSet(field.to_string()))
    }

    pub fn get_str(&self, field: &str) -> Result<&str, MessageError> {
        match self.get(field)? {
            Value::Str(s) => Ok(s),
            other => Err(type_error(field, "str", other)),
        }
    }

    pub fn get_int(&self, field: &str) -> Result<i64, MessageError> {
        match self.get(field)? {
            Value::Int(i) => Ok(*i),
            other => Err(type_error(field, "int", other)),
        }
    }

    pub fn get_bool(&self, field: &str) -> Result<bool, MessageError> {
        match self.get(field)? {
            Value::Bool(b) => Ok(*b),
            other => Err(type_error(field, "bool", other)),
        }
    }

    pub fn get_bytes(&self, field: &str) -> Result<&[u8], MessageError> {
        match self.get(field)? {
            Value::Bytes(b) => Ok(b),
            other => Err(type_error(field, "bytes", other)),
        }
    }

    pub fn get_str_tuple(&self, field: &str) -> Result<&[String], MessageError> {
        match self.get(field)? {
            Value::StrTuple(items) => Ok(items),
            other => Err(type_error(field, "tuple[str]", other)),
        }
    }

    pub fn get_str_map(&self, field: &str) -> Result<&BTreeMap<String, String>, MessageError> {
        match self.get(field)? {
            Value::StrMap(map) => Ok(map),
            other => Err(type_error(field, "dict[str, str]", other)),
        }
    }

    /// Deserialize a custom-typed content.
    pub fn get_custom<T: CustomType>(&self, field: &str) -> Result<T, MessageError> {
        match self.get(field)? {
            Value::Custom(c) if c.type_name() == T::TYPE_NAME => {
                Ok(T::deserialize(c.data())?)
            }
            other => Err(type_error(field, T::TYPE_NAME, other)),
        }
    }

    /// JSON form according to the protocol's encoding.
    pub fn to_json(&self) -> serde_json::Value {
        let contents = self
            .body
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_json()));

        match self.protocol.encoding {
            Encoding::Structured => serde_json::json!({
                "performative": self.performative.name,
                "dialogue_reference": [self.dialogue_reference.0, self.dialogue_reference.1],
                "message_id": self.message_id,
                "target": self.target,
                "body": contents.collect::<serde_json::Map<_, _>>(),
            }),
            Encoding::TypeTagged => {
                let mut record = serde_json::Map::new();
                record.insert("type".to_string(), self.performative.name.into());
                if !self.dialogue_reference.0.is_empty() || !self.dialogue_reference.1.is_empty() {
                    record.insert(
                        "dialogue_reference".to_string(),
                        serde_json::json!([self.dialogue_reference.0, self.dialogue_reference.1]),
                    );
                }
                if self.message_id != 1 || self.target != 0 {
                    record.insert("message_id".to_string(), self.message_id.into());
                    record.insert("target".to_string(), self.target.into());
                }
                record.extend(contents);
                serde_json::Value::Object(record)
            }
        }
    }

    /// Serialized bytes of the message.
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        Ok(serde_json::to_vec(&self.to_json())?)
    }

    /// Decode and validate a message of the given protocol from JSON.
    pub fn from_json(
        protocol: &'static ProtocolSchema,
        json: &serde_json::Value,
    ) -> Result<Self, SchemaViolation> {
        let record = json
            .as_object()
            .ok_or_else(|| SchemaViolation::Malformed(format!("expected a dict, found '{}'", json_type_name(json))))?;

        let (tag_key, contents): (&str, Vec<(&String, &serde_json::Value)>) = match protocol.encoding {
            Encoding::Structured => {
                let contents = match record.get("body") {
                    None => Vec::new(),
                    Some(serde_json::Value::Object(body)) => body.iter().collect(),
                    Some(other) => return Err(field_type("body", "dict", other)),
                };
                ("performative", contents)
            }
            Encoding::TypeTagged => {
                let contents = record
                    .iter()
                    .filter(|(k, _)| k.as_str() != "type" && !STRUCTURAL_FIELDS.contains(&k.as_str()))
                    .collect();
                ("type", contents)
            }
        };

        let performative = match record.get(tag_key) {
            Some(serde_json::Value::String(s)) => s.as_str(),
            Some(other) => return Err(field_type(tag_key, "str", other)),
            None => return Err(SchemaViolation::Malformed(format!("missing '{}'", tag_key))),
        };

        let dialogue_reference = match record.get("dialogue_reference") {
            None => (String::new(), String::new()),
            Some(serde_json::Value::Array(parts)) if parts.len() == 2 => {
                let part = |i: usize| match &parts[i] {
                    serde_json::Value::String(s) => Ok(s.clone()),
                    other => Err(field_type(&format!("dialogue_reference[{}]", i), "str", other)),
                };
                (part(0)?, part(1)?)
            }
            Some(other) => return Err(field_type("dialogue_reference", "tuple[str, str]", other)),
        };

        let integer = |key: &str, default: i64| match record.get(key) {
            None => Ok(default),
            Some(v) => v.as_i64().ok_or_else(|| field_type(key, "int", v)),
        };
        let message_id = integer("message_id", 1)?;
        let target = integer("target", 0)?;

        let spec = lookup_performative(protocol, performative)?;
        let names: Vec<&str> = contents.iter().map(|(k, _)| k.as_str()).collect();
        check_arity(spec, &names)?;

        let mut body = Body::new();
        for (name, raw) in contents {
            // arity check guarantees every name is declared
            if let Some(field) = spec.field(name) {
                let value = Value::from_json(field.kind, raw)
                    .ok_or_else(|| field_type(name, field.kind.name(), raw))?;
                body.insert(name.clone(), value);
            }
        }

        Self::from_parts(protocol, performative, dialogue_reference, message_id, target, body)
    }

    /// Decode and validate a message from serialized bytes.
    pub fn decode(protocol: &'static ProtocolSchema, bytes: &[u8]) -> Result<Self, MessageError> {
        let json: serde_json::Value = serde_json::from_slice(bytes)?;
        Ok(Self::from_json(protocol, &json)?)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message(protocol={}, performative={}, dialogue_reference=({:?}, {:?}), message_id={}, target={}, body={})",
            self.protocol,
            self.performative.name,
            self.dialogue_reference.0,
            self.dialogue_reference.1,
            self.message_id,
            self.target,
            serde_json::Value::Object(
                self.body
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_json()))
                    .collect()
            )
        )
    }
}

fn lookup_performative(
    protocol: &'static ProtocolSchema,
    name: &str,
) -> Result<&'static PerformativeSpec, SchemaViolation> {
    protocol
        .performative(name)
        .ok_or_else(|| SchemaViolation::Performative {
            protocol: protocol.to_string(),
            expected: protocol.performative_names(),
            found: name.to_string(),
        })
}

/// Every declared required field present, nothing undeclared.
fn check_arity(spec: &PerformativeSpec, names: &[&str]) -> Result<(), SchemaViolation> {
    let missing: Vec<String> = spec
        .required()
        .filter(|f| !names.contains(&f.name))
        .map(|f| f.name.to_string())
        .collect();
    let unexpected: Vec<String> = names
        .iter()
        .filter(|name| spec.field(name).is_none())
        .map(|name| name.to_string())
        .collect();

    if missing.is_empty() && unexpected.is_empty() {
        return Ok(());
    }

    let optional_present = spec
        .fields
        .iter()
        .filter(|f| f.optional && names.contains(&f.name))
        .count();

    Err(SchemaViolation::Arity {
        performative: spec.name.to_string(),
        expected: spec.required().count() + optional_present,
        found: names.len(),
        missing,
        unexpected,
    })
}

fn check_contents(spec: &PerformativeSpec, body: &Body) -> Result<(), SchemaViolation> {
    let names: Vec<&str> = body.keys().collect();
    check_arity(spec, &names)?;

    for (name, value) in body.iter() {
        let Some(field) = spec.field(name) else {
            continue;
        };
        if value.kind() != field.kind {
            return Err(SchemaViolation::FieldType {
                field: name.to_string(),
                expected: field.kind.name().to_string(),
                found: value.kind().name().to_string(),
            });
        }
        if let (Value::Custom(custom), FieldKind::Custom(declared)) = (value, field.kind) {
            if !declared.accepts(custom.data()) {
                return Err(field_type(name, declared.name(), custom.data()));
            }
        }
    }
    Ok(())
}

fn check_target(message_id: i64, target: i64) -> Result<(), SchemaViolation> {
    if message_id < 1 {
        return Err(SchemaViolation::MessageId { message_id });
    }
    if message_id == 1 {
        if target != 0 {
            return Err(SchemaViolation::OpeningTarget { target });
        }
    } else if !(0 < target && target < message_id) {
        return Err(SchemaViolation::Target { message_id, target });
    }
    Ok(())
}

fn field_type(field: &str, expected: &str, found: &serde_json::Value) -> SchemaViolation {
    SchemaViolation::FieldType {
        field: field.to_string(),
        expected: expected.to_string(),
        found: json_type_name(found).to_string(),
    }
}

fn type_error(field: &str, expected: &'static str, found: &Value) -> MessageError {
    MessageError::FieldType {
        field: field.to_string(),
        expected,
        found: found.kind().name(),
    }
}
