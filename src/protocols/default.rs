//! `fetchai/default`: raw bytes and generic errors.

use std::collections::BTreeMap;

use crate::protocol::{
    Body, Encoding, FieldKind, FieldSpec, Message, Performative, PerformativeSpec, ProtocolSchema,
    SchemaViolation,
};

pub static SCHEMA: ProtocolSchema = ProtocolSchema {
    author: "fetchai",
    name: "default",
    version: "0.1.0",
    encoding: Encoding::TypeTagged,
    performatives: &[
        PerformativeSpec {
            name: "bytes",
            fields: &[FieldSpec::required("content", FieldKind::Bytes)],
        },
        PerformativeSpec {
            name: "error",
            fields: &[
                FieldSpec::required("error_code", FieldKind::Int),
                FieldSpec::required("error_msg", FieldKind::Str),
                FieldSpec::required("error_data", FieldKind::StrMap),
            ],
        },
    ],
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultPerformative {
    Bytes,
    Error,
}

impl Performative for DefaultPerformative {
    fn schema() -> &'static ProtocolSchema {
        &SCHEMA
    }

    fn as_str(self) -> &'static str {
        match self {
            DefaultPerformative::Bytes => "bytes",
            DefaultPerformative::Error => "error",
        }
    }
}

/// Error codes carried by `error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum ErrorCode {
    UnsupportedProtocol = 0,
    DecodingError = 1,
    InvalidMessage = 2,
    UnsupportedSkill = 3,
    InvalidDialogue = 4,
}

/// Opening `bytes` message.
pub fn bytes(content: impl Into<Vec<u8>>) -> Result<Message, SchemaViolation> {
    Message::opening(
        DefaultPerformative::Bytes,
        Body::new().with("content", content.into()),
    )
}

/// Opening `error` message.
pub fn error(
    code: ErrorCode,
    message: impl Into<String>,
    data: BTreeMap<String, String>,
) -> Result<Message, SchemaViolation> {
    Message::opening(
        DefaultPerformative::Error,
        Body::new()
            .with("error_code", code as i64)
            .with("error_msg", message.into())
            .with("error_data", data),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_message() {
        let msg = bytes(b"hello".to_vec()).unwrap();
        assert_eq!(msg.get_bytes("content").unwrap(), b"hello");
        assert_eq!(msg.protocol_id().to_string(), "fetchai/default:0.1.0");
    }

    #[test]
    fn test_error_message() {
        let msg = error(ErrorCode::DecodingError, "bad payload", BTreeMap::new()).unwrap();
        assert_eq!(msg.get_int("error_code").unwrap(), 1);
        assert_eq!(msg.get_str("error_msg").unwrap(), "bad payload");
    }
}
