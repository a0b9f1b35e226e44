//! Protocol schema tables shipped with the crate.

pub mod contract_api;
pub mod default;
pub mod ledger_api;
pub mod oef;

use crate::protocol::ProtocolSchema;

/// Schemas registered by `SchemaRegistry::with_defaults`.
pub fn builtin() -> [&'static ProtocolSchema; 4] {
    [
        &default::SCHEMA,
        &oef::SCHEMA,
        &ledger_api::SCHEMA,
        &contract_api::SCHEMA,
    ]
}
