//! `fetchai/contract_api`: contract deployment, calls and state reads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ledger_api::RawTransaction;
use crate::protocol::{
    CustomKind, CustomType, Encoding, FieldKind, FieldSpec, Performative, PerformativeSpec, ProtocolSchema,
};

const CALL_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("ledger_id", FieldKind::Str),
    FieldSpec::required("contract_id", FieldKind::Str),
    FieldSpec::required("contract_address", FieldKind::Str),
    FieldSpec::required("callable", FieldKind::Str),
    FieldSpec::required("kwargs", FieldKind::Custom(CustomKind::of::<Kwargs>())),
];

pub static SCHEMA: ProtocolSchema = ProtocolSchema {
    author: "fetchai",
    name: "contract_api",
    version: "0.1.0",
    encoding: Encoding::Structured,
    performatives: &[
        PerformativeSpec {
            name: "get_deploy_transaction",
            fields: &[
                FieldSpec::required("ledger_id", FieldKind::Str),
                FieldSpec::required("contract_id", FieldKind::Str),
                FieldSpec::required("callable", FieldKind::Str),
                FieldSpec::required("kwargs", FieldKind::Custom(CustomKind::of::<Kwargs>())),
            ],
        },
        PerformativeSpec {
            name: "get_raw_transaction",
            fields: CALL_FIELDS,
        },
        PerformativeSpec {
            name: "get_raw_message",
            fields: CALL_FIELDS,
        },
        PerformativeSpec {
            name: "get_state",
            fields: CALL_FIELDS,
        },
        PerformativeSpec {
            name: "state",
            fields: &[FieldSpec::required("state", FieldKind::Custom(CustomKind::of::<State>()))],
        },
        PerformativeSpec {
            name: "raw_transaction",
            fields: &[FieldSpec::required(
                "raw_transaction",
                FieldKind::Custom(CustomKind::of::<RawTransaction>()),
            )],
        },
        PerformativeSpec {
            name: "raw_message",
            fields: &[FieldSpec::required(
                "raw_message",
                FieldKind::Custom(CustomKind::of::<RawMessage>()),
            )],
        },
        PerformativeSpec {
            name: "error",
            fields: &[
                FieldSpec::optional("code", FieldKind::Int),
                FieldSpec::optional("message", FieldKind::Str),
                FieldSpec::required("data", FieldKind::Bytes),
            ],
        },
    ],
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractApiPerformative {
    GetDeployTransaction,
    GetRawTransaction,
    GetRawMessage,
    GetState,
    State,
    RawTransaction,
    RawMessage,
    Error,
}

impl Performative for ContractApiPerformative {
    fn schema() -> &'static ProtocolSchema {
        &SCHEMA
    }

    fn as_str(self) -> &'static str {
        match self {
            ContractApiPerformative::GetDeployTransaction => "get_deploy_transaction",
            ContractApiPerformative::GetRawTransaction => "get_raw_transaction",
            ContractApiPerformative::GetRawMessage => "get_raw_message",
            ContractApiPerformative::GetState => "get_state",
            ContractApiPerformative::State => "state",
            ContractApiPerformative::RawTransaction => "raw_transaction",
            ContractApiPerformative::RawMessage => "raw_message",
            ContractApiPerformative::Error => "error",
        }
    }
}

/// Keyword arguments of a contract callable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kwargs(pub BTreeMap<String, serde_json::Value>);

impl CustomType for Kwargs {
    const TYPE_NAME: &'static str = "Kwargs";
}

/// Contract state as returned by a read-only callable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub ledger_id: String,
    pub body: serde_json::Value,
}

impl CustomType for State {
    const TYPE_NAME: &'static str = "State";
}

/// Message to be signed, produced by a contract callable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    pub ledger_id: String,
    pub body: String,
    #[serde(default)]
    pub is_deprecated_mode: bool,
}

impl CustomType for RawMessage {
    const TYPE_NAME: &'static str = "RawMessage";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Body, Message};

    #[test]
    fn test_get_state_arity() {
        let call = Body::new()
            .with("ledger_id", "fetchai")
            .with("contract_id", "fetchai/erc1155:0.1.0")
            .with("contract_address", "0xabc")
            .with("callable", "get_balance")
            .with_custom("kwargs", &Kwargs::default())
            .unwrap();
        assert!(Message::opening(ContractApiPerformative::GetState, call.clone()).is_ok());

        // deploy transactions have no contract address yet
        let err = Message::opening(ContractApiPerformative::GetDeployTransaction, call).unwrap_err();
        assert!(err.to_string().contains("contract_address"));
    }
}
