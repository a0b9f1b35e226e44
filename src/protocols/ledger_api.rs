//! `fetchai/ledger_api`: balance queries and transaction lifecycle.

use serde::{Deserialize, Serialize};

use crate::protocol::{
    CustomKind, CustomType, Encoding, FieldKind, FieldSpec, Performative, PerformativeSpec, ProtocolSchema,
};

pub static SCHEMA: ProtocolSchema = ProtocolSchema {
    author: "fetchai",
    name: "ledger_api",
    version: "0.1.0",
    encoding: Encoding::Structured,
    performatives: &[
        PerformativeSpec {
            name: "get_balance",
            fields: &[
                FieldSpec::required("ledger_id", FieldKind::Str),
                FieldSpec::required("address", FieldKind::Str),
            ],
        },
        PerformativeSpec {
            name: "get_raw_transaction",
            fields: &[FieldSpec::required("terms", FieldKind::Custom(CustomKind::of::<Terms>()))],
        },
        PerformativeSpec {
            name: "send_signed_transaction",
            fields: &[FieldSpec::required(
                "signed_transaction",
                FieldKind::Custom(CustomKind::of::<SignedTransaction>()),
            )],
        },
        PerformativeSpec {
            name: "get_transaction_receipt",
            fields: &[FieldSpec::required(
                "transaction_digest",
                FieldKind::Custom(CustomKind::of::<TransactionDigest>()),
            )],
        },
        PerformativeSpec {
            name: "balance",
            fields: &[
                FieldSpec::required("ledger_id", FieldKind::Str),
                FieldSpec::required("balance", FieldKind::Int),
            ],
        },
        PerformativeSpec {
            name: "raw_transaction",
            fields: &[FieldSpec::required(
                "raw_transaction",
                FieldKind::Custom(CustomKind::of::<RawTransaction>()),
            )],
        },
        PerformativeSpec {
            name: "transaction_digest",
            fields: &[FieldSpec::required(
                "transaction_digest",
                FieldKind::Custom(CustomKind::of::<TransactionDigest>()),
            )],
        },
        PerformativeSpec {
            name: "transaction_receipt",
            fields: &[FieldSpec::required(
                "transaction_receipt",
                FieldKind::Custom(CustomKind::of::<TransactionReceipt>()),
            )],
        },
        PerformativeSpec {
            name: "error",
            fields: &[
                FieldSpec::required("code", FieldKind::Int),
                FieldSpec::optional("message", FieldKind::Str),
                FieldSpec::optional("data", FieldKind::Bytes),
            ],
        },
    ],
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerApiPerformative {
    GetBalance,
    GetRawTransaction,
    SendSignedTransaction,
    GetTransactionReceipt,
    Balance,
    RawTransaction,
    TransactionDigest,
    TransactionReceipt,
    Error,
}

impl Performative for LedgerApiPerformative {
    fn schema() -> &'static ProtocolSchema {
        &SCHEMA
    }

    fn as_str(self) -> &'static str {
        match self {
            LedgerApiPerformative::GetBalance => "get_balance",
            LedgerApiPerformative::GetRawTransaction => "get_raw_transaction",
            LedgerApiPerformative::SendSignedTransaction => "send_signed_transaction",
            LedgerApiPerformative::GetTransactionReceipt => "get_transaction_receipt",
            LedgerApiPerformative::Balance => "balance",
            LedgerApiPerformative::RawTransaction => "raw_transaction",
            LedgerApiPerformative::TransactionDigest => "transaction_digest",
            LedgerApiPerformative::TransactionReceipt => "transaction_receipt",
            LedgerApiPerformative::Error => "error",
        }
    }
}

/// Terms of a transfer between two addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Terms {
    pub ledger_id: String,
    pub sender_address: String,
    pub counterparty_address: String,
    pub amount: i64,
    #[serde(default)]
    pub fee: i64,
    pub nonce: String,
}

impl CustomType for Terms {
    const TYPE_NAME: &'static str = "Terms";
}

/// Unsigned, ledger specific transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTransaction {
    pub ledger_id: String,
    pub body: serde_json::Value,
}

impl CustomType for RawTransaction {
    const TYPE_NAME: &'static str = "RawTransaction";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub ledger_id: String,
    pub body: serde_json::Value,
}

impl CustomType for SignedTransaction {
    const TYPE_NAME: &'static str = "SignedTransaction";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionDigest {
    pub ledger_id: String,
    pub body: String,
}

impl CustomType for TransactionDigest {
    const TYPE_NAME: &'static str = "TransactionDigest";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub ledger_id: String,
    pub receipt: serde_json::Value,
    pub transaction: serde_json::Value,
}

impl CustomType for TransactionReceipt {
    const TYPE_NAME: &'static str = "TransactionReceipt";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Body, Message};

    #[test]
    fn test_error_optional_contents() {
        let code_only = Message::opening(
            LedgerApiPerformative::Error,
            Body::new().with("code", 3i64),
        )
        .unwrap();
        assert!(!code_only.is_set("message"));
        assert!(code_only.get_str("message").is_err());

        let full = Message::opening(
            LedgerApiPerformative::Error,
            Body::new()
                .with("code", 3i64)
                .with("message", "timeout")
                .with("data", b"ctx".to_vec()),
        )
        .unwrap();
        assert_eq!(full.get_str("message").unwrap(), "timeout");
    }

    #[test]
    fn test_get_balance_requires_both_fields() {
        assert!(Message::opening(
            LedgerApiPerformative::GetBalance,
            Body::new().with("ledger_id", "fetchai"),
        )
        .is_err());
    }
}
