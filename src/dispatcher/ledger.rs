//! Ledger API dispatcher: balances, transfers and transaction receipts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{
    custom_body, request_message, BackendError, DispatchError, PendingOperation, RequestDispatcher,
    ERROR_CODE_TIMEOUT, ERROR_CODE_UNKNOWN_LEDGER,
};
use crate::protocol::{Body, Envelope, Message, ProtocolId};
use crate::protocols::ledger_api::{
    self, LedgerApiPerformative, RawTransaction, SignedTransaction, Terms, TransactionDigest,
    TransactionReceipt,
};

/// Default number of receipt polls before giving up.
pub const DEFAULT_RECEIPT_ATTEMPTS: u32 = 10;

/// Default delay between receipt polls.
pub const DEFAULT_RECEIPT_INTERVAL: Duration = Duration::from_secs(1);

/// A settled transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub receipt: serde_json::Value,
    pub transaction: serde_json::Value,
}

/// Client of one ledger.
#[async_trait]
pub trait LedgerApi: Send + Sync {
    async fn get_balance(&self, address: &str) -> Result<i64, BackendError>;

    /// Build an unsigned transfer transaction.
    async fn get_transfer_transaction(&self, terms: &Terms) -> Result<serde_json::Value, BackendError>;

    /// Submit a signed transaction, returning its digest.
    async fn send_signed_transaction(
        &self,
        transaction: &SignedTransaction,
    ) -> Result<String, BackendError>;

    /// `None` while the transaction is not settled yet.
    async fn get_transaction_receipt(&self, digest: &str) -> Result<Option<Settlement>, BackendError>;
}

enum LedgerCall {
    Balance { address: String },
    RawTransaction { terms: Terms },
    SendSigned { transaction: SignedTransaction },
    Receipt { digest: TransactionDigest },
}

/// Dispatches `fetchai/ledger_api` requests to the ledger named by `ledger_id`.
pub struct LedgerApiRequestDispatcher {
    ledgers: HashMap<String, Arc<dyn LedgerApi>>,
    receipt_attempts: u32,
    receipt_interval: Duration,
}

impl LedgerApiRequestDispatcher {
    pub fn new() -> Self {
        Self {
            ledgers: HashMap::new(),
            receipt_attempts: DEFAULT_RECEIPT_ATTEMPTS,
            receipt_interval: DEFAULT_RECEIPT_INTERVAL,
        }
    }

    /// Register the client for a ledger id.
    pub fn with_ledger(mut self, ledger_id: impl Into<String>, api: Arc<dyn LedgerApi>) -> Self {
        self.ledgers.insert(ledger_id.into(), api);
        self
    }

    /// Set how long receipts are polled for.
    pub fn with_receipt_retry(mut self, attempts: u32, interval: Duration) -> Self {
        self.receipt_attempts = attempts.max(1);
        self.receipt_interval = interval;
        self
    }

    fn parse_call(request: &Message) -> Result<(String, LedgerCall), DispatchError> {
        if request.is(LedgerApiPerformative::GetBalance) {
            Ok((
                request.get_str("ledger_id")?.to_string(),
                LedgerCall::Balance {
                    address: request.get_str("address")?.to_string(),
                },
            ))
        } else if request.is(LedgerApiPerformative::GetRawTransaction) {
            let terms: Terms = request.get_custom("terms")?;
            Ok((terms.ledger_id.clone(), LedgerCall::RawTransaction { terms }))
        } else if request.is(LedgerApiPerformative::SendSignedTransaction) {
            let transaction: SignedTransaction = request.get_custom("signed_transaction")?;
            Ok((
                transaction.ledger_id.clone(),
                LedgerCall::SendSigned { transaction },
            ))
        } else if request.is(LedgerApiPerformative::GetTransactionReceipt) {
            let digest: TransactionDigest = request.get_custom("transaction_digest")?;
            Ok((digest.ledger_id.clone(), LedgerCall::Receipt { digest }))
        } else {
            Err(DispatchError::NotARequest(request.performative().to_string()))
        }
    }
}

impl Default for LedgerApiRequestDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestDispatcher for LedgerApiRequestDispatcher {
    fn protocol_id(&self) -> ProtocolId {
        ledger_api::SCHEMA.protocol_id()
    }

    fn dispatch(&self, envelope: &Envelope) -> Result<PendingOperation, DispatchError> {
        let request = request_message(envelope, &ledger_api::SCHEMA)?;
        let (ledger_id, call) = Self::parse_call(&request)?;
        let api = self.ledgers.get(&ledger_id).cloned();
        let attempts = self.receipt_attempts;
        let interval = self.receipt_interval;

        tracing::debug!(
            "Dispatching ledger_api '{}' for ledger '{}'",
            request.performative(),
            ledger_id
        );

        Ok(Box::pin(async move {
            let outcome = match api {
                Some(api) => perform(&request, &ledger_id, call, api, attempts, interval).await,
                None => Err(BackendError::new(
                    ERROR_CODE_UNKNOWN_LEDGER,
                    format!("Ledger '{}' is not configured", ledger_id),
                )),
            };

            let reply = match outcome {
                Ok(reply) => reply,
                Err(error) => {
                    tracing::warn!("Ledger request on '{}' failed: {}", ledger_id, error);
                    error_reply(&request, &error)
                }
            };

            reply
                .map_err(|violation| {
                    tracing::error!("Could not build ledger_api reply: {}", violation);
                })
                .ok()
        }))
    }
}

async fn perform(
    request: &Message,
    ledger_id: &str,
    call: LedgerCall,
    api: Arc<dyn LedgerApi>,
    attempts: u32,
    interval: Duration,
) -> Result<Result<Message, crate::protocol::SchemaViolation>, BackendError> {
    let reply = match call {
        LedgerCall::Balance { address } => {
            let balance = api.get_balance(&address).await?;
            request.reply(
                LedgerApiPerformative::Balance,
                Body::new().with("ledger_id", ledger_id).with("balance", balance),
            )
        }
        LedgerCall::RawTransaction { terms } => {
            let body = api.get_transfer_transaction(&terms).await?;
            let raw = RawTransaction {
                ledger_id: ledger_id.to_string(),
                body,
            };
            request.reply(
                LedgerApiPerformative::RawTransaction,
                custom_body("raw_transaction", &raw)?,
            )
        }
        LedgerCall::SendSigned { transaction } => {
            let digest = api.send_signed_transaction(&transaction).await?;
            let digest = TransactionDigest {
                ledger_id: ledger_id.to_string(),
                body: digest,
            };
            request.reply(
                LedgerApiPerformative::TransactionDigest,
                custom_body("transaction_digest", &digest)?,
            )
        }
        LedgerCall::Receipt { digest } => {
            let settlement = poll_receipt(api.as_ref(), &digest.body, attempts, interval).await?;
            let receipt = TransactionReceipt {
                ledger_id: ledger_id.to_string(),
                receipt: settlement.receipt,
                transaction: settlement.transaction,
            };
            request.reply(
                LedgerApiPerformative::TransactionReceipt,
                custom_body("transaction_receipt", &receipt)?,
            )
        }
    };
    Ok(reply)
}

async fn poll_receipt(
    api: &dyn LedgerApi,
    digest: &str,
    attempts: u32,
    interval: Duration,
) -> Result<Settlement, BackendError> {
    for attempt in 1..=attempts {
        if let Some(settlement) = api.get_transaction_receipt(digest).await? {
            return Ok(settlement);
        }
        tracing::debug!(
            "Transaction {} not settled (attempt {}/{})",
            digest,
            attempt,
            attempts
        );
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    Err(BackendError::new(
        ERROR_CODE_TIMEOUT,
        format!("Transaction {} not settled after {} attempts", digest, attempts),
    ))
}

fn error_reply(
    request: &Message,
    error: &BackendError,
) -> Result<Message, crate::protocol::SchemaViolation> {
    let mut body = Body::new()
        .with("code", error.code)
        .with("message", error.message.clone());
    if let Ok(data) = request.encode() {
        body.insert("data", data);
    }
    request.reply(LedgerApiPerformative::Error, body)
}
