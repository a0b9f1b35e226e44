//! Contract API dispatcher: deployment transactions, contract calls and state reads.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{
    custom_body, request_message, BackendError, DispatchError, PendingOperation, RequestDispatcher,
    ERROR_CODE_UNKNOWN_LEDGER,
};
use crate::protocol::{Body, Envelope, Message, ProtocolId, SchemaViolation};
use crate::protocols::contract_api::{self, ContractApiPerformative, Kwargs, RawMessage, State};
use crate::protocols::ledger_api::RawTransaction;

/// A callable of a contract, resolved from a request.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractCall {
    pub ledger_id: String,
    pub contract_id: String,
    /// Unset for deployments.
    pub contract_address: Option<String>,
    pub callable: String,
    pub kwargs: Kwargs,
}

impl ContractCall {
    fn from_request(request: &Message) -> Result<Self, DispatchError> {
        let contract_address = if request.is_set("contract_address") {
            Some(request.get_str("contract_address")?.to_string())
        } else {
            None
        };
        Ok(Self {
            ledger_id: request.get_str("ledger_id")?.to_string(),
            contract_id: request.get_str("contract_id")?.to_string(),
            contract_address,
            callable: request.get_str("callable")?.to_string(),
            kwargs: request.get_custom("kwargs")?,
        })
    }
}

/// Contract interactions on one ledger.
#[async_trait]
pub trait ContractApi: Send + Sync {
    async fn get_deploy_transaction(
        &self,
        call: &ContractCall,
    ) -> Result<serde_json::Value, BackendError>;

    async fn get_raw_transaction(&self, call: &ContractCall)
        -> Result<serde_json::Value, BackendError>;

    /// Message to be signed by the caller.
    async fn get_raw_message(&self, call: &ContractCall) -> Result<String, BackendError>;

    async fn get_state(&self, call: &ContractCall) -> Result<serde_json::Value, BackendError>;
}

#[derive(Debug, Clone, Copy)]
enum CallKind {
    Deploy,
    RawTransaction,
    RawMessage,
    State,
}

impl CallKind {
    fn of(request: &Message) -> Option<Self> {
        if request.is(ContractApiPerformative::GetDeployTransaction) {
            Some(CallKind::Deploy)
        } else if request.is(ContractApiPerformative::GetRawTransaction) {
            Some(CallKind::RawTransaction)
        } else if request.is(ContractApiPerformative::GetRawMessage) {
            Some(CallKind::RawMessage)
        } else if request.is(ContractApiPerformative::GetState) {
            Some(CallKind::State)
        } else {
            None
        }
    }
}

/// Dispatches `fetchai/contract_api` requests to the contract backend of
/// the requested ledger.
#[derive(Default)]
pub struct ContractApiRequestDispatcher {
    ledgers: HashMap<String, Arc<dyn ContractApi>>,
}

impl ContractApiRequestDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ledger(mut self, ledger_id: impl Into<String>, api: Arc<dyn ContractApi>) -> Self {
        self.ledgers.insert(ledger_id.into(), api);
        self
    }
}

impl RequestDispatcher for ContractApiRequestDispatcher {
    fn protocol_id(&self) -> ProtocolId {
        contract_api::SCHEMA.protocol_id()
    }

    fn dispatch(&self, envelope: &Envelope) -> Result<PendingOperation, DispatchError> {
        let request = request_message(envelope, &contract_api::SCHEMA)?;
        let kind = CallKind::of(&request)
            .ok_or_else(|| DispatchError::NotARequest(request.performative().to_string()))?;
        let call = ContractCall::from_request(&request)?;
        let api = self.ledgers.get(&call.ledger_id).cloned();

        tracing::debug!(
            "Dispatching contract_api '{}' of {} on '{}'",
            call.callable,
            call.contract_id,
            call.ledger_id
        );

        Ok(Box::pin(async move {
            let outcome = match api {
                Some(api) => perform(&request, kind, &call, api.as_ref()).await,
                None => Err(BackendError::new(
                    ERROR_CODE_UNKNOWN_LEDGER,
                    format!("Ledger '{}' is not configured", call.ledger_id),
                )),
            };

            let reply = match outcome {
                Ok(reply) => reply,
                Err(error) => {
                    tracing::warn!(
                        "Contract call '{}' on '{}' failed: {}",
                        call.callable,
                        call.ledger_id,
                        error
                    );
                    error_reply(&request, &error)
                }
            };

            match reply {
                Ok(reply) => Some(reply),
                Err(violation) => {
                    tracing::error!("Could not build contract_api reply: {}", violation);
                    None
                }
            }
        }))
    }
}

async fn perform(
    request: &Message,
    kind: CallKind,
    call: &ContractCall,
    api: &dyn ContractApi,
) -> Result<Result<Message, SchemaViolation>, BackendError> {
    let ledger_id = call.ledger_id.clone();
    let reply = match kind {
        CallKind::Deploy | CallKind::RawTransaction => {
            let body = match kind {
                CallKind::Deploy => api.get_deploy_transaction(call).await?,
                _ => api.get_raw_transaction(call).await?,
            };
            request.reply(
                ContractApiPerformative::RawTransaction,
                custom_body("raw_transaction", &RawTransaction { ledger_id, body })?,
            )
        }
        CallKind::RawMessage => {
            let body = api.get_raw_message(call).await?;
            let raw = RawMessage {
                ledger_id,
                body,
                is_deprecated_mode: false,
            };
            request.reply(
                ContractApiPerformative::RawMessage,
                custom_body("raw_message", &raw)?,
            )
        }
        CallKind::State => {
            let body = api.get_state(call).await?;
            request.reply(
                ContractApiPerformative::State,
                custom_body("state", &State { ledger_id, body })?,
            )
        }
    };
    Ok(reply)
}

fn error_reply(request: &Message, error: &BackendError) -> Result<Message, SchemaViolation> {
    let data = request.encode().unwrap_or_default();
    request.reply(
        ContractApiPerformative::Error,
        Body::new()
            .with("code", error.code)
            .with("message", error.message.clone())
            .with("data", data),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeContracts;

    #[async_trait]
    impl ContractApi for FakeContracts {
        async fn get_deploy_transaction(
            &self,
            call: &ContractCall,
        ) -> Result<serde_json::Value, BackendError> {
            assert!(call.contract_address.is_none());
            Ok(serde_json::json!({"deploy": call.contract_id}))
        }

        async fn get_raw_transaction(
            &self,
            call: &ContractCall,
        ) -> Result<serde_json::Value, BackendError> {
            Ok(serde_json::json!({"call": call.callable}))
        }

        async fn get_raw_message(&self, _call: &ContractCall) -> Result<String, BackendError> {
            Err(BackendError::backend("signing unavailable"))
        }

        async fn get_state(&self, call: &ContractCall) -> Result<serde_json::Value, BackendError> {
            Ok(serde_json::json!({"balance": call.kwargs.0.get("id").cloned()}))
        }
    }

    fn dispatcher() -> ContractApiRequestDispatcher {
        ContractApiRequestDispatcher::new().with_ledger("ethereum", Arc::new(FakeContracts))
    }

    fn call_envelope(performative: ContractApiPerformative, ledger_id: &str) -> Envelope {
        let mut kwargs = Kwargs::default();
        kwargs.0.insert("id".to_string(), serde_json::json!(7));
        let mut body = Body::new()
            .with("ledger_id", ledger_id)
            .with("contract_id", "fetchai/erc1155:0.1.0")
            .with("callable", "get_balance")
            .with_custom("kwargs", &kwargs)
            .unwrap();
        if performative != ContractApiPerformative::GetDeployTransaction {
            body.insert("contract_address", "0xabc");
        }
        let message = Message::opening(performative, body).unwrap();
        Envelope::new("fetchai/ledger:0.1.0", "agent", message)
    }

    #[tokio::test]
    async fn test_get_state() {
        let reply = dispatcher()
            .dispatch(&call_envelope(ContractApiPerformative::GetState, "ethereum"))
            .unwrap()
            .await
            .unwrap();

        assert!(reply.is(ContractApiPerformative::State));
        let state: State = reply.get_custom("state").unwrap();
        assert_eq!(state.ledger_id, "ethereum");
        assert_eq!(state.body, serde_json::json!({"balance": 7}));
    }

    #[tokio::test]
    async fn test_deploy_transaction() {
        let reply = dispatcher()
            .dispatch(&call_envelope(
                ContractApiPerformative::GetDeployTransaction,
                "ethereum",
            ))
            .unwrap()
            .await
            .unwrap();

        assert!(reply.is(ContractApiPerformative::RawTransaction));
        let raw: RawTransaction = reply.get_custom("raw_transaction").unwrap();
        assert_eq!(raw.body, serde_json::json!({"deploy": "fetchai/erc1155:0.1.0"}));
    }

    #[tokio::test]
    async fn test_backend_error_carries_request() {
        let envelope = call_envelope(ContractApiPerformative::GetRawMessage, "ethereum");
        let reply = dispatcher().dispatch(&envelope).unwrap().await.unwrap();

        assert!(reply.is(ContractApiPerformative::Error));
        assert_eq!(reply.get_str("message").unwrap(), "signing unavailable");
        let request = envelope.message.as_message().unwrap();
        assert_eq!(reply.get_bytes("data").unwrap(), request.encode().unwrap());
    }

    #[tokio::test]
    async fn test_unknown_ledger() {
        let reply = dispatcher()
            .dispatch(&call_envelope(ContractApiPerformative::GetState, "cosmos"))
            .unwrap()
            .await
            .unwrap();
        assert!(reply.is(ContractApiPerformative::Error));
        assert_eq!(reply.get_int("code").unwrap(), ERROR_CODE_UNKNOWN_LEDGER);
    }

    #[test]
    fn test_bytes_payload_is_decoded() {
        let envelope = call_envelope(ContractApiPerformative::GetState, "ethereum");
        let bytes = envelope.message.to_bytes().unwrap();
        let raw = Envelope::with_bytes("a", "b", envelope.protocol_id.clone(), bytes);
        assert!(dispatcher().dispatch(&raw).is_ok());

        let garbage = Envelope::with_bytes("a", "b", envelope.protocol_id, b"{}".to_vec());
        assert!(matches!(
            dispatcher().dispatch(&garbage),
            Err(DispatchError::InvalidRequest(_))
        ));
    }
}
