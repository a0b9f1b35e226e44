//! Connection that schedules envelopes onto request dispatchers and hands
//! back responses in completion order.
//!
//! Every `send` spawns the dispatcher's pending operation on the current
//! runtime and records it in an arena keyed by a monotonic id. Finished
//! operations report over the connection's completion channel. `receive`
//! first drains results already collected by an earlier wake (most recent
//! first), then waits on the channel for the next completion.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::{Connection, ConnectionError, ConnectionState};
use crate::dispatcher::{
    ContractApiRequestDispatcher, LedgerApiRequestDispatcher, RequestDispatcher,
};
use crate::protocol::{ConnectionId, Envelope, Message, ProtocolId, PublicId};

type OperationId = u64;

/// Outcome of one finished operation.
struct Completion {
    id: OperationId,
    response: Option<Message>,
}

struct InFlight {
    request: Envelope,
    abort: AbortHandle,
}

struct Scheduler {
    status: ConnectionState,
    in_flight: HashMap<OperationId, InFlight>,
    /// Completions collected but not yet returned; popped from the back.
    done: Vec<Completion>,
    completion_tx: Option<mpsc::UnboundedSender<Completion>>,
}

/// Envelope scheduler over a set of request dispatchers.
pub struct DispatchConnection {
    connection_id: ConnectionId,
    dispatchers: HashMap<ProtocolId, Arc<dyn RequestDispatcher>>,
    scheduler: Mutex<Scheduler>,
    completions: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Completion>>>,
    next_id: AtomicU64,
}

impl DispatchConnection {
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            dispatchers: HashMap::new(),
            scheduler: Mutex::new(Scheduler {
                status: ConnectionState::Disconnected,
                in_flight: HashMap::new(),
                done: Vec::new(),
                completion_tx: None,
            }),
            completions: tokio::sync::Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Ledger connection (`fetchai/ledger:0.1.0`) serving the ledger and
    /// contract APIs.
    pub fn ledger(
        ledger: LedgerApiRequestDispatcher,
        contract: ContractApiRequestDispatcher,
    ) -> Self {
        Self::new(PublicId::from_parts("fetchai", "ledger", "0.1.0"))
            .with_dispatcher(Arc::new(ledger))
            .with_dispatcher(Arc::new(contract))
    }

    /// Register a dispatcher under its protocol id, replacing any previous one.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn RequestDispatcher>) -> Self {
        self.dispatchers.insert(dispatcher.protocol_id(), dispatcher);
        self
    }

    /// Protocols this connection can dispatch.
    pub fn protocols(&self) -> Vec<ProtocolId> {
        let mut ids: Vec<_> = self.dispatchers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Operations dispatched but not yet returned by `receive`.
    pub fn in_flight(&self) -> usize {
        self.scheduler().in_flight.len()
    }

    /// Completions waiting to be returned.
    pub fn completed(&self) -> usize {
        self.scheduler().done.len()
    }

    fn scheduler(&self) -> MutexGuard<'_, Scheduler> {
        self.scheduler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Response envelope for a completion, `None` if its operation is gone.
    fn settle(&self, completion: Completion) -> Option<Option<Envelope>> {
        let request = match self.scheduler().in_flight.remove(&completion.id) {
            Some(op) => op.request,
            None => {
                tracing::debug!("Discarding completion of cancelled operation {}", completion.id);
                return None;
            }
        };

        match completion.response {
            Some(message) => Some(Some(request.response(message))),
            None => {
                tracing::debug!(
                    "Operation {} for {} finished without response",
                    completion.id,
                    request.protocol_id
                );
                Some(None)
            }
        }
    }

    /// Pop a collected completion, checking the connection is up.
    fn pop_done(&self) -> Result<Option<Completion>, ConnectionError> {
        let mut scheduler = self.scheduler();
        if scheduler.status != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected);
        }
        Ok(scheduler.done.pop())
    }
}

#[async_trait]
impl Connection for DispatchConnection {
    fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    fn state(&self) -> ConnectionState {
        self.scheduler().status
    }

    async fn connect(&self) -> Result<(), ConnectionError> {
        if self.is_connected() {
            return Ok(());
        }
        self.scheduler().status = ConnectionState::Connecting;

        let (tx, rx) = mpsc::unbounded_channel();
        *self.completions.lock().await = Some(rx);

        let mut scheduler = self.scheduler();
        scheduler.completion_tx = Some(tx);
        scheduler.status = ConnectionState::Connected;
        tracing::info!("Connection {} connected", self.connection_id);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        let cancelled = {
            let mut scheduler = self.scheduler();
            if scheduler.status == ConnectionState::Disconnected {
                return Ok(());
            }
            scheduler.status = ConnectionState::Disconnecting;

            // Dropping the sender lets a blocked receive observe the close once
            // the aborted tasks release their clones.
            scheduler.completion_tx = None;
            scheduler.done.clear();
            let cancelled = scheduler.in_flight.len();
            for (_, op) in scheduler.in_flight.drain() {
                op.abort.abort();
            }

            scheduler.status = ConnectionState::Disconnected;
            cancelled
        };

        tracing::info!(
            "Connection {} disconnected ({} operations cancelled)",
            self.connection_id,
            cancelled
        );
        Ok(())
    }

    async fn send(&self, envelope: Envelope) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }

        let dispatcher = self
            .dispatchers
            .get(&envelope.protocol_id)
            .ok_or_else(|| ConnectionError::UnsupportedProtocol {
                connection: self.connection_id.clone(),
                protocol: envelope.protocol_id.clone(),
            })?;
        let operation = dispatcher.dispatch(&envelope)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // The arena entry is inserted under the same lock receive uses to
        // settle completions, so an early completion always finds it.
        let mut scheduler = self.scheduler();
        let tx = match (&scheduler.status, &scheduler.completion_tx) {
            (ConnectionState::Connected, Some(tx)) => tx.clone(),
            _ => return Err(ConnectionError::NotConnected),
        };

        let task = tokio::spawn(async move {
            let response = match AssertUnwindSafe(operation).catch_unwind().await {
                Ok(response) => response,
                Err(_) => {
                    tracing::error!("Operation {} panicked", id);
                    None
                }
            };
            let _ = tx.send(Completion { id, response });
        });

        tracing::debug!(
            "Scheduled operation {} for {} from {}",
            id,
            envelope.protocol_id,
            envelope.sender
        );
        scheduler.in_flight.insert(
            id,
            InFlight {
                request: envelope,
                abort: task.abort_handle(),
            },
        );
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Envelope>, ConnectionError> {
        loop {
            if let Some(completion) = self.pop_done()? {
                match self.settle(completion) {
                    Some(result) => return Ok(result),
                    None => continue,
                }
            }

            let (first, rest) = {
                let mut completions = self.completions.lock().await;
                let rx = completions.as_mut().ok_or(ConnectionError::NotConnected)?;
                let first = rx.recv().await.ok_or(ConnectionError::NotConnected)?;
                let mut rest = Vec::new();
                while let Ok(completion) = rx.try_recv() {
                    rest.push(completion);
                }
                (first, rest)
            };

            {
                let mut scheduler = self.scheduler();
                if scheduler.status != ConnectionState::Connected {
                    return Err(ConnectionError::NotConnected);
                }
                scheduler.done.extend(rest);
            }

            if let Some(result) = self.settle(first) {
                return Ok(result);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::dispatcher::{DispatchError, PendingOperation};
    use crate::protocol::Body;
    use crate::protocols::default::{self, DefaultPerformative};
    use crate::protocols::oef::OefPerformative;

    /// Echoes `bytes` messages; the content selects the behavior.
    struct EchoDispatcher;

    impl RequestDispatcher for EchoDispatcher {
        fn protocol_id(&self) -> ProtocolId {
            default::SCHEMA.protocol_id()
        }

        fn dispatch(&self, envelope: &Envelope) -> Result<PendingOperation, DispatchError> {
            let request = envelope
                .message
                .as_message()
                .cloned()
                .ok_or_else(|| DispatchError::NotARequest("bytes".to_string()))?;
            let content = request.get_bytes("content")?.to_vec();

            Ok(Box::pin(async move {
                match content.as_slice() {
                    b"slow" => tokio::time::sleep(Duration::from_millis(200)).await,
                    b"never" => tokio::time::sleep(Duration::from_secs(3600)).await,
                    b"silent" => return None,
                    b"panic" => panic!("dispatcher failure"),
                    _ => {}
                }
                request
                    .reply(
                        DefaultPerformative::Bytes,
                        Body::new().with("content", content),
                    )
                    .ok()
            }))
        }
    }

    fn connection() -> Arc<DispatchConnection> {
        Arc::new(
            DispatchConnection::new("fetchai/echo:0.1.0".parse().unwrap())
                .with_dispatcher(Arc::new(EchoDispatcher)),
        )
    }

    fn request(content: &str) -> Envelope {
        Envelope::new(
            "fetchai/echo:0.1.0",
            "agent",
            default::bytes(content.as_bytes().to_vec()).unwrap(),
        )
    }

    fn content(envelope: &Envelope) -> Vec<u8> {
        envelope
            .message
            .as_message()
            .unwrap()
            .get_bytes("content")
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let conn = connection();
        assert!(matches!(
            conn.send(request("x")).await,
            Err(ConnectionError::NotConnected)
        ));
        assert!(matches!(conn.receive().await, Err(ConnectionError::NotConnected)));
    }

    #[tokio::test]
    async fn test_response_is_addressed_back() {
        let conn = connection();
        conn.connect().await.unwrap();
        conn.send(request("hello")).await.unwrap();

        let response = conn.receive().await.unwrap().unwrap();
        assert_eq!(response.to, "agent");
        assert_eq!(response.sender, "fetchai/echo:0.1.0");
        assert_eq!(content(&response), b"hello");

        let reply = response.message.as_message().unwrap();
        assert_eq!(reply.message_id(), 2);
        assert_eq!(reply.target(), 1);
        assert_eq!(conn.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_completion_order_delivery() {
        let conn = connection();
        conn.connect().await.unwrap();

        conn.send(request("slow")).await.unwrap();
        conn.send(request("fast")).await.unwrap();

        let first = conn.receive().await.unwrap().unwrap();
        let second = conn.receive().await.unwrap().unwrap();
        assert_eq!(content(&first), b"fast");
        assert_eq!(content(&second), b"slow");
    }

    #[tokio::test]
    async fn test_every_completion_returned_once() {
        let conn = connection();
        conn.connect().await.unwrap();
        for name in ["a", "b", "c", "d"] {
            conn.send(request(name)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(content(&conn.receive().await.unwrap().unwrap()));
        }
        seen.sort();
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
        assert_eq!(conn.in_flight(), 0);
        assert_eq!(conn.completed(), 0);
    }

    #[tokio::test]
    async fn test_receive_before_send_wakes_up() {
        let conn = connection();
        conn.connect().await.unwrap();

        let receiver = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.send(request("late")).await.unwrap();

        let response = tokio::time::timeout(Duration::from_secs(2), receiver)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(content(&response), b"late");
    }

    #[tokio::test]
    async fn test_no_response_yields_empty_slot() {
        let conn = connection();
        conn.connect().await.unwrap();
        conn.send(request("silent")).await.unwrap();
        assert!(conn.receive().await.unwrap().is_none());

        conn.send(request("panic")).await.unwrap();
        assert!(conn.receive().await.unwrap().is_none());
        assert_eq!(conn.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_in_flight() {
        let conn = connection();
        conn.connect().await.unwrap();
        conn.send(request("never")).await.unwrap();
        conn.send(request("slow")).await.unwrap();
        assert_eq!(conn.in_flight(), 2);

        let receiver = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_millis(100), conn.disconnect())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.in_flight(), 0);
        assert_eq!(conn.completed(), 0);

        let blocked = tokio::time::timeout(Duration::from_secs(2), receiver)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(blocked, Err(ConnectionError::NotConnected)));

        // Nothing from the previous session leaks into the next one.
        conn.connect().await.unwrap();
        let stale = tokio::time::timeout(Duration::from_millis(400), conn.receive()).await;
        assert!(stale.is_err());
    }

    #[tokio::test]
    async fn test_unsupported_protocol() {
        let conn = connection();
        conn.connect().await.unwrap();

        let message = Message::opening(
            OefPerformative::SearchResult,
            Body::new().with("agents", vec!["a".to_string()]),
        )
        .unwrap();
        let result = conn.send(Envelope::new("fetchai/echo:0.1.0", "agent", message)).await;
        assert!(matches!(
            result,
            Err(ConnectionError::UnsupportedProtocol { .. })
        ));
        assert_eq!(conn.in_flight(), 0);
    }

    #[test]
    fn test_ledger_connection_protocols() {
        let conn = DispatchConnection::ledger(
            LedgerApiRequestDispatcher::new(),
            ContractApiRequestDispatcher::new(),
        );
        assert_eq!(conn.connection_id().to_string(), "fetchai/ledger:0.1.0");
        let protocols: Vec<String> = conn.protocols().iter().map(|p| p.to_string()).collect();
        assert_eq!(
            protocols,
            vec!["fetchai/contract_api:0.1.0", "fetchai/ledger_api:0.1.0"]
        );
    }
}
