//! Multiplexer: drives a set of connections on one background thread and
//! bridges them to synchronous callers.
//!
//! `put` routes an envelope and queues it for the background loop; `get`
//! takes envelopes the connections received. The background thread runs a
//! current-thread tokio runtime whose loop selects over a shutdown signal,
//! the outbound queue and the pending `receive` of every live connection.

mod queue;

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use futures::future::{join_all, BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::connection::{Connection, ConnectionError};
use crate::protocol::{Address, ConnectionId, Envelope};

pub use queue::InboundQueue;

/// Delay before polling a connection again after a failed receive.
const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum MultiplexerError {
    #[error("No connection to route envelope addressed to '{0}'")]
    NoRoute(Address),

    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("Multiplexer needs at least one connection")]
    NoConnections,

    #[error("Multiplexer is already running")]
    AlreadyRunning,

    #[error("Failed to start background runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("Multiplexer background thread panicked")]
    BackgroundPanicked,
}

/// Lifecycle of a multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiplexerState {
    Created,
    Running,
    Stopped,
}

/// Connections that failed a lifecycle transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecycleReport {
    pub failed: Vec<(ConnectionId, String)>,
}

impl LifecycleReport {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

/// An envelope with the index of the connection it was routed to.
type Routed = (usize, Envelope);

type Receiving = BoxFuture<'static, (usize, Result<Option<Envelope>, ConnectionError>)>;

struct Runner {
    shutdown: oneshot::Sender<()>,
    thread: JoinHandle<(LifecycleReport, mpsc::UnboundedReceiver<Routed>)>,
}

struct Lifecycle {
    state: MultiplexerState,
    runner: Option<Runner>,
    outbound_rx: Option<mpsc::UnboundedReceiver<Routed>>,
}

/// Fan-in/fan-out coordinator over a set of connections.
pub struct Multiplexer {
    connections: Vec<Arc<dyn Connection>>,
    default_connection: Option<usize>,
    inbound: Arc<InboundQueue>,
    outbound_tx: Mutex<mpsc::UnboundedSender<Routed>>,
    lifecycle: Mutex<Lifecycle>,
}

impl Multiplexer {
    /// Multiplexer over `connections`; the first one is the default route.
    pub fn new(connections: Vec<Arc<dyn Connection>>) -> Result<Self, MultiplexerError> {
        if connections.is_empty() {
            return Err(MultiplexerError::NoConnections);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            connections,
            default_connection: Some(0),
            inbound: Arc::new(InboundQueue::new()),
            outbound_tx: Mutex::new(tx),
            lifecycle: Mutex::new(Lifecycle {
                state: MultiplexerState::Created,
                runner: None,
                outbound_rx: Some(rx),
            }),
        })
    }

    /// Route envelopes not addressed to a connection through `connection_id`.
    pub fn with_default_connection(
        mut self,
        connection_id: &ConnectionId,
    ) -> Result<Self, MultiplexerError> {
        let index = self
            .connections
            .iter()
            .position(|c| c.connection_id() == connection_id)
            .ok_or_else(|| MultiplexerError::UnknownConnection(connection_id.clone()))?;
        self.default_connection = Some(index);
        Ok(self)
    }

    /// Only route envelopes addressed directly to a connection.
    pub fn without_default_connection(mut self) -> Self {
        self.default_connection = None;
        self
    }

    pub fn connections(&self) -> &[Arc<dyn Connection>] {
        &self.connections
    }

    pub fn default_connection(&self) -> Option<&ConnectionId> {
        self.default_connection
            .map(|index| self.connections[index].connection_id())
    }

    pub fn state(&self) -> MultiplexerState {
        self.lifecycle().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == MultiplexerState::Running
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn route(&self, envelope: &Envelope) -> Result<usize, MultiplexerError> {
        self.connections
            .iter()
            .position(|c| c.connection_id().to_string() == envelope.to)
            .or(self.default_connection)
            .ok_or_else(|| MultiplexerError::NoRoute(envelope.to.clone()))
    }

    /// Queue an envelope for sending. Never waits for the background loop;
    /// envelopes put while stopped are sent on the next run.
    pub fn put(&self, envelope: Envelope) -> Result<(), MultiplexerError> {
        let index = self.route(&envelope)?;
        tracing::debug!(
            "Routing envelope for '{}' to {}",
            envelope.to,
            self.connections[index].connection_id()
        );

        let tx = self
            .outbound_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // The receiver lives in the lifecycle or the background thread for as
        // long as the multiplexer exists.
        if tx.send((index, envelope)).is_err() {
            tracing::error!("Outbound queue closed, envelope dropped");
        }
        Ok(())
    }

    /// Next received envelope. Without `block` returns immediately; with it,
    /// waits up to `timeout` (forever when `None`).
    pub fn get(&self, block: bool, timeout: Option<Duration>) -> Option<Envelope> {
        self.inbound.pop(block, timeout)
    }

    /// Envelopes received but not yet taken with `get`.
    pub fn pending(&self) -> usize {
        self.inbound.len()
    }

    /// Start the background thread and connect every connection. Connections
    /// that fail are reported and left out; the others keep running.
    pub fn connect(&self) -> Result<LifecycleReport, MultiplexerError> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.runner.is_some() {
            return Err(MultiplexerError::AlreadyRunning);
        }
        let outbound_rx = match lifecycle.outbound_rx.take() {
            Some(rx) => rx,
            None => self.reset_outbound(),
        };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (report_tx, report_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let connections = self.connections.clone();
        let inbound = self.inbound.clone();

        let thread = std::thread::Builder::new()
            .name("multiplexer".to_string())
            .spawn(move || {
                runtime.block_on(run(connections, outbound_rx, inbound, shutdown_rx, report_tx))
            })?;

        let report = match report_rx.recv() {
            Ok(report) => report,
            Err(_) => {
                // The loop dropped the reporter without sending: it panicked.
                let _ = thread.join();
                lifecycle.state = MultiplexerState::Stopped;
                return Err(MultiplexerError::BackgroundPanicked);
            }
        };

        lifecycle.runner = Some(Runner {
            shutdown: shutdown_tx,
            thread,
        });
        lifecycle.state = MultiplexerState::Running;

        if report.is_ok() {
            tracing::info!("Multiplexer connected {} connections", self.connections.len());
        } else {
            tracing::warn!(
                "Multiplexer connected with {} failed connections",
                report.failed.len()
            );
        }
        Ok(report)
    }

    /// Stop the background loop, disconnect every connection and join the
    /// thread. Calling it while stopped is a no-op.
    pub fn disconnect(&self) -> Result<LifecycleReport, MultiplexerError> {
        let mut lifecycle = self.lifecycle();
        let runner = match lifecycle.runner.take() {
            Some(runner) => runner,
            None => return Ok(LifecycleReport::default()),
        };

        let _ = runner.shutdown.send(());
        lifecycle.state = MultiplexerState::Stopped;
        match runner.thread.join() {
            Ok((report, outbound_rx)) => {
                lifecycle.outbound_rx = Some(outbound_rx);
                tracing::info!("Multiplexer disconnected");
                Ok(report)
            }
            Err(_) => {
                lifecycle.outbound_rx = Some(self.reset_outbound());
                Err(MultiplexerError::BackgroundPanicked)
            }
        }
    }

    /// Replace a lost outbound channel; envelopes queued on the old one are gone.
    fn reset_outbound(&self) -> mpsc::UnboundedReceiver<Routed> {
        tracing::warn!("Outbound queue lost, starting a new one");
        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .outbound_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = tx;
        rx
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        if self.lifecycle().runner.is_some() {
            if let Err(e) = self.disconnect() {
                tracing::error!("Multiplexer shutdown failed: {}", e);
            }
        }
    }
}

fn receive_next(index: usize, connection: Arc<dyn Connection>, delay: Duration) -> Receiving {
    Box::pin(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        (index, connection.receive().await)
    })
}

/// Run one transition on every connection concurrently; the flags tell which succeeded.
async fn lifecycle_report<F>(
    connections: &[Arc<dyn Connection>],
    transition: F,
) -> (LifecycleReport, Vec<bool>)
where
    F: Fn(Arc<dyn Connection>) -> BoxFuture<'static, Result<(), ConnectionError>>,
{
    let results = join_all(connections.iter().cloned().map(transition)).await;

    let mut report = LifecycleReport::default();
    let mut ok = Vec::with_capacity(connections.len());
    for (connection, result) in connections.iter().zip(results) {
        match result {
            Ok(()) => ok.push(true),
            Err(e) => {
                tracing::error!("Connection {} failed: {}", connection.connection_id(), e);
                report
                    .failed
                    .push((connection.connection_id().clone(), e.to_string()));
                ok.push(false);
            }
        }
    }
    (report, ok)
}

/// Background loop; hands the outbound receiver back when it stops.
async fn run(
    connections: Vec<Arc<dyn Connection>>,
    mut outbound: mpsc::UnboundedReceiver<Routed>,
    inbound: Arc<InboundQueue>,
    mut shutdown: oneshot::Receiver<()>,
    report_tx: std::sync::mpsc::Sender<LifecycleReport>,
) -> (LifecycleReport, mpsc::UnboundedReceiver<Routed>) {
    let (report, live) =
        lifecycle_report(&connections, |c| async move { c.connect().await }.boxed()).await;
    let _ = report_tx.send(report);

    let mut receiving: FuturesUnordered<Receiving> = FuturesUnordered::new();
    for (index, connection) in connections.iter().enumerate() {
        if live[index] {
            receiving.push(receive_next(index, connection.clone(), Duration::ZERO));
        }
    }

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            routed = outbound.recv() => {
                let Some((index, envelope)) = routed else { break };
                let connection = &connections[index];
                if !live[index] {
                    tracing::warn!(
                        "Dropping envelope for '{}': connection {} is not connected",
                        envelope.to,
                        connection.connection_id()
                    );
                    continue;
                }
                if let Err(e) = connection.send(envelope).await {
                    tracing::warn!("Send on {} failed: {}", connection.connection_id(), e);
                }
            }
            Some((index, result)) = receiving.next(), if !receiving.is_empty() => {
                let connection = &connections[index];
                let delay = match result {
                    Ok(Some(envelope)) => {
                        tracing::debug!("Received from {}: {}", connection.connection_id(), envelope);
                        inbound.push(envelope);
                        Duration::ZERO
                    }
                    Ok(None) => Duration::ZERO,
                    Err(e) => {
                        tracing::debug!("Receive on {} failed: {}", connection.connection_id(), e);
                        RECEIVE_RETRY_DELAY
                    }
                };
                receiving.push(receive_next(index, connection.clone(), delay));
            }
        }
    }

    drop(receiving);
    let (report, _) =
        lifecycle_report(&connections, |c| async move { c.disconnect().await }.boxed()).await;
    (report, outbound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Instant;

    use async_trait::async_trait;

    use crate::connection::{ConnectionState, DispatchConnection, StubConnection};
    use crate::dispatcher::{DispatchError, PendingOperation, RequestDispatcher};
    use crate::protocol::{Body, ProtocolId};
    use crate::protocols::default::{self, DefaultPerformative};

    /// Sends come back from `receive` with the connection as sender.
    struct LoopbackConnection {
        id: ConnectionId,
        fail_connect: bool,
        state: Mutex<ConnectionState>,
        tx: mpsc::UnboundedSender<Envelope>,
        rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
    }

    impl LoopbackConnection {
        fn new(id: &str, fail_connect: bool) -> Arc<dyn Connection> {
            let (tx, rx) = mpsc::unbounded_channel();
            Arc::new(Self {
                id: id.parse().unwrap(),
                fail_connect,
                state: Mutex::new(ConnectionState::Disconnected),
                tx,
                rx: tokio::sync::Mutex::new(rx),
            })
        }
    }

    #[async_trait]
    impl Connection for LoopbackConnection {
        fn connection_id(&self) -> &ConnectionId {
            &self.id
        }

        fn state(&self) -> ConnectionState {
            *self.state.lock().unwrap()
        }

        async fn connect(&self) -> Result<(), ConnectionError> {
            if self.fail_connect {
                return Err(ConnectionError::Io(std::io::Error::other("refused")));
            }
            *self.state.lock().unwrap() = ConnectionState::Connected;
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), ConnectionError> {
            *self.state.lock().unwrap() = ConnectionState::Disconnected;
            Ok(())
        }

        async fn send(&self, mut envelope: Envelope) -> Result<(), ConnectionError> {
            envelope.sender = self.id.to_string();
            let _ = self.tx.send(envelope);
            Ok(())
        }

        async fn receive(&self) -> Result<Option<Envelope>, ConnectionError> {
            Ok(self.rx.lock().await.recv().await)
        }
    }

    fn envelope(to: &str) -> Envelope {
        Envelope::new(to, "agent", default::bytes(b"hello".to_vec()).unwrap())
    }

    const WAIT: Option<Duration> = Some(Duration::from_secs(2));

    #[test]
    fn test_requires_connections() {
        assert!(matches!(
            Multiplexer::new(Vec::new()),
            Err(MultiplexerError::NoConnections)
        ));
    }

    #[test]
    fn test_get_on_empty_queue_does_not_block() {
        let mux = Multiplexer::new(vec![LoopbackConnection::new("fetchai/a:0.1.0", false)]).unwrap();
        let started = Instant::now();
        assert!(mux.get(false, None).is_none());
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(mux.state(), MultiplexerState::Created);
    }

    #[test]
    fn test_routing() {
        let mux = Multiplexer::new(vec![
            LoopbackConnection::new("fetchai/a:0.1.0", false),
            LoopbackConnection::new("fetchai/b:0.1.0", false),
        ])
        .unwrap();
        assert!(mux.connect().unwrap().is_ok());
        assert!(mux.is_running());

        mux.put(envelope("fetchai/b:0.1.0")).unwrap();
        assert_eq!(mux.get(true, WAIT).unwrap().sender, "fetchai/b:0.1.0");

        mux.put(envelope("some_agent")).unwrap();
        assert_eq!(mux.get(true, WAIT).unwrap().sender, "fetchai/a:0.1.0");

        mux.disconnect().unwrap();
    }

    #[test]
    fn test_default_connection() {
        let connections = vec![
            LoopbackConnection::new("fetchai/a:0.1.0", false),
            LoopbackConnection::new("fetchai/b:0.1.0", false),
        ];
        let b: ConnectionId = "fetchai/b:0.1.0".parse().unwrap();
        let mux = Multiplexer::new(connections.clone())
            .unwrap()
            .with_default_connection(&b)
            .unwrap();
        assert_eq!(mux.default_connection(), Some(&b));

        let unknown: ConnectionId = "fetchai/c:0.1.0".parse().unwrap();
        assert!(matches!(
            Multiplexer::new(connections.clone()).unwrap().with_default_connection(&unknown),
            Err(MultiplexerError::UnknownConnection(_))
        ));

        let direct = Multiplexer::new(connections).unwrap().without_default_connection();
        assert!(matches!(
            direct.put(envelope("some_agent")),
            Err(MultiplexerError::NoRoute(_))
        ));
        assert!(direct.put(envelope("fetchai/a:0.1.0")).is_ok());
    }

    #[test]
    fn test_failed_connection_is_isolated() {
        crate::logging::init_test();
        let mux = Multiplexer::new(vec![
            LoopbackConnection::new("fetchai/a:0.1.0", false),
            LoopbackConnection::new("fetchai/broken:0.1.0", true),
        ])
        .unwrap();

        let report = mux.connect().unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0.to_string(), "fetchai/broken:0.1.0");

        mux.put(envelope("fetchai/broken:0.1.0")).unwrap();
        mux.put(envelope("fetchai/a:0.1.0")).unwrap();
        assert_eq!(mux.get(true, WAIT).unwrap().sender, "fetchai/a:0.1.0");
        assert!(mux.get(true, Some(Duration::from_millis(100))).is_none());

        mux.disconnect().unwrap();
    }

    #[test]
    fn test_disconnect_is_idempotent_and_puts_survive_stop() {
        let mux = Multiplexer::new(vec![LoopbackConnection::new("fetchai/a:0.1.0", false)]).unwrap();
        assert_eq!(mux.disconnect().unwrap(), LifecycleReport::default());

        mux.connect().unwrap();
        assert!(matches!(mux.connect(), Err(MultiplexerError::AlreadyRunning)));
        assert!(mux.disconnect().unwrap().is_ok());
        assert!(mux.disconnect().unwrap().is_ok());
        assert_eq!(mux.state(), MultiplexerState::Stopped);
        assert!(!mux.connections()[0].is_connected());

        mux.put(envelope("some_agent")).unwrap();
        mux.connect().unwrap();
        assert_eq!(mux.get(true, WAIT).unwrap().sender, "fetchai/a:0.1.0");
        mux.disconnect().unwrap();
    }

    /// Replies to `bytes` requests after a delay picked by the content.
    struct DelayDispatcher;

    impl RequestDispatcher for DelayDispatcher {
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

            Ok(async move {
                match content.as_slice() {
                    b"slow" => tokio::time::sleep(Duration::from_millis(300)).await,
                    b"silent" => return None,
                    _ => {}
                }
                request
                    .reply(DefaultPerformative::Bytes, Body::new().with("content", content))
                    .ok()
            }
            .boxed())
        }
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

    #[test]
    fn test_dispatch_results_arrive_in_completion_order() {
        crate::logging::init_test();
        let ledger: Arc<dyn Connection> = Arc::new(
            DispatchConnection::new("fetchai/delay:0.1.0".parse().unwrap())
                .with_dispatcher(Arc::new(DelayDispatcher)),
        );
        let mux = Multiplexer::new(vec![ledger]).unwrap();
        assert!(mux.connect().unwrap().is_ok());

        for request in ["slow", "silent", "fast"] {
            mux.put(Envelope::new(
                "fetchai/delay:0.1.0",
                "agent",
                default::bytes(request.as_bytes().to_vec()).unwrap(),
            ))
            .unwrap();
        }

        let first = mux.get(true, WAIT).unwrap();
        assert_eq!(content(&first), b"fast");
        assert_eq!(first.to, "agent");
        assert_eq!(first.sender, "fetchai/delay:0.1.0");
        assert_eq!(content(&mux.get(true, WAIT).unwrap()), b"slow");

        // the silent request produced nothing
        assert!(mux.get(true, Some(Duration::from_millis(300))).is_none());
        assert_eq!(mux.pending(), 0);

        mux.disconnect().unwrap();
    }

    fn read_output(path: &Path) -> String {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let output = std::fs::read_to_string(path).unwrap_or_default();
            if !output.is_empty() || Instant::now() > deadline {
                return output;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_stub_echo() {
        let dir = tempfile::tempdir().unwrap();
        let stub = StubConnection::new(dir.path().join("input.txt"), dir.path().join("output.txt"))
            .with_poll_interval(Duration::from_millis(10));
        let output_file = stub.output_file().to_path_buf();
        let input_file = stub.input_file().to_path_buf();

        let stub: Arc<dyn Connection> = Arc::new(stub);
        let mux = Multiplexer::new(vec![stub]).unwrap();
        assert!(mux.connect().unwrap().is_ok());

        std::fs::write(
            &input_file,
            "multiplexer,some_agent,fetchai/default:0.1.0,{\"type\": \"bytes\", \"content\": \"aGVsbG8=\"}\n",
        )
        .unwrap();

        let received = mux.get(true, WAIT).unwrap();
        assert_eq!(received.sender, "some_agent");
        assert_eq!(received.to, "multiplexer");

        mux.put(received.mirrored()).unwrap();
        assert_eq!(
            read_output(&output_file).trim_end(),
            r#"some_agent,multiplexer,fetchai/default:0.1.0,{"content":"aGVsbG8=","type":"bytes"}"#
        );

        mux.disconnect().unwrap();
    }
}
