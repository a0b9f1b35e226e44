//! File-backed connection.
//!
//! Envelopes are exchanged as `to,sender,protocol_id,payload` lines: the
//! input file is polled and its complete lines consumed; sent envelopes are
//! appended to the output file. Both sides hold an exclusive lock on the file
//! while touching it, so cooperating peers never interleave.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Connection, ConnectionError, ConnectionState};
use crate::protocol::{ConnectionId, Envelope, PublicId, SchemaRegistry};

/// Default poll interval of the input file.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct StubState {
    status: ConnectionState,
    poller: Option<JoinHandle<()>>,
}

/// Connection reading envelopes from one file and writing them to another.
pub struct StubConnection {
    connection_id: ConnectionId,
    input_file: PathBuf,
    output_file: PathBuf,
    poll_interval: Duration,
    registry: Arc<SchemaRegistry>,
    state: Mutex<StubState>,
    inbox: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
}

impl StubConnection {
    /// Stub connection `fetchai/stub:0.1.0` over the given files.
    pub fn new(input_file: impl Into<PathBuf>, output_file: impl Into<PathBuf>) -> Self {
        Self {
            connection_id: PublicId::from_parts("fetchai", "stub", "0.1.0"),
            input_file: input_file.into(),
            output_file: output_file.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            registry: Arc::new(SchemaRegistry::with_defaults()),
            state: Mutex::new(StubState {
                status: ConnectionState::Disconnected,
                poller: None,
            }),
            inbox: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_id(mut self, connection_id: ConnectionId) -> Self {
        self.connection_id = connection_id;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Schemas used to decode incoming payloads.
    pub fn with_registry(mut self, registry: Arc<SchemaRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn input_file(&self) -> &Path {
        &self.input_file
    }

    pub fn output_file(&self) -> &Path {
        &self.output_file
    }

    fn stub_state(&self) -> MutexGuard<'_, StubState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Create the file (and its parent directory) if missing, keeping contents.
async fn touch(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    Ok(())
}

/// Take the complete lines of the input file. A trailing line without its
/// newline is left in the file for the next poll.
fn drain_input(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
    file.lock()?;

    let mut content = Vec::new();
    file.read_to_end(&mut content)?;
    let Some(end) = content.iter().rposition(|b| *b == b'\n') else {
        return Ok(String::new());
    };
    let mut tail = content.split_off(end + 1);
    // Writers that do not lock may have appended since the read.
    file.read_to_end(&mut tail)?;

    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&tail)?;
    Ok(String::from_utf8_lossy(&content).into_owned())
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file: File = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.lock()?;
    file.write_all(line.as_bytes())?;
    file.flush()
}

async fn poll_input(
    path: PathBuf,
    interval: Duration,
    registry: Arc<SchemaRegistry>,
    tx: mpsc::UnboundedSender<Envelope>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;

        let drained = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || drain_input(&path)).await
        };
        let content = match drained {
            Ok(Ok(content)) => content,
            Ok(Err(e)) => {
                tracing::warn!("Failed to read {}: {}", path.display(), e);
                continue;
            }
            Err(e) => {
                tracing::error!("Reader of {} panicked: {}", path.display(), e);
                continue;
            }
        };

        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match Envelope::decode_line(line, &registry) {
                Ok(envelope) => {
                    tracing::debug!("Read envelope from {}: {}", path.display(), envelope);
                    if tx.send(envelope).is_err() {
                        return;
                    }
                }
                Err(e) => tracing::warn!("Skipping malformed line in {}: {}", path.display(), e),
            }
        }
    }
}

#[async_trait]
impl Connection for StubConnection {
    fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    fn state(&self) -> ConnectionState {
        self.stub_state().status
    }

    async fn connect(&self) -> Result<(), ConnectionError> {
        if self.is_connected() {
            return Ok(());
        }
        self.stub_state().status = ConnectionState::Connecting;

        if let Err(e) = async {
            touch(&self.input_file).await?;
            touch(&self.output_file).await
        }
        .await
        {
            self.stub_state().status = ConnectionState::Disconnected;
            return Err(e.into());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbox.lock().await = Some(rx);
        let poller = tokio::spawn(poll_input(
            self.input_file.clone(),
            self.poll_interval,
            self.registry.clone(),
            tx,
        ));

        let mut state = self.stub_state();
        state.poller = Some(poller);
        state.status = ConnectionState::Connected;
        tracing::info!(
            "Stub connection {} reading {} writing {}",
            self.connection_id,
            self.input_file.display(),
            self.output_file.display()
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        let mut state = self.stub_state();
        if state.status == ConnectionState::Disconnected {
            return Ok(());
        }
        if let Some(poller) = state.poller.take() {
            poller.abort();
        }
        state.status = ConnectionState::Disconnected;
        tracing::info!("Stub connection {} disconnected", self.connection_id);
        Ok(())
    }

    async fn send(&self, envelope: Envelope) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }

        let mut line = envelope.encode_line()?;
        line.push('\n');

        let path = self.output_file.clone();
        tokio::task::spawn_blocking(move || append_line(&path, &line))
            .await
            .map_err(std::io::Error::other)??;

        tracing::debug!("Wrote envelope to {}: {}", self.output_file.display(), envelope);
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Envelope>, ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        let mut inbox = self.inbox.lock().await;
        let rx = inbox.as_mut().ok_or(ConnectionError::NotConnected)?;
        match rx.recv().await {
            Some(envelope) => Ok(Some(envelope)),
            None => Err(ConnectionError::NotConnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::default;

    const LINE: &str = r#"multiplexer,some_agent,fetchai/default:0.1.0,{"type": "bytes", "content": "aGVsbG8="}"#;

    fn stub(dir: &Path) -> StubConnection {
        StubConnection::new(dir.join("input.txt"), dir.join("output.txt"))
            .with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_connect_creates_files() {
        let dir = tempfile::tempdir().unwrap();
        let conn = stub(&dir.path().join("nested"));
        conn.connect().await.unwrap();

        assert!(conn.input_file().exists());
        assert!(conn.output_file().exists());
        assert_eq!(conn.connection_id().to_string(), "fetchai/stub:0.1.0");
        conn.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_from_input_file() {
        let dir = tempfile::tempdir().unwrap();
        let conn = stub(dir.path());
        conn.connect().await.unwrap();

        std::fs::write(conn.input_file(), format!("garbage\n{}\n", LINE)).unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(2), conn.receive())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(envelope.to, "multiplexer");
        assert_eq!(envelope.sender, "some_agent");
        assert_eq!(
            envelope.message.as_message().unwrap().get_bytes("content").unwrap(),
            b"hello"
        );

        // consumed lines are removed from the input file
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(std::fs::read_to_string(conn.input_file()).unwrap(), "");
        conn.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_line_written_in_two_chunks() {
        crate::logging::init_test();
        let dir = tempfile::tempdir().unwrap();
        let conn = stub(dir.path());
        conn.connect().await.unwrap();

        let (head, rest) = LINE.split_at(LINE.len() / 2);
        let append = |chunk: &str| {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(conn.input_file())
                .unwrap();
            file.write_all(chunk.as_bytes()).unwrap();
        };

        append(head);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(std::fs::read_to_string(conn.input_file()).unwrap(), head);

        append(&format!("{}\n", rest));
        let envelope = tokio::time::timeout(Duration::from_secs(2), conn.receive())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(envelope.sender, "some_agent");
        conn.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let conn = stub(dir.path());
        conn.connect().await.unwrap();

        let envelope = Envelope::new("some_agent", "multiplexer", default::bytes(b"hello".to_vec()).unwrap());
        conn.send(envelope.clone()).await.unwrap();
        conn.send(envelope).await.unwrap();

        let output = std::fs::read_to_string(conn.output_file()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            r#"some_agent,multiplexer,fetchai/default:0.1.0,{"content":"aGVsbG8=","type":"bytes"}"#
        );
        conn.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_not_connected() {
        let dir = tempfile::tempdir().unwrap();
        let conn = stub(dir.path());
        let envelope = Envelope::new("a", "b", default::bytes(b"x".to_vec()).unwrap());
        assert!(matches!(
            conn.send(envelope).await,
            Err(ConnectionError::NotConnected)
        ));
        assert!(matches!(conn.receive().await, Err(ConnectionError::NotConnected)));
    }
}
