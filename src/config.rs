//! Configuration loading for agentmux.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::connection::{Connection, DispatchConnection, StubConnection};
use crate::dispatcher::ledger::{DEFAULT_RECEIPT_ATTEMPTS, DEFAULT_RECEIPT_INTERVAL};
use crate::dispatcher::{ContractApiRequestDispatcher, LedgerApiRequestDispatcher};
use crate::error::{Error, Result};
use crate::multiplexer::Multiplexer;
use crate::protocol::ConnectionId;

/// Get the agentmux home directory (~/.agentmux).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".agentmux"))
}

/// Get the default settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from `path`, or ~/.agentmux/settings.json when `None`.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => get_settings_path()?,
    };

    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(&path)?;
    let settings: Settings = serde_json::from_str(&content)?;
    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.connections.is_empty() {
        return Err(Error::Config("No connections configured".to_string()));
    }

    let mut seen = HashSet::new();
    for connection in &settings.connections {
        if !seen.insert(&connection.id) {
            return Err(Error::Config(format!(
                "Connection '{}' is configured more than once",
                connection.id
            )));
        }
        if connection.id.name() == "ledger" {
            return Err(Error::Config(format!(
                "Connection id '{}' is reserved for the ledger connection",
                connection.id
            )));
        }
        if connection.poll_interval_ms == 0 {
            return Err(Error::Config(format!(
                "Connection '{}' needs a positive poll_interval_ms",
                connection.id
            )));
        }
    }

    if let Some(default) = &settings.default_connection {
        if !seen.contains(default) {
            return Err(Error::Config(format!(
                "default_connection '{}' not found in connections",
                default
            )));
        }
    }

    if settings.ledger.receipt_retry_attempts == 0 {
        return Err(Error::Config(
            "ledger.receipt_retry_attempts must be at least 1".to_string(),
        ));
    }
    Ok(())
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_stub_id() -> ConnectionId {
    ConnectionId::from_parts("fetchai", "stub", "0.1.0")
}

/// File-backed stub connection.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StubConnectionConfig {
    /// Connection id, `author/name:version`
    #[serde(default = "default_stub_id")]
    pub id: ConnectionId,

    /// File polled for incoming envelopes
    pub input_file: PathBuf,

    /// File sent envelopes are appended to
    pub output_file: PathBuf,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl StubConnectionConfig {
    pub fn new(input_file: impl Into<PathBuf>, output_file: impl Into<PathBuf>) -> Self {
        Self {
            id: default_stub_id(),
            input_file: input_file.into(),
            output_file: output_file.into(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }

    pub fn build(&self) -> StubConnection {
        StubConnection::new(&self.input_file, &self.output_file)
            .with_id(self.id.clone())
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
    }
}

/// Ledger dispatcher settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LedgerSettings {
    pub receipt_retry_attempts: u32,
    pub receipt_retry_interval_ms: u64,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            receipt_retry_attempts: DEFAULT_RECEIPT_ATTEMPTS,
            receipt_retry_interval_ms: DEFAULT_RECEIPT_INTERVAL.as_millis() as u64,
        }
    }
}

impl LedgerSettings {
    /// Ledger dispatcher with these retry settings and no ledgers yet.
    pub fn dispatcher(&self) -> LedgerApiRequestDispatcher {
        LedgerApiRequestDispatcher::new().with_receipt_retry(
            self.receipt_retry_attempts,
            Duration::from_millis(self.receipt_retry_interval_ms),
        )
    }
}

/// agentmux settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub connections: Vec<StubConnectionConfig>,

    /// Route for envelopes not addressed to a connection; the first
    /// connection when unset.
    #[serde(default)]
    pub default_connection: Option<ConnectionId>,

    #[serde(default)]
    pub ledger: LedgerSettings,
}

impl Settings {
    /// Settings with a single stub connection.
    pub fn stub(input_file: impl Into<PathBuf>, output_file: impl Into<PathBuf>) -> Self {
        Self {
            connections: vec![StubConnectionConfig::new(input_file, output_file)],
            ..Default::default()
        }
    }

    /// Build the multiplexer over the configured stub connections followed
    /// by the ledger connection.
    pub fn multiplexer(&self) -> Result<Multiplexer> {
        validate_settings(self)?;
        let mut connections: Vec<Arc<dyn Connection>> = self
            .connections
            .iter()
            .map(|c| Arc::new(c.build()) as Arc<dyn Connection>)
            .collect();
        connections.push(Arc::new(DispatchConnection::ledger(
            self.ledger.dispatcher(),
            ContractApiRequestDispatcher::new(),
        )));

        let multiplexer = Multiplexer::new(connections)?;
        Ok(match &self.default_connection {
            Some(id) => multiplexer.with_default_connection(id)?,
            None => multiplexer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{
                "connections": [
                    {"input_file": "in.txt", "output_file": "out.txt"},
                    {"id": "acme/files:1.0.0", "input_file": "a.txt", "output_file": "b.txt", "poll_interval_ms": 5}
                ],
                "default_connection": "acme/files:1.0.0",
                "ledger": {"receipt_retry_attempts": 3, "receipt_retry_interval_ms": 10}
            }"#,
        )
        .unwrap();

        let settings = load_settings(Some(&path)).unwrap();
        assert_eq!(settings.connections.len(), 2);
        assert_eq!(settings.connections[0].id.to_string(), "fetchai/stub:0.1.0");
        assert_eq!(settings.connections[0].poll_interval_ms, 100);
        assert_eq!(settings.ledger.receipt_retry_attempts, 3);

        let mux = settings.multiplexer().unwrap();
        assert_eq!(mux.default_connection().unwrap().to_string(), "acme/files:1.0.0");
        let ids: Vec<String> = mux
            .connections()
            .iter()
            .map(|c| c.connection_id().to_string())
            .collect();
        assert_eq!(
            ids,
            vec!["fetchai/stub:0.1.0", "acme/files:1.0.0", "fetchai/ledger:0.1.0"]
        );
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_settings(Some(&dir.path().join("nope.json"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_invalid_settings() {
        let mut settings = Settings::stub("in.txt", "out.txt");
        settings.connections.push(StubConnectionConfig::new("a.txt", "b.txt"));
        assert!(validate_settings(&settings).is_err());

        let mut settings = Settings::stub("in.txt", "out.txt");
        settings.default_connection = Some("acme/other:1.0.0".parse().unwrap());
        assert!(validate_settings(&settings).is_err());

        assert!(validate_settings(&Settings::default()).is_err());
        assert!(validate_settings(&Settings::stub("in.txt", "out.txt")).is_ok());
    }

    #[test]
    fn test_malformed_connection_id() {
        let json = r#"{"connections": [{"id": "not an id", "input_file": "a", "output_file": "b"}]}"#;
        assert!(serde_json::from_str::<Settings>(json).is_err());
    }
}
