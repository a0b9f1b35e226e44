//! agentmux library root.

pub mod cli;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod multiplexer;
pub mod protocol;
pub mod protocols;

pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use connection::{Connection, ConnectionError, ConnectionState, DispatchConnection, StubConnection};
pub use dispatcher::{DispatchError, PendingOperation, RequestDispatcher};
pub use error::{Error, Result};
pub use multiplexer::{LifecycleReport, Multiplexer, MultiplexerError, MultiplexerState};
pub use protocol::{Envelope, Message, MessageError, ProtocolSchema, SchemaRegistry, SchemaViolation};
