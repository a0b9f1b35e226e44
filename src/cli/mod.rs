//! CLI commands for agentmux using clap.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{load_settings, Settings};
use crate::multiplexer::Multiplexer;
use crate::protocol::{Message, ProtocolId, SchemaRegistry};

/// How long the echo loop waits for an envelope before checking for Ctrl-C.
const ECHO_POLL: Duration = Duration::from_millis(200);

/// agentmux - envelope multiplexer and protocol message validator.
#[derive(Parser)]
#[command(name = "agentmux")]
#[command(version = "0.1.0")]
#[command(about = "Envelope multiplexer and protocol message validator", long_about = None)]
pub struct Commands {
    /// Log everything at debug level
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a multiplexer and echo every received envelope back to its sender
    Run {
        /// Settings file (defaults to ~/.agentmux/settings.json)
        #[arg(long, env = "AGENTMUX_CONFIG")]
        config: Option<PathBuf>,

        /// Input file of a single stub connection, instead of a settings file
        #[arg(long, requires = "output")]
        input: Option<PathBuf>,

        /// Output file of a single stub connection
        #[arg(long, requires = "input")]
        output: Option<PathBuf>,
    },

    /// Decode and validate a message file
    Check {
        /// JSON file holding one message
        file: PathBuf,

        /// Protocol of the message, e.g. fetchai/oef:0.1.0
        #[arg(long, short)]
        protocol: String,
    },

    /// List registered protocols and their performatives
    Protocols,
}

impl Commands {
    /// Run the command.
    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Command::Run {
                config,
                input,
                output,
            } => cmd_run(config.as_deref(), input.as_deref(), output.as_deref()).await,
            Command::Check { file, protocol } => cmd_check(file, protocol),
            Command::Protocols => cmd_protocols(),
        }
    }
}

// Command implementations

async fn cmd_run(config: Option<&Path>, input: Option<&Path>, output: Option<&Path>) -> Result<()> {
    let settings = match (input, output) {
        (Some(input), Some(output)) => Settings::stub(input, output),
        _ => load_settings(config)?,
    };
    let multiplexer = Arc::new(settings.multiplexer()?);

    for stub in &settings.connections {
        println!(
            "{}: reading {} writing {}",
            stub.id,
            stub.input_file.display(),
            stub.output_file.display()
        );
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("Stopping...");
                stop.store(true, Ordering::SeqCst);
            }
        });
    }

    // The multiplexer surface is blocking; keep it off the async workers.
    tokio::task::spawn_blocking(move || echo(&multiplexer, &stop))
        .await
        .context("Echo loop panicked")?
}

fn echo(multiplexer: &Multiplexer, stop: &AtomicBool) -> Result<()> {
    let report = multiplexer.connect()?;
    for (connection, error) in &report.failed {
        eprintln!("Connection {} failed to start: {}", connection, error);
    }

    while !stop.load(Ordering::SeqCst) {
        let Some(envelope) = multiplexer.get(true, Some(ECHO_POLL)) else {
            continue;
        };
        println!(
            "Envelope received by Multiplexer: sender={}, to={}, protocol_id={}, message={}",
            envelope.sender, envelope.to, envelope.protocol_id, envelope.message
        );
        if let Err(e) = multiplexer.put(envelope.mirrored()) {
            eprintln!("Could not send response: {}", e);
        }
    }

    let report = multiplexer.disconnect()?;
    for (connection, error) in &report.failed {
        eprintln!("Connection {} failed to stop: {}", connection, error);
    }
    Ok(())
}

fn cmd_check(file: &Path, protocol: &str) -> Result<()> {
    let registry = SchemaRegistry::with_defaults();
    let protocol_id: ProtocolId = protocol.parse()?;
    let schema = registry
        .get(&protocol_id)
        .ok_or_else(|| anyhow::anyhow!("Unknown protocol: {}", protocol_id))?;

    let bytes = std::fs::read(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    match Message::decode(schema, &bytes) {
        Ok(message) => {
            println!("valid: {}", message);
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!("invalid {} message: {}", protocol_id, e)),
    }
}

fn cmd_protocols() -> Result<()> {
    let registry = SchemaRegistry::with_defaults();
    for schema in registry.schemas() {
        println!("{}", schema);
        for performative in schema.performatives {
            let fields: Vec<String> = performative
                .fields
                .iter()
                .map(|f| {
                    if f.optional {
                        format!("{}: {}?", f.name, f.kind.name())
                    } else {
                        format!("{}: {}", f.name, f.kind.name())
                    }
                })
                .collect();
            println!("  {}({})", performative.name, fields.join(", "));
        }
    }
    Ok(())
}
