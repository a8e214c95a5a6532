//! Terminal-channel clients.
//!
//! A [`ChatClient`] presents an interactive REPL as a request/response
//! operation: write a line, collect bytes until the prompt sentinel (or a
//! balanced JSON object) shows up, hand the raw transcript back. Two
//! backends exist: a subprocess behind a pseudo-terminal ([`pty`]) and a
//! terminal-over-HTTP WebSocket gateway ([`ws`]).

pub mod buffer;
pub mod pty;
pub mod scan;
pub mod ws;

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// Hard cap on the per-client read buffer.
pub const MAX_READ_BUFFER: usize = 256 * 1024;

/// Upper bound on a single poll slice inside `ask`.
pub const POLL_SLICE: Duration = Duration::from_millis(100);

/// Errors surfaced by a terminal client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("empty prompt")]
    EmptyPrompt,

    #[error("deadline exceeded waiting for prompt")]
    DeadlineExceeded,

    #[error("operation cancelled")]
    Cancelled,

    /// The channel itself failed: closed by peer, broken pipe, abnormal
    /// close codes. Signals the session to reconnect once.
    #[error("connection error: {0}")]
    Connection(String),
}

impl ClientError {
    /// Whether this error means the underlying channel is gone.
    pub fn is_connection(&self) -> bool {
        matches!(self, ClientError::Connection(_))
    }
}

/// Initial input injected after the channel is established.
///
/// The REPL may block on MCP-tool initialization until it first sees user
/// input, so a nudge is usually required before the first prompt appears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WakeMode {
    /// Ctrl-C followed by a carriage return.
    Ctrlc,
    /// A bare carriage return.
    #[default]
    Newline,
    /// Nothing; the REPL is assumed to prompt on its own.
    None,
}

impl WakeMode {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "ctrlc" => WakeMode::Ctrlc,
            "none" => WakeMode::None,
            _ => WakeMode::Newline,
        }
    }
}

/// Everything needed to (re)establish one terminal channel.
#[derive(Debug, Clone)]
pub struct DialOptions {
    /// WebSocket endpoint (`ws://…/ws`); ignored by the subprocess backend.
    pub endpoint: String,
    /// Assistant binary; ignored by the WebSocket backend.
    pub bin: String,
    pub username: String,
    pub password: String,
    pub auth_header_name: String,
    pub auth_header_val: String,
    /// Override for the token probe URL; derived from `endpoint` if empty.
    pub token_url: String,
    /// Skip authentication entirely (no AuthToken in the hello frame).
    pub no_auth: bool,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    /// Interaction idle budget; also bounds the initial banner read.
    pub idle_timeout: Duration,
    pub columns: u16,
    pub rows: u16,
    pub insecure_tls: bool,
    pub wake: WakeMode,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:7682/ws".to_string(),
            bin: "q".to_string(),
            username: String::new(),
            password: String::new(),
            auth_header_name: String::new(),
            auth_header_val: String::new(),
            token_url: String::new(),
            no_auth: true,
            handshake_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(120),
            columns: 120,
            rows: 30,
            insecure_tls: false,
            wake: WakeMode::Newline,
        }
    }
}

/// One live bidirectional byte channel to one REPL.
///
/// Implementations serialize writes internally; at most one `ask` may be in
/// flight per client (the session's write lock guarantees this).
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Write `prompt` and collect the raw transcript until the prompt
    /// sentinel appears, a balanced JSON object completes, or `idle` runs
    /// out.
    async fn ask(&self, prompt: &str, idle: Duration) -> Result<String, ClientError>;

    /// Best-effort liveness probe of the backend; says nothing about REPL
    /// readiness.
    async fn ping(&self) -> Result<(), ClientError>;

    /// Tear the channel down and stop the background reader.
    async fn close(&self);
}

/// Factory for terminal channels; the session keeps one to redial after a
/// connection error, the pool keeps one to fill slots.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ChatClient>, ClientError>;
}
