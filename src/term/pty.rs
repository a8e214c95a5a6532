//! Subprocess backend: the assistant binary in chat mode behind a
//! pseudo-terminal.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::time::sleep;

use super::buffer::Shared;
use super::{ChatClient, ClientError, Connector, DialOptions, WakeMode};

/// Grace window between Ctrl-C and a hard kill on close.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Environment for a child whose output must be machine-parseable: no
/// colour, no spinner, no banner, so the prompt glyph is the only decoration
/// left.
const CLEAN_ENV: &[(&str, &str)] = &[
    ("NO_COLOR", "1"),
    ("CLICOLOR", "0"),
    ("TERM", "dumb"),
    ("Q_DISABLE_TELEMETRY", "1"),
    ("Q_DISABLE_SPINNER", "1"),
    ("Q_DISABLE_ANIMATIONS", "1"),
    ("Q_DISABLE_TIPS", "1"),
    ("Q_DISABLE_WELCOME", "1"),
];

/// Variables forwarded from the parent so the child can still find its
/// toolchain and credentials.
const KEEP_ENV_PREFIXES: &[&str] = &["PATH", "HOME", "USER", "AWS_", "Q_"];

pub struct PtyClient {
    shared: Arc<Shared>,
    writer: Arc<StdMutex<Box<dyn Write + Send>>>,
    killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,
    exited: Arc<AtomicBool>,
    // Keeps the pty pair alive; dropping the master closes the channel.
    _master: StdMutex<Box<dyn MasterPty + Send>>,
}

impl PtyClient {
    /// Spawn the assistant binary on a fresh pty and start the reader.
    pub async fn dial(opts: &DialOptions) -> Result<Self, ClientError> {
        let bin = if opts.bin.trim().is_empty() { "q" } else { opts.bin.trim() };

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: opts.rows,
                cols: opts.columns,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ClientError::Connection(format!("openpty: {e}")))?;

        let mut cmd = CommandBuilder::new(bin);
        cmd.arg("chat");
        cmd.arg("--trust-all-tools");
        for (k, v) in CLEAN_ENV {
            cmd.env(k, v);
        }
        for (key, value) in std::env::vars() {
            if KEEP_ENV_PREFIXES.iter().any(|p| key.starts_with(p)) {
                cmd.env(key, value);
            }
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| ClientError::Connection(format!("spawn {bin} chat: {e}")))?;
        drop(pair.slave);

        let killer = child.clone_killer();
        let shared = Arc::new(Shared::new());

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ClientError::Connection(format!("pty reader: {e}")))?;
        let reader_shared = shared.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        reader_shared.mark_closed("pty closed");
                        break;
                    }
                    Ok(n) => reader_shared.push(&buf[..n]),
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        reader_shared.mark_closed(format!("pty read: {e}"));
                        break;
                    }
                }
            }
        });

        let exited = Arc::new(AtomicBool::new(false));
        let wait_exited = exited.clone();
        let wait_shared = shared.clone();
        tokio::task::spawn_blocking(move || {
            let _ = child.wait();
            wait_exited.store(true, Ordering::SeqCst);
            wait_shared.mark_closed("process exited");
        });

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ClientError::Connection(format!("pty writer: {e}")))?;

        let client = Self {
            shared,
            writer: Arc::new(StdMutex::new(writer)),
            killer: StdMutex::new(killer),
            exited,
            _master: StdMutex::new(pair.master),
        };

        match opts.wake {
            WakeMode::Ctrlc => {
                client.write_bytes(&[0x03]).await?;
                client.write_bytes(b"\r").await?;
            }
            WakeMode::Newline => client.write_bytes(b"\r").await?,
            WakeMode::None => {}
        }
        debug!("pty: {bin} chat started");
        Ok(client)
    }

    /// Blocking pty writes run off the runtime; serialized by the writer
    /// mutex.
    async fn write_bytes(&self, bytes: &[u8]) -> Result<(), ClientError> {
        let writer = self.writer.clone();
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut guard = writer.lock().map_err(|_| {
                ClientError::Connection("pty writer poisoned".to_string())
            })?;
            guard
                .write_all(&bytes)
                .and_then(|_| guard.flush())
                .map_err(|e| ClientError::Connection(format!("pty write: {e}")))
        })
        .await
        .map_err(|e| ClientError::Connection(format!("writer task: {e}")))?
    }
}

#[async_trait]
impl ChatClient for PtyClient {
    async fn ask(&self, prompt: &str, idle: Duration) -> Result<String, ClientError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(ClientError::EmptyPrompt);
        }
        let start = self.shared.logical_end();
        let mut line = prompt.as_bytes().to_vec();
        line.push(b'\r');
        self.write_bytes(&line).await?;
        self.shared.wait_transcript(start, idle).await
    }

    async fn ping(&self) -> Result<(), ClientError> {
        if self.exited.load(Ordering::SeqCst) || self.shared.is_closed() {
            return Err(ClientError::Connection("process not running".to_string()));
        }
        Ok(())
    }

    async fn close(&self) {
        // Ctrl-C first so the REPL can exit on its own terms, then a hard
        // kill after the grace window.
        let _ = self.write_bytes(&[0x03]).await;
        let deadline = tokio::time::Instant::now() + KILL_GRACE;
        while tokio::time::Instant::now() < deadline {
            if self.exited.load(Ordering::SeqCst) {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
        if let Ok(mut killer) = self.killer.lock() {
            if let Err(e) = killer.kill() {
                warn!("pty: kill failed: {e}");
            }
        }
        self.shared.mark_closed("closed");
    }
}

/// Connector producing subprocess-backed clients.
pub struct PtyConnector {
    opts: DialOptions,
}

impl PtyConnector {
    pub fn new(opts: DialOptions) -> Self {
        Self { opts }
    }
}

#[async_trait]
impl Connector for PtyConnector {
    async fn connect(&self) -> Result<Box<dyn ChatClient>, ClientError> {
        Ok(Box::new(PtyClient::dial(&self.opts).await?))
    }
}
