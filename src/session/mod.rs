//! One warmed REPL session: the management-command vocabulary plus
//! `ask_once` with its single reconnect-and-retry.

pub mod scrub;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::term::{ChatClient, ClientError, Connector};

/// Management commands are near-instant; anything slower means the REPL is
/// wedged, so they get a short idle budget.
const MGMT_IDLE: Duration = Duration::from_secs(1);

/// Default warmup budget when the caller passes zero.
const DEFAULT_WARMUP: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum SessionError {
    /// The REPL accepted the input but produced only prompt glyphs.
    /// Characteristic of external rate limits.
    #[error("quota_exhausted: prompt-only response from chat")]
    QuotaExhausted,

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl SessionError {
    pub fn is_connection(&self) -> bool {
        matches!(self, SessionError::Client(e) if e.is_connection())
    }
}

/// Session-level knobs; the channel-level knobs live in
/// [`crate::term::DialOptions`] held by the connector.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Idle budget for a real interaction.
    pub idle_timeout: Duration,
    /// Operator-supplied substrings filtered out of responses.
    pub scrub_filters: Vec<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(120),
            scrub_filters: Vec::new(),
        }
    }
}

/// Exclusive owner of one live terminal channel.
///
/// The client mutex serializes every operation on the channel, including the
/// management commands issued during cleanup, so a lease observes strict
/// FIFO semantics.
pub struct Session {
    client: Mutex<Box<dyn ChatClient>>,
    connector: Arc<dyn Connector>,
    opts: SessionOptions,
}

impl Session {
    /// Dial a fresh channel through `connector`.
    pub async fn dial(
        connector: Arc<dyn Connector>,
        opts: SessionOptions,
    ) -> Result<Self, ClientError> {
        let client = connector.connect().await?;
        Ok(Self {
            client: Mutex::new(client),
            connector,
            opts,
        })
    }

    /// Restore a prior conversation from `path`.
    pub async fn load(&self, path: &Path) -> Result<(), SessionError> {
        self.mgmt(&format!("/load {}", quote_path(path))).await
    }

    /// Persist the conversation to `path`; `force` overwrites.
    pub async fn save(&self, path: &Path, force: bool) -> Result<(), SessionError> {
        let mut cmd = format!("/save {}", quote_path(path));
        if force {
            cmd.push_str(" -f");
        }
        self.mgmt(&cmd).await
    }

    /// Compress the in-memory conversation.
    pub async fn compact(&self) -> Result<(), SessionError> {
        self.mgmt("/compact").await
    }

    /// Clear the conversation. The REPL asks `y/n`, so the confirmation is
    /// sent along with the command.
    pub async fn clear(&self) -> Result<(), SessionError> {
        self.mgmt("/clear\ny").await
    }

    /// Clear attached context files.
    pub async fn context_clear(&self) -> Result<(), SessionError> {
        self.mgmt("/context clear").await
    }

    /// Force a first interaction during pool pre-warm.
    pub async fn warmup(&self, budget: Duration) -> Result<(), SessionError> {
        let budget = if budget.is_zero() { DEFAULT_WARMUP } else { budget };
        let client = self.client.lock().await;
        client.ask("/clear\ny", budget).await?;
        Ok(())
    }

    async fn mgmt(&self, cmd: &str) -> Result<(), SessionError> {
        let client = self.client.lock().await;
        client.ask(cmd, MGMT_IDLE).await?;
        Ok(())
    }

    /// One prompt, one post-processed answer.
    ///
    /// On a connection error the stale client is closed, the channel is
    /// redialed once with the same options, and the request retried exactly
    /// once; any further failure surfaces as-is.
    pub async fn ask_once(&self, prompt: &str) -> Result<String, SessionError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(ClientError::EmptyPrompt.into());
        }

        let mut client = self.client.lock().await;
        match client.ask(prompt, self.opts.idle_timeout).await {
            Ok(raw) => self.postprocess(prompt, &raw),
            Err(e) if e.is_connection() => {
                warn!("session: ask hit connection error, redialing once: {e}");
                client.close().await;
                let fresh = self.connector.connect().await?;
                *client = fresh;
                let raw = client.ask(prompt, self.opts.idle_timeout).await?;
                self.postprocess(prompt, &raw)
            }
            Err(e) => {
                debug!("session: ask failed: {e}");
                Err(e.into())
            }
        }
    }

    fn postprocess(&self, prompt: &str, raw: &str) -> Result<String, SessionError> {
        if scrub::looks_like_prompt_only(raw) {
            warn!("session: prompt-only response (possible quota exhaustion)");
            return Err(SessionError::QuotaExhausted);
        }
        Ok(scrub::strip_prompt_echo(raw, prompt, &self.opts.scrub_filters))
    }

    /// Best-effort liveness probe of the underlying channel.
    pub async fn ping(&self) -> Result<(), SessionError> {
        let client = self.client.lock().await;
        client.ping().await?;
        Ok(())
    }

    pub async fn close(&self) {
        let client = self.client.lock().await;
        client.close().await;
    }
}

/// Quote a path for the REPL command line: backslash-escaped inside double
/// quotes.
fn quote_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let escaped = raw.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}
