//! Per-request state machine: resolve the sop_id, lease a session, run the
//! load → ask → compact → save → clear protocol, classify the output and
//! propagate failure precisely.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Deserialize;
use thiserror::Error;
use tokio::time::timeout;

use crate::pool::{Lease, PoolError, SessionPool};
use crate::session::SessionError;
use crate::store::{ConvStore, SopMap};

/// Budget for drawing a session from the pool.
const ACQUIRE_BUDGET: Duration = Duration::from_secs(30);

/// The cleanup phase runs under its own deadline so a cancelled request
/// never leaks a dirty session back into the pool.
const CLEANUP_BUDGET: Duration = Duration::from_secs(10);

/// Markers whose presence makes an answer worth persisting.
const USABLE_MARKERS: &[&str] = &["root_cause", "analysis_summary", "confidence"];

/// Minimum length (in characters) for a marker-less answer to count as
/// usable.
const USABLE_MIN_CHARS: usize = 200;

#[derive(Debug, Deserialize)]
pub struct IncidentInput {
    #[serde(default)]
    pub incident_key: String,
    /// Authoritative when provided; recorded into the map.
    #[serde(default)]
    pub sop_id: Option<String>,
    #[serde(default)]
    pub prompt: String,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("sopmap write failed: {0}")]
    SopMap(#[source] anyhow::Error),
}

pub struct Orchestrator {
    pool: SessionPool,
    sopmap: Arc<SopMap>,
    conv: Arc<ConvStore>,
}

impl Orchestrator {
    pub fn new(pool: SessionPool, sopmap: Arc<SopMap>, conv: Arc<ConvStore>) -> Self {
        Self { pool, sopmap, conv }
    }

    /// Process one incident request end to end and return the answer.
    pub async fn process(&self, input: IncidentInput) -> Result<String, ProcessError> {
        let sop_id = match &input.sop_id {
            Some(id) if !id.trim().is_empty() => {
                let id = id.trim().to_string();
                if !input.incident_key.trim().is_empty() {
                    self.sopmap
                        .set(input.incident_key.trim(), &id)
                        .await
                        .map_err(ProcessError::SopMap)?;
                }
                id
            }
            _ => self
                .sopmap
                .get_or_create(input.incident_key.trim())
                .await
                .map_err(ProcessError::SopMap)?,
        };

        let conv_path = self.conv.path_for(&sop_id);
        info!(
            "orchestrator: incident_key={} -> sop_id={sop_id}, conv={}",
            input.incident_key,
            conv_path.display()
        );

        let lease = self.pool.acquire(ACQUIRE_BUDGET).await?;
        let result = run_protocol(&lease, &conv_path, input.prompt.trim()).await;
        lease.release().await;
        result
    }
}

/// The per-lease command sequence. Connection errors mark the lease broken
/// and abort; other management failures are logged and skipped over.
async fn run_protocol(
    lease: &Lease,
    conv_path: &Path,
    prompt: &str,
) -> Result<String, ProcessError> {
    let session = lease.session();

    if conv_path.exists() {
        debug!("orchestrator: /load {}", conv_path.display());
        match session.load(conv_path).await {
            Ok(()) => debug!("orchestrator: /load ok"),
            Err(e) if e.is_connection() => {
                lease.mark_broken();
                session.close().await;
                warn!("orchestrator: /load failed (conn): {e}");
                return Err(e.into());
            }
            Err(e) => warn!("orchestrator: /load failed: {e}"),
        }
    }

    let answer = match session.ask_once(prompt).await {
        Ok(answer) => answer,
        Err(e) => {
            if e.is_connection() {
                lease.mark_broken();
                session.close().await;
            }
            return Err(e.into());
        }
    };

    if is_usable(&answer) {
        debug!("orchestrator: /compact");
        match session.compact().await {
            Ok(()) => debug!("orchestrator: /compact ok"),
            Err(e) if e.is_connection() => {
                lease.mark_broken();
                warn!("orchestrator: /compact failed (conn): {e}");
                return Err(e.into());
            }
            Err(e) => warn!("orchestrator: /compact failed: {e}"),
        }

        debug!("orchestrator: /save {} (force)", conv_path.display());
        match session.save(conv_path, true).await {
            Ok(()) => debug!("orchestrator: /save ok"),
            Err(e) if e.is_connection() => {
                lease.mark_broken();
                warn!("orchestrator: /save failed (conn): {e}");
                return Err(e.into());
            }
            Err(e) => warn!("orchestrator: /save failed: {e}"),
        }
    } else {
        info!("orchestrator: answer not usable, keeping last saved conversation");
    }

    // Best-effort cleanup on its own clock; failure never takes down a
    // request that already has an answer.
    let cleanup = timeout(CLEANUP_BUDGET, async {
        debug!("orchestrator: /clear (cleanup)");
        match session.clear().await {
            Ok(()) => debug!("orchestrator: /clear ok"),
            Err(e) if e.is_connection() => {
                lease.mark_broken();
                warn!("orchestrator: /clear failed (conn): {e}");
            }
            Err(e) => warn!("orchestrator: /clear failed: {e}"),
        }
    })
    .await;
    if cleanup.is_err() {
        warn!("orchestrator: cleanup exceeded its budget");
        lease.mark_broken();
    }

    Ok(answer)
}

/// Whether `answer` justifies persisting the conversation. Unusable answers
/// skip `/compact` and `/save` so the file on disk stays at the last known
/// good state.
pub fn is_usable(answer: &str) -> bool {
    let trimmed = answer.trim();
    if trimmed.is_empty() {
        return false;
    }
    let lower = trimmed.to_lowercase();
    if USABLE_MARKERS.iter().any(|m| lower.contains(m)) {
        return true;
    }
    trimmed.chars().count() >= USABLE_MIN_CHARS
}
