//! Bounded pool of warmed sessions.
//!
//! The ready queue is the single point of contention: a session is either in
//! the queue or leased, never both. Broken sessions are closed and replaced
//! by background refill workers whose retries share one process-wide backoff
//! ledger, so a dead backend degrades into a capped trickle of dials instead
//! of a retry storm.

use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::{Instant, sleep, timeout};

use crate::session::{Session, SessionOptions};
use crate::term::Connector;

/// Draw-and-probe attempts inside one acquire.
const ACQUIRE_ATTEMPTS: u32 = 3;

/// Budget for the acquire-time health probe.
const PROBE_BUDGET: Duration = Duration::from_secs(1);

/// Dial attempts inside one refill task.
const REFILL_ATTEMPTS: u32 = 3;

/// Ceiling on one backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Stagger between pre-warm dials.
const PREWARM_STAGGER: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no session available within deadline")]
    Timeout,

    /// The consecutive-failure ceiling was exceeded; refills are refused
    /// until a dial succeeds.
    #[error("pool unhealthy: {0} consecutive dial failures")]
    Unhealthy(u32),

    #[error("dial failed: {0}")]
    Dial(String),
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Target number of warmed sessions.
    pub size: usize,
    /// Bound on a single dial (handshake + banner).
    pub dial_timeout: Duration,
    /// Consecutive dial-failure ceiling; exceeding it refuses refills.
    pub fail_ceiling: u32,
    pub session: SessionOptions,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: 2,
            dial_timeout: Duration::from_secs(30),
            fail_ceiling: 20,
            session: SessionOptions::default(),
        }
    }
}

struct PoolInner {
    connector: Arc<dyn Connector>,
    opts: PoolOptions,
    ready: StdMutex<VecDeque<Session>>,
    /// One permit per queued session.
    available: Semaphore,
    leased: AtomicUsize,
    refillers: AtomicUsize,
    consecutive_failures: AtomicU32,
}

/// Bounded multiset of warmed sessions.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    /// Build the pool and kick off the staggered pre-warm in the
    /// background. The pool is usable immediately; `/readyz` reports
    /// healthy once at least one dial has landed.
    pub fn new(connector: Arc<dyn Connector>, opts: PoolOptions) -> Self {
        let size = opts.size.max(1);
        let inner = Arc::new(PoolInner {
            connector,
            opts: PoolOptions { size, ..opts },
            ready: StdMutex::new(VecDeque::with_capacity(size)),
            available: Semaphore::new(0),
            leased: AtomicUsize::new(0),
            refillers: AtomicUsize::new(0),
            consecutive_failures: AtomicU32::new(0),
        });

        let warm = inner.clone();
        tokio::spawn(async move {
            for i in 0..warm.opts.size {
                if i > 0 {
                    sleep(PREWARM_STAGGER).await;
                }
                match warm.dial().await {
                    Ok(session) => {
                        // Force a first interaction so the REPL finishes its
                        // tool initialization before the session is leased.
                        match session.warmup(warm.opts.dial_timeout).await {
                            Err(e) if e.is_connection() => {
                                warn!("pool: pre-warm warmup {} failed (conn): {e}", i + 1);
                                session.close().await;
                                warm.note_failure();
                                continue;
                            }
                            Err(e) => warn!("pool: pre-warm warmup {} failed: {e}", i + 1),
                            Ok(()) => {}
                        }
                        warm.push_ready(session).await;
                        debug!("pool: pre-warm session {} ready", i + 1);
                    }
                    Err(e) => {
                        warn!("pool: pre-warm dial {} failed: {e}", i + 1);
                        warm.note_failure();
                    }
                }
            }
            let (ready, size) = warm.stats();
            info!("pool: pre-warm finished, {ready}/{size} ready");
        });

        Self { inner }
    }

    /// `(ready, size)` for the health endpoints.
    pub fn stats(&self) -> (usize, usize) {
        self.inner.stats()
    }

    /// Clear the consecutive-failure ledger, re-enabling refills.
    pub fn reset_failures(&self) {
        self.inner.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Draw a healthy session within `budget`.
    ///
    /// Each attempt draws from the queue and runs a short probe; a failed
    /// probe closes the session and dials a replacement synchronously with
    /// whatever budget remains. An empty queue below target size also dials
    /// synchronously.
    pub async fn acquire(&self, budget: Duration) -> Result<Lease, PoolError> {
        let inner = &self.inner;
        let deadline = Instant::now() + budget;

        for attempt in 1..=ACQUIRE_ATTEMPTS {
            let failures = inner.consecutive_failures.load(Ordering::SeqCst);
            if failures > inner.opts.fail_ceiling {
                return Err(PoolError::Unhealthy(failures));
            }

            if let Some(session) = inner.try_draw() {
                match timeout(PROBE_BUDGET, session.ping()).await {
                    Ok(Ok(())) => return Ok(self.lease(session)),
                    probe => {
                        debug!("pool: health probe failed on draw (attempt {attempt}): {probe:?}");
                        session.close().await;
                        match inner.dial_within(deadline).await {
                            Ok(fresh) => return Ok(self.lease(fresh)),
                            Err(e) => {
                                inner.note_failure();
                                debug!("pool: replacement dial failed: {e}");
                                continue;
                            }
                        }
                    }
                }
            }

            // Queue empty. Dial only while below target so leased + ready
            // never exceeds size.
            let live = inner.leased.load(Ordering::SeqCst) + inner.ready_len();
            if live < inner.opts.size {
                match inner.dial_within(deadline).await {
                    Ok(fresh) => return Ok(self.lease(fresh)),
                    Err(e) => {
                        inner.note_failure();
                        debug!("pool: cold dial failed (attempt {attempt}): {e}");
                    }
                }
            }

            // All sessions are out; wait for a release.
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PoolError::Timeout);
            }
            match timeout(remaining, inner.available.acquire()).await {
                Ok(Ok(permit)) => {
                    permit.forget();
                    let session = {
                        let mut ready = inner.ready.lock().expect("ready queue poisoned");
                        ready.pop_front()
                    };
                    if let Some(session) = session {
                        match timeout(PROBE_BUDGET, session.ping()).await {
                            Ok(Ok(())) => return Ok(self.lease(session)),
                            _ => {
                                session.close().await;
                                inner.spawn_refill();
                                continue;
                            }
                        }
                    }
                }
                Ok(Err(_)) => return Err(PoolError::Timeout),
                Err(_) => return Err(PoolError::Timeout),
            }
        }
        Err(PoolError::Timeout)
    }

    fn lease(&self, session: Session) -> Lease {
        self.inner.leased.fetch_add(1, Ordering::SeqCst);
        Lease {
            inner: self.inner.clone(),
            session: Some(session),
            broken: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl PoolInner {
    fn stats(&self) -> (usize, usize) {
        (self.ready_len(), self.opts.size)
    }

    fn ready_len(&self) -> usize {
        self.ready.lock().expect("ready queue poisoned").len()
    }

    fn try_draw(&self) -> Option<Session> {
        let permit = self.available.try_acquire().ok()?;
        permit.forget();
        let mut ready = self.ready.lock().expect("ready queue poisoned");
        ready.pop_front()
    }

    /// Return a session to the queue; full queue means the session is
    /// surplus and gets closed.
    async fn push_ready(&self, session: Session) {
        let surplus = {
            let mut ready = self.ready.lock().expect("ready queue poisoned");
            if ready.len() >= self.opts.size {
                Some(session)
            } else {
                ready.push_back(session);
                self.available.add_permits(1);
                None
            }
        };
        if let Some(surplus) = surplus {
            debug!("pool: queue full, dropping surplus session");
            surplus.close().await;
        }
    }

    async fn dial(&self) -> Result<Session, PoolError> {
        let dialed = timeout(
            self.opts.dial_timeout,
            Session::dial(self.connector.clone(), self.opts.session.clone()),
        )
        .await
        .map_err(|_| PoolError::Dial("dial timeout".to_string()))?
        .map_err(|e| PoolError::Dial(e.to_string()))?;
        self.consecutive_failures.store(0, Ordering::SeqCst);
        Ok(dialed)
    }

    async fn dial_within(&self, deadline: Instant) -> Result<Session, PoolError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(PoolError::Timeout);
        }
        let budget = remaining.min(self.opts.dial_timeout);
        let dialed = timeout(
            budget,
            Session::dial(self.connector.clone(), self.opts.session.clone()),
        )
        .await
        .map_err(|_| PoolError::Dial("dial timeout".to_string()))?
        .map_err(|e| PoolError::Dial(e.to_string()))?;
        self.consecutive_failures.store(0, Ordering::SeqCst);
        Ok(dialed)
    }

    fn note_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Launch one background refill, bounded by the worker caps: refills
    /// queue up to `size` workers, anything past `2×size` is dropped.
    fn spawn_refill(self: &Arc<Self>) {
        let running = self.refillers.fetch_add(1, Ordering::SeqCst) + 1;
        if running > self.opts.size * 2 {
            self.refillers.fetch_sub(1, Ordering::SeqCst);
            warn!("pool: refill dropped, {running} workers already running");
            return;
        }
        if running > self.opts.size {
            debug!("pool: refill workers above soft cap ({running})");
        }

        let inner = self.clone();
        tokio::spawn(async move {
            inner.refill().await;
            inner.refillers.fetch_sub(1, Ordering::SeqCst);
        });
    }

    async fn refill(&self) {
        for attempt in 1..=REFILL_ATTEMPTS {
            let failures = self.consecutive_failures.load(Ordering::SeqCst);
            if failures > self.opts.fail_ceiling {
                warn!(
                    "pool: refill refused, {failures} consecutive failures (ceiling {})",
                    self.opts.fail_ceiling
                );
                return;
            }

            match self.dial().await {
                Ok(session) => {
                    self.push_ready(session).await;
                    debug!("pool: refill succeeded on attempt {attempt}");
                    return;
                }
                Err(e) => {
                    let failures = self.note_failure();
                    let delay = backoff_delay(failures);
                    warn!(
                        "pool: refill dial failed (attempt {attempt}, streak {failures}): {e}; \
                         backing off {delay:?}"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

/// Jittered exponential backoff capped at [`MAX_BACKOFF`], driven by the
/// process-wide failure streak.
fn backoff_delay(streak: u32) -> Duration {
    let exp = streak.saturating_sub(1).min(5);
    let base = Duration::from_millis(500 * (1u64 << exp));
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    base.mul_f64(jitter).min(MAX_BACKOFF)
}

/// Transient borrow of a session from the pool.
///
/// Exactly one `acquire…release` bracket: `release` consumes the lease and
/// either returns the session to the queue or, when marked broken, closes
/// it and enqueues exactly one refill.
pub struct Lease {
    inner: Arc<PoolInner>,
    session: Option<Session>,
    broken: std::sync::atomic::AtomicBool,
}

impl Lease {
    pub fn session(&self) -> &Session {
        self.session.as_ref().expect("lease already released")
    }

    /// Flag the session as broken; it will never be re-queued.
    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// End the lease.
    pub async fn release(mut self) {
        let session = self.session.take().expect("lease already released");
        self.inner.leased.fetch_sub(1, Ordering::SeqCst);
        if self.broken.load(Ordering::SeqCst) {
            debug!("pool: releasing broken session, scheduling refill");
            session.close().await;
            self.inner.spawn_refill();
        } else {
            self.inner.push_ready(session).await;
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        // Safety net for panicking request paths: the session is torn down
        // and a refill scheduled so the slot is not lost.
        if let Some(session) = self.session.take() {
            self.inner.leased.fetch_sub(1, Ordering::SeqCst);
            let inner = self.inner.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    session.close().await;
                    inner.spawn_refill();
                });
            }
        }
    }
}
