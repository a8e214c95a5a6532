//! Scripted terminal-channel mocks and app assembly for integration tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use tempfile::TempDir;

use qproxy::api::routes::create_router;
use qproxy::api::state::AppState;
use qproxy::orchestrator::Orchestrator;
use qproxy::pool::{PoolOptions, SessionPool};
use qproxy::prompt::PromptBuilder;
use qproxy::session::SessionOptions;
use qproxy::store::{ConvStore, SopMap};
use qproxy::term::{ChatClient, ClientError, Connector};

/// A scripted response for one `ask` on one mock client.
pub type Script = Arc<dyn Fn(u32, &str) -> Result<String, ClientError> + Send + Sync>;

/// Shared observation point for everything the mocks see.
#[derive(Default)]
pub struct MockLog {
    /// Every line written to any client, in order.
    pub commands: Mutex<Vec<String>>,
    /// Concurrent `ask`s right now and the high-water mark.
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub dials: AtomicU32,
}

impl MockLog {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

pub struct MockClient {
    id: u32,
    log: Arc<MockLog>,
    script: Script,
    closed: AtomicBool,
    /// Latency added to non-command asks, to make saturation observable.
    ask_delay: Duration,
}

#[async_trait]
impl ChatClient for MockClient {
    async fn ask(&self, prompt: &str, _idle: Duration) -> Result<String, ClientError> {
        if prompt.trim().is_empty() {
            return Err(ClientError::EmptyPrompt);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Connection("client closed".to_string()));
        }
        self.log.commands.lock().unwrap().push(prompt.to_string());

        if !prompt.starts_with('/') && !self.ask_delay.is_zero() {
            let now = self.log.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.log.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.ask_delay).await;
            self.log.in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        (self.script)(self.id, prompt)
    }

    async fn ping(&self) -> Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ClientError::Connection("client closed".to_string()))
        } else {
            Ok(())
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MockConnector {
    pub log: Arc<MockLog>,
    script: Script,
    /// The first N dials fail with a connection error.
    pub fail_dials: AtomicU32,
    ask_delay: Duration,
}

impl MockConnector {
    pub fn new(script: Script) -> Self {
        Self {
            log: Arc::new(MockLog::default()),
            script,
            fail_dials: AtomicU32::new(0),
            ask_delay: Duration::ZERO,
        }
    }

    pub fn with_ask_delay(mut self, delay: Duration) -> Self {
        self.ask_delay = delay;
        self
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn ChatClient>, ClientError> {
        let id = self.log.dials.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_dials.load(Ordering::SeqCst) >= id {
            return Err(ClientError::Connection("dial refused".to_string()));
        }
        Ok(Box::new(MockClient {
            id,
            log: self.log.clone(),
            script: self.script.clone(),
            closed: AtomicBool::new(false),
            ask_delay: self.ask_delay,
        }))
    }
}

/// Script answering every management command with a bare prompt and every
/// real ask with `answer` (echo + answer + fresh prompt, like a live REPL).
pub fn echoing_script(answer: &'static str) -> Script {
    Arc::new(move |_id, prompt| {
        if prompt.starts_with('/') {
            Ok("> ".to_string())
        } else {
            Ok(format!("{prompt}\n{answer}\n> "))
        }
    })
}

pub struct TestApp {
    pub router: Router,
    pub log: Arc<MockLog>,
    pub dir: TempDir,
    pub pool: SessionPool,
}

/// Assemble the full application over a mock connector, stores in a
/// tempdir, pool of `size`.
pub async fn test_app(connector: MockConnector, size: usize) -> TestApp {
    let log = connector.log.clone();
    let dir = TempDir::new().unwrap();
    let conv_root = dir.path().join("conversations");

    let pool = SessionPool::new(
        Arc::new(connector),
        PoolOptions {
            size,
            dial_timeout: Duration::from_secs(2),
            fail_ceiling: 20,
            session: SessionOptions::default(),
        },
    );
    let conv = Arc::new(ConvStore::new(&conv_root).await.unwrap());
    let sopmap = Arc::new(SopMap::load(conv_root.join("_sopmap.json")).await.unwrap());
    let orchestrator = Orchestrator::new(pool.clone(), sopmap, conv);
    let builder = PromptBuilder::new(
        dir.path().join("no-sop").as_path(),
        false,
        dir.path().join("no-task-doc").as_path(),
        2048,
    );

    let router = create_router(AppState::new(orchestrator, pool.clone(), builder));
    TestApp {
        router,
        log,
        dir,
        pool,
    }
}

/// Poll until the pool reports at least `n` ready sessions.
pub async fn wait_ready(pool: &SessionPool, n: usize) {
    for _ in 0..200 {
        if pool.stats().0 >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pool never reached {n} ready sessions");
}
