//! Configuration: optional TOML file merged with `QPROXY`-prefixed
//! environment variables (`__` separates nested keys, e.g.
//! `QPROXY_POOL__SIZE=4`), defaults set in the builder.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::pool::PoolOptions;
use crate::session::SessionOptions;
use crate::term::{DialOptions, WakeMode};

const ENV_PREFIX: &str = "QPROXY";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub pool: PoolConfig,
    pub chat: ChatConfig,
    pub store: StoreConfig,
    pub sop: SopConfig,
    pub prompt: PromptConfig,
    pub diag: DiagConfig,
    /// Substrings filtered out of scrubbed responses.
    #[serde(default)]
    pub scrub_filters: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    pub size: usize,
    pub fail_ceiling: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    /// Terminal-over-HTTP gateway.
    Ws,
    /// Assistant binary behind a pseudo-terminal.
    Exec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    pub mode: ChatMode,
    pub endpoint: String,
    pub bin: String,
    pub wake: String,
    pub idle_secs: u64,
    pub handshake_secs: u64,
    pub connect_secs: u64,
    pub columns: u16,
    pub rows: u16,
    pub insecure_tls: bool,
    pub username: String,
    pub password: String,
    pub auth_header_name: String,
    pub auth_header_val: String,
    pub token_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub conv_root: String,
    /// Defaults to `<conv_root>/_sopmap.json` when unset.
    #[serde(default)]
    pub sopmap_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SopConfig {
    pub dir: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptConfig {
    pub task_doc_budget: usize,
    pub task_doc_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiagConfig {
    pub enabled: bool,
    pub addr: String,
    pub memlog_period_secs: u64,
}

impl AppConfig {
    /// Load from `config_file` (when present) and the environment.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("http.addr", "0.0.0.0:8080")?
            .set_default("pool.size", 2_i64)?
            .set_default("pool.fail_ceiling", 20_i64)?
            .set_default("chat.mode", "ws")?
            .set_default("chat.endpoint", "ws://127.0.0.1:7682/ws")?
            .set_default("chat.bin", "q")?
            .set_default("chat.wake", "newline")?
            .set_default("chat.idle_secs", 120_i64)?
            .set_default("chat.handshake_secs", 30_i64)?
            .set_default("chat.connect_secs", 10_i64)?
            .set_default("chat.columns", 120_i64)?
            .set_default("chat.rows", 30_i64)?
            .set_default("chat.insecure_tls", false)?
            .set_default("chat.username", "")?
            .set_default("chat.password", "")?
            .set_default("chat.auth_header_name", "")?
            .set_default("chat.auth_header_val", "")?
            .set_default("chat.token_url", "")?
            .set_default("store.conv_root", "/tmp/conversations")?
            .set_default("sop.dir", "./ctx/sop")?
            .set_default("sop.enabled", true)?
            .set_default("prompt.task_doc_budget", 2048_i64)?
            .set_default("prompt.task_doc_path", "./ctx/task_instructions.md")?
            .set_default("diag.enabled", false)?
            .set_default("diag.addr", "127.0.0.1:6060")?
            .set_default("diag.memlog_period_secs", 0_i64)?;

        if let Some(path) = config_file {
            builder = builder.add_source(
                File::from(path).format(FileFormat::Toml).required(false),
            );
        }

        let built = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .context("building configuration")?;
        built.try_deserialize().context("deserializing configuration")
    }

    /// No credentials configured means no-auth mode, matching how the
    /// gateway is usually deployed behind a trusted network.
    pub fn no_auth(&self) -> bool {
        self.chat.username.is_empty() && self.chat.auth_header_name.is_empty()
    }

    pub fn dial_options(&self) -> DialOptions {
        DialOptions {
            endpoint: self.chat.endpoint.clone(),
            bin: self.chat.bin.clone(),
            username: self.chat.username.clone(),
            password: self.chat.password.clone(),
            auth_header_name: self.chat.auth_header_name.clone(),
            auth_header_val: self.chat.auth_header_val.clone(),
            token_url: self.chat.token_url.clone(),
            no_auth: self.no_auth(),
            handshake_timeout: Duration::from_secs(self.chat.handshake_secs),
            connect_timeout: Duration::from_secs(self.chat.connect_secs),
            idle_timeout: Duration::from_secs(self.chat.idle_secs),
            columns: self.chat.columns,
            rows: self.chat.rows,
            insecure_tls: self.chat.insecure_tls,
            wake: WakeMode::parse(&self.chat.wake),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            idle_timeout: Duration::from_secs(self.chat.idle_secs),
            scrub_filters: self.scrub_filters.clone(),
        }
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            size: self.pool.size,
            dial_timeout: Duration::from_secs(self.chat.handshake_secs),
            fail_ceiling: self.pool.fail_ceiling,
            session: self.session_options(),
        }
    }

    pub fn sopmap_path(&self) -> PathBuf {
        match &self.store.sopmap_path {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => Path::new(&self.store.conv_root).join("_sopmap.json"),
        }
    }
}
