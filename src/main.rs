use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, info};

use qproxy::api::routes::create_router;
use qproxy::api::state::AppState;
use qproxy::config::{AppConfig, ChatMode};
use qproxy::observability;
use qproxy::orchestrator::Orchestrator;
use qproxy::pool::SessionPool;
use qproxy::prompt::PromptBuilder;
use qproxy::store::{ConvStore, SopMap};
use qproxy::term::pty::PtyConnector;
use qproxy::term::ws::WsConnector;
use qproxy::term::Connector;

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common);

    let config = AppConfig::load(cli.common.config.as_deref())?;
    match cli.command {
        Command::Serve(cmd) => serve(config, cmd),
        Command::Config => {
            println!("{config:#?}");
            Ok(())
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "incident-worker",
    version,
    about = "Incident-analysis worker multiplexing requests onto pooled Q CLI sessions",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP worker
    Serve(ServeCommand),
    /// Print the effective configuration
    Config,
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Override the bind address from the config
    #[arg(long, value_name = "ADDR")]
    addr: Option<String>,
}

fn effective_log_level(common: &CommonOpts) -> LevelFilter {
    if common.quiet {
        LevelFilter::Error
    } else {
        match common.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

fn init_logging(common: &CommonOpts) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let level = match effective_log_level(common) {
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("qproxy={level},tower_http={level}")));

    let disable_color = std::env::var_os("NO_COLOR").is_some() || !io::stderr().is_terminal();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_ansi(!disable_color))
        .try_init()
        .ok();

    // Bridge for modules using the log crate macros.
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    builder.filter_level(effective_log_level(common));
    builder.try_init().ok();
}

#[tokio::main]
async fn serve(config: AppConfig, cmd: ServeCommand) -> Result<()> {
    let connector: Arc<dyn Connector> = match config.chat.mode {
        ChatMode::Ws => Arc::new(WsConnector::new(config.dial_options())),
        ChatMode::Exec => Arc::new(PtyConnector::new(config.dial_options())),
    };

    let pool = SessionPool::new(connector, config.pool_options());
    let conv = Arc::new(
        ConvStore::new(&config.store.conv_root)
            .await
            .context("convstore init failed")?,
    );
    let sopmap = Arc::new(
        SopMap::load(config.sopmap_path())
            .await
            .context("sopmap load failed")?,
    );
    let orchestrator = Orchestrator::new(pool.clone(), sopmap, conv);

    let prompt_builder = PromptBuilder::new(
        Path::new(&config.sop.dir),
        config.sop.enabled,
        Path::new(&config.prompt.task_doc_path),
        config.prompt.task_doc_budget,
    );

    if config.diag.memlog_period_secs > 0 {
        observability::spawn_memlog(
            pool.clone(),
            Duration::from_secs(config.diag.memlog_period_secs),
        );
    }
    if config.diag.enabled {
        observability::spawn_diag_server(config.diag.addr.clone()).await?;
    }

    let state = AppState::new(orchestrator, pool, prompt_builder);
    let app = create_router(state);

    let addr = cmd.addr.unwrap_or_else(|| config.http.addr.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(
        "incident-worker listening on {addr} (mode={:?} endpoint={} pool={})",
        config.chat.mode, config.chat.endpoint, config.pool.size
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http serve")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
