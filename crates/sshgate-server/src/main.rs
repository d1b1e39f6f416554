//! sshgate: SSH gateway session runner.
//!
//! Builds the backend registry from configuration and drives sessions on the
//! configured backend. The `run` subcommand stands in for the SSH front end:
//! it authenticates a local user record and relays this terminal's stdio.

mod backends;
mod config;
mod handler;
mod pump;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::ServerConfig;
use handler::{generate_connection_id, ConnectionHandler, GatewayMetrics};
use sshgate_core::{
    ConnectionAuthenticatedMetadata, ConnectionMetadata, DummyLookup, MetricsCollector,
    RemoteAddress,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// sshgate: SSH gateway backend runner
#[derive(Parser, Debug)]
#[command(name = "sshgate", version, about = "SSH gateway backend runner")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.sshgate/config.toml")]
    config: String,

    /// Backend to use (overrides the config file)
    #[arg(long)]
    backend: Option<String>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Shell for the local backend
    #[arg(long)]
    shell: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered backends in registration order
    Backends,
    /// Open a session as USER and attach this terminal to it
    Run {
        /// Authenticated username
        #[arg(long)]
        user: String,
        /// Request a pseudoterminal
        #[arg(long)]
        pty: bool,
        /// Launch a subsystem instead of the shell
        #[arg(long)]
        subsystem: Option<String>,
    },
    /// List the gateway metrics with their type and help text
    Metrics,
    /// Print USER's connection record, after config overrides, as JSON
    Inspect {
        #[arg(long)]
        user: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so they never mix with relayed program output.
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!(error = %format!("{e:#}"), "sshgate failed");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config_path = PathBuf::from(&cli.config);
    let server_config = ServerConfig::load(
        Some(&config_path),
        cli.backend.as_deref(),
        cli.max_sessions,
        cli.shell.as_deref(),
    )
    .context("failed to load config")?;

    match cli.command {
        Command::Backends => {
            let registry = backends::build_registry(&server_config);
            for name in registry.backends() {
                println!("{name}");
            }
            Ok(0)
        }
        Command::Metrics => {
            let collector = MetricsCollector::new(Arc::new(DummyLookup));
            GatewayMetrics::register(&collector)?;
            for name in collector.metric_names() {
                let kind = collector.metric_type(&name).map(|k| k.to_string());
                let help = collector.help(&name).unwrap_or_default();
                println!("{name}\t{}\t{help}", kind.unwrap_or_default());
            }
            Ok(0)
        }
        Command::Inspect { user } => {
            let mut meta = local_connection(&user)?;
            meta.merge(server_config.overrides());
            println!("{}", serde_json::to_string_pretty(&meta)?);
            Ok(0)
        }
        Command::Run {
            user,
            pty,
            subsystem,
        } => run_session(server_config, &user, pty, subsystem.as_deref()).await,
    }
}

/// A loopback connection record that authenticated as `user`.
fn local_connection(user: &str) -> anyhow::Result<ConnectionAuthenticatedMetadata> {
    let remote: RemoteAddress = "127.0.0.1:0".parse()?;
    Ok(ConnectionMetadata::new(remote, generate_connection_id())
        .start_authentication(concat!("SSH-2.0-sshgate_", env!("CARGO_PKG_VERSION")), user)
        .authenticated(user))
}

async fn run_session(
    server_config: ServerConfig,
    user: &str,
    pty: bool,
    subsystem: Option<&str>,
) -> anyhow::Result<i32> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = %server_config.backend,
        user,
        "starting sshgate session"
    );

    let registry = Arc::new(backends::build_registry(&server_config));
    let collector = MetricsCollector::new(Arc::new(DummyLookup));
    let metrics = GatewayMetrics::register(&collector)?;
    let handler = ConnectionHandler::new(registry, Arc::new(server_config), metrics);

    let meta = local_connection(user)?;
    let mut session = handler.open_session(meta).context("failed to open session")?;
    if pty {
        session.request_pty()?;
    }
    let streams = session.launch(subsystem)?;

    let relay = pump::pump(streams, std::io::stdin(), std::io::stdout(), std::io::stderr());
    tokio::pin!(relay);
    let stats = loop {
        tokio::select! {
            result = &mut relay => break result?,
            _ = tokio::signal::ctrl_c() => {
                info!("forwarding interrupt to session");
                session.handle_signal("INT")?;
            }
        }
    };

    let code = session.finish();
    info!(
        exit_code = code,
        stdout_bytes = stats.stdout,
        stderr_bytes = stats.stderr,
        "session finished"
    );
    eprintln!("exit code: {code}");
    Ok(code)
}
