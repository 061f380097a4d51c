use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use switchboard::config::DaemonConfig;
use switchboard::server::Server;

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(version)]
#[command(about = "Control-plane daemon for interactive coding agents")]
#[command(long_about = "\
switchboard multiplexes interactive coding agents (codex, claude, cursor,
plain shells) over PTYs and exposes a line-delimited JSON stream protocol.

Clients connect over TCP to issue commands, inject input, and subscribe to
event fan-outs. The daemon owns PTY lifecycles, persists conversation,
repository, and task state, ingests OTLP telemetry and provider hook
notifications, and derives a per-session runtime status.")]
#[command(after_long_help = "\
ENVIRONMENT VARIABLES:
    RUST_LOG                        Log level filter (default: switchboard=info)
    SWITCHBOARD_LISTEN_ADDR         Stream protocol bind address
    SWITCHBOARD_TELEMETRY_ADDR      OTLP ingest bind address
    SWITCHBOARD_DB_PATH             SQLite store path
    SWITCHBOARD_AUTH_TOKEN          Shared connection token
    SWITCHBOARD_VERBOSE_TELEMETRY   Forward verbose codex SSE deltas
    HARNESS_TENANT_ID               Tenant scope id
    HARNESS_USER_ID                 User scope id
    HARNESS_WORKSPACE_ID            Workspace scope id
    GITHUB_TOKEN                    GitHub API token for PR commands
    XDG_CONFIG_HOME                 Config file root

FILE LOCATIONS:
    ~/.switchboard/                 Base directory for daemon data
    ~/.switchboard/state.sqlite3    Durable entity store
    ~/.switchboard/notify/          Per-session hook notify files
    $XDG_CONFIG_HOME/switchboard/config.toml
                                    Optional configuration file")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground.
    Daemon {
        /// Stream protocol bind address, e.g. 127.0.0.1:7433.
        #[arg(long)]
        listen: Option<std::net::SocketAddr>,

        /// Telemetry ingest bind address, e.g. 127.0.0.1:4318.
        #[arg(long)]
        telemetry: Option<std::net::SocketAddr>,

        /// SQLite store path.
        #[arg(long)]
        db: Option<PathBuf>,

        /// Configuration file path.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Shared auth token clients must present.
        #[arg(long)]
        token: Option<String>,

        /// Forward verbose codex SSE deltas into the fan-out.
        #[arg(long)]
        verbose_telemetry: bool,

        /// Write logs to this file instead of stderr.
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
}

fn init_tracing(log_file: Option<&PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("switchboard=info"));

    match log_file {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .map_or_else(|| "switchboard.log".to_string(), |f| f.to_string_lossy().to_string());
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_filter(filter),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(filter),
                )
                .init();
            None
        }
    }
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            listen,
            telemetry,
            db,
            config,
            token,
            verbose_telemetry,
            log_file,
        } => {
            let _guard = init_tracing(log_file.as_ref());

            let mut daemon_config = match DaemonConfig::load(config.as_deref()) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("switchboard: {e}");
                    std::process::exit(1);
                }
            };
            if let Some(listen) = listen {
                daemon_config.listen_addr = listen;
            }
            if let Some(telemetry) = telemetry {
                daemon_config.telemetry_addr = telemetry;
            }
            if let Some(db) = db {
                daemon_config.db_path = db;
            }
            if let Some(token) = token {
                daemon_config.auth_token = Some(token);
            }
            if verbose_telemetry {
                daemon_config.verbose_telemetry = true;
            }

            let runtime = match tokio::runtime::Runtime::new() {
                Ok(runtime) => runtime,
                Err(e) => {
                    eprintln!("switchboard: failed to start runtime: {e}");
                    std::process::exit(1);
                }
            };
            if let Err(e) = runtime.block_on(Server::run(daemon_config)) {
                tracing::error!(error = %e, "Fatal daemon error");
                eprintln!("switchboard: {e}");
                std::process::exit(1);
            }
        }
    }
}
