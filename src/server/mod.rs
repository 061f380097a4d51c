//! Daemon wiring: builds the store, router, deriver, supervisor, bridges,
//! and listeners, and exposes an embedded server handle with clean
//! shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DaemonConfig;
use crate::dispatch::handle_connection;
use crate::github::{GithubClient, HttpGithubClient};
use crate::lifecycle::{Connector, LifecycleBridge, PeonPingConnector, WebhookConnector};
use crate::naming::{FallbackTitleProvider, HttpTitleProvider, TitleNamer, TitleProvider};
use crate::status::StatusDeriver;
use crate::store::{SqliteStore, StateStore};
use crate::supervisor::SessionSupervisor;
use crate::telemetry::{self, IngestState, TokenRegistry};

/// Shared daemon components handed to every connection.
pub struct Daemon {
    /// Resolved configuration.
    pub config: DaemonConfig,

    /// Single-writer state facade.
    pub state: Arc<StateStore>,

    /// Live session registry.
    pub supervisor: Arc<SessionSupervisor>,

    /// Status projection engine.
    pub deriver: Arc<StatusDeriver>,

    /// Telemetry token registry.
    pub tokens: Arc<TokenRegistry>,

    /// Thread-title namer.
    pub namer: Arc<TitleNamer>,

    /// GitHub capability.
    pub github: Arc<dyn GithubClient>,
}

/// A running daemon instance.
pub struct ServerHandle {
    /// Bound stream-protocol address.
    pub local_addr: SocketAddr,

    /// Bound telemetry ingest address.
    pub telemetry_addr: SocketAddr,

    /// Shared components (useful for embedded callers and tests).
    pub daemon: Arc<Daemon>,

    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
    telemetry_task: JoinHandle<()>,
    bridge_tasks: Vec<JoinHandle<()>>,
    _lock_file: Option<std::fs::File>,
}

impl ServerHandle {
    /// Stop both listeners and terminate every live session. Subsequent
    /// connects to either port fail.
    pub async fn shutdown(self) {
        tracing::info!("Daemon shutting down");
        self.cancel.cancel();
        self.accept_task.abort();
        self.daemon.supervisor.shutdown().await;

        let _ = tokio::time::timeout(Duration::from_secs(5), self.telemetry_task).await;
        for task in self.bridge_tasks {
            task.abort();
        }
    }

    /// Wait until shutdown is requested externally (ctrl-c path).
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

/// The daemon server.
pub struct Server;

impl Server {
    /// Bind both listeners and start accepting. Returns a handle the
    /// caller shuts down explicitly; dropping the handle leaves the
    /// daemon running until process exit.
    ///
    /// # Errors
    ///
    /// Returns an error on port conflicts, an unreadable store, or a
    /// second instance holding the daemon lock.
    pub async fn bind(config: DaemonConfig) -> anyhow::Result<ServerHandle> {
        let cancel = CancellationToken::new();

        // One daemon per store: hold an advisory lock next to the db.
        let lock_file = acquire_daemon_lock(&config)?;

        let store = Arc::new(SqliteStore::new(&config.db_path).await?);
        let router = Arc::new(crate::router::SubscriptionRouter::new());
        let state = Arc::new(StateStore::new(store, router, config.scope.clone()));
        let deriver = Arc::new(StatusDeriver::new(
            Arc::clone(&state),
            config.verbose_telemetry,
        ));
        let tokens = Arc::new(TokenRegistry::new());

        // Telemetry ingest first: the supervisor needs the advertised
        // base URL for codex exporter args.
        let ingest_state = IngestState {
            tokens: Arc::clone(&tokens),
            deriver: Arc::clone(&deriver),
        };
        let (telemetry_addr, telemetry_task) =
            telemetry::serve(ingest_state, config.telemetry_addr, cancel.clone()).await?;

        let supervisor = Arc::new(SessionSupervisor::new(
            Arc::clone(&state),
            Arc::clone(&deriver),
            Arc::clone(&tokens),
            telemetry::base_url(telemetry_addr),
            config.launch_mode,
            config.notify_dir.clone(),
        ));

        let provider: Arc<dyn TitleProvider> = match &config.title_provider_url {
            Some(url) => Arc::new(HttpTitleProvider::new(url.clone())),
            None => Arc::new(FallbackTitleProvider),
        };
        let namer = Arc::new(TitleNamer::new(provider, Arc::clone(&state)));
        let namer_task = TitleNamer::spawn(
            Arc::clone(&namer),
            state.router().register_tap(),
            cancel.clone(),
        );

        let timeout = Duration::from_millis(config.connector_timeout_ms);
        let mut connectors: Vec<Arc<dyn Connector>> = Vec::new();
        for (i, url) in config.webhook_urls.iter().enumerate() {
            connectors.push(Arc::new(WebhookConnector::new(
                format!("webhook-{i}"),
                url.clone(),
                timeout,
            )));
        }
        if let Some(url) = &config.peon_ping_url {
            connectors.push(Arc::new(PeonPingConnector::new(url.clone(), timeout)));
        }
        let bridge = Arc::new(LifecycleBridge::new(connectors));
        let bridge_task = LifecycleBridge::spawn(
            Arc::clone(&bridge),
            state.router().register_tap(),
            cancel.clone(),
        );

        let daemon = Arc::new(Daemon {
            config,
            state,
            supervisor,
            deriver,
            tokens,
            namer,
            github: Arc::new(HttpGithubClient::from_env()),
        });

        let listener = tokio::net::TcpListener::bind(daemon.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "Stream protocol listening");

        let accept_task = {
            let daemon = Arc::clone(&daemon);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        accepted = listener.accept() => {
                            match accepted {
                                Ok((stream, addr)) => {
                                    tracing::debug!(peer = %addr, "Connection accepted");
                                    let daemon = Arc::clone(&daemon);
                                    tokio::spawn(async move {
                                        if let Err(e) = handle_connection(stream, daemon).await {
                                            tracing::error!(error = %e, "Connection error");
                                        }
                                    });
                                }
                                Err(e) => {
                                    tracing::error!(error = %e, "Accept error");
                                }
                            }
                        }
                        () = cancel.cancelled() => break,
                    }
                }
            })
        };

        Ok(ServerHandle {
            local_addr,
            telemetry_addr,
            daemon,
            cancel,
            accept_task,
            telemetry_task,
            bridge_tasks: vec![namer_task, bridge_task],
            _lock_file: lock_file,
        })
    }

    /// Bind and run until ctrl-c.
    ///
    /// # Errors
    ///
    /// Returns an error on fatal startup failure (the binary exits 1).
    pub async fn run(config: DaemonConfig) -> anyhow::Result<()> {
        let handle = Self::bind(config).await?;
        tracing::info!(
            stream = %handle.local_addr,
            telemetry = %handle.telemetry_addr,
            "Daemon ready"
        );

        tokio::signal::ctrl_c().await?;
        handle.shutdown().await;
        Ok(())
    }
}

fn acquire_daemon_lock(config: &DaemonConfig) -> anyhow::Result<Option<std::fs::File>> {
    let Some(parent) = config.db_path.parent() else {
        return Ok(None);
    };
    std::fs::create_dir_all(parent)?;
    let lock_path = parent.join("switchboard.lock");
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    file.try_lock_exclusive().map_err(|_| {
        anyhow::anyhow!(
            "another daemon instance holds {}; is switchboard already running?",
            lock_path.display()
        )
    })?;
    Ok(Some(file))
}
