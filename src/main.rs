use idlegate::activity::{ActivityKind, ActivityLog};
use idlegate::admin::{AdminServer, PKG_NAME, VERSION};
use idlegate::config::{Config, RuntimeSettings, SettingsStore};
use idlegate::lifecycle::{LifecycleController, LifecycleTimings};
use idlegate::pool::{ConnectionPool, PoolConfig};
use idlegate::probe::{HttpProbe, HttpQueueProbe, Prober, QueueCheck};
use idlegate::proxy::{BackendRoute, ProxyServer};
use idlegate::target;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("idlegate=info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("idlegate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let store = Arc::new(SettingsStore::from_config(&config)?);
    let backend = target::from_config(&config.target, store.shared());

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };
    let pool = Arc::new(ConnectionPool::new(pool_config));
    info!(
        max_idle = pool.config().max_idle_per_host,
        idle_timeout_secs = pool.config().idle_timeout.as_secs(),
        "Connection pool configured"
    );

    let authority = format!("{}:{}", config.target.host, config.target.port);
    let health = HttpProbe::new(
        Arc::clone(&pool),
        authority.clone(),
        config.target.health_path.clone(),
    );
    let prober = Prober::new(Arc::new(health), config.lifecycle.probe_interval());
    let queue = config.target.queue_path.as_ref().map(|path| {
        Arc::new(HttpQueueProbe::new(Arc::clone(&pool), authority.clone(), path.clone()))
            as Arc<dyn QueueCheck>
    });

    let activity = Arc::new(ActivityLog::new(config.server.activity_log_size));
    let controller = LifecycleController::new(
        backend,
        prober,
        queue,
        Arc::clone(&store),
        Arc::clone(&activity),
        LifecycleTimings {
            shutdown_grace_period: config.lifecycle.shutdown_grace_period(),
            drain_timeout: config.lifecycle.drain_timeout(),
        },
    );

    activity.record(
        ActivityKind::System,
        format!("{} {} started", PKG_NAME, VERSION),
    );
    controller.reconcile().await;

    let proxy_addr = parse_addr(&config.server.bind, config.server.port, "proxy")?;
    let proxy = ProxyServer::new(
        proxy_addr,
        Arc::clone(&controller),
        Arc::clone(&pool),
        BackendRoute {
            authority,
            strip_prefix: config.target.strip_prefix.clone(),
            request_timeout: config.lifecycle.request_timeout(),
        },
        shutdown_rx.clone(),
    );
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    let admin_addr = parse_addr(&config.server.admin_bind, config.server.admin_port, "admin")?;
    let admin_server = AdminServer::new(
        admin_addr,
        Arc::clone(&controller),
        shutdown_rx.clone(),
        config.server.admin_token.clone(),
    )
    .with_push_interval(Duration::from_millis(config.server.push_interval_ms));
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading configuration...");
                    reload(&controller, &config_path);
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    if config.server.stop_target_on_exit {
        info!("Stopping backend...");
        if let Err(e) = controller.shutdown().await {
            error!(error = %e, "Failed to stop backend");
        }
    } else {
        info!("Leaving backend running");
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        let _ = admin_handle.await;
    })
    .await;

    let stats = pool.stats();
    info!(
        requests = stats.get_total_requests(),
        probes = stats.get_probes(),
        "Connection pool statistics"
    );

    info!("Shutdown complete");
    Ok(())
}

/// Re-read the runtime settings from the config file. Listener and target
/// definitions only change on restart.
#[cfg(unix)]
fn reload(controller: &LifecycleController, path: &Path) {
    let config = match Config::load(path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to reload configuration");
            return;
        }
    };

    match controller.reload_settings(RuntimeSettings::from_config(&config)) {
        Ok(()) => {
            let settings = controller.settings();
            info!(
                idle_timeout_secs = settings.idle_timeout_secs,
                poll_interval_secs = settings.poll_interval_secs,
                auto_start = settings.auto_start_enabled,
                "Configuration reloaded successfully"
            );
        }
        Err(e) => warn!(error = %e, "Reloaded configuration rejected"),
    }
}

fn parse_addr(bind: &str, port: u16, what: &str) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port).parse::<SocketAddr>().map_err(|e| {
        error!(bind = %bind, port, error = %e, "Invalid {} bind address", what);
        anyhow::anyhow!("Invalid {} bind address: {}", what, e)
    })
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting idlegate");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_bind = %config.server.admin_bind,
        admin_port = config.server.admin_port,
        admin_auth = config.server.admin_token.is_some(),
        "Server configuration"
    );
    info!(
        target_type = ?config.target.target_type,
        target = %config.target.default_name(),
        backend = %config.target.base_url(),
        health_path = %config.target.health_path,
        queue_path = ?config.target.queue_path,
        "Backend target"
    );
    info!(
        idle_timeout_secs = config.lifecycle.idle_timeout_secs,
        poll_interval_secs = config.lifecycle.poll_interval_secs,
        startup_timeout_secs = config.lifecycle.startup_timeout_secs,
        auto_start = config.lifecycle.auto_start_enabled,
        "Lifecycle settings"
    );
    info!(
        shutdown_grace_period_secs = config.lifecycle.shutdown_grace_period_secs,
        drain_timeout_secs = config.lifecycle.drain_timeout_secs,
        request_timeout_secs = config.lifecycle.request_timeout_secs,
        "Shutdown settings"
    );
}
