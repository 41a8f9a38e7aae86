use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use wpdemo::app::Services;
use wpdemo::config::Config;
use wpdemo::db::Database;
use wpdemo::docker::{DockerGateway, SharedGateway};
use wpdemo::golden::BuildOutcome;
use wpdemo::{PKG_NAME, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wpdemo=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let store_path = Path::new(&config.store.path);
    if let Some(dir) = store_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create store directory '{}'", dir.display()))?;
    }
    let db = Database::open(store_path)?;
    info!(path = %store_path.display(), "Store opened");

    let gateway: SharedGateway = Arc::new(DockerGateway::connect(config.docker.host.as_deref()).await?);
    gateway
        .ensure_network(&config.docker.network)
        .await
        .with_context(|| format!("Failed to ensure network '{}'", config.docker.network))?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let services = Services::new(gateway, db, &config, shutdown_rx.clone());

    // Golden image first, then the pool that is cloned from it
    let build = services.golden.clone().spawn();
    let pool = services.pool.clone();
    tokio::spawn(async move {
        match build.await {
            Ok(Ok(BuildOutcome::Skipped)) => {
                warn!("Golden image build skipped, pool fill will wait for the image");
            }
            Ok(Ok(_)) => {
                if let Err(e) = pool.ensure_minimum() {
                    error!(error = %e, "Failed to start pool fill");
                }
            }
            Ok(Err(_)) => {}
            Err(e) => error!(error = %e, "Golden image task panicked"),
        }
    });

    let sweeper_handle = tokio::spawn(services.sweeper.clone().run(shutdown_rx.clone()));

    let api = services.api.clone();
    let bind_addr = config.server.bind_addr();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api.run(&bind_addr).await {
            error!(error = %e, "API server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown; probes and refills stop at their next poll
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(10), async {
        let _ = api_handle.await;
        let _ = sweeper_handle.await;
    })
    .await;

    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting demo site orchestrator");
    info!(
        bind = %config.server.bind_addr(),
        domain_suffix = %config.site.domain_suffix,
        network = %config.docker.network,
        mysql = %config.mysql.endpoint(),
        "Server configuration"
    );
    info!(
        golden_image = %config.golden.image_ref(),
        base_image = %config.golden.base_image,
        assets = ?config.golden.assets_dir,
        "Golden image settings"
    );
    info!(
        target_size = config.pool.target_size,
        min_size = config.pool.min_size,
        "Pool settings"
    );
    info!(
        retention_minutes = config.sweeper.retention_minutes,
        interval_secs = config.sweeper.interval_secs,
        orphan_grace_minutes = ?config.sweeper.orphan_grace_minutes,
        probe_timeout_policy = ?config.site.probe_timeout_policy,
        "Lifecycle settings"
    );
}
