//! Bounded polling for readiness
//!
//! Every wait here has a fixed number of attempts and a fixed interval, and
//! stops early when the shutdown channel flips to true.

use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::ProbeConfig;
use crate::docker::{ExecCommand, SharedGateway};
use crate::error::{SiteError, SiteResult};

/// Sleep for `interval`, returning early with [`SiteError::Cancelled`] on shutdown
pub async fn pause(interval: Duration, shutdown: Option<&mut watch::Receiver<bool>>) -> SiteResult<()> {
    let Some(rx) = shutdown else {
        tokio::time::sleep(interval).await;
        return Ok(());
    };

    if *rx.borrow() {
        return Err(SiteError::Cancelled);
    }

    tokio::select! {
        _ = tokio::time::sleep(interval) => Ok(()),
        changed = rx.changed() => {
            if changed.is_err() {
                // sender gone, nobody can cancel us any more
                tokio::time::sleep(interval).await;
                return Ok(());
            }
            if *rx.borrow() {
                Err(SiteError::Cancelled)
            } else {
                Ok(())
            }
        }
    }
}

/// Signal that WordPress has finished installing
#[derive(Debug, Clone, PartialEq)]
pub enum InstallSignal {
    /// `wp core is-installed` exits 0
    WpCli { web_root: String },
    /// The guest writes this file once installed
    MarkerFile(String),
}

pub struct ReadinessProbe {
    gateway: SharedGateway,
    config: ProbeConfig,
    signal: InstallSignal,
    shutdown: Option<watch::Receiver<bool>>,
}

impl ReadinessProbe {
    pub fn new(gateway: SharedGateway, config: ProbeConfig, web_root: &str) -> Self {
        let signal = match &config.marker_file {
            Some(path) => InstallSignal::MarkerFile(path.clone()),
            None => InstallSignal::WpCli {
                web_root: web_root.to_string(),
            },
        };
        Self {
            gateway,
            config,
            signal,
            shutdown: None,
        }
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    async fn file_exists(&self, container: &str, path: &str) -> SiteResult<bool> {
        let script = format!("test -f {}", shell_words::quote(path));
        self.passes(container, ExecCommand::shell(script)).await
    }

    /// Run a check command; a runtime hiccup counts as a failed check unless
    /// the container is gone
    async fn passes(&self, container: &str, command: ExecCommand) -> SiteResult<bool> {
        match self.gateway.exec(container, &command).await {
            Ok(output) => Ok(output.success()),
            Err(e) if e.is_not_found() => Err(e.into()),
            Err(e) => {
                debug!(container, error = %e, "Readiness check errored");
                Ok(false)
            }
        }
    }

    /// One attempt: the config file and the install signal must both pass
    pub async fn check_once(&self, container: &str) -> SiteResult<bool> {
        if !self.file_exists(container, &self.config.config_file).await? {
            return Ok(false);
        }

        match &self.signal {
            InstallSignal::WpCli { web_root } => {
                let script = format!(
                    "wp core is-installed --allow-root --path={}",
                    shell_words::quote(web_root)
                );
                self.passes(container, ExecCommand::shell(script)).await
            }
            InstallSignal::MarkerFile(path) => self.file_exists(container, path).await,
        }
    }

    /// Poll until the site is installed or the attempt budget runs out
    pub async fn wait_for_ready(&self, container: &str) -> SiteResult<()> {
        let attempts = self.config.max_attempts;
        let mut shutdown = self.shutdown.clone();

        for attempt in 1..=attempts {
            if self.check_once(container).await? {
                info!(container, attempt, "Site is ready");
                return Ok(());
            }
            debug!(container, attempt, attempts, "Site not ready yet");
            if attempt < attempts {
                pause(self.config.interval(), shutdown.as_mut()).await?;
            }
        }

        Err(SiteError::ProbeTimeout {
            target: container.to_string(),
            attempts,
        })
    }

    /// Poll until the entrypoint has written the WordPress config file
    pub async fn wait_for_config(&self, container: &str) -> SiteResult<()> {
        self.wait_for_file(container, &self.config.config_file, self.config.max_attempts)
            .await
    }

    /// Poll until a file exists inside the container
    pub async fn wait_for_file(&self, container: &str, path: &str, attempts: u32) -> SiteResult<()> {
        let mut shutdown = self.shutdown.clone();

        for attempt in 1..=attempts {
            if self.file_exists(container, path).await? {
                debug!(container, path, attempt, "File present");
                return Ok(());
            }
            if attempt < attempts {
                pause(self.config.interval(), shutdown.as_mut()).await?;
            }
        }

        Err(SiteError::ProbeTimeout {
            target: format!("{} in {}", path, container),
            attempts,
        })
    }
}

/// HEAD the public URL until the proxy serves it (2xx, or the 302 WordPress
/// answers with before login)
pub async fn wait_for_https(
    url: &str,
    attempts: u32,
    interval: Duration,
    timeout: Duration,
    mut shutdown: Option<watch::Receiver<bool>>,
) -> SiteResult<()> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()?;

    for attempt in 1..=attempts {
        match client.head(url).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() || status == reqwest::StatusCode::FOUND {
                    info!(url, attempt, status = status.as_u16(), "HTTPS endpoint is serving");
                    return Ok(());
                }
                debug!(url, attempt, status = status.as_u16(), "HTTPS endpoint not ready");
            }
            Err(e) => debug!(url, attempt, error = %e, "HTTPS endpoint unreachable"),
        }
        if attempt < attempts {
            pause(interval, shutdown.as_mut()).await?;
        }
    }

    Err(SiteError::ProbeTimeout {
        target: url.to_string(),
        attempts,
    })
}
