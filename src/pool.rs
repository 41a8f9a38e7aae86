//! Pre-provisioned sites
//!
//! Ready sites wait in the pool partition of the store. Allocation moves the
//! oldest one into the sites partition in a single transaction, so two
//! concurrent requests never receive the same site. When the pool runs low a
//! background refill tops it back up to the target size; only one refill runs
//! at a time.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::db::{Database, Partition};
use crate::error::{SiteError, SiteResult};
use crate::orchestrator::{describe, SiteOrchestrator};
use crate::site::SiteDescriptor;
use crate::tasks::{TaskKind, TaskRegistry};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PoolStatus {
    pub enabled: bool,
    pub available: usize,
    pub target_size: usize,
    pub min_size: usize,
    pub refilling: bool,
}

pub struct SitePool {
    orchestrator: Arc<SiteOrchestrator>,
    db: Arc<Database>,
    tasks: Arc<TaskRegistry>,
    config: PoolConfig,
    shutdown: Option<watch::Receiver<bool>>,
}

impl SitePool {
    pub fn new(
        orchestrator: Arc<SiteOrchestrator>,
        db: Arc<Database>,
        tasks: Arc<TaskRegistry>,
        config: PoolConfig,
    ) -> Self {
        Self {
            orchestrator,
            db,
            tasks,
            config,
            shutdown: None,
        }
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Hand out a pooled site, or provision one directly when the pool is empty
    pub async fn allocate(self: &Arc<Self>, username: Option<&str>) -> SiteResult<SiteDescriptor> {
        if !self.config.enabled() {
            return self.orchestrator.create_site(username).await;
        }

        match self.db.take_pool_entry(username, Utc::now())? {
            Some(site) => {
                info!(site_id = %site.site_id, username = ?username, "Allocated site from pool");
                self.refill_if_low();
                Ok(describe(&site, true))
            }
            None => {
                debug!("Pool empty, provisioning directly");
                self.trigger_refill();
                self.orchestrator.create_site(username).await
            }
        }
    }

    fn refill_if_low(self: &Arc<Self>) {
        match self.db.pool_size() {
            Ok(available) if available < self.config.min_size => {
                debug!(available, min_size = self.config.min_size, "Pool below minimum");
                self.trigger_refill();
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to count pool entries"),
        }
    }

    /// Start a background refill unless one is already running
    pub fn trigger_refill(self: &Arc<Self>) -> bool {
        if !self.config.enabled() {
            return false;
        }
        let Some(guard) = self.tasks.try_start(TaskKind::PoolRefill) else {
            return false;
        };

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            match pool.refill().await {
                Ok(added) => {
                    info!(added, "Pool refill finished");
                    guard.succeed();
                }
                Err(e) => {
                    error!(error = %e, "Pool refill failed");
                    guard.fail(e);
                }
            }
        });
        true
    }

    /// Provision pool sites until the target size is reached
    ///
    /// Stops at the first failure; the next trigger picks up from there.
    pub async fn refill(&self) -> SiteResult<usize> {
        let mut added = 0;

        loop {
            if self.shutdown.as_ref().map(|rx| *rx.borrow()).unwrap_or(false) {
                return Err(SiteError::Cancelled);
            }

            let available = self.db.pool_size()?;
            if available >= self.config.target_size {
                return Ok(added);
            }

            debug!(available, target = self.config.target_size, "Adding pool site");
            self.orchestrator.provision(Partition::Pool, None).await?;
            added += 1;
        }
    }

    /// Top the pool up at startup
    pub fn ensure_minimum(self: &Arc<Self>) -> SiteResult<bool> {
        if !self.config.enabled() {
            return Ok(false);
        }
        let available = self.db.pool_size()?;
        if available >= self.config.target_size {
            return Ok(false);
        }
        info!(available, target = self.config.target_size, "Filling site pool");
        Ok(self.trigger_refill())
    }

    pub fn status(&self) -> SiteResult<PoolStatus> {
        Ok(PoolStatus {
            enabled: self.config.enabled(),
            available: self.db.pool_size()?,
            target_size: self.config.target_size,
            min_size: self.config.min_size,
            refilling: self.tasks.is_running(TaskKind::PoolRefill),
        })
    }
}
