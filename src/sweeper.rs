//! Reclamation of expired sites
//!
//! The store decides what is expired; container labels are only used to find
//! what exists. Every teardown step treats "already gone" as done, so a sweep
//! can be repeated without harm. Sweeps on one sweeper run one at a time.
//!
//! Ready pool entries never expire. Pool entries stuck in any other state are
//! reclaimed once past retention plus the orphan grace period.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::{Config, SweeperConfig};
use crate::db::{Database, Partition, SiteRecord};
use crate::docker::SharedGateway;
use crate::error::SiteResult;
use crate::labels::{self, LabelView};
use crate::mysql::DatabaseAdmin;
use crate::site::SiteStatus;

/// What to tear down for one site
#[derive(Debug, Clone, PartialEq)]
pub struct ReclaimTarget {
    /// Store row to mark and delete, if the site is tracked
    pub row: Option<(Partition, String)>,
    /// Container id or name
    pub container: Option<String>,
    /// Database and user to drop
    pub database: Option<(String, String)>,
}

impl ReclaimTarget {
    pub fn for_record(partition: Partition, site: &SiteRecord, fallback_container: &str) -> Self {
        ReclaimTarget {
            row: Some((partition, site.site_id.clone())),
            container: Some(
                site.container_id
                    .clone()
                    .unwrap_or_else(|| fallback_container.to_string()),
            ),
            database: Some((site.db_name.clone(), site.db_user.clone())),
        }
    }

    fn label(&self) -> String {
        match (&self.row, &self.container) {
            (Some((_, site_id)), _) => site_id.clone(),
            (None, Some(container)) => container.clone(),
            (None, None) => "<unknown>".to_string(),
        }
    }
}

/// Tears sites down; shared by the sweeper, explicit deletes and rollback
pub struct SiteReclaimer {
    gateway: SharedGateway,
    db: Arc<Database>,
    mysql: Arc<DatabaseAdmin>,
    stop_timeout: Duration,
}

impl SiteReclaimer {
    pub fn new(gateway: SharedGateway, db: Arc<Database>, mysql: Arc<DatabaseAdmin>, stop_timeout: Duration) -> Self {
        Self {
            gateway,
            db,
            mysql,
            stop_timeout,
        }
    }

    /// Remove the container with its volumes, drop the database, delete the row
    ///
    /// The row goes last so a failure part-way leaves it for the next sweep.
    pub async fn reclaim(&self, target: &ReclaimTarget) -> SiteResult<()> {
        let site = target.label();

        if let Some((partition, site_id)) = &target.row {
            self.db.set_status(*partition, site_id, SiteStatus::Reclaiming)?;
        }

        if let Some(container) = &target.container {
            let details = self.gateway.inspect_container(container).await?;
            let foreign = match (&details, &target.database) {
                (Some(details), Some((db_name, _))) => {
                    details.labels.get(labels::DB_NAME) != Some(db_name)
                }
                _ => false,
            };

            if foreign {
                warn!(site = %site, container = %container, "Container labelled for another database, left in place");
            } else if let Some(details) = details {
                if let Err(e) = self.gateway.stop_container(&details.id, self.stop_timeout).await {
                    warn!(site = %site, container = %container, error = %e, "Failed to stop container, removing anyway");
                }
                self.gateway.remove_container(&details.id).await?;

                for volume in &details.volumes {
                    if let Err(e) = self.gateway.remove_volume(volume).await {
                        warn!(site = %site, volume = %volume, error = %e, "Failed to remove volume");
                    }
                }
            } else {
                debug!(site = %site, container = %container, "Container already gone");
            }
        }

        if let Some((db_name, db_user)) = &target.database {
            self.mysql.drop_site_database(db_name, db_user).await?;
        }

        if let Some((partition, site_id)) = &target.row {
            self.db.delete_site(*partition, site_id)?;
        }

        info!(site = %site, "Reclaimed site");
        Ok(())
    }
}

/// Counts from one sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub reclaimed: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Site ids (or container names for untracked containers) torn down
    pub reclaimed_sites: Vec<String>,
}

pub struct Sweeper {
    gateway: SharedGateway,
    db: Arc<Database>,
    reclaimer: Arc<SiteReclaimer>,
    config: SweeperConfig,
    domain_suffix: String,
    sweep_lock: Mutex<()>,
}

impl Sweeper {
    pub fn new(gateway: SharedGateway, db: Arc<Database>, mysql: Arc<DatabaseAdmin>, config: &Config) -> Self {
        let reclaimer = Arc::new(SiteReclaimer::new(
            gateway.clone(),
            db.clone(),
            mysql,
            config.docker.stop_timeout(),
        ));
        Self {
            gateway,
            db,
            reclaimer,
            config: config.sweeper.clone(),
            domain_suffix: config.site.domain_suffix.clone(),
            sweep_lock: Mutex::new(()),
        }
    }

    pub fn reclaimer(&self) -> Arc<SiteReclaimer> {
        Arc::clone(&self.reclaimer)
    }

    pub async fn sweep(&self) -> SiteResult<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// One pass over labelled containers and tracked rows, as of `now`
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SiteResult<SweepReport> {
        let _guard = self.sweep_lock.lock().await;
        let containers = self.gateway.list_containers_with_label(labels::CREATED_AT).await?;
        let mut report = SweepReport::default();
        let mut seen_databases = HashSet::new();

        for container in containers {
            report.examined += 1;
            let view = LabelView::read(&container.labels);

            let Some(db_name) = view.db_name.clone() else {
                debug!(container = %container.name, "No database label, skipping");
                report.skipped += 1;
                continue;
            };
            seen_databases.insert(db_name.clone());

            let tracked = match self.db.find_by_db_name(&db_name) {
                Ok(tracked) => tracked,
                Err(e) => {
                    error!(container = %container.name, error = %e, "Store lookup failed");
                    report.failed += 1;
                    continue;
                }
            };

            let target = match tracked {
                Some((partition, site)) => {
                    if !is_expired(&self.config, partition, &site, now) {
                        debug!(
                            site_id = %site.site_id,
                            partition = ?partition,
                            status = site.status.as_str(),
                            age_minutes = site.age(now).num_minutes(),
                            "Site not expired"
                        );
                        report.skipped += 1;
                        continue;
                    }
                    ReclaimTarget {
                        container: Some(container.id.clone()),
                        ..ReclaimTarget::for_record(partition, &site, &container.name)
                    }
                }
                None => match self.orphan_target(&container.id, &container.name, &view, now) {
                    Some(target) => target,
                    None => {
                        report.skipped += 1;
                        continue;
                    }
                },
            };

            self.reclaim_into(&target, &mut report).await;
        }

        // rows whose container disappeared on its own still hold a database
        for partition in [Partition::Sites, Partition::Pool] {
            for site in self.db.list_sites(partition)? {
                if seen_databases.contains(&site.db_name) || !is_expired(&self.config, partition, &site, now) {
                    continue;
                }
                report.examined += 1;
                let fallback = crate::site::SiteNames::id_from_db_name(&site.db_name)
                    .map(|id| crate::site::SiteNames::derive(&id, &self.domain_suffix).container)
                    .unwrap_or_default();
                let target = ReclaimTarget::for_record(partition, &site, &fallback);
                self.reclaim_into(&target, &mut report).await;
            }
        }

        info!(
            examined = report.examined,
            reclaimed = report.reclaimed,
            skipped = report.skipped,
            failed = report.failed,
            "Sweep finished"
        );
        Ok(report)
    }

    /// Untracked container: reclaimed only past the configured grace period
    fn orphan_target(&self, id: &str, name: &str, view: &LabelView, now: DateTime<Utc>) -> Option<ReclaimTarget> {
        let grace = self.config.orphan_grace()?;
        let created_at = view.created_at?;
        if now - created_at <= grace {
            return None;
        }

        warn!(container = %name, "Reclaiming untracked container past grace period");
        let database = match (&view.db_name, &view.db_user) {
            (Some(db_name), Some(db_user)) => Some((db_name.clone(), db_user.clone())),
            _ => None,
        };
        Some(ReclaimTarget {
            row: None,
            container: Some(id.to_string()),
            database,
        })
    }

    async fn reclaim_into(&self, target: &ReclaimTarget, report: &mut SweepReport) {
        match self.reclaimer.reclaim(target).await {
            Ok(()) => {
                report.reclaimed += 1;
                report.reclaimed_sites.push(target.label());
            }
            Err(e) => {
                error!(site = %target.label(), error = %e, "Failed to reclaim site");
                report.failed += 1;
            }
        }
    }

    /// Sweep on a timer until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval_secs,
            retention_minutes = self.config.retention_minutes,
            "Sweeper started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval()) => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Sweep failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }
}

fn is_expired(config: &SweeperConfig, partition: Partition, site: &SiteRecord, now: DateTime<Utc>) -> bool {
    let grace = config.orphan_grace().unwrap_or_else(chrono::Duration::zero);
    let threshold = match (partition, site.status) {
        (Partition::Pool, SiteStatus::Ready) => return false,
        // stuck mid-build or mid-teardown
        (Partition::Pool, _) => config.retention() + grace,
        // still being built, or its creator died mid-way
        (Partition::Sites, SiteStatus::Provisioning) => config.retention() + grace,
        (Partition::Sites, _) => config.retention(),
    };
    site.age(now) > threshold
}
