//! Site provisioning and lifecycle
//!
//! A site is created in this order:
//!
//! 1. Claim a fresh identifier in the store (status `provisioning`)
//! 2. Create the site database and its user, seeded from the golden dump if configured
//! 3. Create the container from the golden image, labelled for the proxy
//! 4. Start it, install WordPress into its own database, wait for readiness
//! 5. Activate the configured plugins and theme, point `home`/`siteurl` at the
//!    public URL and set the admin password
//! 6. Mark the row `allocated` (or `ready` for the pool)
//!
//! A failure in any step rolls back whatever the earlier steps created, and
//! nothing else: a container name already taken by someone else is treated as
//! a collision and retried under a fresh identifier.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ProbeTimeoutPolicy, ProxyConfig, SiteConfig};
use crate::db::{Database, Partition, SiteRecord};
use crate::docker::{exec_checked, ContainerSpec, ExecCommand, SharedGateway};
use crate::error::{ProvisionStep, SiteError, SiteResult};
use crate::labels::{self, LabelView};
use crate::mysql::DatabaseAdmin;
use crate::probe::{wait_for_https, ReadinessProbe};
use crate::site::{SiteCredentials, SiteDescriptor, SiteId, SiteNames, SiteStatus};
use crate::sweeper::{ReclaimTarget, SweepReport, Sweeper};

/// Build the API view of a stored site
pub fn describe(site: &SiteRecord, from_pool: bool) -> SiteDescriptor {
    SiteDescriptor {
        id: site.site_id.clone(),
        url: site.site_url.clone(),
        username: site.owner.clone(),
        admin_user: site.admin_user.clone(),
        admin_pass: site.admin_password.clone(),
        db: site.db_name.clone(),
        db_user: site.db_user.clone(),
        db_pass: site.db_pass.clone(),
        status: site.status,
        created_at: site.created_at,
        may_not_be_ready: false,
        from_pool,
    }
}

/// A site as seen from container labels alone
#[derive(Debug, Clone, Serialize)]
pub struct LabelledSite {
    pub container: String,
    pub running: bool,
    pub site_id: Option<String>,
    pub url: Option<String>,
    pub username: Option<String>,
    pub db: Option<String>,
    pub db_user: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LabelMismatch {
    pub site_id: String,
    pub problems: Vec<String>,
}

/// Differences between the store and the runtime
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ReconcileReport {
    /// Tracked sites with no container
    pub missing_containers: Vec<String>,
    /// Labelled containers with no store row
    pub untracked_containers: Vec<String>,
    pub label_mismatches: Vec<LabelMismatch>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.missing_containers.is_empty()
            && self.untracked_containers.is_empty()
            && self.label_mismatches.is_empty()
    }
}

/// What provisioning created so far, for rollback
#[derive(Default)]
struct Progress {
    database: bool,
    container: Option<String>,
}

pub struct SiteOrchestrator {
    gateway: SharedGateway,
    db: Arc<Database>,
    mysql: Arc<DatabaseAdmin>,
    sweeper: Arc<Sweeper>,
    probe: ReadinessProbe,
    site: SiteConfig,
    proxy: ProxyConfig,
    network: String,
    image: String,
    seed_sql: Option<String>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl SiteOrchestrator {
    pub fn new(
        gateway: SharedGateway,
        db: Arc<Database>,
        mysql: Arc<DatabaseAdmin>,
        sweeper: Arc<Sweeper>,
        config: &Config,
    ) -> Self {
        let probe = ReadinessProbe::new(gateway.clone(), config.probe.clone(), &config.site.web_root);
        Self {
            gateway,
            db,
            mysql,
            sweeper,
            probe,
            site: config.site.clone(),
            proxy: config.proxy.clone(),
            network: config.docker.network.clone(),
            image: config.golden.image_ref(),
            seed_sql: config.golden.seed_sql.clone(),
            shutdown: None,
        }
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.probe = self.probe.with_shutdown(shutdown.clone());
        self.shutdown = Some(shutdown);
        self
    }

    fn names(&self, id: &SiteId) -> SiteNames {
        SiteNames::derive(id, &self.site.domain_suffix)
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Provision a site for `username` and hand it out directly
    pub async fn create_site(&self, username: Option<&str>) -> SiteResult<SiteDescriptor> {
        self.provision(Partition::Sites, username).await
    }

    /// Provision a site into `partition`, retrying on identifier collisions
    pub async fn provision(&self, partition: Partition, username: Option<&str>) -> SiteResult<SiteDescriptor> {
        if self.shutting_down() {
            return Err(SiteError::Cancelled);
        }
        if !self.gateway.image_exists(&self.image).await? {
            return Err(SiteError::GoldenImageMissing(self.image.clone()));
        }

        let attempts = self.site.max_id_attempts;
        for attempt in 1..=attempts {
            match self.provision_once(partition, username).await {
                Err(e) if e.is_name_collision() => {
                    warn!(attempt, attempts, error = %e, "Site identifier collision, retrying");
                }
                other => return other,
            }
        }

        Err(SiteError::IdentifiersExhausted(attempts))
    }

    async fn provision_once(&self, partition: Partition, username: Option<&str>) -> SiteResult<SiteDescriptor> {
        let id = SiteId::generate();
        let names = self.names(&id);
        let credentials = SiteCredentials::generate(&self.site.admin_user);
        let now = Utc::now();

        let mut record = SiteRecord {
            site_id: id.to_string(),
            container_id: None,
            site_url: names.url.clone(),
            admin_user: credentials.admin_user.clone(),
            admin_password: credentials.admin_password.clone(),
            db_name: names.db_name.clone(),
            db_user: names.db_user.clone(),
            db_pass: credentials.db_password.clone(),
            owner: username.map(str::to_string),
            status: SiteStatus::Provisioning,
            created_at: now,
        };

        let claimed = self
            .db
            .claim_site(partition, &record)
            .map_err(|e| SiteError::from(e).at(id.as_str(), ProvisionStep::ClaimIdentifier))?;
        if !claimed {
            return Err(SiteError::DuplicateName(names.db_name.clone()).at(id.as_str(), ProvisionStep::ClaimIdentifier));
        }

        info!(site_id = %id, partition = ?partition, username = ?username, "Provisioning site");

        let mut progress = Progress::default();
        let result = self
            .drive(partition, &names, &credentials, username, now, &mut progress)
            .await;

        match result {
            Ok((status, may_not_be_ready)) => {
                record.container_id = progress.container;
                record.status = status;
                let mut descriptor = describe(&record, false);
                descriptor.may_not_be_ready = may_not_be_ready;
                info!(site_id = %id, url = %names.url, may_not_be_ready, "Site provisioned");
                Ok(descriptor)
            }
            Err(e) => {
                error!(site_id = %id, error = %e, "Provisioning failed, rolling back");
                self.roll_back(partition, &names, &progress).await;
                Err(e)
            }
        }
    }

    /// Steps 2 to 6; returns the final status and whether readiness was assumed
    async fn drive(
        &self,
        partition: Partition,
        names: &SiteNames,
        credentials: &SiteCredentials,
        username: Option<&str>,
        created_at: DateTime<Utc>,
        progress: &mut Progress,
    ) -> SiteResult<(SiteStatus, bool)> {
        let site_id = names.id.as_str();

        self.mysql
            .create_site_database(&names.db_name, &names.db_user, &credentials.db_password)
            .await
            .map_err(|e| e.at(site_id, ProvisionStep::CreateDatabase))?;
        progress.database = true;

        if let Some(dump) = &self.seed_sql {
            self.mysql
                .seed_site_database(&names.db_name, dump)
                .await
                .map_err(|e| e.at(site_id, ProvisionStep::SeedDatabase))?;
        }

        let spec = self.container_spec(names, credentials, username, created_at);
        let container_id = match self.gateway.create_container(&spec).await {
            Ok(container_id) => container_id,
            Err(e) if e.is_not_found() => {
                return Err(SiteError::GoldenImageMissing(self.image.clone()).at(site_id, ProvisionStep::CreateContainer))
            }
            Err(e) if e.is_conflict() => {
                warn!(site_id, container = %names.container, "Container name already taken");
                return Err(SiteError::DuplicateName(names.container.clone()).at(site_id, ProvisionStep::CreateContainer));
            }
            Err(e) => return Err(SiteError::from(e).at(site_id, ProvisionStep::CreateContainer)),
        };
        progress.container = Some(container_id.clone());
        self.db
            .set_container_id(partition, site_id, &container_id)
            .map_err(|e| SiteError::from(e).at(site_id, ProvisionStep::CreateContainer))?;

        self.gateway
            .start_container(&container_id)
            .await
            .map_err(|e| SiteError::from(e).at(site_id, ProvisionStep::StartContainer))?;

        let ready = self.await_ready(&container_id, names).await?;

        if ready {
            self.activate(&container_id, site_id).await;
        }

        if ready && self.site.configure_urls {
            self.configure(&container_id)
                .await
                .map_err(|e| e.at(site_id, ProvisionStep::Configure))?;
        }

        let mut may_not_be_ready = !ready;
        if ready && self.site.verify_https {
            match wait_for_https(
                &names.url,
                self.site.https_attempts,
                self.site.https_interval(),
                self.site.https_timeout(),
                self.shutdown.clone(),
            )
            .await
            {
                Ok(()) => {}
                Err(e) if e.is_probe_timeout() && self.site.probe_timeout_policy == ProbeTimeoutPolicy::Optimistic => {
                    warn!(site_id, url = %names.url, "HTTPS not serving yet, handing out anyway");
                    may_not_be_ready = true;
                }
                Err(e) => return Err(e.at(site_id, ProvisionStep::VerifyHttps)),
            }
        }

        let status = match partition {
            Partition::Sites => SiteStatus::Allocated,
            Partition::Pool => SiteStatus::Ready,
        };
        self.db
            .set_status(partition, site_id, status)
            .map_err(|e| SiteError::from(e).at(site_id, ProvisionStep::Register))?;

        Ok((status, may_not_be_ready))
    }

    /// Install and probe; false when the probe timed out under the optimistic policy
    async fn await_ready(&self, container: &str, names: &SiteNames) -> SiteResult<bool> {
        let site_id = names.id.as_str();

        let outcome = async {
            if self.site.install {
                self.install(container)
                    .await
                    .map_err(|e| e.at(site_id, ProvisionStep::Install))?;
            }
            self.probe
                .wait_for_ready(container)
                .await
                .map_err(|e| e.at(site_id, ProvisionStep::Readiness))
        }
        .await;

        match outcome {
            Ok(()) => Ok(true),
            Err(e) if e.is_probe_timeout() => match self.site.probe_timeout_policy {
                ProbeTimeoutPolicy::Optimistic => {
                    warn!(site_id, error = %e, "Site not ready, handing out anyway");
                    Ok(false)
                }
                ProbeTimeoutPolicy::Rollback => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Install WordPress into the site's database unless already installed
    async fn install(&self, container: &str) -> SiteResult<()> {
        self.probe.wait_for_config(container).await?;

        let path = shell_words::quote(&self.site.web_root);
        let script = format!(
            "wp core is-installed --allow-root --path={path} || \
             wp core install --url=\"$WP_SITE_URL\" --title=\"$WP_SITE_TITLE\" \
             --admin_user=\"$WP_ADMIN_USER\" --admin_password=\"$WP_ADMIN_PASS\" \
             --admin_email=\"$WP_ADMIN_EMAIL\" --skip-email --allow-root --path={path}"
        );
        exec_checked(self.gateway.as_ref(), container, "wp core install", &ExecCommand::shell(script)).await?;
        Ok(())
    }

    /// Point WordPress at its public URL and apply the generated admin password
    async fn configure(&self, container: &str) -> SiteResult<()> {
        let path = shell_words::quote(&self.site.web_root);
        let commands = [
            (
                "wp option update home",
                format!("wp option update home \"$WP_SITE_URL\" --allow-root --path={path}"),
            ),
            (
                "wp option update siteurl",
                format!("wp option update siteurl \"$WP_SITE_URL\" --allow-root --path={path}"),
            ),
            (
                "wp user update",
                format!(
                    "wp user update \"$WP_ADMIN_USER\" --user_pass=\"$WP_ADMIN_PASS\" \
                     --skip-email --allow-root --path={path}"
                ),
            ),
        ];

        for (step, script) in commands {
            exec_checked(self.gateway.as_ref(), container, step, &ExecCommand::shell(script)).await?;
        }
        debug!(container, "Site URLs and admin password configured");
        Ok(())
    }

    /// Activate the configured plugins and theme; failures are logged, not fatal
    async fn activate(&self, container: &str, site_id: &str) {
        let path = shell_words::quote(&self.site.web_root);
        let plugins = self.site.activate_plugins.iter().map(|name| ("plugin", name));
        let theme = self.site.activate_theme.iter().map(|name| ("theme", name));

        for (kind, name) in plugins.chain(theme) {
            let script = format!(
                "wp {kind} activate {} --allow-root --path={path}",
                shell_words::quote(name)
            );
            match self.gateway.exec(container, &ExecCommand::shell(script)).await {
                Ok(output) if output.success() => debug!(site_id, kind, name = %name, "Activated"),
                Ok(output) => {
                    warn!(site_id, kind, name = %name, output = %output.message(), "Activation failed")
                }
                Err(e) => warn!(site_id, kind, name = %name, error = %e, "Activation failed"),
            }
        }
    }

    fn container_spec(
        &self,
        names: &SiteNames,
        credentials: &SiteCredentials,
        username: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> ContainerSpec {
        let label_user = username.unwrap_or(&self.site.admin_user);
        let env = vec![
            format!("WORDPRESS_DB_HOST={}", self.mysql.endpoint()),
            format!("WORDPRESS_DB_USER={}", names.db_user),
            format!("WORDPRESS_DB_PASSWORD={}", credentials.db_password),
            format!("WORDPRESS_DB_NAME={}", names.db_name),
            format!("WP_SITE_TITLE={}", self.site.title),
            format!("WP_SITE_URL={}", names.url),
            format!("WP_ADMIN_USER={}", credentials.admin_user),
            format!("WP_ADMIN_PASS={}", credentials.admin_password),
            format!("WP_ADMIN_EMAIL=admin@{}", names.subdomain),
        ];

        ContainerSpec {
            name: names.container.clone(),
            image: self.image.clone(),
            env,
            labels: labels::site_labels(names, &self.proxy, &self.network, label_user, created_at),
            memory_bytes: self.site.memory_bytes(),
            network: Some(self.network.clone()),
            ..Default::default()
        }
    }

    async fn roll_back(&self, partition: Partition, names: &SiteNames, progress: &Progress) {
        let target = ReclaimTarget {
            row: Some((partition, names.id.to_string())),
            // only a container this attempt created
            container: progress.container.clone(),
            // a colliding database belongs to someone else
            database: progress
                .database
                .then(|| (names.db_name.clone(), names.db_user.clone())),
        };

        if let Err(e) = self.sweeper.reclaimer().reclaim(&target).await {
            error!(site_id = %names.id, error = %e, "Rollback incomplete, left for the sweeper");
        }
    }

    /// Sites handed out to callers, newest first
    pub fn list_sites(&self) -> SiteResult<Vec<SiteDescriptor>> {
        let sites = self.db.list_sites(Partition::Sites)?;
        Ok(sites.iter().map(|site| describe(site, false)).collect())
    }

    /// Sites as described by container labels, newest first
    pub async fn list_sites_from_labels(&self) -> SiteResult<Vec<LabelledSite>> {
        let containers = self.gateway.list_containers_with_label(labels::CREATED_AT).await?;

        let mut sites: Vec<LabelledSite> = containers
            .into_iter()
            .map(|container| {
                let view = LabelView::read(&container.labels);
                LabelledSite {
                    container: container.name,
                    running: container.running,
                    site_id: view.site_id.map(|id| id.to_string()),
                    url: view.host.map(|host| format!("https://{}", host)),
                    username: view.username,
                    db: view.db_name,
                    db_user: view.db_user,
                    created_at: view.created_at,
                }
            })
            .collect();

        sites.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sites)
    }

    /// Compare store rows against labelled containers; changes nothing
    pub async fn reconcile(&self) -> SiteResult<ReconcileReport> {
        let containers = self.gateway.list_containers_with_label(labels::CREATED_AT).await?;
        let mut by_db: HashMap<String, (String, LabelView)> = HashMap::new();
        let mut report = ReconcileReport::default();

        for container in containers {
            let view = LabelView::read(&container.labels);
            match view.db_name.clone() {
                Some(db_name) => {
                    by_db.insert(db_name, (container.name, view));
                }
                None => report.untracked_containers.push(container.name),
            }
        }

        for partition in [Partition::Sites, Partition::Pool] {
            for site in self.db.list_sites(partition)? {
                let Some((_, view)) = by_db.remove(&site.db_name) else {
                    // a row still being provisioned may not have its container yet
                    if site.status != SiteStatus::Provisioning {
                        report.missing_containers.push(site.site_id.clone());
                    }
                    continue;
                };

                if let Ok(id) = SiteId::parse(&site.site_id) {
                    let problems = view.mismatches(&self.names(&id));
                    if !problems.is_empty() {
                        report.label_mismatches.push(LabelMismatch {
                            site_id: site.site_id.clone(),
                            problems,
                        });
                    }
                }
            }
        }

        report
            .untracked_containers
            .extend(by_db.into_values().map(|(name, _)| name));
        report.untracked_containers.sort();
        report.missing_containers.sort();

        if !report.is_clean() {
            warn!(
                missing = report.missing_containers.len(),
                untracked = report.untracked_containers.len(),
                mismatched = report.label_mismatches.len(),
                "Store and runtime disagree"
            );
        }
        Ok(report)
    }

    /// Reclaim every expired site
    pub async fn cleanup_expired(&self) -> SiteResult<SweepReport> {
        self.sweeper.sweep().await
    }

    /// Tear one site down now, regardless of age
    pub async fn destroy_site(&self, site_id: &str) -> SiteResult<()> {
        let id = SiteId::parse(site_id)?;
        let names = self.names(&id);

        for partition in [Partition::Sites, Partition::Pool] {
            if let Some(site) = self.db.get_site(partition, id.as_str())? {
                let target = ReclaimTarget::for_record(partition, &site, &names.container);
                return self.sweeper.reclaimer().reclaim(&target).await;
            }
        }

        Err(SiteError::SiteNotFound(id.to_string()))
    }

    /// One-time admin login URL from the token the guest plugin wrote
    pub async fn login_link(&self, site_id: &str) -> SiteResult<String> {
        let id = SiteId::parse(site_id)?;
        let names = self.names(&id);
        let site = self
            .db
            .get_site(Partition::Sites, id.as_str())?
            .ok_or_else(|| SiteError::SiteNotFound(id.to_string()))?;
        let container = site.container_id.unwrap_or(names.container);

        let command = ExecCommand::new(["cat", self.site.login_token_file.as_str()]);
        let output = match self.gateway.exec(&container, &command).await {
            Ok(output) if output.success() => output,
            Ok(_) => return Err(SiteError::LoginTokenUnavailable(id.to_string())),
            Err(e) if e.is_not_found() => return Err(SiteError::SiteNotFound(id.to_string())),
            Err(e) => return Err(e.into()),
        };

        let token = parse_login_token(&output.stdout, Utc::now())
            .ok_or_else(|| SiteError::LoginTokenUnavailable(id.to_string()))?;
        Ok(format!("{}/?auto_login_token={}", names.url, token))
    }
}

/// Parse `<token> <expiry-unix-secs>`; None when malformed or expired
fn parse_login_token(content: &str, now: DateTime<Utc>) -> Option<&str> {
    let mut parts = content.split_whitespace();
    let token = parts.next()?;
    let expires_at: i64 = parts.next()?.parse().ok()?;

    if token.is_empty() || !token.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    if expires_at <= now.timestamp() {
        return None;
    }
    Some(token)
}
