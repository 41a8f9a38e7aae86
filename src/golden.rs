//! Golden image: a WordPress install with WP-CLI, plugins and theme baked in,
//! committed once and used as the image of every site.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{Config, GoldenConfig};
use crate::db::Database;
use crate::docker::{exec_checked, ContainerSpec, ExecCommand, SharedGateway};
use crate::error::{SiteError, SiteResult};
use crate::mysql::DatabaseAdmin;
use crate::probe::ReadinessProbe;
use crate::site::random_secret;
use crate::tasks::{TaskKind, TaskRegistry};

pub const LEASE_NAME: &str = "golden-image";

const ASSETS_MOUNT: &str = "/backups";
const GOLDEN_DB_USER: &str = "user_golden";

#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    /// The image was already there; nothing was done
    AlreadyPresent,
    Built { image_id: String },
    /// Another build holds the task slot or the lease
    Skipped,
}

pub struct GoldenImageBuilder {
    gateway: SharedGateway,
    db: Arc<Database>,
    mysql: Arc<DatabaseAdmin>,
    tasks: Arc<TaskRegistry>,
    probe: ReadinessProbe,
    config: GoldenConfig,
    admin_user: String,
    web_root: String,
    network: String,
    stop_timeout: Duration,
    holder: String,
    shutdown: Option<watch::Receiver<bool>>,
}

impl GoldenImageBuilder {
    pub fn new(
        gateway: SharedGateway,
        db: Arc<Database>,
        mysql: Arc<DatabaseAdmin>,
        tasks: Arc<TaskRegistry>,
        config: &Config,
    ) -> Self {
        let probe = ReadinessProbe::new(gateway.clone(), config.probe.clone(), &config.site.web_root);
        Self {
            gateway,
            db,
            mysql,
            tasks,
            probe,
            config: config.golden.clone(),
            admin_user: config.site.admin_user.clone(),
            web_root: config.site.web_root.clone(),
            network: config.docker.network.clone(),
            stop_timeout: config.docker.stop_timeout(),
            holder: format!("{}-{}", std::process::id(), random_secret(8)),
            shutdown: None,
        }
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.probe = self.probe.with_shutdown(shutdown.clone());
        self.shutdown = Some(shutdown);
        self
    }

    /// `repo:tag` of the golden image
    pub fn image_ref(&self) -> String {
        self.config.image_ref()
    }

    pub async fn image_exists(&self) -> SiteResult<bool> {
        Ok(self.gateway.image_exists(&self.image_ref()).await?)
    }

    /// Build the image unless it exists or a build is already under way
    pub async fn ensure(&self) -> SiteResult<BuildOutcome> {
        if self.image_exists().await? {
            info!(image = %self.image_ref(), "Golden image already present");
            return Ok(BuildOutcome::AlreadyPresent);
        }

        let Some(guard) = self.tasks.try_start(TaskKind::GoldenImage) else {
            info!("Golden image build already running");
            return Ok(BuildOutcome::Skipped);
        };

        let ttl = chrono::Duration::minutes(self.config.lease_minutes as i64);
        if !self.db.acquire_lease(LEASE_NAME, &self.holder, ttl, Utc::now())? {
            info!("Another process holds the golden image lease");
            guard.fail("build lease held by another process");
            return Ok(BuildOutcome::Skipped);
        }

        let result = self.build().await;

        if let Err(e) = self.db.release_lease(LEASE_NAME, &self.holder) {
            warn!(error = %e, "Failed to release golden image lease");
        }

        match result {
            Ok(image_id) => {
                guard.succeed();
                Ok(BuildOutcome::Built { image_id })
            }
            Err(e) => {
                guard.fail(&e);
                Err(e)
            }
        }
    }

    /// Run [`ensure`](Self::ensure) in the background
    pub fn spawn(self: Arc<Self>) -> JoinHandle<SiteResult<BuildOutcome>> {
        tokio::spawn(async move {
            let result = self.ensure().await;
            if let Err(e) = &result {
                error!(error = %e, "Golden image build failed");
            }
            result
        })
    }

    async fn build(&self) -> SiteResult<String> {
        let image = self.image_ref();
        info!(image = %image, base = %self.config.base_image, "Building golden image");

        self.mysql.wait_until_ready(self.shutdown.clone()).await?;

        let db_pass = random_secret(16);
        self.mysql
            .ensure_database_user(&self.config.db_name, GOLDEN_DB_USER, &db_pass)
            .await?;

        if !self.gateway.image_exists(&self.config.base_image).await? {
            self.gateway
                .pull_image(&self.config.base_image)
                .await
                .map_err(|e| match e {
                    e if e.is_not_found() => SiteError::ImageMissing(self.config.base_image.clone()),
                    e => e.into(),
                })?;
        }

        let container = self.config.build_container.clone();
        self.gateway.remove_container(&container).await?;

        let spec = self.build_container_spec(&db_pass);
        self.gateway.create_container(&spec).await?;

        let result = self.prepare_and_commit(&container).await;

        if let Err(e) = self.gateway.remove_container(&container).await {
            warn!(container = %container, error = %e, "Failed to remove golden build container");
        }

        let image_id = result?;
        info!(image = %image, image_id = %image_id, "Golden image ready");
        Ok(image_id)
    }

    fn build_container_spec(&self, db_pass: &str) -> ContainerSpec {
        let mut binds = Vec::new();
        if let Some(dir) = &self.config.assets_dir {
            binds.push(format!("{}:{}:ro", dir, ASSETS_MOUNT));
        }

        ContainerSpec {
            name: self.config.build_container.clone(),
            image: self.config.base_image.clone(),
            env: vec![
                format!("WORDPRESS_DB_HOST={}", self.mysql.endpoint()),
                format!("WORDPRESS_DB_USER={}", GOLDEN_DB_USER),
                format!("WORDPRESS_DB_PASSWORD={}", db_pass),
                format!("WORDPRESS_DB_NAME={}", self.config.db_name),
            ],
            network: Some(self.network.clone()),
            binds,
            published_port: Some((80, self.config.build_port)),
            ..Default::default()
        }
    }

    async fn prepare_and_commit(&self, container: &str) -> SiteResult<String> {
        self.gateway.start_container(container).await?;

        self.probe.wait_for_config(container).await?;

        self.install_wp_cli(container).await?;
        self.install_wordpress(container).await?;
        self.install_assets(container).await?;

        self.gateway.stop_container(container, self.stop_timeout).await?;

        let image_id = self
            .gateway
            .commit_container(container, &self.config.repo, &self.config.tag)
            .await?
            .ok_or_else(|| SiteError::CommitProducedNoImage(container.to_string()))?;

        // the commit usually tags already; a failure here is recoverable by the check below
        if let Err(e) = self
            .gateway
            .tag_image(&image_id, &self.config.repo, &self.config.tag)
            .await
        {
            warn!(image_id = %image_id, error = %e, "Failed to tag golden image by id");
        }

        if !self.gateway.image_exists(&self.image_ref()).await? {
            return Err(SiteError::ImageMissing(self.image_ref()));
        }

        Ok(image_id)
    }

    async fn install_wp_cli(&self, container: &str) -> SiteResult<()> {
        let script = format!(
            "curl -fsSL -o /usr/local/bin/wp {} && chmod +x /usr/local/bin/wp",
            shell_words::quote(&self.config.wp_cli_url)
        );
        exec_checked(self.gateway.as_ref(), container, "install wp-cli", &ExecCommand::shell(script)).await?;
        Ok(())
    }

    async fn install_wordpress(&self, container: &str) -> SiteResult<()> {
        let path = shell_words::quote(&self.web_root);
        let check = ExecCommand::shell(format!("wp core is-installed --allow-root --path={}", path));
        if self.gateway.exec(container, &check).await?.success() {
            info!(container, "WordPress already installed in build container");
            return Ok(());
        }

        let script = format!(
            "wp core install --url={} --title={} --admin_user={} --admin_password={} \
             --admin_email={} --skip-email --allow-root --path={}",
            shell_words::quote(&format!("http://localhost:{}", self.config.build_port)),
            shell_words::quote(&self.config.title),
            shell_words::quote(&self.admin_user),
            shell_words::quote(&self.config.admin_password),
            shell_words::quote(&self.config.admin_email),
            path,
        );
        exec_checked(self.gateway.as_ref(), container, "wp core install", &ExecCommand::shell(script)).await?;
        Ok(())
    }

    async fn install_assets(&self, container: &str) -> SiteResult<()> {
        if self.config.assets_dir.is_none() {
            return Ok(());
        }

        let mounted = ExecCommand::shell(format!("test -d {}", ASSETS_MOUNT));
        if !self.gateway.exec(container, &mounted).await?.success() {
            warn!(container, "Assets directory not mounted, skipping plugins and themes");
            return Ok(());
        }

        for (step, script) in asset_scripts(&self.config) {
            exec_checked(self.gateway.as_ref(), container, &step, &ExecCommand::shell(script)).await?;
        }
        Ok(())
    }
}

/// `(step, script)` pairs unpacking the configured archives into wp-content
fn asset_scripts(config: &GoldenConfig) -> Vec<(String, String)> {
    let content = &config.content_dir;
    let plugins = format!("{}/plugins", content);
    let themes = format!("{}/themes", content);
    let q = |s: &str| shell_words::quote(s).into_owned();

    let mut scripts = vec![
        (
            "install unzip".to_string(),
            "command -v unzip >/dev/null 2>&1 || (apt-get update -qq && apt-get install -y -qq unzip)"
                .to_string(),
        ),
        (
            "create content dirs".to_string(),
            format!("mkdir -p {} {}", q(&plugins), q(&themes)),
        ),
    ];

    for archive in &config.plugins {
        scripts.push((
            format!("unpack plugin {}", archive),
            format!("unzip -oq {} -d {}", q(&format!("{}/{}", ASSETS_MOUNT, archive)), q(&plugins)),
        ));
    }
    for archive in &config.themes {
        scripts.push((
            format!("unpack theme {}", archive),
            format!("unzip -oq {} -d {}", q(&format!("{}/{}", ASSETS_MOUNT, archive)), q(&themes)),
        ));
    }
    for rename in &config.theme_renames {
        let from = q(&format!("{}/{}", themes, rename.from));
        let to = q(&format!("{}/{}", themes, rename.to));
        scripts.push((
            format!("rename theme {}", rename.from),
            format!("if [ -d {from} ]; then rm -rf {to} && mv {from} {to}; fi"),
        ));
    }
    if let Some(seed) = &config.uploads_seed {
        let uploads = q(&format!("{}/uploads", content));
        scripts.push((
            "seed uploads".to_string(),
            format!(
                "mkdir -p {uploads} && cp -a {}/. {uploads}/ && chown -R www-data:www-data {uploads}",
                q(&format!("{}/{}", ASSETS_MOUNT, seed))
            ),
        ));
    }

    scripts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThemeRename;

    #[test]
    fn test_asset_scripts() {
        let config = GoldenConfig {
            assets_dir: Some("/srv/backups".to_string()),
            plugins: vec!["droip.zip".to_string(), "tutor.zip".to_string()],
            themes: vec!["tutorbase.zip".to_string()],
            theme_renames: vec![ThemeRename {
                from: "tutorbase-1.0.1".to_string(),
                to: "tutorbase".to_string(),
            }],
            uploads_seed: Some("uploads".to_string()),
            ..Default::default()
        };

        let scripts = asset_scripts(&config);
        let steps: Vec<_> = scripts.iter().map(|(step, _)| step.as_str()).collect();
        assert_eq!(
            steps,
            vec![
                "install unzip",
                "create content dirs",
                "unpack plugin droip.zip",
                "unpack plugin tutor.zip",
                "unpack theme tutorbase.zip",
                "rename theme tutorbase-1.0.1",
                "seed uploads",
            ]
        );
        assert_eq!(
            scripts[2].1,
            "unzip -oq /backups/droip.zip -d /usr/src/wordpress/wp-content/plugins"
        );
        assert!(scripts[5].1.contains("mv /usr/src/wordpress/wp-content/themes/tutorbase-1.0.1"));
        assert!(scripts[6].1.contains("chown -R www-data:www-data"));
    }

    #[test]
    fn test_asset_scripts_without_archives() {
        let scripts = asset_scripts(&GoldenConfig::default());
        assert_eq!(scripts.len(), 2);
    }
}
