use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::docker::parse_memory_limit;

/// Global configuration for the demo-site orchestrator
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// HTTP API server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Local state store
    #[serde(default)]
    pub store: StoreConfig,

    /// Container runtime connection
    #[serde(default)]
    pub docker: DockerConfig,

    /// Shared MySQL engine that hosts every per-site database
    #[serde(default)]
    pub mysql: MysqlConfig,

    /// Per-site provisioning settings (required section)
    pub site: SiteConfig,

    /// Reverse proxy label settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Readiness probe budget
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Pre-warmed pool of sites
    #[serde(default)]
    pub pool: PoolConfig,

    /// Reclamation sweeper (required section)
    pub sweeper: SweeperConfig,

    /// Golden image build
    #[serde(default)]
    pub golden: GoldenConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// API port (default: 4000)
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Path to PID file (optional). Holding its lock keeps a second orchestrator from starting.
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_api_port(),
            pid_file: None,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// SQLite database file
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DockerConfig {
    /// Docker endpoint (unix:// or tcp://). Falls back to DOCKER_HOST and the usual socket paths.
    pub host: Option<String>,

    /// Network shared by site containers and the reverse proxy
    #[serde(default = "default_network")]
    pub network: String,

    /// Grace period given to a container on stop
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: None,
            network: default_network(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl DockerConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MysqlConfig {
    /// Name of the running MySQL container that admin commands are executed in
    #[serde(default = "default_mysql_container")]
    pub container: String,

    /// Host name site containers use to reach MySQL
    #[serde(default = "default_mysql_host")]
    pub host: String,

    #[serde(default = "default_mysql_port")]
    pub port: u16,

    #[serde(default = "default_mysql_root_user")]
    pub root_user: String,

    /// Root password, handed to the mysql client through MYSQL_PWD
    #[serde(default = "default_mysql_root_password")]
    pub root_password: String,

    /// Host pattern granted to per-site users
    #[serde(default = "default_mysql_user_host")]
    pub user_host: String,

    /// Attempts made waiting for the engine to answer
    #[serde(default = "default_mysql_ready_attempts")]
    pub ready_attempts: u32,

    #[serde(default = "default_poll_interval_ms")]
    pub ready_interval_ms: u64,
}

impl Default for MysqlConfig {
    fn default() -> Self {
        Self {
            container: default_mysql_container(),
            host: default_mysql_host(),
            port: default_mysql_port(),
            root_user: default_mysql_root_user(),
            root_password: default_mysql_root_password(),
            user_host: default_mysql_user_host(),
            ready_attempts: default_mysql_ready_attempts(),
            ready_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl MysqlConfig {
    /// Value of WORDPRESS_DB_HOST for site containers
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ready_interval(&self) -> Duration {
        Duration::from_millis(self.ready_interval_ms)
    }
}

/// What to do when a freshly started site never reports ready
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeTimeoutPolicy {
    /// Hand the site out anyway, flagged as possibly not ready
    Optimistic,
    /// Tear the partial site down and fail the request
    Rollback,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SiteConfig {
    /// Sites are served at `<id>.<domain_suffix>`
    pub domain_suffix: String,

    /// Required, no default
    pub probe_timeout_policy: ProbeTimeoutPolicy,

    /// WordPress administrator login shared by the golden image and every site
    #[serde(default = "default_admin_user")]
    pub admin_user: String,

    /// Title written into each site's environment
    #[serde(default = "default_site_title")]
    pub title: String,

    /// Memory limit per site container (e.g. "1g", "512m")
    #[serde(default = "default_site_memory")]
    pub memory: String,

    /// Identifier attempts before giving up on name collisions
    #[serde(default = "default_max_id_attempts")]
    pub max_id_attempts: u32,

    /// Document root inside the WordPress container
    #[serde(default = "default_web_root")]
    pub web_root: String,

    /// Run `wp core install` against the site's own database after start.
    /// Disable when the image's entrypoint installs from the WP_* environment.
    #[serde(default = "default_true")]
    pub install: bool,

    /// Run `wp option update home/siteurl` and reset the admin password after readiness
    #[serde(default = "default_true")]
    pub configure_urls: bool,

    /// Plugins activated once the site is ready; a failed activation is logged and skipped
    #[serde(default)]
    pub activate_plugins: Vec<String>,

    /// Theme activated once the site is ready
    pub activate_theme: Option<String>,

    /// Poll the public HTTPS URL until the proxy serves it
    #[serde(default)]
    pub verify_https: bool,

    #[serde(default = "default_https_attempts")]
    pub https_attempts: u32,

    #[serde(default = "default_poll_interval_ms")]
    pub https_interval_ms: u64,

    #[serde(default = "default_https_timeout_ms")]
    pub https_timeout_ms: u64,

    /// File the guest auto-login plugin writes `<token> <expiry>` into
    #[serde(default = "default_login_token_file")]
    pub login_token_file: String,
}

impl SiteConfig {
    pub fn memory_bytes(&self) -> Option<i64> {
        parse_memory_limit(&self.memory).ok()
    }

    pub fn https_interval(&self) -> Duration {
        Duration::from_millis(self.https_interval_ms)
    }

    pub fn https_timeout(&self) -> Duration {
        Duration::from_millis(self.https_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    #[serde(default = "default_http_entrypoint")]
    pub http_entrypoint: String,

    #[serde(default = "default_https_entrypoint")]
    pub https_entrypoint: String,

    /// Middleware attached to the plain HTTP router
    #[serde(default = "default_redirect_middleware")]
    pub redirect_middleware: String,

    #[serde(default = "default_cert_resolver")]
    pub cert_resolver: String,

    /// Port WordPress listens on inside the container
    #[serde(default = "default_service_port")]
    pub service_port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_entrypoint: default_http_entrypoint(),
            https_entrypoint: default_https_entrypoint(),
            redirect_middleware: default_redirect_middleware(),
            cert_resolver: default_cert_resolver(),
            service_port: default_service_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,

    /// File whose presence means the entrypoint has written the WordPress config
    #[serde(default = "default_config_file")]
    pub config_file: String,

    /// When set, this file replaces `wp core is-installed` as the install signal
    pub marker_file: Option<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_probe_attempts(),
            interval_ms: default_poll_interval_ms(),
            config_file: default_config_file(),
            marker_file: None,
        }
    }
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    /// Number of ready sites the pool refills to (0 disables the pool)
    #[serde(default = "default_pool_target")]
    pub target_size: usize,

    /// Refill is triggered when an allocation leaves fewer than this many
    #[serde(default = "default_pool_min")]
    pub min_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            target_size: default_pool_target(),
            min_size: default_pool_min(),
        }
    }
}

impl PoolConfig {
    pub fn enabled(&self) -> bool {
        self.target_size > 0
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SweeperConfig {
    /// Sites older than this are reclaimed. Required.
    pub retention_minutes: u64,

    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,

    /// Containers with no store row are reclaimed once older than this; unset leaves them alone
    pub orphan_grace_minutes: Option<u64>,
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.retention_minutes as i64)
    }

    pub fn orphan_grace(&self) -> Option<chrono::Duration> {
        self.orphan_grace_minutes
            .map(|m| chrono::Duration::minutes(m as i64))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GoldenConfig {
    /// Image the golden image is built from
    #[serde(default = "default_base_image")]
    pub base_image: String,

    #[serde(default = "default_golden_repo")]
    pub repo: String,

    #[serde(default = "default_golden_tag")]
    pub tag: String,

    /// Name of the temporary build container
    #[serde(default = "default_build_container")]
    pub build_container: String,

    /// Database the build container installs WordPress into
    #[serde(default = "default_golden_db")]
    pub db_name: String,

    /// Host port published by the build container
    #[serde(default = "default_build_port")]
    pub build_port: u16,

    /// Host directory with plugin/theme archives, mounted read-only at /backups
    pub assets_dir: Option<String>,

    #[serde(default = "default_wp_cli_url")]
    pub wp_cli_url: String,

    #[serde(default = "default_golden_title")]
    pub title: String,

    #[serde(default = "default_golden_password")]
    pub admin_password: String,

    #[serde(default = "default_golden_email")]
    pub admin_email: String,

    /// Where WordPress keeps the pristine copy the entrypoint seeds new sites from
    #[serde(default = "default_content_dir")]
    pub content_dir: String,

    /// Plugin archives (file names under /backups)
    #[serde(default)]
    pub plugins: Vec<String>,

    /// Theme archives (file names under /backups)
    #[serde(default)]
    pub themes: Vec<String>,

    /// Directory renames applied after unpacking themes, as `from -> to`
    #[serde(default)]
    pub theme_renames: Vec<ThemeRename>,

    /// Uploads seed directory under /backups, copied into wp-content/uploads
    pub uploads_seed: Option<String>,

    /// SQL dump inside the MySQL container, imported into every new site database
    pub seed_sql: Option<String>,

    /// A build that has not finished within this many minutes may be taken over
    #[serde(default = "default_lease_minutes")]
    pub lease_minutes: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ThemeRename {
    pub from: String,
    pub to: String,
}

impl Default for GoldenConfig {
    fn default() -> Self {
        Self {
            base_image: default_base_image(),
            repo: default_golden_repo(),
            tag: default_golden_tag(),
            build_container: default_build_container(),
            db_name: default_golden_db(),
            build_port: default_build_port(),
            assets_dir: None,
            wp_cli_url: default_wp_cli_url(),
            title: default_golden_title(),
            admin_password: default_golden_password(),
            admin_email: default_golden_email(),
            content_dir: default_content_dir(),
            plugins: Vec::new(),
            themes: Vec::new(),
            theme_renames: Vec::new(),
            uploads_seed: None,
            seed_sql: None,
            lease_minutes: default_lease_minutes(),
        }
    }
}

impl GoldenConfig {
    /// `repo:tag` reference every site container is created from
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.repo, self.tag)
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    4000
}

fn default_store_path() -> String {
    "./data/wpdemo.db".to_string()
}

fn default_network() -> String {
    "traefik".to_string()
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_mysql_container() -> String {
    "demo-mysql".to_string()
}

fn default_mysql_host() -> String {
    "demo-mysql".to_string()
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_mysql_root_user() -> String {
    "root".to_string()
}

fn default_mysql_root_password() -> String {
    "root".to_string()
}

fn default_mysql_user_host() -> String {
    "%".to_string()
}

fn default_mysql_ready_attempts() -> u32 {
    60
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_admin_user() -> String {
    "admin".to_string()
}

fn default_site_title() -> String {
    "Demo Site".to_string()
}

fn default_site_memory() -> String {
    "1g".to_string()
}

fn default_max_id_attempts() -> u32 {
    3
}

fn default_web_root() -> String {
    "/var/www/html".to_string()
}

fn default_true() -> bool {
    true
}

fn default_https_attempts() -> u32 {
    30
}

fn default_https_timeout_ms() -> u64 {
    5000
}

fn default_login_token_file() -> String {
    "/var/www/html/wp-content/.auto-login-token".to_string()
}

fn default_http_entrypoint() -> String {
    "web".to_string()
}

fn default_https_entrypoint() -> String {
    "websecure".to_string()
}

fn default_redirect_middleware() -> String {
    "redirect-to-https@file".to_string()
}

fn default_cert_resolver() -> String {
    "letsencrypt".to_string()
}

fn default_service_port() -> u16 {
    80
}

fn default_probe_attempts() -> u32 {
    90
}

fn default_config_file() -> String {
    "/var/www/html/wp-config.php".to_string()
}

fn default_pool_target() -> usize {
    10
}

fn default_pool_min() -> usize {
    3
}

fn default_sweep_interval() -> u64 {
    3600
}

fn default_base_image() -> String {
    "wordpress:latest".to_string()
}

fn default_golden_repo() -> String {
    "wp-golden".to_string()
}

fn default_golden_tag() -> String {
    "latest".to_string()
}

fn default_build_container() -> String {
    "wp_golden".to_string()
}

fn default_golden_db() -> String {
    "wp_golden".to_string()
}

fn default_build_port() -> u16 {
    9009
}

fn default_wp_cli_url() -> String {
    "https://raw.githubusercontent.com/wp-cli/builds/gh-pages/phar/wp-cli.phar".to_string()
}

fn default_golden_title() -> String {
    "Golden Site".to_string()
}

fn default_golden_password() -> String {
    "demo".to_string()
}

fn default_golden_email() -> String {
    "admin@example.com".to_string()
}

fn default_content_dir() -> String {
    "/usr/src/wordpress/wp-content".to_string()
}

fn default_lease_minutes() -> u64 {
    60
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate a configuration document
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let suffix = self.site.domain_suffix.trim();
        if suffix.is_empty() || suffix.starts_with('.') || suffix.contains('/') {
            errors.push(format!(
                "site.domain_suffix '{}' is not a valid domain",
                self.site.domain_suffix
            ));
        }
        if self.site.memory_bytes().is_none() {
            errors.push(format!("site.memory '{}' is not a valid size", self.site.memory));
        }
        if self.site.max_id_attempts == 0 {
            errors.push("site.max_id_attempts must be at least 1".to_string());
        }
        if self.site.admin_user.trim().is_empty() {
            errors.push("site.admin_user must not be empty".to_string());
        }
        if self.probe.max_attempts == 0 {
            errors.push("probe.max_attempts must be at least 1".to_string());
        }
        if self.mysql.ready_attempts == 0 {
            errors.push("mysql.ready_attempts must be at least 1".to_string());
        }
        if self.sweeper.retention_minutes == 0 {
            errors.push("sweeper.retention_minutes must be greater than 0".to_string());
        }
        if self.sweeper.interval_secs == 0 {
            errors.push("sweeper.interval_secs must be greater than 0".to_string());
        }
        if self.pool.min_size > self.pool.target_size {
            errors.push(format!(
                "pool.min_size ({}) exceeds pool.target_size ({})",
                self.pool.min_size, self.pool.target_size
            ));
        }
        if self.golden.repo.is_empty() || self.golden.tag.is_empty() {
            errors.push("golden.repo and golden.tag must not be empty".to_string());
        }
        if matches!(&self.golden.seed_sql, Some(path) if !path.starts_with('/')) {
            errors.push("golden.seed_sql must be an absolute path inside the MySQL container".to_string());
        }
        let names = self.site.activate_plugins.iter().chain(self.site.activate_theme.iter());
        for name in names {
            if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_') {
                errors.push(format!("'{}' is not a valid plugin or theme slug", name));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[site]
domain_suffix = "demo.example.com"
probe_timeout_policy = "optimistic"

[sweeper]
retention_minutes = 60
"#;

    #[test]
    fn test_minimal_config() {
        let config = Config::from_toml(MINIMAL).unwrap();

        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.docker.network, "traefik");
        assert_eq!(config.mysql.endpoint(), "demo-mysql:3306");
        assert_eq!(config.site.admin_user, "admin");
        assert_eq!(config.site.probe_timeout_policy, ProbeTimeoutPolicy::Optimistic);
        assert_eq!(config.site.max_id_attempts, 3);
        assert_eq!(config.probe.max_attempts, 90);
        assert_eq!(config.probe.interval(), Duration::from_secs(2));
        assert_eq!(config.pool.target_size, 10);
        assert_eq!(config.pool.min_size, 3);
        assert_eq!(config.sweeper.interval(), Duration::from_secs(3600));
        assert!(config.sweeper.orphan_grace().is_none());
        assert_eq!(config.golden.image_ref(), "wp-golden:latest");
    }

    #[test]
    fn test_retention_is_required() {
        let toml = r#"
[site]
domain_suffix = "demo.example.com"
probe_timeout_policy = "rollback"

[sweeper]
interval_secs = 60
"#;
        let err = Config::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("retention_minutes"));
    }

    #[test]
    fn test_probe_timeout_policy_is_required() {
        let toml = r#"
[site]
domain_suffix = "demo.example.com"

[sweeper]
retention_minutes = 30
"#;
        let err = Config::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("probe_timeout_policy"));
    }

    #[test]
    fn test_unknown_probe_policy_rejected() {
        let toml = r#"
[site]
domain_suffix = "demo.example.com"
probe_timeout_policy = "hopeful"

[sweeper]
retention_minutes = 30
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let toml = r#"
[site]
domain_suffix = ""
probe_timeout_policy = "rollback"
memory = "lots"

[pool]
target_size = 2
min_size = 5

[sweeper]
retention_minutes = 0
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.starts_with("Configuration errors:"));
        assert!(err.contains("domain_suffix"));
        assert!(err.contains("site.memory"));
        assert!(err.contains("pool.min_size"));
        assert!(err.contains("retention_minutes"));
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
[server]
port = 8080
bind = "127.0.0.1"
pid_file = "/run/wpdemo.pid"

[store]
path = "/var/lib/wpdemo/state.db"

[mysql]
container = "mysql"
host = "mysql"
root_password = "s3cret"

[site]
domain_suffix = "tutor.localhost"
probe_timeout_policy = "rollback"
memory = "512m"
verify_https = true
activate_plugins = ["tutor", "tutor-pro"]
activate_theme = "tutorbase"

[pool]
target_size = 0
min_size = 0

[sweeper]
retention_minutes = 30
interval_secs = 600
orphan_grace_minutes = 120

[golden]
assets_dir = "/srv/backups"
plugins = ["droip.zip", "tutor.zip"]
themes = ["tutorbase.zip"]
uploads_seed = "uploads"
seed_sql = "/backups/golden.sql"

[[golden.theme_renames]]
from = "tutorbase-1.0.1"
to = "tutorbase"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.server.bind_addr(), "127.0.0.1:8080");
        assert_eq!(config.site.memory_bytes(), Some(512 * 1024 * 1024));
        assert!(config.site.verify_https);
        assert!(!config.pool.enabled());
        assert_eq!(config.sweeper.orphan_grace(), Some(chrono::Duration::minutes(120)));
        assert_eq!(config.golden.plugins.len(), 2);
        assert_eq!(config.golden.seed_sql.as_deref(), Some("/backups/golden.sql"));
        assert_eq!(config.site.activate_plugins, vec!["tutor", "tutor-pro"]);
        assert_eq!(config.site.activate_theme.as_deref(), Some("tutorbase"));
        assert_eq!(
            config.golden.theme_renames[0],
            ThemeRename {
                from: "tutorbase-1.0.1".to_string(),
                to: "tutorbase".to_string()
            }
        );
    }

    #[test]
    fn test_seed_and_activation_validated() {
        let toml = r#"
[site]
domain_suffix = "demo.example.com"
probe_timeout_policy = "rollback"
activate_plugins = ["tutor; rm -rf /"]

[sweeper]
retention_minutes = 60

[golden]
seed_sql = "backups/golden.sql"
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("golden.seed_sql"));
        assert!(err.contains("not a valid plugin or theme slug"));
    }
}
