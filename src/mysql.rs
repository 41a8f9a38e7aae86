//! Per-site MySQL databases, administered by running the `mysql` client
//! inside the engine's container.

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::MysqlConfig;
use crate::docker::{ExecCommand, ExecOutput, SharedGateway};
use crate::error::{SiteError, SiteResult};
use crate::probe::pause;

/// MySQL error number for "Can't create database; database exists"
const ER_DB_CREATE_EXISTS: &str = "1007";
/// MySQL error number for "Operation CREATE USER failed"
const ER_CANNOT_USER: &str = "1396";

pub struct DatabaseAdmin {
    gateway: SharedGateway,
    config: MysqlConfig,
}

impl DatabaseAdmin {
    pub fn new(gateway: SharedGateway, config: MysqlConfig) -> Self {
        Self { gateway, config }
    }

    /// Connection endpoint handed to site containers
    pub fn endpoint(&self) -> String {
        self.config.endpoint()
    }

    /// Statements go over stdin so generated passwords never reach the process list
    async fn run_sql(&self, sql: &str) -> SiteResult<ExecOutput> {
        let command = ExecCommand::new(["mysql".to_string(), format!("-u{}", self.config.root_user)])
            .with_env("MYSQL_PWD", &self.config.root_password)
            .with_stdin(sql);

        Ok(self.gateway.exec(&self.config.container, &command).await?)
    }

    /// One `SELECT 1` round trip
    pub async fn ping(&self) -> bool {
        match self.run_sql("SELECT 1").await {
            Ok(output) => output.success(),
            Err(e) => {
                debug!(error = %e, "MySQL ping failed");
                false
            }
        }
    }

    /// Poll until the engine answers, giving up after the configured attempts
    pub async fn wait_until_ready(&self, mut shutdown: Option<watch::Receiver<bool>>) -> SiteResult<()> {
        let attempts = self.config.ready_attempts;
        for attempt in 1..=attempts {
            if self.ping().await {
                info!(attempt, "MySQL is ready");
                return Ok(());
            }
            debug!(attempt, attempts, "Waiting for MySQL");
            if attempt < attempts {
                pause(self.config.ready_interval(), shutdown.as_mut()).await?;
            }
        }
        Err(SiteError::DatabaseNotReady { attempts })
    }

    /// Create a database and a user whose grants cover only that database
    ///
    /// A database that already exists is reported as [`SiteError::DuplicateName`]
    /// and nothing is changed.
    pub async fn create_site_database(&self, db_name: &str, db_user: &str, db_pass: &str) -> SiteResult<()> {
        check_identifier(db_name)?;
        check_identifier(db_user)?;
        check_secret(db_pass)?;

        let host = &self.config.user_host;
        let sql = format!(
            "CREATE DATABASE `{db}`; \
             CREATE USER '{user}'@'{host}' IDENTIFIED BY '{pass}'; \
             GRANT ALL PRIVILEGES ON `{db}`.* TO '{user}'@'{host}'; \
             FLUSH PRIVILEGES;",
            db = db_name,
            user = db_user,
            pass = db_pass,
        );

        let output = self.run_sql(&sql).await?;
        if output.success() {
            info!(db_name, db_user, "Created site database");
            return Ok(());
        }

        let message = output.message();
        if message.contains(ER_DB_CREATE_EXISTS) {
            return Err(SiteError::DuplicateName(db_name.to_string()));
        }
        if message.contains(ER_CANNOT_USER) {
            // database was created before the user collided; undo it
            let undo = format!("DROP DATABASE IF EXISTS `{}`;", db_name);
            if let Err(e) = self.run_sql(&undo).await {
                warn!(db_name, error = %e, "Failed to drop database after user collision");
            }
            return Err(SiteError::DuplicateName(db_user.to_string()));
        }

        Err(SiteError::CommandFailed {
            step: "create database".to_string(),
            exit_code: output.exit_code,
            output: message,
        })
    }

    /// Import a dump that lives inside the engine's container into `db_name`
    pub async fn seed_site_database(&self, db_name: &str, dump_path: &str) -> SiteResult<()> {
        check_identifier(db_name)?;

        let script = "if [ ! -f \"$SEED_DUMP\" ]; then echo \"seed dump $SEED_DUMP not found\" >&2; exit 2; fi; \
                      mysql -u\"$SEED_USER\" \"$SEED_DB\" < \"$SEED_DUMP\"";
        let command = ExecCommand::shell(script)
            .with_env("MYSQL_PWD", &self.config.root_password)
            .with_env("SEED_USER", &self.config.root_user)
            .with_env("SEED_DB", db_name)
            .with_env("SEED_DUMP", dump_path);

        let output = self.gateway.exec(&self.config.container, &command).await?;
        if !output.success() {
            return Err(SiteError::CommandFailed {
                step: "seed database".to_string(),
                exit_code: output.exit_code,
                output: output.message(),
            });
        }

        info!(db_name, dump = dump_path, "Seeded site database");
        Ok(())
    }

    /// Drop a site's database and user; both missing is success
    pub async fn drop_site_database(&self, db_name: &str, db_user: &str) -> SiteResult<()> {
        check_identifier(db_name)?;
        check_identifier(db_user)?;

        let sql = format!(
            "DROP DATABASE IF EXISTS `{db}`; DROP USER IF EXISTS '{user}'@'{host}'; FLUSH PRIVILEGES;",
            db = db_name,
            user = db_user,
            host = self.config.user_host,
        );

        let output = self.run_sql(&sql).await?;
        if !output.success() {
            return Err(SiteError::CommandFailed {
                step: "drop database".to_string(),
                exit_code: output.exit_code,
                output: output.message(),
            });
        }

        info!(db_name, db_user, "Dropped site database");
        Ok(())
    }

    /// Create a database and user if missing, resetting the user's password
    pub async fn ensure_database_user(&self, db_name: &str, db_user: &str, db_pass: &str) -> SiteResult<()> {
        check_identifier(db_name)?;
        check_identifier(db_user)?;
        check_secret(db_pass)?;

        let host = &self.config.user_host;
        let sql = format!(
            "CREATE DATABASE IF NOT EXISTS `{db}`; \
             CREATE USER IF NOT EXISTS '{user}'@'{host}' IDENTIFIED BY '{pass}'; \
             ALTER USER '{user}'@'{host}' IDENTIFIED BY '{pass}'; \
             GRANT ALL PRIVILEGES ON `{db}`.* TO '{user}'@'{host}'; \
             FLUSH PRIVILEGES;",
            db = db_name,
            user = db_user,
            pass = db_pass,
        );

        let output = self.run_sql(&sql).await?;
        if !output.success() {
            return Err(SiteError::CommandFailed {
                step: "ensure database".to_string(),
                exit_code: output.exit_code,
                output: output.message(),
            });
        }
        debug!(db_name, db_user, "Database and user in place");
        Ok(())
    }
}

/// Database and user names are interpolated into SQL, so only word characters pass
fn check_identifier(name: &str) -> SiteResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 32
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(SiteError::InvalidIdentifier(name.to_string()))
    }
}

fn check_secret(secret: &str) -> SiteResult<()> {
    if !secret.is_empty() && secret.bytes().all(|b| b.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        Err(SiteError::InvalidIdentifier("database password".to_string()))
    }
}
