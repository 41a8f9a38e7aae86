//! SQLite store for site state
//!
//! The `sites` table holds sites handed to a requester, `sitepool` holds
//! pre-provisioned sites waiting for one. A site lives in exactly one of the
//! two; moving it is a single transaction. `leases` records long-running
//! singleton work so that a second process generation does not repeat it.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info};

use crate::site::SiteStatus;

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

const SITE_COLUMNS: &str = "site_id, containerid, siteurl, user, password, db_name, db_user, \
                            db_pass, owner, status, created_at";

/// Which table a site row lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    Sites,
    Pool,
}

impl Partition {
    fn table(&self) -> &'static str {
        match self {
            Partition::Sites => "sites",
            Partition::Pool => "sitepool",
        }
    }
}

/// Site row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiteRecord {
    pub site_id: String,
    pub container_id: Option<String>,
    pub site_url: String,
    pub admin_user: String,
    pub admin_password: String,
    pub db_name: String,
    pub db_user: String,
    pub db_pass: String,
    pub owner: Option<String>,
    pub status: SiteStatus,
    pub created_at: DateTime<Utc>,
}

impl SiteRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get(9)?;
        Ok(SiteRecord {
            site_id: row.get(0)?,
            container_id: row.get(1)?,
            site_url: row.get(2)?,
            admin_user: row.get(3)?,
            admin_password: row.get(4)?,
            db_name: row.get(5)?,
            db_user: row.get(6)?,
            db_pass: row.get(7)?,
            owner: row.get(8)?,
            status: SiteStatus::parse(&status).ok_or_else(|| {
                rusqlite::Error::InvalidColumnType(9, "status".into(), rusqlite::types::Type::Text)
            })?,
            created_at: row.get(10)?,
        })
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }
}

/// Persisted marker for singleton work
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaseRecord {
    pub name: String,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }

            if current_version < 2 {
                Self::migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: site tables
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: sites and sitepool");

        let mut sql = String::new();
        for table in ["sites", "sitepool"] {
            sql.push_str(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    site_id TEXT NOT NULL UNIQUE,
                    containerid TEXT,
                    siteurl TEXT NOT NULL,
                    user TEXT NOT NULL,
                    password TEXT NOT NULL,
                    db_name TEXT NOT NULL UNIQUE,
                    db_user TEXT NOT NULL,
                    db_pass TEXT NOT NULL,
                    owner TEXT,
                    status TEXT NOT NULL DEFAULT 'provisioning',
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_created ON {table}(created_at);
                "#
            ));
        }
        sql.push_str("INSERT INTO schema_migrations (version) VALUES (1);");

        conn.execute_batch(&sql)?;
        Ok(())
    }

    /// Migration v2: leases for singleton background work
    fn migrate_v2(conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: leases");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS leases (
                name TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );

            INSERT INTO schema_migrations (version) VALUES (2);
            "#,
        )?;
        Ok(())
    }

    // ==================== Site Operations ====================

    /// Claim a site identifier by inserting its row
    ///
    /// Returns false when the identifier or database name is already taken
    /// in either table.
    pub fn claim_site(&self, partition: Partition, site: &SiteRecord) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let taken: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM sites WHERE site_id = ?1 OR db_name = ?2)
                 OR EXISTS(SELECT 1 FROM sitepool WHERE site_id = ?1 OR db_name = ?2)",
            params![site.site_id, site.db_name],
            |row| row.get(0),
        )?;
        if taken {
            return Ok(false);
        }

        tx.execute(
            &format!(
                "INSERT INTO {} ({SITE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                partition.table()
            ),
            params![
                site.site_id,
                site.container_id,
                site.site_url,
                site.admin_user,
                site.admin_password,
                site.db_name,
                site.db_user,
                site.db_pass,
                site.owner,
                site.status.as_str(),
                site.created_at,
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn get_site(&self, partition: Partition, site_id: &str) -> Result<Option<SiteRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {SITE_COLUMNS} FROM {} WHERE site_id = ?1", partition.table()),
            params![site_id],
            SiteRecord::from_row,
        )
        .optional()
        .context("Failed to get site")
    }

    /// Find a site in either table by its database name
    pub fn find_by_db_name(&self, db_name: &str) -> Result<Option<(Partition, SiteRecord)>> {
        let conn = self.conn.lock();
        for partition in [Partition::Sites, Partition::Pool] {
            let found = conn
                .query_row(
                    &format!("SELECT {SITE_COLUMNS} FROM {} WHERE db_name = ?1", partition.table()),
                    params![db_name],
                    SiteRecord::from_row,
                )
                .optional()
                .context("Failed to look up site by database name")?;
            if let Some(site) = found {
                return Ok(Some((partition, site)));
            }
        }
        Ok(None)
    }

    /// All rows in a table, newest first
    pub fn list_sites(&self, partition: Partition) -> Result<Vec<SiteRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SITE_COLUMNS} FROM {} ORDER BY created_at DESC, id DESC",
            partition.table()
        ))?;

        let sites = stmt
            .query_map([], SiteRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(sites)
    }

    pub fn set_container_id(&self, partition: Partition, site_id: &str, container_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!("UPDATE {} SET containerid = ?1 WHERE site_id = ?2", partition.table()),
            params![container_id, site_id],
        )?;
        Ok(())
    }

    pub fn set_status(&self, partition: Partition, site_id: &str, status: SiteStatus) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            &format!("UPDATE {} SET status = ?1 WHERE site_id = ?2", partition.table()),
            params![status.as_str(), site_id],
        )?;
        Ok(rows > 0)
    }

    pub fn delete_site(&self, partition: Partition, site_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            &format!("DELETE FROM {} WHERE site_id = ?1", partition.table()),
            params![site_id],
        )?;
        Ok(rows > 0)
    }

    /// Number of pool entries ready to hand out
    pub fn pool_size(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sitepool WHERE status = 'ready'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Move the oldest ready pool entry into `sites`
    ///
    /// The entry is handed to `owner` with status `allocated`, and its
    /// `created_at` restarts at `now`. Both tables change in one transaction,
    /// so an entry can be taken at most once.
    pub fn take_pool_entry(&self, owner: Option<&str>, now: DateTime<Utc>) -> Result<Option<SiteRecord>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let entry = tx
            .query_row(
                &format!(
                    "SELECT {SITE_COLUMNS} FROM sitepool WHERE status = 'ready'
                     ORDER BY created_at ASC, id ASC LIMIT 1"
                ),
                [],
                SiteRecord::from_row,
            )
            .optional()?;

        let Some(mut site) = entry else {
            return Ok(None);
        };

        tx.execute("DELETE FROM sitepool WHERE site_id = ?1", params![site.site_id])?;

        site.owner = owner.map(str::to_string);
        site.status = SiteStatus::Allocated;
        site.created_at = now;

        tx.execute(
            &format!("INSERT INTO sites ({SITE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
            params![
                site.site_id,
                site.container_id,
                site.site_url,
                site.admin_user,
                site.admin_password,
                site.db_name,
                site.db_user,
                site.db_pass,
                site.owner,
                site.status.as_str(),
                site.created_at,
            ],
        )?;
        tx.commit()?;

        debug!(site_id = %site.site_id, "Moved pool entry to sites");
        Ok(Some(site))
    }

    // ==================== Lease Operations ====================

    /// Take the named lease unless someone else holds an unexpired one
    pub fn acquire_lease(&self, name: &str, holder: &str, ttl: Duration, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = tx
            .query_row(
                "SELECT holder, expires_at FROM leases WHERE name = ?1",
                params![name],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, DateTime<Utc>>(1)?)),
            )
            .optional()?;

        if let Some((current_holder, expires_at)) = current {
            if current_holder != holder && expires_at > now {
                return Ok(false);
            }
        }

        tx.execute(
            "INSERT INTO leases (name, holder, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at",
            params![name, holder, now + ttl],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn release_lease(&self, name: &str, holder: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM leases WHERE name = ?1 AND holder = ?2",
            params![name, holder],
        )?;
        Ok(rows > 0)
    }

    pub fn get_lease(&self, name: &str) -> Result<Option<LeaseRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT name, holder, expires_at FROM leases WHERE name = ?1",
            params![name],
            |row| {
                Ok(LeaseRecord {
                    name: row.get(0)?,
                    holder: row.get(1)?,
                    expires_at: row.get(2)?,
                })
            },
        )
        .optional()
        .context("Failed to get lease")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(site_id: &str, status: SiteStatus, created_at: DateTime<Utc>) -> SiteRecord {
        SiteRecord {
            site_id: site_id.to_string(),
            container_id: None,
            site_url: format!("https://{}.demo.test", site_id),
            admin_user: "admin".to_string(),
            admin_password: "adminpw".to_string(),
            db_name: format!("wp_{}", site_id),
            db_user: format!("user_{}", site_id),
            db_pass: "dbpw".to_string(),
            owner: None,
            status,
            created_at,
        }
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, minute, 0).unwrap()
    }

    #[test]
    fn test_claim_and_get_site() {
        let db = Database::open_in_memory().unwrap();
        let site = record("abc123", SiteStatus::Provisioning, at(0));

        assert!(db.claim_site(Partition::Sites, &site).unwrap());

        let retrieved = db.get_site(Partition::Sites, "abc123").unwrap().unwrap();
        assert_eq!(retrieved, site);
        assert!(db.get_site(Partition::Pool, "abc123").unwrap().is_none());
    }

    #[test]
    fn test_claim_rejects_identifier_used_in_other_table() {
        let db = Database::open_in_memory().unwrap();

        assert!(db.claim_site(Partition::Pool, &record("abc123", SiteStatus::Ready, at(0))).unwrap());
        assert!(!db.claim_site(Partition::Sites, &record("abc123", SiteStatus::Provisioning, at(1))).unwrap());
        assert!(!db.claim_site(Partition::Pool, &record("abc123", SiteStatus::Provisioning, at(1))).unwrap());
    }

    #[test]
    fn test_list_sites_newest_first() {
        let db = Database::open_in_memory().unwrap();
        for (id, minute) in [("aaa111", 5), ("bbb222", 30), ("ccc333", 10)] {
            db.claim_site(Partition::Sites, &record(id, SiteStatus::Ready, at(minute)))
                .unwrap();
        }

        let ids: Vec<_> = db
            .list_sites(Partition::Sites)
            .unwrap()
            .into_iter()
            .map(|s| s.site_id)
            .collect();
        assert_eq!(ids, vec!["bbb222", "ccc333", "aaa111"]);
    }

    #[test]
    fn test_status_and_container_updates() {
        let db = Database::open_in_memory().unwrap();
        db.claim_site(Partition::Sites, &record("abc123", SiteStatus::Provisioning, at(0)))
            .unwrap();

        db.set_container_id(Partition::Sites, "abc123", "deadbeef").unwrap();
        assert!(db.set_status(Partition::Sites, "abc123", SiteStatus::Ready).unwrap());
        assert!(!db.set_status(Partition::Sites, "zzz999", SiteStatus::Ready).unwrap());

        let site = db.get_site(Partition::Sites, "abc123").unwrap().unwrap();
        assert_eq!(site.container_id.as_deref(), Some("deadbeef"));
        assert_eq!(site.status, SiteStatus::Ready);

        assert!(db.delete_site(Partition::Sites, "abc123").unwrap());
        assert!(!db.delete_site(Partition::Sites, "abc123").unwrap());
    }

    #[test]
    fn test_find_by_db_name_searches_both_tables() {
        let db = Database::open_in_memory().unwrap();
        db.claim_site(Partition::Pool, &record("pool01", SiteStatus::Ready, at(0))).unwrap();
        db.claim_site(Partition::Sites, &record("site01", SiteStatus::Ready, at(0))).unwrap();

        let (partition, site) = db.find_by_db_name("wp_pool01").unwrap().unwrap();
        assert_eq!(partition, Partition::Pool);
        assert_eq!(site.site_id, "pool01");

        let (partition, _) = db.find_by_db_name("wp_site01").unwrap().unwrap();
        assert_eq!(partition, Partition::Sites);

        assert!(db.find_by_db_name("wp_nobody").unwrap().is_none());
    }

    #[test]
    fn test_take_pool_entry_moves_oldest_ready() {
        let db = Database::open_in_memory().unwrap();
        db.claim_site(Partition::Pool, &record("newer1", SiteStatus::Ready, at(20))).unwrap();
        db.claim_site(Partition::Pool, &record("older1", SiteStatus::Ready, at(10))).unwrap();
        db.claim_site(Partition::Pool, &record("build1", SiteStatus::Provisioning, at(0)))
            .unwrap();
        assert_eq!(db.pool_size().unwrap(), 2);

        let taken = db.take_pool_entry(Some("alice"), at(45)).unwrap().unwrap();
        assert_eq!(taken.site_id, "older1");
        assert_eq!(taken.status, SiteStatus::Allocated);
        assert_eq!(taken.owner.as_deref(), Some("alice"));
        assert_eq!(taken.created_at, at(45));

        assert!(db.get_site(Partition::Pool, "older1").unwrap().is_none());
        assert_eq!(db.get_site(Partition::Sites, "older1").unwrap().unwrap(), taken);
        assert_eq!(db.pool_size().unwrap(), 1);

        let second = db.take_pool_entry(None, at(46)).unwrap().unwrap();
        assert_eq!(second.site_id, "newer1");

        // only a provisioning entry is left
        assert!(db.take_pool_entry(None, at(47)).unwrap().is_none());
    }

    #[test]
    fn test_lease_excludes_other_holders_until_expiry() {
        let db = Database::open_in_memory().unwrap();
        let ttl = Duration::minutes(30);

        assert!(db.acquire_lease("golden-image", "gen-a", ttl, at(0)).unwrap());
        assert!(db.acquire_lease("golden-image", "gen-a", ttl, at(1)).unwrap());
        assert!(!db.acquire_lease("golden-image", "gen-b", ttl, at(10)).unwrap());

        // gen-a died; its lease ran out
        assert!(db.acquire_lease("golden-image", "gen-b", ttl, at(40)).unwrap());
        assert_eq!(db.get_lease("golden-image").unwrap().unwrap().holder, "gen-b");

        assert!(!db.release_lease("golden-image", "gen-a").unwrap());
        assert!(db.release_lease("golden-image", "gen-b").unwrap());
        assert!(db.get_lease("golden-image").unwrap().is_none());
    }

    #[test]
    fn test_reopen_file_database_keeps_rows() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state").join("wpdemo.db");

        {
            let db = Database::open(&path).unwrap();
            db.claim_site(Partition::Sites, &record("abc123", SiteStatus::Ready, at(0)))
                .unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert!(db.get_site(Partition::Sites, "abc123").unwrap().is_some());
    }
}
