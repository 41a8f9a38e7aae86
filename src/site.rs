//! Site identity and the names derived from it

use chrono::{DateTime, Utc};
use rand::distributions::{Alphanumeric, Distribution, Uniform};
use rand::Rng;
use serde::Serialize;
use std::fmt;

use crate::error::SiteError;

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
pub const ID_LEN: usize = 6;

const DB_PASSWORD_LEN: usize = 16;
const ADMIN_PASSWORD_LEN: usize = 14;

/// Short random identifier a site is addressed by
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SiteId(String);

impl SiteId {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let dist = Uniform::from(0..ID_ALPHABET.len());
        let id = (0..ID_LEN)
            .map(|_| ID_ALPHABET[dist.sample(&mut rng)] as char)
            .collect();
        SiteId(id)
    }

    /// Accept an identifier from outside (API paths, labels)
    pub fn parse(raw: &str) -> Result<Self, SiteError> {
        let valid = raw.len() == ID_LEN
            && raw.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
        if valid {
            Ok(SiteId(raw.to_string()))
        } else {
            Err(SiteError::InvalidIdentifier(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Every name a site uses, all pure functions of its identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteNames {
    pub id: SiteId,
    pub container: String,
    pub db_name: String,
    pub db_user: String,
    pub subdomain: String,
    pub url: String,
    pub http_router: String,
    pub https_router: String,
    pub service: String,
}

impl SiteNames {
    pub fn derive(id: &SiteId, domain_suffix: &str) -> Self {
        let subdomain = format!("{}.{}", id, domain_suffix.trim_matches('.'));
        SiteNames {
            container: format!("wp_{}", id),
            db_name: format!("wp_{}", id),
            db_user: format!("user_{}", id),
            url: format!("https://{}", subdomain),
            subdomain,
            http_router: id.to_string(),
            https_router: format!("{}-secure", id),
            service: id.to_string(),
            id: id.clone(),
        }
    }

    /// Recover the identifier from a `wp_<id>` database name
    pub fn id_from_db_name(db_name: &str) -> Option<SiteId> {
        db_name
            .strip_prefix("wp_")
            .and_then(|raw| SiteId::parse(raw).ok())
    }
}

/// Credentials generated once when a site is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteCredentials {
    pub admin_user: String,
    pub admin_password: String,
    pub db_password: String,
}

impl SiteCredentials {
    pub fn generate(admin_user: &str) -> Self {
        SiteCredentials {
            admin_user: admin_user.to_string(),
            admin_password: random_secret(ADMIN_PASSWORD_LEN),
            db_password: random_secret(DB_PASSWORD_LEN),
        }
    }
}

/// Alphanumeric secret, safe to embed in SQL string literals and shell words
pub fn random_secret(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Where a site stands in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteStatus {
    Provisioning,
    Ready,
    Allocated,
    Expired,
    Reclaiming,
}

impl SiteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteStatus::Provisioning => "provisioning",
            SiteStatus::Ready => "ready",
            SiteStatus::Allocated => "allocated",
            SiteStatus::Expired => "expired",
            SiteStatus::Reclaiming => "reclaiming",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "provisioning" => Some(SiteStatus::Provisioning),
            "ready" => Some(SiteStatus::Ready),
            "allocated" => Some(SiteStatus::Allocated),
            "expired" => Some(SiteStatus::Expired),
            "reclaiming" => Some(SiteStatus::Reclaiming),
            _ => None,
        }
    }
}

impl fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a caller gets back for a site
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SiteDescriptor {
    pub id: String,
    pub url: String,
    /// Who the site was created for
    pub username: Option<String>,
    pub admin_user: String,
    pub admin_pass: String,
    pub db: String,
    pub db_user: String,
    pub db_pass: String,
    pub status: SiteStatus,
    pub created_at: DateTime<Utc>,
    /// Set when the readiness probe gave up and the site was handed out anyway
    pub may_not_be_ready: bool,
    pub from_pool: bool,
}
