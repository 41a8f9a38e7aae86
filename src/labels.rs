//! Container labels: reverse proxy routing plus the lifecycle cache the
//! sweeper and the legacy listing read back.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;

use crate::config::ProxyConfig;
use crate::site::{SiteId, SiteNames};

/// Presence of this label marks a container as ours
pub const CREATED_AT: &str = "demoserver.created_at";
pub const USERNAME: &str = "demoserver.username";
pub const DB_NAME: &str = "demoserver.dbname";
pub const DB_USER: &str = "demoserver.dbuser";
pub const SITE_ID: &str = "demoserver.site_id";

/// Full label set for a site container
pub fn site_labels(
    names: &SiteNames,
    proxy: &ProxyConfig,
    network: &str,
    username: &str,
    created_at: DateTime<Utc>,
) -> HashMap<String, String> {
    let rule = host_rule(&names.subdomain);
    let http = format!("traefik.http.routers.{}", names.http_router);
    let https = format!("traefik.http.routers.{}", names.https_router);

    let mut labels = HashMap::new();
    let mut set = |k: String, v: String| {
        labels.insert(k, v);
    };

    set("traefik.enable".into(), "true".into());
    set("traefik.docker.network".into(), network.to_string());

    set(format!("{http}.rule"), rule.clone());
    set(format!("{http}.entrypoints"), proxy.http_entrypoint.clone());
    set(format!("{http}.middlewares"), proxy.redirect_middleware.clone());

    set(format!("{https}.rule"), rule);
    set(format!("{https}.entrypoints"), proxy.https_entrypoint.clone());
    set(format!("{https}.tls"), "true".into());
    set(format!("{https}.tls.certresolver"), proxy.cert_resolver.clone());
    set(format!("{https}.service"), names.service.clone());

    set(
        format!("traefik.http.services.{}.loadbalancer.server.port", names.service),
        proxy.service_port.to_string(),
    );

    set(CREATED_AT.into(), created_at.timestamp_millis().to_string());
    set(USERNAME.into(), username.to_string());
    set(DB_NAME.into(), names.db_name.clone());
    set(DB_USER.into(), names.db_user.clone());
    set(SITE_ID.into(), names.id.to_string());

    labels
}

pub fn host_rule(host: &str) -> String {
    format!("Host(`{}`)", host)
}

/// Extract the host from a `Host(`...`)` router rule
pub fn parse_host_rule(rule: &str) -> Option<&str> {
    let start = rule.find("Host(`")? + "Host(`".len();
    let len = rule[start..].find("`)")?;
    let host = &rule[start..start + len];
    (!host.is_empty()).then_some(host)
}

/// Typed read of the lifecycle labels on a container
#[derive(Debug, Clone, PartialEq)]
pub struct LabelView {
    pub created_at: Option<DateTime<Utc>>,
    pub username: Option<String>,
    pub db_name: Option<String>,
    pub db_user: Option<String>,
    pub site_id: Option<SiteId>,
    pub host: Option<String>,
}

impl LabelView {
    pub fn read(labels: &HashMap<String, String>) -> Self {
        let created_at = labels
            .get(CREATED_AT)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        let db_name = labels.get(DB_NAME).cloned();
        let site_id = labels
            .get(SITE_ID)
            .and_then(|v| SiteId::parse(v).ok())
            .or_else(|| db_name.as_deref().and_then(SiteNames::id_from_db_name));

        // both routers carry the same rule
        let host = labels
            .iter()
            .filter(|(k, _)| k.starts_with("traefik.http.routers.") && k.ends_with(".rule"))
            .filter_map(|(_, v)| parse_host_rule(v))
            .next()
            .map(str::to_string);

        LabelView {
            created_at,
            username: labels.get(USERNAME).cloned(),
            db_name,
            db_user: labels.get(DB_USER).cloned(),
            site_id,
            host,
        }
    }

    /// Names on the container that disagree with what the identifier derives
    pub fn mismatches(&self, expected: &SiteNames) -> Vec<String> {
        let mut out = Vec::new();
        if self.db_name.as_deref() != Some(expected.db_name.as_str()) {
            out.push(format!("dbname label {:?}, expected {}", self.db_name, expected.db_name));
        }
        if self.db_user.as_deref() != Some(expected.db_user.as_str()) {
            out.push(format!("dbuser label {:?}, expected {}", self.db_user, expected.db_user));
        }
        if self.host.as_deref() != Some(expected.subdomain.as_str()) {
            out.push(format!("host rule {:?}, expected {}", self.host, expected.subdomain));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> SiteNames {
        SiteNames::derive(&SiteId::parse("abc123").unwrap(), "demo.test")
    }

    #[test]
    fn test_site_labels_route_only_own_subdomain() {
        let created = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let labels = site_labels(&names(), &ProxyConfig::default(), "traefik", "alice", created);

        assert_eq!(labels["traefik.enable"], "true");
        assert_eq!(labels["traefik.docker.network"], "traefik");
        assert_eq!(labels["traefik.http.routers.abc123.rule"], "Host(`abc123.demo.test`)");
        assert_eq!(labels["traefik.http.routers.abc123.entrypoints"], "web");
        assert_eq!(
            labels["traefik.http.routers.abc123.middlewares"],
            "redirect-to-https@file"
        );
        assert_eq!(
            labels["traefik.http.routers.abc123-secure.rule"],
            "Host(`abc123.demo.test`)"
        );
        assert_eq!(labels["traefik.http.routers.abc123-secure.entrypoints"], "websecure");
        assert_eq!(labels["traefik.http.routers.abc123-secure.tls"], "true");
        assert_eq!(
            labels["traefik.http.routers.abc123-secure.tls.certresolver"],
            "letsencrypt"
        );
        assert_eq!(labels["traefik.http.routers.abc123-secure.service"], "abc123");
        assert_eq!(
            labels["traefik.http.services.abc123.loadbalancer.server.port"],
            "80"
        );
        assert_eq!(labels[CREATED_AT], "1700000000000");
        assert_eq!(labels[USERNAME], "alice");
        assert_eq!(labels[DB_NAME], "wp_abc123");
        assert_eq!(labels[DB_USER], "user_abc123");
        assert_eq!(labels[SITE_ID], "abc123");

        let rules: Vec<_> = labels.iter().filter(|(k, _)| k.ends_with(".rule")).collect();
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(|(_, v)| v.as_str() == "Host(`abc123.demo.test`)"));
    }

    #[test]
    fn test_parse_host_rule() {
        assert_eq!(parse_host_rule("Host(`abc123.demo.test`)"), Some("abc123.demo.test"));
        assert_eq!(
            parse_host_rule("Host(`a.b`) && PathPrefix(`/x`)"),
            Some("a.b")
        );
        assert_eq!(parse_host_rule("Host(``)"), None);
        assert_eq!(parse_host_rule("PathPrefix(`/x`)"), None);
    }

    #[test]
    fn test_label_view_reads_back() {
        let created = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let labels = site_labels(&names(), &ProxyConfig::default(), "traefik", "alice", created);
        let view = LabelView::read(&labels);

        assert_eq!(view.created_at, Some(created));
        assert_eq!(view.username.as_deref(), Some("alice"));
        assert_eq!(view.site_id, Some(SiteId::parse("abc123").unwrap()));
        assert_eq!(view.host.as_deref(), Some("abc123.demo.test"));
        assert!(view.mismatches(&names()).is_empty());
    }

    #[test]
    fn test_label_view_legacy_container() {
        let mut labels = HashMap::new();
        labels.insert(CREATED_AT.to_string(), "not-a-number".to_string());
        labels.insert(DB_NAME.to_string(), "wp_zz99aa".to_string());
        labels.insert(
            "traefik.http.routers.zz99aa.rule".to_string(),
            "Host(`other.demo.test`)".to_string(),
        );

        let view = LabelView::read(&labels);
        assert_eq!(view.created_at, None);
        assert_eq!(view.site_id, Some(SiteId::parse("zz99aa").unwrap()));

        let expected = SiteNames::derive(&SiteId::parse("zz99aa").unwrap(), "demo.test");
        let mismatches = view.mismatches(&expected);
        assert_eq!(mismatches.len(), 2);
        assert!(mismatches.iter().any(|m| m.contains("dbuser")));
        assert!(mismatches.iter().any(|m| m.contains("host rule")));
    }
}
