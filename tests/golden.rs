//! Golden image builds against the fake runtime

mod common;

use chrono::{Duration, Utc};

use common::{harness, test_config, Harness, BASE_IMAGE, MYSQL_CONTAINER};
use wpdemo::config::Config;
use wpdemo::error::SiteError;
use wpdemo::golden::{BuildOutcome, LEASE_NAME};
use wpdemo::tasks::{TaskKind, TaskState};

/// Harness whose runtime has no golden image yet but can pull the base image
fn unbuilt(config: &Config) -> Harness {
    let h = harness(config);
    h.gateway.remove_image(&config.golden.image_ref());
    h.gateway.allow_pull(BASE_IMAGE);
    h
}

#[tokio::test]
async fn test_existing_image_short_circuits() {
    let h = harness(&test_config("rollback"));

    let outcome = h.services.golden.ensure().await.unwrap();

    assert_eq!(outcome, BuildOutcome::AlreadyPresent);
    assert!(h.gateway.container_names().is_empty());
    assert!(h.services.tasks.state(TaskKind::GoldenImage).is_none());
}

#[tokio::test]
async fn test_builds_and_commits_golden_image() {
    let config = test_config("rollback");
    let h = unbuilt(&config);

    let outcome = h.services.golden.ensure().await.unwrap();

    assert!(matches!(outcome, BuildOutcome::Built { .. }));
    assert!(h.gateway.has_image("wp-golden:latest"));
    assert!(h.gateway.has_image(BASE_IMAGE));
    assert!(h.gateway.has_database("wp_golden"));
    assert!(h.gateway.has_user("user_golden"));
    // build container is always removed
    assert!(h.gateway.container("wp_golden").is_none());

    let scripts = h.gateway.execs_in("wp_golden").join("\n");
    assert!(scripts.contains("curl -fsSL -o /usr/local/bin/wp"));
    assert!(scripts.contains("wp core install"));
    assert!(scripts.contains("--url=http://localhost:9009"));
    // no assets directory configured
    assert!(!scripts.contains("unzip"));

    assert!(matches!(
        h.services.tasks.state(TaskKind::GoldenImage),
        Some(TaskState::Succeeded { .. })
    ));
    assert!(h.services.db.get_lease(LEASE_NAME).unwrap().is_none());

    // sites can be created from it now
    let site = h.services.orchestrator.create_site(None).await.unwrap();
    assert_eq!(h.gateway.container(&site.db).unwrap().image, "wp-golden:latest");
}

#[tokio::test]
async fn test_assets_unpacked_when_mounted() {
    let mut config = test_config("rollback");
    config.golden.assets_dir = Some("/srv/demo-assets".to_string());
    config.golden.plugins = vec!["tutor.zip".to_string()];
    config.golden.themes = vec!["tutorbase-1.0.1.zip".to_string()];
    let h = unbuilt(&config);

    h.services.golden.ensure().await.unwrap();

    let scripts = h.gateway.execs_in("wp_golden");
    assert!(scripts.iter().any(|s| s == "test -d /backups"));
    let joined = scripts.join("\n");
    assert!(joined.contains("unzip"));
    assert!(joined.contains("tutor.zip"));
    assert!(joined.contains("tutorbase-1.0.1.zip"));
}

#[tokio::test]
async fn test_database_not_ready_fails_build() {
    let config = test_config("rollback");
    let h = unbuilt(&config);
    h.gateway.set_mysql_ready(false);

    let err = h.services.golden.ensure().await.unwrap_err();

    assert!(matches!(err, SiteError::DatabaseNotReady { attempts: 3 }));
    assert!(!h.gateway.has_image("wp-golden:latest"));
    match h.services.tasks.state(TaskKind::GoldenImage) {
        Some(TaskState::Failed { error, .. }) => assert!(error.contains("not ready")),
        other => panic!("unexpected task state {other:?}"),
    }
    assert!(h.services.db.get_lease(LEASE_NAME).unwrap().is_none());
}

#[tokio::test]
async fn test_commit_without_image_id_is_fatal() {
    let config = test_config("rollback");
    let h = unbuilt(&config);
    h.gateway.commit_without_id();

    let err = h.services.golden.ensure().await.unwrap_err();

    assert!(matches!(err, SiteError::CommitProducedNoImage(_)));
    assert!(h.gateway.container("wp_golden").is_none());
}

#[tokio::test]
async fn test_unpullable_base_image() {
    let config = test_config("rollback");
    let h = harness(&config);
    h.gateway.remove_image(&config.golden.image_ref());

    let err = h.services.golden.ensure().await.unwrap_err();

    assert!(matches!(err, SiteError::ImageMissing(ref image) if image == BASE_IMAGE));
}

#[tokio::test]
async fn test_failed_install_step_removes_build_container() {
    let config = test_config("rollback");
    let h = unbuilt(&config);
    h.gateway.fail_commands_containing("curl -fsSL");

    let err = h.services.golden.ensure().await.unwrap_err();

    match err.root() {
        SiteError::CommandFailed { step, .. } => assert_eq!(step, "install wp-cli"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(h.gateway.container("wp_golden").is_none());
}

#[tokio::test]
async fn test_lease_held_elsewhere_skips_build() {
    let config = test_config("rollback");
    let h = unbuilt(&config);
    assert!(h
        .services
        .db
        .acquire_lease(LEASE_NAME, "another-host", Duration::minutes(60), Utc::now())
        .unwrap());

    let outcome = h.services.golden.ensure().await.unwrap();

    assert_eq!(outcome, BuildOutcome::Skipped);
    assert!(h.gateway.execs_in(MYSQL_CONTAINER).is_empty());
    assert!(!h.gateway.has_image("wp-golden:latest"));
}

#[tokio::test]
async fn test_concurrent_ensure_builds_once() {
    let config = test_config("rollback");
    let h = unbuilt(&config);

    let first = h.services.golden.clone().spawn();
    let second = h.services.golden.clone().spawn();
    let outcomes = [first.await.unwrap().unwrap(), second.await.unwrap().unwrap()];

    let built = outcomes
        .iter()
        .filter(|o| matches!(o, BuildOutcome::Built { .. }))
        .count();
    assert_eq!(built, 1);
    assert!(h.gateway.has_image("wp-golden:latest"));
}
