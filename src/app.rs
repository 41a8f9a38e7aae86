//! Wiring of the long-lived services

use std::sync::Arc;
use tokio::sync::watch;

use crate::api::DemoApi;
use crate::config::Config;
use crate::db::Database;
use crate::docker::SharedGateway;
use crate::golden::GoldenImageBuilder;
use crate::mysql::DatabaseAdmin;
use crate::orchestrator::SiteOrchestrator;
use crate::pool::SitePool;
use crate::sweeper::Sweeper;
use crate::tasks::TaskRegistry;

/// Every service, sharing one gateway, store and shutdown channel
pub struct Services {
    pub db: Arc<Database>,
    pub tasks: Arc<TaskRegistry>,
    pub mysql: Arc<DatabaseAdmin>,
    pub sweeper: Arc<Sweeper>,
    pub orchestrator: Arc<SiteOrchestrator>,
    pub pool: Arc<SitePool>,
    pub golden: Arc<GoldenImageBuilder>,
    pub api: Arc<DemoApi>,
}

impl Services {
    pub fn new(
        gateway: SharedGateway,
        db: Database,
        config: &Config,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let db = Arc::new(db);
        let tasks = TaskRegistry::new();
        let mysql = Arc::new(DatabaseAdmin::new(gateway.clone(), config.mysql.clone()));

        let sweeper = Arc::new(Sweeper::new(gateway.clone(), db.clone(), mysql.clone(), config));

        let orchestrator = Arc::new(
            SiteOrchestrator::new(gateway.clone(), db.clone(), mysql.clone(), sweeper.clone(), config)
                .with_shutdown(shutdown_rx.clone()),
        );

        let pool = Arc::new(
            SitePool::new(orchestrator.clone(), db.clone(), tasks.clone(), config.pool.clone())
                .with_shutdown(shutdown_rx.clone()),
        );

        let golden = Arc::new(
            GoldenImageBuilder::new(gateway, db.clone(), mysql.clone(), tasks.clone(), config)
                .with_shutdown(shutdown_rx.clone()),
        );

        let api = Arc::new(DemoApi::new(
            orchestrator.clone(),
            pool.clone(),
            tasks.clone(),
            shutdown_rx,
        ));

        Self {
            db,
            tasks,
            mysql,
            sweeper,
            orchestrator,
            pool,
            golden,
            api,
        }
    }
}
