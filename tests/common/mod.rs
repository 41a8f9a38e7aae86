//! In-memory container runtime for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use wpdemo::app::Services;
use wpdemo::config::Config;
use wpdemo::db::Database;
use wpdemo::docker::{
    ContainerDetails, ContainerSpec, ContainerSummary, ExecCommand, ExecOutput, GatewayError, GatewayResult,
    RuntimeGateway, SharedGateway,
};

pub const MYSQL_CONTAINER: &str = "demo-mysql";
pub const GOLDEN_IMAGE: &str = "wp-golden:latest";
pub const BASE_IMAGE: &str = "wordpress:latest";
pub const DOMAIN: &str = "demo.example.com";

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub binds: Vec<String>,
    pub volumes: Vec<String>,
    pub running: bool,
    pub installed: bool,
}

impl FakeContainer {
    pub fn env_value(&self, key: &str) -> Option<String> {
        let prefix = format!("{}=", key);
        self.env
            .iter()
            .find_map(|kv| kv.strip_prefix(&prefix).map(str::to_string))
    }
}

/// One exec as the runtime saw it
#[derive(Debug, Clone)]
pub struct ExecRecord {
    /// Container name, or the name or id passed if unknown
    pub container: String,
    /// What ran: stdin if any, the shell script or joined argv otherwise
    pub script: String,
    /// The command line visible in the process list
    pub argv: String,
    pub env: Vec<String>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    containers: HashMap<String, FakeContainer>,
    images: HashSet<String>,
    pullable: HashSet<String>,
    volumes: HashSet<String>,
    networks: HashSet<String>,
    databases: HashSet<String>,
    users: HashSet<String>,
    exec_log: Vec<ExecRecord>,
    login_tokens: HashMap<String, String>,
    /// Files present inside the MySQL container
    mysql_files: HashSet<String>,
    /// Databases a dump was imported into
    seeded: HashSet<String>,

    mysql_ready: bool,
    /// `wp core is-installed` never passes
    never_installed: bool,
    /// Exec scripts containing any of these fail with exit code 1
    failing: Vec<String>,
    /// Next N database creations report error 1007
    forced_collisions: u32,
    /// Next container creation finds its name taken by an unrelated container
    occupy_next_name: bool,
    commit_without_id: bool,
}

/// Scripted stand-in for the Docker daemon and the MySQL container
pub struct FakeGateway {
    state: Mutex<State>,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        let state = State {
            mysql_ready: true,
            ..Default::default()
        };
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }

    pub fn add_image(&self, image: &str) {
        self.state.lock().images.insert(image.to_string());
    }

    pub fn remove_image(&self, image: &str) {
        self.state.lock().images.remove(image);
    }

    pub fn allow_pull(&self, image: &str) {
        self.state.lock().pullable.insert(image.to_string());
    }

    pub fn set_mysql_ready(&self, ready: bool) {
        self.state.lock().mysql_ready = ready;
    }

    pub fn set_never_installed(&self, never: bool) {
        self.state.lock().never_installed = never;
    }

    pub fn fail_commands_containing(&self, needle: &str) {
        self.state.lock().failing.push(needle.to_string());
    }

    pub fn force_database_collisions(&self, count: u32) {
        self.state.lock().forced_collisions = count;
    }

    pub fn occupy_next_container_name(&self) {
        self.state.lock().occupy_next_name = true;
    }

    pub fn add_mysql_file(&self, path: &str) {
        self.state.lock().mysql_files.insert(path.to_string());
    }

    pub fn is_seeded(&self, db_name: &str) -> bool {
        self.state.lock().seeded.contains(db_name)
    }

    pub fn commit_without_id(&self) {
        self.state.lock().commit_without_id = true;
    }

    pub fn set_login_token(&self, container: &str, content: &str) {
        self.state
            .lock()
            .login_tokens
            .insert(container.to_string(), content.to_string());
    }

    pub fn add_database(&self, name: &str) {
        self.state.lock().databases.insert(name.to_string());
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.state.lock().images.contains(image)
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.state.lock().databases.contains(name)
    }

    pub fn has_user(&self, name: &str) -> bool {
        self.state.lock().users.contains(name)
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.state.lock().volumes.contains(name)
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.state.lock().networks.contains(name)
    }

    pub fn container(&self, name_or_id: &str) -> Option<FakeContainer> {
        let state = self.state.lock();
        find(&state, name_or_id).cloned()
    }

    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .state
            .lock()
            .containers
            .values()
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Scripts run in `container`, in order
    pub fn execs_in(&self, container: &str) -> Vec<String> {
        self.exec_records(container).into_iter().map(|e| e.script).collect()
    }

    /// Command lines run in `container`, in order
    pub fn argvs_in(&self, container: &str) -> Vec<String> {
        self.exec_records(container).into_iter().map(|e| e.argv).collect()
    }

    pub fn exec_records(&self, container: &str) -> Vec<ExecRecord> {
        self.state
            .lock()
            .exec_log
            .iter()
            .filter(|e| e.container == container)
            .cloned()
            .collect()
    }

    /// Place a labelled container directly, bypassing the orchestrator
    pub fn insert_container(&self, name: &str, labels: HashMap<String, String>) -> String {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("{:012x}", state.next_id);
        let volume = format!("{}_data", name);
        state.volumes.insert(volume.clone());
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: name.to_string(),
                image: GOLDEN_IMAGE.to_string(),
                env: Vec::new(),
                labels,
                binds: Vec::new(),
                volumes: vec![volume],
                running: true,
                installed: true,
            },
        );
        id
    }

    pub fn shared(self: &Arc<Self>) -> SharedGateway {
        self.clone()
    }
}

fn find<'a>(state: &'a State, name_or_id: &str) -> Option<&'a FakeContainer> {
    state
        .containers
        .get(name_or_id)
        .or_else(|| state.containers.values().find(|c| c.name == name_or_id))
}

fn find_id(state: &State, name_or_id: &str) -> Option<String> {
    find(state, name_or_id).map(|c| c.id.clone())
}

fn between<'a>(s: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = s.find(start)? + start.len();
    let len = s[from..].find(end)?;
    Some(&s[from..from + len])
}

fn exit(code: i64, stderr: &str) -> ExecOutput {
    ExecOutput {
        exit_code: code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

fn ok(stdout: &str) -> ExecOutput {
    ExecOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn run_sql(state: &mut State, sql: &str) -> ExecOutput {
    if !state.mysql_ready {
        return exit(1, "ERROR 2002 (HY000): Can't connect to local MySQL server");
    }

    if sql.starts_with("SELECT 1") {
        return ok("1\n1\n");
    }

    if sql.starts_with("CREATE DATABASE IF NOT EXISTS") {
        if let Some(db) = between(sql, "`", "`") {
            state.databases.insert(db.to_string());
        }
        if let Some(user) = between(sql, "CREATE USER IF NOT EXISTS '", "'@") {
            state.users.insert(user.to_string());
        }
        return ok("");
    }

    if sql.starts_with("CREATE DATABASE") {
        let Some(db) = between(sql, "`", "`").map(str::to_string) else {
            return exit(1, "ERROR 1064 (42000): syntax error");
        };
        if state.forced_collisions > 0 || state.databases.contains(&db) {
            state.forced_collisions = state.forced_collisions.saturating_sub(1);
            return exit(
                1,
                &format!("ERROR 1007 (HY000) at line 1: Can't create database '{}'; database exists", db),
            );
        }
        state.databases.insert(db);
        if let Some(user) = between(sql, "CREATE USER '", "'@") {
            state.users.insert(user.to_string());
        }
        return ok("");
    }

    if sql.starts_with("DROP DATABASE IF EXISTS") {
        if let Some(db) = between(sql, "`", "`") {
            state.databases.remove(db);
        }
        if let Some(user) = between(sql, "DROP USER IF EXISTS '", "'@") {
            state.users.remove(user);
        }
        return ok("");
    }

    exit(1, "ERROR 1064 (42000): unsupported statement")
}

fn env_value<'a>(env: &'a [String], key: &str) -> Option<&'a str> {
    env.iter()
        .find_map(|kv| kv.strip_prefix(key).and_then(|rest| rest.strip_prefix('=')))
}

/// `mysql db < dump` run by the seeding script
fn import_dump(state: &mut State, env: &[String]) -> ExecOutput {
    let (Some(db), Some(dump)) = (env_value(env, "SEED_DB"), env_value(env, "SEED_DUMP")) else {
        return exit(1, "missing seed environment");
    };
    if !state.mysql_files.contains(dump) {
        return exit(2, &format!("seed dump {} not found", dump));
    }
    if !state.databases.contains(db) {
        return exit(1, &format!("ERROR 1049 (42000): Unknown database '{}'", db));
    }
    state.seeded.insert(db.to_string());
    ok("")
}

fn run_in_site(container: &mut FakeContainer, never_installed: bool, tokens: &HashMap<String, String>, script: &str) -> ExecOutput {
    if script.starts_with("test -f") {
        // the entrypoint writes wp-config.php as soon as the container runs
        return if script.contains("wp-config.php") || (container.installed && !never_installed) {
            ok("")
        } else {
            exit(1, "")
        };
    }
    if script.starts_with("test -d") {
        return if container.binds.is_empty() { exit(1, "") } else { ok("") };
    }
    if script.contains("wp core install") {
        container.installed = true;
        return ok("Success: WordPress installed successfully.");
    }
    if script.starts_with("wp core is-installed") {
        return if container.installed && !never_installed { ok("") } else { exit(1, "") };
    }
    if script.starts_with("cat ") {
        return match tokens.get(&container.name) {
            Some(content) => ok(content),
            None => exit(1, "cat: No such file or directory"),
        };
    }
    ok("")
}

#[async_trait]
impl RuntimeGateway for FakeGateway {
    async fn create_container(&self, spec: &ContainerSpec) -> GatewayResult<String> {
        let mut state = self.state.lock();
        if !state.images.contains(&spec.image) {
            return Err(GatewayError::NotFound(format!("No such image: {}", spec.image)));
        }
        if std::mem::take(&mut state.occupy_next_name) {
            drop(state);
            self.insert_container(&spec.name, HashMap::new());
            state = self.state.lock();
        }
        if find(&state, &spec.name).is_some() {
            return Err(GatewayError::Conflict(format!("container name '{}'", spec.name)));
        }

        state.next_id += 1;
        let id = format!("{:012x}", state.next_id);
        let volume = format!("{}_data", spec.name);
        state.volumes.insert(volume.clone());
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                env: spec.env.clone(),
                labels: spec.labels.clone(),
                binds: spec.binds.clone(),
                volumes: vec![volume],
                running: false,
                installed: false,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, container: &str) -> GatewayResult<()> {
        let mut state = self.state.lock();
        let id = find_id(&state, container).ok_or_else(|| GatewayError::NotFound(container.to_string()))?;
        if let Some(c) = state.containers.get_mut(&id) {
            c.running = true;
        }
        Ok(())
    }

    async fn stop_container(&self, container: &str, _timeout: Duration) -> GatewayResult<()> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        if let Some(id) = find_id(&state, container) {
            if let Some(c) = state.containers.get_mut(&id) {
                c.running = false;
            }
        }
        Ok(())
    }

    async fn remove_container(&self, container: &str) -> GatewayResult<()> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        if let Some(id) = find_id(&state, container) {
            state.containers.remove(&id);
        }
        Ok(())
    }

    async fn exec(&self, container: &str, command: &ExecCommand) -> GatewayResult<ExecOutput> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        let script = command.stdin.clone().unwrap_or_else(|| command.display());
        let name = find(&state, container).map_or_else(|| container.to_string(), |c| c.name.clone());
        state.exec_log.push(ExecRecord {
            container: name,
            script: script.clone(),
            argv: command.display(),
            env: command.env.clone(),
        });

        if state.failing.iter().any(|needle| script.contains(needle.as_str())) {
            return Ok(exit(1, "simulated failure"));
        }

        if container == MYSQL_CONTAINER {
            if env_value(&command.env, "SEED_DUMP").is_some() {
                return Ok(import_dump(&mut state, &command.env));
            }
            return Ok(run_sql(&mut state, &script));
        }

        let id = find_id(&state, container).ok_or_else(|| GatewayError::NotFound(container.to_string()))?;
        let never_installed = state.never_installed;
        let tokens = state.login_tokens.clone();
        let Some(c) = state.containers.get_mut(&id) else {
            return Err(GatewayError::NotFound(container.to_string()));
        };
        if !c.running {
            return Err(GatewayError::Api(format!("Container {} is not running", c.name)));
        }
        Ok(run_in_site(c, never_installed, &tokens, &script))
    }

    async fn inspect_container(&self, container: &str) -> GatewayResult<Option<ContainerDetails>> {
        tokio::task::yield_now().await;
        let state = self.state.lock();
        Ok(find(&state, container).map(|c| ContainerDetails {
            id: c.id.clone(),
            name: c.name.clone(),
            running: c.running,
            labels: c.labels.clone(),
            volumes: c.volumes.clone(),
        }))
    }

    async fn list_containers_with_label(&self, label: &str) -> GatewayResult<Vec<ContainerSummary>> {
        tokio::task::yield_now().await;
        let state = self.state.lock();
        Ok(state
            .containers
            .values()
            .filter(|c| c.labels.contains_key(label))
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.name.clone(),
                labels: c.labels.clone(),
                running: c.running,
            })
            .collect())
    }

    async fn remove_volume(&self, name: &str) -> GatewayResult<()> {
        self.state.lock().volumes.remove(name);
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> GatewayResult<()> {
        self.state.lock().networks.insert(name.to_string());
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> GatewayResult<bool> {
        Ok(self.state.lock().images.contains(image))
    }

    async fn pull_image(&self, image: &str) -> GatewayResult<()> {
        let mut state = self.state.lock();
        if !state.pullable.contains(image) {
            return Err(GatewayError::NotFound(format!("manifest for {} not found", image)));
        }
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn commit_container(&self, container: &str, repo: &str, tag: &str) -> GatewayResult<Option<String>> {
        let mut state = self.state.lock();
        if find(&state, container).is_none() {
            return Err(GatewayError::NotFound(container.to_string()));
        }
        if state.commit_without_id {
            return Ok(None);
        }
        state.next_id += 1;
        let image_id = format!("sha256:{:064x}", state.next_id);
        state.images.insert(image_id.clone());
        state.images.insert(format!("{}:{}", repo, tag));
        Ok(Some(image_id))
    }

    async fn tag_image(&self, image: &str, repo: &str, tag: &str) -> GatewayResult<()> {
        let mut state = self.state.lock();
        if !state.images.contains(image) {
            return Err(GatewayError::NotFound(image.to_string()));
        }
        state.images.insert(format!("{}:{}", repo, tag));
        Ok(())
    }
}

/// Configuration with fast polling and the pool disabled
pub fn test_config(policy: &str) -> Config {
    let toml = format!(
        r#"
[mysql]
container = "{MYSQL_CONTAINER}"
ready_attempts = 3
ready_interval_ms = 1

[probe]
max_attempts = 3
interval_ms = 1

[pool]
target_size = 0
min_size = 0

[sweeper]
retention_minutes = 60

[site]
domain_suffix = "{DOMAIN}"
probe_timeout_policy = "{policy}"
"#
    );
    Config::from_toml(&toml).expect("test config is valid")
}

pub struct Harness {
    pub gateway: Arc<FakeGateway>,
    pub services: Services,
    pub shutdown_tx: watch::Sender<bool>,
}

/// Services over a fake runtime that already has the golden image
pub fn harness(config: &Config) -> Harness {
    let gateway = FakeGateway::new();
    gateway.add_image(&config.golden.image_ref());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let db = Database::open_in_memory().expect("in-memory store");
    let services = Services::new(gateway.shared(), db, config, shutdown_rx);

    Harness {
        gateway,
        services,
        shutdown_tx,
    }
}
