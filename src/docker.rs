//! Container runtime gateway
//!
//! Everything the orchestrator does to containers, images, networks and
//! volumes goes through [`RuntimeGateway`]. [`DockerGateway`] is the
//! production implementation on top of bollard.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CommitContainerOptions, CreateImageOptions, TagImageOptions};
use bollard::models::{HostConfig, MountPointTypeEnum, PortBinding};
use bollard::network::CreateNetworkOptions;
use bollard::volume::RemoveVolumeOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{SiteError, SiteResult};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0} not found")]
    NotFound(String),

    /// Name already taken by another container
    #[error("{0} already in use")]
    Conflict(String),

    #[error("{0}")]
    Api(String),
}

impl GatewayError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, GatewayError::Conflict(_))
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Everything needed to create one container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `KEY=value` pairs
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub memory_bytes: Option<i64>,
    pub network: Option<String>,
    /// `host:container[:mode]` bind mounts
    pub binds: Vec<String>,
    /// `(container_port, host_port)` published on 127.0.0.1
    pub published_port: Option<(u16, u16)>,
}

/// A command run inside a container
#[derive(Debug, Clone, PartialEq)]
pub struct ExecCommand {
    pub cmd: Vec<String>,
    /// Extra `KEY=value` environment for this exec only
    pub env: Vec<String>,
    /// Written to the process's stdin, then closed
    pub stdin: Option<String>,
}

impl ExecCommand {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cmd: argv.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            stdin: None,
        }
    }

    /// Run `script` through a login shell
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new(["sh".to_string(), "-lc".to_string(), script.into()])
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push(format!("{}={}", key, value));
        self
    }

    /// Feed `input` on stdin; keeps it out of the process list
    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// The script for shell commands, the joined argv otherwise
    pub fn display(&self) -> String {
        match self.cmd.as_slice() {
            [sh, flag, script] if sh == "sh" && flag == "-lc" => script.clone(),
            argv => shell_words::join(argv),
        }
    }
}

/// Captured result of an exec
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stderr when present, stdout otherwise
    pub fn message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Container as seen in a listing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
}

/// Container as seen by inspect
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub labels: HashMap<String, String>,
    /// Names of named volumes mounted into the container
    pub volumes: Vec<String>,
}

#[async_trait]
pub trait RuntimeGateway: Send + Sync {
    /// Create a container and return its id
    async fn create_container(&self, spec: &ContainerSpec) -> GatewayResult<String>;

    async fn start_container(&self, container: &str) -> GatewayResult<()>;

    /// Stop a container; already stopped or missing is success
    async fn stop_container(&self, container: &str, timeout: Duration) -> GatewayResult<()>;

    /// Force-remove a container and its anonymous volumes; missing is success
    async fn remove_container(&self, container: &str) -> GatewayResult<()>;

    /// Run a command and wait for it to finish
    async fn exec(&self, container: &str, command: &ExecCommand) -> GatewayResult<ExecOutput>;

    /// None when the container does not exist
    async fn inspect_container(&self, container: &str) -> GatewayResult<Option<ContainerDetails>>;

    /// All containers, running or not, that carry `label`
    async fn list_containers_with_label(&self, label: &str) -> GatewayResult<Vec<ContainerSummary>>;

    /// Remove a named volume; missing is success
    async fn remove_volume(&self, name: &str) -> GatewayResult<()>;

    /// Create a bridge network unless it already exists
    async fn ensure_network(&self, name: &str) -> GatewayResult<()>;

    async fn image_exists(&self, image: &str) -> GatewayResult<bool>;

    async fn pull_image(&self, image: &str) -> GatewayResult<()>;

    /// Commit a container to `repo:tag`; returns the new image id if the runtime reported one
    async fn commit_container(&self, container: &str, repo: &str, tag: &str) -> GatewayResult<Option<String>>;

    async fn tag_image(&self, image: &str, repo: &str, tag: &str) -> GatewayResult<()>;
}

pub type SharedGateway = Arc<dyn RuntimeGateway>;

/// Run a command that must succeed; a non-zero exit becomes
/// [`SiteError::CommandFailed`] carrying the command's own output
pub async fn exec_checked(
    gateway: &dyn RuntimeGateway,
    container: &str,
    step: &str,
    command: &ExecCommand,
) -> SiteResult<ExecOutput> {
    let output = gateway.exec(container, command).await?;
    if output.success() {
        Ok(output)
    } else {
        warn!(container, step, exit_code = output.exit_code, "Command failed");
        Err(SiteError::CommandFailed {
            step: step.to_string(),
            exit_code: output.exit_code,
            output: output.message(),
        })
    }
}

/// Docker implementation of the runtime gateway
pub struct DockerGateway {
    client: Docker,
}

impl DockerGateway {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn connect(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host, e
                )
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker via DOCKER_HOST='{}': {}.",
                    host, e
                )
            })?
        } else {
            Self::connect_with_defaults().await?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. Ensure dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker host '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop", format!("{}/.docker/run/docker.sock", home)),
            ("Rancher Desktop", format!("{}/.rd/docker.sock", home)),
            ("Podman", format!("{}/podman/podman.sock", xdg_runtime)),
        ];

        let mut tried_paths = Vec::new();

        for (name, path) in &socket_paths {
            if path.starts_with('/') && !path.starts_with("//") && std::path::Path::new(path).exists() {
                debug!(path, name, "Found Docker socket");
                match Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION) {
                    Ok(client) if client.ping().await.is_ok() => return Ok(client),
                    Ok(_) => tried_paths.push(format!("{} ({}) - daemon not responding", path, name)),
                    Err(e) => tried_paths.push(format!("{} ({}) - {}", path, name, e)),
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            let tried_info = if tried_paths.is_empty() {
                "No Docker socket found at common locations".to_string()
            } else {
                format!("Tried:\n  - {}", tried_paths.join("\n  - "))
            };
            anyhow::anyhow!(
                "Cannot connect to Docker daemon. {}\n\
                 Set DOCKER_HOST or docker.host in the configuration.\n\
                 Underlying error: {}",
                tried_info, e
            )
        })
    }
}

fn status_code(err: &bollard::errors::Error) -> Option<u16> {
    match err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn map_err(what: &str, err: bollard::errors::Error) -> GatewayError {
    match status_code(&err) {
        Some(404) => GatewayError::NotFound(what.to_string()),
        _ => GatewayError::Api(format!("{}: {}", what, err)),
    }
}

#[async_trait]
impl RuntimeGateway for DockerGateway {
    async fn create_container(&self, spec: &ContainerSpec) -> GatewayResult<String> {
        let mut host_config = HostConfig {
            memory: spec.memory_bytes,
            network_mode: spec.network.clone(),
            ..Default::default()
        };
        if !spec.binds.is_empty() {
            host_config.binds = Some(spec.binds.clone());
        }

        let mut exposed_ports = None;
        if let Some((container_port, host_port)) = spec.published_port {
            let port_key = format!("{}/tcp", container_port);
            let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
            port_bindings.insert(
                port_key.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: Some(host_port.to_string()),
                }]),
            );
            host_config.port_bindings = Some(port_bindings);

            let mut ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
            ports.insert(port_key, HashMap::new());
            exposed_ports = Some(ports);
        }

        let container_config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            exposed_ports,
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| match status_code(&e) {
                Some(404) => GatewayError::NotFound(format!("image '{}'", spec.image)),
                Some(409) => GatewayError::Conflict(format!("container name '{}'", spec.name)),
                _ => GatewayError::Api(format!(
                    "failed to create container '{}' from image '{}': {}",
                    spec.name, spec.image, e
                )),
            })?;

        info!(
            container_id = %response.id,
            container = %spec.name,
            image = %spec.image,
            "Created container"
        );
        Ok(response.id)
    }

    async fn start_container(&self, container: &str) -> GatewayResult<()> {
        match self
            .client
            .start_container(container, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(_) => {
                info!(container, "Started container");
                Ok(())
            }
            Err(e) if status_code(&e) == Some(304) => {
                debug!(container, "Container was already running");
                Ok(())
            }
            Err(e) => Err(map_err(&format!("container '{}'", container), e)),
        }
    }

    async fn stop_container(&self, container: &str, timeout: Duration) -> GatewayResult<()> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };

        match self.client.stop_container(container, Some(options)).await {
            Ok(_) => {
                info!(container, "Stopped container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container, "Container was already stopped");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container, "Container not found");
                Ok(())
            }
            Err(e) => Err(GatewayError::Api(format!(
                "failed to stop container '{}': {}",
                container, e
            ))),
        }
    }

    async fn remove_container(&self, container: &str) -> GatewayResult<()> {
        let options = RemoveContainerOptions {
            v: true,
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(container, Some(options)).await {
            Ok(_) => {
                debug!(container, "Removed container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container, "Container not found");
                Ok(())
            }
            Err(e) => Err(GatewayError::Api(format!(
                "failed to remove container '{}': {}",
                container, e
            ))),
        }
    }

    async fn exec(&self, container: &str, command: &ExecCommand) -> GatewayResult<ExecOutput> {
        let options = CreateExecOptions {
            cmd: Some(command.cmd.clone()),
            env: if command.env.is_empty() {
                None
            } else {
                Some(command.env.clone())
            },
            attach_stdin: Some(command.stdin.is_some()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(container, options)
            .await
            .map_err(|e| map_err(&format!("container '{}'", container), e))?;

        let mut output = ExecOutput::default();
        match self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| GatewayError::Api(format!("exec in '{}' failed: {}", container, e)))?
        {
            StartExecResults::Attached {
                output: mut stream,
                mut input,
            } => {
                if let Some(stdin) = &command.stdin {
                    input
                        .write_all(stdin.as_bytes())
                        .await
                        .map_err(|e| GatewayError::Api(format!("writing stdin in '{}' failed: {}", container, e)))?;
                    input
                        .shutdown()
                        .await
                        .map_err(|e| GatewayError::Api(format!("closing stdin in '{}' failed: {}", container, e)))?;
                }
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                            output.stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            output.stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(LogOutput::StdIn { .. }) => {}
                        Err(e) => {
                            warn!(container, error = %e, "Error reading exec output");
                            break;
                        }
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| GatewayError::Api(format!("inspect exec in '{}' failed: {}", container, e)))?;
        output.exit_code = inspect.exit_code.unwrap_or(-1);

        debug!(
            container,
            command = %command.display(),
            exit_code = output.exit_code,
            "Exec finished"
        );
        Ok(output)
    }

    async fn inspect_container(&self, container: &str) -> GatewayResult<Option<ContainerDetails>> {
        let info = match self.client.inspect_container(container, None).await {
            Ok(info) => info,
            Err(e) if status_code(&e) == Some(404) => return Ok(None),
            Err(e) => return Err(map_err(&format!("container '{}'", container), e)),
        };

        let volumes = info
            .mounts
            .unwrap_or_default()
            .into_iter()
            .filter(|m| m.typ == Some(MountPointTypeEnum::VOLUME))
            .filter_map(|m| m.name)
            .collect();

        Ok(Some(ContainerDetails {
            id: info.id.unwrap_or_default(),
            name: info
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            running: info.state.and_then(|s| s.running).unwrap_or(false),
            labels: info.config.and_then(|c| c.labels).unwrap_or_default(),
            volumes,
        }))
    }

    async fn list_containers_with_label(&self, label: &str) -> GatewayResult<Vec<ContainerSummary>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| GatewayError::Api(format!("failed to list containers: {}", e)))?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
                running: c.state.as_deref() == Some("running"),
            })
            .collect())
    }

    async fn remove_volume(&self, name: &str) -> GatewayResult<()> {
        match self
            .client
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await
        {
            Ok(_) => {
                debug!(volume = name, "Removed volume");
                Ok(())
            }
            Err(e) if status_code(&e) == Some(404) => {
                debug!(volume = name, "Volume not found");
                Ok(())
            }
            Err(e) => Err(GatewayError::Api(format!(
                "failed to remove volume '{}': {}",
                name, e
            ))),
        }
    }

    async fn ensure_network(&self, name: &str) -> GatewayResult<()> {
        match self.client.inspect_network::<String>(name, None).await {
            Ok(_) => {
                debug!(network = name, "Network already exists");
                return Ok(());
            }
            Err(e) if status_code(&e) == Some(404) => {}
            Err(e) => {
                return Err(GatewayError::Api(format!(
                    "failed to inspect network '{}': {}",
                    name, e
                )))
            }
        }

        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            ..Default::default()
        };

        match self.client.create_network(options).await {
            Ok(_) => {
                info!(network = name, "Created network");
                Ok(())
            }
            // lost a race with another creator
            Err(e) if status_code(&e) == Some(409) => Ok(()),
            Err(e) => Err(GatewayError::Api(format!(
                "failed to create network '{}': {}",
                name, e
            ))),
        }
    }

    async fn image_exists(&self, image: &str) -> GatewayResult<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if status_code(&e) == Some(404) => Ok(false),
            Err(e) => Err(GatewayError::Api(format!(
                "failed to inspect image '{}': {}",
                image, e
            ))),
        }
    }

    async fn pull_image(&self, image: &str) -> GatewayResult<()> {
        info!(image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        let mut last_error = None;

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(image, status, "Pull progress");
                    }
                    if let Some(error) = info.error {
                        last_error = Some(error);
                    }
                }
                Err(e) => {
                    let err_str = e.to_string();
                    return Err(if err_str.contains("manifest unknown") || err_str.contains("not found") {
                        GatewayError::NotFound(format!("image '{}' in registry", image))
                    } else if err_str.contains("unauthorized") || err_str.contains("authentication") {
                        GatewayError::Api(format!(
                            "authentication required to pull '{}'; run 'docker login' first",
                            image
                        ))
                    } else {
                        GatewayError::Api(format!("failed to pull image '{}': {}", image, e))
                    });
                }
            }
        }

        if let Some(error) = last_error {
            return Err(GatewayError::Api(format!(
                "failed to pull image '{}': {}",
                image, error
            )));
        }

        info!(image, "Image pulled successfully");
        Ok(())
    }

    async fn commit_container(&self, container: &str, repo: &str, tag: &str) -> GatewayResult<Option<String>> {
        let options = CommitContainerOptions {
            container: container.to_string(),
            repo: repo.to_string(),
            tag: tag.to_string(),
            pause: true,
            ..Default::default()
        };

        let commit = self
            .client
            .commit_container(options, Config::<String>::default())
            .await
            .map_err(|e| map_err(&format!("container '{}'", container), e))?;

        Ok(commit.id.filter(|id| !id.is_empty()))
    }

    async fn tag_image(&self, image: &str, repo: &str, tag: &str) -> GatewayResult<()> {
        let options = TagImageOptions { repo, tag };
        self.client
            .tag_image(image, Some(options))
            .await
            .map_err(|e| map_err(&format!("image '{}'", image), e))
    }
}

/// Parse memory limit string (e.g., "512m", "1g") to bytes
pub fn parse_memory_limit(limit: &str) -> anyhow::Result<i64> {
    let limit = limit.trim().to_lowercase();
    let (num_str, multiplier) = if limit.ends_with('g') || limit.ends_with("gb") {
        let num = limit.trim_end_matches("gb").trim_end_matches('g');
        (num, 1024 * 1024 * 1024i64)
    } else if limit.ends_with('m') || limit.ends_with("mb") {
        let num = limit.trim_end_matches("mb").trim_end_matches('m');
        (num, 1024 * 1024i64)
    } else if limit.ends_with('k') || limit.ends_with("kb") {
        let num = limit.trim_end_matches("kb").trim_end_matches('k');
        (num, 1024i64)
    } else {
        (limit.as_str(), 1i64)
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid memory limit: {}", limit))?;

    Ok((num * multiplier as f64) as i64)
}
