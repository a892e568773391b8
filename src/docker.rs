//! Docker container target

use crate::config::{SharedSettings, TargetConfig};
use crate::error::TargetError;
use crate::target::{StopReport, Target, TargetInfo, TargetKind};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, DeviceRequest, HostConfig, PortBinding};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info, warn};

/// Exit code of a container that received SIGKILL
const SIGKILL_EXIT_CODE: i64 = 137;

/// A named container, optionally created from an image on first start.
///
/// The container name is read from the runtime settings on every operation so
/// that renaming the target through the admin API takes effect on the next start.
pub struct DockerTarget {
    config: TargetConfig,
    settings: SharedSettings,
    client: OnceCell<Docker>,
    log_shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl DockerTarget {
    pub fn new(config: TargetConfig, settings: SharedSettings) -> Self {
        Self {
            config,
            settings,
            client: OnceCell::new(),
            log_shutdown: Mutex::new(None),
        }
    }

    fn container_name(&self) -> String {
        self.settings.read().target_name.clone()
    }

    /// Connect lazily so idlegate can start before the daemon does
    async fn client(&self) -> Result<&Docker, TargetError> {
        self.client
            .get_or_try_init(|| async {
                let client = connect(self.config.docker_host.as_deref())
                    .map_err(|e| TargetError::Runtime(e.to_string()))?;
                client.ping().await.map_err(|e| {
                    TargetError::Runtime(format!(
                        "Docker daemon is not responding: {}. Ensure dockerd is running.",
                        e
                    ))
                })?;
                debug!("Connected to Docker daemon");
                Ok::<_, TargetError>(client)
            })
            .await
    }

    async fn inspect_raw(&self, name: &str) -> Result<ContainerInspectResponse, TargetError> {
        let client = self.client().await?;
        match client.inspect_container(name, None).await {
            Ok(info) => Ok(info),
            Err(e) if is_status(&e, 404) => Err(TargetError::NotFound(name.to_string())),
            Err(e) => Err(TargetError::Runtime(format!(
                "failed to inspect container '{}': {}",
                name, e
            ))),
        }
    }

    async fn pull_image_if_missing(&self, client: &Docker, image: &str) -> Result<(), TargetError> {
        if client.inspect_image(image).await.is_ok() {
            debug!(image, "Image exists locally, skipping pull");
            return Ok(());
        }

        info!(image, "Pulling Docker image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(error) = progress.error {
                        return Err(TargetError::Spawn(format!(
                            "failed to pull image '{}': {}",
                            image, error
                        )));
                    }
                    if let Some(status) = progress.status {
                        debug!(image, status, "Pull progress");
                    }
                }
                Err(e) => {
                    return Err(TargetError::Spawn(format!(
                        "failed to pull image '{}': {}",
                        image, e
                    )))
                }
            }
        }
        info!(image, "Image pulled successfully");
        Ok(())
    }

    async fn create_container(&self, name: &str, image: &str) -> Result<(), TargetError> {
        let client = self.client().await?;
        self.pull_image_if_missing(client, image).await?;

        let port_key = format!("{}/tcp", self.config.port);
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(self.config.port.to_string()),
            }]),
        );

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let mut host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: self.config.network.clone(),
            ..Default::default()
        };
        if self.config.gpus {
            host_config.device_requests = Some(vec![DeviceRequest {
                driver: Some("nvidia".to_string()),
                count: Some(-1),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }]);
        }

        let cmd = if self.config.args.is_empty() {
            None
        } else {
            Some(self.config.args.clone())
        };

        let container_config = Config {
            image: Some(image.to_string()),
            cmd,
            env: Some(container_env(&self.config)),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        let response = client
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| {
                TargetError::Spawn(format!(
                    "failed to create container '{}' from image '{}': {}",
                    name, image, e
                ))
            })?;

        info!(container = name, container_id = %response.id, image, "Created Docker container");
        Ok(())
    }

    /// Forward container output to tracing until the shutdown sender fires
    fn stream_logs(&self, client: Docker, name: String) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        if let Some(previous) = self.log_shutdown.lock().replace(shutdown_tx) {
            let _ = previous.send(true);
        }

        tokio::spawn(async move {
            let options = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                // Only output produced from now on
                since: Utc::now().timestamp(),
                ..Default::default()
            };

            let mut log_stream = client.logs(&name, Some(options));

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        debug!(container = %name, "Log streaming stopped");
                        break;
                    }
                    log_result = log_stream.next() => {
                        match log_result {
                            Some(Ok(output)) => forward_log(&name, output),
                            Some(Err(e)) => {
                                warn!(container = %name, error = %e, "Error reading container logs");
                                break;
                            }
                            None => {
                                debug!(container = %name, "Container log stream ended");
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    fn stop_log_stream(&self) {
        if let Some(shutdown) = self.log_shutdown.lock().take() {
            let _ = shutdown.send(true);
        }
    }
}

#[async_trait]
impl Target for DockerTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Docker
    }

    async fn start(&self) -> Result<(), TargetError> {
        let name = self.container_name();

        match self.inspect_raw(&name).await {
            Ok(info) if is_running(&info) => {
                debug!(container = %name, "Container already running");
                return Ok(());
            }
            Ok(_) => {}
            Err(TargetError::NotFound(_)) => match self.config.image {
                Some(ref image) => self.create_container(&name, image).await?,
                None => return Err(TargetError::NotFound(name)),
            },
            Err(e) => return Err(e),
        }

        info!(container = %name, "Starting Docker container");
        let client = self.client().await?;
        match client
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => {}
            Err(e) if is_status(&e, 304) => debug!(container = %name, "Container was already started"),
            Err(e) if is_status(&e, 404) => return Err(TargetError::NotFound(name)),
            Err(e) => {
                return Err(TargetError::Spawn(format!(
                    "failed to start container '{}': {}",
                    name, e
                )))
            }
        }

        self.stream_logs(client.clone(), name);
        Ok(())
    }

    async fn stop(&self, grace: Duration) -> Result<StopReport, TargetError> {
        let name = self.container_name();
        self.stop_log_stream();
        let client = self.client().await?;

        info!(container = %name, "Stopping Docker container");
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };

        match client.stop_container(&name, Some(options)).await {
            Ok(()) => {}
            Err(e) if is_status(&e, 304) => {
                debug!(container = %name, "Container was already stopped");
                return Ok(StopReport::default());
            }
            Err(e) if is_status(&e, 404) => {
                debug!(container = %name, "Container not found");
                return Ok(StopReport::default());
            }
            Err(e) => {
                warn!(container = %name, error = %e, "Error stopping container, forcing kill");
                return match client
                    .kill_container(&name, None::<KillContainerOptions<String>>)
                    .await
                {
                    Ok(()) => Ok(StopReport { forced: true }),
                    Err(e) if is_status(&e, 404) || is_status(&e, 409) => {
                        Ok(StopReport { forced: true })
                    }
                    Err(e) => Err(TargetError::Stop(format!(
                        "failed to kill container '{}': {}",
                        name, e
                    ))),
                };
            }
        }

        // The daemon escalates to SIGKILL itself once `t` expires
        let forced = match self.inspect_raw(&name).await {
            Ok(info) => was_forced(&info),
            Err(_) => false,
        };
        info!(container = %name, forced, "Stopped Docker container");
        Ok(StopReport { forced })
    }

    async fn is_alive(&self) -> bool {
        match self.inspect_raw(&self.container_name()).await {
            Ok(info) => is_running(&info),
            Err(_) => false,
        }
    }

    async fn inspect(&self) -> Result<TargetInfo, TargetError> {
        let name = self.container_name();
        let info = match self.inspect_raw(&name).await {
            Ok(info) => info,
            // A missing container that we can create from an image is simply stopped
            Err(TargetError::NotFound(_)) if self.config.image.is_some() => {
                return Ok(TargetInfo {
                    kind: TargetKind::Docker,
                    name,
                    id: None,
                    started_at: None,
                    alive: false,
                });
            }
            Err(e) => return Err(e),
        };

        let alive = is_running(&info);
        Ok(TargetInfo {
            kind: TargetKind::Docker,
            name,
            id: info.id.clone(),
            started_at: if alive { started_at(&info) } else { None },
            alive,
        })
    }

    async fn logs(&self, tail: usize) -> Result<Vec<String>, TargetError> {
        let client = self.client().await?;
        let name = self.container_name();
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut log_stream = client.logs(&name, Some(options));
        let mut lines = Vec::new();
        while let Some(result) = log_stream.next().await {
            match result {
                Ok(output) => lines.extend(log_lines(output)),
                Err(e) if is_status(&e, 404) => return Err(TargetError::NotFound(name)),
                Err(e) => return Err(TargetError::Runtime(e.to_string())),
            }
        }
        Ok(lines)
    }
}

fn connect(docker_host: Option<&str>) -> anyhow::Result<Docker> {
    let host = docker_host
        .map(str::to_string)
        .or_else(|| std::env::var("DOCKER_HOST").ok());

    match host {
        Some(host) if host.starts_with("unix://") => {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        }
        Some(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
            Docker::connect_with_http(&host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        }
        Some(host) => anyhow::bail!(
            "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
            host
        ),
        None => Docker::connect_with_socket_defaults()
            .map_err(|e| anyhow::anyhow!("Cannot connect to Docker daemon: {}", e)),
    }
}

fn is_status(err: &bollard::errors::Error, code: u16) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code, .. } if *status_code == code
    )
}

fn is_running(info: &ContainerInspectResponse) -> bool {
    info.state
        .as_ref()
        .and_then(|s| s.running)
        .unwrap_or(false)
}

fn was_forced(info: &ContainerInspectResponse) -> bool {
    info.state
        .as_ref()
        .and_then(|s| s.exit_code)
        .is_some_and(|code| code == SIGKILL_EXIT_CODE)
}

fn started_at(info: &ContainerInspectResponse) -> Option<DateTime<Utc>> {
    info.state
        .as_ref()
        .and_then(|s| s.started_at.as_deref())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn container_env(config: &TargetConfig) -> Vec<String> {
    let mut env: Vec<String> = config
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    env.sort();
    env.push(format!("PORT={}", config.port));
    env
}

/// Non-empty lines of one log frame
fn log_lines(output: LogOutput) -> Vec<String> {
    let message = match output {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::Console { message } => message,
        LogOutput::StdIn { .. } => return Vec::new(),
    };
    String::from_utf8_lossy(&message)
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn forward_log(name: &str, output: LogOutput) {
    let (stream, message) = match output {
        LogOutput::StdOut { message } => ("stdout", message),
        LogOutput::StdErr { message } => ("stderr", message),
        LogOutput::Console { message } => ("console", message),
        LogOutput::StdIn { .. } => return,
    };
    let text = String::from_utf8_lossy(&message);
    let line = text.trim_end();
    if line.is_empty() {
        return;
    }
    if stream == "stderr" {
        warn!(target: "backend", container = name, stream, "{}", line);
    } else {
        info!(target: "backend", container = name, stream, "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::ContainerState;

    fn inspect_with(state: ContainerState) -> ContainerInspectResponse {
        ContainerInspectResponse {
            id: Some("abc123".to_string()),
            state: Some(state),
            ..Default::default()
        }
    }

    #[test]
    fn test_log_lines_splits_frames() {
        let frame = LogOutput::StdOut {
            message: "2024-05-01T12:30:00Z first\r\n\n2024-05-01T12:30:01Z second\n".into(),
        };
        assert_eq!(
            log_lines(frame),
            vec!["2024-05-01T12:30:00Z first", "2024-05-01T12:30:01Z second"]
        );
        assert!(log_lines(LogOutput::StdIn { message: "ignored".into() }).is_empty());
    }

    #[test]
    fn test_is_running() {
        let running = inspect_with(ContainerState {
            running: Some(true),
            ..Default::default()
        });
        assert!(is_running(&running));
        assert!(!is_running(&ContainerInspectResponse::default()));
    }

    #[test]
    fn test_was_forced() {
        let killed = inspect_with(ContainerState {
            running: Some(false),
            exit_code: Some(137),
            ..Default::default()
        });
        assert!(was_forced(&killed));

        let clean = inspect_with(ContainerState {
            running: Some(false),
            exit_code: Some(0),
            ..Default::default()
        });
        assert!(!was_forced(&clean));
    }

    #[test]
    fn test_started_at_parses_docker_timestamps() {
        let info = inspect_with(ContainerState {
            running: Some(true),
            started_at: Some("2024-05-01T12:30:00.123456789Z".to_string()),
            ..Default::default()
        });
        let ts = started_at(&info).unwrap();
        assert_eq!(ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true), "2024-05-01T12:30:00Z");

        let garbage = inspect_with(ContainerState {
            started_at: Some("not a date".to_string()),
            ..Default::default()
        });
        assert!(started_at(&garbage).is_none());
    }

    #[test]
    fn test_container_env_includes_port() {
        let mut config = TargetConfig::docker("comfyui", 8188);
        config.env.insert("CLI_ARGS".to_string(), "--lowvram".to_string());
        let env = container_env(&config);
        assert_eq!(env, vec!["CLI_ARGS=--lowvram".to_string(), "PORT=8188".to_string()]);
    }

    #[test]
    fn test_connect_rejects_bad_host() {
        let err = connect(Some("ftp://docker")).unwrap_err();
        assert!(err.to_string().contains("Invalid docker_host format"));
    }

    #[test]
    fn test_is_status() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        };
        assert!(is_status(&err, 404));
        assert!(!is_status(&err, 304));
    }
}
