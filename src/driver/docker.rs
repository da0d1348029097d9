//! Thin client for the container daemon, driven through the `docker` CLI.
//!
//! The command is injectable (tests point it at mock-docker) and the daemon
//! socket is forwarded via `DOCKER_HOST`. Every invocation runs under a
//! per-operation timeout; a timed-out child is killed rather than leaked.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::{ContainerState, DriverError};
use crate::types::GpuAssignment;

const CREATE_TIMEOUT: Duration = Duration::from_secs(30);
const START_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_TIMEOUT: Duration = Duration::from_secs(30);
const REMOVE_TIMEOUT: Duration = Duration::from_secs(30);
const INSPECT_TIMEOUT: Duration = Duration::from_secs(5);
const LOGS_TIMEOUT: Duration = Duration::from_secs(10);
const LIST_TIMEOUT: Duration = Duration::from_secs(10);

/// What to create: the container-level spec both drivers compile down to.
#[derive(Debug, Clone)]
pub struct CreateSpec {
    pub name: String,
    pub image: String,
    pub host_port: u16,
    pub container_port: u16,
    pub env: Vec<(String, String)>,
    pub volumes: Vec<(String, String)>,
    /// Value for `--gpus` (`"all"` or `"device=N"`); `None` for CPU.
    pub device: Option<String>,
    /// Engine command line, appended after the image.
    pub cmd: Vec<String>,
}

impl CreateSpec {
    /// Compile to `docker create` arguments. The device block is the last
    /// host-level flag so it wins over anything the base spec set.
    fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            self.name.clone(),
            "--restart".to_string(),
            "unless-stopped".to_string(),
            "-p".to_string(),
            format!("{}:{}", self.host_port, self.container_port),
        ];
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for (volume, target) in &self.volumes {
            args.push("-v".to_string());
            args.push(format!("{volume}:{target}"));
        }
        if let Some(device) = &self.device {
            args.push("--gpus".to_string());
            args.push(device.clone());
        }
        args.push(self.image.clone());
        args.extend(self.cmd.iter().cloned());
        args
    }
}

/// A container owned by this system, as seen at the daemon.
#[derive(Debug, Clone)]
pub struct OwnedContainer {
    pub container_id: String,
    /// Name without the daemon's leading slash.
    pub name: String,
    pub state: String,
    pub running: bool,
    pub created: Option<String>,
    /// Host binding of the engine's internal port, when parseable.
    pub host_port: Option<u16>,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub device: GpuAssignment,
}

#[derive(Clone)]
pub struct DockerCli {
    command: String,
    docker_host: Option<String>,
}

impl DockerCli {
    pub fn new(command: impl Into<String>, socket_path: Option<&str>) -> Self {
        Self {
            command: command.into(),
            docker_host: socket_path.map(|p| format!("unix://{p}")),
        }
    }

    async fn exec(
        &self,
        args: &[String],
        op: &'static str,
        timeout: Duration,
    ) -> Result<std::process::Output, DriverError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(host) = &self.docker_host {
            cmd.env("DOCKER_HOST", host);
        }

        debug!(target: "docker", op, args = ?args, "invoking daemon CLI");

        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DriverError::Timeout {
                op,
                secs: timeout.as_secs(),
            }),
        }
    }

    /// Run and require success; the daemon's stderr becomes the error.
    async fn exec_ok(
        &self,
        args: &[String],
        op: &'static str,
        timeout: Duration,
    ) -> Result<String, DriverError> {
        let output = self.exec(args, op, timeout).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(daemon_error(&output))
        }
    }

    /// Create a container; returns the daemon's container id.
    pub async fn create(&self, spec: &CreateSpec) -> Result<String, DriverError> {
        let stdout = self
            .exec_ok(&spec.to_args(), "create", CREATE_TIMEOUT)
            .await?;
        let id = stdout.trim().to_string();
        if id.is_empty() {
            return Err(DriverError::Parse(
                "daemon returned no container id for create".to_string(),
            ));
        }
        Ok(id)
    }

    pub async fn start(&self, container_id: &str) -> Result<(), DriverError> {
        let args = vec!["start".to_string(), container_id.to_string()];
        let output = self.exec(&args, "start", START_TIMEOUT).await?;
        if output.status.success() {
            return Ok(());
        }
        if is_no_such_container(&output) {
            return Err(DriverError::Gone(container_id.to_string()));
        }
        Err(daemon_error(&output))
    }

    /// Missing containers are already stopped, so that's success.
    pub async fn stop(&self, container_id: &str) -> Result<(), DriverError> {
        let args = vec!["stop".to_string(), container_id.to_string()];
        let output = self.exec(&args, "stop", STOP_TIMEOUT).await?;
        if output.status.success() || is_no_such_container(&output) {
            return Ok(());
        }
        Err(daemon_error(&output))
    }

    pub async fn restart(&self, container_id: &str) -> Result<(), DriverError> {
        let args = vec!["restart".to_string(), container_id.to_string()];
        let output = self.exec(&args, "restart", STOP_TIMEOUT).await?;
        if output.status.success() {
            return Ok(());
        }
        if is_no_such_container(&output) {
            return Err(DriverError::Gone(container_id.to_string()));
        }
        Err(daemon_error(&output))
    }

    /// Force-remove; absent containers are success.
    pub async fn remove(&self, container_id: &str) -> Result<(), DriverError> {
        let args = vec![
            "rm".to_string(),
            "-f".to_string(),
            container_id.to_string(),
        ];
        let output = self.exec(&args, "remove", REMOVE_TIMEOUT).await?;
        if output.status.success() || is_no_such_container(&output) {
            return Ok(());
        }
        Err(daemon_error(&output))
    }

    pub async fn inspect(&self, container_id: &str) -> Result<ContainerState, DriverError> {
        let inspected = self.inspect_full(container_id).await?;
        Ok(ContainerState {
            status: inspected.state.status.clone(),
            running: inspected.state.running,
            started_at: inspected.state.started_at.clone(),
            finished_at: inspected.state.finished_at.clone(),
        })
    }

    pub(super) async fn inspect_full(
        &self,
        container_id: &str,
    ) -> Result<Inspected, DriverError> {
        let args = vec![
            "inspect".to_string(),
            "--type".to_string(),
            "container".to_string(),
            container_id.to_string(),
        ];
        let output = self.exec(&args, "inspect", INSPECT_TIMEOUT).await?;
        if !output.status.success() {
            if is_no_such_container(&output) {
                return Err(DriverError::Gone(container_id.to_string()));
            }
            return Err(daemon_error(&output));
        }

        let parsed: Vec<Inspected> = serde_json::from_slice(&output.stdout)
            .map_err(|e| DriverError::Parse(format!("inspect output: {e}")))?;
        parsed
            .into_iter()
            .next()
            .ok_or_else(|| DriverError::Gone(container_id.to_string()))
    }

    /// Both streams, last `tail` lines.
    pub async fn logs(&self, container_id: &str, tail: u32) -> Result<String, DriverError> {
        let args = vec![
            "logs".to_string(),
            "--tail".to_string(),
            tail.to_string(),
            container_id.to_string(),
        ];
        let output = self.exec(&args, "logs", LOGS_TIMEOUT).await?;
        if !output.status.success() {
            if is_no_such_container(&output) {
                return Err(DriverError::Gone(container_id.to_string()));
            }
            return Err(daemon_error(&output));
        }
        // The daemon multiplexes stdout and stderr; the CLI splits them back
        // onto ours, so concatenate.
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }

    /// All containers (running or not) whose name starts with `prefix`,
    /// fully inspected. `internal_port` picks which binding counts as the
    /// instance's host port.
    pub async fn list_by_prefix(
        &self,
        prefix: &str,
        internal_port: u16,
    ) -> Result<Vec<OwnedContainer>, DriverError> {
        let args = vec![
            "ps".to_string(),
            "-a".to_string(),
            "--no-trunc".to_string(),
            "--filter".to_string(),
            format!("name={prefix}-"),
            "--format".to_string(),
            "{{json .}}".to_string(),
        ];
        let stdout = self.exec_ok(&args, "list", LIST_TIMEOUT).await?;

        let mut owned = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            let entry: PsEntry = serde_json::from_str(line)
                .map_err(|e| DriverError::Parse(format!("ps output: {e}")))?;

            // The filter is a substring match at the daemon; enforce the
            // prefix strictly here.
            let name = entry.names.trim_start_matches('/');
            if !name.starts_with(&format!("{prefix}-")) {
                continue;
            }

            let inspected = match self.inspect_full(&entry.id).await {
                Ok(i) => i,
                // Lost a race with an external rm; skip it.
                Err(DriverError::Gone(_)) => continue,
                Err(e) => return Err(e),
            };

            owned.push(OwnedContainer {
                container_id: inspected.id.clone(),
                name: inspected.name.trim_start_matches('/').to_string(),
                state: inspected.state.status.clone(),
                running: inspected.state.running,
                created: inspected.created.clone(),
                host_port: inspected.host_port_for(internal_port),
                env: inspected.config.env.clone(),
                cmd: inspected.config.cmd.clone().unwrap_or_default(),
                device: inspected.device_assignment(),
            });
        }
        Ok(owned)
    }
}

fn daemon_error(output: &std::process::Output) -> DriverError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let message = stderr.trim();
    if message.is_empty() {
        DriverError::Daemon(format!("daemon CLI exited with {}", output.status))
    } else {
        DriverError::Daemon(message.to_string())
    }
}

fn is_no_such_container(output: &std::process::Output) -> bool {
    let stderr = String::from_utf8_lossy(&output.stderr).to_ascii_lowercase();
    stderr.contains("no such container") || stderr.contains("no such object")
}

// ── Inspect wire types ──────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct Inspected {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub created: Option<String>,
    pub state: InspectedState,
    pub config: InspectedConfig,
    #[serde(default)]
    pub host_config: InspectedHostConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct InspectedState {
    pub status: String,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct InspectedConfig {
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct InspectedHostConfig {
    #[serde(default)]
    pub port_bindings: HashMap<String, Option<Vec<PortBinding>>>,
    #[serde(default)]
    pub device_requests: Option<Vec<DeviceRequest>>,
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct PortBinding {
    #[serde(rename = "HostPort", default)]
    pub host_port: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct DeviceRequest {
    #[serde(rename = "Count", default)]
    pub count: Option<i64>,
    #[serde(rename = "DeviceIDs", default)]
    pub device_ids: Option<Vec<String>>,
}

impl Inspected {
    /// Host binding for the engine's internal port.
    fn host_port_for(&self, internal_port: u16) -> Option<u16> {
        let key = format!("{internal_port}/tcp");
        self.host_config
            .port_bindings
            .get(&key)
            .and_then(|bindings| bindings.as_ref())
            .and_then(|bindings| bindings.first())
            .and_then(|binding| binding.host_port.parse().ok())
    }

    /// Recover the device assignment from the device-request block, falling
    /// back to the vendor visibility env var.
    fn device_assignment(&self) -> GpuAssignment {
        if let Some(requests) = &self.host_config.device_requests {
            for request in requests {
                if let Some(ids) = &request.device_ids
                    && let Some(first) = ids.first()
                {
                    if let Ok(id) = first.parse() {
                        return GpuAssignment::Device(id);
                    }
                }
                if request.count == Some(-1) {
                    return GpuAssignment::All;
                }
            }
        }
        for entry in &self.config.env {
            if let Some(value) = entry.strip_prefix("NVIDIA_VISIBLE_DEVICES=") {
                return match value {
                    "all" => GpuAssignment::All,
                    other => other
                        .parse()
                        .map(GpuAssignment::Device)
                        .unwrap_or(GpuAssignment::Cpu),
                };
            }
        }
        GpuAssignment::Cpu
    }
}

#[derive(Debug, Deserialize)]
struct PsEntry {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_spec_args_order() {
        let spec = CreateSpec {
            name: "vllm-x-id".to_string(),
            image: "vllm/vllm-openai:latest".to_string(),
            host_port: 8001,
            container_port: 8000,
            env: vec![("NVIDIA_VISIBLE_DEVICES".to_string(), "0".to_string())],
            volumes: vec![],
            device: Some("device=0".to_string()),
            cmd: vec!["--model".to_string(), "org/m".to_string()],
        };

        let args = spec.to_args();
        assert_eq!(args[0], "create");
        assert!(args.contains(&"--restart".to_string()));
        assert!(args.contains(&"unless-stopped".to_string()));
        assert!(args.contains(&"8001:8000".to_string()));
        assert!(args.contains(&"NVIDIA_VISIBLE_DEVICES=0".to_string()));

        // Image separates host flags from the engine command.
        let image_pos = args.iter().position(|a| a == &spec.image).unwrap();
        let model_pos = args.iter().position(|a| a == "--model").unwrap();
        let gpus_pos = args.iter().position(|a| a == "--gpus").unwrap();
        assert!(gpus_pos < image_pos);
        assert!(image_pos < model_pos);
    }

    #[test]
    fn inspect_parses_daemon_shape() {
        let raw = r#"[{
            "Id": "abc123",
            "Name": "/vllm-x-00000000-0000-4000-8000-000000000000",
            "Created": "2025-01-01T00:00:00Z",
            "State": {"Status": "running", "Running": true, "StartedAt": "2025-01-01T00:00:01Z", "FinishedAt": "0001-01-01T00:00:00Z"},
            "Config": {"Env": ["NVIDIA_VISIBLE_DEVICES=all", "PATH=/bin"], "Cmd": ["--model", "org/m"]},
            "HostConfig": {
                "PortBindings": {"8000/tcp": [{"HostIp": "", "HostPort": "8003"}]},
                "DeviceRequests": [{"Driver": "nvidia", "Count": -1, "Capabilities": [["gpu"]]}]
            }
        }]"#;

        let parsed: Vec<Inspected> = serde_json::from_str(raw).unwrap();
        let inspected = &parsed[0];
        assert_eq!(inspected.id, "abc123");
        assert!(inspected.state.running);
        assert_eq!(inspected.host_port_for(8000), Some(8003));
        assert_eq!(inspected.device_assignment(), GpuAssignment::All);
    }

    #[test]
    fn device_assignment_prefers_device_ids() {
        let raw = r#"[{
            "Id": "x", "Name": "/ollama-a-00000000-0000-4000-8000-000000000000",
            "State": {"Status": "exited", "Running": false},
            "Config": {"Env": []},
            "HostConfig": {"DeviceRequests": [{"DeviceIDs": ["1"]}]}
        }]"#;
        let parsed: Vec<Inspected> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed[0].device_assignment(), GpuAssignment::Device(1));
    }

    #[test]
    fn device_assignment_falls_back_to_env() {
        let raw = r#"[{
            "Id": "x", "Name": "/vllm-a-00000000-0000-4000-8000-000000000000",
            "State": {"Status": "exited", "Running": false},
            "Config": {"Env": ["NVIDIA_VISIBLE_DEVICES=2"]},
            "HostConfig": {}
        }]"#;
        let parsed: Vec<Inspected> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed[0].device_assignment(), GpuAssignment::Device(2));
    }

    #[test]
    fn missing_bindings_yield_no_port() {
        let raw = r#"[{
            "Id": "x", "Name": "/vllm-a-00000000-0000-4000-8000-000000000000",
            "State": {"Status": "created", "Running": false},
            "Config": {"Env": []},
            "HostConfig": {}
        }]"#;
        let parsed: Vec<Inspected> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed[0].host_port_for(8000), None);
    }
}
