//! Engine drivers - translate instance specs into container workloads.
//!
//! Two engine families share one interface: the vLLM driver runs one model
//! per container, the Ollama driver keeps at most one container per host and
//! attaches further instance records to it. Both delegate daemon plumbing to
//! [`docker::DockerCli`].

mod docker;
mod ollama;
mod vllm;

pub use docker::{CreateSpec, DockerCli, OwnedContainer};
pub use ollama::OllamaDriver;
pub use vllm::VllmDriver;

use async_trait::async_trait;
use uuid::Uuid;

use crate::types::{EngineKind, GpuAssignment, InstanceConfig};

/// Errors from a driver. Daemon messages propagate unchanged; "no such
/// container" is normalized per operation (success on remove/stop, `Gone`
/// on start/restart/inspect).
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("container no longer exists: {0}")]
    Gone(String),

    #[error("{op} timed out after {secs}s")]
    Timeout { op: &'static str, secs: u64 },

    #[error("container daemon error: {0}")]
    Daemon(String),

    #[error("failed to invoke container daemon CLI: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected daemon output: {0}")]
    Parse(String),
}

/// A create failure, carrying the container id when the daemon had already
/// accepted the create. The caller owns cleanup: it must remove that
/// container (and release the instance's port) before surfacing the error.
#[derive(Debug)]
pub struct CreateError {
    pub error: DriverError,
    pub container_id: Option<String>,
}

impl From<DriverError> for CreateError {
    fn from(error: DriverError) -> Self {
        Self {
            error,
            container_id: None,
        }
    }
}

/// Validated input to `create_and_start`.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub id: Uuid,
    pub name: String,
    pub model_ref: Option<String>,
    pub host_port: u16,
    /// Effective plain-text API key, already prefixed.
    pub api_key: Option<String>,
    pub gpu: GpuAssignment,
    /// Number of GPUs detected on the host, for tensor-parallel clamping.
    pub gpu_count: usize,
    pub config: InstanceConfig,
}

/// Result of a successful `create_and_start`.
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub container_id: String,
    /// The device wiring that was applied (`"all"`, `"device=0"`, ...).
    pub device_info: Option<String>,
    pub gpu: GpuAssignment,
    /// True when the record was attached to a pre-existing container
    /// (Ollama only). Rollback must never remove such a container.
    pub attached: bool,
    /// Set when the attached container's host port differs from the
    /// requested one.
    pub attached_port: Option<u16>,
}

/// Live container state as reported by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub status: String,
    pub running: bool,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

#[async_trait]
pub trait EngineDriver: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Create and start the container for `spec`. On error the caller is
    /// responsible for releasing the port and removing any container named
    /// in the error.
    async fn create_and_start(&self, spec: &InstanceSpec) -> Result<CreateOutcome, CreateError>;

    async fn start(&self, container_id: &str) -> Result<(), DriverError>;
    async fn stop(&self, container_id: &str) -> Result<(), DriverError>;
    async fn restart(&self, container_id: &str) -> Result<(), DriverError>;

    /// Idempotent: removing an absent container is success.
    async fn remove(&self, container_id: &str) -> Result<(), DriverError>;

    async fn inspect(&self, container_id: &str) -> Result<ContainerState, DriverError>;

    /// Both streams, truncated to the last `tail` lines.
    async fn logs(&self, container_id: &str, tail: u32) -> Result<String, DriverError>;

    /// Containers whose name carries this engine's prefix, whether or not
    /// the store knows about them.
    async fn list_owned(&self) -> Result<Vec<OwnedContainer>, DriverError>;
}

/// Format the container name for an instance: `{prefix}-{name}-{uuid}`.
///
/// This is the contract with orphan recovery; breaking it orphans future
/// restarts.
pub fn container_name(kind: EngineKind, name: &str, id: Uuid) -> String {
    format!("{}-{}-{}", kind.prefix(), name, id)
}

/// Parse a container name produced by [`container_name`]. Returns `None`
/// for names that don't match the wire format (foreign containers).
pub fn parse_container_name(raw: &str) -> Option<(EngineKind, String, Uuid)> {
    let trimmed = raw.strip_prefix('/').unwrap_or(raw);

    let (prefix, rest) = trimmed.split_once('-')?;
    let kind = EngineKind::from_prefix(prefix)?;

    // The uuid is the last 36 characters in canonical 8-4-4-4-12 form; the
    // human label in the middle may itself contain dashes.
    if rest.len() < 38 {
        return None;
    }
    let (name, uuid_part) = rest.split_at(rest.len() - 37);
    let uuid_part = uuid_part.strip_prefix('-')?;
    if name.is_empty() {
        return None;
    }
    let id = Uuid::try_parse(uuid_part).ok()?;
    // Reject non-canonical forms (urn:, braces, simple) that try_parse accepts.
    if id.to_string() != uuid_part {
        return None;
    }
    Some((kind, name.to_string(), id))
}
