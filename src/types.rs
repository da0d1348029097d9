//! Shared domain types used across the codebase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Engine family an instance belongs to.
///
/// vLLM runs one model per container; Ollama hosts many models inside a
/// single container and pulls them on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Vllm,
    Ollama,
}

impl EngineKind {
    /// Container-name prefix. This is a wire format: the reconciler parses
    /// it back out of `docker ps` output, so it must never change.
    pub fn prefix(self) -> &'static str {
        match self {
            EngineKind::Vllm => "vllm",
            EngineKind::Ollama => "ollama",
        }
    }

    /// The port the engine listens on inside its container.
    pub fn internal_port(self) -> u16 {
        match self {
            EngineKind::Vllm => 8000,
            EngineKind::Ollama => 11434,
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "vllm" => Some(EngineKind::Vllm),
            "ollama" => Some(EngineKind::Ollama),
            _ => None,
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Stored lifecycle status of an instance. `Removed` is terminal; the row
/// is deleted rather than kept in that state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Creating,
    Running,
    Stopped,
    Error,
    Removed,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Creating => "creating",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Error => "error",
            InstanceStatus::Removed => "removed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "creating" => Some(InstanceStatus::Creating),
            "running" => Some(InstanceStatus::Running),
            "stopped" => Some(InstanceStatus::Stopped),
            "error" => Some(InstanceStatus::Error),
            "removed" => Some(InstanceStatus::Removed),
            _ => None,
        }
    }
}

/// Where an instance's workload runs: a specific GPU, every visible GPU, or
/// plain CPU. Stored in the database as `"0"`/`"1"`/... , `"auto"`, or NULL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuAssignment {
    Cpu,
    Device(u32),
    All,
}

impl GpuAssignment {
    pub fn to_column(self) -> Option<String> {
        match self {
            GpuAssignment::Cpu => None,
            GpuAssignment::Device(id) => Some(id.to_string()),
            GpuAssignment::All => Some("auto".to_string()),
        }
    }

    pub fn from_column(value: Option<&str>) -> Self {
        match value {
            None => GpuAssignment::Cpu,
            Some("auto") => GpuAssignment::All,
            Some(s) => s
                .parse()
                .map(GpuAssignment::Device)
                .unwrap_or(GpuAssignment::Cpu),
        }
    }
}

/// User-facing GPU selection preference on a create request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuPreference {
    #[default]
    Auto,
    Cpu,
    First,
    LeastUsed,
    #[serde(untagged)]
    Specific(u32),
}

/// Engine-specific structured configuration, stored as JSON on the record.
///
/// The vLLM fields drive command-line construction in the driver; Ollama
/// instances only use `hostname`. Imported orphans carry the import marker
/// and their original container name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(default = "default_gpu_memory_utilization")]
    pub gpu_memory_utilization: f64,

    #[serde(default = "default_max_num_seqs")]
    pub max_num_seqs: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context_length: Option<u32>,

    #[serde(default)]
    pub trust_remote_code: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,

    #[serde(default = "default_tensor_parallel_size")]
    pub tensor_parallel_size: u32,

    /// Set on records recovered from orphaned containers.
    #[serde(default)]
    pub imported: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_from: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<DateTime<Utc>>,
}

fn default_gpu_memory_utilization() -> f64 {
    0.85
}

fn default_max_num_seqs() -> u32 {
    256
}

fn default_tensor_parallel_size() -> u32 {
    1
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            gpu_memory_utilization: default_gpu_memory_utilization(),
            max_num_seqs: default_max_num_seqs(),
            max_context_length: None,
            trust_remote_code: false,
            quantization: None,
            tensor_parallel_size: default_tensor_parallel_size(),
            imported: false,
            imported_from: None,
            imported_at: None,
        }
    }
}

/// The primary entity: a declarative record of "run model M under engine E
/// on port P" plus its bound container identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub id: Uuid,
    pub kind: EngineKind,
    pub name: String,
    pub model_ref: Option<String>,
    pub port: u16,
    pub container_id: Option<String>,
    pub status: InstanceStatus,
    pub api_key_hash: Option<String>,
    pub gpu: GpuAssignment,
    pub config: InstanceConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn requires_auth(&self) -> bool {
        self.api_key_hash.is_some()
    }
}

/// Model record scoped to an Ollama instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OllamaModel {
    pub id: i64,
    pub instance_id: Uuid,
    pub name: String,
    pub status: ModelStatus,
    pub size: Option<i64>,
    pub digest: Option<String>,
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Downloading,
    Ready,
    Failed,
}

impl ModelStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelStatus::Downloading => "downloading",
            ModelStatus::Ready => "ready",
            ModelStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "downloading" => Some(ModelStatus::Downloading),
            "ready" => Some(ModelStatus::Ready),
            "failed" => Some(ModelStatus::Failed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_assignment_column_round_trip() {
        for gpu in [
            GpuAssignment::Cpu,
            GpuAssignment::Device(0),
            GpuAssignment::Device(3),
            GpuAssignment::All,
        ] {
            let col = gpu.to_column();
            assert_eq!(GpuAssignment::from_column(col.as_deref()), gpu);
        }
    }

    #[test]
    fn gpu_preference_deserialize() {
        let p: GpuPreference = serde_json::from_str(r#""auto""#).unwrap();
        assert_eq!(p, GpuPreference::Auto);
        let p: GpuPreference = serde_json::from_str(r#""least_used""#).unwrap();
        assert_eq!(p, GpuPreference::LeastUsed);
        let p: GpuPreference = serde_json::from_str("2").unwrap();
        assert_eq!(p, GpuPreference::Specific(2));
    }

    #[test]
    fn instance_config_defaults() {
        let config: InstanceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.gpu_memory_utilization, 0.85);
        assert_eq!(config.max_num_seqs, 256);
        assert_eq!(config.tensor_parallel_size, 1);
        assert!(!config.trust_remote_code);
        assert!(!config.imported);
    }

    #[test]
    fn status_parse_inverse_of_as_str() {
        for status in [
            InstanceStatus::Creating,
            InstanceStatus::Running,
            InstanceStatus::Stopped,
            InstanceStatus::Error,
            InstanceStatus::Removed,
        ] {
            assert_eq!(InstanceStatus::parse(status.as_str()), Some(status));
        }
    }
}
