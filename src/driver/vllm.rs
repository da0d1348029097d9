//! vLLM driver: one model per container.

use async_trait::async_trait;
use tracing::{info, warn};

use super::docker::{CreateSpec, DockerCli, OwnedContainer};
use super::{
    ContainerState, CreateError, CreateOutcome, DriverError, EngineDriver, InstanceSpec,
    container_name,
};
use crate::types::{EngineKind, GpuAssignment};

pub struct VllmDriver {
    cli: DockerCli,
    image: String,
    hf_token: Option<String>,
}

impl VllmDriver {
    pub fn new(cli: DockerCli, image: impl Into<String>, hf_token: Option<String>) -> Self {
        Self {
            cli,
            image: image.into(),
            hf_token,
        }
    }

    /// Derive the vLLM server command line from the instance spec.
    fn engine_args(spec: &InstanceSpec) -> Vec<String> {
        let model = spec.model_ref.clone().unwrap_or_default();
        let mut args = vec![
            "--model".to_string(),
            model,
            "--port".to_string(),
            EngineKind::Vllm.internal_port().to_string(),
            "--host".to_string(),
            "0.0.0.0".to_string(),
        ];

        if let Some(key) = &spec.api_key {
            args.push("--api-key".to_string());
            args.push(key.clone());
        }

        args.push("--gpu-memory-utilization".to_string());
        args.push(format_float(spec.config.gpu_memory_utilization));
        args.push("--max-num-seqs".to_string());
        args.push(spec.config.max_num_seqs.to_string());

        if let Some(max_len) = spec.config.max_context_length {
            args.push("--max-model-len".to_string());
            args.push(max_len.to_string());
        }
        if spec.config.trust_remote_code {
            args.push("--trust-remote-code".to_string());
        }
        if let Some(quant) = spec
            .config
            .quantization
            .as_deref()
            .filter(|q| !q.is_empty())
        {
            args.push("--quantization".to_string());
            args.push(quant.to_string());
        }

        if let Some(tp) = tensor_parallel_size(spec) {
            args.push("--tensor-parallel-size".to_string());
            args.push(tp.to_string());
        }

        args
    }

    fn create_spec(&self, spec: &InstanceSpec) -> CreateSpec {
        let mut env = Vec::new();
        if let Some(token) = &self.hf_token {
            env.push(("HUGGING_FACE_HUB_TOKEN".to_string(), token.clone()));
        }
        let device = match spec.gpu {
            GpuAssignment::Cpu => None,
            GpuAssignment::Device(id) => {
                env.push(("NVIDIA_VISIBLE_DEVICES".to_string(), id.to_string()));
                Some(format!("device={id}"))
            }
            GpuAssignment::All => {
                env.push(("NVIDIA_VISIBLE_DEVICES".to_string(), "all".to_string()));
                Some("all".to_string())
            }
        };

        CreateSpec {
            name: container_name(EngineKind::Vllm, &spec.name, spec.id),
            image: self.image.clone(),
            host_port: spec.host_port,
            container_port: EngineKind::Vllm.internal_port(),
            env,
            volumes: vec![],
            device,
            cmd: Self::engine_args(spec),
        }
    }
}

/// Effective tensor-parallel size, clamped to the detected device count.
/// `None` means the flag is omitted entirely.
fn tensor_parallel_size(spec: &InstanceSpec) -> Option<u32> {
    let requested = spec.config.tensor_parallel_size;
    let devices = spec.gpu_count as u32;

    if requested >= 2 {
        return Some(requested.min(devices.max(1)));
    }
    // Auto GPU over multiple devices shards across all of them.
    if spec.gpu == GpuAssignment::All && devices >= 2 {
        return Some(devices);
    }
    None
}

fn format_float(value: f64) -> String {
    // Display gives "0.85", not "0.850000".
    format!("{value}")
}

#[async_trait]
impl EngineDriver for VllmDriver {
    fn kind(&self) -> EngineKind {
        EngineKind::Vllm
    }

    async fn create_and_start(&self, spec: &InstanceSpec) -> Result<CreateOutcome, CreateError> {
        let create = self.create_spec(spec);
        info!(
            instance = %spec.id,
            container = %create.name,
            port = spec.host_port,
            "creating vLLM container"
        );

        let container_id = self.cli.create(&create).await?;

        if let Err(e) = self.cli.start(&container_id).await {
            warn!(container = %container_id, error = %e, "start after create failed");
            return Err(CreateError {
                error: e,
                container_id: Some(container_id),
            });
        }

        Ok(CreateOutcome {
            container_id,
            device_info: create.device,
            gpu: spec.gpu,
            attached: false,
            attached_port: None,
        })
    }

    async fn start(&self, container_id: &str) -> Result<(), DriverError> {
        self.cli.start(container_id).await
    }

    async fn stop(&self, container_id: &str) -> Result<(), DriverError> {
        self.cli.stop(container_id).await
    }

    async fn restart(&self, container_id: &str) -> Result<(), DriverError> {
        self.cli.restart(container_id).await
    }

    async fn remove(&self, container_id: &str) -> Result<(), DriverError> {
        self.cli.remove(container_id).await
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerState, DriverError> {
        self.cli.inspect(container_id).await
    }

    async fn logs(&self, container_id: &str, tail: u32) -> Result<String, DriverError> {
        self.cli.logs(container_id, tail).await
    }

    async fn list_owned(&self) -> Result<Vec<OwnedContainer>, DriverError> {
        self.cli
            .list_by_prefix(
                EngineKind::Vllm.prefix(),
                EngineKind::Vllm.internal_port(),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InstanceConfig;
    use uuid::Uuid;

    fn spec() -> InstanceSpec {
        InstanceSpec {
            id: Uuid::new_v4(),
            name: "x".to_string(),
            model_ref: Some("org/model".to_string()),
            host_port: 8001,
            api_key: None,
            gpu: GpuAssignment::Cpu,
            gpu_count: 0,
            config: InstanceConfig::default(),
        }
    }

    fn has_flag_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn base_args_always_present() {
        let args = VllmDriver::engine_args(&spec());
        assert!(has_flag_value(&args, "--model", "org/model"));
        assert!(has_flag_value(&args, "--port", "8000"));
        assert!(has_flag_value(&args, "--host", "0.0.0.0"));
        assert!(has_flag_value(&args, "--gpu-memory-utilization", "0.85"));
        assert!(has_flag_value(&args, "--max-num-seqs", "256"));
    }

    #[test]
    fn no_auth_means_no_api_key_flag() {
        let args = VllmDriver::engine_args(&spec());
        assert!(!args.iter().any(|a| a == "--api-key"));
    }

    #[test]
    fn api_key_passed_when_auth_required() {
        let mut s = spec();
        s.api_key = Some("sk-k".to_string());
        let args = VllmDriver::engine_args(&s);
        assert!(has_flag_value(&args, "--api-key", "sk-k"));
    }

    #[test]
    fn optional_flags_follow_config() {
        let mut s = spec();
        s.config.max_context_length = Some(4096);
        s.config.trust_remote_code = true;
        s.config.quantization = Some("awq".to_string());
        let args = VllmDriver::engine_args(&s);
        assert!(has_flag_value(&args, "--max-model-len", "4096"));
        assert!(args.iter().any(|a| a == "--trust-remote-code"));
        assert!(has_flag_value(&args, "--quantization", "awq"));
    }

    #[test]
    fn empty_quantization_is_omitted() {
        let mut s = spec();
        s.config.quantization = Some(String::new());
        let args = VllmDriver::engine_args(&s);
        assert!(!args.iter().any(|a| a == "--quantization"));
    }

    #[test]
    fn tensor_parallel_clamped_to_device_count() {
        let mut s = spec();
        s.config.tensor_parallel_size = 4;
        s.gpu = GpuAssignment::All;
        s.gpu_count = 2;
        let args = VllmDriver::engine_args(&s);
        assert!(has_flag_value(&args, "--tensor-parallel-size", "2"));
    }

    #[test]
    fn tensor_parallel_auto_over_all_devices() {
        let mut s = spec();
        s.gpu = GpuAssignment::All;
        s.gpu_count = 4;
        let args = VllmDriver::engine_args(&s);
        assert!(has_flag_value(&args, "--tensor-parallel-size", "4"));
    }

    #[test]
    fn tensor_parallel_omitted_for_single_device() {
        let mut s = spec();
        s.gpu = GpuAssignment::Device(0);
        s.gpu_count = 1;
        let args = VllmDriver::engine_args(&s);
        assert!(!args.iter().any(|a| a == "--tensor-parallel-size"));
    }

    #[test]
    fn device_block_wires_visibility_env() {
        let driver = VllmDriver::new(
            DockerCli::new("docker", None),
            "vllm/vllm-openai:latest",
            Some("hf_abc".to_string()),
        );
        let mut s = spec();
        s.gpu = GpuAssignment::Device(1);
        let create = driver.create_spec(&s);
        assert_eq!(create.device.as_deref(), Some("device=1"));
        assert!(
            create
                .env
                .contains(&("NVIDIA_VISIBLE_DEVICES".to_string(), "1".to_string()))
        );
        assert!(
            create
                .env
                .contains(&("HUGGING_FACE_HUB_TOKEN".to_string(), "hf_abc".to_string()))
        );
    }
}
