//! Ollama driver: at most one container per host, many models inside it.
//!
//! A create request first looks for an existing container with the engine
//! prefix; if one is present the new instance record attaches to it instead
//! of creating a second container. A named volume holds downloaded models so
//! container restarts don't re-pull.

use async_trait::async_trait;
use tracing::{info, warn};

use super::docker::{CreateSpec, DockerCli, OwnedContainer};
use super::{
    ContainerState, CreateError, CreateOutcome, DriverError, EngineDriver, InstanceSpec,
    container_name,
};
use crate::types::{EngineKind, GpuAssignment};

const MODELS_VOLUME: &str = "ollama-models";
const MODELS_MOUNT: &str = "/root/.ollama";

pub struct OllamaDriver {
    cli: DockerCli,
    image: String,
}

impl OllamaDriver {
    pub fn new(cli: DockerCli, image: impl Into<String>) -> Self {
        Self {
            cli,
            image: image.into(),
        }
    }

    fn create_spec(&self, spec: &InstanceSpec) -> CreateSpec {
        let mut env = Vec::new();
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
            name: container_name(EngineKind::Ollama, &spec.name, spec.id),
            image: self.image.clone(),
            host_port: spec.host_port,
            container_port: EngineKind::Ollama.internal_port(),
            env,
            volumes: vec![(MODELS_VOLUME.to_string(), MODELS_MOUNT.to_string())],
            device,
            // The image's own entrypoint serves the engine.
            cmd: vec![],
        }
    }
}

#[async_trait]
impl EngineDriver for OllamaDriver {
    fn kind(&self) -> EngineKind {
        EngineKind::Ollama
    }

    async fn create_and_start(&self, spec: &InstanceSpec) -> Result<CreateOutcome, CreateError> {
        // Reuse an existing engine container if the host already has one.
        let existing = self.list_owned().await?;
        if let Some(container) = existing.first() {
            info!(
                instance = %spec.id,
                container = %container.name,
                "attaching to existing Ollama container"
            );

            if !container.running {
                // Never delete a container we didn't create on failure here.
                self.cli.start(&container.container_id).await?;
            }

            let attached_port = container
                .host_port
                .filter(|p| *p != spec.host_port);
            return Ok(CreateOutcome {
                container_id: container.container_id.clone(),
                device_info: None,
                gpu: container.device,
                attached: true,
                attached_port,
            });
        }

        let create = self.create_spec(spec);
        info!(
            instance = %spec.id,
            container = %create.name,
            port = spec.host_port,
            "creating Ollama container"
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
                EngineKind::Ollama.prefix(),
                EngineKind::Ollama.internal_port(),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InstanceConfig;
    use uuid::Uuid;

    #[test]
    fn create_spec_mounts_model_volume() {
        let driver = OllamaDriver::new(DockerCli::new("docker", None), "ollama/ollama:latest");
        let spec = InstanceSpec {
            id: Uuid::new_v4(),
            name: "shared".to_string(),
            model_ref: None,
            host_port: 8010,
            api_key: None,
            gpu: GpuAssignment::All,
            gpu_count: 2,
            config: InstanceConfig::default(),
        };

        let create = driver.create_spec(&spec);
        assert_eq!(create.container_port, 11434);
        assert_eq!(
            create.volumes,
            vec![(MODELS_VOLUME.to_string(), MODELS_MOUNT.to_string())]
        );
        assert_eq!(create.device.as_deref(), Some("all"));
        assert!(create.cmd.is_empty());
        assert!(create.name.starts_with("ollama-shared-"));
    }
}
