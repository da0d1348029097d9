//! Configuration for modelyard.
//!
//! All knobs come from the environment (the deployment contract), with CLI
//! overrides applied in `main`. `docker_command` and `nvidia_smi_command`
//! exist so tests can point the drivers at mock binaries.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Top-level process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP listen port for the control API.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Prometheus metrics port (0 to disable).
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Inclusive low end of the host-port range handed to instances.
    #[serde(default = "default_min_port")]
    pub min_port: u16,

    /// Inclusive high end of the host-port range.
    #[serde(default = "default_max_port")]
    pub max_port: u16,

    /// Hostname callers use to reach instances (and the puller uses to
    /// reach the Ollama engine).
    #[serde(default = "default_hostname")]
    pub default_hostname: String,

    /// Path of the embedded database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Container daemon socket; passed to the CLI as DOCKER_HOST when set.
    #[serde(default)]
    pub docker_socket_path: Option<String>,

    /// Command used to talk to the container daemon (default: "docker").
    /// Can be overridden for testing with mock-docker.
    #[serde(default = "default_docker_command")]
    pub docker_command: String,

    /// Image for vLLM instance containers.
    #[serde(default = "default_vllm_image")]
    pub vllm_image: String,

    /// Image for the Ollama container.
    #[serde(default = "default_ollama_image")]
    pub ollama_image: String,

    /// Command used for GPU discovery (default: "nvidia-smi").
    #[serde(default = "default_nvidia_smi_command")]
    pub nvidia_smi_command: String,

    /// Default API key applied when a create request requires auth but
    /// supplies no key and no key is synthesized.
    #[serde(default)]
    pub default_api_key: Option<String>,

    /// Model-registry access token injected into vLLM containers.
    #[serde(default)]
    pub hf_token: Option<String>,

    /// CORS origin for the browser UI in production.
    #[serde(default)]
    pub frontend_url: Option<String>,

    /// Import orphaned containers at startup.
    #[serde(default = "default_auto_import")]
    pub auto_import: bool,
}

fn default_port() -> u16 {
    3001
}

fn default_metrics_port() -> u16 {
    0
}

fn default_min_port() -> u16 {
    8001
}

fn default_max_port() -> u16 {
    8999
}

fn default_hostname() -> String {
    "127.0.0.1".to_string()
}

fn default_db_path() -> String {
    "modelyard.db".to_string()
}

fn default_docker_command() -> String {
    "docker".to_string()
}

fn default_vllm_image() -> String {
    "vllm/vllm-openai:latest".to_string()
}

fn default_ollama_image() -> String {
    "ollama/ollama:latest".to_string()
}

fn default_nvidia_smi_command() -> String {
    "nvidia-smi".to_string()
}

fn default_auto_import() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            metrics_port: default_metrics_port(),
            min_port: default_min_port(),
            max_port: default_max_port(),
            default_hostname: default_hostname(),
            db_path: default_db_path(),
            docker_socket_path: None,
            docker_command: default_docker_command(),
            vllm_image: default_vllm_image(),
            ollama_image: default_ollama_image(),
            nvidia_smi_command: default_nvidia_smi_command(),
            default_api_key: None,
            hf_token: None,
            frontend_url: None,
            auto_import: default_auto_import(),
        }
    }
}

impl Config {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Some(v) = env_parse::<u16>("PORT")? {
            config.port = v;
        }
        if let Some(v) = env_parse::<u16>("METRICS_PORT")? {
            config.metrics_port = v;
        }
        if let Some(v) = env_parse::<u16>("MIN_PORT")? {
            config.min_port = v;
        }
        if let Some(v) = env_parse::<u16>("MAX_PORT")? {
            config.max_port = v;
        }
        if let Some(v) = env_string("DEFAULT_HOSTNAME") {
            config.default_hostname = v;
        }
        if let Some(v) = env_string("DB_PATH") {
            config.db_path = v;
        }
        config.docker_socket_path = env_string("DOCKER_SOCKET_PATH");
        if let Some(v) = env_string("DOCKER_COMMAND") {
            config.docker_command = v;
        }
        if let Some(v) = env_string("VLLM_IMAGE") {
            config.vllm_image = v;
        }
        if let Some(v) = env_string("OLLAMA_IMAGE") {
            config.ollama_image = v;
        }
        config.default_api_key = env_string("DEFAULT_API_KEY");
        config.hf_token =
            env_string("HUGGING_FACE_HUB_TOKEN").or_else(|| env_string("HF_TOKEN"));
        config.frontend_url = env_string("FRONTEND_URL");

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the rest of the system cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.min_port > self.max_port {
            bail!(
                "port range is empty: MIN_PORT={} > MAX_PORT={}",
                self.min_port,
                self.max_port
            );
        }
        if self.port >= self.min_port && self.port <= self.max_port {
            bail!(
                "control API port {} falls inside the instance port range [{}, {}]",
                self.port,
                self.min_port,
                self.max_port
            );
        }
        Ok(())
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        None => Ok(None),
        Some(raw) => match raw.parse() {
            Ok(v) => Ok(Some(v)),
            Err(_) => bail!("invalid value for {}: {:?}", key, raw),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.port, 3001);
        assert_eq!(config.min_port, 8001);
        assert_eq!(config.max_port, 8999);
        assert!(config.min_port <= config.max_port);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_port_range_rejected() {
        let config = Config {
            min_port: 9000,
            max_port: 8000,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn api_port_inside_instance_range_rejected() {
        let config = Config {
            port: 8500,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
