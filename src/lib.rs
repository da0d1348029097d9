//! # modelyard
//!
//! Container control plane for on-host inference engines. Declarative
//! instance requests go in; running vLLM/Ollama containers with stable host
//! ports come out. A SQLite store is the source of truth, and a reconciler
//! re-aligns it with the container daemon after crashes or out-of-band
//! `docker` commands.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       modelyard                           │
//! │  ┌─────────────────────────────────────────────────────┐  │
//! │  │ Control API (axum)                                  │  │
//! │  │ /api/containers  /api/ollama  /api/system           │  │
//! │  └──────────────────────────┬──────────────────────────┘  │
//! │                             │                             │
//! │  ┌──────────────────────────▼──────────────────────────┐  │
//! │  │ Instance Manager                                    │  │
//! │  │ - per-id serialization, rollback, error mapping     │  │
//! │  └───┬──────────┬───────────┬──────────────┬───────────┘  │
//! │      ▼          ▼           ▼              ▼              │
//! │  [Store]  [Port Alloc]  [GPU Inventory]  [Engine Driver]  │
//! │   sqlite    lowest-free   nvidia-smi      vLLM | Ollama   │
//! │      ▲                                        │           │
//! │      └──────────── [Reconciler] ◄─────────────┘           │
//! │            orphan import, stale reservations              │
//! └───────────────────────────────┬───────────────────────────┘
//!                                 ▼
//!                        container daemon (docker)
//! ```

pub mod api;
pub mod config;
pub mod driver;
pub mod error;
pub mod gpu;
pub mod manager;
pub mod ports;
pub mod puller;
pub mod reconcile;
pub mod store;
pub mod telemetry;
pub(crate) mod types;

pub use api::AppState;
pub use config::Config;
pub use error::ApiError;
pub use manager::{CreateRequest, InstanceManager, KeySource, SystemKeySource};
pub use reconcile::Reconciler;
pub use types::{
    EngineKind, GpuAssignment, GpuPreference, Instance, InstanceConfig, InstanceStatus,
    ModelStatus, OllamaModel,
};

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::sync::RwLock;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::driver::{DockerCli, EngineDriver, OllamaDriver, VllmDriver};
use crate::gpu::GpuInventory;
use crate::ports::PortAllocator;
use crate::puller::ModelPuller;
use crate::store::Store;

/// Build the complete modelyard stack.
///
/// Returns the axum router (everything nested under `/api`) and the shared
/// application state, so callers (main, tests) can reach the reconciler
/// for the startup pass.
pub async fn build_app(config: Config) -> Result<(Router, AppState)> {
    build_app_with_keys(config, Arc::new(SystemKeySource)).await
}

/// Like [`build_app`] but with an injected API key source (tests pin it).
pub async fn build_app_with_keys(
    config: Config,
    keys: Arc<dyn KeySource>,
) -> Result<(Router, AppState)> {
    config.validate()?;

    let store = Arc::new(
        Store::connect(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path))?,
    );

    // The range is fixed at process start and must not shrink below
    // reservations a previous run handed out.
    let reservations = store.list_reservations().await?;
    if let Some(outside) = reservations
        .iter()
        .find(|r| r.port < config.min_port || r.port > config.max_port)
    {
        anyhow::bail!(
            "configured port range [{}, {}] excludes existing reservation {} (instance {})",
            config.min_port,
            config.max_port,
            outside.port,
            outside.instance_id,
        );
    }

    let ports = Arc::new(PortAllocator::new(
        Arc::clone(&store),
        config.min_port,
        config.max_port,
    ));
    let gpus = Arc::new(GpuInventory::new(config.nvidia_smi_command.clone()));

    let cli = DockerCli::new(
        config.docker_command.clone(),
        config.docker_socket_path.as_deref(),
    );
    let vllm: Arc<dyn EngineDriver> = Arc::new(VllmDriver::new(
        cli.clone(),
        config.vllm_image.clone(),
        config.hf_token.clone(),
    ));
    let ollama: Arc<dyn EngineDriver> =
        Arc::new(OllamaDriver::new(cli, config.ollama_image.clone()));

    let op_lock = Arc::new(RwLock::new(()));
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&store),
        vec![Arc::clone(&vllm), Arc::clone(&ollama)],
        Arc::clone(&op_lock),
    ));

    let manager = Arc::new(InstanceManager::new(
        Arc::clone(&store),
        ports,
        Arc::clone(&gpus),
        vllm,
        ollama,
        Arc::clone(&reconciler),
        op_lock,
        keys,
        config.default_hostname.clone(),
        config.default_api_key.clone(),
    ));

    let puller = Arc::new(ModelPuller::new(
        Arc::clone(&store),
        config.default_hostname.clone(),
    ));

    let state = AppState {
        manager,
        reconciler,
        puller,
        gpus,
        store,
    };

    let cors = match &config.frontend_url {
        Some(origin) => CorsLayer::new()
            .allow_origin(AllowOrigin::exact(
                origin.parse().context("invalid FRONTEND_URL")?,
            ))
            .allow_methods(Any)
            .allow_headers(Any),
        None => CorsLayer::permissive(),
    };

    let app = Router::new()
        .nest("/api", api::api_router(state.clone()))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    info!(
        min_port = config.min_port,
        max_port = config.max_port,
        db = %config.db_path,
        "modelyard stack assembled"
    );

    Ok((app, state))
}
