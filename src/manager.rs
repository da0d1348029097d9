//! Instance manager - the state machine for an instance.
//!
//! Sequencing, rollback and error mapping live here. Operations on a single
//! instance id are serialized through a per-id mutex; every operation also
//! holds the read side of the shared operation lock so a reconciliation
//! pass (which takes the write side) excludes them wholesale.
//!
//! Create ordering and rollback:
//!
//! ```text
//! validate -> select GPU -> allocate port -> driver create+start -> insert record
//!                              |                  |                      |
//!                              v                  v                      v
//!                        (no cleanup)    release port, remove    remove container,
//!                                        half-made container     release port
//! ```
//!
//! A container is never left behind without a record.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use dashmap::DashMap;
use metrics::counter;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::driver::{CreateError, EngineDriver, InstanceSpec};
use crate::error::ApiError;
use crate::gpu::GpuInventory;
use crate::ports::{AllocError, PortAllocator};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::store::{Store, StoreError};
use crate::types::{
    EngineKind, GpuAssignment, GpuPreference, Instance, InstanceConfig, InstanceStatus,
};

/// Stable prefix every effective API key carries.
pub const API_KEY_PREFIX: &str = "sk-";

/// Bound on how long a read path will wait for reconciliation before
/// returning the stale view with a warning.
const RECONCILE_READ_BUDGET: Duration = Duration::from_secs(5);

/// Upper bound on log tailing.
const MAX_LOG_TAIL: u32 = 10_000;

/// Entropy source for synthesized API keys. Injected so tests can pin the
/// produced key.
pub trait KeySource: Send + Sync {
    /// A fresh key body, without the standard prefix.
    fn synthesize(&self) -> String;
}

/// Default source: derives the key from the current time, like the
/// historical behavior.
pub struct SystemKeySource;

impl KeySource for SystemKeySource {
    fn synthesize(&self) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        format!("{nanos:x}")
    }
}

/// A create (or replace) request after HTTP deserialization.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    pub name: String,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub require_auth: bool,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub gpu_selection: Option<GpuPreference>,
    #[serde(default)]
    pub max_context_length: Option<u32>,
    #[serde(default)]
    pub gpu_memory_utilization: Option<f64>,
    #[serde(default)]
    pub max_num_seqs: Option<u32>,
    #[serde(default)]
    pub trust_remote_code: Option<bool>,
    #[serde(default)]
    pub quantization: Option<String>,
    #[serde(default)]
    pub tensor_parallel_size: Option<u32>,
}

/// A stored record augmented with the daemon's live view.
#[derive(Debug, Clone)]
pub struct InstanceView {
    pub instance: Instance,
    /// Status as the caller should see it; may differ from the stored one
    /// when the daemon disagrees.
    pub status: InstanceStatus,
    pub running: bool,
    pub container_state: Option<String>,
}

/// A listing plus the reconciliation outcome that preceded it.
#[derive(Debug)]
pub struct ReconciledListing {
    pub views: Vec<InstanceView>,
    pub report: Option<ReconcileReport>,
    pub warning: Option<String>,
}

pub struct InstanceManager {
    store: Arc<Store>,
    ports: Arc<PortAllocator>,
    gpus: Arc<GpuInventory>,
    vllm: Arc<dyn EngineDriver>,
    ollama: Arc<dyn EngineDriver>,
    reconciler: Arc<Reconciler>,
    /// Read side taken by every per-instance operation; the reconciler
    /// takes the write side for its passes.
    op_lock: Arc<RwLock<()>>,
    id_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    keys: Arc<dyn KeySource>,
    default_hostname: String,
    default_api_key: Option<String>,
}

impl InstanceManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        ports: Arc<PortAllocator>,
        gpus: Arc<GpuInventory>,
        vllm: Arc<dyn EngineDriver>,
        ollama: Arc<dyn EngineDriver>,
        reconciler: Arc<Reconciler>,
        op_lock: Arc<RwLock<()>>,
        keys: Arc<dyn KeySource>,
        default_hostname: String,
        default_api_key: Option<String>,
    ) -> Self {
        Self {
            store,
            ports,
            gpus,
            vllm,
            ollama,
            reconciler,
            op_lock,
            id_locks: DashMap::new(),
            keys,
            default_hostname,
            default_api_key,
        }
    }

    fn driver(&self, kind: EngineKind) -> &Arc<dyn EngineDriver> {
        match kind {
            EngineKind::Vllm => &self.vllm,
            EngineKind::Ollama => &self.ollama,
        }
    }

    fn id_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.id_locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Merge request defaults and derive the effective API key.
    ///
    /// Supplied keys get the standard prefix if missing; when auth is
    /// required and neither the request nor settings carry a key, one is
    /// synthesized from the injected source.
    async fn effective_api_key(&self, request: &CreateRequest) -> Option<String> {
        if !request.require_auth {
            return None;
        }

        let settings_default = self
            .store
            .get_setting("default_api_key")
            .await
            .ok()
            .flatten()
            .or_else(|| self.default_api_key.clone());

        let raw = request
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or(settings_default)
            .unwrap_or_else(|| self.keys.synthesize());

        Some(ensure_key_prefix(&raw))
    }

    fn build_spec(
        &self,
        kind: EngineKind,
        id: Uuid,
        port: u16,
        request: &CreateRequest,
        api_key: Option<String>,
        gpu: GpuAssignment,
        gpu_count: usize,
    ) -> InstanceSpec {
        let hostname = request
            .hostname
            .clone()
            .or_else(|| Some(self.default_hostname.clone()));

        let mut config = InstanceConfig {
            hostname,
            ..InstanceConfig::default()
        };
        if let Some(v) = request.gpu_memory_utilization {
            config.gpu_memory_utilization = v;
        }
        if let Some(v) = request.max_num_seqs {
            config.max_num_seqs = v;
        }
        config.max_context_length = request.max_context_length;
        if let Some(v) = request.trust_remote_code {
            config.trust_remote_code = v;
        }
        config.quantization = request.quantization.clone().filter(|q| !q.is_empty());
        if let Some(v) = request.tensor_parallel_size {
            config.tensor_parallel_size = v;
        }

        InstanceSpec {
            id,
            name: request.name.trim().to_string(),
            model_ref: if kind == EngineKind::Vllm {
                request.model_name.clone()
            } else {
                None
            },
            host_port: port,
            api_key,
            gpu,
            gpu_count,
            config,
        }
    }

    /// Resolve the device for a request. Create and replace share this so
    /// both derive the container spec identically.
    ///
    /// Tensor parallelism over an auto selection widens to every device
    /// instead of pinning one; a single pinned device with a multi-rank
    /// `--tensor-parallel-size` would be an unlaunchable engine.
    async fn resolve_gpu(
        &self,
        request: &CreateRequest,
    ) -> Result<(GpuAssignment, usize), ApiError> {
        let usage = self.store.gpu_usage().await?;
        let preference = request.gpu_selection.unwrap_or_default();
        let mut gpu = self.gpus.select(preference, &usage).await?;
        let gpu_count = self.gpus.device_count().await;

        if preference == GpuPreference::Auto
            && request.tensor_parallel_size.unwrap_or(1) >= 2
            && gpu_count > 1
        {
            gpu = GpuAssignment::All;
        }
        Ok((gpu, gpu_count))
    }

    fn validate(&self, kind: EngineKind, request: &CreateRequest) -> Result<(), ApiError> {
        if request.name.trim().is_empty() {
            return Err(ApiError::Validation("name must not be empty".to_string()));
        }
        if kind == EngineKind::Vllm
            && request
                .model_name
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .is_empty()
        {
            return Err(ApiError::Validation(
                "modelName is required for vLLM instances".to_string(),
            ));
        }
        Ok(())
    }

    /// Create an instance: validate, select GPU, allocate port, create and
    /// start the container, then persist the record.
    pub async fn create(
        &self,
        kind: EngineKind,
        request: CreateRequest,
    ) -> Result<InstanceView, ApiError> {
        self.validate(kind, &request)?;

        let api_key = self.effective_api_key(&request).await;

        // GPU selection is side-effect free and can fail on a bad specific
        // id, so it runs before the port is taken.
        let (gpu, gpu_count) = self.resolve_gpu(&request).await?;

        let id = Uuid::new_v4();
        let _pass_guard = self.op_lock.read().await;
        let id_lock = self.id_lock(id);
        let _id_guard = id_lock.lock().await;

        let port = match self.ports.allocate(id).await {
            Ok(port) => port,
            Err(AllocError::Exhausted { .. }) => return Err(ApiError::Exhausted),
            Err(AllocError::Store(e)) => return Err(e.into()),
        };

        let spec = self.build_spec(kind, id, port, &request, api_key.clone(), gpu, gpu_count);

        let driver = self.driver(kind);
        let outcome = match driver.create_and_start(&spec).await {
            Ok(outcome) => outcome,
            Err(CreateError {
                error,
                container_id,
            }) => {
                // The daemon may have accepted the create before the start
                // failed; a container without a record must not survive.
                if let Some(ref cid) = container_id
                    && let Err(e) = driver.remove(cid).await
                {
                    error!(container = %cid, error = %e, "rollback removal failed");
                }
                if let Err(e) = self.ports.release(port).await {
                    error!(port, error = %e, "rollback port release failed");
                }
                counter!("modelyard_create_failures_total", "kind" => kind.prefix()).increment(1);
                return Err(error.into());
            }
        };

        // Attached to an existing engine container listening elsewhere:
        // move the reservation to the real port.
        let mut port = port;
        if let Some(existing_port) = outcome.attached_port {
            self.ports.release(port).await?;
            match self.ports.reserve_specific(existing_port, id).await {
                Ok(()) => port = existing_port,
                Err(AllocError::Store(StoreError::Conflict { .. })) => {
                    return Err(ApiError::Conflict(format!(
                        "port {existing_port} of the existing engine container is already reserved"
                    )));
                }
                Err(AllocError::Exhausted { .. }) => unreachable!("specific reservation"),
                Err(AllocError::Store(e)) => return Err(e.into()),
            }
        }

        let now = Utc::now();
        let instance = Instance {
            id,
            kind,
            name: spec.name.clone(),
            model_ref: spec.model_ref.clone(),
            port,
            container_id: Some(outcome.container_id.clone()),
            status: InstanceStatus::Running,
            api_key_hash: api_key,
            gpu: outcome.gpu,
            config: spec.config.clone(),
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.store.create_instance(&instance).await {
            // Never leave a container without a record - but never tear
            // down a shared container we merely attached to.
            if !outcome.attached {
                if let Err(remove_err) = driver.remove(&outcome.container_id).await {
                    error!(
                        container = %outcome.container_id,
                        error = %remove_err,
                        "rollback removal failed"
                    );
                }
            }
            if let Err(release_err) = self.ports.release(port).await {
                error!(port, error = %release_err, "rollback port release failed");
            }
            return Err(e.into());
        }

        info!(
            instance = %id,
            kind = %kind,
            name = %instance.name,
            port,
            container = %outcome.container_id,
            "instance created"
        );
        counter!("modelyard_creates_total", "kind" => kind.prefix()).increment(1);

        Ok(InstanceView {
            status: instance.status,
            running: true,
            container_state: Some("running".to_string()),
            instance,
        })
    }

    /// Replace an instance's configuration: tear down the old container and
    /// run a new one under the same id and port. Rollback is best-effort;
    /// on catastrophic failure the record is left in `error` with no live
    /// container.
    pub async fn update(
        &self,
        kind: EngineKind,
        id: Uuid,
        request: CreateRequest,
    ) -> Result<InstanceView, ApiError> {
        self.validate(kind, &request)?;

        let _pass_guard = self.op_lock.read().await;
        let id_lock = self.id_lock(id);
        let _id_guard = id_lock.lock().await;

        let current = self
            .store
            .get_instance(kind, id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("instance {id}")))?;

        let api_key = self.effective_api_key(&request).await;

        let (gpu, gpu_count) = self.resolve_gpu(&request).await?;

        let driver = self.driver(kind);
        if let Some(ref old_container) = current.container_id {
            let shared = self
                .store
                .container_shared(kind, old_container, id)
                .await
                .unwrap_or(false);
            if !shared
                && let Err(e) = driver.remove(old_container).await
            {
                return Err(e.into());
            }
        }

        let spec =
            self.build_spec(kind, id, current.port, &request, api_key.clone(), gpu, gpu_count);

        match driver.create_and_start(&spec).await {
            Ok(outcome) => {
                let updated = Instance {
                    id,
                    kind,
                    name: spec.name.clone(),
                    model_ref: spec.model_ref.clone(),
                    port: current.port,
                    container_id: Some(outcome.container_id),
                    status: InstanceStatus::Running,
                    api_key_hash: api_key,
                    gpu: outcome.gpu,
                    config: spec.config.clone(),
                    created_at: current.created_at,
                    updated_at: Utc::now(),
                };
                self.store.update_instance(&updated).await?;
                info!(instance = %id, "instance configuration replaced");
                Ok(InstanceView {
                    status: updated.status,
                    running: true,
                    container_state: Some("running".to_string()),
                    instance: updated,
                })
            }
            Err(CreateError {
                error,
                container_id,
            }) => {
                if let Some(ref cid) = container_id
                    && let Err(e) = driver.remove(cid).await
                {
                    error!(container = %cid, error = %e, "rollback removal failed");
                }
                // The old container is gone and the new one failed: record
                // the wreckage honestly.
                let mut broken = current;
                broken.container_id = None;
                broken.status = InstanceStatus::Error;
                if let Err(e) = self.store.update_instance(&broken).await {
                    error!(instance = %id, error = %e, "failed to mark instance as errored");
                }
                Err(error.into())
            }
        }
    }

    pub async fn start(&self, kind: EngineKind, id: Uuid) -> Result<InstanceView, ApiError> {
        self.lifecycle(kind, id, LifecycleOp::Start).await
    }

    pub async fn stop(&self, kind: EngineKind, id: Uuid) -> Result<InstanceView, ApiError> {
        self.lifecycle(kind, id, LifecycleOp::Stop).await
    }

    pub async fn restart(&self, kind: EngineKind, id: Uuid) -> Result<InstanceView, ApiError> {
        self.lifecycle(kind, id, LifecycleOp::Restart).await
    }

    async fn lifecycle(
        &self,
        kind: EngineKind,
        id: Uuid,
        op: LifecycleOp,
    ) -> Result<InstanceView, ApiError> {
        let _pass_guard = self.op_lock.read().await;
        let id_lock = self.id_lock(id);
        let _id_guard = id_lock.lock().await;

        let mut instance = self
            .store
            .get_instance(kind, id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("instance {id}")))?;

        let container_id = instance
            .container_id
            .clone()
            .ok_or_else(|| ApiError::Gone(format!("instance {id} has no container")))?;

        let driver = self.driver(kind);
        let new_status = match op {
            LifecycleOp::Start => {
                driver.start(&container_id).await?;
                InstanceStatus::Running
            }
            LifecycleOp::Stop => {
                driver.stop(&container_id).await?;
                InstanceStatus::Stopped
            }
            LifecycleOp::Restart => {
                driver.restart(&container_id).await?;
                InstanceStatus::Running
            }
        };

        // The daemon already did the work; a failed bookkeeping write is
        // the reconciler's problem, not the caller's.
        if let Err(e) = self.store.update_status(kind, id, new_status).await {
            warn!(instance = %id, error = %e, "status write failed after successful driver call");
        } else {
            instance.status = new_status;
        }

        Ok(InstanceView {
            status: new_status,
            running: new_status == InstanceStatus::Running,
            container_state: None,
            instance,
        })
    }

    /// Remove an instance: container first (idempotently), then the port
    /// reservation, then the record.
    pub async fn remove(&self, kind: EngineKind, id: Uuid) -> Result<(), ApiError> {
        let _pass_guard = self.op_lock.read().await;
        let id_lock = self.id_lock(id);
        let _id_guard = id_lock.lock().await;

        let instance = self
            .store
            .get_instance(kind, id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("instance {id}")))?;

        if let Some(ref container_id) = instance.container_id {
            let shared = self
                .store
                .container_shared(kind, container_id, id)
                .await
                .unwrap_or(false);
            if shared {
                info!(
                    instance = %id,
                    container = %container_id,
                    "leaving shared engine container in place"
                );
            } else if let Err(e) = self.driver(kind).remove(container_id).await {
                // remove() already normalizes "gone" to success, so any
                // error here is real; keep the record intact.
                return Err(e.into());
            }
        }

        if let Err(e) = self.ports.release(instance.port).await {
            warn!(port = instance.port, error = %e, "port release failed during remove");
        }
        self.store.delete_instance(kind, id).await?;
        self.id_locks.remove(&id);

        info!(instance = %id, kind = %kind, port = instance.port, "instance removed");
        counter!("modelyard_removes_total", "kind" => kind.prefix()).increment(1);
        Ok(())
    }

    /// Stored records augmented with live daemon status. A driver failure
    /// on one record degrades that record, never the whole call.
    pub async fn list(&self, kind: EngineKind) -> Result<Vec<InstanceView>, ApiError> {
        let _pass_guard = self.op_lock.read().await;
        let records = self.store.list_instances(kind, None).await?;

        let mut views = Vec::with_capacity(records.len());
        for record in records {
            views.push(self.observe(record).await);
        }
        Ok(views)
    }

    pub async fn get(&self, kind: EngineKind, id: Uuid) -> Result<InstanceView, ApiError> {
        let _pass_guard = self.op_lock.read().await;
        let record = self
            .store
            .get_instance(kind, id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("instance {id}")))?;
        Ok(self.observe(record).await)
    }

    /// Pull the daemon's view of one record and refresh the stored status
    /// when they disagree (best effort).
    async fn observe(&self, record: Instance) -> InstanceView {
        let Some(ref container_id) = record.container_id else {
            return InstanceView {
                status: record.status,
                running: false,
                container_state: None,
                instance: record,
            };
        };

        match self.driver(record.kind).inspect(container_id).await {
            Ok(state) => {
                let observed = if state.running {
                    InstanceStatus::Running
                } else {
                    InstanceStatus::Stopped
                };
                if observed != record.status
                    && record.status != InstanceStatus::Error
                    && let Err(e) = self
                        .store
                        .update_status(record.kind, record.id, observed)
                        .await
                {
                    warn!(instance = %record.id, error = %e, "status refresh failed");
                }
                InstanceView {
                    status: observed,
                    running: state.running,
                    container_state: Some(state.status),
                    instance: record,
                }
            }
            Err(e) => {
                // Container vanished or the daemon is unwell: degrade this
                // record only.
                warn!(instance = %record.id, error = %e, "live status unavailable");
                let _ = self
                    .store
                    .update_status(record.kind, record.id, InstanceStatus::Error)
                    .await;
                InstanceView {
                    status: InstanceStatus::Error,
                    running: false,
                    container_state: None,
                    instance: record,
                }
            }
        }
    }

    /// Reconcile, then list. The pass runs detached: if it exceeds the read
    /// budget the stale listing is returned with a warning while the pass
    /// finishes in the background.
    pub async fn list_with_reconcile(&self, kind: EngineKind) -> ReconciledListing {
        let reconciler = Arc::clone(&self.reconciler);
        let handle =
            tokio::spawn(async move { reconciler.reconcile(Some(kind), true).await });

        let (report, warning) = match tokio::time::timeout(RECONCILE_READ_BUDGET, handle).await {
            Ok(Ok(Ok(report))) => (Some(report), None),
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "reconciliation failed; serving stale listing");
                (None, Some(format!("reconciliation failed: {e}")))
            }
            Ok(Err(join_err)) => {
                error!(error = %join_err, "reconciliation task panicked");
                (None, Some("reconciliation failed".to_string()))
            }
            Err(_) => {
                warn!("reconciliation exceeded read budget; serving stale listing");
                (
                    None,
                    Some("reconciliation still in progress; listing may be stale".to_string()),
                )
            }
        };

        let views = match self.list(kind).await {
            Ok(views) => views,
            Err(e) => {
                error!(error = %e, "listing failed after reconcile");
                Vec::new()
            }
        };

        ReconciledListing {
            views,
            report,
            warning,
        }
    }

    pub async fn logs(
        &self,
        kind: EngineKind,
        id: Uuid,
        tail: Option<u32>,
    ) -> Result<String, ApiError> {
        let _pass_guard = self.op_lock.read().await;
        let instance = self
            .store
            .get_instance(kind, id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("instance {id}")))?;
        let container_id = instance
            .container_id
            .ok_or_else(|| ApiError::Gone(format!("instance {id} has no container")))?;

        let tail = tail.unwrap_or(100).min(MAX_LOG_TAIL);
        Ok(self.driver(kind).logs(&container_id, tail).await?)
    }
}

#[derive(Debug, Clone, Copy)]
enum LifecycleOp {
    Start,
    Stop,
    Restart,
}

/// Add the standard prefix unless the key already carries it.
pub fn ensure_key_prefix(raw: &str) -> String {
    if raw.starts_with(API_KEY_PREFIX) {
        raw.to_string()
    } else {
        format!("{API_KEY_PREFIX}{raw}")
    }
}

impl From<crate::driver::DriverError> for ApiError {
    fn from(e: crate::driver::DriverError) -> Self {
        use crate::driver::DriverError;
        match e {
            DriverError::Gone(id) => ApiError::Gone(id),
            DriverError::Timeout { op, secs } => {
                ApiError::Timeout(format!("{op} exceeded {secs}s"))
            }
            other => ApiError::Driver(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_prefix_added_once() {
        assert_eq!(ensure_key_prefix("k"), "sk-k");
        assert_eq!(ensure_key_prefix("sk-k"), "sk-k");
        assert_eq!(ensure_key_prefix(""), "sk-");
    }

    #[test]
    fn system_key_source_is_nonempty() {
        let key = SystemKeySource.synthesize();
        assert!(!key.is_empty());
        assert!(!key.starts_with(API_KEY_PREFIX));
    }

    #[test]
    fn create_request_accepts_api_shape() {
        let request: CreateRequest = serde_json::from_str(
            r#"{
                "name": "x",
                "modelName": "org/model",
                "requireAuth": true,
                "apiKey": "k",
                "gpuSelection": "least_used",
                "maxContextLength": 8192,
                "gpuMemoryUtilization": 0.9,
                "tensorParallelSize": 2
            }"#,
        )
        .unwrap();
        assert_eq!(request.name, "x");
        assert_eq!(request.model_name.as_deref(), Some("org/model"));
        assert!(request.require_auth);
        assert_eq!(request.gpu_selection, Some(GpuPreference::LeastUsed));
        assert_eq!(request.tensor_parallel_size, Some(2));
    }
}
