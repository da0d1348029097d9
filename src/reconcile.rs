//! Reconciliation: realign the store with the container daemon.
//!
//! Two concerns, both safe to run at any time:
//!
//! 1. **Orphan import** - containers this system created (recognizable by
//!    the name wire format) that no instance record claims are parsed,
//!    inspected, and re-inserted as records.
//! 2. **Stale reservation cleanup** - port reservations whose owning
//!    instance no longer exists are dropped.
//!
//! A pass holds the write side of the shared operation lock, so it is
//! mutually exclusive with create/remove on any instance.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::driver::{EngineDriver, OwnedContainer, parse_container_name};
use crate::error::ApiError;
use crate::store::Store;
use crate::types::{
    EngineKind, GpuAssignment, Instance, InstanceConfig, InstanceStatus,
};

/// A container eligible for import.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanCandidate {
    pub container_id: String,
    pub container_name: String,
    pub kind: EngineKind,
    pub name: String,
    pub instance_id: Uuid,
    pub port: Option<u16>,
    pub running: bool,
    pub model_ref: Option<String>,
    #[serde(skip)]
    pub gpu: GpuAssignment,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportedOrphan {
    pub instance_id: Uuid,
    pub name: String,
    pub kind: EngineKind,
    pub port: u16,
    pub container_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedOrphan {
    pub container_id: String,
    pub container_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub imported: Vec<ImportedOrphan>,
    pub skipped: Vec<SkippedOrphan>,
    pub stale_reservations_removed: u32,
}

pub struct Reconciler {
    store: Arc<Store>,
    drivers: Vec<Arc<dyn EngineDriver>>,
    /// Shared with the instance manager: writes here exclude per-instance
    /// mutations for the duration of a pass.
    op_lock: Arc<RwLock<()>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<Store>,
        drivers: Vec<Arc<dyn EngineDriver>>,
        op_lock: Arc<RwLock<()>>,
    ) -> Self {
        Self {
            store,
            drivers,
            op_lock,
        }
    }

    /// Full pass: stale-reservation cleanup, then orphan detection and
    /// (optionally) import. `kind` scopes orphan handling to one engine
    /// family; cleanup is always global.
    pub async fn reconcile(
        &self,
        kind: Option<EngineKind>,
        auto_import: bool,
    ) -> Result<ReconcileReport, ApiError> {
        let _guard = self.op_lock.write().await;

        let mut report = ReconcileReport {
            stale_reservations_removed: self.cleanup_stale_reservations().await?,
            ..Default::default()
        };

        let candidates = self.detect(kind).await?;
        if auto_import {
            self.import_candidates(candidates, None, &mut report).await?;
        }

        if !report.imported.is_empty() || report.stale_reservations_removed > 0 {
            info!(
                imported = report.imported.len(),
                skipped = report.skipped.len(),
                stale_ports = report.stale_reservations_removed,
                "reconciliation pass complete"
            );
        }
        Ok(report)
    }

    /// Detect orphans without importing (the dry-run endpoint).
    pub async fn detect_orphans(
        &self,
        kind: Option<EngineKind>,
    ) -> Result<Vec<OrphanCandidate>, ApiError> {
        let _guard = self.op_lock.read().await;
        self.detect(kind).await
    }

    /// Import a named subset of the current orphans.
    pub async fn import_selected(
        &self,
        kind: Option<EngineKind>,
        container_ids: &[String],
    ) -> Result<ReconcileReport, ApiError> {
        let _guard = self.op_lock.write().await;
        let mut report = ReconcileReport::default();
        let candidates = self.detect(kind).await?;
        self.import_candidates(candidates, Some(container_ids), &mut report)
            .await?;
        Ok(report)
    }

    async fn detect(&self, kind: Option<EngineKind>) -> Result<Vec<OrphanCandidate>, ApiError> {
        let mut candidates = Vec::new();

        for driver in &self.drivers {
            if let Some(wanted) = kind
                && driver.kind() != wanted
            {
                continue;
            }

            let owned = match driver.list_owned().await {
                Ok(owned) => owned,
                Err(e) => {
                    // One engine family failing must not hide the other's
                    // orphans.
                    warn!(kind = %driver.kind(), error = %e, "orphan scan failed");
                    continue;
                }
            };

            for container in owned {
                if self
                    .store
                    .container_known(&container.container_id)
                    .await
                    .map_err(store_err)?
                {
                    continue;
                }

                let Some((parsed_kind, name, instance_id)) =
                    parse_container_name(&container.name)
                else {
                    continue;
                };
                if parsed_kind != driver.kind() {
                    continue;
                }
                // The record may exist under a different container id (e.g.
                // replaced out-of-band); never import a duplicate id.
                if self
                    .store
                    .instance_exists(instance_id)
                    .await
                    .map_err(store_err)?
                {
                    continue;
                }

                candidates.push(OrphanCandidate {
                    model_ref: extract_model_ref(&container),
                    container_id: container.container_id,
                    container_name: container.name,
                    kind: parsed_kind,
                    name,
                    instance_id,
                    port: container.host_port,
                    running: container.running,
                    gpu: container.device,
                });
            }
        }

        Ok(candidates)
    }

    async fn import_candidates(
        &self,
        candidates: Vec<OrphanCandidate>,
        only: Option<&[String]>,
        report: &mut ReconcileReport,
    ) -> Result<(), ApiError> {
        for candidate in candidates {
            if let Some(filter) = only
                && !filter.contains(&candidate.container_id)
            {
                continue;
            }

            let Some(port) = candidate.port else {
                report.skipped.push(SkippedOrphan {
                    container_id: candidate.container_id,
                    container_name: candidate.container_name,
                    reason: "no host port binding".to_string(),
                });
                continue;
            };

            // Drop a stale reservation squatting on the port; a live owner
            // means the orphan loses.
            if let Some(owner) = self.store.port_owner(port).await.map_err(store_err)? {
                if self.store.instance_exists(owner).await.map_err(store_err)? {
                    report.skipped.push(SkippedOrphan {
                        container_id: candidate.container_id,
                        container_name: candidate.container_name,
                        reason: "port conflict".to_string(),
                    });
                    continue;
                }
                self.store.release_port(port).await.map_err(store_err)?;
                report.stale_reservations_removed += 1;
            }

            let now = Utc::now();
            let instance = Instance {
                id: candidate.instance_id,
                kind: candidate.kind,
                name: candidate.name.clone(),
                model_ref: candidate.model_ref.clone(),
                port,
                container_id: Some(candidate.container_id.clone()),
                status: if candidate.running {
                    InstanceStatus::Running
                } else {
                    InstanceStatus::Stopped
                },
                api_key_hash: None,
                gpu: candidate.gpu,
                config: InstanceConfig {
                    imported: true,
                    imported_from: Some(candidate.container_name.clone()),
                    imported_at: Some(now),
                    ..InstanceConfig::default()
                },
                created_at: now,
                updated_at: now,
            };

            match self.store.import_orphan(&instance).await {
                Ok(()) => {
                    info!(
                        instance = %instance.id,
                        container = %candidate.container_name,
                        port,
                        "imported orphan container"
                    );
                    report.imported.push(ImportedOrphan {
                        instance_id: instance.id,
                        name: instance.name,
                        kind: instance.kind,
                        port,
                        container_id: candidate.container_id,
                    });
                }
                Err(e) => {
                    warn!(container = %candidate.container_name, error = %e, "orphan import failed");
                    report.skipped.push(SkippedOrphan {
                        container_id: candidate.container_id,
                        container_name: candidate.container_name,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Delete every reservation whose owning instance no longer exists.
    async fn cleanup_stale_reservations(&self) -> Result<u32, ApiError> {
        let mut removed = 0;
        for reservation in self.store.list_reservations().await.map_err(store_err)? {
            if !self
                .store
                .instance_exists(reservation.instance_id)
                .await
                .map_err(store_err)?
            {
                if self
                    .store
                    .release_port(reservation.port)
                    .await
                    .map_err(store_err)?
                {
                    info!(
                        port = reservation.port,
                        instance = %reservation.instance_id,
                        "dropped stale port reservation"
                    );
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// Recover the vLLM model reference from a container's command line or a
/// `MODEL_NAME=` env var.
fn extract_model_ref(container: &OwnedContainer) -> Option<String> {
    if let Some(pos) = container.cmd.iter().position(|a| a == "--model")
        && let Some(value) = container.cmd.get(pos + 1)
    {
        return Some(value.clone());
    }
    container
        .env
        .iter()
        .find_map(|e| e.strip_prefix("MODEL_NAME=").map(str::to_string))
}

fn store_err(e: crate::store::StoreError) -> ApiError {
    ApiError::Internal(format!("store error during reconciliation: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(cmd: &[&str], env: &[&str]) -> OwnedContainer {
        OwnedContainer {
            container_id: "c1".to_string(),
            name: "vllm-x-00000000-0000-4000-8000-000000000000".to_string(),
            state: "running".to_string(),
            running: true,
            created: None,
            host_port: Some(8003),
            env: env.iter().map(|s| s.to_string()).collect(),
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
            device: GpuAssignment::Cpu,
        }
    }

    #[test]
    fn model_ref_from_cmd() {
        let container = owned(&["--model", "org/m", "--port", "8000"], &[]);
        assert_eq!(extract_model_ref(&container).as_deref(), Some("org/m"));
    }

    #[test]
    fn model_ref_from_env_fallback() {
        let container = owned(&[], &["PATH=/bin", "MODEL_NAME=org/env-model"]);
        assert_eq!(
            extract_model_ref(&container).as_deref(),
            Some("org/env-model")
        );
    }

    #[test]
    fn model_ref_missing() {
        let container = owned(&["--port", "8000"], &["PATH=/bin"]);
        assert_eq!(extract_model_ref(&container), None);
    }
}
