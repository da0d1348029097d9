//! GPU discovery and selection.
//!
//! Topology comes from the vendor query tool (`nvidia-smi`) and is cached
//! after the first use until an explicit refresh. A host with no devices
//! (or no tool) runs in CPU-only mode: every selection resolves to the CPU
//! sentinel.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::types::{GpuAssignment, GpuPreference};

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// One discovered device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuDevice {
    pub id: u32,
    pub name: String,
    pub memory_total_mb: u64,
    pub memory_free_mb: u64,
    pub utilization_pct: u32,
}

pub struct GpuInventory {
    smi_command: String,
    cache: RwLock<Option<Vec<GpuDevice>>>,
}

impl GpuInventory {
    pub fn new(smi_command: impl Into<String>) -> Self {
        Self {
            smi_command: smi_command.into(),
            cache: RwLock::new(None),
        }
    }

    /// Devices from the cache, discovering on first use.
    pub async fn devices(&self) -> Vec<GpuDevice> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            return cached.clone();
        }
        self.refresh().await
    }

    /// Re-run discovery and replace the cache.
    pub async fn refresh(&self) -> Vec<GpuDevice> {
        let devices = self.discover().await;
        *self.cache.write().await = Some(devices.clone());
        devices
    }

    /// Invoke the vendor tool. Any failure (missing binary, bad exit,
    /// unparseable output, timeout) yields an empty topology: CPU-only mode.
    async fn discover(&self) -> Vec<GpuDevice> {
        let result = tokio::time::timeout(
            QUERY_TIMEOUT,
            Command::new(&self.smi_command)
                .args([
                    "--query-gpu=index,name,memory.total,memory.free,utilization.gpu",
                    "--format=csv,noheader,nounits",
                ])
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await;

        let output = match result {
            Ok(Ok(out)) if out.status.success() => out,
            Ok(Ok(out)) => {
                warn!(
                    status = %out.status,
                    stderr = %String::from_utf8_lossy(&out.stderr).trim_end(),
                    "GPU query tool failed, assuming CPU-only host"
                );
                return vec![];
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(command = %self.smi_command, "GPU query tool not found, CPU-only mode");
                return vec![];
            }
            Ok(Err(e)) => {
                warn!(error = %e, "failed to run GPU query tool");
                return vec![];
            }
            Err(_) => {
                warn!("GPU query timed out");
                return vec![];
            }
        };

        let text = String::from_utf8_lossy(&output.stdout);
        let devices: Vec<GpuDevice> = text.lines().filter_map(parse_query_line).collect();
        debug!(count = devices.len(), "discovered GPUs");
        devices
    }

    /// Pick a device for a new instance.
    ///
    /// `usage` is the derived per-GPU running-instance count from the store.
    /// Selection is advisory: the driver still has to wire the chosen device
    /// into the container spec.
    pub async fn select(
        &self,
        preference: GpuPreference,
        usage: &HashMap<String, u32>,
    ) -> Result<GpuAssignment, ApiError> {
        if preference == GpuPreference::Cpu {
            return Ok(GpuAssignment::Cpu);
        }

        let devices = self.devices().await;
        if devices.is_empty() {
            // Asking for a device that cannot exist is an error; every other
            // preference degrades to CPU.
            if let GpuPreference::Specific(id) = preference {
                return Err(ApiError::Validation(format!(
                    "GPU {id} requested but no GPUs were detected"
                )));
            }
            return Ok(GpuAssignment::Cpu);
        }

        match preference {
            GpuPreference::Cpu => Ok(GpuAssignment::Cpu),
            GpuPreference::Specific(id) => {
                if devices.iter().any(|d| d.id == id) {
                    Ok(GpuAssignment::Device(id))
                } else {
                    Err(ApiError::Validation(format!(
                        "GPU {id} requested but not present (detected: {})",
                        devices.len()
                    )))
                }
            }
            // "First" means literally GPU 0, not the head of the discovery
            // list: on hosts where id 0 is masked or removed, enumeration
            // starts at a higher id and picking the head would silently
            // land on the wrong device. Absent GPU 0 fails the same way
            // `specific(0)` does.
            GpuPreference::First => match devices.iter().find(|d| d.id == 0) {
                Some(device) => Ok(GpuAssignment::Device(device.id)),
                None => Err(ApiError::Validation(format!(
                    "GPU 0 requested but not present (detected: {})",
                    devices.len()
                ))),
            },
            GpuPreference::Auto | GpuPreference::LeastUsed => {
                let mut ranked: Vec<&GpuDevice> = devices.iter().collect();
                // Ascending by running instances, then descending by free
                // memory, then lowest id.
                ranked.sort_by(|a, b| {
                    let a_used = usage.get(&a.id.to_string()).copied().unwrap_or(0);
                    let b_used = usage.get(&b.id.to_string()).copied().unwrap_or(0);
                    a_used
                        .cmp(&b_used)
                        .then(b.memory_free_mb.cmp(&a.memory_free_mb))
                        .then(a.id.cmp(&b.id))
                });
                Ok(GpuAssignment::Device(ranked[0].id))
            }
        }
    }

    /// Number of devices currently known (0 in CPU-only mode).
    pub async fn device_count(&self) -> usize {
        self.devices().await.len()
    }
}

fn parse_query_line(line: &str) -> Option<GpuDevice> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 5 {
        return None;
    }
    Some(GpuDevice {
        id: fields[0].parse().ok()?,
        name: fields[1].to_string(),
        memory_total_mb: fields[2].parse().ok()?,
        memory_free_mb: fields[3].parse().ok()?,
        utilization_pct: fields[4].parse().unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory_with(devices: Vec<GpuDevice>) -> GpuInventory {
        let inv = GpuInventory::new("nvidia-smi-not-a-real-binary");
        *inv.cache.try_write().unwrap() = Some(devices);
        inv
    }

    fn device(id: u32, free_mb: u64) -> GpuDevice {
        GpuDevice {
            id,
            name: format!("GPU-{id}"),
            memory_total_mb: 24_000,
            memory_free_mb: free_mb,
            utilization_pct: 0,
        }
    }

    #[test]
    fn parse_query_line_happy_path() {
        let parsed = parse_query_line("0, NVIDIA RTX A6000, 49140, 48000, 3").unwrap();
        assert_eq!(parsed.id, 0);
        assert_eq!(parsed.name, "NVIDIA RTX A6000");
        assert_eq!(parsed.memory_total_mb, 49140);
        assert_eq!(parsed.memory_free_mb, 48000);
        assert_eq!(parsed.utilization_pct, 3);
    }

    #[test]
    fn parse_query_line_rejects_garbage() {
        assert!(parse_query_line("").is_none());
        assert!(parse_query_line("not,a,gpu").is_none());
    }

    #[tokio::test]
    async fn cpu_preference_short_circuits() {
        let inv = inventory_with(vec![device(0, 1000)]);
        let pick = inv
            .select(GpuPreference::Cpu, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(pick, GpuAssignment::Cpu);
    }

    #[tokio::test]
    async fn no_devices_degrades_to_cpu() {
        let inv = inventory_with(vec![]);
        for pref in [
            GpuPreference::Auto,
            GpuPreference::First,
            GpuPreference::LeastUsed,
        ] {
            assert_eq!(
                inv.select(pref, &HashMap::new()).await.unwrap(),
                GpuAssignment::Cpu
            );
        }
    }

    #[tokio::test]
    async fn specific_missing_device_fails() {
        let inv = inventory_with(vec![device(0, 1000)]);
        let err = inv
            .select(GpuPreference::Specific(7), &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));

        // And with no devices at all.
        let inv = inventory_with(vec![]);
        let err = inv
            .select(GpuPreference::Specific(0), &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn least_used_prefers_idle_device() {
        let inv = inventory_with(vec![device(0, 10_000), device(1, 20_000)]);
        let mut usage = HashMap::new();
        usage.insert("0".to_string(), 2u32);

        let pick = inv.select(GpuPreference::Auto, &usage).await.unwrap();
        assert_eq!(pick, GpuAssignment::Device(1));
    }

    #[tokio::test]
    async fn least_used_ties_break_on_free_memory_then_id() {
        // Same usage; device 1 has more free memory.
        let inv = inventory_with(vec![device(0, 10_000), device(1, 20_000)]);
        let pick = inv
            .select(GpuPreference::LeastUsed, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(pick, GpuAssignment::Device(1));

        // Fully tied: lowest id wins.
        let inv = inventory_with(vec![device(0, 10_000), device(1, 10_000)]);
        let pick = inv
            .select(GpuPreference::LeastUsed, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(pick, GpuAssignment::Device(0));
    }

    #[tokio::test]
    async fn first_preference_takes_device_zero() {
        let inv = inventory_with(vec![device(0, 10), device(1, 20_000)]);
        let pick = inv
            .select(GpuPreference::First, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(pick, GpuAssignment::Device(0));

        // Selection is by id, not by position in the discovery list.
        let inv = inventory_with(vec![device(1, 20_000), device(0, 10)]);
        let pick = inv
            .select(GpuPreference::First, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(pick, GpuAssignment::Device(0));
    }

    #[tokio::test]
    async fn first_preference_fails_when_gpu_zero_absent() {
        // GPU 0 masked or removed: ids start at 1.
        let inv = inventory_with(vec![device(1, 20_000), device(2, 20_000)]);
        let err = inv
            .select(GpuPreference::First, &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn missing_tool_means_cpu_only() {
        let inv = GpuInventory::new("definitely-not-nvidia-smi-xyz");
        assert_eq!(inv.device_count().await, 0);
    }
}
