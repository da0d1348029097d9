//! Prometheus metrics setup and descriptions.
//!
//! Metrics are recorded throughout the codebase using the `metrics` crate's
//! macros. This module installs the Prometheus exporter and registers
//! human-readable descriptions for each metric.

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::PrometheusHandle;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns `None` if a recorder is already installed (e.g. in tests where
/// multiple processes-worth of setup share one binary). Metric recording
/// still works - the macros route to whichever recorder won.
pub fn install() -> Option<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok()?;
    describe();
    Some(handle)
}

fn describe() {
    describe_counter!(
        "modelyard_creates_total",
        "Instances created, labelled by engine kind"
    );
    describe_counter!(
        "modelyard_create_failures_total",
        "Create attempts rolled back after a driver failure"
    );
    describe_counter!(
        "modelyard_removes_total",
        "Instances removed, labelled by engine kind"
    );
    describe_gauge!(
        "modelyard_ports_reserved",
        "Port reservations currently held"
    );
}
