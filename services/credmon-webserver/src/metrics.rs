//! Prometheus metrics exposition
//!
//! The counters themselves are emitted where the work happens:
//!
//! - `credmon_sessions_created_total` (counter)
//! - `credmon_token_exchanges_total` (counter): label `outcome`
//! - `credmon_credential_writes_total` (counter): label `outcome`
//!
//! This module only installs the recorder and describes the metrics.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder and return a handle for rendering.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe();
    Ok(handle)
}

/// Register help text so `/metrics` carries `# HELP` lines.
pub fn describe() {
    metrics::describe_counter!(
        "credmon_sessions_created_total",
        "Sessions started from a key file"
    );
    metrics::describe_counter!(
        "credmon_token_exchanges_total",
        "Authorization code exchanges by outcome"
    );
    metrics::describe_counter!(
        "credmon_credential_writes_total",
        "Credential file triad writes by outcome"
    );
}
