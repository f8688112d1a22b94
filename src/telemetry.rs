//! Logging and metrics bootstrap.
//!
//! Installs the `tracing` subscriber (respecting `RUST_LOG`, defaulting to
//! `info`) and the Prometheus metrics recorder whose handle backs the
//! `/metrics` endpoint. Both are process-wide and installed exactly once at
//! startup; calling [`Telemetry::init`] again is a no-op for the subscriber
//! and yields no second recorder.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Handles to the installed telemetry backends.
pub struct Telemetry {
    /// Render handle for Prometheus exposition; `None` when a recorder was
    /// already installed elsewhere in the process.
    pub prometheus: Option<PrometheusHandle>,
}

impl Telemetry {
    /// Install the tracing subscriber and the metrics recorder.
    pub fn init() -> Self {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let subscriber_installed = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .is_ok();
        if !subscriber_installed {
            tracing::debug!("tracing subscriber was already installed");
        }

        let prometheus = match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!(error = %err, "metrics recorder not installed");
                None
            }
        };

        Self { prometheus }
    }
}
