use std::ffi::OsStr;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub struct Telemetry {
    metrics_handle: PrometheusHandle,
}

impl Telemetry {
    /// Installs the Prometheus recorder and a stderr fmt subscriber.
    /// `RUST_LOG` overrides `default_directive`.
    pub fn init(default_directive: &str) -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;

        tracing_subscriber::registry()
            .with(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new(default_directive)),
            )
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(!no_color(std::env::var_os("NO_COLOR").as_deref()))
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        Ok(Self { metrics_handle })
    }

    pub fn render_metrics(&self) -> String {
        self.metrics_handle.render()
    }
}

/// `NO_COLOR` disables colour whenever it is set to a non-empty value.
fn no_color(value: Option<&OsStr>) -> bool {
    value.is_some_and(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_non_empty_no_color_disables_ansi() {
        assert!(no_color(Some(OsStr::new("1"))));
        assert!(no_color(Some(OsStr::new("false"))));
        assert!(no_color(Some(OsStr::new("anything"))));
        assert!(!no_color(Some(OsStr::new(""))));
        assert!(!no_color(None));
    }
}
