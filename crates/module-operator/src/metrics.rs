//! Prometheus metrics and the health endpoints served next to them.
//!
//! # Metrics
//!
//! - `module_operator_reconcile_total{controller, outcome}` - reconciles by outcome
//! - `module_operator_reconcile_duration_seconds{controller}` - reconcile duration

use std::{
    future::Future,
    net::{Ipv6Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{extract::State, http::StatusCode, routing::get, Router};
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use snafu::{ResultExt, Snafu};
use strum::IntoStaticStr;

/// Histogram buckets for reconcile durations (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to register metric {name:?}"))]
    RegisterMetric {
        source: prometheus::Error,
        name: &'static str,
    },

    #[snafu(display("failed to encode metrics"))]
    EncodeMetrics { source: prometheus::Error },

    #[snafu(display("invalid bind address {address:?}"))]
    InvalidBindAddress {
        source: std::net::AddrParseError,
        address: String,
    },

    #[snafu(display("failed to bind metrics server to {address}"))]
    BindMetricsServer {
        source: std::io::Error,
        address: SocketAddr,
    },

    #[snafu(display("metrics server failed"))]
    ServeMetrics { source: std::io::Error },
}

#[derive(Clone, Copy, Debug, IntoStaticStr, PartialEq, Eq)]
#[strum(serialize_all = "snake_case")]
pub enum Outcome {
    Done,
    Requeue,
    Error,
}

pub struct Metrics {
    registry: Registry,
    reconciles: IntCounterVec,
    reconcile_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self, Error> {
        let registry = Registry::new();

        let reconciles = IntCounterVec::new(
            Opts::new("module_operator_reconcile_total", "Total reconciles by outcome"),
            &["controller", "outcome"],
        )
        .context(RegisterMetricSnafu {
            name: "module_operator_reconcile_total",
        })?;
        registry
            .register(Box::new(reconciles.clone()))
            .context(RegisterMetricSnafu {
                name: "module_operator_reconcile_total",
            })?;

        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new(
                "module_operator_reconcile_duration_seconds",
                "Duration of reconciles",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["controller"],
        )
        .context(RegisterMetricSnafu {
            name: "module_operator_reconcile_duration_seconds",
        })?;
        registry
            .register(Box::new(reconcile_duration.clone()))
            .context(RegisterMetricSnafu {
                name: "module_operator_reconcile_duration_seconds",
            })?;

        Ok(Self {
            registry,
            reconciles,
            reconcile_duration,
        })
    }

    pub fn observe(&self, controller: &str, outcome: Outcome, elapsed: Duration) {
        let outcome: &'static str = outcome.into();
        self.reconciles
            .with_label_values(&[controller, outcome])
            .inc();
        self.reconcile_duration
            .with_label_values(&[controller])
            .observe(elapsed.as_secs_f64());
    }

    /// Renders all metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, Error> {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .context(EncodeMetricsSnafu)
    }
}

/// Set once the controllers are running.
#[derive(Clone, Debug, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn set_ready(&self, ready: bool) {
        self.0.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct AppState {
    metrics: Arc<Metrics>,
    readiness: Readiness,
}

/// Parses bind addresses of the form `host:port` or `:port`, the latter meaning all interfaces.
pub fn parse_bind_address(address: &str) -> Result<SocketAddr, Error> {
    let full = if address.starts_with(':') {
        format!("[{}]{address}", Ipv6Addr::UNSPECIFIED)
    } else {
        address.to_owned()
    };
    full.parse().context(InvalidBindAddressSnafu { address })
}

pub fn router(metrics: Arc<Metrics>, readiness: Readiness) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(ready))
        .with_state(AppState { metrics, readiness })
}

/// Serves `/metrics`, `/healthz` and `/readyz` until `shutdown` completes.
pub async fn serve(
    address: SocketAddr,
    metrics: Arc<Metrics>,
    readiness: Readiness,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .context(BindMetricsServerSnafu { address })?;
    tracing::info!(%address, "Serving metrics and health endpoints");

    axum::serve(listener, router(metrics, readiness))
        .with_graceful_shutdown(shutdown)
        .await
        .context(ServeMetricsSnafu)
}

async fn render_metrics(State(state): State<AppState>) -> (StatusCode, String) {
    match state.metrics.encode() {
        Ok(body) => (StatusCode::OK, body),
        Err(err) => {
            tracing::warn!(error = &err as &dyn std::error::Error, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn ready(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.readiness.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn observed_reconciles_are_encoded() {
        let metrics = Metrics::new().unwrap();
        metrics.observe("modulelifecycle", Outcome::Done, Duration::from_millis(20));
        metrics.observe("modulelifecycle", Outcome::Requeue, Duration::from_millis(20));
        metrics.observe("modulelifecycle", Outcome::Requeue, Duration::from_millis(20));

        let encoded = metrics.encode().unwrap();
        assert!(encoded.contains(
            r#"module_operator_reconcile_total{controller="modulelifecycle",outcome="requeue"} 2"#
        ));
        assert!(encoded.contains("module_operator_reconcile_duration_seconds_bucket"));
    }

    #[rstest]
    #[case::port_only(":8080", "[::]:8080")]
    #[case::ipv4("127.0.0.1:9090", "127.0.0.1:9090")]
    fn bind_addresses(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(
            parse_bind_address(input).unwrap(),
            expected.parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn invalid_bind_address_is_rejected() {
        assert!(parse_bind_address(":http").is_err());
        assert!(parse_bind_address("nonsense").is_err());
    }

    #[test]
    fn readiness_toggles() {
        let readiness = Readiness::default();
        assert!(!readiness.is_ready());
        readiness.clone().set_ready(true);
        assert!(readiness.is_ready());
    }
}
