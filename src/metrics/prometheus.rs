//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, register_int_counter_vec,
    register_int_gauge, CounterVec, Encoder, Gauge, HistogramVec, IntCounterVec, IntGauge,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Total number of reconciliations by outcome
    pub static ref RECONCILIATIONS: IntCounterVec = register_int_counter_vec!(
        "barman_cloud_operator_reconciliations_total",
        "Total number of ObjectStore reconciliations by outcome",
        &["outcome"]
    ).expect("reconciliations metric");

    /// Total number of reconciliation errors by class
    pub static ref RECONCILIATION_ERRORS: IntCounterVec = register_int_counter_vec!(
        "barman_cloud_operator_reconciliation_errors_total",
        "Total number of reconciliation errors by class",
        &["class"]
    ).expect("reconciliation errors metric");

    /// Reconciliation duration histogram
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "barman_cloud_operator_reconcile_duration_seconds",
        "Duration of reconciliations in seconds",
        &["outcome"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).expect("reconcile duration metric");

    /// Writes issued against derivatives
    pub static ref DERIVATIVE_WRITES: CounterVec = register_counter_vec!(
        "barman_cloud_operator_derivative_writes_total",
        "Create, update and delete calls issued for derivatives",
        &["kind", "operation"]
    ).expect("derivative writes metric");

    /// Deletions held back by referencing Clusters or Backups
    pub static ref DELETIONS_BLOCKED: IntCounterVec = register_int_counter_vec!(
        "barman_cloud_operator_deletions_blocked_total",
        "ObjectStore deletions blocked by live references",
        &["namespace"]
    ).expect("deletions blocked metric");

    /// ObjectStores currently carrying the finalizer
    pub static ref MANAGED_OBJECT_STORES: IntGauge = register_int_gauge!(
        "barman_cloud_operator_managed_object_stores",
        "Number of ObjectStores carrying the operator finalizer"
    ).expect("managed object stores metric");

    /// Operator health (1 = healthy, 0 = unhealthy), set by the controller
    /// once it is watching and cleared when it stops
    pub static ref OPERATOR_HEALTH: Gauge = register_gauge!(
        "barman_cloud_operator_health",
        "Operator health status (1 = healthy, 0 = unhealthy)"
    ).expect("health metric");
}

/// Start the metrics HTTP server; returns once `shutdown` fires
pub async fn serve(port: u16, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!("Error serving connection: {}", e);
            }
        });
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => metrics_response(),
        "/healthz" | "/health" => text_response(StatusCode::OK, "ok"),
        "/readyz" | "/ready" => ready_response(),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

/// Generate metrics response
fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    if let Ok(content_type) = HeaderValue::from_str(encoder.format_type()) {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    response
}

/// Ready while the controller is running
fn ready_response() -> Response<Full<Bytes>> {
    if OPERATOR_HEALTH.get() >= 1.0 {
        text_response(StatusCode::OK, "ok")
    } else {
        text_response(StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_are_exported_under_the_operator_prefix() {
        RECONCILIATIONS.with_label_values(&["converged"]).inc();
        let body = metrics_response();
        assert_eq!(body.status(), StatusCode::OK);
        assert!(prometheus::gather()
            .iter()
            .any(|m| m.get_name() == "barman_cloud_operator_reconciliations_total"));
    }

    #[test]
    fn readiness_follows_the_controller() {
        OPERATOR_HEALTH.set(0.0);
        assert_eq!(ready_response().status(), StatusCode::SERVICE_UNAVAILABLE);

        OPERATOR_HEALTH.set(1.0);
        assert_eq!(ready_response().status(), StatusCode::OK);

        OPERATOR_HEALTH.set(0.0);
    }

    #[test]
    fn unknown_paths_are_not_found() {
        assert_eq!(
            text_response(StatusCode::NOT_FOUND, "Not Found").status(),
            StatusCode::NOT_FOUND
        );
    }
}
