//! HTTP health endpoints (Axum router).
//!
//! Three probes with different contracts:
//! - `/health/liveness`: is the process alive; never touches dependencies.
//! - `/health/readiness`: can the process serve traffic; 503 when a
//!   critical dependency is down, naming the failing component.
//! - `/health`: comprehensive diagnostics, always 200; for humans and
//!   dashboards, not for load-balancer routing.

use crate::health::{HealthAggregator, HealthReport};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;

/// Build the health router around an aggregator.
///
/// The router is self-contained and can be merged into a larger application
/// router.
pub fn health_router(aggregator: Arc<HealthAggregator>) -> Router {
    Router::new()
        .route("/health", get(comprehensive))
        .route("/health/liveness", get(liveness))
        .route("/health/readiness", get(readiness))
        .with_state(aggregator)
}

async fn liveness() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn readiness(State(aggregator): State<Arc<HealthAggregator>>) -> Response {
    let report = aggregator.readiness().await;

    let (code, status) = if report.healthy {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not-ready")
    };

    (
        code,
        Json(json!({
            "status": status,
            "components": components_json(&report),
        })),
    )
        .into_response()
}

async fn comprehensive(State(aggregator): State<Arc<HealthAggregator>>) -> Json<Value> {
    let started = Instant::now();
    let report = aggregator.diagnostics().await;
    let response_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    Json(json!({
        "status": if report.healthy { "healthy" } else { "degraded" },
        "components": components_json(&report),
        "responseTimeMs": response_time_ms,
    }))
}

fn components_json(report: &HealthReport) -> Value {
    let components: serde_json::Map<String, Value> = report
        .results
        .iter()
        .map(|result| {
            (
                result.component.to_string(),
                serde_json::to_value(result).unwrap_or(Value::Null),
            )
        })
        .collect();
    Value::Object(components)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthProbe;
    use anyhow::anyhow;
    use axum::body::Body;
    use axum::http::Request;
    use futures_util::future::BoxFuture;
    use tower::ServiceExt;

    struct StubProbe {
        name: &'static str,
        fail: bool,
    }

    impl HealthProbe for StubProbe {
        fn component(&self) -> &'static str {
            self.name
        }

        fn check(&self) -> BoxFuture<'_, anyhow::Result<Option<String>>> {
            Box::pin(async move {
                if self.fail {
                    Err(anyhow!("unreachable"))
                } else {
                    Ok(None)
                }
            })
        }
    }

    fn router_with(fail_broker: bool) -> Router {
        let aggregator = HealthAggregator::new()
            .critical(StubProbe { name: "datastore", fail: false })
            .critical(StubProbe { name: "broker", fail: fail_broker })
            .diagnostic(StubProbe { name: "queue", fail: false });
        health_router(Arc::new(aggregator))
    }

    async fn get_json(router: Router, path: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap();
        (status, body)
    }

    #[tokio::test]
    async fn liveness_is_static_ok() {
        let (status, body) = get_json(router_with(false), "/health/liveness").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn readiness_reports_ready_when_dependencies_are_up() {
        let (status, body) = get_json(router_with(false), "/health/readiness").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
        assert_eq!(body["components"]["datastore"]["healthy"], true);
        assert_eq!(body["components"]["broker"]["healthy"], true);
        // Diagnostic probes do not participate in readiness.
        assert!(body["components"].get("queue").is_none());
    }

    #[tokio::test]
    async fn readiness_returns_503_naming_the_broken_component() {
        let (status, body) = get_json(router_with(true), "/health/readiness").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "not-ready");
        assert_eq!(body["components"]["broker"]["healthy"], false);
        assert_eq!(body["components"]["broker"]["detail"], "unreachable");
    }

    #[tokio::test]
    async fn comprehensive_is_200_even_when_degraded() {
        let (status, body) = get_json(router_with(true), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["components"]["queue"]["healthy"], true);
        assert!(body["responseTimeMs"].is_u64());
    }
}
