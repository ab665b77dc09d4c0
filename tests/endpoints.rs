#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]

use anyhow::anyhow;
use futures_util::future::BoxFuture;
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use workhorse::{HealthAggregator, HealthProbe, health_router};

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// Bind the health router to an ephemeral port.
    async fn spawn(aggregator: HealthAggregator) -> Self {
        let app = health_router(Arc::new(aggregator));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{addr}");

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let response = reqwest::get(format!("{}{path}", self.base_url))
            .await
            .expect("request failed");
        let status = response.status();
        let body = response.json().await.expect("non-JSON response body");
        (status, body)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

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
                Err(anyhow!("connection refused"))
            } else {
                Ok(Some("42 jobs in flight".to_string()))
            }
        })
    }
}

struct HungProbe;

impl HealthProbe for HungProbe {
    fn component(&self) -> &'static str {
        "datastore"
    }

    fn check(&self) -> BoxFuture<'_, anyhow::Result<Option<String>>> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        })
    }
}

#[tokio::test]
async fn liveness_answers_without_touching_dependencies() {
    // Liveness must stay green even when every dependency probe would hang.
    let server = TestServer::spawn(
        HealthAggregator::new()
            .probe_timeout(Duration::from_secs(2))
            .critical(HungProbe),
    )
    .await;

    let started = Instant::now();
    let (status, body) = server.get("/health/liveness").await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn readiness_is_200_when_critical_dependencies_are_up() {
    let server = TestServer::spawn(
        HealthAggregator::new()
            .critical(StubProbe { name: "datastore", fail: false })
            .critical(StubProbe { name: "broker", fail: false }),
    )
    .await;

    let (status, body) = server.get("/health/readiness").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
    assert_eq!(body["components"]["datastore"]["healthy"], true);
    assert_eq!(body["components"]["broker"]["detail"], "42 jobs in flight");
}

#[tokio::test]
async fn readiness_is_503_when_a_dependency_fails() {
    let server = TestServer::spawn(
        HealthAggregator::new()
            .critical(StubProbe { name: "datastore", fail: false })
            .critical(StubProbe { name: "broker", fail: true }),
    )
    .await;

    let (status, body) = server.get("/health/readiness").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "not-ready");
    assert_eq!(body["components"]["datastore"]["healthy"], true);
    assert_eq!(body["components"]["broker"]["healthy"], false);
    assert_eq!(body["components"]["broker"]["detail"], "connection refused");
}

#[tokio::test]
async fn readiness_reports_a_hung_datastore_as_timeout_within_the_window() {
    let server = TestServer::spawn(
        HealthAggregator::new()
            .probe_timeout(Duration::from_secs(2))
            .critical(HungProbe)
            .critical(StubProbe { name: "broker", fail: false }),
    )
    .await;

    let started = Instant::now();
    let (status, body) = server.get("/health/readiness").await;

    // The aggregator cuts the probe off at its timeout instead of hanging.
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "not-ready");
    assert_eq!(body["components"]["datastore"]["healthy"], false);
    assert_eq!(body["components"]["datastore"]["detail"], "timeout");
    assert_eq!(body["components"]["broker"]["healthy"], true);
}

#[tokio::test]
async fn comprehensive_report_is_diagnostic_not_gating() {
    let server = TestServer::spawn(
        HealthAggregator::new()
            .critical(StubProbe { name: "datastore", fail: false })
            .critical(StubProbe { name: "broker", fail: false })
            .diagnostic(StubProbe { name: "queue", fail: true })
            .diagnostic(StubProbe { name: "activity", fail: false }),
    )
    .await;

    let (status, body) = server.get("/health").await;

    // Always 200: this endpoint feeds dashboards, not load balancers.
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["components"]["queue"]["healthy"], false);
    assert_eq!(body["components"]["activity"]["healthy"], true);
    assert!(body["components"]["datastore"]["latencyMs"].is_u64());
    assert!(body["components"]["datastore"]["checkedAt"].is_string());
    assert!(body["responseTimeMs"].is_u64());
}
