use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::routing::get;
use axum::Router;
use cloud_request_log::env::{
    GAE_SERVICE_ENV, GAE_VERSION_ENV, GOOGLE_CLOUD_PROJECT_ENV, K_CONFIGURATION_ENV,
    K_REVISION_ENV, K_SERVICE_ENV,
};
use cloud_request_log::memory_sink::{MemoryConnector, MemorySink};
use cloud_request_log::metadata::{MetadataError, ProjectIdCache, ProjectIdSource};
use cloud_request_log::{
    LoggerOptions, MonitoredResource, Payload, Platform, RequestLog, RequestLogLayer, Severity,
};
use http::{Request, Response, StatusCode};
use tower::{Layer, ServiceExt};

const TRACE_HEADER_VALUE: &str = "abcdef0123456789/abcdef";

struct CountingProject {
    calls: AtomicUsize,
}

#[async_trait]
impl ProjectIdSource for CountingProject {
    async fn project_id(&self) -> Result<String, MetadataError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok("my-project-from-metadata-server".to_string())
    }
}

fn platform(vars: &[(&str, &str)], sink: &MemorySink, source: Arc<CountingProject>) -> Platform {
    let env: HashMap<String, String> =
        vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    Platform::new(
        Arc::new(env),
        Arc::new(ProjectIdCache::new(source)),
        Arc::new(MemoryConnector::new(sink.clone())),
    )
}

fn counting() -> Arc<CountingProject> {
    Arc::new(CountingProject { calls: AtomicUsize::new(0) })
}

fn gae_vars() -> [(&'static str, &'static str); 3] {
    [
        (GOOGLE_CLOUD_PROJECT_ENV, "my-project"),
        (GAE_SERVICE_ENV, "my-service"),
        (GAE_VERSION_ENV, "my-version"),
    ]
}

fn traced_request(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("X-Cloud-Trace-Context", TRACE_HEADER_VALUE)
        .body(Body::empty())
        .unwrap()
}

async fn body_string(resp: Response<Body>) -> String {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn describe(log: RequestLog) -> String {
    log.warningf(format_args!("Some important info right here, that's for sure"));
    format!(
        "scoped={} fallback={} resource={}",
        log.is_scoped(),
        log.is_fallback(),
        log.resource().map(|r| r.resource_type.as_str()).unwrap_or("none")
    )
}

#[tokio::test]
async fn wrapped_handler_logs_with_request_trace() {
    let sink = MemorySink::new();
    let app = Router::new()
        .route("/", get(describe))
        .layer(RequestLogLayer::with_platform(platform(&gae_vars(), &sink, counting())));

    let resp = app.oneshot(traced_request("/")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_string(resp).await, "scoped=true fallback=false resource=gae_app");

    // The logger was closed before the response came back.
    let entries = sink.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].severity, Severity::Warning);
    assert_eq!(entries[0].trace, "projects/my-project/traces/abcdef0123456789");
    assert_eq!(entries[0].log_name, "projects/my-project/logs/app_log");
    assert_eq!(
        entries[0].resource,
        MonitoredResource::gae_app("my-project", "my-service", "my-version")
    );
}

#[tokio::test]
async fn custom_log_id_and_labels() {
    let sink = MemorySink::new();
    let layer = RequestLogLayer::with_platform(platform(&gae_vars(), &sink, counting()))
        .log_id("my_log")
        .options(LoggerOptions::default().with_label("route", "root"));
    let app = Router::new()
        .route(
            "/",
            get(|log: RequestLog| async move {
                log.info(Payload::json(&serde_json::json!({"places": ["Sequoia"]})).unwrap());
                "ok"
            }),
        )
        .layer(layer);

    app.oneshot(traced_request("/")).await.unwrap();

    let entries = sink.entries();
    assert_eq!(entries[0].log_name, "projects/my-project/logs/my_log");
    assert_eq!(entries[0].labels.get("route").map(String::as_str), Some("root"));
    assert!(matches!(entries[0].payload, Payload::Json(_)));
}

#[tokio::test]
async fn missing_trace_header_degrades_to_local_output() {
    let sink = MemorySink::new();
    let app = Router::new()
        .route("/", get(describe))
        .layer(RequestLogLayer::with_platform(platform(&gae_vars(), &sink, counting())));

    let req = Request::builder().uri("/").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_string(resp).await, "scoped=true fallback=true resource=none");
    assert!(sink.entries().is_empty());
}

#[tokio::test]
async fn unwrapped_handler_gets_unscoped_fallback() {
    let app = Router::new().route("/", get(describe));

    let resp = app.oneshot(traced_request("/")).await.unwrap();

    assert_eq!(body_string(resp).await, "scoped=false fallback=true resource=none");
}

#[tokio::test]
async fn concurrent_requests_share_one_metadata_lookup() {
    let sink = MemorySink::new();
    let source = counting();
    let vars = [
        (K_SERVICE_ENV, "svc"),
        (K_REVISION_ENV, "svc-00001"),
        (K_CONFIGURATION_ENV, "svc"),
    ];
    let app = Router::new()
        .route("/", get(describe))
        .layer(RequestLogLayer::with_platform(platform(&vars, &sink, source.clone())));

    let requests: Vec<_> = (0..6)
        .map(|_| tokio::spawn(app.clone().oneshot(traced_request("/"))))
        .collect();
    for request in requests {
        let resp = request.await.unwrap().unwrap();
        assert_eq!(body_string(resp).await, "scoped=true fallback=false resource=cloud_run_revision");
    }

    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    let entries = sink.entries();
    assert_eq!(entries.len(), 6);
    assert!(entries
        .iter()
        .all(|e| e.trace == "projects/my-project-from-metadata-server/traces/abcdef0123456789"));
}

#[tokio::test]
#[allow(unreachable_code)]
async fn logger_is_closed_when_handler_panics() {
    let sink = MemorySink::new();
    let service = RequestLogLayer::with_platform(platform(&gae_vars(), &sink, counting())).layer(
        tower::service_fn(|req: Request<Body>| async move {
            let log = RequestLog::from_extensions(req.extensions());
            log.errorf(format_args!("about to fail"));
            panic!("handler blew up");
            Ok::<_, Infallible>(Response::new(Body::empty()))
        }),
    );

    let joined = tokio::spawn(service.oneshot(traced_request("/"))).await;

    assert!(joined.unwrap_err().is_panic());
    let entries = sink.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].payload, Payload::text("about to fail"));
}
