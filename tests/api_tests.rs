mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use ssqe_orchestrator::api::{router, AppState};
use ssqe_orchestrator::config::OrchestratorConfig;
use ssqe_orchestrator::error::{OrchestratorError, Result};
use ssqe_orchestrator::job::{Job, JobStatus, RuntimeKind};
use ssqe_orchestrator::orchestrator::Orchestrator;
use ssqe_orchestrator::runtime::RuntimePool;
use ssqe_orchestrator::sandbox::SandboxAdapter;
use ssqe_orchestrator::store::{InMemoryJobStore, JobFilter, JobStore};

use common::{payload, test_config, wait_for_status, CountingDriver, INPUT_REF};

fn app(orchestrator: &Orchestrator) -> Router {
    router(AppState::new(orchestrator.clone()))
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn fields(body: &Value) -> Vec<String> {
    body["details"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["field"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_index_reports_service() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = Orchestrator::from_config(test_config(dir.path())).unwrap();

    let (status, body) = send(app(&orchestrator), get("/")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "ssqe-orchestrator");
    assert_eq!(body["status"], "running");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_webhook_accepts_and_runs_job() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = common::started_in(&dir).await;

    let (status, body) = send(
        app(&orchestrator),
        post_json("/webhook", &payload("api-1", "echo from-webhook")),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["job_status"], "received");

    let id: Uuid = body["job_id"].as_str().unwrap().parse().unwrap();
    wait_for_status(&orchestrator, id, JobStatus::Succeeded).await;

    let (status, body) = send(app(&orchestrator), get(&format!("/jobs/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "succeeded");
    assert_eq!(body["runtime"], "Python");
    assert_eq!(body["input_ref"], INPUT_REF);
    assert_eq!(body["result"]["exit_code"], 0);
    assert_eq!(body["result"]["stdout"], "from-webhook\n");

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_events_route_is_an_alias() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = Orchestrator::from_config(test_config(dir.path())).unwrap();

    let (status, _) = send(
        app(&orchestrator),
        post_json("/events", &payload("alias", "exit 0")),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_webhook_lists_every_invalid_field() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = Orchestrator::from_config(test_config(dir.path())).unwrap();

    let (status, body) = send(
        app(&orchestrator),
        post_json(
            "/webhook",
            &json!({
                "idempotency_key": "bad",
                "job_kind": "Ruby",
                "input_ref": "s3://bucket/x",
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
    assert_eq!(body["code"], "VALIDATION_ERROR");
    assert_eq!(body["message"], "Request validation failed");
    let fields = fields(&body);
    assert!(fields.contains(&"source".to_string()));
    assert!(fields.contains(&"job_kind".to_string()));
    assert!(fields.contains(&"input_ref".to_string()));
    assert!(body["details"][0]["type"].is_string());
    assert!(body["details"][0]["message"].is_string());

    // Nothing was created
    assert!(orchestrator.store().list(&JobFilter::default()).unwrap().is_empty());
}

#[tokio::test]
async fn test_webhook_rejects_malformed_json() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = Orchestrator::from_config(test_config(dir.path())).unwrap();

    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(app(&orchestrator), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"][0]["field"], "body");
    assert_eq!(body["details"][0]["type"], "json_invalid");
}

#[tokio::test]
async fn test_webhook_secret_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.webhook_secret = Some("s3cret".to_string());
    let orchestrator = Orchestrator::from_config(config).unwrap();

    let (status, body) = send(
        app(&orchestrator),
        post_json("/webhook", &payload("no-secret", "exit 0")),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let mut wrong = post_json("/webhook", &payload("wrong-secret", "exit 0"));
    wrong
        .headers_mut()
        .insert("x-webhook-secret", "guess".parse().unwrap());
    let (status, _) = send(app(&orchestrator), wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(orchestrator.store().list(&JobFilter::default()).unwrap().is_empty());

    let mut right = post_json("/webhook", &payload("right-secret", "exit 0"));
    right
        .headers_mut()
        .insert("x-webhook-secret", "s3cret".parse().unwrap());
    let (status, _) = send(app(&orchestrator), right).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_duplicate_webhook_returns_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = Orchestrator::from_config(test_config(dir.path())).unwrap();

    let (status, first) = send(
        app(&orchestrator),
        post_json("/webhook", &payload("dup", "exit 0")),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, second) = send(
        app(&orchestrator),
        post_json("/webhook", &payload("dup", "exit 0")),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(second["code"], "DUPLICATE_EVENT");
    assert_eq!(second["job_id"], first["job_id"]);
    assert_eq!(orchestrator.store().list(&JobFilter::default()).unwrap().len(), 1);
}

#[tokio::test]
async fn test_get_job_errors() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = Orchestrator::from_config(test_config(dir.path())).unwrap();

    let (status, body) = send(
        app(&orchestrator),
        get(&format!("/jobs/{}", Uuid::new_v4())),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let (status, body) = send(app(&orchestrator), get("/jobs/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"][0]["type"], "uuid_parsing");
}

#[tokio::test]
async fn test_list_jobs_filters() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = Orchestrator::from_config(test_config(dir.path())).unwrap();

    let a = orchestrator.submit(common::event("a", "exit 0")).unwrap();
    orchestrator.submit(common::event("b", "exit 0")).unwrap();
    orchestrator
        .store()
        .update(a.id, JobStatus::Received, &|j| j.transition(JobStatus::Mounting))
        .unwrap();

    let (status, body) = send(app(&orchestrator), get("/jobs")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);

    let (_, body) = send(app(&orchestrator), get("/jobs?status=mounting")).await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["jobs"][0]["id"], a.id.to_string());

    let (_, body) = send(app(&orchestrator), get("/jobs?runtime=node")).await;
    assert_eq!(body["total"], 0);

    let (_, body) = send(app(&orchestrator), get("/jobs?limit=1")).await;
    assert_eq!(body["jobs"].as_array().unwrap().len(), 1);

    let (status, body) = send(app(&orchestrator), get("/jobs?status=sleeping")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"][0]["field"], "status");
    assert_eq!(body["details"][0]["type"], "enum");
}

#[tokio::test]
async fn test_cancel_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = Orchestrator::from_config(test_config(dir.path())).unwrap();
    let job = orchestrator.submit(common::event("c", "exit 0")).unwrap();

    let uri = format!("/jobs/{}/cancel", job.id);
    let cancel = || {
        Request::builder()
            .method("POST")
            .uri(&uri)
            .body(Body::empty())
            .unwrap()
    };

    let (status, body) = send(app(&orchestrator), cancel()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["cancelled"], true);

    let stored = orchestrator.store().get(job.id).unwrap().unwrap();
    assert_eq!(stored.error.as_deref(), Some("cancelled by request"));

    // Already terminal
    let (status, body) = send(app(&orchestrator), cancel()).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");
}

#[tokio::test]
async fn test_health_ready() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = common::started_in(&dir).await;

    let (status, body) = send(app(&orchestrator), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
    assert_eq!(body["reason"], "ok");
    assert_eq!(body["free_slots"], orchestrator.pool().capacity());
    assert_eq!(body["stuck_jobs"], 0);
    assert_eq!(body["active_mounts"], 0);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_health_degraded_when_driver_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let sandbox = Arc::new(SandboxAdapter::with_driver(
        CountingDriver::new(dir.path().join("buckets"), true),
        &config.sandbox,
        config.retry.clone(),
    ));
    let pool = Arc::new(RuntimePool::new(&config.pool));
    let orchestrator = Orchestrator::new(config, Arc::new(InMemoryJobStore::new()), pool, sandbox);

    let (status, body) = send(app(&orchestrator), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["reason"], "mount_driver_unavailable");
}

#[tokio::test]
async fn test_health_degraded_when_saturated_with_stuck_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.recovery.staleness_threshold_ms = 0;
    let orchestrator = Orchestrator::from_config(config).unwrap();

    let job = orchestrator.submit(common::event("stuck", "exit 0")).unwrap();
    orchestrator
        .store()
        .update(job.id, JobStatus::Received, &|j| j.transition(JobStatus::Mounting))
        .unwrap();

    let mut held = Vec::new();
    for kind in [RuntimeKind::Jvm, RuntimeKind::Node, RuntimeKind::Python] {
        while orchestrator.pool().free_slots_for(kind) > 0 {
            held.push(
                orchestrator
                    .pool()
                    .acquire(kind, Duration::from_millis(50))
                    .await
                    .unwrap(),
            );
        }
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (status, body) = send(app(&orchestrator), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["reason"], "pool_saturated_with_stuck_jobs");
    assert_eq!(body["free_slots"], 0);
    assert_eq!(body["stuck_jobs"], 1);

    drop(held);
    let (_, body) = send(app(&orchestrator), get("/health")).await;
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn test_health_ignores_long_jobs_running_here() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.pool = common::sh_pool(1);
    config.recovery.staleness_threshold_ms = 300;
    let orchestrator = common::start(config).await;

    // Saturate the pool: hold the other kinds, let the job take the last slot
    let mut held = Vec::new();
    for kind in [RuntimeKind::Jvm, RuntimeKind::Node] {
        held.push(
            orchestrator
                .pool()
                .acquire(kind, Duration::from_millis(50))
                .await
                .unwrap(),
        );
    }
    let job = orchestrator.submit(common::event("long", "sleep 3")).unwrap();
    wait_for_status(&orchestrator, job.id, JobStatus::Running).await;
    tokio::time::sleep(Duration::from_millis(800)).await;

    let (status, body) = send(app(&orchestrator), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
    assert_eq!(body["free_slots"], 0);
    assert_eq!(body["stuck_jobs"], 0);

    // The running job keeps its record fresh
    let current = orchestrator.store().get(job.id).unwrap().unwrap();
    assert_eq!(current.status, JobStatus::Running);
    assert!(Utc::now() - current.updated_at < chrono::Duration::milliseconds(300));

    orchestrator.cancel(job.id).await.unwrap();
    drop(held);
    orchestrator.shutdown().await;
}

/// Store that is unreachable, or answers too slowly.
struct BrokenStore {
    delay: Option<Duration>,
}

impl BrokenStore {
    fn respond(&self) -> Result<()> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
            return Ok(());
        }
        Err(OrchestratorError::Store("connection refused".to_string()))
    }
}

impl JobStore for BrokenStore {
    fn create(&self, job: Job) -> Result<Job> {
        self.respond().map(|_| job)
    }

    fn get(&self, _id: Uuid) -> Result<Option<Job>> {
        self.respond().map(|_| None)
    }

    fn find_by_idempotency_key(&self, _key: &str) -> Result<Option<Job>> {
        self.respond().map(|_| None)
    }

    fn update(&self, id: Uuid, _expected: JobStatus, _mutation: &dyn Fn(&mut Job)) -> Result<Job> {
        self.respond()?;
        Err(OrchestratorError::JobNotFound(id))
    }

    fn list(&self, _filter: &JobFilter) -> Result<Vec<Job>> {
        self.respond().map(|_| Vec::new())
    }

    fn evict_finished(&self, _before: DateTime<Utc>) -> Result<usize> {
        self.respond().map(|_| 0)
    }

    fn ping(&self) -> Result<()> {
        self.respond()
    }

    fn is_durable(&self) -> bool {
        true
    }
}

fn with_store(config: OrchestratorConfig, store: BrokenStore) -> Orchestrator {
    let pool = Arc::new(RuntimePool::new(&config.pool));
    let sandbox = Arc::new(SandboxAdapter::new(&config.sandbox, config.retry.clone()));
    Orchestrator::new(config, Arc::new(store), pool, sandbox)
}

#[tokio::test]
async fn test_health_unavailable_without_store() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = with_store(test_config(dir.path()), BrokenStore { delay: None });

    let (status, body) = send(app(&orchestrator), get("/health")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unavailable");
    assert_eq!(body["reason"], "store_unreachable");

    // Ingress reports the store outage too
    let (status, body) = send(
        app(&orchestrator),
        post_json("/webhook", &payload("down", "exit 0")),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "STORE_UNAVAILABLE");
}

#[tokio::test]
async fn test_health_check_is_bounded_by_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.health_timeout_ms = 200;
    let orchestrator = with_store(
        config,
        BrokenStore {
            delay: Some(Duration::from_millis(1_500)),
        },
    );

    let started = std::time::Instant::now();
    let (status, body) = send(app(&orchestrator), get("/health")).await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["reason"], "health_check_timeout");
}
