use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use humio_exporter::{
    client::HttpJobClient,
    config,
    metrics::MetricRegistry,
    poller::{PollLoop, PollSettings},
    ExporterError,
};

/// Canned poll responses keyed by job id, plus a log of deleted jobs.
#[derive(Clone, Default)]
struct FakeHumio {
    results: Arc<Mutex<HashMap<String, (StatusCode, Value)>>>,
    deleted: Arc<Mutex<Vec<String>>>,
}

impl FakeHumio {
    fn respond(&self, job_id: &str, status: StatusCode, body: Value) {
        self.results
            .lock()
            .unwrap()
            .insert(job_id.to_string(), (status, body));
    }
}

async fn start_job(Path(repo): Path<String>, Json(body): Json<Value>) -> impl IntoResponse {
    let metric = body["queryString"].as_str().unwrap_or_default().to_string();
    Json(json!({ "id": format!("{}-{}", repo, metric) }))
}

async fn poll_job(
    State(humio): State<FakeHumio>,
    Path((_repo, id)): Path<(String, String)>,
) -> impl IntoResponse {
    match humio.results.lock().unwrap().get(&id) {
        Some((status, body)) => (*status, Json(body.clone())).into_response(),
        None => (StatusCode::NOT_FOUND, "query job not found").into_response(),
    }
}

async fn delete_job(
    State(humio): State<FakeHumio>,
    Path((_repo, id)): Path<(String, String)>,
) -> StatusCode {
    humio.deleted.lock().unwrap().push(id);
    StatusCode::NO_CONTENT
}

async fn serve(humio: FakeHumio) -> String {
    let app = Router::new()
        .route("/api/v1/repositories/:repo/queryjobs", post(start_job))
        .route(
            "/api/v1/repositories/:repo/queryjobs/:id",
            get(poll_job).delete(delete_job),
        )
        .with_state(humio);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

const QUERIES: &str = r#"
queries:
  - query: errors
    repo: sandbox
    interval: 5m
    metric_name: errors_total
  - query: hosts
    repo: sandbox
    interval: 1h
    metric_name: requests
    metric_labels:
      - key: host
        valueFromTable: hostname
"#;

async fn setup() -> (FakeHumio, Arc<MetricRegistry>, PollLoop<HttpJobClient>) {
    let humio = FakeHumio::default();
    let base = serve(humio.clone()).await;

    let queries = config::parse(QUERIES).unwrap();
    let mut registry = MetricRegistry::new().unwrap();
    for q in &queries {
        registry.declare(&q.metric_name, &q.labels).unwrap();
    }
    let registry = Arc::new(registry);

    let client = Arc::new(HttpJobClient::new(&base, "token", Duration::from_secs(5)).unwrap());
    let settings = PollSettings {
        interval: Duration::from_millis(20),
        ..Default::default()
    };
    let poll = PollLoop::start(client, registry.clone(), &queries, settings, &CancellationToken::new())
        .await
        .unwrap();
    (humio, registry, poll)
}

fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn completed_jobs_publish_gauges() {
    let (humio, registry, mut poll) = setup().await;
    humio.respond(
        "sandbox-errors",
        StatusCode::OK,
        json!({"done": true, "events": [{"_count": "42"}]}),
    );
    humio.respond(
        "sandbox-hosts",
        StatusCode::OK,
        json!({"done": true, "events": [
            {"hostname": "a", "value": "1"},
            {"hostname": "", "value": "2"}
        ]}),
    );

    let report = poll.tick().await.unwrap();
    assert_eq!(report.samples, 3);

    assert_eq!(
        registry.value("errors_total", &labels(&[("interval", "5m"), ("repo", "sandbox")])),
        Some(42.0)
    );
    assert_eq!(
        registry.value(
            "requests",
            &labels(&[("interval", "1h"), ("repo", "sandbox"), ("host", "a")])
        ),
        Some(1.0)
    );
    assert_eq!(
        registry.value(
            "requests",
            &labels(&[("interval", "1h"), ("repo", "sandbox"), ("host", "unknown")])
        ),
        Some(2.0)
    );

    let exposition = registry.encode().unwrap();
    assert!(exposition.contains(r#"errors_total{interval="5m",repo="sandbox"} 42"#));
    assert!(exposition.contains(r#"requests{host="unknown",interval="1h",repo="sandbox"} 2"#));
}

#[tokio::test]
async fn pending_jobs_do_not_touch_gauges() {
    let (humio, registry, mut poll) = setup().await;
    humio.respond("sandbox-errors", StatusCode::OK, json!({"done": false, "events": [{"_count": "9"}]}));
    humio.respond("sandbox-hosts", StatusCode::OK, json!({"done": false}));

    let report = poll.tick().await.unwrap();
    assert_eq!(report.pending, 2);
    assert_eq!(registry.series_count("errors_total"), 0);
    assert_eq!(registry.series_count("requests"), 0);
}

#[tokio::test]
async fn expired_job_is_fatal_and_cancels_jobs() {
    let (humio, _registry, poll) = setup().await;
    humio.respond("sandbox-hosts", StatusCode::OK, json!({"done": false}));

    let outcome = poll.run(CancellationToken::new()).await;
    assert!(matches!(outcome, Err(ExporterError::JobNotFound(id)) if id == "sandbox-errors"));

    let mut deleted = humio.deleted.lock().unwrap().clone();
    deleted.sort();
    assert_eq!(deleted, vec!["sandbox-errors".to_string(), "sandbox-hosts".to_string()]);
}

#[test_log::test(tokio::test)]
async fn cancellation_is_a_clean_shutdown() {
    let (humio, registry, poll) = setup().await;
    humio.respond("sandbox-errors", StatusCode::OK, json!({"done": true, "events": [{"_count": "1"}]}));
    humio.respond("sandbox-hosts", StatusCode::OK, json!({"done": true, "events": []}));

    let token = CancellationToken::new();
    let trigger = token.clone();
    let (outcome, _) = tokio::join!(poll.run(token), async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    assert!(outcome.is_ok());
    assert_eq!(
        registry.value("errors_total", &labels(&[("interval", "5m"), ("repo", "sandbox")])),
        Some(1.0)
    );
    assert_eq!(humio.deleted.lock().unwrap().len(), 2);
}
