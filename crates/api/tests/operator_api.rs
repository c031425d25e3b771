use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use reqwest::StatusCode;
use serde_json::{Value, json};

use reportflow_api::app::services::{AppServices, Background, Backends, Collaborators};
use reportflow_core::{ArtifactRef, ReportPayload, Ticker};
use reportflow_infra::collaborators::{ArtifactRequest, CollaboratorError};
use reportflow_infra::config::PipelineConfig;
use reportflow_infra::scheduler::Scheduler;

const UNKNOWN_JOB: &str = "01890a5d-ac96-774b-bcce-b302099a8057";

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
    _background: Option<Background>,
}

impl TestServer {
    /// `with_workers = false` leaves scheduled jobs sitting in the queue.
    async fn spawn(with_workers: bool) -> Self {
        Self::spawn_with(Backends::in_memory(&test_config()), with_workers).await
    }

    /// Serve on top of existing backends, as a restarted process would.
    async fn spawn_with(backends: Backends, with_workers: bool) -> Self {
        let config = test_config();
        let collaborators = Collaborators {
            computer: Arc::new(
                |ticker: &Ticker, date: NaiveDate| -> Result<ReportPayload, CollaboratorError> {
                    if ticker.as_str() == "CRASH" {
                        return Err(CollaboratorError::Permanent("unknown symbol".into()));
                    }
                    Ok(ReportPayload(json!({ "ticker": ticker.as_str(), "date": date, "score": 7 })))
                },
            ),
            renderer: Arc::new(|req: &ArtifactRequest| -> Result<ArtifactRef, CollaboratorError> {
                Ok(ArtifactRef(format!("mem://{}/{}", req.date, req.ticker)))
            }),
        };
        let services = Arc::new(AppServices::new(config, backends, collaborators));
        let background = with_workers.then(|| services.start_background().unwrap());

        // Same router as prod, bound to an ephemeral port.
        let app = reportflow_api::app::build_app(services);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            handle,
            _background: background,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn test_config() -> PipelineConfig {
    PipelineConfig {
        workers: 2,
        backoff_base: Duration::ZERO,
        backoff_max: Duration::ZERO,
        pending_grace: chrono::Duration::zero(),
        completion_poll: Duration::from_millis(20),
        ..PipelineConfig::default()
    }
}

async fn schedule(client: &reqwest::Client, srv: &TestServer, date: &str, tickers: &[&str]) -> Value {
    let res = client
        .post(srv.url("/batches"))
        .json(&json!({ "date": date, "tickers": tickers }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    res.json().await.unwrap()
}

async fn batch_eventually(client: &reqwest::Client, srv: &TestServer, date: &str, phase: &str) -> Value {
    // Workers, the DLQ listener and the derivation trigger all run in the
    // background; poll until the batch reaches the phase.
    for _ in 0..500 {
        let res = client.get(srv.url(&format!("/batches/{date}"))).send().await.unwrap();
        if res.status() == StatusCode::OK {
            let body: Value = res.json().await.unwrap();
            if body["batch"]["phase"] == phase {
                return body;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("batch {date} did not reach phase {phase} within timeout");
}

fn job_id_for(receipt: &Value, ticker: &str) -> String {
    receipt["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .find(|j| j["ticker"] == ticker)
        .map(|j| j["job_id"].as_str().unwrap().to_string())
        .unwrap()
}

#[tokio::test]
async fn health_endpoint_is_public() {
    let srv = TestServer::spawn(false).await;
    let res = reqwest::get(srv.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn batch_with_failing_ticker_runs_to_derived() {
    let srv = TestServer::spawn(true).await;
    let client = reqwest::Client::new();

    let receipt = schedule(&client, &srv, "2025-04-01", &["AAPL", "msft", "CRASH"]).await;
    assert_eq!(receipt["total_jobs"], 3);
    assert!(receipt["enqueue_failures"].as_array().unwrap().is_empty());

    let status = batch_eventually(&client, &srv, "2025-04-01", "derived").await;
    assert_eq!(status["counts"]["completed"], 2);
    assert_eq!(status["counts"]["failed"], 1);
    assert!(status["batch"]["completion_emitted_at"].is_string());

    let crash_id = job_id_for(&receipt, "CRASH");
    let dlq: Value = client
        .get(srv.url("/batches/2025-04-01/dlq"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(dlq["job_ids"], json!([crash_id]));

    let job: Value = client
        .get(srv.url(&format!("/jobs/{crash_id}")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(job["status"], "failed");
    assert_eq!(job["attempts"], 3);

    let results: Value = client
        .get(srv.url("/batches/2025-04-01/results"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let results = results.as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r["derived_artifact_ref"].is_string()));

    // Re-running the pipeline has nothing left to render.
    let res = client
        .post(srv.url("/batches/2025-04-01/derive"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let report: Value = res.json().await.unwrap();
    assert_eq!(report["rendered"], 0);
    assert_eq!(report["skipped"], 2);
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let srv = TestServer::spawn(false).await;
    let client = reqwest::Client::new();

    let res = client
        .post(srv.url("/batches"))
        .json(&json!({ "date": "2025-04-02", "tickers": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    let res = client
        .post(srv.url("/batches"))
        .json(&json!({ "tickers": ["AAPL", "NOT A TICKER"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_ticker");

    let res = client.get(srv.url("/batches/yesterday")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client.get(srv.url("/batches/1999-01-01")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client.get(srv.url("/jobs/nope")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn second_batch_for_a_date_conflicts() {
    let srv = TestServer::spawn(false).await;
    let client = reqwest::Client::new();

    schedule(&client, &srv, "2025-04-03", &["AAPL"]).await;
    let res = client
        .post(srv.url("/batches"))
        .json(&json!({ "date": "2025-04-03", "tickers": ["MSFT"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn requeue_pending_job() {
    let srv = TestServer::spawn(false).await;
    let client = reqwest::Client::new();

    let receipt = schedule(&client, &srv, "2025-04-04", &["AAPL"]).await;
    let job_id = job_id_for(&receipt, "AAPL");

    // Grace period is zero in this server, so the job is already stuck.
    let stuck: Value = client
        .get(srv.url("/batches/2025-04-04/stuck"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stuck["awaiting_delivery"].as_array().unwrap().len(), 1);

    let res = client
        .post(srv.url(&format!("/jobs/{job_id}/requeue")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["job_id"], job_id.as_str());

    let stats: Value = client.get(srv.url("/stats")).send().await.unwrap().json().await.unwrap();
    assert_eq!(stats["visible"], 2);

    let res = client
        .post(srv.url(&format!("/jobs/{UNKNOWN_JOB}/requeue")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn batches_scheduled_before_a_restart_still_complete() {
    // A previous process scheduled the batch and went away before any
    // completion watch could fire.
    let config = test_config();
    let backends = Backends::in_memory(&config);
    let date = NaiveDate::from_ymd_opt(2025, 4, 5).unwrap();
    Scheduler::new(backends.store.clone(), backends.queue.clone(), config.job_ttl)
        .schedule(&[Ticker::parse("AAPL").unwrap()], date)
        .unwrap();

    let srv = TestServer::spawn_with(backends, true).await;
    let client = reqwest::Client::new();

    let status = batch_eventually(&client, &srv, "2025-04-05", "derived").await;
    assert_eq!(status["counts"]["completed"], 1);
    assert!(status["batch"]["completion_emitted_at"].is_string());
}
