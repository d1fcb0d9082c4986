//! End-to-end tests over HTTP and WebSocket
//!
//! Each test serves the full router on an ephemeral port backed by the
//! in-memory job store and a scripted engine.
//!
//! Run with: cargo test --test e2e_test -- --nocapture

mod fixtures;
mod helpers;

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

use fixtures::*;
use helpers::*;

use songsmith::db::MemoryJobStore;

fn song() -> Value {
    json!({
        "lyrics": "[verse]\nneon lights over the bay",
        "tags": "synthwave, female vocals",
        "max_audio_length_ms": 10000
    })
}

async fn start(engine: Arc<ScriptedEngine>, max_pending: usize) -> (Harness, String) {
    let mut settings = settings();
    settings.max_pending = max_pending;
    let harness = Harness::start(Arc::new(MemoryJobStore::new()), settings, engine);
    let addr = spawn_app(harness.orchestrator.clone(), "scripted").await;
    (harness, format!("http://{addr}"))
}

async fn submit(client: &reqwest::Client, base_url: &str, token: &str, body: &Value) -> reqwest::Response {
    client
        .post(format!("{base_url}/api/v1/generations"))
        .bearer_auth(token)
        .json(body)
        .send()
        .await
        .expect("Submit request failed")
}

/// Poll the job endpoint until the job is terminal.
async fn poll_job(client: &reqwest::Client, base_url: &str, token: &str, job_id: &str) -> Value {
    for _ in 0..250 {
        let job: Value = client
            .get(format!("{base_url}/api/v1/jobs/{job_id}"))
            .bearer_auth(token)
            .send()
            .await
            .expect("Job request failed")
            .json()
            .await
            .expect("Job body was not JSON");

        match job["status"].as_str() {
            Some("completed" | "failed" | "cancelled") => return job,
            Some("pending" | "processing") => tokio::time::sleep(Duration::from_millis(20)).await,
            other => panic!("Unknown job status: {other:?}"),
        }
    }
    panic!("Job {job_id} did not finish within 5 seconds");
}

#[tokio::test]
async fn test_health_check() {
    let (harness, base_url) = start(Arc::new(ScriptedEngine::new(2)), 8).await;

    let response = reqwest::get(format!("{base_url}/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["checks"]["job_store"]["status"], "ok");
    assert_eq!(body["checks"]["queue"]["engine"], "scripted");

    harness.stop().await;
}

#[tokio::test]
async fn test_requests_without_valid_token_are_rejected() {
    let (harness, base_url) = start(Arc::new(ScriptedEngine::new(2)), 8).await;
    let client = reqwest::Client::new();

    let missing = client
        .post(format!("{base_url}/api/v1/generations"))
        .json(&song())
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let forged = submit(&client, &base_url, "not-a-token", &song()).await;
    assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);
    let body: Value = forged.json().await.unwrap();
    assert_eq!(body["code"], "UNAUTHORIZED");

    harness.stop().await;
}

#[tokio::test]
async fn test_generation_lifecycle_over_http() {
    let (harness, base_url) = start(Arc::new(ScriptedEngine::new(3)), 8).await;
    let client = reqwest::Client::new();
    let token = token_for("alice");

    let response = submit(&client, &base_url, &token, &song()).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let accepted: Value = response.json().await.unwrap();
    assert_eq!(accepted["status"], "pending");
    let job_id = accepted["id"].as_str().unwrap().to_string();

    let job = poll_job(&client, &base_url, &token, &job_id).await;
    assert_eq!(job["status"], "completed");
    assert_eq!(job["progress"]["current"], 3);
    assert!(job["params"]["title"].as_str().unwrap().starts_with("Generation "));

    let history: Value = client
        .get(format!("{base_url}/api/v1/history?page=1&page_size=10&search=neon"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history["total"], 1);
    assert_eq!(history["items"][0]["id"], job_id.as_str());

    let thumbnail = client
        .put(format!("{base_url}/api/v1/history/{job_id}/thumbnail"))
        .bearer_auth(&token)
        .json(&json!({ "thumbnail_path": "/covers/neon.png" }))
        .send()
        .await
        .unwrap();
    assert_eq!(thumbnail.status(), StatusCode::OK);
    let item: Value = thumbnail.json().await.unwrap();
    assert_eq!(item["result"]["thumbnail_path"], "/covers/neon.png");

    let deleted = client
        .delete(format!("{base_url}/api/v1/history/{job_id}"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

    let gone = client
        .get(format!("{base_url}/api/v1/jobs/{job_id}"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);

    harness.stop().await;
}

#[tokio::test]
async fn test_invalid_parameters_are_rejected() {
    let (harness, base_url) = start(Arc::new(ScriptedEngine::new(2)), 8).await;
    let client = reqwest::Client::new();
    let token = token_for("alice");

    let response = submit(
        &client,
        &base_url,
        &token,
        &json!({ "lyrics": "la", "tags": "pop", "topk": 0, "cfg_scale": 9.0 }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let page = client
        .get(format!("{base_url}/api/v1/history?page_size=500"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(page.status(), StatusCode::BAD_REQUEST);

    harness.stop().await;
}

#[tokio::test]
async fn test_foreign_job_looks_missing() {
    let (harness, base_url) = start(Arc::new(ScriptedEngine::new(2)), 8).await;
    let client = reqwest::Client::new();
    let alice = token_for("alice");
    let mallory = token_for("mallory");

    let accepted: Value = submit(&client, &base_url, &alice, &song())
        .await
        .json()
        .await
        .unwrap();
    let job_id = accepted["id"].as_str().unwrap().to_string();
    poll_job(&client, &base_url, &alice, &job_id).await;

    let foreign = client
        .get(format!("{base_url}/api/v1/jobs/{job_id}"))
        .bearer_auth(&mallory)
        .send()
        .await
        .unwrap();
    let missing = client
        .get(format!("{base_url}/api/v1/jobs/{}", uuid::Uuid::new_v4()))
        .bearer_auth(&mallory)
        .send()
        .await
        .unwrap();

    assert_eq!(foreign.status(), StatusCode::NOT_FOUND);
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    let foreign_body: Value = foreign.json().await.unwrap();
    let missing_body: Value = missing.json().await.unwrap();
    assert_eq!(foreign_body, missing_body);

    harness.stop().await;
}

#[tokio::test]
async fn test_queue_view_cancel_and_backpressure() {
    let gate = Gate::new();
    let engine = Arc::new(ScriptedEngine::new(2).gated(gate.clone()));
    let (harness, base_url) = start(engine, 1).await;
    let client = reqwest::Client::new();
    let token = token_for("alice");

    let first: Value = submit(&client, &base_url, &token, &song()).await.json().await.unwrap();
    let first_id = first["id"].as_str().unwrap().to_string();

    // Wait for the first job to occupy the slot so the backlog is empty.
    for _ in 0..250 {
        if harness.orchestrator.is_busy() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let second = submit(&client, &base_url, &token, &song()).await;
    assert_eq!(second.status(), StatusCode::ACCEPTED);
    let second: Value = second.json().await.unwrap();
    let second_id = second["id"].as_str().unwrap().to_string();

    let rejected = submit(&client, &base_url, &token, &song()).await;
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    let body: Value = rejected.json().await.unwrap();
    assert_eq!(body["code"], "QUEUE_FULL");

    let queue: Value = client
        .get(format!("{base_url}/api/v1/queue"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(queue["active_id"], first_id.as_str());
    assert_eq!(queue["items"][0]["position"], 0);
    assert_eq!(queue["items"][1]["id"], second_id.as_str());
    assert_eq!(queue["items"][1]["position"], 1);

    let cancelled: Value = client
        .delete(format!("{base_url}/api/v1/queue/{second_id}"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cancelled["outcome"], "cancelled");
    assert_eq!(cancelled["status"], "cancelled");

    let status: Value = client
        .get(format!("{base_url}/api/v1/status"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["queue_length"], 1);
    assert_eq!(status["busy"], true);

    gate.open();
    let done = poll_job(&client, &base_url, &token, &first_id).await;
    assert_eq!(done["status"], "completed");

    harness.stop().await;
}

#[tokio::test]
async fn test_progress_stream_over_websocket() {
    let (harness, base_url) = start(Arc::new(ScriptedEngine::new(4)), 8).await;
    let client = reqwest::Client::new();
    let token = token_for("alice");

    let ws_url = format!(
        "{}/api/v1/progress/ws?token={token}",
        base_url.replacen("http://", "ws://", 1)
    );
    let (mut socket, _) = tokio_tungstenite::connect_async(ws_url)
        .await
        .expect("WebSocket handshake failed");

    // The pong proves the observer is registered before anything is submitted.
    socket.send(Message::Text("ping".into())).await.unwrap();
    loop {
        match socket.next().await.unwrap().unwrap() {
            Message::Text(text) if text == "pong" => break,
            _ => continue,
        }
    }

    let accepted: Value = submit(&client, &base_url, &token, &song()).await.json().await.unwrap();
    let job_id = accepted["id"].as_str().unwrap().to_string();

    let mut statuses = Vec::new();
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("Timed out waiting for progress")
            .expect("Socket closed")
            .unwrap();
        let Message::Text(text) = frame else { continue };
        let event: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(event["job_id"], job_id.as_str());
        let status = event["status"].as_str().unwrap().to_string();
        let terminal = status != "processing";
        statuses.push(status);
        if terminal {
            break;
        }
    }

    assert_eq!(statuses.first().map(String::as_str), Some("processing"));
    assert_eq!(statuses.last().map(String::as_str), Some("completed"));

    socket.close(None).await.unwrap();
    harness.stop().await;
}

#[tokio::test]
async fn test_websocket_requires_token() {
    let (harness, base_url) = start(Arc::new(ScriptedEngine::new(2)), 8).await;
    let ws_url = format!("{}/api/v1/progress/ws", base_url.replacen("http://", "ws://", 1));

    let result = tokio_tungstenite::connect_async(ws_url).await;
    assert!(result.is_err());

    harness.stop().await;
}
