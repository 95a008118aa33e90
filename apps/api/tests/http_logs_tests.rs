//! HTTP tests for the record ingestion surface: validation, round-trip,
//! pagination, conflicts and the delete-as-no-op contract.

mod common;

use common::{spawn_app, TestOptions};
use ledgerlog_core::{canonical_record_hash, LogLevel};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::BTreeMap;

async fn post_log(client: &Client, base: &str, body: Value) -> reqwest::Response {
    client
        .post(format!("{base}/logs"))
        .json(&body)
        .send()
        .await
        .expect("POST /logs failed")
}

#[tokio::test]
async fn post_log_returns_id_and_hash_and_round_trips() {
    let app = spawn_app(TestOptions::default()).await;
    let client = Client::new();

    let resp = post_log(
        &client,
        &app.base,
        json!({ "source": "s1", "level": "INFO", "message": "m" }),
    )
    .await;
    assert_eq!(resp.status(), 201);
    assert!(
        resp.headers().contains_key("x-request-id"),
        "responses must carry the correlation id header"
    );
    let created: Value = resp.json().await.unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    let hash = created["hash"].as_str().unwrap().to_string();
    assert_eq!(hash.len(), 64);

    // Round-trip: the stored fields recompute to the stored hash.
    let fetched: Value = client
        .get(format!("{}/logs/{}", app.base, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["id"], id.as_str());
    assert_eq!(fetched["source"], "s1");
    assert_eq!(fetched["level"], "INFO");
    assert_eq!(fetched["message"], "m");

    let recomputed = canonical_record_hash(
        &id,
        fetched["timestamp"].as_str().unwrap(),
        "s1",
        LogLevel::Info,
        "m",
        None,
        None,
    );
    assert_eq!(recomputed, hash);
    app.server.abort();
}

#[tokio::test]
async fn post_log_preserves_caller_fields_and_metadata() {
    let app = spawn_app(TestOptions::default()).await;
    let client = Client::new();

    let resp = post_log(
        &client,
        &app.base,
        json!({
            "id": "caller-id-1",
            "timestamp": "2026-02-01T08:30:00Z",
            "source": "billing",
            "level": "ERROR",
            "message": "charge failed",
            "metadata": { "order": "o-17", "customer": "c-3" },
            "stacktrace": "at charge()\nat submit()"
        }),
    )
    .await;
    assert_eq!(resp.status(), 201);
    let created: Value = resp.json().await.unwrap();
    assert_eq!(created["id"], "caller-id-1");

    let metadata = BTreeMap::from([
        ("customer".to_string(), "c-3".to_string()),
        ("order".to_string(), "o-17".to_string()),
    ]);
    let expected_hash = canonical_record_hash(
        "caller-id-1",
        "2026-02-01T08:30:00Z",
        "billing",
        LogLevel::Error,
        "charge failed",
        Some(&metadata),
        Some("at charge()\nat submit()"),
    );
    assert_eq!(created["hash"], expected_hash.as_str());

    let fetched: Value = client
        .get(format!("{}/logs/caller-id-1", app.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["timestamp"], "2026-02-01T08:30:00Z");
    assert_eq!(fetched["metadata"]["order"], "o-17");
    assert_eq!(fetched["stacktrace"], "at charge()\nat submit()");
    app.server.abort();
}

#[tokio::test]
async fn validation_failures_return_the_error_envelope() {
    let app = spawn_app(TestOptions::default()).await;
    let client = Client::new();

    // Missing source.
    let resp = post_log(
        &client,
        &app.base,
        json!({ "level": "INFO", "message": "m" }),
    )
    .await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");
    assert_eq!(body["code"], 400);
    assert!(body["message"].as_str().unwrap().contains("source"));

    // Level outside the allowed set.
    let resp = post_log(
        &client,
        &app.base,
        json!({ "source": "s", "level": "FATAL", "message": "m" }),
    )
    .await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["message"].as_str().unwrap().contains("FATAL"));

    // Missing message.
    let resp = post_log(
        &client,
        &app.base,
        json!({ "source": "s", "level": "INFO" }),
    )
    .await;
    assert_eq!(resp.status(), 400);
    app.server.abort();
}

#[tokio::test]
async fn duplicate_ids_conflict() {
    let app = spawn_app(TestOptions::default()).await;
    let client = Client::new();
    let body = json!({ "id": "same-id", "source": "s", "level": "INFO", "message": "m" });

    assert_eq!(post_log(&client, &app.base, body.clone()).await.status(), 201);
    let resp = post_log(&client, &app.base, body).await;
    assert_eq!(resp.status(), 409);
    let envelope: Value = resp.json().await.unwrap();
    assert_eq!(envelope["error"], "conflict");
    app.server.abort();
}

#[tokio::test]
async fn unknown_record_is_not_found() {
    let app = spawn_app(TestOptions::default()).await;
    let client = Client::new();
    let resp = client
        .get(format!("{}/logs/ghost", app.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "not_found");
    app.server.abort();
}

#[tokio::test]
async fn list_filters_and_paginates() {
    let app = spawn_app(TestOptions::default()).await;
    let client = Client::new();

    for i in 0..3 {
        post_log(
            &client,
            &app.base,
            json!({ "source": "auth", "level": "INFO", "message": format!("a{i}") }),
        )
        .await;
    }
    post_log(
        &client,
        &app.base,
        json!({ "source": "billing", "level": "ERROR", "message": "b0" }),
    )
    .await;

    let all: Value = client
        .get(format!("{}/logs", app.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(all["total"], 4);
    assert_eq!(all["limit"], 50);
    assert_eq!(all["offset"], 0);
    assert_eq!(all["records"].as_array().unwrap().len(), 4);

    let filtered: Value = client
        .get(format!("{}/logs?source=auth&level=INFO&limit=2", app.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(filtered["total"], 3);
    assert_eq!(filtered["records"].as_array().unwrap().len(), 2);

    // Limits are clamped to the maximum page size.
    let clamped: Value = client
        .get(format!("{}/logs?limit=5000", app.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(clamped["limit"], 1000);

    // An invalid level filter is a validation failure.
    let resp = client
        .get(format!("{}/logs?level=fatal", app.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    app.server.abort();
}

#[tokio::test]
async fn delete_is_a_logical_noop_preserving_the_audit_trail() {
    let app = spawn_app(TestOptions::default()).await;
    let client = Client::new();
    post_log(
        &client,
        &app.base,
        json!({ "id": "keep-me", "source": "s", "level": "INFO", "message": "m" }),
    )
    .await;

    let resp = client
        .delete(format!("{}/logs/keep-me", app.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["deleted"], false);
    assert_eq!(body["status"], "accepted");

    // The record survives the delete.
    let still_there = client
        .get(format!("{}/logs/keep-me", app.base))
        .send()
        .await
        .unwrap();
    assert_eq!(still_there.status(), 200);

    // Deleting an unknown record is 404.
    let resp = client
        .delete(format!("{}/logs/ghost", app.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    app.server.abort();
}
