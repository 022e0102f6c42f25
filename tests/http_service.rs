// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests for the HTTP frontend: registration through the store,
//! prediction, deadline fallback, and the JSON error surface.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use quickdraw::engine::ModelEngine;
use quickdraw::http_service::HttpFrontend;
use quickdraw::metrics::MetricsRegistry;
use quickdraw::processor::QueryProcessor;
use quickdraw::protocols::{Input, VersionedModelId};
use quickdraw::registrar::Registrar;
use quickdraw::store::{AppRecord, ApplicationStore, MemoryStore};
use quickdraw::zmq_service::ZmqFrontend;

/// Worker stand-in answering `value` after `delay`.
struct FixedDelayEngine {
    value: f64,
    delay: Duration,
}

#[async_trait]
impl ModelEngine for FixedDelayEngine {
    async fn predict(&self, _model: &VersionedModelId, _input: &Input) -> anyhow::Result<f64> {
        tokio::time::sleep(self.delay).await;
        Ok(self.value)
    }
}

struct Harness {
    base_url: String,
    store: Arc<MemoryStore>,
    http: HttpFrontend,
    cancel: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start_harness(engine: Arc<dyn ModelEngine>) -> Harness {
    let registry = Arc::new(MetricsRegistry::new());
    let processor = Arc::new(QueryProcessor::new(engine, &registry).unwrap());
    let store = Arc::new(MemoryStore::new());
    let http = HttpFrontend::new(processor.clone(), registry.clone()).unwrap();
    let zmq = ZmqFrontend::new(&registry, 1 << 16).unwrap();
    let cancel = CancellationToken::new();

    let registrar = Registrar::new(store.clone(), processor, http.clone(), zmq);
    tokio::spawn(registrar.run(cancel.child_token()));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let server = http.clone();
    let server_cancel = cancel.child_token();
    tokio::spawn(async move { server.serve(listener, server_cancel).await });

    Harness {
        base_url: format!("http://{address}"),
        store,
        http,
        cancel,
    }
}

fn alpha_record() -> AppRecord {
    AppRecord {
        candidate_models: "m:1".to_string(),
        input_type: "doubles".to_string(),
        policy: "default_output".to_string(),
        default_output: "7.0".to_string(),
        latency_slo_micros: "20000".to_string(),
    }
}

async fn register_and_wait(harness: &Harness, name: &str, record: &AppRecord) {
    harness.store.register_application(name, record).await.unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while harness.http.num_applications() == 0 && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(harness.http.num_applications() > 0, "registrar never installed {name}");
}

#[tokio::test]
async fn predict_happy_path() {
    let harness = start_harness(Arc::new(FixedDelayEngine {
        value: 42.0,
        delay: Duration::from_millis(1),
    }))
    .await;
    register_and_wait(&harness, "alpha", &alpha_record()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/alpha/predict", harness.base_url))
        .body(r#"{"uid":"u1","input":[1.0,2.0,3.0]}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["output"], 42.0);
    assert_eq!(body["default"], false);
    assert!(body["query_id"].is_u64());
}

#[tokio::test]
async fn slow_worker_falls_back_to_default() {
    let harness = start_harness(Arc::new(FixedDelayEngine {
        value: 42.0,
        delay: Duration::from_millis(50),
    }))
    .await;
    register_and_wait(&harness, "alpha", &alpha_record()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/alpha/predict", harness.base_url))
        .body(r#"{"uid":"u1","input":[1.0]}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["output"], 7.0);
    assert_eq!(body["default"], true);
}

#[tokio::test]
async fn schema_violation_is_a_json_error() {
    let harness = start_harness(Arc::new(FixedDelayEngine {
        value: 42.0,
        delay: Duration::from_millis(1),
    }))
    .await;
    register_and_wait(&harness, "alpha", &alpha_record()).await;

    let client = reqwest::Client::new();

    // Wrong element type.
    let response = client
        .post(format!("{}/alpha/predict", harness.base_url))
        .body(r#"{"uid":"u1","input":["abc"]}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Json error");
    assert!(!body["cause"].as_str().unwrap().is_empty());

    // Unparseable body.
    let response = client
        .post(format!("{}/alpha/predict", harness.base_url))
        .body("{oops")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Json error");
}

#[tokio::test]
async fn unregistered_application_is_not_found() {
    let harness = start_harness(Arc::new(FixedDelayEngine {
        value: 42.0,
        delay: Duration::from_millis(1),
    }))
    .await;
    register_and_wait(&harness, "alpha", &alpha_record()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/beta/predict", harness.base_url))
        .body(r#"{"uid":"u1","input":[1.0]}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn update_acknowledges_feedback() {
    let harness = start_harness(Arc::new(FixedDelayEngine {
        value: 42.0,
        delay: Duration::from_millis(1),
    }))
    .await;
    register_and_wait(&harness, "alpha", &alpha_record()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/alpha/update", harness.base_url))
        .body(r#"{"uid":"u1","input":[1.0],"label":3.0}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "Feedback received? true");
}

#[tokio::test]
async fn metrics_endpoint_reports_without_reset() {
    let harness = start_harness(Arc::new(FixedDelayEngine {
        value: 42.0,
        delay: Duration::from_millis(1),
    }))
    .await;
    register_and_wait(&harness, "alpha", &alpha_record()).await;

    let client = reqwest::Client::new();
    client
        .post(format!("{}/alpha/predict", harness.base_url))
        .body(r#"{"uid":"u1","input":[1.0]}"#)
        .send()
        .await
        .unwrap();

    let fetch = || async {
        let body = client
            .get(format!("{}/metrics", harness.base_url))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        serde_json::from_str::<serde_json::Value>(&body).unwrap()
    };
    let first = fetch().await;
    let queries = first["counters"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["name"] == "qp:num_queries")
        .unwrap()["count"]
        .as_u64()
        .unwrap();
    assert_eq!(queries, 1);

    // The endpoint never resets.
    let second = fetch().await;
    let queries_again = second["counters"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["name"] == "qp:num_queries")
        .unwrap()["count"]
        .as_u64()
        .unwrap();
    assert_eq!(queries_again, 1);
}
