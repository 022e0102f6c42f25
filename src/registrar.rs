// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Watches the configuration store and installs per-application handlers
//! into both frontends at runtime.
//!
//! Only `hset` events are acted on; registration is append-only for the
//! process lifetime, and repeat events for a known name are ignored
//! (first writer wins everywhere).

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::http_service::{HttpApp, HttpFrontend};
use crate::processor::QueryProcessor;
use crate::protocols::{InputType, Query, VersionedModelId, DEFAULT_USER_ID};
use crate::selection::{
    DefaultOutputSelectionPolicy, SelectionPolicy, StateKey, DEFAULT_OUTPUT_POLICY,
};
use crate::store::{str_to_models, ApplicationStore, EVENT_HSET};
use crate::zmq_service::{
    AppFunction, FrontendRpcRequest, FrontendRpcResponse, ResponseSender, ZmqFrontend,
};

pub struct Registrar {
    store: Arc<dyn ApplicationStore>,
    processor: Arc<QueryProcessor>,
    http: HttpFrontend,
    zmq: ZmqFrontend,
    registered: Mutex<HashSet<String>>,
}

impl Registrar {
    pub fn new(
        store: Arc<dyn ApplicationStore>,
        processor: Arc<QueryProcessor>,
        http: HttpFrontend,
        zmq: ZmqFrontend,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            processor,
            http,
            zmq,
            registered: Mutex::new(HashSet::new()),
        })
    }

    /// Consume the store's change stream until cancelled. The stream
    /// closing means the configuration source of truth is gone, which is
    /// fatal to the frontend.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut events = self
            .store
            .subscribe_to_application_changes()
            .await
            .context("subscribing to application changes")?;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = events.recv() => {
                    let Some(event) = event else {
                        anyhow::bail!("configuration store subscription lost");
                    };
                    tracing::info!(key = event.key, event_type = event.event_type, "application event detected");
                    if event.event_type != EVENT_HSET {
                        continue;
                    }
                    if self.registered.lock().unwrap().contains(&event.key) {
                        continue;
                    }
                    match self.install(&event.key).await {
                        Ok(()) => {
                            self.registered.lock().unwrap().insert(event.key.clone());
                            tracing::info!(app = event.key, "new application registered");
                        }
                        Err(err) => {
                            tracing::error!(app = event.key, %err, "failed to register application");
                        }
                    }
                }
            }
        }
    }

    async fn install(&self, name: &str) -> Result<()> {
        let record = self.store.get_application(name).await?;
        let candidate_models = str_to_models(&record.candidate_models)?;
        let input_type = InputType::parse(&record.input_type)?;
        let default_output: f64 = record
            .default_output
            .parse()
            .with_context(|| format!("default_output '{}'", record.default_output))?;
        let latency_slo_micros: u64 = record
            .latency_slo_micros
            .parse()
            .with_context(|| format!("latency_slo_micros '{}'", record.latency_slo_micros))?;
        let latency_budget = Duration::from_micros(latency_slo_micros);

        // Seed the selection state the processor falls back to for every
        // user of this application.
        if record.policy == DEFAULT_OUTPUT_POLICY {
            let policy = DefaultOutputSelectionPolicy;
            self.processor.state_table().put(
                StateKey::new(name, DEFAULT_USER_ID, 0),
                policy.init_state(default_output),
            );
        } else {
            tracing::warn!(
                app = name,
                policy = record.policy,
                "unrecognized selection policy; queries will be rejected"
            );
        }

        self.http.add_application(HttpApp {
            name: name.to_string(),
            input_type,
            policy: record.policy.clone(),
            latency_budget,
            candidate_models: candidate_models.clone(),
        });

        let function = zmq_app_function(
            self.processor.clone(),
            self.zmq.response_sender(),
            name.to_string(),
            record.policy,
            candidate_models,
        );
        self.zmq.add_application(name, latency_budget, function);
        Ok(())
    }
}

/// Dispatch function installed into the ZMQ frontend for one application:
/// decode the arena-backed input, run the query, and enqueue the response.
fn zmq_app_function(
    processor: Arc<QueryProcessor>,
    sender: ResponseSender,
    app: String,
    policy: String,
    candidate_models: Vec<VersionedModelId>,
) -> AppFunction {
    Arc::new(move |request: FrontendRpcRequest| {
        let processor = processor.clone();
        let sender = sender.clone();
        let app = app.clone();
        let policy = policy.clone();
        let candidate_models = candidate_models.clone();
        tokio::spawn(async move {
            let input = match request.decode_input() {
                Ok(input) => input,
                Err(err) => {
                    tracing::warn!(app, %err, "dropping undecodable request payload");
                    return;
                }
            };
            let query = Query::with_deadline(
                app.clone(),
                DEFAULT_USER_ID,
                input,
                request.deadline,
                policy,
                candidate_models,
                request.lineage,
            );
            match processor.predict(query).await {
                Ok(response) => sender.send(FrontendRpcResponse {
                    request_id: request.request_id,
                    client_id: request.client_id,
                    output: response.output,
                    lineage: response.lineage,
                    payload: Some(request.payload),
                }),
                Err(err) => {
                    tracing::warn!(app, %err, "query processing failed");
                }
            }
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EchoEngine;
    use crate::metrics::MetricsRegistry;
    use crate::store::{AppRecord, MemoryStore};

    fn record() -> AppRecord {
        AppRecord {
            candidate_models: "m:1".to_string(),
            input_type: "doubles".to_string(),
            policy: DEFAULT_OUTPUT_POLICY.to_string(),
            default_output: "7.0".to_string(),
            latency_slo_micros: "20000".to_string(),
        }
    }

    async fn registrar_fixture() -> (Arc<Registrar>, Arc<MemoryStore>, HttpFrontend, ZmqFrontend) {
        let registry = Arc::new(MetricsRegistry::new());
        let processor =
            Arc::new(QueryProcessor::new(Arc::new(EchoEngine), &registry).unwrap());
        let store = Arc::new(MemoryStore::new());
        let http = HttpFrontend::new(processor.clone(), registry.clone()).unwrap();
        let zmq = ZmqFrontend::new(&registry, 1 << 16).unwrap();
        let registrar = Registrar::new(store.clone(), processor, http.clone(), zmq.clone());
        (registrar, store, http, zmq)
    }

    #[tokio::test]
    async fn hset_event_installs_both_frontends() {
        let (registrar, store, http, zmq) = registrar_fixture().await;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(registrar.run(cancel.clone()));

        store.register_application("alpha", &record()).await.unwrap();

        // Within a bounded interval both frontends accept the application.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while http.num_applications() == 0 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(http.num_applications(), 1);
        assert_eq!(zmq.num_applications(), 1);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn repeat_events_are_ignored() {
        let (registrar, store, http, _zmq) = registrar_fixture().await;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(registrar.run(cancel.clone()));

        store.register_application("alpha", &record()).await.unwrap();
        let mut second = record();
        second.default_output = "99.0".to_string();
        store.register_application("alpha", &second).await.unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while http.num_applications() == 0 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(http.num_applications(), 1);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_record_is_skipped_not_fatal() {
        let (registrar, store, http, _zmq) = registrar_fixture().await;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(registrar.run(cancel.clone()));

        let mut bad = record();
        bad.latency_slo_micros = "soon".to_string();
        store.register_application("broken", &bad).await.unwrap();
        store.register_application("alpha", &record()).await.unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while http.num_applications() == 0 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(http.num_applications(), 1);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
