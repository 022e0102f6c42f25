// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The query processor: per-query model selection, deadline arithmetic,
//! dispatch to the model engine, and default-output fallback.
//!
//! A prediction is a race between the worker response and the deadline
//! timer. Whichever fires first completes the query; the loser's effect is
//! discarded. A missed deadline is not an error — the caller gets the
//! application's configured default output with `used_default` set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time;

use crate::engine::ModelEngine;
use crate::metrics::{Counter, Histogram, Meter, MetricsRegistry};
use crate::protocols::{
    micros_since_epoch, stages, FeedbackAck, FeedbackQuery, Query, Response, DEFAULT_USER_ID,
};
use crate::selection::{
    DefaultOutputSelectionPolicy, PolicyError, SelectionPolicy, StateKey, StateTable,
};

#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    #[error("no candidate models for application '{0}'")]
    NoCandidateModels(String),

    #[error("unknown selection policy '{0}'")]
    UnknownPolicy(String),

    #[error("no policy state for application '{0}'")]
    MissingState(String),

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

pub struct QueryProcessor {
    engine: Arc<dyn ModelEngine>,
    state_table: Arc<StateTable>,
    policies: HashMap<&'static str, Arc<dyn SelectionPolicy>>,
    query_counter: AtomicU64,
    num_queries: Arc<Counter>,
    num_feedback: Arc<Counter>,
    predict_latency: Arc<Histogram>,
    default_meter: Arc<Meter>,
}

impl QueryProcessor {
    pub fn new(
        engine: Arc<dyn ModelEngine>,
        registry: &MetricsRegistry,
    ) -> anyhow::Result<Self> {
        let mut policies: HashMap<&'static str, Arc<dyn SelectionPolicy>> = HashMap::new();
        let default_policy: Arc<dyn SelectionPolicy> = Arc::new(DefaultOutputSelectionPolicy);
        policies.insert(default_policy.name(), default_policy);
        Ok(Self {
            engine,
            state_table: Arc::new(StateTable::new()),
            policies,
            query_counter: AtomicU64::new(0),
            num_queries: registry.create_counter("qp:num_queries")?,
            num_feedback: registry.create_counter("qp:num_feedback")?,
            predict_latency: registry.create_histogram("qp:predict_latency_micros")?,
            default_meter: registry.create_meter("qp:default_rate")?,
        })
    }

    pub fn state_table(&self) -> Arc<StateTable> {
        self.state_table.clone()
    }

    fn policy(&self, name: &str) -> Result<&Arc<dyn SelectionPolicy>, PredictError> {
        self.policies
            .get(name)
            .ok_or_else(|| PredictError::UnknownPolicy(name.to_string()))
    }

    /// Policy state for the query's user, falling back to the application's
    /// default-user state seeded at registration.
    fn state_for(&self, app: &str, user: &str) -> Option<String> {
        let key = StateKey::new(app, user, 0);
        self.state_table.get(&key).or_else(|| {
            if user == DEFAULT_USER_ID {
                None
            } else {
                self.state_table
                    .get(&StateKey::new(app, DEFAULT_USER_ID, 0))
            }
        })
    }

    /// Run one query to completion. Errors are raised only for malformed
    /// dispatch state, before anything is sent to a worker.
    pub async fn predict(&self, mut query: Query) -> Result<Response, PredictError> {
        let query_id = self.query_counter.fetch_add(1, Ordering::Relaxed);
        self.num_queries.increment(1);

        if query.candidate_models.is_empty() {
            return Err(PredictError::NoCandidateModels(query.app));
        }
        let policy = self.policy(&query.policy)?;
        let state = self
            .state_for(&query.app, &query.user_id)
            .ok_or_else(|| PredictError::MissingState(query.app.clone()))?;
        let decision = policy.select(&state, &query.candidate_models)?;

        query
            .lineage
            .insert(stages::QP_DISPATCH.to_string(), micros_since_epoch());

        // The engine call runs detached so a deadline miss never cancels the
        // in-flight worker request; a late result lands in a dropped
        // receiver.
        let (tx, rx) = oneshot::channel();
        let engine = self.engine.clone();
        let model = decision.model.clone();
        let input = query.input.clone();
        let app = query.app.clone();
        tokio::spawn(async move {
            let result = engine.predict(&model, &input).await;
            if let Err(err) = &result {
                tracing::warn!(app, model = %model, %err, "model engine error");
            }
            let _ = tx.send(result);
        });

        let deadline = time::Instant::from_std(query.deadline);
        let worker_result = tokio::select! {
            result = rx => Some(result),
            _ = time::sleep_until(deadline) => None,
        };

        let (output, used_default) = match worker_result {
            Some(Ok(Ok(value))) => {
                query.lineage.insert(
                    stages::QP_RESPONSE_RECEIVED.to_string(),
                    micros_since_epoch(),
                );
                (value, false)
            }
            // The worker path failed before the deadline; there is nothing
            // to return early, so hold the response until the budget is
            // spent and fall back to the default.
            Some(_) => {
                time::sleep_until(deadline).await;
                self.fall_back(&mut query.lineage);
                (decision.default_output, true)
            }
            None => {
                self.fall_back(&mut query.lineage);
                (decision.default_output, true)
            }
        };

        self.predict_latency
            .insert(query.created_at.elapsed().as_micros() as i64);

        Ok(Response {
            query_id,
            output,
            used_default,
            lineage: query.lineage,
        })
    }

    fn fall_back(&self, lineage: &mut crate::protocols::Lineage) {
        lineage.insert(stages::QP_DEADLINE_FIRED.to_string(), micros_since_epoch());
        self.default_meter.mark(1);
    }

    /// Apply feedback to the selection-policy state under per-key
    /// atomicity. Acks `false` when no state exists for the key.
    pub async fn update(&self, feedback: FeedbackQuery) -> Result<FeedbackAck, PredictError> {
        self.num_feedback.increment(1);
        let policy = self.policy(&feedback.policy)?.clone();

        let user_key = StateKey::new(&feedback.app, &feedback.user_id, 0);
        let fb = &feedback.feedback;
        let mut updated = self
            .state_table
            .apply(&user_key, |state| policy.on_feedback(state, fb))?;
        if !updated && feedback.user_id != DEFAULT_USER_ID {
            let default_key = StateKey::new(&feedback.app, DEFAULT_USER_ID, 0);
            updated = self
                .state_table
                .apply(&default_key, |state| policy.on_feedback(state, fb))?;
        }
        Ok(FeedbackAck(updated))
    }
}
