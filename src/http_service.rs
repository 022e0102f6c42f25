// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! HTTP frontend: per-application `/predict` and `/update` endpoints plus
//! the fixed `/metrics` and `/health` routes.
//!
//! Application endpoints are resolved dynamically against the registered
//! application map so the registrar can install them at runtime; a path for
//! an unregistered application is a plain 404. Handlers are async end to
//! end — awaiting the processor future never ties up an I/O thread.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response as AxumResponse},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::metrics::{Meter, MetricsRegistry};
use crate::processor::QueryProcessor;
use crate::protocols::{Feedback, FeedbackQuery, Input, InputType, Query, VersionedModelId};

const ERROR_NAME_JSON: &str = "Json error";
const ERROR_NAME_QUERY_PROCESSING: &str = "Query processing error";

const PREDICTION_JSON_SCHEMA: &str = r#"
  {
   "uid" := string,
   "input" := [double] | [int] | [string] | [byte] | [float],
  }
"#;

const UPDATE_JSON_SCHEMA: &str = r#"
  {
   "uid" := string,
   "input" := [double] | [int] | [string] | [byte] | [float],
   "label" := double
  }
"#;

/// Everything the HTTP handlers need to serve one application.
#[derive(Debug, Clone)]
pub struct HttpApp {
    pub name: String,
    pub input_type: InputType,
    pub policy: String,
    pub latency_budget: Duration,
    pub candidate_models: Vec<VersionedModelId>,
}

struct HttpState {
    apps: RwLock<HashMap<String, Arc<HttpApp>>>,
    processor: Arc<QueryProcessor>,
    registry: Arc<MetricsRegistry>,
    predict_meter: Arc<Meter>,
    update_meter: Arc<Meter>,
    json_error_meter: Arc<Meter>,
}

#[derive(Clone)]
pub struct HttpFrontend {
    state: Arc<HttpState>,
}

impl HttpFrontend {
    pub fn new(processor: Arc<QueryProcessor>, registry: Arc<MetricsRegistry>) -> Result<Self> {
        let predict_meter = registry.create_meter("query_frontend:predict_requests")?;
        let update_meter = registry.create_meter("query_frontend:update_requests")?;
        let json_error_meter = registry.create_meter("query_frontend:json_errors")?;
        Ok(Self {
            state: Arc::new(HttpState {
                apps: RwLock::new(HashMap::new()),
                processor,
                registry,
                predict_meter,
                update_meter,
                json_error_meter,
            }),
        })
    }

    /// Install the endpoints for an application. First writer wins;
    /// returns `false` when the name was already registered.
    pub fn add_application(&self, app: HttpApp) -> bool {
        let mut apps = self.state.apps.write().unwrap();
        if apps.contains_key(&app.name) {
            return false;
        }
        apps.insert(app.name.clone(), Arc::new(app));
        true
    }

    /// Number of registered applications (`/predict` + `/update` endpoint
    /// pairs; `/metrics` is not counted).
    pub fn num_applications(&self) -> usize {
        self.state.apps.read().unwrap().len()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(get_metrics))
            .route("/health", get(get_health))
            .route("/{app}/predict", post(post_predict))
            .route("/{app}/update", post(post_update))
            .with_state(self.state.clone())
    }

    /// Serve until cancelled. The caller binds the listener so startup
    /// failures surface before the accept loop starts.
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let address = listener.local_addr()?;
        tracing::info!(%address, "http frontend listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await?;
        Ok(())
    }
}

async fn get_health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn get_metrics(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let report = state.registry.report_metrics(false);
    tracing::info!(metrics = %report, "metrics report served");
    (
        [(header::CONTENT_TYPE, "application/json")],
        report,
    )
}

fn error_body(error: &str, cause: String) -> Value {
    json!({ "error": error, "cause": cause })
}

fn json_error_msg(exception_msg: &str, expected_schema: &str) -> String {
    format!("Error parsing JSON: {exception_msg}. Expected JSON schema: {expected_schema}")
}

fn json_error_response(state: &HttpState, cause: &str, schema: &str) -> AxumResponse {
    state.json_error_meter.mark(1);
    (
        StatusCode::BAD_REQUEST,
        Json(error_body(ERROR_NAME_JSON, json_error_msg(cause, schema))),
    )
        .into_response()
}

/// Parse and type-check a request body against the application's input
/// type. Both malformed JSON and schema violations surface as the same
/// client-facing error kind, with the cause distinguishing them.
fn decode_body(body: &str) -> Result<serde_json::Map<String, Value>, String> {
    let value: Value =
        serde_json::from_str(body).map_err(|err| err.to_string())?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err("request body is not a JSON object".to_string()),
    }
}

fn decode_uid(map: &serde_json::Map<String, Value>) -> Result<String, String> {
    map.get("uid")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| "'uid' is missing or not a string".to_string())
}

fn decode_input(
    map: &serde_json::Map<String, Value>,
    input_type: InputType,
) -> Result<Input, String> {
    let elements = map
        .get("input")
        .and_then(Value::as_array)
        .ok_or_else(|| "'input' is missing or not an array".to_string())?;
    let type_error =
        |i: usize| format!("input element {i} is not of type {input_type}");
    match input_type {
        InputType::Bytes => elements
            .iter()
            .enumerate()
            .map(|(i, v)| {
                v.as_u64()
                    .filter(|&b| b <= u8::MAX as u64)
                    .map(|b| b as u8)
                    .ok_or_else(|| type_error(i))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Input::Bytes),
        InputType::Ints => elements
            .iter()
            .enumerate()
            .map(|(i, v)| {
                v.as_i64()
                    .filter(|&x| i32::try_from(x).is_ok())
                    .map(|x| x as i32)
                    .ok_or_else(|| type_error(i))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Input::Ints),
        InputType::Floats => elements
            .iter()
            .enumerate()
            .map(|(i, v)| v.as_f64().map(|x| x as f32).ok_or_else(|| type_error(i)))
            .collect::<Result<Vec<_>, _>>()
            .map(Input::Floats),
        InputType::Doubles => elements
            .iter()
            .enumerate()
            .map(|(i, v)| v.as_f64().ok_or_else(|| type_error(i)))
            .collect::<Result<Vec<_>, _>>()
            .map(Input::Doubles),
        InputType::Strings => elements
            .iter()
            .enumerate()
            .map(|(i, v)| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| type_error(i))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Input::Strings),
    }
}

fn lookup_app(state: &HttpState, name: &str) -> Option<Arc<HttpApp>> {
    state.apps.read().unwrap().get(name).cloned()
}

async fn post_predict(
    State(state): State<Arc<HttpState>>,
    Path(app_name): Path<String>,
    body: String,
) -> AxumResponse {
    let Some(app) = lookup_app(&state, &app_name) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    state.predict_meter.mark(1);

    let parsed = decode_body(&body)
        .and_then(|map| Ok((decode_uid(&map)?, decode_input(&map, app.input_type)?)));
    let (uid, input) = match parsed {
        Ok(parts) => parts,
        Err(cause) => return json_error_response(&state, &cause, PREDICTION_JSON_SCHEMA),
    };

    let query = Query::new(
        app.name.clone(),
        uid,
        input,
        app.latency_budget,
        app.policy.clone(),
        app.candidate_models.clone(),
    );
    match state.processor.predict(query).await {
        Ok(response) => Json(json!({
            "query_id": response.query_id,
            "output": response.output,
            "default": response.used_default,
        }))
        .into_response(),
        Err(err) => (
            StatusCode::BAD_REQUEST,
            Json(error_body(ERROR_NAME_QUERY_PROCESSING, err.to_string())),
        )
            .into_response(),
    }
}

async fn post_update(
    State(state): State<Arc<HttpState>>,
    Path(app_name): Path<String>,
    body: String,
) -> AxumResponse {
    let Some(app) = lookup_app(&state, &app_name) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    state.update_meter.mark(1);

    let parsed = decode_body(&body).and_then(|map| {
        let uid = decode_uid(&map)?;
        let input = decode_input(&map, app.input_type)?;
        let label = map
            .get("label")
            .and_then(Value::as_f64)
            .ok_or_else(|| "'label' is missing or not a double".to_string())?;
        Ok((uid, input, label))
    });
    let (uid, input, label) = match parsed {
        Ok(parts) => parts,
        Err(cause) => return json_error_response(&state, &cause, UPDATE_JSON_SCHEMA),
    };

    let feedback = FeedbackQuery {
        app: app.name.clone(),
        user_id: uid,
        feedback: Feedback { input, label },
        policy: app.policy.clone(),
        candidate_models: app.candidate_models.clone(),
    };
    match state.processor.update(feedback).await {
        Ok(ack) => format!("Feedback received? {}", ack.0).into_response(),
        Err(err) => (
            StatusCode::BAD_REQUEST,
            Json(error_body(ERROR_NAME_QUERY_PROCESSING, err.to_string())),
        )
            .into_response(),
    }
}
