// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Core data model shared by the frontends and the query processor.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// User id applied to queries that arrive without one (ZMQ requests, and
/// the registrar's initial policy state).
pub const DEFAULT_USER_ID: &str = "0";

/// Element type of an application's input tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputType {
    Bytes,
    Ints,
    Floats,
    Doubles,
    Strings,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid input type '{0}'")]
pub struct InvalidInputType(pub String);

impl InputType {
    /// Parse the string form used by the configuration store.
    pub fn parse(s: &str) -> Result<Self, InvalidInputType> {
        match s {
            "bytes" => Ok(InputType::Bytes),
            "ints" | "integers" => Ok(InputType::Ints),
            "floats" => Ok(InputType::Floats),
            "doubles" => Ok(InputType::Doubles),
            "strings" => Ok(InputType::Strings),
            other => Err(InvalidInputType(other.to_string())),
        }
    }

    /// Single-byte code used on the ZMQ wire.
    pub fn wire_code(self) -> u8 {
        match self {
            InputType::Bytes => 0,
            InputType::Ints => 1,
            InputType::Floats => 2,
            InputType::Doubles => 3,
            InputType::Strings => 4,
        }
    }

    pub fn from_wire_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(InputType::Bytes),
            1 => Some(InputType::Ints),
            2 => Some(InputType::Floats),
            3 => Some(InputType::Doubles),
            4 => Some(InputType::Strings),
            _ => None,
        }
    }

    /// Byte width of one element, `None` for variable-width strings.
    pub fn element_size(self) -> Option<usize> {
        match self {
            InputType::Bytes => Some(1),
            InputType::Ints => Some(4),
            InputType::Floats => Some(4),
            InputType::Doubles => Some(8),
            InputType::Strings => None,
        }
    }
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InputType::Bytes => "bytes",
            InputType::Ints => "ints",
            InputType::Floats => "floats",
            InputType::Doubles => "doubles",
            InputType::Strings => "strings",
        };
        write!(f, "{s}")
    }
}

/// A `(model name, version)` pair identifying one replica set served by an
/// external worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionedModelId {
    pub name: String,
    pub version: u32,
}

impl VersionedModelId {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for VersionedModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

/// Typed input tensor. The element type must match the target application's
/// configured input type; mismatches are rejected at parse time.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Bytes(Vec<u8>),
    Ints(Vec<i32>),
    Floats(Vec<f32>),
    Doubles(Vec<f64>),
    Strings(Vec<String>),
}

impl Input {
    pub fn input_type(&self) -> InputType {
        match self {
            Input::Bytes(_) => InputType::Bytes,
            Input::Ints(_) => InputType::Ints,
            Input::Floats(_) => InputType::Floats,
            Input::Doubles(_) => InputType::Doubles,
            Input::Strings(_) => InputType::Strings,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Input::Bytes(v) => v.len(),
            Input::Ints(v) => v.len(),
            Input::Floats(v) => v.len(),
            Input::Doubles(v) => v.len(),
            Input::Strings(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Flat map of pipeline stage name to microseconds since the UNIX epoch.
/// Ordered so the serialized form is stable.
pub type Lineage = BTreeMap<String, u64>;

/// Stage names stamped by the core pipeline. Clients add `driver::send` /
/// `driver::recv` on their side.
pub mod stages {
    pub const FRONTEND_RECV: &str = "frontend::recv";
    pub const FRONTEND_SEND: &str = "frontend::send";
    pub const QP_DISPATCH: &str = "qp::dispatch";
    pub const QP_RESPONSE_RECEIVED: &str = "qp::response_received";
    pub const QP_DEADLINE_FIRED: &str = "qp::deadline_fired";
}

pub fn micros_since_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// One prediction request flowing through the processor. Ephemeral: created
/// on arrival, destroyed once the response is delivered or the deadline
/// fires.
#[derive(Debug, Clone)]
pub struct Query {
    pub app: String,
    pub user_id: String,
    pub input: Input,
    pub created_at: Instant,
    /// Absolute monotonic-time deadline after which the default output wins.
    pub deadline: Instant,
    pub policy: String,
    pub candidate_models: Vec<VersionedModelId>,
    pub lineage: Lineage,
}

impl Query {
    pub fn new(
        app: impl Into<String>,
        user_id: impl Into<String>,
        input: Input,
        latency_budget: Duration,
        policy: impl Into<String>,
        candidate_models: Vec<VersionedModelId>,
    ) -> Self {
        let now = Instant::now();
        Self {
            app: app.into(),
            user_id: user_id.into(),
            input,
            created_at: now,
            deadline: now + latency_budget,
            policy: policy.into(),
            candidate_models,
            lineage: Lineage::new(),
        }
    }

    /// Variant used by the ZMQ path, where the receive loop already fixed
    /// the deadline when the request came off the wire.
    #[allow(clippy::too_many_arguments)]
    pub fn with_deadline(
        app: impl Into<String>,
        user_id: impl Into<String>,
        input: Input,
        deadline: Instant,
        policy: impl Into<String>,
        candidate_models: Vec<VersionedModelId>,
        lineage: Lineage,
    ) -> Self {
        Self {
            app: app.into(),
            user_id: user_id.into(),
            input,
            created_at: Instant::now(),
            deadline,
            policy: policy.into(),
            candidate_models,
            lineage,
        }
    }
}

/// Completed prediction. `used_default` is set when the deadline timer won
/// the race against the worker response.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub query_id: u64,
    pub output: f64,
    pub used_default: bool,
    pub lineage: Lineage,
}

/// A labelled observation fed back into the selection policy.
#[derive(Debug, Clone)]
pub struct Feedback {
    pub input: Input,
    pub label: f64,
}

#[derive(Debug, Clone)]
pub struct FeedbackQuery {
    pub app: String,
    pub user_id: String,
    pub feedback: Feedback,
    pub policy: String,
    pub candidate_models: Vec<VersionedModelId>,
}

/// Boolean acknowledgment of a feedback update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackAck(pub bool);
