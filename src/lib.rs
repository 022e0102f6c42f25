// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Quickdraw
//!
//! A deadline-aware online prediction serving frontend. Requests arrive
//! over HTTP or a binary ZeroMQ transport, get routed to model replicas
//! through a pluggable engine, and come back within the application's
//! latency budget — with the configured default output standing in when
//! the budget is spent.

pub use anyhow::{anyhow as error, bail as raise, Context as ErrorContext, Error, Result};

pub use tokio_util::sync::CancellationToken;

mod config;
pub use config::FrontendConfig;

pub mod arena;
pub mod engine;
pub mod http_service;
pub mod logging;
pub mod metrics;
pub mod processor;
pub mod protocols;
pub mod registrar;
pub mod selection;
pub mod store;
pub mod zmq_service;
