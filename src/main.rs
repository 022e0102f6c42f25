// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Frontend binary: wire the configuration store, query processor,
//! registrar and both frontends together, then serve until interrupted.
//!
//! Exit code 0 on clean shutdown; non-zero when the configuration store
//! cannot be reached (with bounded retries configured) or a ZMQ bind
//! fails.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use quickdraw::engine::EchoEngine;
use quickdraw::http_service::HttpFrontend;
use quickdraw::metrics::MetricsRegistry;
use quickdraw::processor::QueryProcessor;
use quickdraw::registrar::Registrar;
use quickdraw::store::{ApplicationStore, RedisStore};
use quickdraw::zmq_service::ZmqFrontend;
use quickdraw::FrontendConfig;

fn main() -> Result<()> {
    quickdraw::logging::init();
    let config = FrontendConfig::from_settings()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.http_threads)
        .enable_all()
        .build()
        .context("building runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: FrontendConfig) -> Result<()> {
    let registry = Arc::new(MetricsRegistry::new());

    let store: Arc<dyn ApplicationStore> = Arc::new(
        RedisStore::connect(
            &config.store_address,
            config.store_port,
            config.store_connect_attempts,
        )
        .await?,
    );

    // The model-RPC path plugs in here; standalone runs answer with the
    // echo engine.
    let processor = Arc::new(QueryProcessor::new(Arc::new(EchoEngine), &registry)?);

    let cancel = CancellationToken::new();

    let zmq = ZmqFrontend::new(&registry, config.arena_bytes)?;
    zmq.start(
        &config.listen_address,
        config.zmq_send_port,
        config.zmq_recv_port,
    )?;

    let http = HttpFrontend::new(processor.clone(), registry.clone())?;
    let listener = TcpListener::bind((config.listen_address.as_str(), config.http_port))
        .await
        .with_context(|| format!("binding http listener on {}", config.http_port))?;

    let registrar = Registrar::new(store, processor, http.clone(), zmq.clone());
    let mut registrar_task = tokio::spawn(registrar.run(cancel.child_token()));

    let result = tokio::select! {
        served = http.serve(listener, cancel.child_token()) => served,
        watched = &mut registrar_task => {
            // The registrar only returns early on store loss, which is
            // fatal: correctness needs the configuration source of truth.
            watched.context("registrar task panicked")?
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            Ok(())
        }
    };

    cancel.cancel();
    zmq.stop().await;
    registrar_task.abort();
    result
}
