// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup.
//!
//! Filters come from the `QD_LOG` environment variable (`info` when unset).
//! Setting `QD_LOG_JSONL=1` switches to line-delimited JSON output.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// ENV used to set the log level.
const FILTER_ENV: &str = "QD_LOG";

/// ENV that enables JSONL output.
const JSONL_ENV: &str = "QD_LOG_JSONL";

const DEFAULT_FILTER_LEVEL: &str = "info";

static INIT: Once = Once::new();

pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(FILTER_ENV)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER_LEVEL));
        let jsonl = std::env::var(JSONL_ENV).map(|v| v == "1").unwrap_or(false);
        if jsonl {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_current_span(false)
                .init();
        } else {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    });
}
