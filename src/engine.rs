// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Seam to the model-RPC path.
//!
//! The query processor dispatches every prediction through a [`ModelEngine`].
//! Real deployments plug in a client for their worker transport here; the
//! built-in [`EchoEngine`] lets the frontend binary serve standalone.

use async_trait::async_trait;

use crate::protocols::{Input, VersionedModelId};

#[async_trait]
pub trait ModelEngine: Send + Sync {
    /// Forward one input to a replica of `model` and return its prediction.
    /// Completion may happen on any runtime thread; callers race the result
    /// against their deadline.
    async fn predict(&self, model: &VersionedModelId, input: &Input) -> anyhow::Result<f64>;
}

/// Engine that reflects the first input element back as the prediction
/// (0.0 for empty or string inputs).
pub struct EchoEngine;

#[async_trait]
impl ModelEngine for EchoEngine {
    async fn predict(&self, _model: &VersionedModelId, input: &Input) -> anyhow::Result<f64> {
        let value = match input {
            Input::Bytes(v) => v.first().map(|&b| b as f64),
            Input::Ints(v) => v.first().map(|&i| i as f64),
            Input::Floats(v) => v.first().map(|&f| f as f64),
            Input::Doubles(v) => v.first().copied(),
            Input::Strings(_) => None,
        };
        Ok(value.unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_engine_reflects_first_element() {
        let engine = EchoEngine;
        let model = VersionedModelId::new("m", 1);
        let out = engine
            .predict(&model, &Input::Doubles(vec![42.0, 1.0]))
            .await
            .unwrap();
        assert_eq!(out, 42.0);

        let out = engine
            .predict(&model, &Input::Strings(vec!["a".to_string()]))
            .await
            .unwrap();
        assert_eq!(out, 0.0);
    }
}
