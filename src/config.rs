// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Frontend process configuration.
//!
//! Values are merged in priority order: environment variables prefixed with
//! `QD_` (highest), then the optional TOML file named by `QD_CONFIG_PATH`,
//! then built-in defaults.

use anyhow::Result;
use derive_builder::Builder;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";
const DEFAULT_HTTP_PORT: u16 = 1337;
const DEFAULT_ZMQ_SEND_PORT: u16 = 4456;
const DEFAULT_ZMQ_RECV_PORT: u16 = 4455;
const DEFAULT_STORE_ADDRESS: &str = "localhost";
const DEFAULT_STORE_PORT: u16 = 6379;
const DEFAULT_HTTP_THREADS: usize = 4;
/// Default payload arena size. Production deployments should size this at
/// least twice the expected in-flight payload bytes; see the arena module.
const DEFAULT_ARENA_BYTES: usize = 1 << 30;

/// Environment variable naming the optional TOML config file.
const CONFIG_PATH_ENV: &str = "QD_CONFIG_PATH";

#[derive(Debug, Clone, Serialize, Deserialize, Validate, Builder)]
#[builder(pattern = "owned", build_fn(private, name = "build_internal"))]
pub struct FrontendConfig {
    /// Address both frontends bind on.
    #[builder(setter(into), default = "DEFAULT_LISTEN_ADDRESS.to_string()")]
    pub listen_address: String,

    #[validate(range(min = 1))]
    #[builder(default = "DEFAULT_HTTP_PORT")]
    pub http_port: u16,

    #[validate(range(min = 1))]
    #[builder(default = "DEFAULT_ZMQ_SEND_PORT")]
    pub zmq_send_port: u16,

    #[validate(range(min = 1))]
    #[builder(default = "DEFAULT_ZMQ_RECV_PORT")]
    pub zmq_recv_port: u16,

    /// Configuration store host.
    #[builder(setter(into), default = "DEFAULT_STORE_ADDRESS.to_string()")]
    pub store_address: String,

    #[validate(range(min = 1))]
    #[builder(default = "DEFAULT_STORE_PORT")]
    pub store_port: u16,

    /// Connection attempts against the store before giving up;
    /// 0 retries forever.
    #[builder(default = "0")]
    pub store_connect_attempts: u32,

    /// Worker threads for the tokio runtime serving HTTP I/O.
    #[validate(range(min = 1))]
    #[builder(default = "DEFAULT_HTTP_THREADS")]
    pub http_threads: usize,

    /// Byte capacity of the ZMQ payload arena.
    #[validate(range(min = 4096))]
    #[builder(default = "DEFAULT_ARENA_BYTES")]
    pub arena_bytes: usize,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        FrontendConfigBuilder::default()
            .build_internal()
            .expect("builder defaults are complete")
    }
}

impl FrontendConfig {
    pub fn builder() -> FrontendConfigBuilder {
        FrontendConfigBuilder::default()
    }

    fn figment() -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(FrontendConfig::default()));
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed("QD_"))
    }

    /// Load the configuration from the environment and optional config file.
    pub fn from_settings() -> Result<FrontendConfig> {
        let config: FrontendConfig = Self::figment().extract()?;
        config.validate()?;
        Ok(config)
    }
}

impl FrontendConfigBuilder {
    pub fn build(self) -> Result<FrontendConfig> {
        let config = self.build_internal()?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = FrontendConfig::default();
        assert_eq!(config.http_port, 1337);
        assert_eq!(config.zmq_recv_port, 4455);
        assert_eq!(config.zmq_send_port, 4456);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_overrides() {
        let config = FrontendConfig::builder()
            .http_port(8080)
            .arena_bytes(1 << 20)
            .build()
            .unwrap();
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.arena_bytes, 1 << 20);
        assert_eq!(config.store_port, 6379);
    }

    #[test]
    fn builder_rejects_zero_threads() {
        let result = FrontendConfig::builder().http_threads(0).build();
        assert!(result.is_err());
    }
}
