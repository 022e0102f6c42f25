// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Client for the external configuration store.
//!
//! Application records live in the store as per-application hashes; change
//! notifications arrive on a pub/sub channel as `(key, event_type)` pairs.
//! The production implementation is Redis-backed; an in-memory variant
//! serves tests and standalone runs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::protocols::VersionedModelId;

/// Store event acted on by the registrar: a new application hash was
/// written.
pub const EVENT_HSET: &str = "hset";

const CONNECT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to connect to configuration store at {address}: {cause}")]
    Connect { address: String, cause: String },

    #[error("configuration store request failed: {0}")]
    Request(#[from] redis::RedisError),

    #[error("no application record for '{0}'")]
    MissingApplication(String),

    #[error("malformed application record: {0}")]
    MalformedRecord(String),
}

/// One application hash as stored, string-typed. The registrar parses the
/// fields into their runtime forms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppRecord {
    pub candidate_models: String,
    pub input_type: String,
    pub policy: String,
    pub default_output: String,
    pub latency_slo_micros: String,
}

impl AppRecord {
    pub fn from_map(name: &str, map: HashMap<String, String>) -> Result<Self, StoreError> {
        let field = |key: &str| {
            map.get(key).cloned().ok_or_else(|| {
                StoreError::MalformedRecord(format!("application '{name}' is missing '{key}'"))
            })
        };
        Ok(Self {
            candidate_models: field("candidate_models")?,
            input_type: field("input_type")?,
            policy: field("policy")?,
            default_output: field("default_output")?,
            latency_slo_micros: field("latency_slo_micros")?,
        })
    }

    fn to_pairs(&self) -> [(&'static str, &str); 5] {
        [
            ("candidate_models", &self.candidate_models),
            ("input_type", &self.input_type),
            ("policy", &self.policy),
            ("default_output", &self.default_output),
            ("latency_slo_micros", &self.latency_slo_micros),
        ]
    }
}

/// A single store mutation as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppEvent {
    pub key: String,
    pub event_type: String,
}

/// Parse the store's serialized candidate list, `"name:version,..."`.
pub fn str_to_models(s: &str) -> Result<Vec<VersionedModelId>, StoreError> {
    s.split(',')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (name, version) = part.split_once(':').ok_or_else(|| {
                StoreError::MalformedRecord(format!("candidate model '{part}' is not name:version"))
            })?;
            let version = version.parse::<u32>().map_err(|_| {
                StoreError::MalformedRecord(format!("candidate model version '{version}'"))
            })?;
            Ok(VersionedModelId::new(name, version))
        })
        .collect()
}

#[async_trait]
pub trait ApplicationStore: Send + Sync {
    async fn get_application(&self, name: &str) -> Result<AppRecord, StoreError>;

    async fn register_application(&self, name: &str, record: &AppRecord)
        -> Result<(), StoreError>;

    /// Subscribe to every store mutation. The channel closing signals loss
    /// of the subscriber connection, which callers treat as fatal.
    async fn subscribe_to_application_changes(
        &self,
    ) -> Result<UnboundedReceiver<AppEvent>, StoreError>;
}

/// In-memory store used by tests and standalone runs.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, AppRecord>>,
    subscribers: Mutex<Vec<UnboundedSender<AppEvent>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApplicationStore for MemoryStore {
    async fn get_application(&self, name: &str) -> Result<AppRecord, StoreError> {
        self.records
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::MissingApplication(name.to_string()))
    }

    async fn register_application(
        &self,
        name: &str,
        record: &AppRecord,
    ) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap()
            .insert(name.to_string(), record.clone());
        let event = AppEvent {
            key: name.to_string(),
            event_type: EVENT_HSET.to_string(),
        };
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
        Ok(())
    }

    async fn subscribe_to_application_changes(
        &self,
    ) -> Result<UnboundedReceiver<AppEvent>, StoreError> {
        let (tx, rx) = unbounded_channel();
        // Replay existing records so late subscribers converge.
        {
            let records = self.records.lock().unwrap();
            for name in records.keys() {
                let _ = tx.send(AppEvent {
                    key: name.clone(),
                    event_type: EVENT_HSET.to_string(),
                });
            }
        }
        self.subscribers.lock().unwrap().push(tx);
        Ok(rx)
    }
}

/// Redis-backed store: one read/write connection plus a dedicated pub/sub
/// connection subscribed to keyspace events.
pub struct RedisStore {
    client: redis::Client,
    manager: redis::aio::ConnectionManager,
    address: String,
}

impl RedisStore {
    /// Connect with a 1-second backoff. `attempts == 0` retries forever.
    pub async fn connect(address: &str, port: u16, attempts: u32) -> Result<Self, StoreError> {
        let url = format!("redis://{address}:{port}/");
        let mut tried: u32 = 0;
        let (client, manager) = loop {
            tried += 1;
            match Self::try_connect(&url).await {
                Ok(pair) => break pair,
                Err(err) => {
                    tracing::error!(%url, %err, "failed to connect to configuration store, retrying in 1 second");
                    if attempts != 0 && tried >= attempts {
                        return Err(StoreError::Connect {
                            address: url,
                            cause: err.to_string(),
                        });
                    }
                    tokio::time::sleep(CONNECT_BACKOFF).await;
                }
            }
        };
        let store = Self {
            client,
            manager,
            address: url,
        };
        store.enable_keyspace_events().await;
        Ok(store)
    }

    async fn try_connect(
        url: &str,
    ) -> Result<(redis::Client, redis::aio::ConnectionManager), redis::RedisError> {
        let client = redis::Client::open(url)?;
        let manager = redis::aio::ConnectionManager::new(client.clone()).await?;
        Ok((client, manager))
    }

    /// Keyspace notifications are off by default; turn them on so hash
    /// writes reach the subscriber. Best effort: a locked-down server can
    /// have this preconfigured instead.
    async fn enable_keyspace_events(&self) {
        let mut manager = self.manager.clone();
        let result: Result<(), redis::RedisError> = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("KEA")
            .query_async(&mut manager)
            .await;
        if let Err(err) = result {
            tracing::warn!(%err, "could not enable keyspace notifications; relying on server config");
        }
    }
}

#[async_trait]
impl ApplicationStore for RedisStore {
    async fn get_application(&self, name: &str) -> Result<AppRecord, StoreError> {
        let mut manager = self.manager.clone();
        let map: HashMap<String, String> = manager.hgetall(name).await?;
        if map.is_empty() {
            return Err(StoreError::MissingApplication(name.to_string()));
        }
        AppRecord::from_map(name, map)
    }

    async fn register_application(
        &self,
        name: &str,
        record: &AppRecord,
    ) -> Result<(), StoreError> {
        let mut manager = self.manager.clone();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(name);
        for (field, value) in record.to_pairs() {
            cmd.arg(field).arg(value);
        }
        cmd.query_async::<()>(&mut manager).await?;
        Ok(())
    }

    async fn subscribe_to_application_changes(
        &self,
    ) -> Result<UnboundedReceiver<AppEvent>, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe("__keyspace@0__:*").await?;
        let (tx, rx) = unbounded_channel();
        let address = self.address.clone();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let Some(key) = channel.strip_prefix("__keyspace@0__:") else {
                    continue;
                };
                let event_type: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::warn!(%err, "undecodable keyspace event payload");
                        continue;
                    }
                };
                if tx
                    .send(AppEvent {
                        key: key.to_string(),
                        event_type,
                    })
                    .is_err()
                {
                    break;
                }
            }
            // Dropping `tx` closes the channel; the registrar treats the
            // closed stream as loss of the configuration source of truth.
            tracing::error!(address, "configuration store subscription ended");
        });
        Ok(rx)
    }
}
