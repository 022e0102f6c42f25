// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Selection policies and the shared policy state table.
//!
//! Policy state is an opaque serialized value keyed by
//! `(application, user, model version)`. The processor reads it to pick a
//! target model and to know the default output used on a deadline miss.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::protocols::{Feedback, VersionedModelId};

/// Name of the only policy the core requires.
pub const DEFAULT_OUTPUT_POLICY: &str = "default_output";

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("no candidate models to select from")]
    NoCandidateModels,

    #[error("malformed policy state: {0}")]
    MalformedState(String),
}

/// Key into the state table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
    pub app: String,
    pub user: String,
    pub version: u32,
}

impl StateKey {
    pub fn new(app: impl Into<String>, user: impl Into<String>, version: u32) -> Self {
        Self {
            app: app.into(),
            user: user.into(),
            version,
        }
    }
}

/// Concurrent map from [`StateKey`] to serialized policy state. Gets are
/// lock-free; puts are last-writer-wins; `apply` holds the key's shard
/// entry for read-modify-write atomicity.
#[derive(Default)]
pub struct StateTable {
    entries: DashMap<StateKey, String>,
}

impl StateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &StateKey) -> Option<String> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn put(&self, key: StateKey, state: String) {
        self.entries.insert(key, state);
    }

    pub fn contains(&self, key: &StateKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Read-modify-write under per-key atomicity. Returns `false` without
    /// invoking `f` when the key has no state.
    pub fn apply<F>(&self, key: &StateKey, f: F) -> Result<bool, PolicyError>
    where
        F: FnOnce(&str) -> Result<String, PolicyError>,
    {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                let next = f(entry.value())?;
                *entry.value_mut() = next;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What the processor needs from a policy for one query: the model to
/// dispatch to and the output to fall back on when the deadline fires.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDecision {
    pub model: VersionedModelId,
    pub default_output: f64,
}

/// Contract between the processor and a selection policy. State flows
/// through serialized so the table stays policy-agnostic.
pub trait SelectionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fresh state for a newly registered application.
    fn init_state(&self, default_output: f64) -> String;

    fn select(
        &self,
        state: &str,
        candidates: &[VersionedModelId],
    ) -> Result<PolicyDecision, PolicyError>;

    /// Fold one feedback observation into the state.
    fn on_feedback(&self, state: &str, feedback: &Feedback) -> Result<String, PolicyError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct DefaultOutputState {
    default_output: f64,
}

/// Policy whose state is solely the configured default output and whose
/// selection is "first candidate".
pub struct DefaultOutputSelectionPolicy;

impl DefaultOutputSelectionPolicy {
    fn parse_state(state: &str) -> Result<DefaultOutputState, PolicyError> {
        serde_json::from_str(state).map_err(|err| PolicyError::MalformedState(err.to_string()))
    }
}

impl SelectionPolicy for DefaultOutputSelectionPolicy {
    fn name(&self) -> &'static str {
        DEFAULT_OUTPUT_POLICY
    }

    fn init_state(&self, default_output: f64) -> String {
        serde_json::to_string(&DefaultOutputState { default_output })
            .expect("default output state serializes")
    }

    fn select(
        &self,
        state: &str,
        candidates: &[VersionedModelId],
    ) -> Result<PolicyDecision, PolicyError> {
        let state = Self::parse_state(state)?;
        let model = candidates
            .first()
            .cloned()
            .ok_or(PolicyError::NoCandidateModels)?;
        Ok(PolicyDecision {
            model,
            default_output: state.default_output,
        })
    }

    fn on_feedback(&self, state: &str, _feedback: &Feedback) -> Result<String, PolicyError> {
        // Feedback does not move the default output; validate and keep.
        Self::parse_state(state)?;
        Ok(state.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::Input;

    #[test]
    fn default_output_policy_picks_first_candidate() {
        let policy = DefaultOutputSelectionPolicy;
        let state = policy.init_state(7.0);
        let candidates = vec![
            VersionedModelId::new("resnet", 1),
            VersionedModelId::new("vgg", 2),
        ];
        let decision = policy.select(&state, &candidates).unwrap();
        assert_eq!(decision.model, VersionedModelId::new("resnet", 1));
        assert_eq!(decision.default_output, 7.0);
    }

    #[test]
    fn select_with_no_candidates_fails() {
        let policy = DefaultOutputSelectionPolicy;
        let state = policy.init_state(0.0);
        assert!(matches!(
            policy.select(&state, &[]),
            Err(PolicyError::NoCandidateModels)
        ));
    }

    #[test]
    fn feedback_leaves_state_unchanged() {
        let policy = DefaultOutputSelectionPolicy;
        let state = policy.init_state(3.5);
        let feedback = Feedback {
            input: Input::Doubles(vec![1.0]),
            label: 9.0,
        };
        let next = policy.on_feedback(&state, &feedback).unwrap();
        let decision = policy
            .select(&next, &[VersionedModelId::new("m", 1)])
            .unwrap();
        assert_eq!(decision.default_output, 3.5);
    }

    #[test]
    fn state_table_apply_is_per_key() {
        let table = StateTable::new();
        let key = StateKey::new("alpha", "0", 0);
        assert_eq!(table.apply(&key, |_| Ok("x".to_string())).unwrap(), false);

        table.put(key.clone(), "1".to_string());
        let updated = table
            .apply(&key, |old| Ok(format!("{old}1")))
            .unwrap();
        assert!(updated);
        assert_eq!(table.get(&key).unwrap(), "11");
    }

    #[test]
    fn malformed_state_is_reported() {
        let policy = DefaultOutputSelectionPolicy;
        assert!(matches!(
            policy.select("not json", &[VersionedModelId::new("m", 1)]),
            Err(PolicyError::MalformedState(_))
        ));
    }
}
