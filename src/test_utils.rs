//! Test-only builders and a mock [`Store`] shared by unit tests across the
//! crate. Mirrors the shape of the flag/segment JSON the management service
//! actually sends, rather than constructing `Flag`/`Segment` literals by
//! hand in every test.

use crate::models::{
    AllData, Clause, Flag, Prerequisite, Rollout, RolloutKind, Rule, Segment, Target,
    VariationOrRollout, WeightedVariation,
};
use crate::store::{MemoryStore, Store};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Wraps a [`MemoryStore`], pre-initialised to an empty (but "ready") data
/// set so tests can add flags/segments one at a time without a separate
/// `init` call.
pub struct MockStore {
    inner: MemoryStore,
}

impl MockStore {
    pub fn new() -> Self {
        let inner = MemoryStore::new();
        inner.init(AllData::default());
        Self { inner }
    }

    pub fn add_flag(&self, flag: Flag) {
        self.inner.upsert_flag(flag);
    }

    pub fn add_segment(&self, segment: Segment) {
        self.inner.upsert_segment(segment);
    }
}

impl Store for MockStore {
    fn get_flag(&self, key: &str) -> Option<Arc<Flag>> {
        self.inner.get_flag(key)
    }

    fn get_segment(&self, key: &str) -> Option<Arc<Segment>> {
        self.inner.get_segment(key)
    }

    fn all_flags(&self) -> HashMap<String, Arc<Flag>> {
        self.inner.all_flags()
    }

    fn all_segments(&self) -> HashMap<String, Arc<Segment>> {
        self.inner.all_segments()
    }

    fn init(&self, data: AllData) {
        self.inner.init(data)
    }

    fn upsert_flag(&self, flag: Flag) {
        self.inner.upsert_flag(flag)
    }

    fn upsert_segment(&self, segment: Segment) {
        self.inner.upsert_segment(segment)
    }

    fn remove_flag(&self, key: &str, version: u64) {
        self.inner.remove_flag(key, version)
    }

    fn remove_segment(&self, key: &str, version: u64) {
        self.inner.remove_segment(key, version)
    }

    fn initialized(&self) -> bool {
        self.inner.initialized()
    }
}

/// Builds a [`Flag`] one concern at a time. Unlike the real wire schema,
/// nothing here is optional by accident — every field a test cares about
/// must be set explicitly.
pub struct FlagBuilder(Flag);

impl FlagBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self(Flag {
            key: key.into(),
            version: 1,
            salt: "test-salt".into(),
            ..Default::default()
        })
    }

    pub fn on(mut self) -> Self {
        self.0.on = true;
        self
    }

    pub fn off(mut self) -> Self {
        self.0.on = false;
        self
    }

    pub fn off_variation(mut self, variation: i64) -> Self {
        self.0.off_variation = Some(variation);
        self
    }

    pub fn variations(mut self, variations: Vec<Value>) -> Self {
        self.0.variations = variations;
        self
    }

    pub fn fallthrough_variation(mut self, variation: i64) -> Self {
        self.0.fallthrough = VariationOrRollout {
            variation: Some(variation),
            rollout: None,
        };
        self
    }

    /// `weights` as `(variation, weight)` pairs, weight out of 100_000.
    pub fn fallthrough_rollout(mut self, weights: Vec<(i64, i64)>) -> Self {
        self.0.fallthrough = VariationOrRollout {
            variation: None,
            rollout: Some(Rollout {
                kind: RolloutKind::Rollout,
                seed: None,
                bucket_by: None,
                variations: weights
                    .into_iter()
                    .map(|(variation, weight)| WeightedVariation {
                        variation,
                        weight,
                        untracked: false,
                    })
                    .collect(),
            }),
        };
        self
    }

    /// `weights` as `(variation, weight, untracked)` triples, an
    /// experiment-kind rollout.
    pub fn fallthrough_experiment(mut self, weights: Vec<(i64, i64, bool)>) -> Self {
        self.0.fallthrough = VariationOrRollout {
            variation: None,
            rollout: Some(Rollout {
                kind: RolloutKind::Experiment,
                seed: None,
                bucket_by: None,
                variations: weights
                    .into_iter()
                    .map(|(variation, weight, untracked)| WeightedVariation {
                        variation,
                        weight,
                        untracked,
                    })
                    .collect(),
            }),
        };
        self
    }

    pub fn add_target(mut self, variation: i64, values: Vec<String>) -> Self {
        self.0.targets.push(Target { values, variation });
        self
    }

    fn push_rule(&mut self, clause: Clause, variation: i64) {
        let index = self.0.rules.len();
        self.0.rules.push(Rule {
            id: format!("rule-{index}"),
            clauses: vec![clause],
            variation_or_rollout: VariationOrRollout {
                variation: Some(variation),
                rollout: None,
            },
            track_events: false,
        });
    }

    /// Adds a rule with a single `in` clause over `values`, matching
    /// variation `1` (the common "second variation wins" test shape).
    pub fn add_rule_matching_all(mut self, attribute: impl Into<String>, values: Vec<Value>) -> Self {
        let clause = Clause {
            attribute: attribute.into(),
            op: "in".into(),
            values,
            negate: false,
        };
        self.push_rule(clause, 1);
        self
    }

    pub fn add_rule_negated(
        mut self,
        attribute: impl Into<String>,
        op: impl Into<String>,
        values: Vec<Value>,
        variation: i64,
    ) -> Self {
        let clause = Clause {
            attribute: attribute.into(),
            op: op.into(),
            values,
            negate: true,
        };
        self.push_rule(clause, variation);
        self
    }

    pub fn add_rule_segment_match(mut self, segment_key: impl Into<String>, variation: i64) -> Self {
        let clause = Clause {
            attribute: String::new(),
            op: "segmentMatch".into(),
            values: vec![Value::String(segment_key.into())],
            negate: false,
        };
        self.push_rule(clause, variation);
        self
    }

    pub fn add_prerequisite(mut self, key: impl Into<String>, variation: i64) -> Self {
        self.0.prerequisites.push(Prerequisite {
            key: key.into(),
            variation,
        });
        self
    }

    pub fn build(self) -> Flag {
        self.0
    }
}

/// Builds a [`Segment`].
pub struct SegmentBuilder(Segment);

impl SegmentBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self(Segment {
            key: key.into(),
            version: 1,
            salt: "test-salt".into(),
            ..Default::default()
        })
    }

    pub fn included(mut self, keys: Vec<String>) -> Self {
        self.0.included = keys;
        self
    }

    pub fn excluded(mut self, keys: Vec<String>) -> Self {
        self.0.excluded = keys;
        self
    }

    pub fn build(self) -> Segment {
        self.0
    }
}
