//! Typed representations of the flag/segment rule tree delivered by the
//! management service. These mirror the wire schema directly; evaluation
//! semantics live in [`crate::evaluator`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Either a fixed `variation` index or a weighted [`Rollout`].
///
/// Used for both `fallthrough` and each `Rule`'s resolution.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct VariationOrRollout {
    pub variation: Option<i64>,
    pub rollout: Option<Rollout>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RolloutKind {
    Rollout,
    Experiment,
}

impl Default for RolloutKind {
    fn default() -> Self {
        RolloutKind::Rollout
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Rollout {
    #[serde(default)]
    pub kind: RolloutKind,
    pub seed: Option<i64>,
    #[serde(rename = "bucketBy")]
    pub bucket_by: Option<String>,
    pub variations: Vec<WeightedVariation>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct WeightedVariation {
    pub variation: i64,
    pub weight: i64,
    #[serde(default)]
    pub untracked: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Target {
    pub values: Vec<String>,
    pub variation: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Prerequisite {
    pub key: String,
    pub variation: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Clause {
    pub attribute: String,
    pub op: String,
    pub values: Vec<Value>,
    #[serde(default)]
    pub negate: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    pub id: String,
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(flatten)]
    pub variation_or_rollout: VariationOrRollout,
    #[serde(rename = "trackEvents", default)]
    pub track_events: bool,
}

/// A feature flag as delivered by `put`/`patch` payloads.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Flag {
    pub key: String,
    pub version: u64,
    pub on: bool,
    pub variations: Vec<Value>,
    #[serde(rename = "offVariation")]
    pub off_variation: Option<i64>,
    pub fallthrough: VariationOrRollout,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    #[serde(default)]
    pub salt: String,
    #[serde(rename = "trackEvents", default)]
    pub track_events: bool,
    #[serde(rename = "debugEventsUntilDate")]
    pub debug_events_until_date: Option<i64>,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SegmentRule {
    #[serde(default)]
    pub clauses: Vec<Clause>,
    pub weight: Option<i64>,
    #[serde(rename = "bucketBy")]
    pub bucket_by: Option<String>,
}

/// A named cohort referenced by `segmentMatch` clauses.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Segment {
    pub key: String,
    pub version: u64,
    #[serde(default)]
    pub included: Vec<String>,
    #[serde(default)]
    pub excluded: Vec<String>,
    #[serde(default)]
    pub rules: Vec<SegmentRule>,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub deleted: bool,
}

/// The kind of record a store namespace/path segment refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Flag,
    Segment,
}

/// Full snapshot payload delivered by `put` events and polling responses.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AllData {
    #[serde(default)]
    pub flags: HashMap<String, Flag>,
    #[serde(default)]
    pub segments: HashMap<String, Segment>,
}
