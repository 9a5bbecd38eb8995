//! Flag evaluation: the off / prerequisites / targets / rules / fallthrough
//! walk, plus the segment matching and typed clause operator dispatch it
//! depends on.
//!
//! `evaluate` never returns `Err` — an unevaluable flag still produces an
//! [`EvalDetail`] carrying the caller's default value and an
//! [`ErrorKind`], the same "detail always comes back" contract the typed
//! `*_variation_detail` client methods expose.

use crate::bucketing;
use crate::models::{Clause, Flag, Rule, Segment, SegmentRule, VariationOrRollout};
use crate::operators;
use crate::store::Store;
use crate::user::User;
use serde_json::{json, Value};
use tracing::warn;

/// Matches the other SDKs' recursion guard: a prerequisite chain this deep
/// is almost certainly a cycle in misconfigured flag data, not a real
/// dependency graph.
const MAX_PREREQUISITE_DEPTH: u32 = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The store has not completed initialization yet.
    ClientNotReady,
    FlagNotFound,
    /// The flag (or a segment/prerequisite it depends on) failed schema
    /// validation, or a rollout's weights never covered the full range.
    MalformedFlag,
    UserNotSpecified,
    /// The flag evaluated, but its variation's JSON type doesn't match the
    /// typed accessor the caller used.
    WrongType,
}

impl ErrorKind {
    fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ClientNotReady => "CLIENT_NOT_READY",
            ErrorKind::FlagNotFound => "FLAG_NOT_FOUND",
            ErrorKind::MalformedFlag => "MALFORMED_FLAG",
            ErrorKind::UserNotSpecified => "USER_NOT_SPECIFIED",
            ErrorKind::WrongType => "WRONG_TYPE",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Reason {
    Off,
    TargetMatch,
    RuleMatch {
        rule_index: usize,
        rule_id: Option<String>,
        in_experiment: bool,
    },
    PrerequisiteFailed {
        prerequisite_key: String,
    },
    Fallthrough {
        in_experiment: bool,
    },
    Error {
        kind: ErrorKind,
    },
}

impl Reason {
    /// The JSON shape carried on a feature event's `reason` field.
    pub fn to_json(&self) -> Value {
        match self {
            Reason::Off => json!({ "kind": "OFF" }),
            Reason::TargetMatch => json!({ "kind": "TARGET_MATCH" }),
            Reason::RuleMatch { rule_index, rule_id, in_experiment } => json!({
                "kind": "RULE_MATCH",
                "ruleIndex": rule_index,
                "ruleId": rule_id,
                "inExperiment": in_experiment,
            }),
            Reason::PrerequisiteFailed { prerequisite_key } => json!({
                "kind": "PREREQUISITE_FAILED",
                "prerequisiteKey": prerequisite_key,
            }),
            Reason::Fallthrough { in_experiment } => json!({
                "kind": "FALLTHROUGH",
                "inExperiment": in_experiment,
            }),
            Reason::Error { kind } => json!({
                "kind": "ERROR",
                "errorKind": kind.as_str(),
            }),
        }
    }
}

/// The full result of evaluating one flag for one user: the resolved value,
/// which variation produced it (if any), and why.
#[derive(Clone, Debug, PartialEq)]
pub struct EvalDetail {
    pub value: Value,
    pub variation_index: Option<i64>,
    pub reason: Reason,
}

impl EvalDetail {
    fn error(kind: ErrorKind, default: Value) -> Self {
        Self {
            value: default,
            variation_index: None,
            reason: Reason::Error { kind },
        }
    }
}

/// The result of a typed `*_variation_detail` client call: the same shape
/// as [`EvalDetail`], but with `value` narrowed to the caller's requested
/// type instead of raw JSON.
#[derive(Clone, Debug, PartialEq)]
pub struct VariationDetail<T> {
    pub value: T,
    pub variation_index: Option<i64>,
    pub reason: Reason,
}

impl<T> VariationDetail<T> {
    pub fn wrap(value: T, detail: EvalDetail) -> Self {
        Self {
            value,
            variation_index: detail.variation_index,
            reason: detail.reason,
        }
    }

    /// The flag resolved to a value of the wrong JSON type for this typed
    /// accessor — reported the same as any other evaluation error.
    pub fn wrong_type(default: T) -> Self {
        Self {
            value: default,
            variation_index: None,
            reason: Reason::Error { kind: ErrorKind::WrongType },
        }
    }
}

/// A prerequisite evaluated while resolving a top-level flag. The event
/// processor turns each of these into its own feature-request event
/// alongside the main result.
#[derive(Clone, Debug)]
pub struct PrerequisiteEvaluation {
    pub flag_key: String,
    pub detail: EvalDetail,
}

/// Evaluates `flag` for `user`, returning both the top-level result and any
/// prerequisite evaluations performed along the way.
pub fn evaluate<S: Store>(
    store: &S,
    flag: &Flag,
    user: &User,
    default: Value,
) -> (EvalDetail, Vec<PrerequisiteEvaluation>) {
    if user.key().is_empty() {
        warn!(flag = %flag.key, "evaluating with an empty user key");
        return (EvalDetail::error(ErrorKind::UserNotSpecified, default), Vec::new());
    }
    let mut prereq_events = Vec::new();
    let detail = eval_flag(store, flag, user, default, &mut prereq_events, 0);
    (detail, prereq_events)
}

enum PrereqOutcome {
    Failed(String),
    Malformed,
}

fn eval_flag<S: Store>(
    store: &S,
    flag: &Flag,
    user: &User,
    default: Value,
    prereq_events: &mut Vec<PrerequisiteEvaluation>,
    depth: u32,
) -> EvalDetail {
    if !flag.on {
        return variation_for(flag, flag.off_variation, Reason::Off, default);
    }

    if depth >= MAX_PREREQUISITE_DEPTH {
        return EvalDetail::error(ErrorKind::MalformedFlag, default);
    }

    if let Err(outcome) = check_prerequisites(store, flag, user, prereq_events, depth) {
        return match outcome {
            PrereqOutcome::Failed(prerequisite_key) => variation_for(
                flag,
                flag.off_variation,
                Reason::PrerequisiteFailed { prerequisite_key },
                default,
            ),
            PrereqOutcome::Malformed => EvalDetail::error(ErrorKind::MalformedFlag, default),
        };
    }

    for target in &flag.targets {
        if target.values.iter().any(|value| value == user.key()) {
            return variation_for(flag, Some(target.variation), Reason::TargetMatch, default);
        }
    }

    for (index, rule) in flag.rules.iter().enumerate() {
        match rule_matches(store, rule, user) {
            Ok(true) => {
                return match resolve_variation_or_rollout(&rule.variation_or_rollout, user, &flag.key, &flag.salt)
                {
                    Some((variation, in_experiment)) => variation_for(
                        flag,
                        Some(variation),
                        Reason::RuleMatch {
                            rule_index: index,
                            rule_id: Some(rule.id.clone()),
                            in_experiment,
                        },
                        default,
                    ),
                    None => EvalDetail::error(ErrorKind::MalformedFlag, default),
                };
            }
            Ok(false) => continue,
            Err(()) => return EvalDetail::error(ErrorKind::MalformedFlag, default),
        }
    }

    match resolve_variation_or_rollout(&flag.fallthrough, user, &flag.key, &flag.salt) {
        Some((variation, in_experiment)) => {
            variation_for(flag, Some(variation), Reason::Fallthrough { in_experiment }, default)
        }
        None => EvalDetail::error(ErrorKind::MalformedFlag, default),
    }
}

fn variation_for(flag: &Flag, index: Option<i64>, reason: Reason, default: Value) -> EvalDetail {
    let Some(index) = index else {
        return EvalDetail {
            value: default,
            variation_index: None,
            reason,
        };
    };
    match flag.variations.get(index as usize) {
        Some(value) => EvalDetail {
            value: value.clone(),
            variation_index: Some(index),
            reason,
        },
        None => EvalDetail::error(ErrorKind::MalformedFlag, default),
    }
}

/// Walks `flag.prerequisites` in order, recursively evaluating each one.
/// Returns the first failure; a missing prerequisite flag in the store, a
/// prerequisite that is off, or one that resolves to the wrong variation
/// are all reported as `Failed(key)` — only schema-shaped problems are
/// `Malformed`.
fn check_prerequisites<S: Store>(
    store: &S,
    flag: &Flag,
    user: &User,
    prereq_events: &mut Vec<PrerequisiteEvaluation>,
    depth: u32,
) -> Result<(), PrereqOutcome> {
    for prereq in &flag.prerequisites {
        let Some(preflag) = store.get_flag(&prereq.key) else {
            return Err(PrereqOutcome::Failed(prereq.key.clone()));
        };

        let default = Value::Null;
        let detail = eval_flag(store, &preflag, user, default, prereq_events, depth + 1);
        let matched = preflag.on && detail.variation_index == Some(prereq.variation);

        prereq_events.push(PrerequisiteEvaluation {
            flag_key: prereq.key.clone(),
            detail: detail.clone(),
        });

        if matches!(detail.reason, Reason::Error { kind: ErrorKind::MalformedFlag }) {
            return Err(PrereqOutcome::Malformed);
        }

        if !matched {
            return Err(PrereqOutcome::Failed(prereq.key.clone()));
        }
    }
    Ok(())
}

/// A rule matches when every one of its clauses matches (logical AND).
fn rule_matches<S: Store>(store: &S, rule: &Rule, user: &User) -> Result<bool, ()> {
    for clause in &rule.clauses {
        if !clause_matches(store, clause, user)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Dispatches `segmentMatch` clauses into segment lookup/matching; every
/// other operator goes through [`clause_matches_no_segments`].
fn clause_matches<S: Store>(store: &S, clause: &Clause, user: &User) -> Result<bool, ()> {
    if clause.op != "segmentMatch" {
        return clause_matches_no_segments(clause, user);
    }

    for value in &clause.values {
        let Some(key) = value.as_str() else { continue };
        let Some(segment) = store.get_segment(key) else {
            warn!(segment = key, "segment referenced by clause not found in store");
            continue;
        };
        if segment_matches(&segment, user)? {
            return Ok(apply_negate(clause.negate, true));
        }
    }
    Ok(apply_negate(clause.negate, false))
}

/// Clause matching against the user's own attributes, with no segment
/// dispatch. A missing attribute, or an operator this registry doesn't
/// know, is a miss that bypasses `negate` entirely — negating "I couldn't
/// evaluate this" would turn an inapplicable clause into a false match.
fn clause_matches_no_segments(clause: &Clause, user: &User) -> Result<bool, ()> {
    if !operators::is_known(&clause.op) {
        return Ok(false);
    }

    let Some(attribute_value) = user.value_of(&clause.attribute) else {
        return Ok(false);
    };

    let matched = match &attribute_value {
        Value::Array(items) => {
            let mut any = false;
            for item in items {
                if matches!(item, Value::Object(_) | Value::Array(_)) {
                    return Err(());
                }
                if clause
                    .values
                    .iter()
                    .any(|clause_value| operators::matches(&clause.op, item, clause_value))
                {
                    any = true;
                    break;
                }
            }
            any
        }
        other => clause
            .values
            .iter()
            .any(|clause_value| operators::matches(&clause.op, other, clause_value)),
    };

    Ok(apply_negate(clause.negate, matched))
}

fn apply_negate(negate: bool, matched: bool) -> bool {
    if negate {
        !matched
    } else {
        matched
    }
}

/// A user is in a segment if explicitly `included`, not explicitly
/// `excluded` (checked after inclusion, so inclusion wins), or matched by
/// one of its weighted rules.
fn segment_matches(segment: &Segment, user: &User) -> Result<bool, ()> {
    if segment.included.iter().any(|key| key == user.key()) {
        return Ok(true);
    }
    if segment.excluded.iter().any(|key| key == user.key()) {
        return Ok(false);
    }
    for rule in &segment.rules {
        if segment_rule_matches(rule, &segment.key, user, &segment.salt)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// A segment rule matches when every clause matches (no segment dispatch —
/// segments can't reference other segments) and, if the rule carries a
/// `weight`, the user's bucket falls under it.
fn segment_rule_matches(rule: &SegmentRule, segment_key: &str, user: &User, salt: &str) -> Result<bool, ()> {
    for clause in &rule.clauses {
        if !clause_matches_no_segments(clause, user)? {
            return Ok(false);
        }
    }

    let Some(weight) = rule.weight else {
        return Ok(true);
    };

    let attribute = rule.bucket_by.as_deref().unwrap_or(bucketing::DEFAULT_BUCKET_ATTRIBUTE);
    let bucket = bucketing::bucket(user, segment_key, attribute, salt, None).unwrap_or(0.0);
    Ok(bucket < weight as f64 / 100_000.0)
}

/// Resolves a fixed `variation` or a weighted [`crate::models::Rollout`] to
/// a concrete variation index, returning whether the rollout is an
/// in-progress experiment (for event reporting).
///
/// If the user's bucket value lands past the end of the last weighted
/// bucket — rounding error, or weights that don't sum to 100% in the
/// source data — the user falls into the last bucket rather than failing
/// evaluation, matching every other SDK's rollout resolution.
fn resolve_variation_or_rollout(
    var_or_rollout: &VariationOrRollout,
    user: &User,
    flag_key: &str,
    salt: &str,
) -> Option<(i64, bool)> {
    if let Some(variation) = var_or_rollout.variation {
        return Some((variation, false));
    }

    let rollout = var_or_rollout.rollout.as_ref()?;
    if rollout.variations.is_empty() {
        return None;
    }

    let mut in_experiment = rollout.kind == crate::models::RolloutKind::Experiment;
    let attribute = rollout.bucket_by.as_deref().unwrap_or(bucketing::DEFAULT_BUCKET_ATTRIBUTE);
    let bucket = bucketing::bucket(user, flag_key, attribute, salt, rollout.seed).unwrap_or(0.0);

    let mut sum = 0.0;
    let mut last = &rollout.variations[0];
    for weighted in &rollout.variations {
        sum += weighted.weight as f64 / 100_000.0;
        last = weighted;
        if bucket < sum {
            if in_experiment && weighted.untracked {
                in_experiment = false;
            }
            return Some((weighted.variation, in_experiment));
        }
    }

    if in_experiment && last.untracked {
        in_experiment = false;
    }
    Some((last.variation, in_experiment))
}
