//! The event processor: turns evaluations and explicit `track`/`identify`
//! calls into analytics events, deduplicates user bodies through a bounded
//! LRU, summarises feature evaluations into per-flag counters, and flushes
//! batches to the ingestion endpoint with retry.
//!
//! Uses a mutex for event state rather than the store's lock-free
//! `ArcSwap` — the serialise-and-swap step needs a single writer held only
//! long enough to rotate containers, not a copy-on-write namespace.

use crate::config::Config;
use crate::evaluator::{EvalDetail, Reason};
use crate::user::User;
use hyper::client::HttpConnector;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Client, Method, Request};
use hyper_rustls::HttpsConnector;
use lru::LruCache;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

const EVENT_SCHEMA_VERSION: &str = "3";

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Clone, Debug)]
struct Counter {
    count: u64,
    value: Value,
    variation: Option<i64>,
    version: Option<u64>,
    unknown: bool,
}

#[derive(Default)]
struct FlagSummary {
    default: Value,
    default_set: bool,
    counters: HashMap<(Option<i64>, Option<u64>), Counter>,
}

struct State {
    events: Vec<Value>,
    summaries: HashMap<String, FlagSummary>,
    summary_start: i64,
    user_keys: LruCache<String, ()>,
    last_user_key_flush: Instant,
    last_server_time: Option<i64>,
    /// A serialised batch from a failed flush, retried verbatim on the next
    /// tick rather than merged with events accumulated since.
    retained_payload: Option<Vec<u8>>,
}

pub struct EventProcessor {
    config: Config,
    credential: String,
    http: Client<HttpsConnector<HttpConnector>>,
    state: Mutex<State>,
}

impl EventProcessor {
    pub fn new(credential: impl Into<String>, config: Config) -> Self {
        let https = HttpsConnector::with_native_roots();
        let http = Client::builder().build::<_, Body>(https);
        let capacity = NonZeroUsize::new(config.user_keys_capacity.max(1)).unwrap();
        Self {
            credential: credential.into(),
            state: Mutex::new(State {
                events: Vec::new(),
                summaries: HashMap::new(),
                summary_start: now_millis(),
                user_keys: LruCache::new(capacity),
                last_user_key_flush: Instant::now(),
                last_server_time: None,
                retained_payload: None,
            }),
            config,
            http,
        }
    }

    /// Records the `Date:` header seen on the most recent data-source or
    /// event-ingest response, used to decide `debugEventsUntilDate`
    /// eligibility against server rather than local clock skew.
    pub fn note_server_time(&self, millis: i64) {
        self.state.lock().unwrap().last_server_time = Some(millis);
    }

    pub fn identify(&self, user: &User) {
        let mut state = self.state.lock().unwrap();
        let event = json!({
            "kind": "identify",
            "creationDate": now_millis(),
            "key": user.key(),
            "user": user.to_json(&self.config, true),
        });
        self.push_event(&mut state, event);
    }

    pub fn track(&self, user: &User, key: &str, data: Option<Value>, metric_value: Option<f64>) {
        let mut state = self.state.lock().unwrap();
        self.maybe_index(&mut state, user);

        let mut obj = Map::new();
        obj.insert("kind".into(), json!("custom"));
        obj.insert("creationDate".into(), json!(now_millis()));
        obj.insert("key".into(), json!(key));
        self.attach_user(&mut obj, user);
        if let Some(data) = data {
            obj.insert("data".into(), data);
        }
        if let Some(metric) = metric_value {
            obj.insert("metricValue".into(), json!(metric));
        }
        self.push_event(&mut state, Value::Object(obj));
    }

    /// Records one flag evaluation: always updates the summary counters,
    /// and conditionally emits an inline feature event when the flag opted
    /// into `trackEvents` or its `debugEventsUntilDate` window is open.
    #[allow(clippy::too_many_arguments)]
    pub fn feature_request(
        &self,
        flag_key: &str,
        user: &User,
        default: &Value,
        detail: &EvalDetail,
        track_events: bool,
        debug_events_until_date: Option<i64>,
        version: Option<u64>,
        prereq_of: Option<&str>,
    ) {
        let mut state = self.state.lock().unwrap();
        self.summarize(&mut state, flag_key, default, detail, version);

        let now = now_millis();
        let server_now = state.last_server_time.unwrap_or(0).max(now);
        let debug_eligible = debug_events_until_date.is_some_and(|until| until > server_now);

        if !(track_events || debug_eligible) {
            return;
        }

        self.maybe_index(&mut state, user);

        let mut obj = Map::new();
        obj.insert("kind".into(), json!("feature"));
        obj.insert("creationDate".into(), json!(now));
        obj.insert("key".into(), json!(flag_key));
        self.attach_user(&mut obj, user);
        if let Some(index) = detail.variation_index {
            obj.insert("variation".into(), json!(index));
        }
        obj.insert("value".into(), detail.value.clone());
        obj.insert("default".into(), default.clone());
        if let Some(version) = version {
            obj.insert("version".into(), json!(version));
        }
        if let Some(prereq_of) = prereq_of {
            obj.insert("prereqOf".into(), json!(prereq_of));
        }
        obj.insert("trackEvents".into(), json!(track_events));
        if let Some(until) = debug_events_until_date {
            obj.insert("debugEventsUntilDate".into(), json!(until));
        }
        obj.insert("reason".into(), detail.reason.to_json());

        self.push_event(&mut state, Value::Object(obj));
    }

    fn maybe_index(&self, state: &mut State, user: &User) {
        if self.config.inline_users_in_events {
            return;
        }
        if state.last_user_key_flush.elapsed() > self.config.user_keys_flush_interval {
            state.user_keys.clear();
            state.last_user_key_flush = Instant::now();
        }
        if state.user_keys.put(user.key().to_string(), ()).is_none() {
            let event = json!({
                "kind": "index",
                "creationDate": now_millis(),
                "user": user.to_json(&self.config, true),
            });
            self.push_event(state, event);
        }
    }

    fn attach_user(&self, obj: &mut Map<String, Value>, user: &User) {
        if self.config.inline_users_in_events {
            obj.insert("user".into(), user.to_json(&self.config, true));
        } else {
            obj.insert("userKey".into(), json!(user.key()));
        }
    }

    fn push_event(&self, state: &mut State, event: Value) {
        if state.events.len() >= self.config.events_capacity {
            warn!("event queue at capacity, dropping event");
            return;
        }
        state.events.push(event);
    }

    fn summarize(&self, state: &mut State, flag_key: &str, default: &Value, detail: &EvalDetail, version: Option<u64>) {
        let summary = state.summaries.entry(flag_key.to_string()).or_default();
        if !summary.default_set {
            summary.default = default.clone();
            summary.default_set = true;
        }
        let unknown = matches!(detail.reason, Reason::Error { .. });
        let key = (detail.variation_index, version);
        let counter = summary.counters.entry(key).or_insert_with(|| Counter {
            count: 0,
            value: detail.value.clone(),
            variation: detail.variation_index,
            version,
            unknown,
        });
        counter.count += 1;
    }

    /// Returns the next batch to send: a retained payload from a prior
    /// failed flush if there is one, otherwise the current events and
    /// summary counters serialised together, with both containers swapped
    /// for empty ones under the lock before any I/O happens.
    fn prepare_batch(&self, state: &mut State) -> Option<Vec<u8>> {
        if let Some(payload) = state.retained_payload.take() {
            return Some(payload);
        }
        if state.events.is_empty() && state.summaries.is_empty() {
            return None;
        }

        let mut batch = std::mem::take(&mut state.events);
        let summaries = std::mem::take(&mut state.summaries);
        let summary_start = state.summary_start;
        let now = now_millis();
        state.summary_start = now;

        if !summaries.is_empty() {
            let mut features = Map::new();
            for (flag_key, summary) in summaries {
                let mut counters = Vec::new();
                for ((variation, version), counter) in summary.counters {
                    let mut entry = Map::new();
                    entry.insert("count".into(), json!(counter.count));
                    entry.insert("value".into(), counter.value);
                    if let Some(v) = variation {
                        entry.insert("variation".into(), json!(v));
                    }
                    if let Some(v) = version {
                        entry.insert("version".into(), json!(v));
                    }
                    if counter.unknown {
                        entry.insert("unknown".into(), json!(true));
                    }
                    counters.push(Value::Object(entry));
                }
                features.insert(
                    flag_key,
                    json!({ "default": summary.default, "counters": counters }),
                );
            }
            batch.push(json!({
                "kind": "summary",
                "startDate": summary_start,
                "endDate": now,
                "features": Value::Object(features),
            }));
        }

        serde_json::to_vec(&batch).ok()
    }

    /// Sends the next batch, if any. A failed send retains the serialised
    /// payload for the next call; a successful send clears it.
    pub async fn flush(&self) {
        if self.config.offline || !self.config.send_events {
            return;
        }
        let payload = {
            let mut state = self.state.lock().unwrap();
            match self.prepare_batch(&mut state) {
                Some(payload) => payload,
                None => return,
            }
        };

        match self.send(payload.clone()).await {
            Ok(()) => debug!("flushed analytics events"),
            Err(error) => {
                warn!(%error, "event flush failed, retaining payload for retry");
                self.state.lock().unwrap().retained_payload = Some(payload);
            }
        }
    }

    async fn send(&self, payload: Vec<u8>) -> Result<(), FlushError> {
        let uri = format!("{}/bulk", self.config.events_uri);
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .header(
                "X-LaunchDarkly-Event-Schema",
                HeaderValue::from_static(EVENT_SCHEMA_VERSION),
            )
            .header(
                "Authorization",
                HeaderValue::from_str(&self.credential).map_err(|_| FlushError::InvalidCredential)?,
            )
            .body(Body::from(payload))
            .map_err(|_| FlushError::InvalidCredential)?;

        let response = tokio::time::timeout(self.config.timeout, self.http.request(request))
            .await
            .map_err(|_| FlushError::Timeout)?
            .map_err(FlushError::Transport)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(FlushError::Status(response.status().as_u16()))
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum FlushError {
    #[error("invalid credential header")]
    InvalidCredential,
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(hyper::Error),
    #[error("ingestion endpoint returned status {0}")]
    Status(u16),
}

/// Parses an RFC822 `Date:` header (e.g. `"Fri, 29 Mar 2019 17:55:35 GMT"`)
/// into epoch milliseconds, for `lastServerTime`.
pub fn parse_server_date(value: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::ErrorKind;
    use std::time::Duration;

    fn detail(value: Value, variation: Option<i64>) -> EvalDetail {
        EvalDetail {
            value,
            variation_index: variation,
            reason: Reason::Fallthrough { in_experiment: false },
        }
    }

    #[test]
    fn rfc822_date_parses_to_documented_range() {
        let millis = parse_server_date("Fri, 29 Mar 2019 17:55:35 GMT").unwrap();
        assert!((1_553_880_000_000..1_553_911_000_000).contains(&millis));
    }

    #[test]
    fn summary_counts_feature_requests_by_variation_and_version() {
        let processor = EventProcessor::new("token", Config::default());
        let mut state = processor.state.lock().unwrap();
        processor.summarize(&mut state, "key1", &json!(null), &detail(json!("a"), Some(1)), Some(11));
        processor.summarize(&mut state, "key1", &json!(null), &detail(json!("a"), Some(1)), Some(11));
        processor.summarize(&mut state, "key1", &json!(null), &detail(json!("b"), Some(2)), Some(11));
        let summary = &state.summaries["key1"];
        assert_eq!(summary.counters[&(Some(1), Some(11))].count, 2);
        assert_eq!(summary.counters[&(Some(2), Some(11))].count, 1);
    }

    #[test]
    fn error_reason_marks_counter_unknown() {
        let processor = EventProcessor::new("token", Config::default());
        let mut state = processor.state.lock().unwrap();
        let errored = EvalDetail {
            value: json!(null),
            variation_index: None,
            reason: Reason::Error { kind: ErrorKind::UserNotSpecified },
        };
        processor.summarize(&mut state, "key1", &json!(null), &errored, None);
        assert!(state.summaries["key1"].counters[&(None, None)].unknown);
    }

    #[test]
    fn index_event_emitted_once_per_flush_window() {
        let mut config = Config::default();
        config.user_keys_flush_interval = Duration::from_secs(300);
        let processor = EventProcessor::new("token", config);
        let user = User::new("u");
        {
            let mut state = processor.state.lock().unwrap();
            processor.maybe_index(&mut state, &user);
            processor.maybe_index(&mut state, &user);
        }
        let state = processor.state.lock().unwrap();
        let index_events = state.events.iter().filter(|e| e["kind"] == "index").count();
        assert_eq!(index_events, 1);
    }

    #[test]
    fn events_capacity_drops_overflow() {
        let mut config = Config::default();
        config.events_capacity = 1;
        let processor = EventProcessor::new("token", config);
        let user = User::new("u");
        processor.identify(&user);
        processor.identify(&user);
        let state = processor.state.lock().unwrap();
        assert_eq!(state.events.len(), 1);
    }

    #[test]
    fn feature_event_carries_the_reason_that_produced_it() {
        let processor = EventProcessor::new("token", Config::default());
        let user = User::new("u");
        let detail = EvalDetail {
            value: json!("b"),
            variation_index: Some(1),
            reason: Reason::Fallthrough { in_experiment: false },
        };
        processor.feature_request("flag", &user, &json!("a"), &detail, true, None, Some(3), None);

        let state = processor.state.lock().unwrap();
        let event = state.events.iter().find(|e| e["kind"] == "feature").unwrap();
        assert_eq!(event["reason"], json!({ "kind": "FALLTHROUGH", "inExperiment": false }));
    }

    #[test]
    fn prepare_batch_retries_same_payload_on_prior_failure() {
        let processor = EventProcessor::new("token", Config::default());
        let mut state = processor.state.lock().unwrap();
        state.retained_payload = Some(b"retained".to_vec());
        state.events.push(json!({"kind": "identify"}));
        let batch = processor.prepare_batch(&mut state).unwrap();
        assert_eq!(batch, b"retained");
        // the new event is untouched, waiting for the batch after this one
        assert_eq!(state.events.len(), 1);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// However many distinct users get indexed, the dedup cache
            /// never grows past the capacity it was configured with.
            #[test]
            fn user_key_dedup_cache_never_exceeds_its_capacity(
                capacity in 1usize..20,
                keys in prop::collection::vec("[a-z]{1,8}", 0..200),
            ) {
                let mut config = Config::default();
                config.user_keys_capacity = capacity;
                config.user_keys_flush_interval = Duration::from_secs(3600);
                let processor = EventProcessor::new("token", config);

                for key in &keys {
                    let user = User::new(key.clone());
                    let mut state = processor.state.lock().unwrap();
                    processor.maybe_index(&mut state, &user);
                }

                let state = processor.state.lock().unwrap();
                prop_assert!(state.user_keys.len() <= capacity);
            }
        }
    }
}
