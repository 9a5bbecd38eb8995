//! A feature-flag evaluation client: background-synced flag/segment store,
//! rule-tree evaluator, and analytics event pipeline, wired together behind
//! a single [`Client`].

use crate::config::Config;
use crate::consumer::{Consumer, ReadError, ReaderHandle};
use crate::evaluator::{ErrorKind, Reason};
use crate::events::EventProcessor;
use crate::message::Message;
use crate::models::Flag;
use crate::source::{PollError, PollingSource, Source, SseSource, StreamError};
use crate::store::{MemoryStore, Store};
use crate::user::User;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time;

pub mod bucketing;
pub mod config;
pub mod consumer;
pub mod evaluator;
pub mod events;
pub mod message;
pub mod models;
pub mod operators;
pub mod source;
pub mod store;
pub mod user;
#[cfg(test)]
mod test_utils;

pub use evaluator::{Reason as EvalReason, VariationDetail};

#[derive(Debug, thiserror::Error)]
pub enum StartError<CE>
where
    CE: fmt::Debug + Clone + StdError + 'static,
{
    #[error("already started, can't start reading twice")]
    AlreadyStarted,

    #[error("failed to start reading from the data source: {0}")]
    Start(#[from] ReadError<CE>),
}

#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error("SDK credential must not be empty")]
    EmptyCredential,
}

/// A combined streaming/polling source, chosen per [`Config::stream`] at
/// construction time; `Client` is generic over neither so callers don't have
/// to name either source type.
#[derive(Debug, thiserror::Error)]
pub enum AnySourceError {
    #[error(transparent)]
    Stream(#[from] StreamError<eventsource_client::Error>),
    #[error(transparent)]
    Poll(#[from] PollError),
}

pub enum AnySource {
    Sse(SseSource),
    Polling(PollingSource),
}

impl Source for AnySource {
    type Error = AnySourceError;
    type Stream = Pin<Box<dyn Stream<Item = Result<Message, AnySourceError>> + Send>>;

    fn stream(&self) -> Self::Stream {
        match self {
            AnySource::Sse(source) => {
                Box::pin(source.stream().map(|result| result.map_err(AnySourceError::from)))
            }
            AnySource::Polling(source) => {
                Box::pin(source.stream().map(|result| result.map_err(AnySourceError::from)))
            }
        }
    }
}

/// The feature-flag client: owns the store, the (optional) background data
/// source, and the (optional) analytics event processor.
pub struct Client {
    store: Arc<MemoryStore>,
    events: Option<Arc<EventProcessor>>,
    source: Option<AnySource>,
    /// Whether this client has a source to read at all (false in offline or
    /// `use_ldd` mode) — distinguishes "nothing to start" from "already
    /// started" in [`Client::start`].
    needs_source: bool,
    config: Config,
    reader: Option<ReaderHandle>,
    flush_task: Option<JoinHandle<()>>,
    /// Set by [`Client::close`]; `reader`/`flush_task` being `None` already
    /// tells this `Client` it's closed, so this exists for future code that
    /// needs the flag without a `&mut self`.
    #[allow(dead_code)]
    shutting_down: AtomicBool,
}

impl Client {
    /// Validates the credential and wires up the store, data source, and
    /// event processor per `config`. Call [`Client::start`] afterwards to
    /// begin reading flag data in the background.
    pub fn new(credential: impl Into<String>, config: Config) -> Result<Self, CreateError> {
        let credential = credential.into();
        if credential.is_empty() {
            return Err(CreateError::EmptyCredential);
        }

        let store = Arc::new(MemoryStore::new());

        let events = if config.send_events && !config.offline {
            Some(Arc::new(EventProcessor::new(credential.clone(), config.clone())))
        } else {
            None
        };

        let needs_source = !config.offline && !config.use_ldd;
        let source = if !needs_source {
            None
        } else if config.stream {
            Some(AnySource::Sse(SseSource::new(&config.stream_uri, &credential)))
        } else {
            Some(AnySource::Polling(PollingSource::new(
                &config.base_uri,
                credential.clone(),
                config.poll_interval,
            )))
        };

        Ok(Self {
            store,
            events,
            source,
            needs_source,
            config,
            reader: None,
            flush_task: None,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Starts reading flag/segment data in the background, and (if events
    /// are enabled) a periodic timer that flushes them every
    /// `config.flush_interval`. The returned future resolves once the first
    /// full data set has been applied; dropping it does not stop the
    /// background read.
    ///
    /// In offline or Relay Proxy daemon mode (`use_ldd`) there is no source
    /// to read from, so this resolves immediately. Calling it a second time
    /// on a client that does have a source is an error.
    pub async fn start(&mut self) -> Result<(), StartError<std::convert::Infallible>> {
        match self.source.take() {
            Some(source) => {
                let store = Arc::clone(&self.store);
                let (reader, ready) = store.read_from(source);
                self.reader = Some(reader);
                self.spawn_flush_task();
                ready.await.map_err(Into::into)
            }
            None if self.needs_source => Err(StartError::AlreadyStarted),
            None => {
                self.spawn_flush_task();
                Ok(())
            }
        }
    }

    /// Spawns the periodic flush timer if events are enabled and it isn't
    /// already running. Idempotent, so a second `start()` call on a
    /// sourceless client doesn't spawn a duplicate timer.
    fn spawn_flush_task(&mut self) {
        if self.flush_task.is_some() {
            return;
        }
        let Some(events) = self.events.clone() else {
            return;
        };
        let interval = self.config.flush_interval;
        self.flush_task = Some(tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // first tick fires immediately; the real period starts after it
            loop {
                ticker.tick().await;
                events.flush().await;
            }
        }));
    }

    fn record_feature_request(
        &self,
        flag_key: &str,
        flag: Option<&Flag>,
        user: &User,
        default: &Value,
        detail: &evaluator::EvalDetail,
        prereq_of: Option<&str>,
    ) {
        if let Some(events) = &self.events {
            let (track_events, debug_events_until_date, version) = match flag {
                Some(flag) => (flag.track_events, flag.debug_events_until_date, Some(flag.version)),
                None => (false, None, None),
            };
            events.feature_request(
                flag_key,
                user,
                default,
                detail,
                track_events,
                debug_events_until_date,
                version,
                prereq_of,
            );
        }
    }

    /// Evaluates `flag_key` for `user` without recording the main flag's
    /// feature event — callers finish that once they know whether `default`
    /// coerces to the type they asked for. Prerequisite evaluations are
    /// recorded here regardless, since they don't carry a coercion step.
    fn resolve(&self, flag_key: &str, user: &User, default: Value) -> (evaluator::EvalDetail, Option<Arc<Flag>>) {
        if !self.store.initialized() {
            return (
                evaluator::EvalDetail {
                    value: default,
                    variation_index: None,
                    reason: Reason::Error { kind: ErrorKind::ClientNotReady },
                },
                None,
            );
        }
        let Some(flag) = self.store.get_flag(flag_key) else {
            return (
                evaluator::EvalDetail {
                    value: default,
                    variation_index: None,
                    reason: Reason::Error { kind: ErrorKind::FlagNotFound },
                },
                None,
            );
        };

        let (detail, prereqs) = evaluator::evaluate(self.store.as_ref(), &flag, user, default);

        for prereq in &prereqs {
            if let Some(prereq_flag) = self.store.get_flag(&prereq.flag_key) {
                self.record_feature_request(
                    &prereq.flag_key,
                    Some(&prereq_flag),
                    user,
                    &Value::Null,
                    &prereq.detail,
                    Some(flag_key),
                );
            }
        }

        (detail, Some(flag))
    }

    pub fn bool_variation(&self, flag_key: &str, user: &User, default: bool) -> bool {
        self.bool_variation_detail(flag_key, user, default).value
    }

    pub fn bool_variation_detail(&self, flag_key: &str, user: &User, default: bool) -> VariationDetail<bool> {
        let default_json = json!(default);
        let (mut detail, flag) = self.resolve(flag_key, user, default_json.clone());
        match detail.value.as_bool() {
            Some(value) => {
                self.record_feature_request(flag_key, flag.as_deref(), user, &default_json, &detail, None);
                VariationDetail::wrap(value, detail)
            }
            None => {
                detail.reason = Reason::Error { kind: ErrorKind::WrongType };
                detail.variation_index = None;
                detail.value = default_json.clone();
                self.record_feature_request(flag_key, flag.as_deref(), user, &default_json, &detail, None);
                VariationDetail::wrong_type(default)
            }
        }
    }

    pub fn string_variation(&self, flag_key: &str, user: &User, default: impl Into<String>) -> String {
        self.string_variation_detail(flag_key, user, default).value
    }

    pub fn string_variation_detail(&self, flag_key: &str, user: &User, default: impl Into<String>) -> VariationDetail<String> {
        let default = default.into();
        let default_json = json!(default);
        let (mut detail, flag) = self.resolve(flag_key, user, default_json.clone());
        match detail.value.as_str().map(str::to_string) {
            Some(value) => {
                self.record_feature_request(flag_key, flag.as_deref(), user, &default_json, &detail, None);
                VariationDetail::wrap(value, detail)
            }
            None => {
                detail.reason = Reason::Error { kind: ErrorKind::WrongType };
                detail.variation_index = None;
                detail.value = default_json.clone();
                self.record_feature_request(flag_key, flag.as_deref(), user, &default_json, &detail, None);
                VariationDetail::wrong_type(default)
            }
        }
    }

    pub fn int_variation(&self, flag_key: &str, user: &User, default: i64) -> i64 {
        self.int_variation_detail(flag_key, user, default).value
    }

    pub fn int_variation_detail(&self, flag_key: &str, user: &User, default: i64) -> VariationDetail<i64> {
        let default_json = json!(default);
        let (mut detail, flag) = self.resolve(flag_key, user, default_json.clone());
        match detail.value.as_i64() {
            Some(value) => {
                self.record_feature_request(flag_key, flag.as_deref(), user, &default_json, &detail, None);
                VariationDetail::wrap(value, detail)
            }
            None => {
                detail.reason = Reason::Error { kind: ErrorKind::WrongType };
                detail.variation_index = None;
                detail.value = default_json.clone();
                self.record_feature_request(flag_key, flag.as_deref(), user, &default_json, &detail, None);
                VariationDetail::wrong_type(default)
            }
        }
    }

    pub fn float_variation(&self, flag_key: &str, user: &User, default: f64) -> f64 {
        self.float_variation_detail(flag_key, user, default).value
    }

    pub fn float_variation_detail(&self, flag_key: &str, user: &User, default: f64) -> VariationDetail<f64> {
        let default_json = json!(default);
        let (mut detail, flag) = self.resolve(flag_key, user, default_json.clone());
        match detail.value.as_f64() {
            Some(value) => {
                self.record_feature_request(flag_key, flag.as_deref(), user, &default_json, &detail, None);
                VariationDetail::wrap(value, detail)
            }
            None => {
                detail.reason = Reason::Error { kind: ErrorKind::WrongType };
                detail.variation_index = None;
                detail.value = default_json.clone();
                self.record_feature_request(flag_key, flag.as_deref(), user, &default_json, &detail, None);
                VariationDetail::wrong_type(default)
            }
        }
    }

    pub fn json_variation(&self, flag_key: &str, user: &User, default: Value) -> Value {
        self.json_variation_detail(flag_key, user, default).value
    }

    pub fn json_variation_detail(&self, flag_key: &str, user: &User, default: Value) -> VariationDetail<Value> {
        let default_json = default.clone();
        let (detail, flag) = self.resolve(flag_key, user, default);
        self.record_feature_request(flag_key, flag.as_deref(), user, &default_json, &detail, None);
        VariationDetail {
            value: detail.value.clone(),
            variation_index: detail.variation_index,
            reason: detail.reason,
        }
    }

    /// A snapshot of every currently known flag's resolved value for
    /// `user`. Intended for bootstrapping a client-side SDK, not for
    /// per-flag analytics — no feature events are emitted.
    pub fn all_flags_state(&self, user: &User) -> HashMap<String, Value> {
        if !self.store.initialized() {
            return HashMap::new();
        }
        self.store
            .all_flags()
            .into_iter()
            .map(|(key, flag)| {
                let (detail, _) = evaluator::evaluate(self.store.as_ref(), &flag, user, Value::Null);
                (key, detail.value)
            })
            .collect()
    }

    pub fn track(&self, user: &User, key: &str, data: Option<Value>, metric_value: Option<f64>) {
        if let Some(events) = &self.events {
            events.track(user, key, data, metric_value);
        }
    }

    pub fn identify(&self, user: &User) {
        if let Some(events) = &self.events {
            events.identify(user);
        }
    }

    pub async fn flush(&self) {
        if let Some(events) = &self.events {
            events.flush().await;
        }
    }

    /// Flushes any buffered analytics events, then stops and joins the
    /// background data-source reader and the flush timer. Safe to call more
    /// than once; later calls just flush again with both tasks already
    /// gone.
    pub async fn close(&mut self) {
        self.shutting_down.store(true, Ordering::Release);
        self.flush().await;
        if let Some(flush_task) = self.flush_task.take() {
            flush_task.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.shutdown().await;
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::test_utils::{FlagBuilder, MockStore};
    use crate::user::User;

    #[test]
    fn smoke_evaluates_target_match_through_mock_store() {
        let store = MockStore::new();
        let flag = FlagBuilder::new("smoke_flag")
            .on()
            .variations(vec![serde_json::json!(false), serde_json::json!(true)])
            .fallthrough_variation(0)
            .add_target(1, vec!["kalk.space".into(), "www.netlify.com".into()])
            .build();
        store.add_flag(flag.clone());

        let (detail, _) = crate::evaluator::evaluate(
            &store,
            &flag,
            &User::new("kalk.space"),
            serde_json::json!(false),
        );
        assert_eq!(detail.value, serde_json::json!(true));

        let (detail, _) = crate::evaluator::evaluate(
            &store,
            &flag,
            &User::new("app.netlify.com"),
            serde_json::json!(false),
        );
        assert_eq!(detail.value, serde_json::json!(false));
    }

    #[test]
    fn new_rejects_empty_credential() {
        let result = super::Client::new("", Config::default());
        assert!(matches!(result, Err(super::CreateError::EmptyCredential)));
    }
}
