//! The versioned in-memory feature store.
//!
//! Readers get an `Arc` clone of the current value rather than a literal
//! refcounted "handle": a read-side `Arc` clone instead of a release-tracked
//! borrow, trading one atomic increment for zero synchronisation on release.
//! Writers never mutate a published
//! value in place; `init`/`upsert`/`remove` always swap in a fresh map via
//! [`arc_swap::ArcSwap`], the same mechanism for both flags and segments.

use crate::consumer::{Consumer, InitState};
use crate::message::{Message, Update};
use crate::models::{AllData, Flag, Kind, Segment};
use arc_swap::ArcSwap;
use futures::future::Ready;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// One versioned slot. `value: None` is a tombstone: it blocks older
/// upserts from being applied but is not itself returned by `get`/`all`.
#[derive(Clone)]
struct Slot<T> {
    version: u64,
    value: Option<Arc<T>>,
}

struct Namespace<T> {
    entries: ArcSwap<HashMap<String, Slot<T>>>,
}

impl<T> Default for Namespace<T> {
    fn default() -> Self {
        Self {
            entries: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }
}

impl<T> Namespace<T> {
    fn get(&self, key: &str) -> Option<Arc<T>> {
        self.entries.load().get(key).and_then(|slot| slot.value.clone())
    }

    fn all(&self) -> HashMap<String, Arc<T>> {
        self.entries
            .load()
            .iter()
            .filter_map(|(k, slot)| slot.value.clone().map(|v| (k.clone(), v)))
            .collect()
    }

    fn init(&self, items: HashMap<String, (T, u64)>) {
        let map = items
            .into_iter()
            .map(|(key, (value, version))| {
                (
                    key,
                    Slot {
                        version,
                        value: Some(Arc::new(value)),
                    },
                )
            })
            .collect();
        self.entries.store(Arc::new(map));
    }

    /// Applies a versioned write (`Some(value)` for an upsert, `None` for a
    /// tombstone) unless the incoming version is stale.
    fn write(&self, key: &str, version: u64, value: Option<T>) -> bool {
        let current = self.entries.load();
        if let Some(existing) = current.get(key) {
            if version <= existing.version {
                return false;
            }
        }
        let mut next = current.as_ref().clone();
        next.insert(
            key.to_string(),
            Slot {
                version,
                value: value.map(Arc::new),
            },
        );
        self.entries.store(Arc::new(next));
        true
    }
}

/// Store operations the evaluator and data source depend on.
///
/// Kept as two explicit kind-specific method pairs rather than a single
/// `get(kind, key) -> dyn Any`: a typed seam here shrinks the evaluator's
/// error surface the same way parsing the rule tree once does.
pub trait Store: Send + Sync {
    fn get_flag(&self, key: &str) -> Option<Arc<Flag>>;
    fn get_segment(&self, key: &str) -> Option<Arc<Segment>>;
    fn all_flags(&self) -> HashMap<String, Arc<Flag>>;
    fn all_segments(&self) -> HashMap<String, Arc<Segment>>;

    /// Atomically replaces an entire namespace. Readers observe either the
    /// old complete set or the new one, never a partial mix.
    fn init(&self, data: AllData);

    /// Best-effort: a write for a single stale item never aborts a batch.
    fn upsert_flag(&self, flag: Flag);
    fn upsert_segment(&self, segment: Segment);
    fn remove_flag(&self, key: &str, version: u64);
    fn remove_segment(&self, key: &str, version: u64);

    fn initialized(&self) -> bool;
}

/// The default in-memory [`Store`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    flags: Namespace<Flag>,
    segments: Namespace<Segment>,
    init: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn get_flag(&self, key: &str) -> Option<Arc<Flag>> {
        if !self.init.load(Ordering::Acquire) {
            return None;
        }
        self.flags.get(key)
    }

    fn get_segment(&self, key: &str) -> Option<Arc<Segment>> {
        if !self.init.load(Ordering::Acquire) {
            return None;
        }
        self.segments.get(key)
    }

    fn all_flags(&self) -> HashMap<String, Arc<Flag>> {
        self.flags.all()
    }

    fn all_segments(&self) -> HashMap<String, Arc<Segment>> {
        self.segments.all()
    }

    fn init(&self, data: AllData) {
        let flags = data
            .flags
            .into_iter()
            .map(|(k, v)| (k, (v.clone(), v.version)))
            .collect();
        let segments = data
            .segments
            .into_iter()
            .map(|(k, v)| (k, (v.clone(), v.version)))
            .collect();
        self.flags.init(flags);
        self.segments.init(segments);
        self.init.store(true, Ordering::Release);
        debug!("store initialised");
    }

    fn upsert_flag(&self, flag: Flag) {
        let key = flag.key.clone();
        let version = flag.version;
        if !self.flags.write(&key, version, Some(flag)) {
            warn!(flag = %key, %version, "ignoring stale flag upsert");
        }
    }

    fn upsert_segment(&self, segment: Segment) {
        let key = segment.key.clone();
        let version = segment.version;
        if !self.segments.write(&key, version, Some(segment)) {
            warn!(segment = %key, %version, "ignoring stale segment upsert");
        }
    }

    fn remove_flag(&self, key: &str, version: u64) {
        if !self.flags.write(key, version, None) {
            warn!(flag = %key, %version, "ignoring stale flag delete");
        }
    }

    fn remove_segment(&self, key: &str, version: u64) {
        if !self.segments.write(key, version, None) {
            warn!(segment = %key, %version, "ignoring stale segment delete");
        }
    }

    fn initialized(&self) -> bool {
        self.init.load(Ordering::Acquire)
    }
}

impl<T: Store> Store for Arc<T> {
    fn get_flag(&self, key: &str) -> Option<Arc<Flag>> {
        self.as_ref().get_flag(key)
    }

    fn get_segment(&self, key: &str) -> Option<Arc<Segment>> {
        self.as_ref().get_segment(key)
    }

    fn all_flags(&self) -> HashMap<String, Arc<Flag>> {
        self.as_ref().all_flags()
    }

    fn all_segments(&self) -> HashMap<String, Arc<Segment>> {
        self.as_ref().all_segments()
    }

    fn init(&self, data: AllData) {
        self.as_ref().init(data)
    }

    fn upsert_flag(&self, flag: Flag) {
        self.as_ref().upsert_flag(flag)
    }

    fn upsert_segment(&self, segment: Segment) {
        self.as_ref().upsert_segment(segment)
    }

    fn remove_flag(&self, key: &str, version: u64) {
        self.as_ref().remove_flag(key, version)
    }

    fn remove_segment(&self, key: &str, version: u64) {
        self.as_ref().remove_segment(key, version)
    }

    fn initialized(&self) -> bool {
        self.as_ref().initialized()
    }
}

/// Applies every message kind a data source can produce, generic over the
/// source itself — `consume` only cares about the message, never how it
/// arrived.
impl<S> Consumer<S> for MemoryStore {
    type Error = Infallible;
    type Future = Ready<Result<InitState, Self::Error>>;

    fn consume(&self, msg: Message) -> Self::Future {
        let state = match msg {
            Message::Put(data) => {
                self.init(data);
                InitState::Done
            }
            Message::Patch(update) => {
                self.apply_update(update);
                InitState::Pending
            }
            Message::Delete(update) => {
                self.apply_update(update);
                InitState::Pending
            }
            Message::Unknown => InitState::Pending,
        };
        futures::future::ready(Ok(state))
    }
}

impl MemoryStore {
    fn apply_update(&self, update: Update) {
        match update {
            Update::Flag { data: Some(flag), .. } => self.upsert_flag(flag),
            Update::Flag { key, data: None, version } => {
                self.remove_flag(&key, version.unwrap_or(0));
            }
            Update::Segment { data: Some(segment), .. } => self.upsert_segment(segment),
            Update::Segment { key, data: None, version } => {
                self.remove_segment(&key, version.unwrap_or(0));
            }
            Update::Unknown => {}
        }
    }
}

/// Resolves a data-source update path such as `/flags/my-flag` into its
/// [`Kind`] and key. Unrecognised prefixes are reported back to the caller
/// so they can log-and-ignore rather than error.
pub fn parse_path(path: &str) -> Option<(Kind, &str)> {
    if let Some(key) = path.strip_prefix("/flags/") {
        Some((Kind::Flag, key))
    } else if let Some(key) = path.strip_prefix("/segments/") {
        Some((Kind::Segment, key))
    } else {
        None
    }
}
