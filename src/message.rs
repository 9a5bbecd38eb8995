//! Parses eventsource `put`/`patch`/`delete` payloads into [`Message`]s the
//! consumer applies to the [`crate::store::Store`].

use crate::models::{AllData, Flag, Kind, Segment};
use crate::store::parse_path;
use eventsource_client::Event;
use serde::Deserialize;
use serde_json::Value;
use std::convert::{TryFrom, TryInto};
use tracing::{trace, warn};

#[derive(Debug, thiserror::Error)]
pub enum MessageParseError {
    #[error("missing the data field")]
    MissingData,

    #[error("missing payload on eventsource item")]
    MissingEventPayload,

    #[error(transparent)]
    ParsePatch(#[from] FromPatchDataError),

    #[error("unable to parse event payload: {0}")]
    ParsePayload(serde_json::Error),
}

/// A parsed message from the streaming data source.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub enum Message {
    Put(AllData),
    Patch(Update),
    Delete(Update),
    Unknown,
}

impl TryFrom<Event> for Message {
    type Error = MessageParseError;

    fn try_from(event: Event) -> Result<Self, Self::Error> {
        let name = &event.event_type;
        trace!(%name, "reading SSE event");

        let event_data = event
            .field("data")
            .ok_or(MessageParseError::MissingEventPayload)?;
        let payload: MessagePayload =
            serde_json::from_slice(event_data).map_err(MessageParseError::ParsePayload)?;

        match name.as_str() {
            "put" => {
                let data = payload.data.ok_or(MessageParseError::MissingData)?;
                let all_data = parse_all_data_best_effort(data);
                trace!(
                    num_flags = all_data.flags.len(),
                    num_segments = all_data.segments.len(),
                    "parsed init data"
                );
                Ok(Self::Put(all_data))
            }
            "patch" | "delete" => {
                let update: Update = payload.try_into()?;
                trace!(?update, "parsed update");
                Ok(match name.as_str() {
                    "patch" => Self::Patch(update),
                    "delete" => Self::Delete(update),
                    _ => unreachable!(),
                })
            }
            _ => {
                warn!(%name, "unknown event type");
                Ok(Message::Unknown)
            }
        }
    }
}

/// Parses a `put` snapshot one flag/segment at a time so a single malformed
/// item doesn't discard the whole batch; the item is logged and skipped
/// instead.
fn parse_all_data_best_effort(data: Value) -> AllData {
    let mut all_data = AllData::default();

    if let Some(flags) = data.get("flags").and_then(Value::as_object) {
        for (key, value) in flags {
            match serde_json::from_value::<Flag>(value.clone()) {
                Ok(flag) => {
                    all_data.flags.insert(key.clone(), flag);
                }
                Err(error) => warn!(flag = %key, %error, "skipping malformed flag in put payload"),
            }
        }
    }

    if let Some(segments) = data.get("segments").and_then(Value::as_object) {
        for (key, value) in segments {
            match serde_json::from_value::<Segment>(value.clone()) {
                Ok(segment) => {
                    all_data.segments.insert(key.clone(), segment);
                }
                Err(error) => warn!(segment = %key, %error, "skipping malformed segment in put payload"),
            }
        }
    }

    all_data
}

#[derive(Debug, Deserialize)]
struct MessagePayload {
    path: String,
    data: Option<serde_json::Value>,
    version: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum FromPatchDataError {
    #[error("update path is unrecognised")]
    UnknownPath,

    #[error("failed to read record payload")]
    InvalidPayload(#[from] serde_json::Error),
}

/// Describes the change of a single flag or segment.
#[derive(Debug)]
pub enum Update {
    Flag {
        key: String,
        data: Option<Flag>,
        version: Option<u64>,
    },
    Segment {
        key: String,
        data: Option<Segment>,
        version: Option<u64>,
    },
    /// A path this store doesn't recognise; logged and ignored by the
    /// consumer rather than treated as an error.
    Unknown,
}

impl TryFrom<MessagePayload> for Update {
    type Error = FromPatchDataError;

    fn try_from(pl: MessagePayload) -> Result<Self, Self::Error> {
        match parse_path(&pl.path) {
            Some((Kind::Flag, key)) => {
                let data = pl.data.map(serde_json::from_value).transpose()?;
                Ok(Self::Flag {
                    key: key.to_string(),
                    data,
                    version: pl.version,
                })
            }
            Some((Kind::Segment, key)) => {
                let data = pl.data.map(serde_json::from_value).transpose()?;
                Ok(Self::Segment {
                    key: key.to_string(),
                    data,
                    version: pl.version,
                })
            }
            None => Ok(Self::Unknown),
        }
    }
}
