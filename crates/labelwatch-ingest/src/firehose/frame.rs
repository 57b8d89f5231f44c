//! Firehose frame decoding.
//!
//! Every binary message is two concatenated CBOR items: a header
//! `{op, t}` and a body whose shape depends on `t`. `op = -1` marks an
//! error frame whose body is `{error, message}`.
//!
//! Decoding turns one frame into zero or more [`CommitEvent`]s. Commit frames
//! expand to one event per record op, each resolved against the embedded CAR
//! archive. Identity frames (and the legacy handle frame) become a single
//! identity-change event. Informational frames produce no events.

use chrono::{DateTime, Utc};
use ciborium::Value;
use labelwatch_core::{CommitEvent, OpAction, RecordBody, RecordType};

use super::car::{BlockMap, read_car};
use crate::{Error, Result};

/// CBOR tag for content-addressed links.
const CID_TAG: u64 = 42;

/// Name of the info frame sent when the requested cursor is older than the
/// upstream's retention window.
pub const OUTDATED_CURSOR: &str = "OutdatedCursor";

/// Result of decoding one frame.
#[derive(Debug)]
pub enum DecodedFrame {
    /// A sequenced frame and the events it expands to (possibly none).
    Events {
        sequence: i64,
        events: Vec<CommitEvent>,
    },
    /// The upstream is replaying from before its retention window.
    OutdatedCursor,
    /// Any other informational frame.
    Info {
        name: String,
        message: Option<String>,
    },
    /// An error frame; the upstream closes the connection after sending one.
    Error { error: String, message: String },
    /// A frame type we don't act on.
    Ignored { kind: String, sequence: Option<i64> },
}

impl DecodedFrame {
    /// The sequence number this frame carries, if any.
    pub fn sequence(&self) -> Option<i64> {
        match self {
            Self::Events { sequence, .. } => Some(*sequence),
            Self::Ignored { sequence, .. } => *sequence,
            _ => None,
        }
    }
}

/// Decode one binary frame.
pub fn decode_frame(bytes: &[u8]) -> Result<DecodedFrame> {
    let mut cursor = bytes;
    let header: Value = ciborium::de::from_reader(&mut cursor)
        .map_err(|e| Error::Decode(format!("frame header: {}", e)))?;
    let body: Value = ciborium::de::from_reader(&mut cursor)
        .map_err(|e| Error::Decode(format!("frame body: {}", e)))?;

    let header = as_map(&header, "header")?;
    let body = as_map(&body, "body")?;

    let op = get(header, "op").and_then(as_i64);
    if op == Some(-1) {
        return Ok(DecodedFrame::Error {
            error: get_text(body, "error").unwrap_or("Unknown").to_string(),
            message: get_text(body, "message").unwrap_or_default().to_string(),
        });
    }
    if op != Some(1) {
        return Err(Error::Decode(format!("unexpected frame op {:?}", op)));
    }

    let kind = get_text(header, "t").unwrap_or_default();
    match kind {
        "#commit" => decode_commit(body),
        "#identity" | "#handle" => decode_identity(body),
        "#info" => {
            let name = get_text(body, "name").unwrap_or_default();
            if name == OUTDATED_CURSOR {
                Ok(DecodedFrame::OutdatedCursor)
            } else {
                Ok(DecodedFrame::Info {
                    name: name.to_string(),
                    message: get_text(body, "message").map(str::to_string),
                })
            }
        }
        other => Ok(DecodedFrame::Ignored {
            kind: other.to_string(),
            sequence: get(body, "seq").and_then(as_i64),
        }),
    }
}

fn decode_commit(body: &[(Value, Value)]) -> Result<DecodedFrame> {
    let sequence = required_seq(body)?;
    let repo = get_text(body, "repo")
        .ok_or_else(|| Error::Decode(format!("commit {} has no repo", sequence)))?
        .to_string();
    let occurred_at = parse_time(get_text(body, "time"));

    let blocks = match get(body, "blocks").and_then(Value::as_bytes) {
        Some(bytes) if !bytes.is_empty() => read_car(bytes)?,
        _ => BlockMap::default(),
    };

    let ops = get(body, "ops")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut events = Vec::with_capacity(ops.len());
    for (index, op) in ops.iter().enumerate() {
        let Some(op) = op.as_map() else {
            continue;
        };
        let Some(path) = get_text(op, "path") else {
            continue;
        };
        let action = OpAction::parse(get_text(op, "action").unwrap_or_default());
        let collection = path.split('/').next().unwrap_or_default();

        let body = match get(op, "cid").and_then(link_bytes) {
            Some(cid) if action != OpAction::Delete => match blocks.get(cid) {
                Some(block) => decode_record(collection, block),
                None => RecordBody::Empty,
            },
            _ => RecordBody::Empty,
        };

        events.push(CommitEvent {
            sequence,
            op_index: index as u32,
            repo: repo.clone(),
            record_type: RecordType::from_collection(collection),
            action,
            path: Some(path.to_string()),
            body,
            occurred_at,
        });
    }

    Ok(DecodedFrame::Events { sequence, events })
}

fn decode_identity(body: &[(Value, Value)]) -> Result<DecodedFrame> {
    let sequence = required_seq(body)?;
    let did = get_text(body, "did")
        .ok_or_else(|| Error::Decode(format!("identity {} has no did", sequence)))?;

    let event = CommitEvent {
        sequence,
        op_index: 0,
        repo: did.to_string(),
        record_type: RecordType::IdentityChange,
        action: OpAction::None,
        path: None,
        body: RecordBody::Identity {
            handle: get_text(body, "handle").map(str::to_string),
        },
        occurred_at: parse_time(get_text(body, "time")),
    };

    Ok(DecodedFrame::Events {
        sequence,
        events: vec![event],
    })
}

fn decode_record(collection: &str, block: &[u8]) -> RecordBody {
    match ciborium::de::from_reader::<Value, _>(block) {
        Ok(value) => RecordBody::from_json(collection, cbor_to_json(&value)),
        Err(e) => {
            tracing::debug!("Undecodable {} record block: {}", collection, e);
            RecordBody::Empty
        }
    }
}

/// Convert a CBOR value to JSON.
///
/// Links become `{"$link": <hex cid>}` and byte strings become
/// `{"$bytes": <hex>}`.
pub fn cbor_to_json(value: &Value) -> serde_json::Value {
    use serde_json::Value as Json;

    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Integer(i) => {
            let n = i128::from(*i);
            if let Ok(v) = i64::try_from(n) {
                Json::from(v)
            } else if let Ok(v) = u64::try_from(n) {
                Json::from(v)
            } else {
                Json::String(n.to_string())
            }
        }
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::Text(s) => Json::String(s.clone()),
        Value::Bytes(b) => serde_json::json!({ "$bytes": hex::encode(b) }),
        Value::Tag(CID_TAG, _) => match link_bytes(value) {
            Some(cid) => serde_json::json!({ "$link": hex::encode(cid) }),
            None => Json::Null,
        },
        Value::Tag(_, inner) => cbor_to_json(inner),
        Value::Array(items) => Json::Array(items.iter().map(cbor_to_json).collect()),
        Value::Map(entries) => Json::Object(
            entries
                .iter()
                .filter_map(|(k, v)| k.as_text().map(|k| (k.to_string(), cbor_to_json(v))))
                .collect(),
        ),
        _ => Json::Null,
    }
}

/// Binary CID of a tag-42 link, without the multibase identity prefix.
fn link_bytes(value: &Value) -> Option<&[u8]> {
    match value {
        Value::Tag(CID_TAG, inner) => {
            let bytes = inner.as_bytes()?;
            match bytes.split_first() {
                Some((0x00, rest)) => Some(rest),
                _ => Some(bytes.as_slice()),
            }
        }
        _ => None,
    }
}

fn parse_time(value: Option<&str>) -> DateTime<Utc> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn required_seq(body: &[(Value, Value)]) -> Result<i64> {
    get(body, "seq")
        .and_then(as_i64)
        .ok_or_else(|| Error::Decode("frame has no seq".to_string()))
}

fn as_map<'a>(value: &'a Value, what: &str) -> Result<&'a [(Value, Value)]> {
    value
        .as_map()
        .map(Vec::as_slice)
        .ok_or_else(|| Error::Decode(format!("frame {} is not a map", what)))
}

fn get<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| k.as_text() == Some(key))
        .map(|(_, v)| v)
}

fn get_text<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a str> {
    get(map, key).and_then(Value::as_text)
}

fn as_i64(value: &Value) -> Option<i64> {
    value.as_integer().and_then(|i| i64::try_from(i).ok())
}
