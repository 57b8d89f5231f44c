//! Builders for synthetic firehose frames used across the test suites.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use ciborium::Value;
use parking_lot::Mutex;
use serde_json::json;

use super::transport::{FrameTransport, TransportConnector};
use crate::Result;

pub fn varint(mut n: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (n & 0x7f) as u8;
        n >>= 7;
        if n == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

/// A CIDv1 (dag-cbor, sha2-256) with a digest filled with `seed`.
pub fn fake_cid(seed: u8) -> Vec<u8> {
    let mut cid = vec![0x01, 0x71, 0x12, 0x20];
    cid.extend_from_slice(&[seed; 32]);
    cid
}

/// Tag-42 link to a CID, as it appears inside CBOR records and ops.
pub fn cid_link(cid: &[u8]) -> Value {
    let mut bytes = vec![0x00];
    bytes.extend_from_slice(cid);
    Value::Tag(42, Box::new(Value::Bytes(bytes)))
}

pub fn cbor(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out).expect("serialize CBOR");
    out
}

pub fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

pub fn map(entries: Vec<(&str, Value)>) -> Value {
    Value::Map(entries.into_iter().map(|(k, v)| (text(k), v)).collect())
}

/// Convert plain JSON into CBOR for building record blocks.
pub fn json_to_cbor(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i.into()),
            None => Value::Float(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => text(s),
        serde_json::Value::Array(items) => Value::Array(items.iter().map(json_to_cbor).collect()),
        serde_json::Value::Object(obj) => Value::Map(
            obj.iter()
                .map(|(k, v)| (text(k), json_to_cbor(v)))
                .collect(),
        ),
    }
}

pub fn car(blocks: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
    let header = cbor(&map(vec![
        ("version", Value::Integer(1.into())),
        ("roots", Value::Array(vec![])),
    ]));
    let mut out = varint(header.len() as u64);
    out.extend_from_slice(&header);
    for (cid, data) in blocks {
        out.extend_from_slice(&varint((cid.len() + data.len()) as u64));
        out.extend_from_slice(cid);
        out.extend_from_slice(data);
    }
    out
}

fn frame(kind: &str, body: Value) -> Vec<u8> {
    let mut out = cbor(&map(vec![
        ("op", Value::Integer(1.into())),
        ("t", text(kind)),
    ]));
    out.extend_from_slice(&cbor(&body));
    out
}

/// A commit op: `(action, path, record)`; `record = None` means no block.
pub type OpSpec = (&'static str, String, Option<serde_json::Value>);

pub fn commit_frame(seq: i64, repo: &str, time: &str, ops: Vec<OpSpec>) -> Vec<u8> {
    let mut blocks = Vec::new();
    let mut op_values = Vec::new();
    for (i, (action, path, record)) in ops.into_iter().enumerate() {
        let cid_value = match record {
            Some(record) => {
                let cid = fake_cid(i as u8 + 1);
                blocks.push((cid.clone(), cbor(&json_to_cbor(&record))));
                cid_link(&cid)
            }
            None => Value::Null,
        };
        op_values.push(map(vec![
            ("action", text(action)),
            ("path", text(&path)),
            ("cid", cid_value),
        ]));
    }

    frame(
        "#commit",
        map(vec![
            ("seq", Value::Integer(seq.into())),
            ("repo", text(repo)),
            ("rebase", Value::Bool(false)),
            ("tooBig", Value::Bool(false)),
            ("ops", Value::Array(op_values)),
            ("blocks", Value::Bytes(car(&blocks))),
            ("time", text(time)),
        ]),
    )
}

pub fn profile_frame(seq: i64, did: &str, time: &str, profile: serde_json::Value) -> Vec<u8> {
    commit_frame(
        seq,
        did,
        time,
        vec![(
            "update",
            "app.bsky.actor.profile/self".to_string(),
            Some(profile),
        )],
    )
}

pub fn post_frame(seq: i64, did: &str, rkey: &str, time: &str, body: &str) -> Vec<u8> {
    commit_frame(
        seq,
        did,
        time,
        vec![(
            "create",
            format!("app.bsky.feed.post/{rkey}"),
            Some(json!({
                "$type": "app.bsky.feed.post",
                "text": body,
                "createdAt": time,
            })),
        )],
    )
}

pub fn identity_frame(seq: i64, did: &str, handle: Option<&str>, time: &str) -> Vec<u8> {
    let mut body = vec![
        ("seq", Value::Integer(seq.into())),
        ("did", text(did)),
        ("time", text(time)),
    ];
    if let Some(handle) = handle {
        body.push(("handle", text(handle)));
    }
    frame("#identity", map(body))
}

pub fn info_frame(name: &str) -> Vec<u8> {
    frame(
        "#info",
        map(vec![("name", text(name)), ("message", text("catching up"))]),
    )
}

pub fn error_frame(error: &str, message: &str) -> Vec<u8> {
    let mut out = cbor(&map(vec![("op", Value::Integer((-1).into()))]));
    out.extend_from_slice(&cbor(&map(vec![
        ("error", text(error)),
        ("message", text(message)),
    ])));
    out
}

// ============================================================================
// Scripted transports
// ============================================================================

/// Replays scripted frames, then either ends or hangs forever.
pub struct ScriptedTransport {
    frames: VecDeque<Vec<u8>>,
    hang_when_done: bool,
}

#[async_trait]
impl FrameTransport for ScriptedTransport {
    async fn next_frame(&mut self) -> Option<Result<Vec<u8>>> {
        match self.frames.pop_front() {
            Some(frame) => Some(Ok(frame)),
            None if self.hang_when_done => {
                std::future::pending::<()>().await;
                None
            }
            None => None,
        }
    }
}

/// Hands out a fresh [`ScriptedTransport`] per connect and records cursors.
pub struct ScriptedConnector {
    frames: Vec<Vec<u8>>,
    hang_when_done: bool,
    pub cursors: Mutex<Vec<Option<i64>>>,
}

impl ScriptedConnector {
    pub fn new(frames: Vec<Vec<u8>>, hang_when_done: bool) -> Arc<Self> {
        Arc::new(Self {
            frames,
            hang_when_done,
            cursors: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl TransportConnector for ScriptedConnector {
    async fn connect(&self, cursor: Option<i64>) -> Result<Box<dyn FrameTransport>> {
        self.cursors.lock().push(cursor);
        Ok(Box::new(ScriptedTransport {
            frames: self.frames.clone().into(),
            hang_when_done: self.hang_when_done,
        }))
    }
}
