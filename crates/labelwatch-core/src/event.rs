//! Commit events and label operations.
//!
//! A [`CommitEvent`] is one decoded unit of work from the firehose. A single
//! repository commit frame can expand to several events (one per record
//! operation); all events from the same frame share its sequence number and
//! are told apart by `op_index`.
//!
//! Record payloads are modeled as a closed [`RecordBody`] union keyed by the
//! collection NSID, with an [`RecordBody::Unknown`] catch-all that downstream
//! code can safely ignore.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::uri::{AtUri, POST_COLLECTION, PROFILE_COLLECTION};

/// Discriminator for the kind of record an event concerns.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordType {
    /// `app.bsky.feed.post` records.
    Post,
    /// `app.bsky.actor.profile` records.
    Profile,
    /// Identity (handle) changes.
    IdentityChange,
    /// Anything else, keyed by its collection or frame type.
    Other(String),
}

impl RecordType {
    /// Classify a record collection NSID.
    pub fn from_collection(collection: &str) -> Self {
        match collection {
            POST_COLLECTION => Self::Post,
            PROFILE_COLLECTION => Self::Profile,
            other => Self::Other(other.to_string()),
        }
    }

    /// Short string form used in logs and metrics labels.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Post => "post",
            Self::Profile => "profile",
            Self::IdentityChange => "identity-change",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Repository operation carried by a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpAction {
    Create,
    Update,
    Delete,
    /// Not a record operation (identity or account frames).
    None,
}

impl OpAction {
    /// Parse the `action` field of a commit op.
    pub fn parse(action: &str) -> Self {
        match action {
            "create" => Self::Create,
            "update" => Self::Update,
            "delete" => Self::Delete,
            _ => Self::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::None => "none",
        }
    }
}

/// Decoded post record (subset of `app.bsky.feed.post`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostRecord {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub langs: Vec<String>,
    #[serde(default)]
    pub reply: Option<serde_json::Value>,
}

impl PostRecord {
    /// Whether this post is a reply to another post.
    pub fn is_reply(&self) -> bool {
        self.reply.is_some()
    }
}

/// Decoded profile record (subset of `app.bsky.actor.profile`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRecord {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub avatar: Option<serde_json::Value>,
}

impl ProfileRecord {
    pub fn has_avatar(&self) -> bool {
        self.avatar.is_some()
    }

    pub fn has_display_name(&self) -> bool {
        self.display_name.as_deref().is_some_and(|s| !s.trim().is_empty())
    }
}

/// Decoded record payload of an event.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RecordBody {
    /// The frame carried no payload for this op (deletes, missing blocks).
    #[default]
    Empty,
    Post(PostRecord),
    Profile(ProfileRecord),
    /// Identity change; `handle` is absent when the handle was removed.
    Identity { handle: Option<String> },
    /// A record of a collection we don't model.
    Unknown(serde_json::Value),
}

impl RecordBody {
    /// Build a typed body for a collection from its JSON form.
    ///
    /// Falls back to [`RecordBody::Unknown`] if the JSON doesn't fit the
    /// modeled shape, so an odd record never fails the whole event.
    pub fn from_json(collection: &str, json: serde_json::Value) -> Self {
        match collection {
            POST_COLLECTION => match serde_json::from_value::<PostRecord>(json.clone()) {
                Ok(post) => Self::Post(post),
                Err(_) => Self::Unknown(json),
            },
            PROFILE_COLLECTION => match serde_json::from_value::<ProfileRecord>(json.clone()) {
                Ok(profile) => Self::Profile(profile),
                Err(_) => Self::Unknown(json),
            },
            _ => Self::Unknown(json),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// Identity of one event: frame sequence plus op position within the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKey {
    pub sequence: i64,
    pub op_index: u32,
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.op_index == 0 {
            write!(f, "{}", self.sequence)
        } else {
            write!(f, "{}#{}", self.sequence, self.op_index)
        }
    }
}

/// One decoded unit of work from the firehose. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitEvent {
    /// Upstream sequence number of the frame this event came from.
    pub sequence: i64,
    /// Position of the op inside its frame.
    pub op_index: u32,
    /// Account DID the event concerns.
    pub repo: String,
    pub record_type: RecordType,
    pub action: OpAction,
    /// Repository path (`collection/rkey`) for record ops.
    pub path: Option<String>,
    pub body: RecordBody,
    /// Wall-clock time attached by the source.
    pub occurred_at: DateTime<Utc>,
}

impl CommitEvent {
    pub fn key(&self) -> EventKey {
        EventKey {
            sequence: self.sequence,
            op_index: self.op_index,
        }
    }

    /// The record URI for record ops, if the path is well-formed.
    pub fn uri(&self) -> Option<AtUri> {
        self.path
            .as_deref()
            .and_then(|path| AtUri::from_repo_path(&self.repo, path).ok())
    }
}

/// Whether a label is applied or negated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelAction {
    Create,
    Remove,
}

impl LabelAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Remove => "remove",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(Self::Create),
            "remove" => Some(Self::Remove),
            _ => None,
        }
    }
}

/// A label decision handed to persistence for later emission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelOperation {
    pub label: String,
    pub action: LabelAction,
    /// Subject DID.
    pub subject: String,
    pub comment: Option<String>,
    /// Unix seconds at which the operation becomes due (0 = immediately).
    pub scheduled_at: i64,
}

impl LabelOperation {
    pub fn create(label: &str, subject: &str, comment: impl Into<String>) -> Self {
        Self {
            label: label.to_string(),
            action: LabelAction::Create,
            subject: subject.to_string(),
            comment: Some(comment.into()),
            scheduled_at: 0,
        }
    }

    pub fn remove(label: &str, subject: &str, comment: impl Into<String>) -> Self {
        Self {
            label: label.to_string(),
            action: LabelAction::Remove,
            subject: subject.to_string(),
            comment: Some(comment.into()),
            scheduled_at: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_type_from_collection() {
        assert_eq!(RecordType::from_collection(POST_COLLECTION), RecordType::Post);
        assert_eq!(RecordType::from_collection(PROFILE_COLLECTION), RecordType::Profile);
        assert_eq!(
            RecordType::from_collection("app.bsky.feed.like"),
            RecordType::Other("app.bsky.feed.like".to_string())
        );
        assert_eq!(RecordType::IdentityChange.as_str(), "identity-change");
    }

    #[test]
    fn test_body_from_json_post() {
        let body = RecordBody::from_json(
            POST_COLLECTION,
            json!({"$type": POST_COLLECTION, "text": "hello", "createdAt": "2024-01-01T00:00:00Z"}),
        );
        match body {
            RecordBody::Post(post) => {
                assert_eq!(post.text, "hello");
                assert!(!post.is_reply());
            }
            other => panic!("expected post, got {other:?}"),
        }
    }

    #[test]
    fn test_body_from_json_profile_without_fields() {
        let body = RecordBody::from_json(PROFILE_COLLECTION, json!({}));
        match body {
            RecordBody::Profile(profile) => {
                assert!(!profile.has_avatar());
                assert!(!profile.has_display_name());
            }
            other => panic!("expected profile, got {other:?}"),
        }
    }

    #[test]
    fn test_body_from_json_mismatched_shape_is_unknown() {
        let body = RecordBody::from_json(POST_COLLECTION, json!({"text": 42}));
        assert!(matches!(body, RecordBody::Unknown(_)));
    }

    #[test]
    fn test_event_uri_and_key() {
        let event = CommitEvent {
            sequence: 10,
            op_index: 2,
            repo: "did:plc:abc".to_string(),
            record_type: RecordType::Post,
            action: OpAction::Create,
            path: Some("app.bsky.feed.post/3k".to_string()),
            body: RecordBody::Empty,
            occurred_at: Utc::now(),
        };
        assert_eq!(event.uri().unwrap().to_string(), "at://did:plc:abc/app.bsky.feed.post/3k");
        assert_eq!(event.key().to_string(), "10#2");
    }

    #[test]
    fn test_label_action_roundtrip_strings() {
        assert_eq!(LabelAction::parse("create"), Some(LabelAction::Create));
        assert_eq!(LabelAction::parse(LabelAction::Remove.as_str()), Some(LabelAction::Remove));
        assert_eq!(LabelAction::parse("negate"), None);
    }
}
