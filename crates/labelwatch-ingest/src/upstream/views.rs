//! Response shapes for the upstream APIs the labeler reads.
//!
//! Only the fields the rules use are modelled; everything else in the
//! responses is ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const REASON_REPOST: &str = "app.bsky.feed.defs#reasonRepost";

/// A label attached to an account, as returned by the app view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    /// DID of the labeler that applied it.
    pub src: String,
    #[serde(default)]
    pub uri: String,
    pub val: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub neg: bool,
    pub cts: String,
}

impl Label {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.cts)
    }
}

/// `app.bsky.actor.defs#profileViewDetailed`, reduced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileView {
    pub did: String,
    #[serde(default)]
    pub handle: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub labels: Vec<Label>,
}

impl ProfileView {
    pub fn has_avatar(&self) -> bool {
        self.avatar.as_deref().is_some_and(|s| !s.is_empty())
    }

    pub fn has_display_name(&self) -> bool {
        self.display_name.as_deref().is_some_and(|s| !s.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostView {
    pub uri: String,
    #[serde(default)]
    pub cid: String,
    pub indexed_at: String,
}

impl PostView {
    pub fn indexed_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.indexed_at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedReason {
    #[serde(rename = "$type")]
    pub kind: String,
    #[serde(default)]
    pub indexed_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    pub post: PostView,
    #[serde(default)]
    pub reason: Option<FeedReason>,
}

impl FeedItem {
    pub fn is_repost(&self) -> bool {
        self.reason.as_ref().is_some_and(|r| r.kind == REASON_REPOST)
    }

    /// When the item entered the feed: the reason's time if any, else the post's.
    pub fn feed_time(&self) -> Option<DateTime<Utc>> {
        self.reason
            .as_ref()
            .and_then(|r| r.indexed_at.as_deref())
            .and_then(parse_timestamp)
            .or_else(|| self.post.indexed_at())
    }
}

/// `app.bsky.feed.getAuthorFeed` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorFeed {
    #[serde(default)]
    pub feed: Vec<FeedItem>,
    #[serde(default)]
    pub cursor: Option<String>,
}

impl AuthorFeed {
    /// The feed holds the author's whole history (no further page).
    pub fn is_complete(&self) -> bool {
        self.cursor.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlcOperation {
    #[serde(default)]
    pub also_known_as: Option<Vec<String>>,
}

/// One entry of a `did:plc` audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlcAuditEntry {
    pub did: String,
    pub created_at: String,
    #[serde(default)]
    pub operation: PlcOperation,
}

impl PlcAuditEntry {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.created_at)
    }
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_profile_view_from_api_json() {
        let profile: ProfileView = serde_json::from_value(json!({
            "did": "did:plc:abc",
            "handle": "alice.test",
            "displayName": "  ",
            "avatar": "https://cdn.example/img.jpg",
            "followersCount": 12,
            "labels": [
                {"src": "did:plc:labeler", "uri": "at://did:plc:abc", "val": "newaccount",
                 "cts": "2024-05-01T12:00:00.000Z"},
                {"src": "did:plc:labeler", "uri": "at://did:plc:abc", "val": "noavatar",
                 "neg": true, "cts": "2024-05-01T12:00:00.000Z"}
            ]
        }))
        .unwrap();

        assert!(profile.has_avatar());
        assert!(!profile.has_display_name());
        assert_eq!(profile.labels.len(), 2);
        assert!(!profile.labels[0].neg);
        assert!(profile.labels[1].neg);
        assert!(profile.labels[0].created_at().is_some());
    }

    #[test]
    fn test_feed_item_times_and_reposts() {
        let feed: AuthorFeed = serde_json::from_value(json!({
            "feed": [
                {"post": {"uri": "at://did:plc:abc/app.bsky.feed.post/1",
                          "indexedAt": "2024-05-01T12:00:00Z"}},
                {"post": {"uri": "at://did:plc:other/app.bsky.feed.post/9",
                          "indexedAt": "2024-04-01T00:00:00Z"},
                 "reason": {"$type": REASON_REPOST, "indexedAt": "2024-05-02T00:00:00Z"}}
            ],
            "cursor": "abc"
        }))
        .unwrap();

        assert!(!feed.is_complete());
        assert!(!feed.feed[0].is_repost());
        assert!(feed.feed[1].is_repost());
        assert_eq!(
            feed.feed[1].feed_time(),
            parse_timestamp("2024-05-02T00:00:00Z")
        );
        assert_eq!(
            feed.feed[0].feed_time(),
            parse_timestamp("2024-05-01T12:00:00Z")
        );
    }

    #[test]
    fn test_plc_entry_without_aliases() {
        let entries: Vec<PlcAuditEntry> = serde_json::from_value(json!([
            {"did": "did:plc:abc", "createdAt": "2024-01-01T00:00:00Z",
             "operation": {"alsoKnownAs": ["at://alice.test"]}},
            {"did": "did:plc:abc", "createdAt": "2024-02-01T00:00:00Z",
             "operation": {"type": "plc_tombstone"}}
        ]))
        .unwrap();

        assert_eq!(
            entries[0].operation.also_known_as.as_deref(),
            Some(&["at://alice.test".to_string()][..])
        );
        assert!(entries[1].operation.also_known_as.is_none());
    }
}
