//! Turns commits into label operations.
//!
//! [`LabelingProcessor`] is the [`CommitHandler`] the queue drives. For each
//! commit it gathers upstream data through the [`Caches`], runs the
//! [`rules`](crate::rules), drops changes that would not alter the account's
//! current labels, and hands the rest to a [`LabelSink`].
//!
//! | Commit          | Cache effect                    | Rules                         |
//! |-----------------|---------------------------------|-------------------------------|
//! | post create     | author feed purged              | feed, profile, expiry         |
//! | profile write   | profile purged                  | profile, expiry               |
//! | identity change | profile and PLC log purged      | none                          |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labelwatch_core::{CommitEvent, LabelOperation, RecordType, is_plc_did};
use tracing::debug;

use crate::cache::{BatchedCache, CacheStats, CompressedJson, LookupError};
use crate::queue::CommitHandler;
use crate::rules::{self, FeedRuleConfig, LabelChanges};
use crate::store::LabelSink;
use crate::upstream::views::{AuthorFeed, PlcAuditEntry, PostView, ProfileView};
use crate::upstream::{author_feed_url, plc_audit_url};
use crate::{Error, Result};

/// The lookup caches the rules read through.
#[derive(Clone)]
pub struct Caches {
    /// Keyed by DID.
    pub profiles: BatchedCache<String, Arc<ProfileView>>,
    /// Keyed by `getAuthorFeed` URL.
    pub feeds: BatchedCache<String, Arc<AuthorFeed>>,
    /// Keyed by audit log URL.
    pub plc: BatchedCache<String, Arc<Vec<PlcAuditEntry>>>,
    /// Keyed by post AT URI.
    pub posts: BatchedCache<String, CompressedJson>,
}

impl Caches {
    /// Counters of every cache since the last call, by cache name.
    pub fn take_stats(&self) -> Vec<(&'static str, CacheStats)> {
        vec![
            (self.profiles.name(), self.profiles.take_stats()),
            (self.feeds.name(), self.feeds.take_stats()),
            (self.plc.name(), self.plc.take_stats()),
            (self.posts.name(), self.posts.take_stats()),
        ]
    }

    /// Scavenge every cache. Returns the number of entries dropped.
    pub fn scavenge(&self) -> usize {
        self.profiles.scavenge() + self.feeds.scavenge() + self.plc.scavenge() + self.posts.scavenge()
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// DID whose labels are ours.
    pub labeler_did: String,
    /// App view serving author feeds.
    pub public_service: String,
    pub plc_directory: String,
    /// How long `newaccount` and `newhandle` apply.
    pub watch_window: Duration,
    pub feed_rules: FeedRuleConfig,
}

/// The commit handler that decides labels.
pub struct LabelingProcessor {
    config: ProcessorConfig,
    caches: Caches,
    sink: Arc<dyn LabelSink>,
}

impl LabelingProcessor {
    pub fn new(config: ProcessorConfig, caches: Caches, sink: Arc<dyn LabelSink>) -> Self {
        Self {
            config,
            caches,
            sink,
        }
    }

    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    fn feed_url(&self, did: &str) -> String {
        author_feed_url(&self.config.public_service, did, self.config.feed_rules.feed_limit)
    }

    fn plc_url(&self, did: &str) -> String {
        plc_audit_url(&self.config.plc_directory, did)
    }

    fn watched_from(&self) -> DateTime<Utc> {
        let window = chrono::Duration::from_std(self.config.watch_window).unwrap_or(chrono::Duration::zero());
        Utc::now() - window
    }

    async fn process_post(&self, event: &CommitEvent) -> Result<()> {
        let key = event.key();
        let did = event.repo.as_str();
        let Some(uri) = event.uri().filter(|u| u.is_post() && u.did == did) else {
            debug!("{}: invalid post path {:?} for {}", key, event.path, did);
            return Ok(());
        };
        let post_uri = uri.to_string();

        // A feed fetched before this post cannot contain it.
        self.caches
            .feeds
            .purge_key(&self.feed_url(did), event.occurred_at.timestamp_millis());

        let Some(profile) = settle(self.caches.profiles.get(&did.to_string()).await, did)? else {
            return Ok(());
        };
        let current = rules::current_labels(&profile, &self.config.labeler_did);
        let watched_from = self.watched_from();

        let mut changes = self.feed_changes(did, &post_uri, watched_from).await?;
        changes.merge(rules::profile_labels(&profile));
        changes.merge(rules::expiring_labels(
            &profile.labels,
            &self.config.labeler_did,
            watched_from,
        ));

        self.submit(event, changes.reconcile(&current)).await
    }

    async fn feed_changes(&self, did: &str, post_uri: &str, watched_from: DateTime<Utc>) -> Result<LabelChanges> {
        let feed_url = self.feed_url(did);
        let Some(feed) = settle(self.caches.feeds.get(&feed_url).await, &feed_url)? else {
            return Ok(LabelChanges::default());
        };

        let handles = if is_plc_did(did) {
            let plc_url = self.plc_url(did);
            settle(self.caches.plc.get(&plc_url).await, &plc_url)?
                .map(|entries| rules::handle_history(&entries))
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let analysis = rules::feed_labels(post_uri, &feed, &handles, watched_from, &self.config.feed_rules);
        let mut changes = analysis.changes;

        if let Some(changed_at) = analysis.stale_feed_since {
            let post = settle(self.caches.posts.get(&post_uri.to_string()).await, post_uri)?;
            match post.map(|compressed| compressed.decode::<PostView>()) {
                Some(Ok(view)) => {
                    if view
                        .indexed_at()
                        .is_some_and(|t| rules::post_after_handle_change(t, changed_at))
                    {
                        changes.create(rules::NEW_HANDLE);
                    }
                }
                Some(Err(e)) => debug!("Unreadable cached post {}: {}", post_uri, e),
                None => {}
            }
        }

        Ok(changes)
    }

    async fn process_profile(&self, event: &CommitEvent) -> Result<()> {
        let did = event.repo.clone();
        self.caches
            .profiles
            .purge_key(&did, event.occurred_at.timestamp_millis());

        let Some(profile) = settle(self.caches.profiles.get(&did).await, &did)? else {
            return Ok(());
        };
        let current = rules::current_labels(&profile, &self.config.labeler_did);

        let mut changes = rules::profile_labels(&profile);
        changes.merge(rules::expiring_labels(
            &profile.labels,
            &self.config.labeler_did,
            self.watched_from(),
        ));

        self.submit(event, changes.reconcile(&current)).await
    }

    fn process_identity(&self, event: &CommitEvent) {
        let before = event.occurred_at.timestamp_millis();
        let purged_profile = self.caches.profiles.purge_key(&event.repo, before);
        let purged_plc = self.caches.plc.purge_key(&self.plc_url(&event.repo), before);
        debug!(
            "{}: identity change for {} (profile purged: {}, plc purged: {})",
            event.key(),
            event.repo,
            purged_profile,
            purged_plc
        );
    }

    async fn submit(&self, event: &CommitEvent, changes: LabelChanges) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let did = event.repo.as_str();
        let scheduled_at = event.occurred_at.timestamp();

        let mut operations = Vec::with_capacity(changes.create.len() + changes.remove.len());
        for label in changes.remove {
            debug!("{}: unlabel {} {}", event.key(), did, label);
            operations.push(LabelOperation {
                scheduled_at,
                ..LabelOperation::remove(label, did, format!("removing {} from {}", label, did))
            });
        }
        for label in changes.create {
            debug!("{}: label {} {}", event.key(), did, label);
            operations.push(LabelOperation {
                scheduled_at,
                ..LabelOperation::create(label, did, format!("creating {} for {}", label, did))
            });
        }

        self.sink.submit(operations).await
    }
}

/// Split a lookup into value, quiet miss, or a retryable timeout.
fn settle<V>(result: std::result::Result<V, LookupError>, what: &str) -> Result<Option<V>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(LookupError::Timeout) => Err(Error::LookupTimeout(what.to_string())),
        Err(e) => {
            debug!("{} fetching {}", e, what);
            Ok(None)
        }
    }
}

#[async_trait]
impl CommitHandler for LabelingProcessor {
    async fn process(&self, event: Arc<CommitEvent>) -> Result<()> {
        match event.record_type {
            RecordType::Post => self.process_post(&event).await,
            RecordType::Profile => self.process_profile(&event).await,
            RecordType::IdentityChange => {
                self.process_identity(&event);
                Ok(())
            }
            RecordType::Other(_) => Ok(()),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::upstream::views::Label;
    use labelwatch_core::{OpAction, POST_COLLECTION, PROFILE_COLLECTION, RecordBody};
    use serde_json::json;

    const DID: &str = "did:plc:abc";

    fn minutes_ago(minutes: i64) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::minutes(minutes)
    }

    fn post_event(sequence: i64, rkey: &str, occurred_at: DateTime<Utc>) -> Arc<CommitEvent> {
        Arc::new(CommitEvent {
            sequence,
            op_index: 0,
            repo: DID.to_string(),
            record_type: RecordType::Post,
            action: OpAction::Create,
            path: Some(format!("{}/{}", POST_COLLECTION, rkey)),
            body: RecordBody::Empty,
            occurred_at,
        })
    }

    fn profile_event(sequence: i64, occurred_at: DateTime<Utc>) -> Arc<CommitEvent> {
        Arc::new(CommitEvent {
            sequence,
            op_index: 0,
            repo: DID.to_string(),
            record_type: RecordType::Profile,
            action: OpAction::Update,
            path: Some(format!("{}/self", PROFILE_COLLECTION)),
            body: RecordBody::Empty,
            occurred_at,
        })
    }

    fn profile(avatar: Option<&str>, display_name: Option<&str>, labels: Vec<Label>) -> ProfileView {
        ProfileView {
            did: DID.to_string(),
            handle: "alice.test".to_string(),
            display_name: display_name.map(String::from),
            avatar: avatar.map(String::from),
            labels,
        }
    }

    fn our_label(val: &str, cts: DateTime<Utc>) -> Label {
        Label {
            src: LABELER.to_string(),
            uri: format!("at://{}", DID),
            val: val.to_string(),
            neg: false,
            cts: cts.to_rfc3339(),
        }
    }

    fn feed(posts: &[(&str, DateTime<Utc>)], complete: bool) -> AuthorFeed {
        let items: Vec<serde_json::Value> = posts
            .iter()
            .rev()
            .map(|(rkey, t)| {
                json!({"post": {
                    "uri": format!("at://{}/{}/{}", DID, POST_COLLECTION, rkey),
                    "indexedAt": t.to_rfc3339(),
                }})
            })
            .collect();
        let cursor = if complete { serde_json::Value::Null } else { json!("next") };
        serde_json::from_value(json!({"feed": items, "cursor": cursor})).unwrap()
    }

    fn pair(action: &str, label: &str) -> (String, String) {
        (action.to_string(), label.to_string())
    }

    // ========================================================================
    // Posts
    // ========================================================================

    #[tokio::test]
    async fn test_first_post_of_new_account() {
        let fx = Fixture::new();
        fx.add_profile(profile(Some("https://cdn/a.jpg"), Some("Alice"), Vec::new()));
        fx.add_feed(DID, feed(&[("first", minutes_ago(1))], true));

        fx.processor
            .process(post_event(1, "first", minutes_ago(1)))
            .await
            .unwrap();

        assert_eq!(fx.labels(), vec![pair("create", rules::NEW_ACCOUNT)]);
        let ops = fx.sink.operations.lock();
        assert_eq!(ops[0].subject, DID);
        assert_eq!(
            ops[0].comment.as_deref(),
            Some("creating newaccount for did:plc:abc")
        );
        assert!(ops[0].scheduled_at > 0);
    }

    #[tokio::test]
    async fn test_existing_labels_not_reapplied_and_stale_ones_removed() {
        let fx = Fixture::new();
        fx.add_profile(profile(
            None,
            Some("Alice"),
            vec![
                our_label(rules::NO_AVATAR, minutes_ago(60)),
                our_label(rules::NO_DISPLAY_NAME, minutes_ago(60)),
                our_label(rules::NEW_ACCOUNT, minutes_ago(30 * 24 * 60)),
            ],
        ));
        fx.add_feed(DID, feed(&[("old", minutes_ago(90)), ("new", minutes_ago(1))], false));

        fx.processor
            .process(post_event(2, "new", minutes_ago(1)))
            .await
            .unwrap();

        assert_eq!(
            fx.labels(),
            vec![
                pair("remove", rules::NEW_ACCOUNT),
                pair("remove", rules::NO_DISPLAY_NAME),
            ]
        );
    }

    #[tokio::test]
    async fn test_new_handle_via_stale_feed_lookup() {
        let fx = Fixture::new();
        fx.add_profile(profile(Some("https://cdn/a.jpg"), Some("Alice"), Vec::new()));
        fx.add_feed(DID, feed(&[("old", minutes_ago(600))], false));
        let entries: Vec<PlcAuditEntry> = serde_json::from_value(json!([
            {"did": DID, "createdAt": minutes_ago(10_000).to_rfc3339(),
             "operation": {"alsoKnownAs": ["at://alice.test"]}},
            {"did": DID, "createdAt": minutes_ago(60).to_rfc3339(),
             "operation": {"alsoKnownAs": ["at://bob.test"]}}
        ]))
        .unwrap();
        fx.add_plc(DID, entries);

        let uri = format!("at://{}/{}/fresh", DID, POST_COLLECTION);
        let view = json!({"uri": uri, "cid": "bafy", "indexedAt": minutes_ago(1).to_rfc3339()});
        fx.posts
            .values
            .lock()
            .insert(uri.clone(), CompressedJson::encode(&view).unwrap());

        fx.processor
            .process(post_event(3, "fresh", minutes_ago(1)))
            .await
            .unwrap();

        assert_eq!(fx.labels(), vec![pair("create", rules::NEW_HANDLE)]);
        assert_eq!(fx.posts.requests_for(&uri), 1);
    }

    #[tokio::test]
    async fn test_missing_profile_is_quiet() {
        let fx = Fixture::new();
        fx.processor
            .process(post_event(4, "x", minutes_ago(1)))
            .await
            .unwrap();
        assert!(fx.labels().is_empty());
        assert_eq!(fx.feeds.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_post_from_foreign_repo_ignored() {
        let fx = Fixture::new();
        let mut event = (*post_event(5, "x", minutes_ago(1))).clone();
        event.path = Some("app.bsky.feed.like/x".to_string());
        fx.processor.process(Arc::new(event)).await.unwrap();
        assert_eq!(fx.profiles.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    // ========================================================================
    // Profiles and identity
    // ========================================================================

    #[tokio::test]
    async fn test_profile_update_refetches_and_labels() {
        let fx = Fixture::new();
        fx.add_profile(profile(None, None, Vec::new()));

        fx.processor
            .process(profile_event(10, minutes_ago(5)))
            .await
            .unwrap();
        assert_eq!(
            fx.labels(),
            vec![
                pair("create", rules::NO_AVATAR),
                pair("create", rules::NO_DISPLAY_NAME),
            ]
        );

        // The account fixes its profile; a newer profile commit sees the change.
        fx.add_profile(profile(
            Some("https://cdn/a.jpg"),
            Some("Alice"),
            vec![
                our_label(rules::NO_AVATAR, minutes_ago(4)),
                our_label(rules::NO_DISPLAY_NAME, minutes_ago(4)),
            ],
        ));
        fx.sink.operations.lock().clear();
        fx.processor
            .process(profile_event(11, Utc::now() + chrono::Duration::seconds(1)))
            .await
            .unwrap();

        assert_eq!(
            fx.labels(),
            vec![
                pair("remove", rules::NO_AVATAR),
                pair("remove", rules::NO_DISPLAY_NAME),
            ]
        );
        assert_eq!(fx.profiles.requests_for(DID), 2);
    }

    #[tokio::test]
    async fn test_identity_change_purges() {
        let fx = Fixture::new();
        fx.add_profile(profile(None, None, Vec::new()));
        fx.add_plc(DID, Vec::new());

        let caches = fx.processor.caches();
        caches.profiles.get(&DID.to_string()).await.unwrap();
        caches.plc.get(&plc_audit_url(PLC, DID)).await.unwrap();

        let event = Arc::new(CommitEvent {
            sequence: 20,
            op_index: 0,
            repo: DID.to_string(),
            record_type: RecordType::IdentityChange,
            action: OpAction::None,
            path: None,
            body: RecordBody::Empty,
            occurred_at: Utc::now() + chrono::Duration::seconds(1),
        });
        fx.processor.process(event).await.unwrap();

        assert!(!caches.profiles.contains(&DID.to_string()));
        assert!(!caches.plc.contains(&plc_audit_url(PLC, DID)));
        assert!(fx.labels().is_empty());
    }
}
