//! Label decision rules.
//!
//! Every rule is a pure function over already-fetched upstream data and
//! returns the labels it wants created or removed. The processor fetches the
//! inputs through the caches and reconciles the combined result against the
//! labels the account already carries.

use chrono::{DateTime, Utc};
use labelwatch_core::is_plc_did;

use crate::upstream::views::{AuthorFeed, Label, PlcAuditEntry, ProfileView};

pub const NEW_ACCOUNT: &str = "newaccount";
pub const NEW_HANDLE: &str = "newhandle";
pub const RAPID_POSTS: &str = "rapidposts";
pub const NON_PLC_DID: &str = "nonplcdid";
pub const NO_AVATAR: &str = "noavatar";
pub const NO_DISPLAY_NAME: &str = "nodisplayname";

/// Labels that lapse once older than the watch window.
pub const EXPIRING: [&str; 2] = [NEW_HANDLE, NEW_ACCOUNT];

/// Labels applied again even when already present.
pub const REAPPLIED: [&str; 1] = [NEW_HANDLE];

/// Labels to create and remove. Each list is free of duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelChanges {
    pub create: Vec<&'static str>,
    pub remove: Vec<&'static str>,
}

impl LabelChanges {
    pub fn create(&mut self, label: &'static str) {
        if !self.create.contains(&label) {
            self.create.push(label);
        }
    }

    pub fn remove(&mut self, label: &'static str) {
        if !self.remove.contains(&label) {
            self.remove.push(label);
        }
    }

    pub fn merge(&mut self, other: LabelChanges) {
        for label in other.create {
            self.create(label);
        }
        for label in other.remove {
            self.remove(label);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.remove.is_empty()
    }

    /// Drop creates for labels already present (except [`REAPPLIED`]) and
    /// removes for labels not present.
    pub fn reconcile(mut self, current: &[String]) -> Self {
        let present = |label: &str| current.iter().any(|c| c == label);
        self.create
            .retain(|label| !present(*label) || REAPPLIED.contains(label));
        self.remove.retain(|label| present(*label));
        self
    }
}

/// Values of the active labels this labeler has applied to a profile.
pub fn current_labels(profile: &ProfileView, labeler_did: &str) -> Vec<String> {
    let mut values: Vec<String> = profile
        .labels
        .iter()
        .filter(|l| l.src == labeler_did && !l.neg)
        .map(|l| l.val.clone())
        .collect();
    values.sort();
    values.dedup();
    values
}

// ============================================================================
// Profile rules
// ============================================================================

/// `nonplcdid`, `noavatar`, and `nodisplayname` from a profile view.
pub fn profile_labels(profile: &ProfileView) -> LabelChanges {
    let mut changes = LabelChanges::default();
    if !is_plc_did(&profile.did) {
        changes.create(NON_PLC_DID);
    }
    if profile.has_avatar() {
        changes.remove(NO_AVATAR);
    } else {
        changes.create(NO_AVATAR);
    }
    if profile.has_display_name() {
        changes.remove(NO_DISPLAY_NAME);
    } else {
        changes.create(NO_DISPLAY_NAME);
    }
    changes
}

/// Removes [`EXPIRING`] labels from this labeler created before `watched_from`.
pub fn expiring_labels(labels: &[Label], labeler_did: &str, watched_from: DateTime<Utc>) -> LabelChanges {
    let mut changes = LabelChanges::default();
    if labeler_did.is_empty() {
        return changes;
    }
    for label in labels {
        if label.src != labeler_did || label.neg {
            continue;
        }
        let Some(expiring) = EXPIRING.iter().find(|l| **l == label.val) else {
            continue;
        };
        if label.created_at().is_some_and(|cts| cts < watched_from) {
            changes.remove(*expiring);
        }
    }
    changes
}

// ============================================================================
// Handle history
// ============================================================================

/// A handle an account held from `since` onward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleChange {
    pub handle: String,
    pub since: DateTime<Utc>,
}

/// Distinct consecutive handles from a PLC audit log, oldest first.
///
/// Reading stops at the first operation without aliases (a tombstone).
pub fn handle_history(entries: &[PlcAuditEntry]) -> Vec<HandleChange> {
    let mut ops: Vec<(DateTime<Utc>, &PlcAuditEntry)> = entries
        .iter()
        .filter_map(|e| e.created_at().map(|t| (t, e)))
        .collect();
    ops.sort_by_key(|(t, _)| *t);

    let mut history: Vec<HandleChange> = Vec::new();
    for (since, entry) in ops {
        let Some(aliases) = &entry.operation.also_known_as else {
            break;
        };
        let handle = aliases
            .first()
            .map(|a| a.strip_prefix("at://").unwrap_or(a.as_str()))
            .unwrap_or_default();
        if history.last().is_some_and(|h| h.handle == handle) {
            continue;
        }
        history.push(HandleChange {
            handle: handle.to_string(),
            since,
        });
    }
    history
}

// ============================================================================
// Feed rules
// ============================================================================

/// Inputs for [`feed_labels`].
#[derive(Debug, Clone, Copy)]
pub struct FeedRuleConfig {
    /// Page size requested from `getAuthorFeed`.
    pub feed_limit: usize,
    /// Interval standard deviation below which posting counts as automated.
    pub rapid_post_stdev_ms: f64,
}

impl Default for FeedRuleConfig {
    fn default() -> Self {
        Self {
            feed_limit: 30,
            rapid_post_stdev_ms: 12_000.0,
        }
    }
}

/// Result of the feed-based rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedAnalysis {
    pub changes: LabelChanges,
    /// Set when the account changed handle but the post is missing from a
    /// feed that only shows older posts. Holds the change time; the caller
    /// looks the post up directly and applies [`post_after_handle_change`].
    pub stale_feed_since: Option<DateTime<Utc>>,
}

/// `newaccount`, `newhandle`, and `rapidposts` for the post `post_uri`.
///
/// `handles` is the account's [`handle_history`]; pass an empty slice for
/// accounts without a PLC log.
pub fn feed_labels(
    post_uri: &str,
    feed: &AuthorFeed,
    handles: &[HandleChange],
    watched_from: DateTime<Utc>,
    config: &FeedRuleConfig,
) -> FeedAnalysis {
    let mut analysis = FeedAnalysis::default();

    let mut items: Vec<(DateTime<Utc>, DateTime<Utc>, &str)> = feed
        .feed
        .iter()
        .filter(|item| !item.is_repost())
        .filter_map(|item| {
            let sort_time = item.feed_time()?;
            let post_time = item.post.indexed_at()?;
            Some((sort_time, post_time, item.post.uri.as_str()))
        })
        .collect();
    if items.is_empty() {
        return analysis;
    }
    items.sort_by_key(|(sort_time, _, _)| *sort_time);

    let (_, first_time, first_uri) = items[0];
    if first_uri == post_uri && feed.is_complete() && first_time > watched_from {
        analysis.changes.create(NEW_ACCOUNT);
    }

    if handles.len() > 1 {
        if let Some(current) = handles.last() {
            let changed_at = current.since;
            let mut before_change = false;
            let mut after_change = false;
            let mut found = false;

            for (_, post_time, uri) in &items {
                let is_event_post = *uri == post_uri;
                found |= is_event_post;
                if *post_time < changed_at {
                    before_change = true;
                } else {
                    if before_change && !after_change && *post_time > watched_from && is_event_post {
                        analysis.changes.create(NEW_HANDLE);
                    }
                    after_change = true;
                }
            }

            if !found && before_change && !after_change {
                analysis.stale_feed_since = Some(changed_at);
            }
        }
    }

    let intervals: Vec<f64> = items
        .windows(2)
        .map(|pair| (pair[1].1 - pair[0].1).num_milliseconds() as f64)
        .collect();
    if items.len() == config.feed_limit && intervals.len() > 1 {
        if population_stdev(&intervals) < config.rapid_post_stdev_ms {
            analysis.changes.create(RAPID_POSTS);
        } else {
            analysis.changes.remove(RAPID_POSTS);
        }
    }

    analysis
}

/// Fallback for a stale feed: the post earns `newhandle` if it was indexed
/// after the handle change.
pub fn post_after_handle_change(post_indexed_at: DateTime<Utc>, changed_at: DateTime<Utc>) -> bool {
    post_indexed_at > changed_at
}

fn population_stdev(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}
