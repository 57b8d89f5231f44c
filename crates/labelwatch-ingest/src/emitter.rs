//! Emits stored label actions to the moderation service.
//!
//! Every interval the [`LabelEmitter`] reads the due actions, folds them into
//! one [`LabelGroup`] per subject, and sends each group as a single
//! `tools.ozone.moderation.emitEvent` call. Sent actions are deleted; failed
//! ones stay in the store and go out on a later pass.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use labelwatch_core::LabelAction;
use labelwatch_core::metrics::increment;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{BatchedCache, now_ms};
use crate::store::{LabelStore, StoredAction};
use crate::upstream::fetchers::xrpc_url;
use crate::upstream::{ProfileView, RateLimiter};
use crate::{Error, Result};

pub const MOD_EVENT_LABEL: &str = "tools.ozone.moderation.defs#modEventLabel";
pub const REPO_REF: &str = "com.atproto.admin.defs#repoRef";
pub const PROXY_HEADER: &str = "atproto-proxy";

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModEventLabel {
    #[serde(rename = "$type")]
    pub kind: String,
    pub create_label_vals: Vec<String>,
    pub negate_label_vals: Vec<String>,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    #[serde(rename = "$type")]
    pub kind: String,
    pub did: String,
}

/// Body of `tools.ozone.moderation.emitEvent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitEventInput {
    pub event: ModEventLabel,
    pub subject: RepoRef,
    /// Empty means the authenticated account.
    pub created_by: String,
}

// ============================================================================
// Grouping
// ============================================================================

/// Due actions for one subject, folded into a single event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelGroup {
    pub subject: String,
    pub create: Vec<String>,
    pub negate: Vec<String>,
    pub comments: Vec<String>,
    /// Store ids covered by this group.
    pub ids: Vec<i64>,
    /// Time of the last folded action in ms.
    pub timestamp_ms: i64,
}

impl LabelGroup {
    fn new(subject: &str) -> Self {
        Self {
            subject: subject.to_string(),
            create: Vec::new(),
            negate: Vec::new(),
            comments: Vec::new(),
            ids: Vec::new(),
            timestamp_ms: 0,
        }
    }

    fn fold(&mut self, action: &StoredAction, now_ms: i64) {
        self.ids.push(action.id);
        let (add_to, cancel) = match action.action {
            LabelAction::Create => (&mut self.create, &mut self.negate),
            LabelAction::Remove => (&mut self.negate, &mut self.create),
        };
        cancel.retain(|l| *l != action.label);
        if !add_to.contains(&action.label) {
            add_to.push(action.label.clone());
        }
        if let Some(comment) = action.comment.as_deref().filter(|c| !c.is_empty()) {
            self.comments.push(comment.to_string());
        }
        self.timestamp_ms = if action.scheduled_at > 0 {
            action.scheduled_at * 1000
        } else {
            now_ms
        };
    }

    pub fn label_count(&self) -> usize {
        self.create.len() + self.negate.len()
    }

    pub fn comment(&self) -> String {
        let seen_at = DateTime::<Utc>::from_timestamp_millis(self.timestamp_ms)
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_default();
        format!("{} seen at: {}", self.comments.join(", "), seen_at)
            .trim()
            .to_string()
    }

    pub fn to_input(&self, created_by: &str) -> EmitEventInput {
        EmitEventInput {
            event: ModEventLabel {
                kind: MOD_EVENT_LABEL.to_string(),
                create_label_vals: self.create.clone(),
                negate_label_vals: self.negate.clone(),
                comment: self.comment(),
            },
            subject: RepoRef {
                kind: REPO_REF.to_string(),
                did: self.subject.clone(),
            },
            created_by: created_by.to_string(),
        }
    }
}

/// Fold actions (in store order) into one group per subject.
///
/// A later action cancels an earlier opposite one for the same label.
pub fn group_actions(actions: &[StoredAction], now_ms: i64) -> Vec<LabelGroup> {
    let mut groups: Vec<LabelGroup> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for action in actions {
        let slot = *index.entry(action.subject.as_str()).or_insert_with(|| {
            groups.push(LabelGroup::new(&action.subject));
            groups.len() - 1
        });
        groups[slot].fold(action, now_ms);
    }
    groups
}

// ============================================================================
// Moderation API
// ============================================================================

/// Destination for label events.
#[async_trait]
pub trait ModerationApi: Send + Sync {
    async fn emit_event(&self, input: &EmitEventInput) -> Result<()>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Session {
    access_jwt: String,
    did: String,
}

/// Credentials for `com.atproto.server.createSession`.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub identifier: String,
    pub password: String,
}

/// Ozone client authenticating against the labeler's PDS.
pub struct OzoneClient {
    client: reqwest::Client,
    service: String,
    credentials: Credentials,
    labeler_did: Option<String>,
    auth_limiter: Arc<RateLimiter>,
    limiter: Arc<RateLimiter>,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl OzoneClient {
    pub fn new(
        client: reqwest::Client,
        service: impl Into<String>,
        credentials: Credentials,
        auth_limiter: Arc<RateLimiter>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            client,
            service: service.into(),
            credentials,
            labeler_did: None,
            auth_limiter,
            limiter,
            session: tokio::sync::Mutex::new(None),
        }
    }

    /// Proxy requests to this labeler instead of the session's account.
    pub fn with_labeler_did(mut self, did: impl Into<String>) -> Self {
        self.labeler_did = Some(did.into()).filter(|d: &String| !d.is_empty());
        self
    }

    /// The labeler DID, logging in to learn it when not configured.
    pub async fn labeler_did(&self) -> Result<String> {
        if let Some(did) = &self.labeler_did {
            return Ok(did.clone());
        }
        Ok(self.session(false).await?.did)
    }

    async fn session(&self, refresh: bool) -> Result<Session> {
        let mut session = self.session.lock().await;
        if !refresh {
            if let Some(current) = session.as_ref() {
                return Ok(current.clone());
            }
        }
        let fresh = self.auth_limiter.run(self.create_session()).await??;
        info!("Logged in to {} as {}", self.service, fresh.did);
        *session = Some(fresh.clone());
        Ok(fresh)
    }

    async fn create_session(&self) -> Result<Session> {
        let url = xrpc_url(&self.service, "com.atproto.server.createSession");
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "identifier": self.credentials.identifier,
                "password": self.credentials.password,
            }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Auth(format!(
                "createSession for {} returned HTTP {}",
                self.credentials.identifier,
                status.as_u16()
            )));
        }
        Ok(response.json::<Session>().await?)
    }

    async fn send(&self, session: &Session, input: &EmitEventInput) -> Result<reqwest::StatusCode> {
        let url = xrpc_url(&self.service, "tools.ozone.moderation.emitEvent");
        let labeler = self.labeler_did.as_deref().unwrap_or(&session.did);

        let mut body = input.clone();
        if body.created_by.is_empty() {
            body.created_by = labeler.to_string();
        }

        let request = self
            .client
            .post(&url)
            .bearer_auth(&session.access_jwt)
            .header(PROXY_HEADER, format!("{}#atproto_labeler", labeler))
            .json(&body);
        let response = self.limiter.run(request.send()).await??;
        Ok(response.status())
    }
}

#[async_trait]
impl ModerationApi for OzoneClient {
    async fn emit_event(&self, input: &EmitEventInput) -> Result<()> {
        let url = xrpc_url(&self.service, "tools.ozone.moderation.emitEvent");
        let session = self.session(false).await?;
        let mut status = self.send(&session, input).await?;

        if status == reqwest::StatusCode::UNAUTHORIZED {
            debug!("Session rejected, logging in again");
            let session = self.session(true).await?;
            status = self.send(&session, input).await?;
        }

        if !status.is_success() {
            return Err(Error::Status {
                status: status.as_u16(),
                url,
            });
        }
        Ok(())
    }
}

// ============================================================================
// Emitter
// ============================================================================

#[derive(Debug, Clone)]
pub struct EmitterConfig {
    /// Value of `createdBy`; empty lets the API client fill it in.
    pub created_by: String,
    /// Actions read per pass.
    pub batch_limit: usize,
    pub interval: Duration,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            created_by: String::new(),
            batch_limit: 1000,
            interval: Duration::from_secs(1),
        }
    }
}

/// Result of one [`LabelEmitter::emit_due`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitSummary {
    pub events: usize,
    pub labels: usize,
    pub failed: usize,
}

pub struct LabelEmitter {
    store: Arc<LabelStore>,
    api: Arc<dyn ModerationApi>,
    profiles: Option<BatchedCache<String, Arc<ProfileView>>>,
    config: EmitterConfig,
}

impl LabelEmitter {
    pub fn new(store: Arc<LabelStore>, api: Arc<dyn ModerationApi>, config: EmitterConfig) -> Self {
        Self {
            store,
            api,
            profiles: None,
            config,
        }
    }

    /// Purge emitted subjects from this cache so the next lookup sees the new labels.
    pub fn with_profile_cache(mut self, profiles: BatchedCache<String, Arc<ProfileView>>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    /// Emit everything due now.
    pub async fn emit_due(&self) -> Result<EmitSummary> {
        let now = now_ms();
        let actions = self.store.due_actions(now / 1000, self.config.batch_limit)?;
        if actions.is_empty() {
            return Ok(EmitSummary::default());
        }

        let mut summary = EmitSummary::default();
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();

        for group in group_actions(&actions, now) {
            if let Err(e) = self.api.emit_event(&group.to_input(&self.config.created_by)).await {
                warn!("Failed to emit labels for {}: {}", group.subject, e);
                increment("labels_emit_errors_total", 1);
                summary.failed += 1;
                continue;
            }

            self.store.delete_actions(&group.ids)?;
            if let Some(profiles) = &self.profiles {
                profiles.purge_key(&group.subject, group.timestamp_ms + 1000);
            }

            for label in group.create.iter().chain(group.negate.iter()) {
                *counts.entry(label.clone()).or_default() += 1;
            }
            summary.events += 1;
            summary.labels += group.label_count();
        }

        if summary.labels > 0 {
            increment("labels_emitted_total", summary.labels as u64);
            let breakdown: Vec<String> = counts
                .iter()
                .map(|(label, count)| format!("{} x {}", count, label))
                .collect();
            info!(
                "emitted {} labels in {} events: {}",
                summary.labels,
                summary.events,
                breakdown.join(", ")
            );
        }
        Ok(summary)
    }

    /// Emit every interval until `shutdown` is set.
    pub async fn run(self: Arc<Self>, shutdown: Arc<AtomicBool>) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !shutdown.load(Ordering::Relaxed) {
            interval.tick().await;
            if let Err(e) = self.emit_due().await {
                warn!("Label emission pass failed: {}", e);
            }
        }
        debug!("Label emitter stopped");
    }
}
