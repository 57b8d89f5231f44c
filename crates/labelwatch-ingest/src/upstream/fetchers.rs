//! [`BatchFetcher`] implementations over the upstream HTTP APIs.
//!
//! | Fetcher            | Endpoint                         | Keys per request |
//! |--------------------|----------------------------------|------------------|
//! | [`ProfileFetcher`] | `app.bsky.actor.getProfiles`     | 25               |
//! | [`PostFetcher`]    | `app.bsky.feed.getPosts`         | 25               |
//! | [`JsonUrlFetcher`] | any JSON GET (author feed, PLC)  | 1                |
//!
//! Errors are classified per key: statuses that will not change on retry
//! (400, 404, 500) become cached failures, everything else (network errors,
//! rate limiting, 5xx overload) leaves the key pending for a later cycle.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::limiter::RateLimiter;
use super::views::ProfileView;
use crate::cache::{BatchFetcher, CompressedJson, FetchOutcome};
use crate::{Error, Result};

/// Keys per `getProfiles` / `getPosts` request.
pub const CHUNK_SIZE: usize = 25;

pub const ACCEPT_LABELERS_HEADER: &str = "atproto-accept-labelers";

/// Map a request error to the outcome recorded for its keys.
pub fn outcome_for_error<V>(error: &Error) -> FetchOutcome<V> {
    match error {
        Error::Status {
            status: status @ (400 | 404 | 500),
            ..
        } => FetchOutcome::Failed(format!("HTTP {}", status)),
        Error::Json(msg) => FetchOutcome::Failed(format!("invalid response: {}", msg)),
        other => FetchOutcome::Transient(other.to_string()),
    }
}

pub(crate) fn xrpc_url(service: &str, method: &str) -> String {
    format!("{}/xrpc/{}", service.trim_end_matches('/'), method)
}

async fn get_json<T: DeserializeOwned>(request: reqwest::RequestBuilder, url: &str) -> Result<T> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::Status {
            status: status.as_u16(),
            url: url.to_string(),
        });
    }
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

// ============================================================================
// Profiles
// ============================================================================

#[derive(Deserialize)]
struct ProfilesResponse {
    #[serde(default)]
    profiles: Vec<ProfileView>,
}

/// Fetches profiles, including labels from the configured labelers.
pub struct ProfileFetcher {
    client: reqwest::Client,
    service: String,
    accept_labelers: Option<String>,
    limiter: Arc<RateLimiter>,
}

impl ProfileFetcher {
    pub fn new(client: reqwest::Client, service: impl Into<String>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            client,
            service: service.into(),
            accept_labelers: None,
            limiter,
        }
    }

    /// Ask the app view to include labels from this labeler DID.
    pub fn with_accept_labelers(mut self, labeler_did: impl Into<String>) -> Self {
        self.accept_labelers = Some(labeler_did.into());
        self
    }

    async fn fetch_chunk(&self, dids: &[String]) -> Result<Vec<ProfileView>> {
        let url = xrpc_url(&self.service, "app.bsky.actor.getProfiles");
        let query: Vec<(&str, &str)> = dids.iter().map(|d| ("actors", d.as_str())).collect();
        let mut request = self.client.get(&url).query(&query);
        if let Some(labelers) = &self.accept_labelers {
            request = request.header(ACCEPT_LABELERS_HEADER, labelers);
        }
        let body: ProfilesResponse = self.limiter.run(get_json(request, &url)).await??;
        Ok(body.profiles)
    }
}

#[async_trait]
impl BatchFetcher<String, Arc<ProfileView>> for ProfileFetcher {
    async fn fetch_batch(&self, keys: &[String]) -> HashMap<String, FetchOutcome<Arc<ProfileView>>> {
        let chunks: Vec<&[String]> = keys.chunks(CHUNK_SIZE).collect();
        let results = join_all(chunks.iter().map(|chunk| self.fetch_chunk(chunk))).await;

        let mut outcomes = HashMap::with_capacity(keys.len());
        for (chunk, result) in chunks.into_iter().zip(results) {
            match result {
                Ok(profiles) => {
                    for profile in profiles {
                        if chunk.contains(&profile.did) {
                            outcomes.insert(profile.did.clone(), FetchOutcome::Found(Arc::new(profile)));
                        }
                    }
                }
                Err(e) => {
                    warn!("getProfiles failed for {} actors: {}", chunk.len(), e);
                    for did in chunk {
                        outcomes.insert(did.clone(), outcome_for_error(&e));
                    }
                }
            }
        }
        outcomes
    }
}

// ============================================================================
// Posts
// ============================================================================

#[derive(Deserialize)]
struct PostsResponse {
    #[serde(default)]
    posts: Vec<serde_json::Value>,
}

/// Fetches post views by AT URI. Views are stored compressed.
pub struct PostFetcher {
    client: reqwest::Client,
    service: String,
    limiter: Arc<RateLimiter>,
}

impl PostFetcher {
    pub fn new(client: reqwest::Client, service: impl Into<String>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            client,
            service: service.into(),
            limiter,
        }
    }

    async fn fetch_chunk(&self, uris: &[String]) -> Result<Vec<serde_json::Value>> {
        let url = xrpc_url(&self.service, "app.bsky.feed.getPosts");
        let query: Vec<(&str, &str)> = uris.iter().map(|u| ("uris", u.as_str())).collect();
        let request = self.client.get(&url).query(&query);
        let body: PostsResponse = self.limiter.run(get_json(request, &url)).await??;
        Ok(body.posts)
    }
}

#[async_trait]
impl BatchFetcher<String, CompressedJson> for PostFetcher {
    async fn fetch_batch(&self, keys: &[String]) -> HashMap<String, FetchOutcome<CompressedJson>> {
        let chunks: Vec<&[String]> = keys.chunks(CHUNK_SIZE).collect();
        let results = join_all(chunks.iter().map(|chunk| self.fetch_chunk(chunk))).await;

        let mut outcomes = HashMap::with_capacity(keys.len());
        for (chunk, result) in chunks.into_iter().zip(results) {
            match result {
                Ok(posts) => {
                    for post in posts {
                        let Some(uri) = post.get("uri").and_then(|u| u.as_str()) else {
                            continue;
                        };
                        if !chunk.iter().any(|k| k == uri) {
                            continue;
                        }
                        let outcome = match CompressedJson::encode(&post) {
                            Ok(compressed) => FetchOutcome::Found(compressed),
                            Err(e) => FetchOutcome::Failed(e.to_string()),
                        };
                        outcomes.insert(uri.to_string(), outcome);
                    }
                }
                Err(e) => {
                    warn!("getPosts failed for {} uris: {}", chunk.len(), e);
                    for uri in chunk {
                        outcomes.insert(uri.clone(), outcome_for_error(&e));
                    }
                }
            }
        }
        outcomes
    }
}

// ============================================================================
// Single-URL JSON
// ============================================================================

/// Fetches one JSON document per key, where the key is the full URL.
pub struct JsonUrlFetcher<T> {
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonUrlFetcher<T> {
    pub fn new(client: reqwest::Client, limiter: Arc<RateLimiter>) -> Self {
        Self {
            client,
            limiter,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T> BatchFetcher<String, Arc<T>> for JsonUrlFetcher<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    async fn fetch_batch(&self, keys: &[String]) -> HashMap<String, FetchOutcome<Arc<T>>> {
        let results = join_all(keys.iter().map(|url| async move {
            let request = self.client.get(url);
            self.limiter
                .run(get_json::<T>(request, url))
                .await
                .and_then(|result| result)
        }))
        .await;

        keys.iter()
            .cloned()
            .zip(results)
            .map(|(url, result)| {
                let outcome = match result {
                    Ok(value) => FetchOutcome::Found(Arc::new(value)),
                    Err(e) => {
                        debug!("{} failed: {}", url, e);
                        outcome_for_error(&e)
                    }
                };
                (url, outcome)
            })
            .collect()
    }
}

/// `getAuthorFeed` URL for the first page of an author's posts and replies.
pub fn author_feed_url(service: &str, did: &str, limit: usize) -> String {
    format!(
        "{}?actor={}&limit={}&filter=posts_with_replies",
        xrpc_url(service, "app.bsky.feed.getAuthorFeed"),
        did,
        limit
    )
}

/// PLC directory audit log URL for a `did:plc`.
pub fn plc_audit_url(directory: &str, did: &str) -> String {
    format!("{}/{}/log/audit", directory.trim_end_matches('/'), did)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::limiter::RateLimitConfig;
    use crate::upstream::serve_local;
    use crate::upstream::views::{AuthorFeed, PostView};
    use axum::extract::{RawQuery, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Calls {
        profiles: AtomicUsize,
        posts: AtomicUsize,
        accept_labelers: parking_lot::Mutex<Vec<String>>,
    }

    fn query_values(query: Option<String>, name: &str) -> Vec<String> {
        let prefix = format!("{}=", name);
        query
            .unwrap_or_default()
            .split('&')
            .filter_map(|pair| pair.strip_prefix(prefix.as_str()))
            .map(|v| v.replace("%3A", ":").replace("%2F", "/"))
            .collect()
    }

    async fn get_profiles(
        State(calls): State<Arc<Calls>>,
        headers: HeaderMap,
        RawQuery(query): RawQuery,
    ) -> (StatusCode, Json<Value>) {
        calls.profiles.fetch_add(1, Ordering::SeqCst);
        if let Some(value) = headers.get(ACCEPT_LABELERS_HEADER).and_then(|v| v.to_str().ok()) {
            calls.accept_labelers.lock().push(value.to_string());
        }
        let actors = query_values(query, "actors");
        if actors.iter().any(|a| a == "did:plc:overloaded") {
            return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({})));
        }
        let profiles: Vec<Value> = actors
            .iter()
            .filter(|did| did.as_str() != "did:plc:missing")
            .map(|did| json!({"did": did, "handle": "someone.test", "displayName": "Someone"}))
            .collect();
        (StatusCode::OK, Json(json!({"profiles": profiles})))
    }

    async fn get_posts(State(calls): State<Arc<Calls>>, RawQuery(query): RawQuery) -> Json<Value> {
        calls.posts.fetch_add(1, Ordering::SeqCst);
        let posts: Vec<Value> = query_values(query, "uris")
            .iter()
            .map(|uri| json!({"uri": uri, "cid": "bafy", "indexedAt": "2024-05-01T12:00:00Z"}))
            .collect();
        Json(json!({"posts": posts}))
    }

    async fn server() -> (String, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let router = Router::new()
            .route("/xrpc/app.bsky.actor.getProfiles", get(get_profiles))
            .route("/xrpc/app.bsky.feed.getPosts", get(get_posts))
            .route(
                "/xrpc/app.bsky.feed.getAuthorFeed",
                get(|| async { Json(json!({"feed": [], "cursor": null})) }),
            )
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
            .route("/busy", get(|| async { StatusCode::TOO_MANY_REQUESTS }))
            .route("/garbage", get(|| async { "not json" }))
            .with_state(calls.clone());
        (serve_local(router).await, calls)
    }

    fn limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(RateLimitConfig::concurrent("test", 8)))
    }

    // ========================================================================
    // Batch fetchers
    // ========================================================================

    #[tokio::test]
    async fn test_profiles_chunked_with_missing_keys() {
        let (base, calls) = server().await;
        let fetcher = ProfileFetcher::new(reqwest::Client::new(), &base, limiter())
            .with_accept_labelers("did:plc:labeler");

        let mut keys: Vec<String> = (0..30).map(|i| format!("did:plc:user{}", i)).collect();
        keys.push("did:plc:missing".to_string());

        let outcomes = fetcher.fetch_batch(&keys).await;
        assert_eq!(calls.profiles.load(Ordering::SeqCst), 2);
        assert_eq!(outcomes.len(), 30);
        assert!(!outcomes.contains_key("did:plc:missing"));
        match &outcomes["did:plc:user7"] {
            FetchOutcome::Found(profile) => {
                assert_eq!(profile.did, "did:plc:user7");
                assert!(profile.has_display_name());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(
            calls
                .accept_labelers
                .lock()
                .iter()
                .all(|v| v == "did:plc:labeler")
        );
    }

    #[tokio::test]
    async fn test_profile_chunk_error_only_affects_its_chunk() {
        let (base, _calls) = server().await;
        let fetcher = ProfileFetcher::new(reqwest::Client::new(), &base, limiter());

        let mut keys: Vec<String> = (0..25).map(|i| format!("did:plc:user{}", i)).collect();
        keys.push("did:plc:overloaded".to_string());
        keys.push("did:plc:late".to_string());

        let outcomes = fetcher.fetch_batch(&keys).await;
        assert!(matches!(outcomes["did:plc:user0"], FetchOutcome::Found(_)));
        assert!(matches!(outcomes["did:plc:overloaded"], FetchOutcome::Transient(_)));
        assert!(matches!(outcomes["did:plc:late"], FetchOutcome::Transient(_)));
    }

    #[tokio::test]
    async fn test_posts_stored_compressed() {
        let (base, calls) = server().await;
        let fetcher = PostFetcher::new(reqwest::Client::new(), &base, limiter());
        let uri = "at://did:plc:abc/app.bsky.feed.post/3k".to_string();

        let outcomes = fetcher.fetch_batch(std::slice::from_ref(&uri)).await;
        assert_eq!(calls.posts.load(Ordering::SeqCst), 1);
        let FetchOutcome::Found(compressed) = &outcomes[&uri] else {
            panic!("post not found");
        };
        let view: PostView = compressed.decode().unwrap();
        assert_eq!(view.uri, uri);
        assert!(view.indexed_at().is_some());
    }

    #[tokio::test]
    async fn test_json_url_outcomes() {
        let (base, _calls) = server().await;
        let fetcher: JsonUrlFetcher<AuthorFeed> = JsonUrlFetcher::new(reqwest::Client::new(), limiter());

        let closed = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            format!("http://{}/gone", listener.local_addr().unwrap())
        };
        let feed = author_feed_url(&base, "did:plc:abc", 30);
        let keys = vec![
            feed.clone(),
            format!("{}/missing", base),
            format!("{}/busy", base),
            format!("{}/garbage", base),
            closed.clone(),
        ];

        let outcomes = fetcher.fetch_batch(&keys).await;
        match &outcomes[&feed] {
            FetchOutcome::Found(feed) => assert!(feed.is_complete()),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(
            outcomes[&format!("{}/missing", base)],
            FetchOutcome::Failed("HTTP 404".to_string())
        );
        assert!(matches!(outcomes[&format!("{}/busy", base)], FetchOutcome::Transient(_)));
        assert!(matches!(outcomes[&format!("{}/garbage", base)], FetchOutcome::Failed(_)));
        assert!(matches!(outcomes[&closed], FetchOutcome::Transient(_)));
    }

    #[test]
    fn test_urls() {
        assert_eq!(
            author_feed_url("https://api.bsky.app/", "did:plc:abc", 30),
            "https://api.bsky.app/xrpc/app.bsky.feed.getAuthorFeed?actor=did:plc:abc&limit=30&filter=posts_with_replies"
        );
        assert_eq!(
            plc_audit_url("https://plc.directory", "did:plc:abc"),
            "https://plc.directory/did:plc:abc/log/audit"
        );
    }
}
