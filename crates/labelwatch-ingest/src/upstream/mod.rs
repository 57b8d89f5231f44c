//! Upstream HTTP APIs: the app view, the PLC directory, and rate limiting.
//!
//! - [`views`] - response shapes (profiles, feeds, labels, PLC audit entries)
//! - [`fetchers`] - [`BatchFetcher`](crate::cache::BatchFetcher) implementations
//! - [`limiter`] - concurrency and sliding-window rate limits per upstream

pub mod fetchers;
pub mod limiter;
pub mod views;

use std::time::Duration;

pub use fetchers::{JsonUrlFetcher, PostFetcher, ProfileFetcher, author_feed_url, plc_audit_url};
pub use limiter::{RateLimitConfig, RateLimiter};
pub use views::{AuthorFeed, FeedItem, Label, PlcAuditEntry, PostView, ProfileView};

use crate::Result;

/// Shared HTTP client for all upstream calls.
pub fn build_client(user_agent: &str, request_timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(request_timeout)
        .build()?)
}

/// Serve `router` on an ephemeral local port and return its base URL.
#[cfg(test)]
pub(crate) async fn serve_local(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}
