//! AT-URI and DID helpers.
//!
//! Records on the network are addressed as `at://<did>/<collection>/<rkey>`.
//! The labeler only needs the three components, so this is a deliberately
//! small parser rather than a full lexicon-aware implementation.

use std::fmt;

use crate::{Error, Result};

/// Collection NSID for posts.
pub const POST_COLLECTION: &str = "app.bsky.feed.post";

/// Collection NSID for profiles.
pub const PROFILE_COLLECTION: &str = "app.bsky.actor.profile";

/// A parsed `at://` record URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtUri {
    /// Repository DID.
    pub did: String,
    /// Collection NSID (e.g. `app.bsky.feed.post`).
    pub collection: String,
    /// Record key.
    pub rkey: String,
}

impl AtUri {
    /// Build a URI from its components.
    pub fn new(did: impl Into<String>, collection: impl Into<String>, rkey: impl Into<String>) -> Self {
        Self {
            did: did.into(),
            collection: collection.into(),
            rkey: rkey.into(),
        }
    }

    /// Parse an `at://did/collection/rkey` string.
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri.strip_prefix("at://").ok_or_else(|| Error::InvalidUri {
            uri: uri.to_string(),
            reason: "missing at:// scheme",
        })?;

        let mut parts = rest.split('/');
        let did = parts.next().unwrap_or_default();
        let collection = parts.next().unwrap_or_default();
        let rkey = parts.next().unwrap_or_default();

        if parts.next().is_some() {
            return Err(Error::InvalidUri {
                uri: uri.to_string(),
                reason: "too many path segments",
            });
        }
        if !is_did(did) {
            return Err(Error::InvalidUri {
                uri: uri.to_string(),
                reason: "authority is not a DID",
            });
        }
        if collection.is_empty() || rkey.is_empty() {
            return Err(Error::InvalidUri {
                uri: uri.to_string(),
                reason: "expected collection and record key",
            });
        }

        Ok(Self::new(did, collection, rkey))
    }

    /// Build the URI for a repository path (`collection/rkey`).
    pub fn from_repo_path(did: &str, path: &str) -> Result<Self> {
        Self::parse(&format!("at://{did}/{path}"))
    }

    /// Whether this URI points at a post record.
    pub fn is_post(&self) -> bool {
        self.collection == POST_COLLECTION
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at://{}/{}/{}", self.did, self.collection, self.rkey)
    }
}

/// Whether a string has the `did:<method>:<identifier>` shape.
pub fn is_did(value: &str) -> bool {
    let mut parts = value.splitn(3, ':');
    matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some("did"), Some(method), Some(id))
            if !method.is_empty()
                && method.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
                && !id.is_empty()
    )
}

/// Whether a DID uses the `did:plc` method (the only method with an audit log).
pub fn is_plc_did(did: &str) -> bool {
    did.starts_with("did:plc:")
}

/// Validate a DID, returning it unchanged on success.
pub fn validate_did(did: &str) -> Result<&str> {
    if is_did(did) {
        Ok(did)
    } else {
        Err(Error::InvalidDid(did.to_string()))
    }
}
