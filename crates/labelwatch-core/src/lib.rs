//! Core types and shared utilities for the labelwatch moderation labeler.
//!
//! This crate provides:
//! - The commit event model produced by the firehose ingester
//! - Label operations handed from decision rules to persistence
//! - AT-URI and DID helpers
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
pub mod event;
pub mod metrics;
pub mod uri;

pub use error::{Error, Result};
pub use event::{
    CommitEvent, EventKey, LabelAction, LabelOperation, OpAction, PostRecord, ProfileRecord,
    RecordBody, RecordType,
};
pub use uri::{AtUri, POST_COLLECTION, PROFILE_COLLECTION, is_did, is_plc_did, validate_did};
