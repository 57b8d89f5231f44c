//! Labelwatch labeling pipeline.
//!
//! This crate consumes the atproto repository firehose, looks up the
//! accounts behind each commit, decides moderation labels, and emits them
//! to an Ozone moderation service.
//!
//! # Modules
//!
//! - [`firehose`] - Stream ingestion (transport, frame decoding, stall detection)
//! - [`cache`] - Batched, coalescing lookup caches
//! - [`upstream`] - HTTP fetchers and rate limiting for the app view and PLC directory
//! - [`queue`] - Bounded-concurrency commit processing with timeouts and retries
//! - [`rules`] - Label decision functions
//! - [`processor`] - The commit handler applying the rules
//! - [`store`] - SQLite persistence for label actions and the resume checkpoint
//! - [`checkpoint`] - Delivered-sequence tracking and periodic persistence
//! - [`emitter`] - Label emission to the moderation API
//! - [`pipeline`] - Session loop, reconnects, and health reporting
//! - [`config`] - Environment configuration and operational limits
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ StreamIngester  │  WebSocket firehose, CBOR frames, stall detection
//! └────────┬────────┘
//!          │ CommitEvent
//!          ▼
//! ┌─────────────────┐
//! │   CommitQueue   │  bounded concurrency, timeouts, retries
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐     ┌──────────────┐
//! │LabelingProcessor│ ◄── │ BatchedCache │  profiles, feeds, PLC logs, posts
//! └────────┬────────┘     └──────────────┘
//!          │ LabelOperation
//!          ▼
//! ┌─────────────────┐
//! │   LabelStore    │  SQLite, buffered inserts
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  LabelEmitter   │  grouped emitEvent calls
//! └─────────────────┘
//! ```
//!
//! Delivery is at-least-once: the checkpoint never passes a commit that is
//! still queued or running, and label writes are idempotent.

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod emitter;
pub mod error;
pub mod firehose;
pub mod pipeline;
pub mod processor;
pub mod queue;
pub mod rules;
pub mod store;
pub mod upstream;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use cache::{BatchFetcher, BatchedCache, CacheConfig, CacheStats, FetchOutcome, LookupError};
pub use checkpoint::{CheckpointTracker, CheckpointWriter};
pub use config::{LabelerConfig, Limits};
pub use emitter::{Credentials, EmitterConfig, LabelEmitter, ModerationApi, OzoneClient};
pub use firehose::{FirehoseConfig, FirehoseStream, StreamIngester, WebSocketConnector};
pub use pipeline::{Labeler, PipelineConfig, PipelineSummary, StatsReporter};
pub use processor::{Caches, LabelingProcessor, ProcessorConfig};
pub use queue::{CommitHandler, CommitQueue, QueueConfig, QueueStats};
pub use store::{LabelSink, LabelStore, PendingConfig, PendingOperations};
