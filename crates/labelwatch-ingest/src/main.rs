//! Labelwatch moderation labeler daemon.
//!
//! Follows the atproto firehose, applies the labeling rules to new posts,
//! profile updates, and identity changes, and emits the resulting labels to
//! the labeler's Ozone service.
//!
//! # Usage
//!
//! ```bash
//! # Credentials and endpoints come from the environment
//! export LABELER_HANDLE=labeler.example.com
//! export LABELER_PASSWORD=app-password
//!
//! # Run with default settings
//! labelwatch
//!
//! # Decide labels without emitting them
//! labelwatch --db-path /data/labels.db --no-emit
//! ```
//!
//! # Graceful Shutdown
//!
//! On SIGINT (Ctrl+C) the daemon:
//! 1. Stops reading the firehose
//! 2. Drains the commit queue (bounded by the processing time limit)
//! 3. Flushes buffered label inserts
//! 4. Writes a final checkpoint below any commit left unfinished
//! 5. Exits cleanly

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use labelwatch_core::metrics::{init_metrics, start_metrics_server};
use labelwatch_ingest::upstream::{
    AuthorFeed, JsonUrlFetcher, PlcAuditEntry, PostFetcher, ProfileFetcher, RateLimiter,
    build_client,
};
use labelwatch_ingest::{
    BatchedCache, Caches, CheckpointTracker, CheckpointWriter, CommitQueue, Credentials,
    EmitterConfig, LabelEmitter, Labeler, LabelerConfig, LabelingProcessor, LabelStore, Limits,
    PendingOperations, PipelineConfig, ProcessorConfig, StatsReporter, StreamIngester,
    WebSocketConnector,
};
use tracing_subscriber::EnvFilter;

/// Labelwatch moderation labeler.
#[derive(Parser, Debug)]
#[command(name = "labelwatch")]
#[command(about = "Firehose moderation labeler")]
#[command(version)]
struct Args {
    /// SQLite database for label actions and the firehose checkpoint
    #[arg(long, default_value = "./data/labels.db")]
    db_path: PathBuf,

    /// Firehose sequence to resume after (overrides the stored checkpoint)
    #[arg(long)]
    cursor: Option<i64>,

    /// Maximum commits processed concurrently
    #[arg(long)]
    max_concurrent_commits: Option<usize>,

    /// Checkpoint write interval in seconds
    #[arg(long)]
    checkpoint_interval_secs: Option<u64>,

    /// Health report interval in seconds
    #[arg(long, default_value = "300")]
    stats_interval_secs: u64,

    /// Decide and store labels but do not emit them
    #[arg(long)]
    no_emit: bool,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "9090")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (required when both ring and aws-lc-rs are present)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("labelwatch_ingest=debug".parse()?),
        )
        .init();

    let args = Args::parse();

    tracing::info!("Labelwatch labeler starting...");

    let config = LabelerConfig::from_env().context("Failed to load labeler configuration")?;
    let mut limits = Limits {
        stats_interval: Duration::from_secs(args.stats_interval_secs.max(1)),
        ..Limits::default()
    };
    if let Some(n) = args.max_concurrent_commits {
        limits.max_concurrent_commits = n;
    }
    if let Some(secs) = args.checkpoint_interval_secs {
        limits.checkpoint_interval = Duration::from_secs(secs);
    }
    limits.validate().context("Invalid limits")?;

    // Initialize metrics
    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle).await?;
    }

    // Set up graceful shutdown
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = Arc::clone(&shutdown);

    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        shutdown_clone.store(true, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    // Storage and resume point
    let store = Arc::new(LabelStore::open(&args.db_path).context("Failed to open label store")?);
    let start = match args.cursor {
        Some(cursor) => Some(cursor),
        None => store.last_sequence()?,
    };

    // Upstream clients
    let user_agent = format!("labelwatch/{}", env!("CARGO_PKG_VERSION"));
    let client = build_client(&user_agent, limits.request_timeout)?;
    let auth_limiter = Arc::new(RateLimiter::new(limits.auth_rate.clone()));
    let pds_limiter = Arc::new(RateLimiter::new(limits.pds_rate.clone()));
    let plc_limiter = Arc::new(RateLimiter::new(limits.plc_rate.clone()));
    let public_limiter = Arc::new(RateLimiter::new(limits.public_rate.clone()));

    let ozone = Arc::new(
        labelwatch_ingest::OzoneClient::new(
            client.clone(),
            &config.labeler_service,
            Credentials {
                identifier: config.handle.clone(),
                password: config.password.clone(),
            },
            auth_limiter,
            pds_limiter,
        )
        .with_labeler_did(config.labeler_did.clone().unwrap_or_default()),
    );
    let labeler_did = ozone
        .labeler_did()
        .await
        .context("Failed to determine the labeler DID")?;

    let caches = Caches {
        profiles: BatchedCache::new(
            limits.cache("profiles", limits.profile_cache_size),
            Arc::new(
                ProfileFetcher::new(client.clone(), &config.public_service, public_limiter.clone())
                    .with_accept_labelers(&labeler_did),
            ),
        ),
        feeds: BatchedCache::new(
            limits.cache("feeds", limits.feed_cache_size),
            Arc::new(JsonUrlFetcher::<AuthorFeed>::new(client.clone(), public_limiter.clone())),
        ),
        plc: BatchedCache::new(
            limits.cache("plc", limits.plc_cache_size),
            Arc::new(JsonUrlFetcher::<Vec<PlcAuditEntry>>::new(client.clone(), plc_limiter)),
        ),
        posts: BatchedCache::new(
            limits.cache("posts", limits.post_cache_size),
            Arc::new(PostFetcher::new(client, &config.public_service, public_limiter)),
        ),
    };

    tracing::info!("Configuration:");
    tracing::info!("  Database: {}", args.db_path.display());
    tracing::info!("  Labeler: {} ({})", config.handle, labeler_did);
    tracing::info!("  Firehose: {}", config.firehose_service);
    tracing::info!("  Resume after: {:?}", start);
    tracing::info!("  Max concurrent commits: {}", limits.max_concurrent_commits);
    tracing::info!("  Watch window: {:?}", config.newhandle_expiry);
    tracing::info!("  Emit: {}", !args.no_emit);

    // Persistence tasks
    let pending = Arc::new(PendingOperations::new(store.clone(), limits.pending()));
    let pending_handle = tokio::spawn(pending.clone().run(shutdown.clone()));

    let queue = Arc::new(CommitQueue::new(limits.queue()));
    let tracker = Arc::new(CheckpointTracker::new(start));
    let checkpoint = Arc::new(
        CheckpointWriter::new(store.clone(), tracker.clone(), limits.checkpoint_interval)
            .with_queue(queue.clone()),
    );
    let checkpoint_handle = tokio::spawn(checkpoint.clone().run(shutdown.clone()));

    // Decision pipeline
    let processor = Arc::new(LabelingProcessor::new(
        ProcessorConfig {
            labeler_did: labeler_did.clone(),
            public_service: config.public_service.clone(),
            plc_directory: config.plc_directory.clone(),
            watch_window: config.newhandle_expiry,
            feed_rules: limits.feed_rules(),
        },
        caches.clone(),
        pending.clone(),
    ));
    let queue_handle = tokio::spawn(queue.clone().run(processor));

    let emitter_handle = if args.no_emit {
        None
    } else {
        let emitter = Arc::new(
            LabelEmitter::new(
                store.clone(),
                ozone,
                EmitterConfig {
                    created_by: labeler_did.clone(),
                    batch_limit: limits.emit_batch,
                    interval: limits.emit_interval,
                },
            )
            .with_profile_cache(caches.profiles.clone()),
        );
        Some(tokio::spawn(emitter.run(shutdown.clone())))
    };

    let reporter = StatsReporter::new(caches, queue.clone(), limits.stats_interval);
    let reporter_handle = tokio::spawn(reporter.run(shutdown.clone()));

    // Run the firehose loop
    tracing::info!("Starting firehose ingestion...");
    let labeler = Labeler::new(
        StreamIngester::new(
            Arc::new(WebSocketConnector::new(&config.firehose_service)),
            limits.firehose(),
        ),
        queue.clone(),
        tracker.clone(),
        PipelineConfig {
            reconnect_delay: limits.reconnect_delay,
            max_reconnect_delay: limits.max_reconnect_delay,
            ..PipelineConfig::default()
        },
    );
    let result = labeler.run(start, shutdown.clone()).await;

    // Shutdown sequence
    tracing::info!("Shutting down...");
    shutdown.store(true, Ordering::SeqCst);
    queue.shutdown();

    match tokio::time::timeout(limits.max_processing_time, queue_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::warn!("Commit queue ended with error: {}", e),
        Ok(Err(e)) => tracing::warn!("Commit queue task panicked: {:?}", e),
        Err(_) => tracing::warn!("Commit queue did not drain within {:?}", limits.max_processing_time),
    }

    if let Err(e) = pending_handle.await {
        tracing::warn!("Pending writer task panicked: {:?}", e);
    }
    if let Err(e) = checkpoint_handle.await {
        tracing::warn!("Checkpoint writer task panicked: {:?}", e);
    }
    // The writer's own final pass may have run before the queue drained.
    if let Err(e) = checkpoint.write_now() {
        tracing::warn!("Failed to write final checkpoint: {}", e);
    }
    if let Some(handle) = emitter_handle {
        if let Err(e) = handle.await {
            tracing::warn!("Emitter task panicked: {:?}", e);
        }
    }
    reporter_handle.abort();

    let queue_stats = queue.stats();

    // Print summary
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    if let Ok(summary) = &result {
        tracing::info!("Firehose sessions:    {}", summary.sessions);
        tracing::info!("Events read:          {}", summary.events);
        tracing::info!("Events submitted:     {}", summary.submitted);
        tracing::info!("Stalls:               {}", summary.stalls);
    }
    tracing::info!("Commits completed:    {}", queue_stats.completed);
    tracing::info!("Commits failed:       {}", queue_stats.failed);
    tracing::info!("Commits timed out:    {}", queue_stats.timeouts);
    tracing::info!("Commits skipped:      {}", queue_stats.skipped);
    tracing::info!("Pending label actions: {}", store.action_count()?);
    tracing::info!("Checkpoint:           {:?}", store.last_sequence()?);
    tracing::info!("═══════════════════════════════════════════════════════");

    result.map(|_| ()).context("Firehose ingestion failed")
}
