//! Batched, coalescing lookup caches.
//!
//! - [`batched`] - the generic [`BatchedCache`] engine and [`BatchFetcher`] trait
//! - [`expiry`] - jittered expiry times
//! - [`compressed`] - compressed payloads for large cached values

pub mod batched;
pub mod compressed;
pub mod expiry;

pub use batched::{
    BatchFetcher, BatchedCache, CacheConfig, CacheStats, FetchOutcome, LookupError, now_ms,
};
pub use compressed::CompressedJson;
