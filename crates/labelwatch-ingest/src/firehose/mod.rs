//! Firehose ingestion.
//!
//! - [`transport`] - subscription transports (WebSocket in production)
//! - [`frame`] - CBOR frame envelope decoding into [`CommitEvent`]s
//! - [`car`] - CAR archive and CID parsing for embedded record blocks
//! - [`stream`] - the backpressured, stall-detecting event stream
//!
//! [`CommitEvent`]: labelwatch_core::CommitEvent

pub mod car;
pub mod frame;
pub mod stream;
pub mod transport;

#[cfg(test)]
pub(crate) mod fixtures;

pub use frame::{DecodedFrame, decode_frame};
pub use stream::{FirehoseConfig, FirehoseStream, StreamIngester, StreamStatsSnapshot};
pub use transport::{FrameTransport, TransportConnector, WebSocketConnector};
