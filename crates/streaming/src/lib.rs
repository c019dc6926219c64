//! Adaptive segment streaming engine.
//!
//! Keeps audio, video and text buffers of a [`MediaSink`] filled from a
//! segmented presentation: each track runs its own update loop that picks
//! the next segment, fetches it through the [`NetworkingEngine`] (or a
//! [`SegmentPrefetch`] cache) and appends it, while reacting to switches,
//! seeks, buffer pressure and network failures.
//!
//! ## Component Overview
//!
//! - `backoff`: exponential retry delays with jitter
//! - `net`: scheme plugins, retrying dispatch, cancellable requests
//! - `media`: segment references, segment indexes, streams and manifests
//! - `prefetch`: bounded per-track cache of speculative fetches
//! - `engine`: the per-track state machine
//! - `sink` / `player`: the collaborator traits the engine drives

pub mod backoff;
pub mod config;
pub mod decryption;
mod engine;
pub mod error;
pub mod events;
pub mod media;
pub mod metrics;
pub mod net;
pub mod player;
pub mod prefetch;
pub mod sink;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

pub use backoff::Backoff;
pub use config::{FailureCallback, RetryParameters, StreamingConfig};
pub use engine::{StreamingEngine, TrackPhase};
pub use error::{ErrorCategory, Severity, StreamingError};
pub use events::{EmsgEvent, EngineEvent, MetadataFrame};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use net::{NetworkingEngine, PendingRequest, Request, RequestType, Response, SchemeRegistry};
pub use player::PlayerInterface;
pub use prefetch::{FetchDispatcher, FetchTarget, SegmentPrefetch};
pub use sink::{AppendContext, BufferedInfo, MediaSink, StreamProperties, StreamsByType, TimeRanges};
