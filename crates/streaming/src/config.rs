use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StreamingError;

/// Retry and timeout parameters for network requests.
///
/// Delays and timeouts are in milliseconds. A timeout of `0` disables it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryParameters {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Multiplier applied to the delay after every retry.
    pub backoff_factor: f64,
    /// Relative jitter applied to each delay, in `[0, 1]`.
    pub fuzz_factor: f64,
    /// Overall request timeout.
    pub timeout_ms: u64,
    /// Maximum time without receiving body data once the response started.
    pub stall_timeout_ms: u64,
    /// Maximum time to wait for response headers.
    pub connection_timeout_ms: u64,
}

impl Default for RetryParameters {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay_ms: 1000,
            backoff_factor: 2.0,
            fuzz_factor: 0.5,
            timeout_ms: 30_000,
            stall_timeout_ms: 5_000,
            connection_timeout_ms: 10_000,
        }
    }
}

impl RetryParameters {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub(crate) fn stall_timeout(&self) -> Option<Duration> {
        (self.stall_timeout_ms > 0).then(|| Duration::from_millis(self.stall_timeout_ms))
    }

    pub(crate) fn connection_timeout(&self) -> Option<Duration> {
        (self.connection_timeout_ms > 0).then(|| Duration::from_millis(self.connection_timeout_ms))
    }
}

/// Last-resort handler for errors the application did not mark as handled.
#[derive(Clone)]
pub struct FailureCallback(Arc<dyn Fn(&StreamingError) + Send + Sync>);

impl FailureCallback {
    pub fn new(callback: impl Fn(&StreamingError) + Send + Sync + 'static) -> Self {
        Self(Arc::new(callback))
    }

    pub(crate) fn call(&self, error: &StreamingError) {
        (self.0)(error)
    }
}

impl fmt::Debug for FailureCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FailureCallback")
    }
}

/// Streaming engine configuration.
///
/// Times are in seconds unless stated otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Minimum buffer ahead of the playhead before playback may start.
    pub rebuffering_goal: f64,
    /// Amount of content to keep buffered ahead of the playhead.
    pub buffering_goal: f64,
    /// Amount of content to keep buffered behind the playhead.
    pub buffer_behind: f64,
    /// Slack beyond `buffer_behind` tolerated before evicting.
    pub eviction_goal: f64,
    pub retry_parameters: RetryParameters,
    /// Segments fetched ahead per track. `0` disables prefetching.
    pub segment_prefetch_limit: usize,
    /// Audio languages prefetched regardless of the active audio track.
    pub prefetch_audio_languages: Vec<String>,
    pub disable_audio_prefetch: bool,
    pub disable_video_prefetch: bool,
    pub disable_text_prefetch: bool,
    /// Append fMP4 segments chunk by chunk as `mdat` boxes complete.
    pub low_latency_mode: bool,
    /// How long a failing stream is disabled. `0` disables stream disabling.
    pub max_disabled_time: f64,
    pub update_interval_seconds: f64,
    /// Tolerance for manifests whose segment times drift from the media.
    pub inaccurate_manifest_tolerance: f64,
    pub parse_prft_box: bool,
    pub dispatch_all_emsg_boxes: bool,
    pub allow_media_source_recoveries: bool,
    pub min_time_between_recoveries: f64,
    /// Drop the text track instead of failing when it cannot be fetched.
    pub ignore_text_stream_failures: bool,
    /// Stream text even when nothing is currently displaying it.
    pub always_stream_text: bool,
    /// How close to the presentation end counts as "buffered to the end".
    pub end_of_presentation_epsilon: f64,
    #[serde(skip)]
    pub failure_callback: Option<FailureCallback>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            rebuffering_goal: 2.0,
            buffering_goal: 10.0,
            buffer_behind: 30.0,
            eviction_goal: 1.0,
            retry_parameters: RetryParameters::default(),
            segment_prefetch_limit: 1,
            prefetch_audio_languages: Vec::new(),
            disable_audio_prefetch: false,
            disable_video_prefetch: false,
            disable_text_prefetch: false,
            low_latency_mode: false,
            max_disabled_time: 30.0,
            update_interval_seconds: 1.0,
            inaccurate_manifest_tolerance: 2.0,
            parse_prft_box: false,
            dispatch_all_emsg_boxes: false,
            allow_media_source_recoveries: true,
            min_time_between_recoveries: 5.0,
            ignore_text_stream_failures: false,
            always_stream_text: false,
            end_of_presentation_epsilon: 1e-6,
            failure_callback: None,
        }
    }
}

impl StreamingConfig {
    /// Retry parameters for the failure-callback pacing backoff.
    ///
    /// At least two attempts are needed for a delay to ever happen.
    pub(crate) fn failure_retry_parameters(&self) -> RetryParameters {
        RetryParameters {
            max_attempts: self.retry_parameters.max_attempts.max(2),
            timeout_ms: 0,
            stall_timeout_ms: 0,
            connection_timeout_ms: 0,
            ..self.retry_parameters.clone()
        }
    }
}
