//! The streaming engine: one self-rescheduling update loop per content type
//! that picks the next segment, fetches it (from the prefetch cache when
//! possible) and appends it to the [`MediaSink`].
//!
//! All mutable state sits behind one [`parking_lot::Mutex`] that is never
//! held across an `.await`. Every asynchronous step re-validates the track
//! after re-acquiring the lock, since a switch, seek or destroy may have
//! happened in between.

mod fetch;
mod media_state;
mod recovery;
mod switch;
mod update;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::{RetryParameters, StreamingConfig};
use crate::error::StreamingError;
use crate::media::{ContentType, Manifest, Stream, Variant};
use crate::metrics::EngineMetrics;
use crate::net::{NetworkingEngine, PendingRequest};
use crate::player::PlayerInterface;
use crate::prefetch::{FetchDispatcher, SegmentPrefetch};
use crate::sink::{MediaSink, StreamsByType};

pub(crate) use fetch::EngineFetchDispatcher;
use media_state::MediaState;
pub use media_state::TrackPhase;

/// How many maximum-length segments a track may run ahead of the slowest one.
const MAX_RUN_AHEAD_SEGMENTS: f64 = 1.0;

/// Duration pushed to the sink for unbounded presentations.
const LIVE_SINK_DURATION: f64 = 4_294_967_296.0;

/// `seconds` as a [`Duration`]. Negative and NaN values are zero; values too
/// large to represent saturate.
fn duration_from_secs(seconds: f64) -> Duration {
    if seconds.is_nan() || seconds <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
}

const CEA608_MIME_TYPE: &str = "application/cea-608";
const CEA708_MIME_TYPE: &str = "application/cea-708";

/// Closed captions carried inside the video track.
fn is_embedded_captions(stream: &Stream) -> bool {
    stream.content_type() == ContentType::Text
        && (stream.mime_type() == CEA608_MIME_TYPE || stream.mime_type() == CEA708_MIME_TYPE)
}

struct EngineState {
    config: StreamingConfig,
    dispatcher: Arc<EngineFetchDispatcher>,
    media_states: BTreeMap<ContentType, MediaState>,
    current_variant: Option<Variant>,
    current_text_stream: Option<Arc<Stream>>,
    /// Cross-language audio prefetchers keyed by stream id.
    audio_prefetch_map: BTreeMap<u32, (Arc<Stream>, Arc<SegmentPrefetch>)>,
    /// Multiplier on the buffering goal, lowered on quota errors.
    buffering_scale: f64,
    startup_complete: bool,
    fatal_error: bool,
    destroyed: bool,
    /// End of stream was signalled for the current convergence.
    end_of_stream_signalled: bool,
    last_media_source_reset: Option<Instant>,
    next_timer_id: u64,
    /// Bumped on every text load and unload to drop stale loads.
    text_sequence_id: u64,
    prft_reported: HashSet<u32>,
    spatial_video_info: mp4::SpatialVideoInfo,
    /// Failure pacing parameters from the last `configure`, applied to the
    /// failure backoff by the next failure.
    pending_failure_retry: Option<RetryParameters>,
}

impl EngineState {
    fn in_audio_prefetch_map(&self, stream: &Stream) -> bool {
        stream.content_type() == ContentType::Audio && self.audio_prefetch_map.contains_key(&stream.id())
    }
}

pub(crate) struct Inner {
    manifest: Arc<Manifest>,
    player: Arc<dyn PlayerInterface>,
    sink: Arc<dyn MediaSink>,
    net: NetworkingEngine,
    metrics: Arc<EngineMetrics>,
    state: Mutex<EngineState>,
    /// Paces failure reports so a broken stream cannot spin the error path.
    failure_backoff: tokio::sync::Mutex<Backoff>,
}

/// Drives segment acquisition for the tracks of one presentation.
///
/// Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct StreamingEngine {
    inner: Arc<Inner>,
}

impl StreamingEngine {
    pub fn new(
        manifest: Arc<Manifest>,
        player: Arc<dyn PlayerInterface>,
        sink: Arc<dyn MediaSink>,
        net: NetworkingEngine,
    ) -> Self {
        let config = StreamingConfig::default();
        let metrics = Arc::clone(net.metrics());
        let dispatcher = Arc::new(EngineFetchDispatcher::new(net.clone(), &config));
        let failure_backoff = Backoff::new(&config.failure_retry_parameters(), true);
        Self {
            inner: Arc::new(Inner {
                manifest,
                player,
                sink,
                net,
                metrics,
                state: Mutex::new(EngineState {
                    config,
                    dispatcher,
                    media_states: BTreeMap::new(),
                    current_variant: None,
                    current_text_stream: None,
                    audio_prefetch_map: BTreeMap::new(),
                    buffering_scale: 1.0,
                    startup_complete: false,
                    fatal_error: false,
                    destroyed: false,
                    end_of_stream_signalled: false,
                    last_media_source_reset: None,
                    next_timer_id: 0,
                    text_sequence_id: 0,
                    prft_reported: HashSet::new(),
                    spatial_video_info: mp4::SpatialVideoInfo::default(),
                    pending_failure_retry: None,
                }),
                failure_backoff: tokio::sync::Mutex::new(failure_backoff),
            }),
        }
    }

    /// Apply a new configuration. May be called again during playback;
    /// prefetch limits take effect immediately.
    pub fn configure(&self, config: StreamingConfig) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        state.pending_failure_retry = Some(config.failure_retry_parameters());
        let dispatcher = Arc::new(EngineFetchDispatcher::new(inner.net.clone(), &config));
        let limit = config.segment_prefetch_limit;
        state.config = config;
        state.dispatcher = Arc::clone(&dispatcher);

        let types: Vec<ContentType> = state.media_states.keys().copied().collect();
        for content_type in types {
            let existing = state
                .media_states
                .get(&content_type)
                .and_then(|ms| ms.segment_prefetch.clone());
            match existing {
                Some(prefetch) => {
                    prefetch.reset_limit(limit);
                    prefetch.replace_fetch_dispatcher(dispatcher.clone());
                    if limit == 0 {
                        if let Some(ms) = state.media_states.get_mut(&content_type) {
                            ms.segment_prefetch = None;
                        }
                    }
                }
                None if limit > 0 => {
                    let stream = state.media_states.get(&content_type).map(|ms| Arc::clone(&ms.stream));
                    if let Some(stream) = stream {
                        let prefetch = inner.create_segment_prefetch(&state, &stream);
                        if let Some(ms) = state.media_states.get_mut(&content_type) {
                            ms.segment_prefetch = prefetch;
                        }
                    }
                }
                None => {}
            }
        }
        for (_, prefetch) in state.audio_prefetch_map.values() {
            prefetch.replace_fetch_dispatcher(dispatcher.clone());
        }
        inner.update_audio_prefetch_map(&mut state);
    }

    /// Initialise the sink for the current variant and start every track.
    ///
    /// Prefetchers in `prefetch_by_stream` (keyed by stream id) are adopted
    /// by the tracks playing those streams.
    pub async fn start(
        &self,
        mut prefetch_by_stream: HashMap<u32, Arc<SegmentPrefetch>>,
    ) -> Result<(), StreamingError> {
        let inner = &self.inner;
        let streams = {
            let state = inner.state.lock();
            if state.destroyed {
                return Err(StreamingError::ObjectDestroyed);
            }
            let variant = state
                .current_variant
                .as_ref()
                .ok_or(StreamingError::StartupInvalidState)?;
            let mut streams = StreamsByType::new();
            if let Some(audio) = &variant.audio {
                streams.insert(ContentType::Audio, Arc::clone(audio));
            }
            if let Some(video) = &variant.video {
                streams.insert(ContentType::Video, Arc::clone(video));
            }
            if let Some(text) = &state.current_text_stream {
                streams.insert(ContentType::Text, Arc::clone(text));
            }
            streams
        };

        inner
            .sink
            .init(
                &streams,
                inner.manifest.sequence_mode,
                inner.manifest.kind,
                inner.manifest.ignore_manifest_timestamps_in_segments_mode,
            )
            .await?;
        inner.update_duration().await?;

        let mut state = inner.state.lock();
        if state.destroyed {
            return Err(StreamingError::ObjectDestroyed);
        }
        for (content_type, stream) in streams {
            if state.media_states.contains_key(&content_type) {
                continue;
            }
            let prefetch = match prefetch_by_stream.remove(&stream.id()) {
                Some(prefetch) => {
                    prefetch.replace_fetch_dispatcher(state.dispatcher.clone());
                    Some(prefetch)
                }
                None => inner.create_segment_prefetch(&state, &stream),
            };
            debug!(content_type = %content_type, stream_id = stream.id(), "Starting track");
            state
                .media_states
                .insert(content_type, MediaState::new(stream, prefetch));
            inner.schedule_update(&mut state, content_type, 0.0);
        }
        state.startup_complete = true;
        info!(tracks = state.media_states.len(), "Streaming started");
        Ok(())
    }

    /// Switch the audio and video tracks to `variant`.
    ///
    /// Before [`start`](Self::start) this only selects the initial variant.
    pub fn switch_variant(
        &self,
        variant: Variant,
        clear_buffer: bool,
        safe_margin: f64,
        force: bool,
        adaptation: bool,
    ) {
        let mut state = self.inner.state.lock();
        state.current_variant = Some(variant.clone());
        if !state.startup_complete {
            return;
        }
        if let Some(video) = &variant.video {
            self.inner
                .switch_internal(&mut state, Arc::clone(video), clear_buffer, safe_margin, force, adaptation);
        }
        if let Some(audio) = &variant.audio {
            self.inner
                .switch_internal(&mut state, Arc::clone(audio), clear_buffer, safe_margin, force, adaptation);
        }
    }

    /// Switch (or load) the text track.
    pub fn switch_text_stream(&self, stream: Arc<Stream>) {
        let mut state = self.inner.state.lock();
        state.current_text_stream = Some(Arc::clone(&stream));
        if !state.startup_complete {
            return;
        }
        self.inner.switch_internal(&mut state, stream, true, 0.0, false, false);
    }

    pub fn unload_text_stream(&self) {
        self.inner.unload_text_stream();
    }

    /// Engage or disengage the trick mode video stream.
    pub fn set_trick_play(&self, on: bool) {
        let mut state = self.inner.state.lock();
        self.inner.set_trick_play(&mut state, on);
    }

    /// Re-read the playback direction into iterators and prefetchers.
    pub fn update_segment_iterator_reverse(&self) {
        let mut state = self.inner.state.lock();
        self.inner.update_segment_iterator_reverse(&mut state);
    }

    /// React to the playhead having jumped.
    pub fn seeked(&self) {
        self.inner.seeked();
    }

    /// Restart failed tracks after `delay_seconds`. Returns `false` when the
    /// engine is destroyed or hit a fatal error.
    pub fn retry(&self, delay_seconds: f64) -> bool {
        self.inner.retry(delay_seconds)
    }

    /// Reset the sink and restart all audio/video tracks. Unless `force` is
    /// set this is gated by `allow_media_source_recoveries` and rate limited
    /// by `min_time_between_recoveries`.
    pub async fn reset_media_source(&self, force: bool, clear_buffer: bool) -> bool {
        self.inner.reset_media_source(force, clear_buffer).await
    }

    /// Push the presentation duration to the sink.
    pub async fn update_duration(&self) -> Result<(), StreamingError> {
        self.inner.update_duration().await
    }

    /// Abort everything in flight and tear down all tracks. Never fails.
    pub async fn destroy(&self) {
        self.inner.destroy().await;
    }

    pub fn current_variant(&self) -> Option<Variant> {
        self.inner.state.lock().current_variant.clone()
    }

    pub fn current_text_stream(&self) -> Option<Arc<Stream>> {
        self.inner.state.lock().current_text_stream.clone()
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.inner.metrics
    }

    /// Current multiplier applied to the buffering goal.
    pub fn buffering_goal_scale(&self) -> f64 {
        self.inner.state.lock().buffering_scale
    }

    pub fn track_phase(&self, content_type: ContentType) -> Option<TrackPhase> {
        self.inner
            .state
            .lock()
            .media_states
            .get(&content_type)
            .map(|ms| ms.phase)
    }

    /// Stream currently played for `content_type`.
    pub fn active_stream(&self, content_type: ContentType) -> Option<Arc<Stream>> {
        self.inner
            .state
            .lock()
            .media_states
            .get(&content_type)
            .map(|ms| Arc::clone(&ms.stream))
    }

    /// The prefetcher attached to the `content_type` track, if any.
    pub fn segment_prefetch(&self, content_type: ContentType) -> Option<Arc<SegmentPrefetch>> {
        self.inner
            .state
            .lock()
            .media_states
            .get(&content_type)
            .and_then(|ms| ms.segment_prefetch.clone())
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }
}

impl Inner {
    /// A prefetcher for `stream`, reusing the audio map or the track's
    /// current one when they already serve it.
    fn create_segment_prefetch(&self, state: &EngineState, stream: &Arc<Stream>) -> Option<Arc<SegmentPrefetch>> {
        let config = &state.config;
        let disabled = match stream.content_type() {
            ContentType::Audio => config.disable_audio_prefetch,
            ContentType::Video => config.disable_video_prefetch,
            ContentType::Text => config.disable_text_prefetch || is_embedded_captions(stream),
        };
        if disabled {
            return None;
        }
        if let Some((_, prefetch)) = state
            .audio_prefetch_map
            .get(&stream.id())
            .filter(|_| stream.content_type() == ContentType::Audio)
        {
            return Some(Arc::clone(prefetch));
        }
        if let Some(current) = state
            .media_states
            .get(&stream.content_type())
            .and_then(|ms| ms.segment_prefetch.as_ref())
        {
            if Stream::same(&current.stream(), stream) {
                return Some(Arc::clone(current));
            }
        }
        if config.segment_prefetch_limit == 0 {
            return None;
        }
        let reverse = self.player.playback_rate() < 0.0;
        let dispatcher: Arc<dyn FetchDispatcher> = state.dispatcher.clone();
        Some(Arc::new(SegmentPrefetch::new(
            config.segment_prefetch_limit,
            Arc::clone(stream),
            dispatcher,
            reverse,
        )))
    }

    /// Keep one prefetcher per audio stream whose language is configured
    /// for prefetching.
    fn update_audio_prefetch_map(&self, state: &mut EngineState) {
        let limit = state.config.segment_prefetch_limit;
        let languages = state.config.prefetch_audio_languages.clone();
        let wanted = |stream: &Stream| {
            limit > 0 && languages.iter().any(|lang| languages_compatible(stream.language(), lang))
        };

        for audio in self.manifest.audio_streams() {
            let existing = state
                .audio_prefetch_map
                .get(&audio.id())
                .map(|(_, prefetch)| Arc::clone(prefetch));
            if let Some(prefetch) = existing {
                prefetch.reset_limit(limit);
                if !wanted(&audio) {
                    let in_use = state
                        .media_states
                        .get(&ContentType::Audio)
                        .and_then(|ms| ms.segment_prefetch.as_ref())
                        .is_some_and(|current| Arc::ptr_eq(current, &prefetch));
                    if !in_use {
                        prefetch.clear_all();
                    }
                    state.audio_prefetch_map.remove(&audio.id());
                }
                continue;
            }
            if !wanted(&audio) {
                continue;
            }
            let Some(prefetch) = self.create_segment_prefetch(state, &audio) else {
                continue;
            };
            if let (None, Ok(runtime)) = (audio.segment_index(), tokio::runtime::Handle::try_current()) {
                let stream = Arc::clone(&audio);
                runtime.spawn(async move {
                    if let Err(error) = stream.create_segment_index().await {
                        warn!(stream_id = stream.id(), error = %error, "Failed to index prefetched audio stream");
                    }
                });
            }
            debug!(stream_id = audio.id(), language = audio.language(), "Prefetching audio language");
            state.audio_prefetch_map.insert(audio.id(), (audio, prefetch));
        }
    }

    async fn update_duration(&self) -> Result<(), StreamingError> {
        let duration = self.manifest.timeline.duration();
        let duration = if duration.is_finite() {
            duration
        } else {
            LIVE_SINK_DURATION
        };
        self.sink.set_duration(duration).await
    }

    /// Abort `ms`'s in-flight operation, returning it so the caller can wait
    /// for it outside the lock.
    fn take_operation(ms: &mut MediaState) -> Option<PendingRequest> {
        let operation = ms.operation.take()?;
        operation.abort();
        Some(operation)
    }

    async fn destroy(&self) {
        let operations = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            let mut operations = Vec::new();
            for ms in state.media_states.values_mut() {
                ms.cancel_update();
                operations.extend(Self::take_operation(ms));
                if let Some(prefetch) = ms.segment_prefetch.take() {
                    prefetch.clear_all();
                }
            }
            for (_, prefetch) in state.audio_prefetch_map.values() {
                prefetch.clear_all();
            }
            operations
        };

        for operation in operations {
            operation.abort_and_wait().await;
        }

        let mut state = self.state.lock();
        state.media_states.clear();
        state.audio_prefetch_map.clear();
        drop(state);
        self.metrics.log_summary();
        debug!("Streaming engine destroyed");
    }
}

/// Whether two language tags share their primary subtag.
fn languages_compatible(a: &str, b: &str) -> bool {
    let primary = |tag: &str| tag.split(['-', '_']).next().unwrap_or_default().to_ascii_lowercase();
    !a.is_empty() && primary(a) == primary(b)
}
