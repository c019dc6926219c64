use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use mp4::{EmsgBox, HandlerType};
use tracing::{debug, trace};

use super::media_state::TrackPhase;
use super::{EngineState, Inner};
use crate::config::{RetryParameters, StreamingConfig};
use crate::decryption;
use crate::error::StreamingError;
use crate::events::{EmsgEvent, EngineEvent, MetadataFrame};
use crate::media::{
    ContentType, InitSegmentReference, SegmentReference, SegmentStatus, Stream, same_init_segment,
};
use crate::net::{NetworkingEngine, PendingRequest, Request, RequestType, Response, StreamDataCallback};
use crate::prefetch::{FetchDispatcher, FetchTarget, SegmentPrefetch};
use crate::sink::{AppendContext, StreamProperties};

/// Rounding can otherwise drop the first frame of a period.
const APPEND_WINDOW_START_FUDGE: f64 = 0.1;
const APPEND_WINDOW_END_FUDGE: f64 = 0.01;

const MANIFEST_UPDATE_SCHEME: &str = "urn:mpeg:dash:event:2012";
const ID3_SCHEMES: [&str; 2] = [
    "https://aomedia.org/emsg/ID3",
    "https://developer.apple.com/streaming/emsg-id3",
];

/// Builds network requests for segment fetches.
pub(crate) struct EngineFetchDispatcher {
    net: NetworkingEngine,
    retry_parameters: RetryParameters,
    low_latency_mode: bool,
}

impl EngineFetchDispatcher {
    pub(crate) fn new(net: NetworkingEngine, config: &StreamingConfig) -> Self {
        Self {
            net,
            retry_parameters: config.retry_parameters.clone(),
            low_latency_mode: config.low_latency_mode,
        }
    }

    /// Fetch `target`, or hand back its in-memory data when it has some.
    pub(crate) fn fetch(
        &self,
        target: FetchTarget<'_>,
        stream: &Arc<Stream>,
        stream_data_callback: Option<StreamDataCallback>,
    ) -> PendingRequest {
        let (uris, start_byte, end_byte, data, request_type, streamable) = match target {
            FetchTarget::Init(init) => (
                init.uris(),
                init.start_byte(),
                init.end_byte(),
                init.segment_data(),
                RequestType::InitSegment,
                false,
            ),
            FetchTarget::Media(reference) => (
                reference.uris(),
                reference.start_byte(),
                reference.end_byte(),
                reference.segment_data(),
                RequestType::MediaSegment,
                self.low_latency_mode && stream.is_mp4() && reference.aes_key().is_none(),
            ),
        };

        if let Some(data) = data {
            return PendingRequest::ready(Ok(Response {
                uri: uris.first().cloned().unwrap_or_default(),
                data: data.clone(),
                status: None,
                headers: HashMap::new(),
            }));
        }

        let mut request = Request::new(uris.to_vec(), self.retry_parameters.clone())
            .with_byte_range(start_byte, end_byte);
        if let Some(callback) = stream_data_callback.filter(|_| streamable) {
            request = request.with_stream_data_callback(callback);
        }
        self.net.request(request_type, request)
    }
}

impl FetchDispatcher for EngineFetchDispatcher {
    fn dispatch(
        &self,
        target: FetchTarget<'_>,
        stream: &Arc<Stream>,
        stream_data_callback: Option<StreamDataCallback>,
    ) -> PendingRequest {
        self.net.metrics().record_prefetch_initiated();
        self.fetch(target, stream, stream_data_callback)
    }
}

/// Everything one fetch-and-append needs, captured when the update picked
/// the segment.
#[derive(Clone)]
pub(super) struct FetchJob {
    pub content_type: ContentType,
    pub stream: Arc<Stream>,
    pub reference: Arc<SegmentReference>,
    /// Position of the segment in its index, used for implicit AES IVs.
    pub position: isize,
    pub presentation_time: f64,
    pub stream_changed: bool,
}

enum FetchOutcome {
    Appended,
    /// A buffer clear was requested meanwhile; the data was dropped.
    ClearPending,
}

enum FetchedMedia {
    Complete(Bytes),
    /// Everything went out through chunked appends.
    Streamed,
}

impl Inner {
    pub(super) async fn fetch_and_append(self: Arc<Self>, job: FetchJob) {
        trace!(
            content_type = %job.content_type,
            start = job.reference.start_time(),
            end = job.reference.end_time(),
            "Fetching segment"
        );
        match self.try_fetch_and_append(&job).await {
            Ok(FetchOutcome::Appended) => {
                self.complete_append(&job);
                self.finish_update(job.content_type).await;
            }
            Ok(FetchOutcome::ClearPending) => {
                self.set_phase(job.content_type, TrackPhase::Idle);
                self.finish_update(job.content_type).await;
            }
            Err(error) => self.handle_fetch_error(&job, error).await,
        }
    }

    async fn try_fetch_and_append(self: &Arc<Self>, job: &FetchJob) -> Result<FetchOutcome, StreamingError> {
        if job.reference.status() == SegmentStatus::Missing {
            return Err(StreamingError::SegmentMissing);
        }

        self.init_source_buffer(job).await?;

        let data = match self.fetch_media(job).await? {
            FetchedMedia::Complete(data) => data,
            FetchedMedia::Streamed => return Ok(FetchOutcome::Appended),
        };
        let data = match job.reference.aes_key() {
            Some(key) => {
                let position = u64::try_from(job.position).unwrap_or_default();
                let data = decryption::decrypt(data, key, position).await?;
                self.metrics.record_decryption();
                data
            }
            None => data,
        };

        if self.clear_pending(job.content_type)? {
            debug!(content_type = %job.content_type, "Dropping fetched segment, buffer clear pending");
            return Ok(FetchOutcome::ClearPending);
        }
        self.append_segment(job, data, false).await?;
        Ok(FetchOutcome::Appended)
    }

    /// Record a successful append and advance the track.
    fn complete_append(&self, job: &FetchJob) {
        {
            let mut state = self.state.lock();
            let Some(ms) = state.media_states.get_mut(&job.content_type) else {
                return;
            };
            ms.last_segment_reference = Some(Arc::clone(&job.reference));
            if let Some(iterator) = ms.segment_iterator.as_mut() {
                if iterator.current().is_some_and(|current| current.id() == job.reference.id()) {
                    iterator.next();
                }
            }
            ms.phase = TrackPhase::Idle;
            ms.recovering = false;
        }
        self.metrics.record_segment_appended(0);
        self.player.on_segment_appended(&job.reference, &job.stream);
    }

    /// After a fetch: perform a pending clear, or schedule the next tick.
    pub(super) async fn finish_update(self: &Arc<Self>, content_type: ContentType) {
        let clear = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            let Some(ms) = state.media_states.get(&content_type) else {
                return;
            };
            let clear = ms.pending_clear.is_some();
            if !clear && ms.update_timer.is_none() {
                self.schedule_update(&mut state, content_type, 0.0);
            }
            clear
        };
        if clear {
            self.clear_buffer(content_type).await;
        }
    }

    pub(super) fn set_phase(&self, content_type: ContentType, phase: TrackPhase) {
        if let Some(ms) = self.state.lock().media_states.get_mut(&content_type) {
            ms.phase = phase;
        }
    }

    /// Whether a buffer clear is waiting. Fails once the track is gone.
    fn clear_pending(&self, content_type: ContentType) -> Result<bool, StreamingError> {
        let state = self.state.lock();
        if state.destroyed {
            return Err(StreamingError::ObjectDestroyed);
        }
        state
            .media_states
            .get(&content_type)
            .map(|ms| ms.pending_clear.is_some())
            .ok_or(StreamingError::ObjectDestroyed)
    }

    /// Apply changed source buffer parameters, append a changed init
    /// segment, and resync at discontinuities in sequence mode.
    async fn init_source_buffer(self: &Arc<Self>, job: &FetchJob) -> Result<(), StreamingError> {
        let content_type = job.content_type;
        let reference = &job.reference;
        let append_window_start = (reference.append_window_start() - APPEND_WINDOW_START_FUDGE).max(0.0);
        let append_window_end = reference.append_window_end() + APPEND_WINDOW_END_FUDGE;
        let codecs = codec_base(reference.codecs().unwrap_or(job.stream.codecs()));
        let mime_type = basic_mime_type(reference.mime_type().unwrap_or(job.stream.mime_type()));
        let timestamp_offset = reference.timestamp_offset();

        let (properties, other_operation, init, prefetch, resync, reinit_text) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.destroyed {
                return Err(StreamingError::ObjectDestroyed);
            }
            let ms = state
                .media_states
                .get_mut(&content_type)
                .ok_or(StreamingError::ObjectDestroyed)?;

            let changed = ms.last_timestamp_offset != Some(timestamp_offset)
                || ms.last_append_window_start != Some(append_window_start)
                || ms.last_append_window_end != Some(append_window_end)
                || ms.last_codecs.as_deref() != Some(codecs.as_str())
                || ms.last_mime_type.as_deref() != Some(mime_type.as_str());
            let mut properties = None;
            let mut reset_needed = false;
            if changed {
                trace!(track = %ms.tag(), timestamp_offset, append_window_start, append_window_end, "Applying stream properties");
                reset_needed = ms.last_codecs.is_some()
                    && ms.last_mime_type.is_some()
                    && self.sink.is_reset_media_source_necessary(content_type, &job.stream);
                ms.last_timestamp_offset = Some(timestamp_offset);
                ms.last_append_window_start = Some(append_window_start);
                ms.last_append_window_end = Some(append_window_end);
                ms.last_codecs = Some(codecs.clone());
                ms.last_mime_type = Some(mime_type.clone());
                properties = Some(StreamProperties {
                    timestamp_offset,
                    append_window_start,
                    append_window_end,
                    mime_type,
                    codecs,
                    stream_changed: job.stream_changed,
                });
            }

            let mut init = None;
            if !same_init_segment(reference.init_segment(), ms.last_init_segment_reference.as_ref()) {
                ms.last_init_segment_reference = reference.init_segment().cloned();
                if reference.is_independent() {
                    init = reference.init_segment().cloned();
                }
            }

            let resync = self.manifest.sequence_mode && {
                let last_sequence = ms
                    .last_segment_reference
                    .as_ref()
                    .map_or(-1, |last| last.discontinuity_sequence());
                reference.discontinuity_sequence() != last_sequence
            };
            let prefetch = ms.segment_prefetch.clone();
            let reinit_text = std::mem::take(&mut ms.reinit_text);

            let other_operation = if reset_needed {
                self.prepare_other_track_for_reset(state, content_type)
            } else {
                None
            };
            (properties, other_operation, init, prefetch, resync, reinit_text)
        };

        if let Some(operation) = other_operation {
            operation.abort_and_wait().await;
        }
        if reinit_text {
            self.sink.reinit_text(&job.stream, self.manifest.sequence_mode).await?;
        }
        if let Some(properties) = properties {
            self.sink.set_stream_properties(content_type, &properties).await?;
        }
        if let Some(init) = init {
            if let Err(error) = self.append_init_segment(job, &init, prefetch.as_deref()).await {
                if let Some(ms) = self.state.lock().media_states.get_mut(&content_type) {
                    ms.last_init_segment_reference = None;
                }
                return Err(error);
            }
        }
        if resync {
            debug!(content_type = %content_type, sequence = reference.discontinuity_sequence(), "Resyncing at discontinuity");
            self.sink.resync(content_type, reference.start_time()).await?;
        }
        Ok(())
    }

    /// Before a sink reset caused by `content_type`, make the paired track
    /// forget its sink state and clear. Returns its aborted operation.
    fn prepare_other_track_for_reset(
        self: &Arc<Self>,
        state: &mut EngineState,
        content_type: ContentType,
    ) -> Option<PendingRequest> {
        let other = match content_type {
            ContentType::Video => ContentType::Audio,
            ContentType::Audio => ContentType::Video,
            ContentType::Text => return None,
        };
        let ms = state.media_states.get_mut(&other)?;
        debug!(track = %ms.tag(), "Sink reset needed, resetting paired track");
        let operation = Self::take_operation(ms);
        ms.last_init_segment_reference = None;
        ms.last_append_window_start = None;
        ms.last_append_window_end = None;
        self.force_clear_buffer(state, other);
        operation
    }

    async fn append_init_segment(
        self: &Arc<Self>,
        job: &FetchJob,
        init: &Arc<InitSegmentReference>,
        prefetch: Option<&SegmentPrefetch>,
    ) -> Result<(), StreamingError> {
        let content_type = job.content_type;
        let dispatcher = Arc::clone(&self.state.lock().dispatcher);
        let request = match prefetch.and_then(|p| p.get_prefetched_init_segment(init)) {
            Some(request) => request,
            None => dispatcher.fetch(FetchTarget::Init(init), &job.stream, None),
        };
        let mut data = self.await_operation(content_type, request).await?.data;
        if let Some(key) = init.aes_key() {
            data = decryption::decrypt(data, key, 0).await?;
            self.metrics.record_decryption();
        }

        if job.stream.is_mp4() {
            let info = mp4::parse_init_segment(&data);
            let handler = match content_type {
                ContentType::Audio => Some(HandlerType::Audio),
                ContentType::Video => Some(HandlerType::Video),
                ContentType::Text => None,
            };
            if let Some(timescale) = handler
                .and_then(|h| info.timescale_for(h))
                .or(info.unassigned_timescale)
            {
                init.set_timescale(timescale);
            }
            if content_type == ContentType::Video {
                self.update_spatial_video_info(info.spatial_video);
            }
        }

        let context = {
            let state = self.state.lock();
            let ms = state
                .media_states
                .get(&content_type)
                .ok_or(StreamingError::ObjectDestroyed)?;
            AppendContext {
                has_closed_captions: job.stream.has_closed_captions(),
                seeked: ms.seeked,
                adaptation: ms.adaptation,
                is_chunked: false,
            }
        };

        debug!(content_type = %content_type, bytes = data.len(), "Appending init segment");
        self.player.before_append_segment(content_type, &data).await?;
        let len = data.len() as u64;
        self.sink
            .append_buffer(content_type, data, None, &job.stream, context)
            .await?;
        self.metrics.record_init_segment_appended(len);
        self.player.on_init_segment_appended(job.reference.start_time(), init);
        Ok(())
    }

    fn update_spatial_video_info(&self, info: mp4::SpatialVideoInfo) {
        let event = {
            let mut state = self.state.lock();
            if state.spatial_video_info == info {
                return;
            }
            state.spatial_video_info = info.clone();
            if info.is_empty() {
                EngineEvent::NoSpatialVideoInfo
            } else {
                EngineEvent::SpatialVideoInfo(info)
            }
        };
        self.player.on_event(event);
    }

    /// Fetch the segment body, from the prefetch cache when possible.
    async fn fetch_media(self: &Arc<Self>, job: &FetchJob) -> Result<FetchedMedia, StreamingError> {
        let (prefetch, dispatcher, low_latency_mode) = {
            let state = self.state.lock();
            let ms = state
                .media_states
                .get(&job.content_type)
                .ok_or(StreamingError::ObjectDestroyed)?;
            (
                ms.segment_prefetch.clone(),
                Arc::clone(&state.dispatcher),
                state.config.low_latency_mode,
            )
        };

        let chunked = low_latency_mode
            && job.stream.is_mp4()
            && job.reference.aes_key().is_none()
            && job.reference.segment_data().is_none();
        let appender = chunked.then(|| Arc::new(ChunkedAppender::new(Arc::downgrade(self), job.clone())));
        let consumer = appender.as_ref().map(ChunkedAppender::callback);

        let mut request = None;
        if let Some(prefetch) = &prefetch {
            request = prefetch.get_prefetched_segment(&job.reference, consumer.clone()).await;
            if request.is_some() {
                trace!(content_type = %job.content_type, start = job.reference.start_time(), "Prefetch hit");
                self.metrics.record_prefetch_hit();
            } else {
                self.metrics.record_prefetch_miss();
            }
        }
        let request = match request {
            Some(request) => request,
            None => dispatcher.fetch(FetchTarget::Media(&job.reference), &job.stream, consumer),
        };

        let response = self.await_operation(job.content_type, request).await?;
        job.reference.mark(SegmentStatus::Available);
        if let Some(appender) = appender {
            if appender.finish().await? {
                return Ok(FetchedMedia::Streamed);
            }
        }
        Ok(FetchedMedia::Complete(response.data))
    }

    /// Track `request` as the in-flight operation of `content_type` and wait
    /// for it.
    async fn await_operation(
        &self,
        content_type: ContentType,
        request: PendingRequest,
    ) -> Result<Response, StreamingError> {
        {
            let mut state = self.state.lock();
            let destroyed = state.destroyed;
            let ms = match state.media_states.get_mut(&content_type) {
                Some(ms) if !destroyed => ms,
                _ => {
                    request.abort();
                    return Err(StreamingError::ObjectDestroyed);
                }
            };
            ms.operation = Some(request.clone());
        }
        let result = request.result().await;
        if let Some(ms) = self.state.lock().media_states.get_mut(&content_type) {
            let same = ms
                .operation
                .as_ref()
                .is_some_and(|op| Arc::ptr_eq(op.progress(), request.progress()));
            if same {
                ms.operation = None;
            }
        }
        result
    }

    /// Parse in-band boxes, evict, and hand `data` to the sink.
    async fn append_segment(self: &Arc<Self>, job: &FetchJob, data: Bytes, is_chunked: bool) -> Result<(), StreamingError> {
        let content_type = job.content_type;
        let (context, dispatch_all_emsg, parse_prft) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.destroyed {
                return Err(StreamingError::ObjectDestroyed);
            }
            let ms = state
                .media_states
                .get_mut(&content_type)
                .ok_or(StreamingError::ObjectDestroyed)?;
            ms.phase = TrackPhase::Appending;
            let context = AppendContext {
                has_closed_captions: job.stream.has_closed_captions(),
                seeked: std::mem::take(&mut ms.seeked),
                adaptation: std::mem::take(&mut ms.adaptation),
                is_chunked,
            };
            let parse_prft =
                state.config.parse_prft_box && !state.prft_reported.contains(&job.stream.id());
            (context, state.config.dispatch_all_emsg_boxes, parse_prft)
        };

        if job.stream.is_mp4() {
            self.handle_in_band_boxes(job, &data, dispatch_all_emsg, parse_prft);
        }

        self.evict(content_type, job.presentation_time).await?;
        self.player.before_append_segment(content_type, &data).await?;

        let len = data.len() as u64;
        trace!(
            content_type = %content_type,
            start = job.reference.start_time(),
            bytes = len,
            chunked = is_chunked,
            "Appending segment"
        );
        self.sink
            .append_buffer(content_type, data, Some(&job.reference), &job.stream, context)
            .await?;
        self.metrics.record_bytes_appended(len);
        Ok(())
    }

    fn handle_in_band_boxes(&self, job: &FetchJob, data: &[u8], dispatch_all_emsg: bool, parse_prft: bool) {
        let stream = &job.stream;
        if dispatch_all_emsg || !stream.emsg_scheme_id_uris().is_empty() {
            for emsg in mp4::parse_emsg_boxes(data) {
                self.dispatch_emsg(job, emsg, dispatch_all_emsg);
            }
        }

        if parse_prft {
            if let Some(prft) = mp4::parse_prft(data) {
                let first = self.state.lock().prft_reported.insert(stream.id());
                if first {
                    self.player.on_event(EngineEvent::ProducerReferenceTime {
                        content_type: job.content_type,
                        stream_id: stream.id(),
                        wall_clock_time_ms: prft.wall_clock_ms(),
                        media_time: prft.media_time,
                    });
                }
            }
        }
    }

    fn dispatch_emsg(&self, job: &FetchJob, emsg: EmsgBox, dispatch_all: bool) {
        let start_time = emsg.start_time(job.reference.start_time(), job.reference.timestamp_offset());
        let end_time = emsg.duration().map_or(f64::INFINITY, |d| start_time + d);

        if emsg.scheme_id_uri == MANIFEST_UPDATE_SCHEME {
            debug!("Manifest update requested in-band");
            self.player.on_manifest_update();
            return;
        }
        if ID3_SCHEMES.contains(&emsg.scheme_id_uri.as_str()) {
            let frame = MetadataFrame {
                scheme_id_uri: emsg.scheme_id_uri,
                start_time,
                end_time,
                data: emsg.message_data,
            };
            self.player.on_metadata(vec![frame], job.content_type);
            return;
        }
        let listed = job
            .stream
            .emsg_scheme_id_uris()
            .iter()
            .any(|uri| *uri == emsg.scheme_id_uri);
        if dispatch_all || listed {
            self.player.on_event(EngineEvent::Emsg(EmsgEvent {
                scheme_id_uri: emsg.scheme_id_uri,
                value: emsg.value,
                start_time,
                end_time,
                timescale: emsg.timescale,
                presentation_time_delta: emsg.presentation_time_delta,
                presentation_time: emsg.presentation_time,
                event_duration: emsg.event_duration,
                id: emsg.id,
                message_data: emsg.message_data,
            }));
        }
    }

    /// Remove buffered content too far behind the playhead.
    pub(super) async fn evict(&self, content_type: ContentType, presentation_time: f64) -> Result<(), StreamingError> {
        let (buffer_behind, eviction_goal) = {
            let state = self.state.lock();
            let buffer_behind = state
                .config
                .buffer_behind
                .max(self.manifest.timeline.max_segment_duration());
            (buffer_behind, state.config.eviction_goal)
        };
        let Some(start) = self.sink.buffer_start(content_type) else {
            return Ok(());
        };
        let buffered_behind = presentation_time - start;
        let overflow = buffered_behind - buffer_behind;
        if overflow <= eviction_goal {
            return Ok(());
        }
        let amount = overflow - eviction_goal;
        debug!(content_type = %content_type, start, amount, "Evicting buffer behind playhead");
        self.sink.remove(content_type, start, start + amount).await
    }

    /// Keep the prefetch cache moving while a segment streams in.
    fn prefetch_after_chunk(&self, job: &FetchJob) {
        let prefetch = {
            let state = self.state.lock();
            state
                .media_states
                .get(&job.content_type)
                .filter(|ms| !state.in_audio_prefetch_map(&ms.stream))
                .and_then(|ms| ms.segment_prefetch.clone())
        };
        if let Some(prefetch) = prefetch {
            prefetch.prefetch_segments_by_time(job.reference.start_time(), true);
        }
    }
}

/// Appends a segment as each `mdat` box completes.
struct ChunkedAppender {
    inner: Weak<Inner>,
    job: FetchJob,
    buffer: tokio::sync::Mutex<BytesMut>,
    appended: AtomicBool,
}

impl ChunkedAppender {
    fn new(inner: Weak<Inner>, job: FetchJob) -> Self {
        Self {
            inner,
            job,
            buffer: tokio::sync::Mutex::new(BytesMut::new()),
            appended: AtomicBool::new(false),
        }
    }

    fn callback(self: &Arc<Self>) -> StreamDataCallback {
        let appender = Arc::clone(self);
        Arc::new(move |chunk: Bytes| {
            let appender = Arc::clone(&appender);
            async move { appender.push(chunk).await }.boxed()
        })
    }

    async fn push(&self, chunk: Bytes) -> Result<(), StreamingError> {
        let inner = self.inner.upgrade().ok_or(StreamingError::ObjectDestroyed)?;
        let mut buffer = self.buffer.lock().await;
        buffer.extend_from_slice(&chunk);
        let Some(end) = mp4::last_complete_mdat_end(&buffer) else {
            return Ok(());
        };
        if inner.clear_pending(self.job.content_type)? {
            return Err(StreamingError::OperationAborted);
        }
        let data = buffer.split_to(end).freeze();
        inner.append_segment(&self.job, data, true).await?;
        self.appended.store(true, Ordering::Release);
        inner.prefetch_after_chunk(&self.job);
        Ok(())
    }

    /// Append whatever trails the last complete box. Returns whether the
    /// segment went out in chunks.
    async fn finish(&self) -> Result<bool, StreamingError> {
        if !self.appended.load(Ordering::Acquire) {
            return Ok(false);
        }
        let inner = self.inner.upgrade().ok_or(StreamingError::ObjectDestroyed)?;
        let mut buffer = self.buffer.lock().await;
        if !buffer.is_empty() {
            let data = buffer.split().freeze();
            inner.append_segment(&self.job, data, true).await?;
        }
        Ok(true)
    }
}

/// `avc1.64001f` -> `avc1`, per comma separated codec.
fn codec_base(codecs: &str) -> String {
    codecs
        .split(',')
        .map(|codec| codec.trim().split('.').next().unwrap_or_default())
        .collect::<Vec<_>>()
        .join(",")
}

/// `video/mp4; codecs="avc1"` -> `video/mp4`.
fn basic_mime_type(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("avc1.64001f", "avc1")]
    #[case("mp4a.40.2,avc1.4d401e", "mp4a,avc1")]
    #[case("wvtt", "wvtt")]
    #[case("", "")]
    fn test_codec_base(#[case] codecs: &str, #[case] expected: &str) {
        assert_eq!(codec_base(codecs), expected);
    }

    #[rstest]
    #[case("video/mp4", "video/mp4")]
    #[case("Video/MP4; codecs=\"avc1\"", "video/mp4")]
    fn test_basic_mime_type(#[case] mime_type: &str, #[case] expected: &str) {
        assert_eq!(basic_mime_type(mime_type), expected);
    }
}
