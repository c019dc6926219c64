//! In-memory fakes of the engine's collaborators for tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use url::Url;

use crate::error::{Severity, StreamingError};
use crate::events::{EngineEvent, MetadataFrame};
use crate::media::{ContentType, InitSegmentReference, ManifestKind, SegmentReference, Stream};
use crate::net::{Request, RequestContext, RequestType, Response, SchemePlugin};
use crate::player::PlayerInterface;
use crate::sink::{AppendContext, BufferedInfo, MediaSink, StreamProperties, StreamsByType, TimeRanges};

/// What a [`MemoryPlugin`] answers for one URI.
#[derive(Debug, Clone)]
pub enum MemoryResponse {
    Data(Bytes),
    /// Body delivered chunk by chunk.
    Chunks(Vec<Bytes>),
    /// Body delivered after a delay.
    Delayed(Duration, Bytes),
    /// Non-success HTTP status.
    Status(u16),
    /// Never answers.
    Hang,
}

impl MemoryResponse {
    pub fn data(bytes: &[u8]) -> Self {
        Self::Data(Bytes::copy_from_slice(bytes))
    }
}

/// Scheme plugin serving canned responses. Unknown URIs get a 404.
#[derive(Default)]
pub struct MemoryPlugin {
    responses: Mutex<HashMap<String, MemoryResponse>>,
    requests: Mutex<Vec<String>>,
}

impl MemoryPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, uri: &str, response: MemoryResponse) {
        self.responses.lock().insert(uri.to_string(), response);
    }

    /// Every URI requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self, uri: &str) -> usize {
        self.requests.lock().iter().filter(|u| *u == uri).count()
    }
}

#[async_trait]
impl SchemePlugin for MemoryPlugin {
    async fn fetch(
        &self,
        uri: &Url,
        _request: &Request,
        _request_type: RequestType,
        context: &RequestContext,
    ) -> Result<Response, StreamingError> {
        let key = uri.to_string();
        self.requests.lock().push(key.clone());
        let response = self.responses.lock().get(&key).cloned();

        let data = match response {
            None => return Err(StreamingError::BadHttpStatus { uri: key, status: 404 }),
            Some(MemoryResponse::Status(status)) => {
                return Err(StreamingError::BadHttpStatus { uri: key, status });
            }
            Some(MemoryResponse::Hang) => std::future::pending().await,
            Some(MemoryResponse::Data(data)) => {
                context.headers_received(Some(data.len() as u64));
                context.chunk(data.clone()).await?;
                data
            }
            Some(MemoryResponse::Delayed(delay, data)) => {
                context.headers_received(Some(data.len() as u64));
                tokio::time::sleep(delay).await;
                context.chunk(data.clone()).await?;
                data
            }
            Some(MemoryResponse::Chunks(chunks)) => {
                let total = chunks.iter().map(|c| c.len() as u64).sum();
                context.headers_received(Some(total));
                let mut body = BytesMut::new();
                for chunk in chunks {
                    body.extend_from_slice(&chunk);
                    context.chunk(chunk).await?;
                    tokio::task::yield_now().await;
                }
                body.freeze()
            }
        };
        Ok(Response {
            uri: key,
            data,
            status: Some(200),
            headers: HashMap::new(),
        })
    }
}

/// One call made on a [`RecordingSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Init(Vec<ContentType>),
    ReinitText(u32),
    SetDuration(f64),
    Append {
        content_type: ContentType,
        /// `None` for init segments.
        range: Option<(f64, f64)>,
        bytes: usize,
        context: AppendContext,
    },
    Remove(ContentType, f64, f64),
    Clear(ContentType),
    Flush(ContentType),
    EndOfStream,
    SetStreamProperties(ContentType, StreamProperties),
    Reset(Vec<ContentType>),
    Resync(ContentType, f64),
}

#[derive(Default)]
struct SinkState {
    ranges: BTreeMap<ContentType, TimeRanges>,
    calls: Vec<SinkCall>,
    append_failures: HashMap<ContentType, VecDeque<StreamingError>>,
    duration: f64,
    streaming_allowed: bool,
    reset_necessary: bool,
    /// Mime type last applied per content type.
    mime_types: HashMap<ContentType, String>,
}

/// Media sink that models buffered ranges and records every call.
pub struct RecordingSink {
    state: Mutex<SinkState>,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self {
            state: Mutex::new(SinkState {
                streaming_allowed: true,
                ..Default::default()
            }),
        }
    }
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.state.lock().calls.clone()
    }

    pub fn end_of_stream_count(&self) -> usize {
        self.count(|call| matches!(call, SinkCall::EndOfStream))
    }

    pub fn count(&self, predicate: impl Fn(&SinkCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|call| predicate(call)).count()
    }

    /// Start times of the media segments appended for `content_type`.
    pub fn appended_starts(&self, content_type: ContentType) -> Vec<f64> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                SinkCall::Append {
                    content_type: ct,
                    range: Some((start, _)),
                    ..
                } if *ct == content_type => Some(*start),
                _ => None,
            })
            .collect()
    }

    /// Fail the next appends of `content_type` with `error`, in order.
    pub fn fail_appends(&self, content_type: ContentType, errors: impl IntoIterator<Item = StreamingError>) {
        self.state
            .lock()
            .append_failures
            .entry(content_type)
            .or_default()
            .extend(errors);
    }

    /// Mark `[start, end)` as buffered without an append call.
    pub fn set_buffered(&self, content_type: ContentType, start: f64, end: f64) {
        self.state.lock().ranges.entry(content_type).or_default().add(start, end);
    }

    pub fn set_streaming_allowed(&self, allowed: bool) {
        self.state.lock().streaming_allowed = allowed;
    }

    /// Demand a media source reset whenever a track changes mime type.
    pub fn set_reset_necessary(&self, necessary: bool) {
        self.state.lock().reset_necessary = necessary;
    }

    fn record(&self, call: SinkCall) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl MediaSink for RecordingSink {
    async fn init(
        &self,
        streams: &StreamsByType,
        _sequence_mode: bool,
        _manifest_kind: ManifestKind,
        _ignore_manifest_timestamps_in_segments_mode: bool,
    ) -> Result<(), StreamingError> {
        self.record(SinkCall::Init(streams.keys().copied().collect()));
        Ok(())
    }

    async fn reinit_text(&self, stream: &Stream, _sequence_mode: bool) -> Result<(), StreamingError> {
        self.record(SinkCall::ReinitText(stream.id()));
        Ok(())
    }

    async fn set_duration(&self, duration: f64) -> Result<(), StreamingError> {
        let mut state = self.state.lock();
        state.duration = duration;
        state.calls.push(SinkCall::SetDuration(duration));
        Ok(())
    }

    fn duration(&self) -> f64 {
        self.state.lock().duration
    }

    fn is_streaming_allowed(&self) -> bool {
        self.state.lock().streaming_allowed
    }

    fn buffer_start(&self, content_type: ContentType) -> Option<f64> {
        self.state.lock().ranges.get(&content_type)?.start()
    }

    fn buffer_end(&self, content_type: ContentType) -> Option<f64> {
        self.state.lock().ranges.get(&content_type)?.end()
    }

    fn buffered_ahead_of(&self, content_type: ContentType, time: f64) -> f64 {
        self.state
            .lock()
            .ranges
            .get(&content_type)
            .map_or(0.0, |ranges| ranges.ahead_of(time))
    }

    fn is_buffered(&self, content_type: ContentType, time: f64) -> bool {
        self.buffered_ahead_of(content_type, time) > 0.0
    }

    async fn append_buffer(
        &self,
        content_type: ContentType,
        data: Bytes,
        reference: Option<&SegmentReference>,
        _stream: &Stream,
        context: AppendContext,
    ) -> Result<(), StreamingError> {
        let mut state = self.state.lock();
        if let Some(error) = state
            .append_failures
            .get_mut(&content_type)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        let range = reference.map(|r| (r.start_time(), r.end_time()));
        if let Some((start, end)) = range {
            state.ranges.entry(content_type).or_default().add(start, end);
        }
        state.calls.push(SinkCall::Append {
            content_type,
            range,
            bytes: data.len(),
            context,
        });
        Ok(())
    }

    async fn remove(&self, content_type: ContentType, start: f64, end: f64) -> Result<(), StreamingError> {
        let mut state = self.state.lock();
        if let Some(ranges) = state.ranges.get_mut(&content_type) {
            ranges.remove(start, end);
        }
        state.calls.push(SinkCall::Remove(content_type, start, end));
        Ok(())
    }

    async fn clear(&self, content_type: ContentType) -> Result<(), StreamingError> {
        let mut state = self.state.lock();
        state.ranges.remove(&content_type);
        state.calls.push(SinkCall::Clear(content_type));
        Ok(())
    }

    async fn flush(&self, content_type: ContentType) -> Result<(), StreamingError> {
        self.record(SinkCall::Flush(content_type));
        Ok(())
    }

    async fn end_of_stream(&self) -> Result<(), StreamingError> {
        let mut state = self.state.lock();
        // Like MSE, the duration becomes the largest buffered end.
        let end = state
            .ranges
            .values()
            .filter_map(TimeRanges::end)
            .fold(0.0, f64::max);
        if end > 0.0 {
            state.duration = end;
        }
        state.calls.push(SinkCall::EndOfStream);
        Ok(())
    }

    async fn set_stream_properties(
        &self,
        content_type: ContentType,
        properties: &StreamProperties,
    ) -> Result<(), StreamingError> {
        let mut state = self.state.lock();
        state.mime_types.insert(content_type, properties.mime_type.clone());
        state
            .calls
            .push(SinkCall::SetStreamProperties(content_type, properties.clone()));
        Ok(())
    }

    fn is_reset_media_source_necessary(&self, content_type: ContentType, stream: &Stream) -> bool {
        let state = self.state.lock();
        state.reset_necessary
            && state
                .mime_types
                .get(&content_type)
                .is_some_and(|mime_type| mime_type != stream.mime_type())
    }

    async fn reset(&self, streams: &StreamsByType) -> Result<(), StreamingError> {
        let mut state = self.state.lock();
        state.ranges.clear();
        state.calls.push(SinkCall::Reset(streams.keys().copied().collect()));
        Ok(())
    }

    async fn resync(&self, content_type: ContentType, time: f64) -> Result<(), StreamingError> {
        self.record(SinkCall::Resync(content_type, time));
        Ok(())
    }

    fn buffered_info(&self) -> BufferedInfo {
        self.state
            .lock()
            .ranges
            .iter()
            .map(|(ct, ranges)| (*ct, ranges.as_slice().to_vec()))
            .collect()
    }
}

#[derive(Debug)]
struct PlayerState {
    presentation_time: f64,
    bandwidth_estimate: f64,
    playback_rate: f64,
    text_visible: bool,
    disable_streams: bool,
    handle_errors: bool,
    errors: Vec<(StreamingError, Severity)>,
    events: Vec<EngineEvent>,
    appended: Vec<(ContentType, f64)>,
    init_appended: usize,
    disabled: Vec<(u32, f64)>,
    metadata: Vec<MetadataFrame>,
    manifest_updates: usize,
}

/// Player interface whose answers are set by the test and whose
/// notifications are recorded.
pub struct ScriptedPlayer {
    state: Mutex<PlayerState>,
}

impl Default for ScriptedPlayer {
    fn default() -> Self {
        Self {
            state: Mutex::new(PlayerState {
                presentation_time: 0.0,
                bandwidth_estimate: 1_000_000.0,
                playback_rate: 1.0,
                text_visible: true,
                disable_streams: false,
                handle_errors: false,
                errors: Vec::new(),
                events: Vec::new(),
                appended: Vec::new(),
                init_appended: 0,
                disabled: Vec::new(),
                metadata: Vec::new(),
                manifest_updates: 0,
            }),
        }
    }
}

impl ScriptedPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_presentation_time(&self, time: f64) {
        self.state.lock().presentation_time = time;
    }

    pub fn set_bandwidth_estimate(&self, bits_per_second: f64) {
        self.state.lock().bandwidth_estimate = bits_per_second;
    }

    pub fn set_playback_rate(&self, rate: f64) {
        self.state.lock().playback_rate = rate;
    }

    pub fn set_text_visible(&self, visible: bool) {
        self.state.lock().text_visible = visible;
    }

    /// Let `disable_stream` succeed whenever it is given a non-zero time.
    pub fn set_disable_streams(&self, disable: bool) {
        self.state.lock().disable_streams = disable;
    }

    /// What `on_error` answers.
    pub fn set_handle_errors(&self, handle: bool) {
        self.state.lock().handle_errors = handle;
    }

    pub fn errors(&self) -> Vec<(StreamingError, Severity)> {
        self.state.lock().errors.clone()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.state.lock().events.clone()
    }

    /// `(content type, start time)` of every segment reported appended.
    pub fn appended(&self) -> Vec<(ContentType, f64)> {
        self.state.lock().appended.clone()
    }

    pub fn init_appended(&self) -> usize {
        self.state.lock().init_appended
    }

    /// `(stream id, max disabled time)` of every disable request.
    pub fn disabled(&self) -> Vec<(u32, f64)> {
        self.state.lock().disabled.clone()
    }

    pub fn metadata(&self) -> Vec<MetadataFrame> {
        self.state.lock().metadata.clone()
    }

    pub fn manifest_updates(&self) -> usize {
        self.state.lock().manifest_updates
    }
}

#[async_trait]
impl PlayerInterface for ScriptedPlayer {
    fn presentation_time(&self) -> f64 {
        self.state.lock().presentation_time
    }

    fn bandwidth_estimate(&self) -> f64 {
        self.state.lock().bandwidth_estimate
    }

    fn playback_rate(&self) -> f64 {
        self.state.lock().playback_rate
    }

    fn is_text_visible(&self) -> bool {
        self.state.lock().text_visible
    }

    fn on_error(&self, error: &StreamingError, severity: Severity) -> bool {
        let mut state = self.state.lock();
        state.errors.push((error.clone(), severity));
        state.handle_errors
    }

    fn on_event(&self, event: EngineEvent) {
        self.state.lock().events.push(event);
    }

    fn on_manifest_update(&self) {
        self.state.lock().manifest_updates += 1;
    }

    fn on_segment_appended(&self, reference: &SegmentReference, stream: &Stream) {
        self.state
            .lock()
            .appended
            .push((stream.content_type(), reference.start_time()));
    }

    fn on_init_segment_appended(&self, _time: f64, _reference: &InitSegmentReference) {
        self.state.lock().init_appended += 1;
    }

    fn disable_stream(&self, stream: &Arc<Stream>, max_disabled_time: f64) -> bool {
        let mut state = self.state.lock();
        state.disabled.push((stream.id(), max_disabled_time));
        state.disable_streams && max_disabled_time > 0.0
    }

    fn on_metadata(&self, frames: Vec<MetadataFrame>, _content_type: ContentType) {
        self.state.lock().metadata.extend(frames);
    }
}
