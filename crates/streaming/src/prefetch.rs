// Segment prefetch: a bounded per-track cache of speculative fetches.
//
// The cache holds at most `limit` media segment operations (init segments are
// tracked separately and never count toward the limit). A cached operation
// leaves the cache when it is handed out; from then on its owner decides
// whether it is aborted. Entries still cached are aborted when playback passes
// them, when the stream changes, or when the limit shrinks.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::StreamingError;
use crate::media::{
    InitSegmentKey, InitSegmentReference, SegmentId, SegmentReference, SegmentStatus, Stream,
};
use crate::net::{PendingRequest, StreamDataCallback};

/// What a prefetch or direct fetch is for.
#[derive(Debug, Clone, Copy)]
pub enum FetchTarget<'a> {
    Init(&'a Arc<InitSegmentReference>),
    Media(&'a Arc<SegmentReference>),
}

/// Starts fetches on behalf of a prefetch cache.
pub trait FetchDispatcher: Send + Sync {
    fn dispatch(
        &self,
        target: FetchTarget<'_>,
        stream: &Arc<Stream>,
        stream_data_callback: Option<StreamDataCallback>,
    ) -> PendingRequest;
}

#[derive(Default)]
struct ChunkState {
    buffer: BytesMut,
    consumer: Option<StreamDataCallback>,
}

/// One dispatched prefetch: the request plus the chunks received before a
/// consumer attached.
pub struct SegmentPrefetchOperation {
    request: PendingRequest,
    chunks: Arc<tokio::sync::Mutex<ChunkState>>,
}

impl SegmentPrefetchOperation {
    fn dispatch(
        dispatcher: &dyn FetchDispatcher,
        target: FetchTarget<'_>,
        stream: &Arc<Stream>,
    ) -> Self {
        let chunks = Arc::new(tokio::sync::Mutex::new(ChunkState::default()));
        let sink = Arc::clone(&chunks);
        let callback: StreamDataCallback = Arc::new(move |chunk: Bytes| {
            let sink = Arc::clone(&sink);
            async move {
                let mut state = sink.lock().await;
                match state.consumer.clone() {
                    Some(consumer) => consumer(chunk).await,
                    None => {
                        state.buffer.extend_from_slice(&chunk);
                        Ok(())
                    }
                }
            }
            .boxed()
        });
        let request = dispatcher.dispatch(target, stream, Some(callback));
        Self { request, chunks }
    }

    /// Route all further chunks to `consumer`, first handing it whatever
    /// was buffered so far.
    async fn attach(&self, consumer: StreamDataCallback) -> Result<(), StreamingError> {
        let mut state = self.chunks.lock().await;
        if !state.buffer.is_empty() {
            let buffered = state.buffer.split().freeze();
            consumer(buffered).await?;
        }
        state.consumer = Some(consumer);
        Ok(())
    }

    fn abort(&self) {
        self.request.abort();
    }
}

struct PrefetchedSegment {
    reference: Arc<SegmentReference>,
    operation: Arc<SegmentPrefetchOperation>,
}

struct PrefetchState {
    limit: usize,
    stream: Arc<Stream>,
    dispatcher: Arc<dyn FetchDispatcher>,
    /// Insertion ordered, oldest first.
    segments: Vec<PrefetchedSegment>,
    init_segments: HashMap<InitSegmentKey, Arc<SegmentPrefetchOperation>>,
    /// Start time of the last segment considered for prefetching. Nothing at
    /// or behind it is dispatched again.
    prefetch_pos_time: Option<f64>,
    reverse: bool,
}

impl PrefetchState {
    fn contains(&self, id: SegmentId) -> bool {
        self.segments.iter().any(|s| s.reference.id() == id)
    }

    fn prefetch_init_segment(&mut self, reference: &Arc<InitSegmentReference>) {
        if self.limit == 0 {
            return;
        }
        let key = reference.key();
        if self.init_segments.contains_key(&key) {
            return;
        }
        trace!(uri = ?reference.uris().first(), "Prefetching init segment");
        let operation = SegmentPrefetchOperation::dispatch(
            self.dispatcher.as_ref(),
            FetchTarget::Init(reference),
            &self.stream,
        );
        self.init_segments.insert(key, Arc::new(operation));
    }

    /// Abort init segment fetches no cached media segment needs.
    fn clear_init_segments(&mut self) {
        let segments = &self.segments;
        self.init_segments.retain(|key, operation| {
            let used = segments.iter().any(|s| {
                s.reference
                    .init_segment()
                    .is_some_and(|init| &init.key() == key)
            });
            if !used {
                operation.abort();
            }
            used
        });
    }

    fn clear_all(&mut self) {
        for segment in self.segments.drain(..) {
            segment.operation.abort();
        }
        for (_, operation) in self.init_segments.drain() {
            operation.abort();
        }
        self.prefetch_pos_time = None;
    }

    fn behind_watermark(&self, reference: &SegmentReference) -> bool {
        self.prefetch_pos_time.is_some_and(|pos| {
            if self.reverse {
                reference.start_time() >= pos
            } else {
                reference.start_time() <= pos
            }
        })
    }
}

/// Bounded lookahead cache of dispatched segment fetches for one stream.
///
/// Cheap to share: all methods take `&self`.
pub struct SegmentPrefetch {
    state: Mutex<PrefetchState>,
}

impl SegmentPrefetch {
    pub fn new(limit: usize, stream: Arc<Stream>, dispatcher: Arc<dyn FetchDispatcher>, reverse: bool) -> Self {
        Self {
            state: Mutex::new(PrefetchState {
                limit,
                stream,
                dispatcher,
                segments: Vec::new(),
                init_segments: HashMap::new(),
                prefetch_pos_time: None,
                reverse,
            }),
        }
    }

    /// Dispatch fetches for the segments from `time` (or from the last
    /// prefetched position, whichever is further along) until the cache is
    /// full.
    pub fn prefetch_segments_by_time(&self, time: f64, skip_first: bool) {
        let mut state = self.state.lock();
        if state.limit == 0 {
            return;
        }
        let Some(index) = state.stream.segment_index() else {
            debug!(stream_id = state.stream.id(), "Segment index missing, nothing to prefetch");
            return;
        };

        let lookup_time = match state.prefetch_pos_time {
            None => time,
            Some(pos) if state.reverse => time.min(pos),
            Some(pos) => time.max(pos),
        };
        let Some(mut iterator) = index.iterator_for_time(lookup_time, true, state.reverse) else {
            return;
        };
        let mut next = iterator.next();
        if skip_first {
            next = iterator.next();
        }

        while state.segments.len() < state.limit {
            let Some(reference) = next else {
                break;
            };
            let allowed = !(reference.is_preload() && reference.end_byte().is_some())
                && reference.status() != SegmentStatus::Missing
                && !state.behind_watermark(&reference);

            if allowed {
                if let Some(init) = reference.init_segment() {
                    state.prefetch_init_segment(init);
                }
                if !state.contains(reference.id()) {
                    trace!(
                        stream_id = state.stream.id(),
                        start = reference.start_time(),
                        end = reference.end_time(),
                        "Prefetching segment"
                    );
                    let operation = SegmentPrefetchOperation::dispatch(
                        state.dispatcher.as_ref(),
                        FetchTarget::Media(&reference),
                        &state.stream,
                    );
                    state.segments.push(PrefetchedSegment {
                        reference: Arc::clone(&reference),
                        operation: Arc::new(operation),
                    });
                }
            }
            if !state.behind_watermark(&reference) {
                state.prefetch_pos_time = Some(reference.start_time());
            }

            if state.stream.fast_switching() && reference.is_partial() && reference.is_last_partial() {
                break;
            }
            next = iterator.next();
        }

        state.clear_init_segments();
    }

    /// Dispatch an init segment fetch unless one is already cached.
    pub fn prefetch_init_segment(&self, reference: &Arc<InitSegmentReference>) {
        self.state.lock().prefetch_init_segment(reference);
    }

    /// Take the cached operation for `reference`, if any. Never dispatches.
    ///
    /// The entry leaves the cache: it frees a slot for the next prefetch and
    /// nothing here aborts it afterwards. With a consumer, buffered chunks are
    /// delivered to it and every later chunk is forwarded as it arrives.
    pub async fn get_prefetched_segment(
        &self,
        reference: &SegmentReference,
        consumer: Option<StreamDataCallback>,
    ) -> Option<PendingRequest> {
        let operation = {
            let mut state = self.state.lock();
            let position = state
                .segments
                .iter()
                .position(|s| s.reference.id() == reference.id())?;
            state.segments.remove(position).operation
        };
        if operation.request.is_aborted() {
            return None;
        }
        if let Some(consumer) = consumer {
            if let Err(error) = operation.attach(consumer).await {
                warn!(error = %error, "Prefetch consumer rejected buffered data");
                operation.abort();
                return None;
            }
        }
        Some(operation.request.clone())
    }

    pub fn get_prefetched_init_segment(&self, reference: &InitSegmentReference) -> Option<PendingRequest> {
        let state = self.state.lock();
        state
            .init_segments
            .get(&reference.key())
            .filter(|op| !op.request.is_aborted())
            .map(|op| op.request.clone())
    }

    /// Abort cached segments playback has moved past.
    pub fn evict(&self, time: f64, clear_init_segments: bool) {
        let mut state = self.state.lock();
        let reverse = state.reverse;
        state.segments.retain(|segment| {
            let passed = if reverse {
                time < segment.reference.start_time()
            } else {
                time > segment.reference.end_time()
            };
            if passed {
                trace!(start = segment.reference.start_time(), "Evicting prefetched segment");
                segment.operation.abort();
            }
            !passed
        });
        if clear_init_segments {
            state.clear_init_segments();
        }
    }

    pub fn remove_reference(&self, reference: &SegmentReference) {
        let mut state = self.state.lock();
        if let Some(position) = state.segments.iter().position(|s| s.reference.id() == reference.id()) {
            let segment = state.segments.remove(position);
            segment.operation.abort();
        }
    }

    /// Change the capacity, aborting the oldest entries beyond it.
    pub fn reset_limit(&self, limit: usize) {
        let mut state = self.state.lock();
        state.limit = limit;
        let excess = state.segments.len().saturating_sub(limit);
        for segment in state.segments.drain(..excess) {
            segment.operation.abort();
        }
        state.clear_init_segments();
    }

    pub fn clear_all(&self) {
        self.state.lock().clear_all();
    }

    /// Point the cache at another stream. Cached entries never survive a
    /// stream change.
    pub fn switch_stream(&self, stream: Arc<Stream>) {
        let mut state = self.state.lock();
        if !Stream::same(&state.stream, &stream) {
            debug!(from = state.stream.id(), to = stream.id(), "Prefetch switching stream");
            state.clear_all();
            state.stream = stream;
        }
    }

    pub fn reset_position(&self) {
        self.state.lock().prefetch_pos_time = None;
    }

    pub fn set_reverse(&self, reverse: bool) {
        let mut state = self.state.lock();
        if state.reverse != reverse {
            state.reverse = reverse;
            state.prefetch_pos_time = None;
        }
    }

    pub fn replace_fetch_dispatcher(&self, dispatcher: Arc<dyn FetchDispatcher>) {
        self.state.lock().dispatcher = dispatcher;
    }

    pub fn stream(&self) -> Arc<Stream> {
        Arc::clone(&self.state.lock().stream)
    }

    pub fn limit(&self) -> usize {
        self.state.lock().limit
    }

    /// Number of cached media segments.
    pub fn len(&self) -> usize {
        self.state.lock().segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn init_segment_count(&self) -> usize {
        self.state.lock().init_segments.len()
    }

    /// Start times of the cached media segments, oldest first.
    pub fn cached_start_times(&self) -> Vec<f64> {
        self.state
            .lock()
            .segments
            .iter()
            .map(|s| s.reference.start_time())
            .collect()
    }
}

impl Drop for SegmentPrefetch {
    fn drop(&mut self) {
        self.state.get_mut().clear_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{ContentType, StaticSegmentIndex};
    use crate::net::{RequestProgress, Response};
    use std::collections::HashMap as StdHashMap;

    #[derive(Default)]
    struct RecordingDispatcher {
        dispatched: Mutex<Vec<String>>,
        requests: Mutex<Vec<PendingRequest>>,
        chunks: Vec<&'static [u8]>,
    }

    impl FetchDispatcher for RecordingDispatcher {
        fn dispatch(
            &self,
            target: FetchTarget<'_>,
            _stream: &Arc<Stream>,
            callback: Option<StreamDataCallback>,
        ) -> PendingRequest {
            let uri = match target {
                FetchTarget::Init(init) => init.uris()[0].clone(),
                FetchTarget::Media(media) => media.uris()[0].clone(),
            };
            self.dispatched.lock().push(uri.clone());
            let chunks = self.chunks.clone();
            let request = PendingRequest::spawn(
                async move {
                    let mut data = BytesMut::new();
                    for chunk in chunks {
                        data.extend_from_slice(chunk);
                        if let Some(callback) = &callback {
                            callback(Bytes::from_static(chunk)).await?;
                        }
                    }
                    if data.is_empty() {
                        std::future::pending::<()>().await;
                    }
                    Ok(Response {
                        uri,
                        data: data.freeze(),
                        status: Some(200),
                        headers: StdHashMap::new(),
                    })
                },
                Arc::new(RequestProgress::default()),
            );
            self.requests.lock().push(request.clone());
            request
        }
    }

    fn stream_with(references: Vec<Arc<SegmentReference>>) -> Arc<Stream> {
        Stream::builder(1, ContentType::Video, Arc::new(StaticSegmentIndex::new(references)))
            .mime_type("video/mp4", "avc1.64001f")
            .build()
    }

    fn segments(count: usize, init: Option<Arc<InitSegmentReference>>) -> Vec<Arc<SegmentReference>> {
        (0..count)
            .map(|i| {
                let start = i as f64 * 2.0;
                let mut reference = SegmentReference::new(start, start + 2.0, vec![format!("seg{i}")]);
                if let Some(init) = &init {
                    reference = reference.with_init_segment(Arc::clone(init));
                }
                Arc::new(reference)
            })
            .collect()
    }

    async fn prefetch_for(
        limit: usize,
        references: Vec<Arc<SegmentReference>>,
    ) -> (SegmentPrefetch, Arc<RecordingDispatcher>) {
        let stream = stream_with(references);
        stream.create_segment_index().await.unwrap();
        let dispatcher = Arc::new(RecordingDispatcher::default());
        (SegmentPrefetch::new(limit, stream, dispatcher.clone(), false), dispatcher)
    }

    #[tokio::test]
    async fn test_prefetch_fills_up_to_limit() {
        let (prefetch, dispatcher) = prefetch_for(2, segments(5, None)).await;
        prefetch.prefetch_segments_by_time(0.0, false);
        assert_eq!(prefetch.len(), 2);
        assert_eq!(*dispatcher.dispatched.lock(), vec!["seg0", "seg1"]);

        // A second call with nothing evicted dispatches nothing new.
        prefetch.prefetch_segments_by_time(0.0, false);
        assert_eq!(prefetch.len(), 2);
        assert_eq!(dispatcher.dispatched.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_init_segments_do_not_count_toward_limit() {
        let init = Arc::new(InitSegmentReference::new(vec!["init".into()], 0, None));
        let (prefetch, dispatcher) = prefetch_for(2, segments(5, Some(init))).await;
        prefetch.prefetch_segments_by_time(0.0, false);
        assert_eq!(prefetch.len(), 2);
        assert_eq!(prefetch.init_segment_count(), 1);
        assert_eq!(*dispatcher.dispatched.lock(), vec!["init", "seg0", "seg1"]);
    }

    #[tokio::test]
    async fn test_skip_first_and_missing_segments() {
        let references = segments(5, None);
        references[2].mark(SegmentStatus::Missing);
        let (prefetch, dispatcher) = prefetch_for(2, references).await;
        prefetch.prefetch_segments_by_time(0.0, true);
        assert_eq!(*dispatcher.dispatched.lock(), vec!["seg1", "seg3"]);
    }

    #[tokio::test]
    async fn test_cache_hit_and_miss() {
        let references = segments(5, None);
        let (prefetch, _) = prefetch_for(2, references.clone()).await;
        prefetch.prefetch_segments_by_time(0.0, false);
        assert!(prefetch.get_prefetched_segment(&references[0], None).await.is_some());
        assert!(prefetch.get_prefetched_segment(&references[4], None).await.is_none());
    }

    #[tokio::test]
    async fn test_evict_is_idempotent_and_continues_from_watermark() {
        let (prefetch, dispatcher) = prefetch_for(2, segments(5, None)).await;
        prefetch.prefetch_segments_by_time(0.0, false);

        prefetch.evict(2.5, false);
        let once = prefetch.cached_start_times();
        prefetch.evict(2.5, false);
        assert_eq!(prefetch.cached_start_times(), once);
        assert_eq!(once, vec![2.0]);
        assert!(dispatcher.requests.lock()[0].is_aborted());

        prefetch.prefetch_segments_by_time(2.5, false);
        assert_eq!(prefetch.cached_start_times(), vec![2.0, 4.0]);
    }

    #[tokio::test]
    async fn test_reset_limit_aborts_oldest() {
        let (prefetch, dispatcher) = prefetch_for(3, segments(5, None)).await;
        prefetch.prefetch_segments_by_time(0.0, false);
        prefetch.reset_limit(1);
        assert_eq!(prefetch.cached_start_times(), vec![4.0]);
        let requests = dispatcher.requests.lock();
        assert!(requests[0].is_aborted());
        assert!(requests[1].is_aborted());
        assert!(!requests[2].is_aborted());
    }

    #[tokio::test]
    async fn test_switch_stream_clears_cache() {
        let init = Arc::new(InitSegmentReference::new(vec!["init".into()], 0, None));
        let (prefetch, _) = prefetch_for(2, segments(5, Some(init))).await;
        prefetch.prefetch_segments_by_time(0.0, false);

        prefetch.switch_stream(prefetch.stream());
        assert_eq!(prefetch.len(), 2);

        let other = Stream::builder(2, ContentType::Video, Arc::new(StaticSegmentIndex::default())).build();
        prefetch.switch_stream(other);
        assert!(prefetch.is_empty());
        assert_eq!(prefetch.init_segment_count(), 0);
    }

    #[tokio::test]
    async fn test_handed_out_segment_frees_its_slot() {
        let references = segments(5, None);
        let (prefetch, dispatcher) = prefetch_for(1, references.clone()).await;
        for reference in &references {
            prefetch.evict(reference.start_time(), false);
            prefetch.prefetch_segments_by_time(reference.start_time(), false);
            assert!(
                prefetch.get_prefetched_segment(reference, None).await.is_some(),
                "segment at {} should be a hit",
                reference.start_time()
            );
            assert!(prefetch.is_empty());
        }
        assert_eq!(*dispatcher.dispatched.lock(), vec!["seg0", "seg1", "seg2", "seg3", "seg4"]);
    }

    #[tokio::test]
    async fn test_handed_out_segment_is_not_dispatched_again() {
        let references = segments(3, None);
        let (prefetch, dispatcher) = prefetch_for(1, references.clone()).await;
        prefetch.prefetch_segments_by_time(0.0, false);
        assert!(prefetch.get_prefetched_segment(&references[0], None).await.is_some());

        prefetch.prefetch_segments_by_time(0.5, false);
        assert_eq!(*dispatcher.dispatched.lock(), vec!["seg0", "seg1"]);
        assert!(prefetch.get_prefetched_segment(&references[0], None).await.is_none());
    }

    #[tokio::test]
    async fn test_handed_out_segment_survives_cache_clears() {
        let references = segments(5, None);
        let (prefetch, dispatcher) = prefetch_for(3, references.clone()).await;
        prefetch.prefetch_segments_by_time(0.0, false);
        let handed_out = prefetch.get_prefetched_segment(&references[0], None).await.unwrap();

        prefetch.reset_limit(1);
        let other = Stream::builder(2, ContentType::Video, Arc::new(StaticSegmentIndex::default())).build();
        prefetch.switch_stream(other);
        prefetch.clear_all();

        assert!(!handed_out.is_aborted());
        let requests = dispatcher.requests.lock();
        assert!(!requests[0].is_aborted());
        assert!(requests[1].is_aborted());
        assert!(requests[2].is_aborted());
    }

    #[tokio::test]
    async fn test_fast_switching_stops_after_last_partial() {
        let partials = |i: usize| {
            let start = i as f64 * 2.0;
            SegmentReference::new(start, start + 2.0, vec![format!("seg{i}")]).with_partials(vec![
                SegmentReference::new(start, start + 1.0, vec![format!("seg{i}p0")]),
                SegmentReference::new(start + 1.0, start + 2.0, vec![format!("seg{i}p1")]),
            ])
        };
        let references: Vec<_> = (0..3).map(|i| Arc::new(partials(i))).collect();

        for (fast_switching, expected) in [
            (true, vec!["seg0p0", "seg0p1"]),
            (false, vec!["seg0p0", "seg0p1", "seg1p0", "seg1p1"]),
        ] {
            let stream = Stream::builder(1, ContentType::Video, Arc::new(StaticSegmentIndex::new(references.clone())))
                .mime_type("video/mp4", "avc1.64001f")
                .fast_switching(fast_switching)
                .build();
            stream.create_segment_index().await.unwrap();
            let dispatcher = Arc::new(RecordingDispatcher::default());
            let prefetch = SegmentPrefetch::new(4, stream, dispatcher.clone(), false);
            prefetch.prefetch_segments_by_time(0.0, false);
            assert_eq!(*dispatcher.dispatched.lock(), expected, "fast_switching = {fast_switching}");
        }
    }

    #[tokio::test]
    async fn test_consumer_receives_buffered_then_live_chunks() {
        let references = segments(1, None);
        let stream = stream_with(references.clone());
        stream.create_segment_index().await.unwrap();
        let dispatcher = Arc::new(RecordingDispatcher {
            chunks: vec![b"ab", b"cd"],
            ..Default::default()
        });
        let prefetch = SegmentPrefetch::new(1, stream, dispatcher, false);
        prefetch.prefetch_segments_by_time(0.0, false);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let consumer: StreamDataCallback = Arc::new(move |chunk: Bytes| {
            sink.lock().extend_from_slice(&chunk);
            futures::future::ready(Ok(())).boxed()
        });
        let request = prefetch
            .get_prefetched_segment(&references[0], Some(consumer))
            .await
            .unwrap();
        let response = request.result().await.unwrap();
        assert_eq!(&response.data[..], b"abcd");
        assert_eq!(&received.lock()[..], b"abcd");
    }
}
