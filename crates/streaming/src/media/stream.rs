use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::ContentType;
use super::segment::SegmentReference;
use super::segment_index::SegmentIndex;
use crate::error::StreamingError;

/// Produces the segment index of a stream on demand.
///
/// Manifest parsers implement this; creation may involve fetching a
/// sub-playlist or a `sidx` box.
#[async_trait]
pub trait SegmentIndexSource: Send + Sync {
    async fn create(&self) -> Result<SegmentIndex, StreamingError>;

    /// Called when the engine no longer needs the index.
    fn close(&self) {}
}

/// A source backed by an in-memory reference list.
#[derive(Debug, Default)]
pub struct StaticSegmentIndex {
    references: Vec<Arc<SegmentReference>>,
}

impl StaticSegmentIndex {
    pub fn new(references: Vec<Arc<SegmentReference>>) -> Self {
        Self { references }
    }
}

#[async_trait]
impl SegmentIndexSource for StaticSegmentIndex {
    async fn create(&self) -> Result<SegmentIndex, StreamingError> {
        Ok(SegmentIndex::new(self.references.clone()))
    }
}

/// One encoded rendition of a content type.
pub struct Stream {
    id: u32,
    content_type: ContentType,
    mime_type: String,
    codecs: String,
    language: String,
    bandwidth: Option<u64>,
    closed_captions: bool,
    fast_switching: bool,
    emsg_scheme_id_uris: Vec<String>,
    trick_mode_video: Option<Arc<Stream>>,
    source: Arc<dyn SegmentIndexSource>,
    segment_index: RwLock<Option<Arc<SegmentIndex>>>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("content_type", &self.content_type)
            .field("mime_type", &self.mime_type)
            .field("codecs", &self.codecs)
            .field("language", &self.language)
            .field("bandwidth", &self.bandwidth)
            .finish_non_exhaustive()
    }
}

impl Stream {
    pub fn builder(
        id: u32,
        content_type: ContentType,
        source: Arc<dyn SegmentIndexSource>,
    ) -> StreamBuilder {
        StreamBuilder {
            stream: Stream {
                id,
                content_type,
                mime_type: String::new(),
                codecs: String::new(),
                language: String::new(),
                bandwidth: None,
                closed_captions: false,
                fast_switching: false,
                emsg_scheme_id_uris: Vec::new(),
                trick_mode_video: None,
                source,
                segment_index: RwLock::new(None),
            },
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn codecs(&self) -> &str {
        &self.codecs
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn bandwidth(&self) -> Option<u64> {
        self.bandwidth
    }

    pub fn has_closed_captions(&self) -> bool {
        self.closed_captions
    }

    pub fn fast_switching(&self) -> bool {
        self.fast_switching
    }

    pub fn emsg_scheme_id_uris(&self) -> &[String] {
        &self.emsg_scheme_id_uris
    }

    pub fn trick_mode_video(&self) -> Option<&Arc<Stream>> {
        self.trick_mode_video.as_ref()
    }

    pub fn is_mp4(&self) -> bool {
        self.mime_type.ends_with("/mp4")
    }

    /// The segment index, if it has been created.
    pub fn segment_index(&self) -> Option<Arc<SegmentIndex>> {
        self.segment_index.read().clone()
    }

    /// Create the segment index unless it already exists.
    pub async fn create_segment_index(&self) -> Result<Arc<SegmentIndex>, StreamingError> {
        if let Some(index) = self.segment_index() {
            return Ok(index);
        }
        let index = Arc::new(self.source.create().await?);
        let mut slot = self.segment_index.write();
        // A concurrent creation may have won the race.
        Ok(Arc::clone(slot.get_or_insert(index)))
    }

    pub fn close_segment_index(&self) {
        if self.segment_index.write().take().is_some() {
            self.source.close();
        }
    }

    /// Two handles refer to the same stream.
    pub fn same(a: &Arc<Stream>, b: &Arc<Stream>) -> bool {
        Arc::ptr_eq(a, b) || a.id == b.id
    }
}

pub struct StreamBuilder {
    stream: Stream,
}

impl StreamBuilder {
    pub fn mime_type(mut self, mime_type: impl Into<String>, codecs: impl Into<String>) -> Self {
        self.stream.mime_type = mime_type.into();
        self.stream.codecs = codecs.into();
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.stream.language = language.into();
        self
    }

    pub fn bandwidth(mut self, bandwidth: u64) -> Self {
        self.stream.bandwidth = Some(bandwidth);
        self
    }

    pub fn closed_captions(mut self, closed_captions: bool) -> Self {
        self.stream.closed_captions = closed_captions;
        self
    }

    pub fn fast_switching(mut self, fast_switching: bool) -> Self {
        self.stream.fast_switching = fast_switching;
        self
    }

    pub fn emsg_scheme_id_uris(mut self, uris: Vec<String>) -> Self {
        self.stream.emsg_scheme_id_uris = uris;
        self
    }

    pub fn trick_mode_video(mut self, stream: Arc<Stream>) -> Self {
        self.stream.trick_mode_video = Some(stream);
        self
    }

    pub fn build(self) -> Arc<Stream> {
        Arc::new(self.stream)
    }
}

/// A playable combination of at most one audio and one video stream.
#[derive(Debug, Clone)]
pub struct Variant {
    pub id: u32,
    pub audio: Option<Arc<Stream>>,
    pub video: Option<Arc<Stream>>,
    pub bandwidth: u64,
}

impl Variant {
    pub fn stream(&self, content_type: ContentType) -> Option<&Arc<Stream>> {
        match content_type {
            ContentType::Audio => self.audio.as_ref(),
            ContentType::Video => self.video.as_ref(),
            ContentType::Text => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        created: AtomicUsize,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl SegmentIndexSource for CountingSource {
        async fn create(&self) -> Result<SegmentIndex, StreamingError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(SegmentIndex::new(vec![Arc::new(SegmentReference::new(
                0.0,
                2.0,
                vec!["a".into()],
            ))]))
        }

        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_segment_index_created_once_and_closed() {
        let source = Arc::new(CountingSource {
            created: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        });
        let stream = Stream::builder(1, ContentType::Video, source.clone())
            .mime_type("video/mp4", "avc1.64001f")
            .build();

        assert!(stream.segment_index().is_none());
        stream.create_segment_index().await.unwrap();
        stream.create_segment_index().await.unwrap();
        assert_eq!(source.created.load(Ordering::SeqCst), 1);
        assert!(stream.is_mp4());

        stream.close_segment_index();
        stream.close_segment_index();
        assert_eq!(source.closed.load(Ordering::SeqCst), 1);
        assert!(stream.segment_index().is_none());
    }
}
