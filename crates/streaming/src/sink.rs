//! The media sink collaborator: per content type buffers that accept init
//! and media segments.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StreamingError;
use crate::media::{ContentType, ManifestKind, SegmentReference, Stream};

/// Hints passed along with every append.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendContext {
    pub has_closed_captions: bool,
    /// First append after an unbuffered seek.
    pub seeked: bool,
    /// First append after an ABR-driven switch.
    pub adaptation: bool,
    /// Part of a segment appended chunk by chunk.
    pub is_chunked: bool,
}

/// Source buffer parameters the engine applies when they change.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamProperties {
    pub timestamp_offset: f64,
    pub append_window_start: f64,
    pub append_window_end: f64,
    pub mime_type: String,
    pub codecs: String,
    /// The track is being reinitialised for a new stream.
    pub stream_changed: bool,
}

/// Buffered ranges per content type.
pub type BufferedInfo = BTreeMap<ContentType, Vec<(f64, f64)>>;

/// Sorted, disjoint `[start, end)` ranges of buffered media.
///
/// Ranges closer than the gap tolerance are merged on insertion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeRanges {
    ranges: Vec<(f64, f64)>,
}

impl TimeRanges {
    const GAP_TOLERANCE: f64 = 0.01;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, start: f64, end: f64) {
        self.ranges.push((start, end));
        self.ranges.sort_by(|a, b| a.0.total_cmp(&b.0));
        let mut merged: Vec<(f64, f64)> = Vec::with_capacity(self.ranges.len());
        for &(s, e) in &self.ranges {
            match merged.last_mut() {
                Some(last) if s <= last.1 + Self::GAP_TOLERANCE => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        self.ranges = merged;
    }

    pub fn remove(&mut self, start: f64, end: f64) {
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for &(s, e) in &self.ranges {
            if e <= start || s >= end {
                kept.push((s, e));
                continue;
            }
            if s < start {
                kept.push((s, start));
            }
            if e > end {
                kept.push((end, e));
            }
        }
        self.ranges = kept;
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn start(&self) -> Option<f64> {
        self.ranges.first().map(|r| r.0)
    }

    pub fn end(&self) -> Option<f64> {
        self.ranges.last().map(|r| r.1)
    }

    /// Seconds buffered contiguously from `time`, `0.0` when unbuffered.
    pub fn ahead_of(&self, time: f64) -> f64 {
        self.ranges
            .iter()
            .find(|(s, e)| *s <= time + Self::GAP_TOLERANCE && time < *e)
            .map_or(0.0, |(_, end)| end - time)
    }

    pub fn as_slice(&self) -> &[(f64, f64)] {
        &self.ranges
    }
}

/// Streams the engine is currently playing, keyed by content type.
pub type StreamsByType = BTreeMap<ContentType, Arc<Stream>>;

/// Destination of fetched media.
///
/// Mutations for one content type are never issued concurrently. Failures
/// from append should use [`StreamingError::QuotaExceeded`] when the buffer
/// is full so the engine can degrade its buffering goal.
#[async_trait]
pub trait MediaSink: Send + Sync {
    async fn init(
        &self,
        streams: &StreamsByType,
        sequence_mode: bool,
        manifest_kind: ManifestKind,
        ignore_manifest_timestamps_in_segments_mode: bool,
    ) -> Result<(), StreamingError>;

    /// Re-create the text buffer for a newly loaded text stream.
    async fn reinit_text(&self, stream: &Stream, sequence_mode: bool) -> Result<(), StreamingError>;

    async fn set_duration(&self, duration: f64) -> Result<(), StreamingError>;

    /// Duration as realised by the buffers, `0.0` when unknown.
    fn duration(&self) -> f64;

    /// Whether buffers currently accept data.
    fn is_streaming_allowed(&self) -> bool;

    fn buffer_start(&self, content_type: ContentType) -> Option<f64>;

    fn buffer_end(&self, content_type: ContentType) -> Option<f64>;

    /// Seconds buffered contiguously from `time`.
    fn buffered_ahead_of(&self, content_type: ContentType, time: f64) -> f64;

    fn is_buffered(&self, content_type: ContentType, time: f64) -> bool;

    async fn append_buffer(
        &self,
        content_type: ContentType,
        data: Bytes,
        reference: Option<&SegmentReference>,
        stream: &Stream,
        context: AppendContext,
    ) -> Result<(), StreamingError>;

    async fn remove(&self, content_type: ContentType, start: f64, end: f64) -> Result<(), StreamingError>;

    async fn clear(&self, content_type: ContentType) -> Result<(), StreamingError>;

    /// Drop decoder state so a seek within the buffer takes effect.
    async fn flush(&self, content_type: ContentType) -> Result<(), StreamingError>;

    async fn end_of_stream(&self) -> Result<(), StreamingError>;

    async fn set_stream_properties(
        &self,
        content_type: ContentType,
        properties: &StreamProperties,
    ) -> Result<(), StreamingError>;

    /// Whether switching to `stream` requires resetting the whole sink.
    fn is_reset_media_source_necessary(&self, content_type: ContentType, stream: &Stream) -> bool {
        let _ = (content_type, stream);
        false
    }

    async fn reset(&self, streams: &StreamsByType) -> Result<(), StreamingError>;

    /// Re-align timestamps at a discontinuity in sequence mode.
    async fn resync(&self, content_type: ContentType, time: f64) -> Result<(), StreamingError> {
        let _ = (content_type, time);
        Ok(())
    }

    fn reset_caption_parser(&self) {}

    fn buffered_info(&self) -> BufferedInfo;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges_merge_and_split() {
        let mut ranges = TimeRanges::new();
        ranges.add(4.0, 8.0);
        ranges.add(0.0, 4.0);
        ranges.add(10.0, 12.0);
        assert_eq!(ranges.as_slice(), &[(0.0, 8.0), (10.0, 12.0)]);
        assert_eq!(ranges.ahead_of(3.0), 5.0);
        assert_eq!(ranges.ahead_of(9.0), 0.0);

        ranges.remove(2.0, 3.0);
        assert_eq!(ranges.as_slice(), &[(0.0, 2.0), (3.0, 8.0), (10.0, 12.0)]);
        ranges.remove(0.0, 11.0);
        assert_eq!(ranges.as_slice(), &[(11.0, 12.0)]);
        assert_eq!(ranges.start(), Some(11.0));
        assert_eq!(ranges.end(), Some(12.0));
    }
}
