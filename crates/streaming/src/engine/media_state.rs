use std::sync::Arc;

use tokio::task::AbortHandle;

use crate::media::{ContentType, InitSegmentReference, SegmentIterator, SegmentReference, Stream};
use crate::net::PendingRequest;
use crate::prefetch::SegmentPrefetch;

/// Where a track is in its fetch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackPhase {
    Idle,
    Fetching,
    Appending,
    ClearingBuffer,
    /// The last fetch or append failed; waits for `retry`.
    Failed,
}

impl TrackPhase {
    /// A fetch-and-append sequence is running.
    pub fn is_performing_update(self) -> bool {
        matches!(self, Self::Fetching | Self::Appending)
    }
}

/// A buffer clear requested while an update was running.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PendingClear {
    pub flush: bool,
    pub safe_margin: f64,
}

#[derive(Debug)]
pub(crate) struct UpdateTimer {
    pub id: u64,
    pub handle: AbortHandle,
}

/// Streaming state of one content type.
pub(crate) struct MediaState {
    pub content_type: ContentType,
    pub stream: Arc<Stream>,
    pub segment_iterator: Option<SegmentIterator>,
    pub last_segment_reference: Option<Arc<SegmentReference>>,
    pub last_init_segment_reference: Option<Arc<InitSegmentReference>>,
    pub last_timestamp_offset: Option<f64>,
    pub last_append_window_start: Option<f64>,
    pub last_append_window_end: Option<f64>,
    pub last_codecs: Option<String>,
    pub last_mime_type: Option<String>,
    pub restore_stream_after_trick_play: Option<Arc<Stream>>,
    pub end_of_stream: bool,
    pub phase: TrackPhase,
    pub pending_clear: Option<PendingClear>,
    /// The next append follows an unbuffered seek.
    pub seeked: bool,
    /// The next append follows an adaptation switch.
    pub adaptation: bool,
    /// Waiting out a quota reduction.
    pub recovering: bool,
    /// The sink's text buffer must be re-created before the next append.
    pub reinit_text: bool,
    pub operation: Option<PendingRequest>,
    pub segment_prefetch: Option<Arc<SegmentPrefetch>>,
    /// Streams whose segment index must be closed once the running update ends.
    pub deferred_close: Vec<Arc<Stream>>,
    pub update_timer: Option<UpdateTimer>,
}

impl MediaState {
    pub fn new(stream: Arc<Stream>, segment_prefetch: Option<Arc<SegmentPrefetch>>) -> Self {
        Self {
            content_type: stream.content_type(),
            stream,
            segment_iterator: None,
            last_segment_reference: None,
            last_init_segment_reference: None,
            last_timestamp_offset: None,
            last_append_window_start: None,
            last_append_window_end: None,
            last_codecs: None,
            last_mime_type: None,
            restore_stream_after_trick_play: None,
            end_of_stream: false,
            phase: TrackPhase::Idle,
            pending_clear: None,
            seeked: true,
            adaptation: false,
            recovering: false,
            reinit_text: false,
            operation: None,
            segment_prefetch,
            deferred_close: Vec::new(),
            update_timer: None,
        }
    }

    pub fn has_error(&self) -> bool {
        self.phase == TrackPhase::Failed
    }

    /// The next presentation time this track needs.
    pub fn time_needed(&self, presentation_time: f64, reverse: bool) -> f64 {
        match &self.last_segment_reference {
            Some(last) if reverse => last.start_time(),
            Some(last) => last.end_time(),
            None => presentation_time,
        }
    }

    /// Forget what was applied to the sink so it is applied again.
    pub fn forget_sink_parameters(&mut self) {
        self.last_init_segment_reference = None;
        self.last_timestamp_offset = None;
        self.last_append_window_start = None;
        self.last_append_window_end = None;
        self.last_codecs = None;
        self.last_mime_type = None;
    }

    /// Queue a buffer clear, merging with one already queued. A full clear
    /// wins over a partial one.
    pub fn request_clear(&mut self, flush: bool, safe_margin: f64) {
        let clear = match self.pending_clear {
            Some(pending) => PendingClear {
                flush: pending.flush || flush,
                safe_margin: if pending.safe_margin == 0.0 || safe_margin == 0.0 {
                    0.0
                } else {
                    pending.safe_margin.min(safe_margin)
                },
            },
            None => PendingClear { flush, safe_margin },
        };
        self.pending_clear = Some(clear);
    }

    /// Whether a buffer clear can start right now.
    pub fn can_clear_now(&self) -> bool {
        !self.phase.is_performing_update() && self.phase != TrackPhase::ClearingBuffer
    }

    pub fn cancel_update(&mut self) {
        if let Some(timer) = self.update_timer.take() {
            timer.handle.abort();
        }
    }

    pub fn tag(&self) -> String {
        format!("{}:{}", self.content_type, self.stream.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::StaticSegmentIndex;

    fn media_state() -> MediaState {
        let stream = Stream::builder(1, ContentType::Audio, Arc::new(StaticSegmentIndex::default())).build();
        MediaState::new(stream, None)
    }

    #[test]
    fn test_request_clear_upgrades_to_flush() {
        let mut ms = media_state();
        ms.request_clear(false, 2.0);
        ms.request_clear(true, 3.0);
        assert_eq!(ms.pending_clear, Some(PendingClear { flush: true, safe_margin: 2.0 }));
    }

    #[test]
    fn test_full_clear_wins_over_partial() {
        let mut ms = media_state();
        ms.request_clear(true, 2.0);
        ms.request_clear(false, 0.0);
        assert_eq!(ms.pending_clear, Some(PendingClear { flush: true, safe_margin: 0.0 }));
    }

    #[test]
    fn test_time_needed_follows_direction() {
        let mut ms = media_state();
        assert_eq!(ms.time_needed(5.0, false), 5.0);
        ms.last_segment_reference = Some(Arc::new(SegmentReference::new(4.0, 8.0, vec!["a".into()])));
        assert_eq!(ms.time_needed(5.0, false), 8.0);
        assert_eq!(ms.time_needed(5.0, true), 4.0);
    }
}
