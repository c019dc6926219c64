use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Severity, StreamingError};
use crate::events::{EngineEvent, MetadataFrame};
use crate::media::{ContentType, InitSegmentReference, SegmentReference, Stream};

/// Callbacks the engine uses to query and notify its owner.
#[async_trait]
pub trait PlayerInterface: Send + Sync {
    /// Current playhead position in seconds.
    fn presentation_time(&self) -> f64;

    /// Estimated network bandwidth in bits per second.
    fn bandwidth_estimate(&self) -> f64;

    fn playback_rate(&self) -> f64 {
        1.0
    }

    /// Whether anything displays text right now.
    fn is_text_visible(&self) -> bool {
        true
    }

    /// Report an error. Returns whether the application handled it.
    fn on_error(&self, error: &StreamingError, severity: Severity) -> bool;

    fn on_event(&self, event: EngineEvent) {
        let _ = event;
    }

    fn on_manifest_update(&self) {}

    fn on_segment_appended(&self, reference: &SegmentReference, stream: &Stream) {
        let _ = (reference, stream);
    }

    fn on_init_segment_appended(&self, time: f64, reference: &InitSegmentReference) {
        let _ = (time, reference);
    }

    /// Called with every segment right before it is appended.
    async fn before_append_segment(
        &self,
        content_type: ContentType,
        data: &Bytes,
    ) -> Result<(), StreamingError> {
        let _ = (content_type, data);
        Ok(())
    }

    /// Temporarily disable a failing stream. Returns whether it was disabled.
    fn disable_stream(&self, stream: &Arc<Stream>, max_disabled_time: f64) -> bool {
        let _ = (stream, max_disabled_time);
        false
    }

    fn on_metadata(&self, frames: Vec<MetadataFrame>, content_type: ContentType) {
        let _ = (frames, content_type);
    }
}
