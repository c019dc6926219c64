use parking_lot::Mutex;
use streaming_engine::media::{ContentType, InitSegmentReference, SegmentReference, Stream};
use streaming_engine::{EngineEvent, MetadataFrame, PlayerInterface, Severity, StreamingError};
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct Playhead {
    position: f64,
    stalled: bool,
}

/// A playhead that moves with wall-clock time while media is buffered and
/// stalls when the buffer runs dry.
pub struct SimulatedPlayer {
    playhead: Mutex<Playhead>,
    rate: f64,
    bandwidth: f64,
}

impl SimulatedPlayer {
    pub fn new(start: f64, rate: f64, bandwidth: f64) -> Self {
        Self {
            playhead: Mutex::new(Playhead {
                position: start,
                stalled: false,
            }),
            rate,
            bandwidth,
        }
    }

    /// Play `elapsed` wall-clock seconds, never past `buffered_ahead`.
    /// Returns the new position.
    pub fn advance(&self, elapsed: f64, buffered_ahead: f64) -> f64 {
        let mut playhead = self.playhead.lock();
        let wanted = elapsed * self.rate;
        let step = wanted.min(buffered_ahead).max(0.0);
        let stalled = step < wanted;
        if stalled != playhead.stalled {
            if stalled {
                warn!(position = playhead.position + step, "Playback stalled, buffer empty");
            } else {
                info!(position = playhead.position, "Playback resumed");
            }
            playhead.stalled = stalled;
        }
        playhead.position += step;
        playhead.position
    }

    pub fn is_stalled(&self) -> bool {
        self.playhead.lock().stalled
    }
}

impl PlayerInterface for SimulatedPlayer {
    fn presentation_time(&self) -> f64 {
        self.playhead.lock().position
    }

    fn bandwidth_estimate(&self) -> f64 {
        self.bandwidth
    }

    fn playback_rate(&self) -> f64 {
        self.rate
    }

    fn on_error(&self, err: &StreamingError, severity: Severity) -> bool {
        match severity {
            Severity::Critical => error!(error = %err, "Critical streaming error"),
            Severity::Recoverable => warn!(error = %err, "Recoverable streaming error"),
        }
        false
    }

    fn on_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::Emsg(emsg) => {
                info!(scheme = %emsg.scheme_id_uri, value = %emsg.value, start = emsg.start_time, "Event message");
            }
            EngineEvent::BufferingGoalReduced { content_type, scale } => {
                warn!(content_type = %content_type, scale, "Buffering goal reduced");
            }
            other => info!(event = ?other, "Engine event"),
        }
    }

    fn on_segment_appended(&self, reference: &SegmentReference, stream: &Stream) {
        debug!(
            content_type = %stream.content_type(),
            start = reference.start_time(),
            end = reference.end_time(),
            "Segment appended"
        );
    }

    fn on_init_segment_appended(&self, time: f64, reference: &InitSegmentReference) {
        debug!(time, uri = ?reference.uris().first(), "Init segment appended");
    }

    fn on_metadata(&self, frames: Vec<MetadataFrame>, content_type: ContentType) {
        info!(content_type = %content_type, frames = frames.len(), "Timed metadata");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_stalls_on_empty_buffer() {
        let player = SimulatedPlayer::new(10.0, 2.0, 1e6);
        assert_eq!(player.advance(0.5, 5.0), 11.0);
        assert!(!player.is_stalled());

        assert_eq!(player.advance(1.0, 0.5), 11.5);
        assert!(player.is_stalled());
        assert_eq!(player.presentation_time(), 11.5);

        player.advance(0.25, 4.0);
        assert!(!player.is_stalled());
    }
}
