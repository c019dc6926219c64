use std::sync::Arc;

use parking_lot::RwLock;

use super::stream::{Stream, Variant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Dash,
    Hls,
}

/// Presentation-wide timing shared by all streams.
#[derive(Debug)]
pub struct PresentationTimeline {
    duration: RwLock<f64>,
    max_segment_duration: RwLock<f64>,
}

impl PresentationTimeline {
    pub fn new(duration: f64, max_segment_duration: f64) -> Self {
        Self {
            duration: RwLock::new(duration),
            max_segment_duration: RwLock::new(max_segment_duration),
        }
    }

    /// Presentation duration in seconds, `f64::INFINITY` for live.
    pub fn duration(&self) -> f64 {
        *self.duration.read()
    }

    pub fn set_duration(&self, duration: f64) {
        *self.duration.write() = duration;
    }

    pub fn max_segment_duration(&self) -> f64 {
        *self.max_segment_duration.read()
    }

    /// Record a segment duration, growing the maximum when needed.
    pub fn notify_segment_duration(&self, duration: f64) {
        let mut max = self.max_segment_duration.write();
        if duration > *max {
            *max = duration;
        }
    }

    pub fn is_live(&self) -> bool {
        self.duration().is_infinite()
    }
}

/// The subset of a parsed manifest the engine works with.
#[derive(Debug)]
pub struct Manifest {
    pub kind: ManifestKind,
    pub variants: Vec<Variant>,
    pub text_streams: Vec<Arc<Stream>>,
    pub timeline: PresentationTimeline,
    /// Minimum buffer the manifest asks for before playback.
    pub min_buffer_time: f64,
    pub sequence_mode: bool,
    pub ignore_manifest_timestamps_in_segments_mode: bool,
    pub is_low_latency: bool,
}

impl Manifest {
    pub fn new(kind: ManifestKind, variants: Vec<Variant>, timeline: PresentationTimeline) -> Self {
        Self {
            kind,
            variants,
            text_streams: Vec::new(),
            timeline,
            min_buffer_time: 0.0,
            sequence_mode: false,
            ignore_manifest_timestamps_in_segments_mode: false,
            is_low_latency: false,
        }
    }

    /// Every audio stream of the manifest, deduplicated by id.
    pub fn audio_streams(&self) -> Vec<Arc<Stream>> {
        let mut streams: Vec<Arc<Stream>> = Vec::new();
        for audio in self.variants.iter().filter_map(|v| v.audio.as_ref()) {
            if !streams.iter().any(|s| Stream::same(s, audio)) {
                streams.push(Arc::clone(audio));
            }
        }
        streams
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_segment_duration_only_grows() {
        let timeline = PresentationTimeline::new(60.0, 2.0);
        timeline.notify_segment_duration(4.0);
        timeline.notify_segment_duration(1.0);
        assert_eq!(timeline.max_segment_duration(), 4.0);
        assert!(!timeline.is_live());
        timeline.set_duration(f64::INFINITY);
        assert!(timeline.is_live());
    }
}
