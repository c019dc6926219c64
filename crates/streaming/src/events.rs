use bytes::Bytes;
use mp4::SpatialVideoInfo;

use crate::media::ContentType;

/// An in-band event message found in a media segment.
#[derive(Debug, Clone, PartialEq)]
pub struct EmsgEvent {
    pub scheme_id_uri: String,
    pub value: String,
    /// Presentation start time of the event, in seconds.
    pub start_time: f64,
    /// `f64::INFINITY` when the event duration is unknown.
    pub end_time: f64,
    pub timescale: u32,
    /// Set for version 0 boxes.
    pub presentation_time_delta: Option<u32>,
    /// Set for version 1 boxes.
    pub presentation_time: Option<u64>,
    pub event_duration: u32,
    pub id: u32,
    pub message_data: Bytes,
}

/// Timed metadata delivered through `on_metadata`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataFrame {
    pub scheme_id_uri: String,
    pub start_time: f64,
    pub end_time: f64,
    pub data: Bytes,
}

/// Side-channel notifications raised by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Emsg(EmsgEvent),
    /// First producer reference time seen for a stream.
    ProducerReferenceTime {
        content_type: ContentType,
        stream_id: u32,
        wall_clock_time_ms: i64,
        media_time: u64,
    },
    SpatialVideoInfo(SpatialVideoInfo),
    /// The init segment carries no spatial metadata any more.
    NoSpatialVideoInfo,
    /// The buffering goal was scaled down after the sink ran out of room.
    BufferingGoalReduced {
        content_type: ContentType,
        scale: f64,
    },
    MediaSourceRecovered,
}
