//! Data model consumed by the engine: segment references, segment indexes,
//! streams, variants and the manifest they belong to.

mod manifest;
mod segment;
mod segment_index;
mod stream;

use std::fmt;

pub use manifest::{Manifest, ManifestKind, PresentationTimeline};
pub use segment::{
    AesKey, InitSegmentKey, InitSegmentReference, SegmentId, SegmentReference, SegmentStatus,
    same_init_segment,
};
pub use segment_index::{SegmentIndex, SegmentIterator};
pub use stream::{SegmentIndexSource, StaticSegmentIndex, Stream, StreamBuilder, Variant};

/// An independently buffered elementary stream kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContentType {
    Audio,
    Video,
    Text,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Text => "text",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
