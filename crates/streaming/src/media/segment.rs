use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

use bytes::Bytes;

static NEXT_SEGMENT_ID: AtomicU64 = AtomicU64::new(1);

/// Stable handle identifying one [`SegmentReference`] for its whole life.
///
/// Caches key on this instead of on reference addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(u64);

/// Availability of a segment as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatus {
    Unknown,
    Available,
    Missing,
}

impl SegmentStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Available,
            2 => Self::Missing,
            _ => Self::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Available => 1,
            Self::Missing => 2,
        }
    }
}

/// AES-128 key material for an encrypted segment.
#[derive(Clone, PartialEq, Eq)]
pub struct AesKey {
    pub key: [u8; 16],
    /// Explicit IV. When absent the IV is derived from the media sequence number.
    pub iv: Option<[u8; 16]>,
    /// Media sequence number of the first segment of the segment index.
    pub first_media_sequence_number: u64,
}

impl std::fmt::Debug for AesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesKey")
            .field("iv", &self.iv)
            .field("first_media_sequence_number", &self.first_media_sequence_number)
            .finish_non_exhaustive()
    }
}

/// Describes one fetchable initialization segment.
///
/// Two init references are equal when their URIs and byte range match,
/// regardless of which manifest refresh produced them.
#[derive(Debug)]
pub struct InitSegmentReference {
    uris: Vec<String>,
    start_byte: u64,
    end_byte: Option<u64>,
    segment_data: Option<Bytes>,
    aes_key: Option<Arc<AesKey>>,
    /// Media timescale learned from the init segment, `0` until known.
    timescale: AtomicU32,
}

impl InitSegmentReference {
    pub fn new(uris: Vec<String>, start_byte: u64, end_byte: Option<u64>) -> Self {
        Self {
            uris,
            start_byte,
            end_byte,
            segment_data: None,
            aes_key: None,
            timescale: AtomicU32::new(0),
        }
    }

    pub fn with_segment_data(mut self, data: Bytes) -> Self {
        self.segment_data = Some(data);
        self
    }

    pub fn with_aes_key(mut self, key: Arc<AesKey>) -> Self {
        self.aes_key = Some(key);
        self
    }

    pub fn uris(&self) -> &[String] {
        &self.uris
    }

    pub fn start_byte(&self) -> u64 {
        self.start_byte
    }

    pub fn end_byte(&self) -> Option<u64> {
        self.end_byte
    }

    pub fn size(&self) -> Option<u64> {
        self.end_byte.map(|end| end + 1 - self.start_byte)
    }

    pub fn segment_data(&self) -> Option<&Bytes> {
        self.segment_data.as_ref()
    }

    pub fn aes_key(&self) -> Option<&Arc<AesKey>> {
        self.aes_key.as_ref()
    }

    pub fn timescale(&self) -> Option<u32> {
        match self.timescale.load(Ordering::Relaxed) {
            0 => None,
            timescale => Some(timescale),
        }
    }

    pub(crate) fn set_timescale(&self, timescale: u32) {
        self.timescale.store(timescale, Ordering::Relaxed);
    }

    pub fn key(&self) -> InitSegmentKey {
        InitSegmentKey {
            uris: self.uris.clone(),
            start_byte: self.start_byte,
            end_byte: self.end_byte,
        }
    }
}

impl PartialEq for InitSegmentReference {
    fn eq(&self, other: &Self) -> bool {
        self.uris == other.uris
            && self.start_byte == other.start_byte
            && self.end_byte == other.end_byte
    }
}

impl Eq for InitSegmentReference {}

impl Hash for InitSegmentReference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

/// Value identity of an init segment: URIs plus byte range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InitSegmentKey {
    pub uris: Vec<String>,
    pub start_byte: u64,
    pub end_byte: Option<u64>,
}

/// Equality of optional init references by value.
pub fn same_init_segment(
    a: Option<&Arc<InitSegmentReference>>,
    b: Option<&Arc<InitSegmentReference>>,
) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b) || a == b,
        _ => false,
    }
}

/// Describes one fetchable media segment (or partial segment).
///
/// Immutable apart from the cached availability status.
#[derive(Debug)]
pub struct SegmentReference {
    id: SegmentId,
    uris: Vec<String>,
    start_time: f64,
    end_time: f64,
    start_byte: u64,
    end_byte: Option<u64>,
    init_segment: Option<Arc<InitSegmentReference>>,
    timestamp_offset: f64,
    append_window_start: f64,
    append_window_end: f64,
    discontinuity_sequence: i64,
    partial_references: Vec<Arc<SegmentReference>>,
    is_partial: bool,
    is_last_partial: bool,
    is_preload: bool,
    independent: bool,
    mime_type: Option<String>,
    codecs: Option<String>,
    aes_key: Option<Arc<AesKey>>,
    segment_data: Option<Bytes>,
    status: AtomicU8,
}

impl SegmentReference {
    pub fn new(start_time: f64, end_time: f64, uris: Vec<String>) -> Self {
        debug_assert!(start_time <= end_time, "segment ends before it starts");
        Self {
            id: SegmentId(NEXT_SEGMENT_ID.fetch_add(1, Ordering::Relaxed)),
            uris,
            start_time,
            end_time,
            start_byte: 0,
            end_byte: None,
            init_segment: None,
            timestamp_offset: 0.0,
            append_window_start: 0.0,
            append_window_end: f64::INFINITY,
            discontinuity_sequence: 0,
            partial_references: Vec::new(),
            is_partial: false,
            is_last_partial: false,
            is_preload: false,
            independent: true,
            mime_type: None,
            codecs: None,
            aes_key: None,
            segment_data: None,
            status: AtomicU8::new(SegmentStatus::Unknown.as_u8()),
        }
    }

    pub fn with_byte_range(mut self, start_byte: u64, end_byte: Option<u64>) -> Self {
        self.start_byte = start_byte;
        self.end_byte = end_byte;
        self
    }

    pub fn with_init_segment(mut self, init: Arc<InitSegmentReference>) -> Self {
        self.init_segment = Some(init);
        self
    }

    pub fn with_timestamp_offset(mut self, offset: f64) -> Self {
        self.timestamp_offset = offset;
        self
    }

    pub fn with_append_window(mut self, start: f64, end: f64) -> Self {
        debug_assert!(start <= end, "append window ends before it starts");
        self.append_window_start = start;
        self.append_window_end = end;
        self
    }

    pub fn with_discontinuity_sequence(mut self, sequence: i64) -> Self {
        self.discontinuity_sequence = sequence;
        self
    }

    /// Attach partial segments. The last one is flagged as the last partial.
    pub fn with_partials(mut self, partials: Vec<SegmentReference>) -> Self {
        let count = partials.len();
        self.partial_references = partials
            .into_iter()
            .enumerate()
            .map(|(i, mut partial)| {
                partial.is_partial = true;
                partial.is_last_partial = i + 1 == count;
                Arc::new(partial)
            })
            .collect();
        self
    }

    pub fn with_preload(mut self, is_preload: bool) -> Self {
        self.is_preload = is_preload;
        self
    }

    pub fn with_independent(mut self, independent: bool) -> Self {
        self.independent = independent;
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>, codecs: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self.codecs = Some(codecs.into());
        self
    }

    pub fn with_aes_key(mut self, key: Arc<AesKey>) -> Self {
        self.aes_key = Some(key);
        self
    }

    pub fn with_segment_data(mut self, data: Bytes) -> Self {
        self.segment_data = Some(data);
        self
    }

    pub fn with_status(self, status: SegmentStatus) -> Self {
        self.status.store(status.as_u8(), Ordering::Relaxed);
        self
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn uris(&self) -> &[String] {
        &self.uris
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    pub fn end_time(&self) -> f64 {
        self.end_time
    }

    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    pub fn start_byte(&self) -> u64 {
        self.start_byte
    }

    pub fn end_byte(&self) -> Option<u64> {
        self.end_byte
    }

    /// Declared size in bytes, when the byte range is closed.
    pub fn size(&self) -> Option<u64> {
        self.end_byte.map(|end| end + 1 - self.start_byte)
    }

    pub fn init_segment(&self) -> Option<&Arc<InitSegmentReference>> {
        self.init_segment.as_ref()
    }

    pub fn timestamp_offset(&self) -> f64 {
        self.timestamp_offset
    }

    pub fn append_window_start(&self) -> f64 {
        self.append_window_start
    }

    pub fn append_window_end(&self) -> f64 {
        self.append_window_end
    }

    pub fn discontinuity_sequence(&self) -> i64 {
        self.discontinuity_sequence
    }

    pub fn partial_references(&self) -> &[Arc<SegmentReference>] {
        &self.partial_references
    }

    pub fn has_partials(&self) -> bool {
        !self.partial_references.is_empty()
    }

    pub fn is_partial(&self) -> bool {
        self.is_partial
    }

    pub fn is_last_partial(&self) -> bool {
        self.is_last_partial
    }

    pub fn is_preload(&self) -> bool {
        self.is_preload
    }

    pub fn is_independent(&self) -> bool {
        self.independent
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    pub fn codecs(&self) -> Option<&str> {
        self.codecs.as_deref()
    }

    pub fn aes_key(&self) -> Option<&Arc<AesKey>> {
        self.aes_key.as_ref()
    }

    pub fn segment_data(&self) -> Option<&Bytes> {
        self.segment_data.as_ref()
    }

    pub fn status(&self) -> SegmentStatus {
        SegmentStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Record an observed status. Once available, a segment never goes back
    /// to missing.
    pub fn mark(&self, status: SegmentStatus) {
        let _ = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let current = SegmentStatus::from_u8(current);
                match (current, status) {
                    (SegmentStatus::Available, SegmentStatus::Missing) => None,
                    (_, SegmentStatus::Unknown) => None,
                    _ => Some(status.as_u8()),
                }
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_segment_value_equality() {
        let a = InitSegmentReference::new(vec!["https://cdn/init.mp4".into()], 0, Some(999));
        let b = InitSegmentReference::new(vec!["https://cdn/init.mp4".into()], 0, Some(999));
        let c = InitSegmentReference::new(vec!["https://cdn/init.mp4".into()], 0, None);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.key(), b.key());
        assert_eq!(a.size(), Some(1000));
        assert!(same_init_segment(Some(&Arc::new(a)), Some(&Arc::new(b))));
        assert!(same_init_segment(None, None));
        assert!(!same_init_segment(Some(&Arc::new(c)), None));
    }

    #[test]
    fn test_segment_ids_are_unique() {
        let a = SegmentReference::new(0.0, 2.0, vec!["a".into()]);
        let b = SegmentReference::new(0.0, 2.0, vec!["a".into()]);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_status_is_monotone() {
        let reference = SegmentReference::new(0.0, 2.0, vec!["a".into()]);
        assert_eq!(reference.status(), SegmentStatus::Unknown);
        reference.mark(SegmentStatus::Available);
        reference.mark(SegmentStatus::Missing);
        assert_eq!(reference.status(), SegmentStatus::Available);

        let missing = SegmentReference::new(0.0, 2.0, vec!["a".into()]);
        missing.mark(SegmentStatus::Missing);
        assert_eq!(missing.status(), SegmentStatus::Missing);
        missing.mark(SegmentStatus::Available);
        assert_eq!(missing.status(), SegmentStatus::Available);
    }

    #[test]
    fn test_partials_flag_last() {
        let reference = SegmentReference::new(0.0, 4.0, vec!["a".into()]).with_partials(vec![
            SegmentReference::new(0.0, 2.0, vec!["a.0".into()]),
            SegmentReference::new(2.0, 4.0, vec!["a.1".into()]),
        ]);
        let partials = reference.partial_references();
        assert!(partials.iter().all(|p| p.is_partial()));
        assert!(!partials[0].is_last_partial());
        assert!(partials[1].is_last_partial());
        assert!(!reference.is_partial());
    }
}
