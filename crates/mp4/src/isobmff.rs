//! Init segment inspection.
//!
//! Walks the `moov` tree of an fMP4 init segment to collect the media
//! timescale declared for each track handler, plus the spatial video
//! metadata (`prji` projection and `hfov`) carried by visual sample entries.

use tracing::debug;

use crate::box_utils::{BoxView, Reader, boxes_in, full_box_header};
use crate::fourcc_to_string;

/// Container boxes descended into while walking an init segment.
const CONTAINER_BOXES: &[[u8; 4]] = &[
    *b"moov", *b"trak", *b"mdia", *b"minf", *b"stbl", *b"vexu", *b"proj",
];

/// Visual sample entries that may carry spatial video boxes.
const VISUAL_SAMPLE_ENTRIES: &[[u8; 4]] = &[
    *b"encv", *b"avc1", *b"avc3", *b"hev1", *b"hvc1", *b"dvav", *b"dva1", *b"dvh1", *b"dvhe",
    *b"dvc1", *b"dvi1",
];

/// Bytes to skip in a visual sample entry body before child boxes begin.
///
/// Layout (ISO 14496-12 VisualSampleEntry):
///   6 reserved + 2 data_ref_idx + 16 pre-defined/reserved +
///   2 width + 2 height + 4 horiz_res + 4 vert_res + 4 reserved +
///   2 frame_count + 32 compressor_name + 2 depth + 2 pre-defined = 78 bytes
const VISUAL_SAMPLE_ENTRY_HEADER: usize = 78;

/// Track handler kind declared by `hdlr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerType {
    Audio,
    Video,
    Other([u8; 4]),
}

impl HandlerType {
    fn from_fourcc(fourcc: [u8; 4]) -> Self {
        match &fourcc {
            b"soun" => Self::Audio,
            b"vide" => Self::Video,
            _ => Self::Other(fourcc),
        }
    }
}

/// Spatial (immersive) video metadata found in an init segment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpatialVideoInfo {
    /// Projection kind from `prji`, e.g. `rect`, `equi`, `hequ`, `fish`.
    pub projection: Option<String>,
    /// Horizontal field of view in degrees from `hfov`.
    pub hfov: Option<f64>,
}

impl SpatialVideoInfo {
    pub fn is_empty(&self) -> bool {
        self.projection.is_none() && self.hfov.is_none()
    }
}

/// What the engine needs to know about an init segment.
#[derive(Debug, Clone, Default)]
pub struct InitSegmentInfo {
    /// `(handler, timescale)` per track, in `moov` order.
    pub timescales: Vec<(HandlerType, u32)>,
    /// Timescale of the last `mdhd` seen that was not followed by a `hdlr`.
    pub unassigned_timescale: Option<u32>,
    pub spatial_video: SpatialVideoInfo,
}

impl InitSegmentInfo {
    /// Timescale for the first track with the given handler.
    pub fn timescale_for(&self, handler: HandlerType) -> Option<u32> {
        self.timescales
            .iter()
            .find(|(h, _)| *h == handler)
            .map(|(_, timescale)| *timescale)
    }
}

/// Parse an fMP4 init segment.
///
/// Malformed or truncated boxes end the walk of their parent; whatever was
/// collected before that point is returned.
pub fn parse_init_segment(data: &[u8]) -> InitSegmentInfo {
    let mut info = InitSegmentInfo::default();
    let mut pending_timescale = None;
    walk(data, 0, data.len(), &mut info, &mut pending_timescale);
    info.unassigned_timescale = pending_timescale;
    info
}

fn walk(
    data: &[u8],
    start: usize,
    end: usize,
    info: &mut InitSegmentInfo,
    pending_timescale: &mut Option<u32>,
) {
    for parsed in boxes_in(data, start, end) {
        match &parsed.fourcc {
            fourcc if CONTAINER_BOXES.contains(fourcc) => {
                walk(data, parsed.body_start, parsed.body_end, info, pending_timescale);
            }
            b"mdhd" => {
                if let Some(timescale) = parse_mdhd(parsed.body(data)) {
                    *pending_timescale = Some(timescale);
                }
            }
            b"hdlr" => {
                if let Some(handler) = parse_hdlr(parsed.body(data)) {
                    if let Some(timescale) = pending_timescale.take() {
                        info.timescales.push((handler, timescale));
                    }
                }
            }
            b"stsd" => parse_stsd(data, &parsed, info, pending_timescale),
            b"prji" => {
                info.spatial_video.projection = parse_prji(parsed.body(data));
            }
            b"hfov" => {
                info.spatial_video.hfov = Reader::new(parsed.body(data))
                    .read_u32()
                    .map(|v| f64::from(v) / 1000.0);
            }
            _ => {}
        }
    }
}

/// `stsd` is a full box: version/flags, entry count, then sample entries.
fn parse_stsd(
    data: &[u8],
    stsd: &BoxView,
    info: &mut InitSegmentInfo,
    pending_timescale: &mut Option<u32>,
) {
    let entries_start = stsd.body_start + 8;
    if entries_start > stsd.body_end {
        return;
    }

    for entry in boxes_in(data, entries_start, stsd.body_end) {
        if !VISUAL_SAMPLE_ENTRIES.contains(&entry.fourcc) {
            continue;
        }
        debug!(
            sample_entry = %fourcc_to_string(&entry.fourcc),
            "Inspecting visual sample entry"
        );
        let children_start = entry.body_start + VISUAL_SAMPLE_ENTRY_HEADER;
        if children_start < entry.body_end {
            walk(data, children_start, entry.body_end, info, pending_timescale);
        }
    }
}

fn parse_mdhd(body: &[u8]) -> Option<u32> {
    let (version, _, payload) = full_box_header(body)?;
    let mut reader = Reader::new(payload);
    if version == 1 {
        reader.skip(16)?;
    } else {
        reader.skip(8)?;
    }
    reader.read_u32()
}

fn parse_hdlr(body: &[u8]) -> Option<HandlerType> {
    let (_, _, payload) = full_box_header(body)?;
    let mut reader = Reader::new(payload);
    reader.skip(4)?;
    reader.read_fourcc().map(HandlerType::from_fourcc)
}

fn parse_prji(body: &[u8]) -> Option<String> {
    let (_, _, payload) = full_box_header(body)?;
    Reader::new(payload)
        .read_fourcc()
        .map(|fourcc| fourcc_to_string(&fourcc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{make_box, make_full_box, make_init_segment, make_visual_sample_entry};

    #[test]
    fn test_parse_init_segment_empty() {
        let info = parse_init_segment(&[]);
        assert!(info.timescales.is_empty());
        assert!(info.spatial_video.is_empty());
    }

    #[test]
    fn test_parse_init_segment_video_timescale() {
        let init = make_init_segment(&[(*b"vide", 90_000)], &[]);
        let info = parse_init_segment(&init);
        assert_eq!(info.timescale_for(HandlerType::Video), Some(90_000));
        assert_eq!(info.timescale_for(HandlerType::Audio), None);
    }

    #[test]
    fn test_parse_init_segment_muxed_tracks() {
        let init = make_init_segment(&[(*b"vide", 90_000), (*b"soun", 48_000)], &[]);
        let info = parse_init_segment(&init);
        assert_eq!(info.timescale_for(HandlerType::Video), Some(90_000));
        assert_eq!(info.timescale_for(HandlerType::Audio), Some(48_000));
        assert_eq!(info.unassigned_timescale, None);
    }

    #[test]
    fn test_parse_init_segment_without_hdlr_keeps_timescale() {
        let mut mdhd_payload = Vec::new();
        mdhd_payload.extend_from_slice(&[0u8; 8]);
        mdhd_payload.extend_from_slice(&1000u32.to_be_bytes());
        mdhd_payload.extend_from_slice(&0u32.to_be_bytes());
        let mdhd = make_full_box(b"mdhd", 0, 0, &mdhd_payload);
        let mdia = make_box(b"mdia", &mdhd);
        let trak = make_box(b"trak", &mdia);
        let moov = make_box(b"moov", &trak);

        let info = parse_init_segment(&moov);
        assert!(info.timescales.is_empty());
        assert_eq!(info.unassigned_timescale, Some(1000));
    }

    #[test]
    fn test_parse_init_segment_mdhd_version_1() {
        let mut mdhd_payload = Vec::new();
        mdhd_payload.extend_from_slice(&[0u8; 16]);
        mdhd_payload.extend_from_slice(&30_000u32.to_be_bytes());
        mdhd_payload.extend_from_slice(&0u64.to_be_bytes());
        let mdhd = make_full_box(b"mdhd", 1, 0, &mdhd_payload);
        let mut hdlr_payload = vec![0u8; 4];
        hdlr_payload.extend_from_slice(b"vide");
        let hdlr = make_full_box(b"hdlr", 0, 0, &hdlr_payload);
        let mut mdia_body = mdhd;
        mdia_body.extend_from_slice(&hdlr);
        let moov = make_box(b"moov", &make_box(b"trak", &make_box(b"mdia", &mdia_body)));

        let info = parse_init_segment(&moov);
        assert_eq!(info.timescale_for(HandlerType::Video), Some(30_000));
    }

    #[test]
    fn test_parse_init_segment_spatial_video() {
        let prji = make_full_box(b"prji", 0, 0, b"hequ");
        let proj = make_box(b"proj", &prji);
        let hfov = make_box(b"hfov", &63_500u32.to_be_bytes());
        let mut vexu_body = proj;
        vexu_body.extend_from_slice(&hfov);
        let vexu = make_box(b"vexu", &vexu_body);
        let entry = make_visual_sample_entry(b"hvc1", &vexu);

        let init = make_init_segment(&[(*b"vide", 600)], &entry);
        let info = parse_init_segment(&init);
        assert_eq!(info.spatial_video.projection.as_deref(), Some("hequ"));
        assert_eq!(info.spatial_video.hfov, Some(63.5));
        assert_eq!(info.timescale_for(HandlerType::Video), Some(600));
    }
}
