//! `emsg` (event message) and `prft` (producer reference time) boxes.
//!
//! Both are looked up among the top-level boxes of a media segment.

use bytes::Bytes;
use tracing::trace;

use crate::box_utils::{Reader, boxes_in, full_box_header};

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;

/// A parsed `emsg` box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmsgBox {
    pub version: u8,
    pub scheme_id_uri: String,
    pub value: String,
    pub timescale: u32,
    /// Version 0: offset from the segment's earliest presentation time.
    pub presentation_time_delta: Option<u32>,
    /// Version 1: absolute presentation time.
    pub presentation_time: Option<u64>,
    pub event_duration: u32,
    pub id: u32,
    pub message_data: Bytes,
}

impl EmsgBox {
    /// Event start in seconds on the presentation timeline.
    ///
    /// Version 0 boxes are relative to the carrying segment's start; version 1
    /// boxes are absolute media times shifted by the timestamp offset.
    pub fn start_time(&self, segment_start: f64, timestamp_offset: f64) -> f64 {
        let timescale = f64::from(self.timescale.max(1));
        match (self.presentation_time_delta, self.presentation_time) {
            (Some(delta), _) => segment_start + f64::from(delta) / timescale,
            (None, Some(time)) => timestamp_offset + time as f64 / timescale,
            (None, None) => segment_start,
        }
    }

    /// Event duration in seconds. `0xFFFFFFFF` means unknown.
    pub fn duration(&self) -> Option<f64> {
        if self.event_duration == u32::MAX {
            return None;
        }
        Some(f64::from(self.event_duration) / f64::from(self.timescale.max(1)))
    }
}

/// A parsed `prft` box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerReferenceTime {
    pub reference_track_id: u32,
    pub ntp_timestamp: u64,
    pub media_time: u64,
}

impl ProducerReferenceTime {
    /// NTP timestamp converted to milliseconds since the Unix epoch.
    pub fn wall_clock_ms(&self) -> i64 {
        let secs = (self.ntp_timestamp >> 32) as i64 - NTP_UNIX_OFFSET_SECS as i64;
        let frac = ((self.ntp_timestamp & 0xFFFF_FFFF) * 1000) >> 32;
        secs * 1000 + frac as i64
    }
}

/// Parse every top-level `emsg` box in a media segment.
pub fn parse_emsg_boxes(data: &[u8]) -> Vec<EmsgBox> {
    boxes_in(data, 0, data.len())
        .filter(|parsed| &parsed.fourcc == b"emsg")
        .filter_map(|parsed| {
            let emsg = parse_emsg(parsed.body(data));
            if emsg.is_none() {
                trace!(offset = parsed.start, "Skipping malformed emsg box");
            }
            emsg
        })
        .collect()
}

fn parse_emsg(body: &[u8]) -> Option<EmsgBox> {
    let (version, _, payload) = full_box_header(body)?;
    let mut reader = Reader::new(payload);

    let emsg = if version == 0 {
        let scheme_id_uri = reader.read_cstring()?;
        let value = reader.read_cstring()?;
        let timescale = reader.read_u32()?;
        let delta = reader.read_u32()?;
        let event_duration = reader.read_u32()?;
        let id = reader.read_u32()?;
        EmsgBox {
            version,
            scheme_id_uri,
            value,
            timescale,
            presentation_time_delta: Some(delta),
            presentation_time: None,
            event_duration,
            id,
            message_data: Bytes::copy_from_slice(reader.remaining()),
        }
    } else {
        let timescale = reader.read_u32()?;
        let presentation_time = reader.read_u64()?;
        let event_duration = reader.read_u32()?;
        let id = reader.read_u32()?;
        let scheme_id_uri = reader.read_cstring()?;
        let value = reader.read_cstring()?;
        EmsgBox {
            version,
            scheme_id_uri,
            value,
            timescale,
            presentation_time_delta: None,
            presentation_time: Some(presentation_time),
            event_duration,
            id,
            message_data: Bytes::copy_from_slice(reader.remaining()),
        }
    };
    Some(emsg)
}

/// Parse the first top-level `prft` box of a media segment.
pub fn parse_prft(data: &[u8]) -> Option<ProducerReferenceTime> {
    let parsed = boxes_in(data, 0, data.len()).find(|parsed| &parsed.fourcc == b"prft")?;
    let (version, _, payload) = full_box_header(parsed.body(data))?;
    let mut reader = Reader::new(payload);
    let reference_track_id = reader.read_u32()?;
    let ntp_timestamp = reader.read_u64()?;
    let media_time = if version == 0 {
        u64::from(reader.read_u32()?)
    } else {
        reader.read_u64()?
    };
    Some(ProducerReferenceTime {
        reference_track_id,
        ntp_timestamp,
        media_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{make_box, make_emsg_v0, make_emsg_v1, make_prft};

    #[test]
    fn test_parse_emsg_v0() {
        let mut segment = make_emsg_v0("urn:mpeg:dash:event:2012", "1", 1000, 500, 2000, 7, b"hi");
        segment.extend_from_slice(&make_box(b"moof", &[]));

        let boxes = parse_emsg_boxes(&segment);
        assert_eq!(boxes.len(), 1);
        let emsg = &boxes[0];
        assert_eq!(emsg.scheme_id_uri, "urn:mpeg:dash:event:2012");
        assert_eq!(emsg.value, "1");
        assert_eq!(emsg.id, 7);
        assert_eq!(&emsg.message_data[..], b"hi");
        assert_eq!(emsg.start_time(10.0, 0.0), 10.5);
        assert_eq!(emsg.duration(), Some(2.0));
    }

    #[test]
    fn test_parse_emsg_v1_uses_timestamp_offset() {
        let segment = make_emsg_v1("https://aomedia.org/emsg/ID3", "", 90_000, 900_000, u32::MAX, 1, b"ID3");
        let boxes = parse_emsg_boxes(&segment);
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].start_time(100.0, -5.0), 5.0);
        assert_eq!(boxes[0].duration(), None);
    }

    #[test]
    fn test_parse_emsg_ignores_nested_boxes() {
        let nested = make_box(b"moof", &make_emsg_v0("urn:x", "", 1, 0, 0, 0, b""));
        assert!(parse_emsg_boxes(&nested).is_empty());
    }

    #[test]
    fn test_parse_prft() {
        // 2208988800 + 1 seconds, half a second fraction.
        let ntp = ((NTP_UNIX_OFFSET_SECS + 1) << 32) | 0x8000_0000;
        let mut segment = make_prft(0, 1, ntp, 12_345);
        segment.extend_from_slice(&make_box(b"mdat", &[0u8; 4]));

        let prft = parse_prft(&segment).unwrap();
        assert_eq!(prft.reference_track_id, 1);
        assert_eq!(prft.media_time, 12_345);
        assert_eq!(prft.wall_clock_ms(), 1500);
    }

    #[test]
    fn test_parse_prft_missing() {
        assert!(parse_prft(&make_box(b"mdat", &[1, 2, 3])).is_none());
    }
}
