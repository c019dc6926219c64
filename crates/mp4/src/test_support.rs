//! Shared fMP4 test builders.
//!
//! This module is available for local mp4 tests and optionally for downstream
//! crate tests when the `test-utils` feature is enabled.

/// Bytes in a visual sample entry body before child boxes begin.
const VISUAL_SAMPLE_ENTRY_HEADER: usize = 78;

pub fn make_box(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let size = (8 + body.len()) as u32;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(fourcc);
    out.extend_from_slice(body);
    out
}

pub fn make_full_box(fourcc: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + payload.len());
    body.push(version);
    body.push(((flags >> 16) & 0xFF) as u8);
    body.push(((flags >> 8) & 0xFF) as u8);
    body.push((flags & 0xFF) as u8);
    body.extend_from_slice(payload);
    make_box(fourcc, &body)
}

pub fn make_visual_sample_entry(fourcc: &[u8; 4], children: &[u8]) -> Vec<u8> {
    let mut body = vec![0u8; VISUAL_SAMPLE_ENTRY_HEADER];
    body.extend_from_slice(children);
    make_box(fourcc, &body)
}

/// Build a `moov` with one `trak` per `(handler, timescale)` pair.
///
/// `sample_entries` are placed in the first track's `stsd`.
pub fn make_init_segment(tracks: &[([u8; 4], u32)], sample_entries: &[u8]) -> Vec<u8> {
    let mut moov_body = Vec::new();
    for (index, (handler, timescale)) in tracks.iter().enumerate() {
        let mut mdhd_payload = Vec::new();
        mdhd_payload.extend_from_slice(&0u32.to_be_bytes()); // creation_time
        mdhd_payload.extend_from_slice(&0u32.to_be_bytes()); // modification_time
        mdhd_payload.extend_from_slice(&timescale.to_be_bytes());
        mdhd_payload.extend_from_slice(&0u32.to_be_bytes()); // duration
        mdhd_payload.extend_from_slice(&[0u8; 4]); // language + pre_defined
        let mdhd = make_full_box(b"mdhd", 0, 0, &mdhd_payload);

        let mut hdlr_payload = Vec::new();
        hdlr_payload.extend_from_slice(&0u32.to_be_bytes()); // pre_defined
        hdlr_payload.extend_from_slice(handler);
        hdlr_payload.extend_from_slice(&[0u8; 12]);
        hdlr_payload.push(0); // empty name
        let hdlr = make_full_box(b"hdlr", 0, 0, &hdlr_payload);

        let mut stsd_payload = Vec::new();
        if index == 0 && !sample_entries.is_empty() {
            stsd_payload.extend_from_slice(&1u32.to_be_bytes());
            stsd_payload.extend_from_slice(sample_entries);
        } else {
            stsd_payload.extend_from_slice(&0u32.to_be_bytes());
        }
        let stsd = make_full_box(b"stsd", 0, 0, &stsd_payload);
        let minf = make_box(b"minf", &make_box(b"stbl", &stsd));

        let mut mdia_body = mdhd;
        mdia_body.extend_from_slice(&hdlr);
        mdia_body.extend_from_slice(&minf);
        moov_body.extend_from_slice(&make_box(b"trak", &make_box(b"mdia", &mdia_body)));
    }

    let mut out = make_box(b"ftyp", b"iso6\0\0\0\0");
    out.extend_from_slice(&make_box(b"moov", &moov_body));
    out
}

/// A minimal `moof` + `mdat` chunk.
pub fn make_media_segment(track_id: u32, sample: &[u8]) -> Vec<u8> {
    let tfhd = make_full_box(b"tfhd", 0, 0, &track_id.to_be_bytes());
    let traf = make_box(b"traf", &tfhd);
    let mut out = make_box(b"moof", &traf);
    out.extend_from_slice(&make_box(b"mdat", sample));
    out
}

pub fn make_emsg_v0(
    scheme_id_uri: &str,
    value: &str,
    timescale: u32,
    presentation_time_delta: u32,
    event_duration: u32,
    id: u32,
    message: &[u8],
) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(scheme_id_uri.as_bytes());
    payload.push(0);
    payload.extend_from_slice(value.as_bytes());
    payload.push(0);
    payload.extend_from_slice(&timescale.to_be_bytes());
    payload.extend_from_slice(&presentation_time_delta.to_be_bytes());
    payload.extend_from_slice(&event_duration.to_be_bytes());
    payload.extend_from_slice(&id.to_be_bytes());
    payload.extend_from_slice(message);
    make_full_box(b"emsg", 0, 0, &payload)
}

pub fn make_emsg_v1(
    scheme_id_uri: &str,
    value: &str,
    timescale: u32,
    presentation_time: u64,
    event_duration: u32,
    id: u32,
    message: &[u8],
) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&timescale.to_be_bytes());
    payload.extend_from_slice(&presentation_time.to_be_bytes());
    payload.extend_from_slice(&event_duration.to_be_bytes());
    payload.extend_from_slice(&id.to_be_bytes());
    payload.extend_from_slice(scheme_id_uri.as_bytes());
    payload.push(0);
    payload.extend_from_slice(value.as_bytes());
    payload.push(0);
    payload.extend_from_slice(message);
    make_full_box(b"emsg", 1, 0, &payload)
}

pub fn make_prft(version: u8, reference_track_id: u32, ntp_timestamp: u64, media_time: u64) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&reference_track_id.to_be_bytes());
    payload.extend_from_slice(&ntp_timestamp.to_be_bytes());
    if version == 0 {
        payload.extend_from_slice(&(media_time as u32).to_be_bytes());
    } else {
        payload.extend_from_slice(&media_time.to_be_bytes());
    }
    make_full_box(b"prft", version, 0, &payload)
}
