//! Chunk boundary detection for progressively received fMP4 media segments.

use crate::box_utils::read_box_header;

/// Returns the end offset of the last complete top-level `mdat` box in `data`.
///
/// Everything before the returned offset is a sequence of whole top-level
/// boxes ending in an `mdat`, and can be appended on its own. Scanning stops
/// at the first incomplete box. A box whose size field is `0` (extends to end
/// of file) is treated as incomplete since its extent is unknown while the
/// download is still in progress.
pub fn last_complete_mdat_end(data: &[u8]) -> Option<usize> {
    let mut offset = 0;
    let mut last_mdat_end = None;

    while offset < data.len() {
        let Some((size, fourcc, header_size)) = read_box_header(&data[offset..]) else {
            break;
        };
        let extends_to_eof = data[offset..offset + 4] == [0, 0, 0, 0];
        if extends_to_eof || size < header_size {
            break;
        }
        let Some(end) = offset.checked_add(size) else {
            break;
        };
        if end > data.len() {
            break;
        }
        if &fourcc == b"mdat" {
            last_mdat_end = Some(end);
        }
        offset = end;
    }

    last_mdat_end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{make_box, make_media_segment};

    #[test]
    fn test_no_mdat_yet() {
        let moof = make_box(b"moof", &[0u8; 16]);
        assert_eq!(last_complete_mdat_end(&moof), None);
    }

    #[test]
    fn test_single_complete_chunk() {
        let chunk = make_media_segment(1, &[7u8; 32]);
        assert_eq!(last_complete_mdat_end(&chunk), Some(chunk.len()));
    }

    #[test]
    fn test_trailing_partial_chunk_is_excluded() {
        let first = make_media_segment(1, &[1u8; 10]);
        let second = make_media_segment(1, &[2u8; 10]);
        let mut data = first.to_vec();
        data.extend_from_slice(&second[..second.len() - 3]);
        assert_eq!(last_complete_mdat_end(&data), Some(first.len()));
    }

    #[test]
    fn test_multiple_chunks() {
        let first = make_media_segment(1, &[1u8; 10]);
        let second = make_media_segment(1, &[2u8; 20]);
        let mut data = first.to_vec();
        data.extend_from_slice(&second);
        assert_eq!(last_complete_mdat_end(&data), Some(data.len()));
    }

    #[test]
    fn test_size_zero_mdat_is_incomplete() {
        let mut data = make_box(b"moof", &[0u8; 8]);
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&[9u8; 8]);
        assert_eq!(last_complete_mdat_end(&data), None);
    }
}
