/// Parsed view over a single ISOBMFF box inside a parent byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BoxView {
    pub(crate) start: usize,
    pub(crate) end: usize,
    pub(crate) fourcc: [u8; 4],
    pub(crate) body_start: usize,
    pub(crate) body_end: usize,
}

impl BoxView {
    pub(crate) fn body<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.body_start..self.body_end]
    }
}

/// Read a box header: returns `(total_box_size, fourcc, header_size)`.
///
/// Handles 32-bit size, 64-bit extended size (`size == 1`),
/// and box-extends-to-EOF (`size == 0`).
pub(crate) fn read_box_header(data: &[u8]) -> Option<(usize, [u8; 4], usize)> {
    if data.len() < 8 {
        return None;
    }

    let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as u64;
    let fourcc: [u8; 4] = [data[4], data[5], data[6], data[7]];

    if size == 1 {
        if data.len() < 16 {
            return None;
        }
        let ext_size = u64::from_be_bytes([
            data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
        ]);
        Some((usize::try_from(ext_size).ok()?, fourcc, 16))
    } else if size == 0 {
        Some((data.len(), fourcc, 8))
    } else {
        Some((size as usize, fourcc, 8))
    }
}

/// Parse a single box located at `offset` within `[0..end)`.
pub(crate) fn box_at(data: &[u8], offset: usize, end: usize) -> Option<BoxView> {
    if offset >= end {
        return None;
    }

    let remaining = &data[offset..end];
    let (size, fourcc, header_size) = read_box_header(remaining)?;

    if size < header_size || offset.checked_add(size)? > end {
        return None;
    }

    Some(BoxView {
        start: offset,
        end: offset + size,
        fourcc,
        body_start: offset + header_size,
        body_end: offset + size,
    })
}

/// Iterate over the complete boxes laid out back to back in `[start..end)`.
///
/// Iteration stops at the first truncated or malformed box.
pub(crate) fn boxes_in(data: &[u8], start: usize, end: usize) -> impl Iterator<Item = BoxView> + '_ {
    let mut offset = start;
    std::iter::from_fn(move || {
        let parsed = box_at(data, offset, end)?;
        offset = parsed.end;
        Some(parsed)
    })
}

/// Split a full box body into `(version, flags, payload)`.
pub(crate) fn full_box_header(body: &[u8]) -> Option<(u8, u32, &[u8])> {
    if body.len() < 4 {
        return None;
    }
    let flags = u32::from_be_bytes([0, body[1], body[2], body[3]]);
    Some((body[0], flags, &body[4..]))
}

/// Big-endian cursor over a box payload.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn skip(&mut self, n: usize) -> Option<()> {
        if self.pos.checked_add(n)? > self.data.len() {
            return None;
        }
        self.pos += n;
        Some(())
    }

    pub(crate) fn read_u32(&mut self) -> Option<u32> {
        let bytes = self.data.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn read_u64(&mut self) -> Option<u64> {
        let bytes = self.data.get(self.pos..self.pos + 8)?;
        self.pos += 8;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Some(u64::from_be_bytes(buf))
    }

    pub(crate) fn read_fourcc(&mut self) -> Option<[u8; 4]> {
        let bytes = self.data.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Read a NUL-terminated UTF-8 string (lossy).
    pub(crate) fn read_cstring(&mut self) -> Option<String> {
        let rest = self.data.get(self.pos..)?;
        let len = rest.iter().position(|&b| b == 0)?;
        let value = String::from_utf8_lossy(&rest[..len]).into_owned();
        self.pos += len + 1;
        Some(value)
    }

    pub(crate) fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos.min(self.data.len())..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{make_box, make_full_box};

    #[test]
    fn test_read_box_header_basic() {
        let data = make_box(b"free", &[1, 2, 3]);
        let (size, fourcc, header) = read_box_header(&data).unwrap();
        assert_eq!(size, 11);
        assert_eq!(&fourcc, b"free");
        assert_eq!(header, 8);
    }

    #[test]
    fn test_read_box_header_extended_size() {
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&20u64.to_be_bytes());
        data.extend_from_slice(&[0u8; 4]);
        let (size, fourcc, header) = read_box_header(&data).unwrap();
        assert_eq!(size, 20);
        assert_eq!(&fourcc, b"mdat");
        assert_eq!(header, 16);
    }

    #[test]
    fn test_read_box_header_too_short() {
        assert!(read_box_header(&[0, 0, 0]).is_none());
    }

    #[test]
    fn test_boxes_in_stops_at_truncated_box() {
        let mut data = make_box(b"styp", &[0u8; 4]);
        data.extend_from_slice(&make_box(b"moof", &[0u8; 8]));
        let mut truncated = make_box(b"mdat", &[0u8; 16]);
        truncated.truncate(12);
        data.extend_from_slice(&truncated);

        let names: Vec<_> = boxes_in(&data, 0, data.len()).map(|b| b.fourcc).collect();
        assert_eq!(names, vec![*b"styp", *b"moof"]);
    }

    #[test]
    fn test_full_box_header() {
        let data = make_full_box(b"mdhd", 1, 0x000102, &[9, 9]);
        let view = box_at(&data, 0, data.len()).unwrap();
        let (version, flags, payload) = full_box_header(view.body(&data)).unwrap();
        assert_eq!(version, 1);
        assert_eq!(flags, 0x000102);
        assert_eq!(payload, &[9, 9]);
    }

    #[test]
    fn test_reader_cstring() {
        let mut reader = Reader::new(b"urn:test\0v\0rest");
        assert_eq!(reader.read_cstring().as_deref(), Some("urn:test"));
        assert_eq!(reader.read_cstring().as_deref(), Some("v"));
        assert_eq!(reader.remaining(), b"rest");
        assert!(reader.read_cstring().is_none());
    }
}
