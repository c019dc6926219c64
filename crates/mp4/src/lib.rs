//! Minimal ISOBMFF helpers used by the streaming engine.
//!
//! Only the handful of boxes the engine needs are understood: track
//! timescales and spatial video metadata from init segments, `emsg` and
//! `prft` boxes from media segments, and top-level `mdat` boundaries for
//! chunked low-latency appends.

mod box_utils;
pub mod emsg;
pub mod fragment;
pub mod isobmff;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

pub use emsg::{EmsgBox, ProducerReferenceTime, parse_emsg_boxes, parse_prft};
pub use fragment::last_complete_mdat_end;
pub use isobmff::{HandlerType, InitSegmentInfo, SpatialVideoInfo, parse_init_segment};

/// Render a FourCC as a printable string, replacing non-printable bytes.
pub fn fourcc_to_string(fourcc: &[u8; 4]) -> String {
    fourcc
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '?'
            }
        })
        .collect()
}
