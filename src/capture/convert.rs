//! Alpha-first 4-byte pixels to packed RGB888.

use super::RawSample;
use crate::assets::{FRAME_BYTES_PER_PIXEL, SOURCE_BYTES_PER_PIXEL};

/// Convert `sample` into `dst`, one row at a time, dropping alpha.
///
/// Source rows are addressed with the sample stride so padded rows are
/// tolerated. `dst` must hold at least `width * height * 3` bytes and the sample
/// must satisfy [`RawSample::validate`]; both are caller contracts.
pub fn convert(sample: &RawSample<'_>, dst: &mut [u8]) {
    let width = sample.width as usize;
    let height = sample.height as usize;
    let src_row_len = width * SOURCE_BYTES_PER_PIXEL;
    let dst_row_len = width * FRAME_BYTES_PER_PIXEL;
    let (r, g, b) = sample.layout.rgb_offsets();

    for row in 0..height {
        let src_start = row * sample.bytes_per_row;
        let src = &sample.data[src_start..src_start + src_row_len];
        let dst_start = row * dst_row_len;
        let out = &mut dst[dst_start..dst_start + dst_row_len];

        for (px, rgb) in src
            .chunks_exact(SOURCE_BYTES_PER_PIXEL)
            .zip(out.chunks_exact_mut(FRAME_BYTES_PER_PIXEL))
        {
            rgb[0] = px[r];
            rgb[1] = px[g];
            rgb[2] = px[b];
        }
    }
}
