use crate::{
    error::{WatermarkError, WatermarkResult},
    overlay::PreparedOverlay,
};

pub type PremulRgba8 = [u8; 4];

/// Source-over for premultiplied RGBA8.
pub fn over(dst: PremulRgba8, src: PremulRgba8) -> PremulRgba8 {
    let sa = u16::from(src[3]);
    if sa == 0 {
        return dst;
    }
    if sa == 255 {
        return src;
    }

    let inv = 255u16 - sa;

    let mut out = [0u8; 4];
    out[3] = src[3].saturating_add(mul_div255(u16::from(dst[3]), inv));
    for i in 0..3 {
        out[i] = src[i].saturating_add(mul_div255(u16::from(dst[i]), inv));
    }
    out
}

/// Composite `overlay` onto an RGBA8 `frame` with its top-left corner at `(x, y)`.
///
/// The parts of the overlay that fall outside the frame are clipped.
pub fn composite_overlay(
    frame: &mut [u8],
    frame_w: u32,
    frame_h: u32,
    overlay: &PreparedOverlay,
    x: i64,
    y: i64,
) -> WatermarkResult<()> {
    if frame.len() != frame_w as usize * frame_h as usize * 4 {
        return Err(WatermarkError::validation(format!(
            "frame buffer size mismatch: got {} bytes for {frame_w}x{frame_h}",
            frame.len()
        )));
    }
    if overlay.rgba8_premul.len() != overlay.width as usize * overlay.height as usize * 4 {
        return Err(WatermarkError::validation(
            "overlay buffer size mismatch with width*height*4",
        ));
    }

    let x0 = x.max(0);
    let y0 = y.max(0);
    let x1 = (x + i64::from(overlay.width)).min(i64::from(frame_w));
    let y1 = (y + i64::from(overlay.height)).min(i64::from(frame_h));
    if x0 >= x1 || y0 >= y1 {
        return Ok(());
    }

    let span = (x1 - x0) as usize;
    let frame_stride = frame_w as usize * 4;
    let overlay_stride = overlay.width as usize * 4;

    for fy in y0..y1 {
        let oy = (fy - y) as usize;
        let ox = (x0 - x) as usize;
        let src_off = oy * overlay_stride + ox * 4;
        let dst_off = fy as usize * frame_stride + x0 as usize * 4;

        let src_row = &overlay.rgba8_premul[src_off..src_off + span * 4];
        let dst_row = &mut frame[dst_off..dst_off + span * 4];
        for (d, s) in dst_row.chunks_exact_mut(4).zip(src_row.chunks_exact(4)) {
            let out = over([d[0], d[1], d[2], d[3]], [s[0], s[1], s[2], s[3]]);
            d.copy_from_slice(&out);
        }
    }
    Ok(())
}

fn mul_div255(x: u16, y: u16) -> u8 {
    (((u32::from(x) * u32::from(y)) + 127) / 255) as u8
}
