use std::path::{Path, PathBuf};

use anyhow::Context as _;
use image::{RgbaImage, imageops::FilterType};

use crate::error::{WatermarkError, WatermarkResult};

/// File name of the normalized overlay written next to the source overlay.
pub const NORMALIZED_OVERLAY_FILE_NAME: &str = "watermark_rgba.png";

/// Overlay normalized to straight-alpha RGBA8.
#[derive(Clone, Debug)]
pub struct NormalizedOverlay {
    /// Where the normalized copy was persisted.
    pub path: PathBuf,
    pub image: RgbaImage,
}

/// Overlay scaled for a specific frame, premultiplied and ready to composite.
#[derive(Clone, Debug)]
pub struct PreparedOverlay {
    pub width: u32,
    pub height: u32,
    /// Premultiplied RGBA8, row-major, tightly packed.
    pub rgba8_premul: Vec<u8>,
}

pub fn normalized_overlay_path(source: &Path) -> PathBuf {
    source
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join(NORMALIZED_OVERLAY_FILE_NAME)
}

/// Decode `source`, convert it to RGBA8 whatever its channel layout, and persist the
/// result as [`NORMALIZED_OVERLAY_FILE_NAME`] in the same directory (overwriting).
///
/// Grayscale inputs (including flat white/black logos some editors collapse to a
/// single channel) come out as four-channel sRGB.
pub fn normalize_overlay(source: &Path) -> WatermarkResult<NormalizedOverlay> {
    let decoded = image::open(source)
        .with_context(|| format!("decode overlay image '{}'", source.display()))?;
    tracing::debug!(
        color = ?decoded.color(),
        width = decoded.width(),
        height = decoded.height(),
        "decoded overlay"
    );
    let rgba = decoded.to_rgba8();

    let path = normalized_overlay_path(source);
    rgba.save_with_format(&path, image::ImageFormat::Png)
        .with_context(|| format!("write normalized overlay '{}'", path.display()))?;

    Ok(NormalizedOverlay { path, image: rgba })
}

/// Overlay width for a frame: `floor(video_width * factor)`, never below one pixel.
pub fn target_width(video_width: u32, factor: f64) -> WatermarkResult<u32> {
    validate_width_factor(factor)?;
    let w = (f64::from(video_width) * factor).floor() as u32;
    Ok(w.max(1))
}

pub fn validate_width_factor(factor: f64) -> WatermarkResult<()> {
    if !factor.is_finite() || factor <= 0.0 || factor > 1.0 {
        return Err(WatermarkError::validation(format!(
            "width factor must be in (0, 1], got {factor}"
        )));
    }
    Ok(())
}

/// Height that keeps the aspect ratio of `src_w`x`src_h` at `target_w`.
pub fn scaled_height(src_w: u32, src_h: u32, target_w: u32) -> u32 {
    if src_w == 0 {
        return 1;
    }
    let h = (f64::from(src_h) * f64::from(target_w) / f64::from(src_w)).round() as u32;
    h.max(1)
}

/// Resize to `target_w` preserving aspect ratio and premultiply alpha.
pub fn prepare_overlay(image: &RgbaImage, target_w: u32) -> WatermarkResult<PreparedOverlay> {
    let (src_w, src_h) = image.dimensions();
    if src_w == 0 || src_h == 0 {
        return Err(WatermarkError::validation("overlay image has zero size"));
    }
    let target_h = scaled_height(src_w, src_h, target_w);

    let resized = if (src_w, src_h) == (target_w, target_h) {
        image.clone()
    } else {
        image::imageops::resize(image, target_w, target_h, FilterType::Lanczos3)
    };

    let mut rgba8_premul = resized.into_raw();
    premultiply_rgba8_in_place(&mut rgba8_premul);

    Ok(PreparedOverlay {
        width: target_w,
        height: target_h,
        rgba8_premul,
    })
}

fn premultiply_rgba8_in_place(rgba: &mut [u8]) {
    for px in rgba.chunks_exact_mut(4) {
        let a = px[3] as u16;
        if a == 0 {
            px[0] = 0;
            px[1] = 0;
            px[2] = 0;
            continue;
        }
        px[0] = ((px[0] as u16 * a + 127) / 255) as u8;
        px[1] = ((px[1] as u16 * a + 127) / 255) as u8;
        px[2] = ((px[2] as u16 * a + 127) / 255) as u8;
    }
}
