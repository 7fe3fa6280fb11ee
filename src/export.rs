use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    composite::composite_overlay,
    encode_ffmpeg::{EncodeConfig, FfmpegEncoder, mp4_config_for_source},
    error::{WatermarkError, WatermarkResult},
    media::{FrameDecoder, VideoSourceInfo, probe_video},
    overlay::{
        normalize_overlay, prepare_overlay, scaled_height, target_width, validate_width_factor,
    },
    position::{Position, anchor_origin},
};

/// Overlay width as a fraction of the video width.
pub const DEFAULT_WIDTH_FACTOR: f64 = 0.1;
/// The only container extension the exporter writes.
pub const REQUIRED_EXTENSION: &str = ".mp4";
/// Appended to the video stem when no output name is given.
pub const OUTPUT_SUFFIX: &str = "watermarked";
/// Status shown while a render is in flight.
pub const STATUS_RENDERING: &str = "Rendering";
/// Printed when encoding fails, the usual cause being an overlay that an external
/// tool collapsed to grayscale.
pub const GRAYSCALE_HINT: &str = "RENDER FAILED: some programs optimize white or black images to grayscale automatically; make sure the watermark file is in sRGB colorspace, NOT grayscale";

/// Everything a caller supplies for one render.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RenderRequest {
    pub video_path: PathBuf,
    pub overlay_path: PathBuf,
    pub output_dir: PathBuf,
    /// Output file name; empty means `<video stem>watermarked<video ext>`.
    #[serde(default)]
    pub output_name: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default = "default_width_factor")]
    pub width_factor: f64,
}

fn default_width_factor() -> f64 {
    DEFAULT_WIDTH_FACTOR
}

impl RenderRequest {
    pub fn new(
        video_path: impl Into<PathBuf>,
        overlay_path: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        output_name: impl Into<String>,
        position: Position,
    ) -> Self {
        Self {
            video_path: video_path.into(),
            overlay_path: overlay_path.into(),
            output_dir: output_dir.into(),
            output_name: output_name.into(),
            position,
            width_factor: DEFAULT_WIDTH_FACTOR,
        }
    }

    /// Resolve the output path and validate the request. Touches no files.
    pub fn into_job(self) -> WatermarkResult<RenderJob> {
        require_path(&self.video_path, "video path")?;
        require_path(&self.overlay_path, "overlay path")?;
        require_path(&self.output_dir, "output directory")?;

        let output_path =
            resolve_output_path(&self.video_path, &self.output_dir, &self.output_name)?;
        RenderJob::new(
            self.video_path,
            self.overlay_path,
            output_path,
            self.position,
            self.width_factor,
        )
    }
}

/// A validated, single-use render.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderJob {
    pub video_path: PathBuf,
    pub overlay_path: PathBuf,
    pub output_path: PathBuf,
    pub position: Position,
    pub width_factor: f64,
}

impl RenderJob {
    pub fn new(
        video_path: impl Into<PathBuf>,
        overlay_path: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
        position: Position,
        width_factor: f64,
    ) -> WatermarkResult<Self> {
        let job = Self {
            video_path: video_path.into(),
            overlay_path: overlay_path.into(),
            output_path: output_path.into(),
            position,
            width_factor,
        };
        require_path(&job.video_path, "video path")?;
        require_path(&job.overlay_path, "overlay path")?;
        require_path(&job.output_path, "output path")?;
        let name = job
            .output_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        check_extension(&name)?;
        validate_width_factor(job.width_factor)?;
        Ok(job)
    }
}

fn require_path(path: &Path, what: &str) -> WatermarkResult<()> {
    if path.as_os_str().is_empty() {
        return Err(WatermarkError::validation(format!("{what} is required")));
    }
    Ok(())
}

fn check_extension(file_name: &str) -> WatermarkResult<()> {
    if !file_name.ends_with(REQUIRED_EXTENSION) {
        return Err(WatermarkError::validation("extension must be mp4"));
    }
    Ok(())
}

/// Output path for a request: `output_dir/output_name`, or
/// `output_dir/<video stem>watermarked<video ext>` when the name is empty.
pub fn resolve_output_path(
    video_path: &Path,
    output_dir: &Path,
    output_name: &str,
) -> WatermarkResult<PathBuf> {
    let name = if output_name.trim().is_empty() {
        derived_output_name(video_path)?
    } else {
        output_name.to_string()
    };
    check_extension(&name)?;
    Ok(output_dir.join(name))
}

pub fn derived_output_name(video_path: &Path) -> WatermarkResult<String> {
    let stem = video_path
        .file_stem()
        .ok_or_else(|| {
            WatermarkError::validation(format!(
                "cannot derive output name from '{}'",
                video_path.display()
            ))
        })?
        .to_string_lossy();
    let ext = video_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    Ok(format!("{stem}{OUTPUT_SUFFIX}{ext}"))
}

/// Where and how big the overlay lands in every frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct OverlayPlacement {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
    /// Always the full video duration.
    pub duration_sec: f64,
}

pub fn plan_overlay(
    video: &VideoSourceInfo,
    overlay_w: u32,
    overlay_h: u32,
    position: Position,
    width_factor: f64,
) -> WatermarkResult<OverlayPlacement> {
    let width = target_width(video.width, width_factor)?;
    let height = scaled_height(overlay_w, overlay_h, width);
    let (x, y) = anchor_origin(video.width, video.height, width, height, position.resolve());
    Ok(OverlayPlacement {
        x,
        y,
        width,
        height,
        duration_sec: video.duration_sec,
    })
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RenderReport {
    pub output_path: PathBuf,
    pub normalized_overlay_path: PathBuf,
    pub placement: OverlayPlacement,
    pub frames: u64,
    pub audio_muxed: bool,
}

/// Validate a request and render it.
pub fn render_request(request: RenderRequest) -> WatermarkResult<RenderReport> {
    let job = request.into_job()?;
    render(&job)
}

/// Composite the job's overlay over every frame of its video and write the MP4.
///
/// Blocks until ffmpeg has finished writing. A failed encode leaves whatever partial
/// output ffmpeg produced.
#[tracing::instrument(
    skip_all,
    fields(video = %job.video_path.display(), position = %job.position)
)]
pub fn render(job: &RenderJob) -> WatermarkResult<RenderReport> {
    let normalized = normalize_overlay(&job.overlay_path)?;
    tracing::debug!(path = %normalized.path.display(), "normalized overlay");

    let video = probe_video(&job.video_path)?;
    let (ow, oh) = normalized.image.dimensions();
    let placement = plan_overlay(&video, ow, oh, job.position, job.width_factor)?;
    tracing::debug!(
        ?placement,
        width = video.width,
        height = video.height,
        fps = video.source_fps(),
        rotation = video.rotation_deg,
        "overlay plan"
    );

    let overlay = prepare_overlay(&normalized.image, placement.width)?;

    let cfg = mp4_config_for_source(&video, &job.output_path);
    let audio_muxed = cfg.audio_source.is_some();

    let frames = match encode_composited(&video, cfg, |frame| {
        composite_overlay(
            frame,
            video.width,
            video.height,
            &overlay,
            placement.x,
            placement.y,
        )
    }) {
        Ok(frames) => frames,
        Err(err @ WatermarkError::Encode(_)) => {
            tracing::error!("{GRAYSCALE_HINT}");
            return Err(err);
        }
        Err(err) => return Err(err),
    };

    tracing::info!(frames, out = %job.output_path.display(), "render finished");
    Ok(RenderReport {
        output_path: job.output_path.clone(),
        normalized_overlay_path: normalized.path,
        placement,
        frames,
        audio_muxed,
    })
}

fn encode_composited(
    video: &VideoSourceInfo,
    cfg: EncodeConfig,
    mut apply: impl FnMut(&mut [u8]) -> WatermarkResult<()>,
) -> WatermarkResult<u64> {
    cfg.validate()?;
    let mut decoder = FrameDecoder::spawn(video)?;
    let mut encoder = FfmpegEncoder::new(cfg)?;

    let mut buf = Vec::with_capacity(video.frame_len());
    while decoder.next_frame(&mut buf)? {
        apply(&mut buf)?;
        encoder.encode_frame(&buf)?;
    }
    decoder.finish()?;

    if encoder.frames_written() == 0 {
        return Err(WatermarkError::media(format!(
            "no frames decoded from '{}'",
            video.source_path.display()
        )));
    }
    encoder.finish()
}

/// One-line status for the outcome of a render.
pub fn status_message(result: &WatermarkResult<RenderReport>) -> String {
    match result {
        Ok(report) => format!("Wrote: {}", report.output_path.display()),
        Err(WatermarkError::Validation(msg)) => msg.clone(),
        Err(err) => format!("Render failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(width: u32, height: u32) -> VideoSourceInfo {
        VideoSourceInfo {
            source_path: PathBuf::from("clip.mp4"),
            width,
            height,
            fps_num: 30,
            fps_den: 1,
            duration_sec: 5.0,
            has_audio: false,
            rotation_deg: 0,
        }
    }

    #[test]
    fn empty_name_derives_from_video_stem() {
        let p =
            resolve_output_path(Path::new("/videos/clip.mp4"), Path::new("/out"), "").unwrap();
        assert_eq!(p, PathBuf::from("/out/clipwatermarked.mp4"));
    }

    #[test]
    fn explicit_name_is_joined() {
        let p =
            resolve_output_path(Path::new("clip.mp4"), Path::new("/out"), "final.mp4").unwrap();
        assert_eq!(p, PathBuf::from("/out/final.mp4"));
    }

    #[test]
    fn extension_check_is_exact_suffix() {
        assert!(check_extension("final.mp4").is_ok());
        assert!(check_extension(".mp4").is_ok());
        assert!(check_extension("final.MP4").is_err());
        assert!(check_extension("final.avi").is_err());
        assert!(check_extension("mp4").is_err());
    }

    #[test]
    fn wrong_extension_reports_status() {
        let err = resolve_output_path(Path::new("clip.mp4"), Path::new("/out"), "final.avi")
            .unwrap_err();
        assert_eq!(status_message(&Err(err)), "extension must be mp4");
    }

    #[test]
    fn derived_name_from_non_mp4_video_is_rejected() {
        let err = resolve_output_path(Path::new("clip.mov"), Path::new("/out"), "").unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn missing_paths_are_validation_errors() {
        let req = RenderRequest::new("", "logo.png", "/out", "", Position::Center);
        let err = req.into_job().unwrap_err();
        assert_eq!(err.to_string(), "validation error: video path is required");

        let req = RenderRequest::new("clip.mp4", "logo.png", "", "", Position::Center);
        assert!(req.into_job().unwrap_err().is_validation());
    }

    #[test]
    fn job_rejects_bad_width_factor() {
        let err = RenderJob::new("a.mp4", "b.png", "c.mp4", Position::Top, 0.0).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn plan_scales_to_tenth_of_width_for_full_duration() {
        let p = plan_overlay(&video(640, 360), 200, 100, Position::BottomRight, 0.1).unwrap();
        assert_eq!(
            p,
            OverlayPlacement {
                x: 576,
                y: 328,
                width: 64,
                height: 32,
                duration_sec: 5.0,
            }
        );
    }

    #[test]
    fn plan_top_left_is_origin() {
        let p = plan_overlay(&video(1920, 1080), 50, 50, Position::TopLeft, 0.1).unwrap();
        assert_eq!((p.x, p.y, p.width, p.height), (0, 0, 192, 192));
    }

    #[test]
    fn request_json_fills_defaults() {
        let req: RenderRequest = serde_json::from_str(
            r#"{"video_path": "clip.mp4", "overlay_path": "logo.png", "output_dir": "/out"}"#,
        )
        .unwrap();
        assert_eq!(req.position, Position::Center);
        assert_eq!(req.output_name, "");
        assert_eq!(req.width_factor, DEFAULT_WIDTH_FACTOR);
    }

    #[test]
    fn success_status_names_output() {
        let report = RenderReport {
            output_path: PathBuf::from("/out/clipwatermarked.mp4"),
            normalized_overlay_path: PathBuf::from("/logos/watermark_rgba.png"),
            placement: plan_overlay(&video(640, 360), 10, 10, Position::Center, 0.1).unwrap(),
            frames: 150,
            audio_muxed: false,
        };
        assert_eq!(status_message(&Ok(report)), "Wrote: /out/clipwatermarked.mp4");
    }
}
