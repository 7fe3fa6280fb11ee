#![forbid(unsafe_code)]

pub mod composite;
pub mod encode_ffmpeg;
pub mod error;
pub mod export;
pub mod media;
pub mod overlay;
pub mod position;

pub use error::{WatermarkError, WatermarkResult};
pub use export::{
    DEFAULT_WIDTH_FACTOR, GRAYSCALE_HINT, OUTPUT_SUFFIX, OverlayPlacement, REQUIRED_EXTENSION,
    RenderJob, RenderReport, RenderRequest, STATUS_RENDERING, plan_overlay, render,
    render_request, resolve_output_path, status_message,
};
pub use media::{VideoSourceInfo, probe_video};
pub use overlay::{NORMALIZED_OVERLAY_FILE_NAME, NormalizedOverlay, normalize_overlay};
pub use position::{HAlign, Position, VAlign, anchor_origin};
