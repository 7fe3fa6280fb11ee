use std::{
    ffi::OsStr,
    io::Write as _,
    path::{Path, PathBuf},
    process::{ChildStdin, Command, Stdio},
};

use crate::{
    error::{WatermarkError, WatermarkResult},
    media::{FfmpegChild, VideoSourceInfo, is_tool_on_path},
};

#[derive(Clone, Debug)]
pub struct EncodeConfig {
    pub width: u32,
    pub height: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    pub out_path: PathBuf,
    pub overwrite: bool,
    /// Encoder threads handed to ffmpeg.
    pub threads: usize,
    /// Muxes the first audio stream of this file into the output when set.
    pub audio_source: Option<PathBuf>,
}

impl EncodeConfig {
    pub fn validate(&self) -> WatermarkResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(WatermarkError::validation(
                "encode width/height must be non-zero",
            ));
        }
        if self.fps_num == 0 || self.fps_den == 0 {
            return Err(WatermarkError::validation("encode fps must be non-zero"));
        }
        if !self.width.is_multiple_of(2) || !self.height.is_multiple_of(2) {
            // yuv420p needs even dimensions.
            return Err(WatermarkError::validation(
                "encode width/height must be even (required for yuv420p mp4 output)",
            ));
        }
        if self.threads == 0 {
            return Err(WatermarkError::validation("encode threads must be non-zero"));
        }
        Ok(())
    }

    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    fn ffmpeg_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            (if self.overwrite { "-y" } else { "-n" }).to_string(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgba".into(),
            "-s".into(),
            format!("{}x{}", self.width, self.height),
            "-r".into(),
            format!("{}/{}", self.fps_num, self.fps_den),
            "-i".into(),
            "pipe:0".into(),
        ];

        if let Some(audio) = &self.audio_source {
            args.extend([
                "-i".into(),
                audio.to_string_lossy().into_owned(),
                "-map".into(),
                "0:v:0".into(),
                "-map".into(),
                "1:a:0?".into(),
                "-c:a".into(),
                "aac".into(),
                "-shortest".into(),
            ]);
        } else {
            args.push("-an".into());
        }

        args.extend([
            "-c:v".into(),
            "libx264".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-threads".into(),
            self.threads.to_string(),
            "-movflags".into(),
            "+faststart".into(),
        ]);
        args
    }
}

/// Encoder settings matching a probed source: same size and frame rate, all available
/// cores, source audio carried over when the source has any.
pub fn mp4_config_for_source(
    source: &VideoSourceInfo,
    out_path: impl Into<PathBuf>,
) -> EncodeConfig {
    EncodeConfig {
        width: source.width,
        height: source.height,
        fps_num: source.fps_num,
        fps_den: source.fps_den,
        out_path: out_path.into(),
        overwrite: true,
        threads: available_threads(),
        audio_source: source.has_audio.then(|| source.source_path.clone()),
    }
}

pub fn available_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

pub fn ensure_parent_dir(path: &Path) -> WatermarkResult<()> {
    if let Some(parent) = path.parent() {
        use anyhow::Context as _;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory '{}'", parent.display()))?;
    }
    Ok(())
}

pub struct FfmpegEncoder {
    cfg: EncodeConfig,
    stdin: Option<ChildStdin>,
    proc: FfmpegChild,
    frames_written: u64,
}

impl FfmpegEncoder {
    pub fn new(cfg: EncodeConfig) -> WatermarkResult<Self> {
        Self::with_program("ffmpeg", cfg)
    }

    pub(crate) fn with_program(
        program: impl AsRef<OsStr>,
        cfg: EncodeConfig,
    ) -> WatermarkResult<Self> {
        let program = program.as_ref();
        cfg.validate()?;
        ensure_parent_dir(&cfg.out_path)?;

        if !cfg.overwrite && cfg.out_path.exists() {
            return Err(WatermarkError::validation(format!(
                "output file '{}' already exists",
                cfg.out_path.display()
            )));
        }

        if !is_tool_on_path(program) {
            return Err(WatermarkError::encode(
                "ffmpeg is required for MP4 encoding, but was not found on PATH",
            ));
        }

        let mut cmd = Command::new(program);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .args(cfg.ffmpeg_args())
            .arg(&cfg.out_path);
        tracing::debug!(?cmd, "spawning ffmpeg encoder");

        let mut child = cmd.spawn().map_err(|e| {
            WatermarkError::encode(format!(
                "failed to spawn ffmpeg (is it installed and on PATH?): {e}"
            ))
        })?;

        let stdin = child.stdin.take();
        let proc = FfmpegChild::new(child);
        let stdin = stdin
            .ok_or_else(|| WatermarkError::encode("failed to open ffmpeg stdin (unexpected)"))?;

        Ok(Self {
            cfg,
            stdin: Some(stdin),
            proc,
            frames_written: 0,
        })
    }

    /// Write one opaque RGBA8 frame.
    ///
    /// If ffmpeg has already exited, the returned error carries its exit status and
    /// stderr rather than the bare broken pipe.
    pub fn encode_frame(&mut self, rgba: &[u8]) -> WatermarkResult<()> {
        if rgba.len() != self.cfg.frame_len() {
            return Err(WatermarkError::validation(format!(
                "frame size mismatch: got {} bytes, expected {} for {}x{}",
                rgba.len(),
                self.cfg.frame_len(),
                self.cfg.width,
                self.cfg.height
            )));
        }

        let Some(stdin) = self.stdin.as_mut() else {
            return Err(WatermarkError::encode("ffmpeg encoder is already finalized"));
        };

        if let Err(e) = stdin.write_all(rgba) {
            drop(self.stdin.take());
            return Err(match self.proc.wait() {
                Ok((status, stderr)) if !stderr.is_empty() => WatermarkError::encode(format!(
                    "ffmpeg exited with status {status}: {stderr}"
                )),
                Ok((status, _)) => WatermarkError::encode(format!(
                    "failed to write frame to ffmpeg stdin: {e} (exit status {status})"
                )),
                Err(_) => {
                    WatermarkError::encode(format!("failed to write frame to ffmpeg stdin: {e}"))
                }
            });
        }
        self.frames_written += 1;

        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn finish(mut self) -> WatermarkResult<u64> {
        drop(self.stdin.take());

        let (status, stderr) = self.proc.wait().map_err(|e| {
            WatermarkError::encode(format!("failed to wait for ffmpeg to finish: {e}"))
        })?;

        if !status.success() {
            return Err(WatermarkError::encode(format!(
                "ffmpeg exited with status {status}: {stderr}"
            )));
        }

        Ok(self.frames_written)
    }
}
