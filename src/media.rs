use std::{
    ffi::OsStr,
    io::Read as _,
    path::{Path, PathBuf},
    process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio},
    thread::JoinHandle,
};

use serde::Serialize;

use crate::error::{WatermarkError, WatermarkResult};

/// Probed properties of a source video.
///
/// `width`/`height` are the displayed size, i.e. already swapped for 90/270 degree
/// rotations, which is the size ffmpeg decodes frames at.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VideoSourceInfo {
    pub source_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    pub duration_sec: f64,
    pub has_audio: bool,
    /// Display rotation in degrees, normalized to 0, 90, 180 or 270.
    pub rotation_deg: u32,
}

impl VideoSourceInfo {
    pub fn source_fps(&self) -> f64 {
        if self.fps_den == 0 {
            0.0
        } else {
            f64::from(self.fps_num) / f64::from(self.fps_den)
        }
    }

    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

pub fn is_tool_on_path(tool: impl AsRef<OsStr>) -> bool {
    Command::new(tool)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[derive(serde::Deserialize)]
struct ProbeSideData {
    rotation: Option<f64>,
}

#[derive(serde::Deserialize)]
struct ProbeTags {
    rotate: Option<String>,
}

#[derive(serde::Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
    #[serde(default)]
    side_data_list: Vec<ProbeSideData>,
    tags: Option<ProbeTags>,
}

impl ProbeStream {
    fn rotation_deg(&self) -> u32 {
        let raw = self
            .side_data_list
            .iter()
            .find_map(|sd| sd.rotation)
            .or_else(|| {
                self.tags
                    .as_ref()
                    .and_then(|t| t.rotate.as_deref())
                    .and_then(|r| r.trim().parse::<f64>().ok())
            })
            .unwrap_or(0.0);
        (raw.round() as i64).rem_euclid(360) as u32
    }
}

#[derive(serde::Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[derive(serde::Deserialize)]
struct ProbeOut {
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

pub fn probe_video(source_path: &Path) -> WatermarkResult<VideoSourceInfo> {
    let out = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(source_path)
        .output()
        .map_err(|e| WatermarkError::media(format!("failed to run ffprobe: {e}")))?;
    if !out.status.success() {
        return Err(WatermarkError::media(format!(
            "ffprobe failed for '{}': {}",
            source_path.display(),
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }

    parse_probe_json(source_path, &out.stdout)
}

pub(crate) fn parse_probe_json(
    source_path: &Path,
    json: &[u8],
) -> WatermarkResult<VideoSourceInfo> {
    let parsed: ProbeOut = serde_json::from_slice(json)
        .map_err(|e| WatermarkError::media(format!("ffprobe json parse failed: {e}")))?;
    let video_stream = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| WatermarkError::media("no video stream found"))?;
    let coded_width = video_stream
        .width
        .ok_or_else(|| WatermarkError::media("missing video width from ffprobe"))?;
    let coded_height = video_stream
        .height
        .ok_or_else(|| WatermarkError::media("missing video height from ffprobe"))?;

    // ffmpeg autorotates on decode, so quarter turns come out transposed.
    let rotation_deg = video_stream.rotation_deg();
    let (width, height) = match rotation_deg {
        90 | 270 => (coded_height, coded_width),
        _ => (coded_width, coded_height),
    };

    let (fps_num, fps_den) = parse_ff_ratio(video_stream.r_frame_rate.as_deref().unwrap_or("0/1"))
        .ok_or_else(|| WatermarkError::media("invalid video r_frame_rate"))?;
    let duration_sec = parsed
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .or(video_stream.duration.as_deref())
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0);
    let has_audio = parsed
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    Ok(VideoSourceInfo {
        source_path: source_path.to_path_buf(),
        width,
        height,
        fps_num,
        fps_den,
        duration_sec,
        has_audio,
        rotation_deg,
    })
}

fn parse_ff_ratio(s: &str) -> Option<(u32, u32)> {
    let mut parts = s.split('/');
    let a = parts.next()?.parse::<u32>().ok()?;
    let b = parts.next()?.parse::<u32>().ok()?;
    if b == 0 {
        return None;
    }
    Some((a, b))
}

/// Collect a child's stderr on a helper thread so a chatty ffmpeg never blocks on a
/// full pipe while we are busy with stdin/stdout.
pub(crate) fn drain_stderr(stderr: ChildStderr) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut stderr = stderr;
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf);
        buf
    })
}

pub(crate) fn join_stderr(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|buf| String::from_utf8_lossy(&buf).trim().to_string())
        .unwrap_or_default()
}

/// A spawned ffmpeg child that is killed and reaped if dropped before being waited on.
pub(crate) struct FfmpegChild {
    child: Child,
    stderr: Option<JoinHandle<Vec<u8>>>,
    reaped: bool,
}

impl FfmpegChild {
    pub(crate) fn new(mut child: Child) -> Self {
        let stderr = child.stderr.take().map(drain_stderr);
        Self {
            child,
            stderr,
            reaped: false,
        }
    }

    /// Wait for exit and return the status together with everything written to stderr.
    pub(crate) fn wait(&mut self) -> std::io::Result<(ExitStatus, String)> {
        let status = self.child.wait()?;
        self.reaped = true;
        Ok((status, join_stderr(self.stderr.take())))
    }
}

impl Drop for FfmpegChild {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
        let _ = join_stderr(self.stderr.take());
    }
}

/// Streams decoded RGBA8 frames of a video out of an `ffmpeg` child process.
pub struct FrameDecoder {
    source_path: PathBuf,
    frame_len: usize,
    stdout: Option<ChildStdout>,
    proc: FfmpegChild,
}

impl FrameDecoder {
    pub fn spawn(source: &VideoSourceInfo) -> WatermarkResult<Self> {
        Self::spawn_program("ffmpeg", source)
    }

    pub(crate) fn spawn_program(
        program: impl AsRef<OsStr>,
        source: &VideoSourceInfo,
    ) -> WatermarkResult<Self> {
        let frame_len = source.frame_len();
        if frame_len == 0 {
            return Err(WatermarkError::media(
                "decoded video frame size is zero (invalid source dimensions)",
            ));
        }

        let mut child = Command::new(program)
            .args(["-v", "error", "-i"])
            .arg(&source.source_path)
            .args(["-map", "0:v:0", "-f", "rawvideo", "-pix_fmt", "rgba", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                WatermarkError::media(format!("failed to run ffmpeg for video decode: {e}"))
            })?;

        let stdout = child.stdout.take();
        let proc = FfmpegChild::new(child);
        let stdout = stdout
            .ok_or_else(|| WatermarkError::media("failed to open ffmpeg stdout (unexpected)"))?;

        Ok(Self {
            source_path: source.source_path.clone(),
            frame_len,
            stdout: Some(stdout),
            proc,
        })
    }

    /// Fill `buf` with the next frame. Returns `false` at end of stream.
    pub fn next_frame(&mut self, buf: &mut Vec<u8>) -> WatermarkResult<bool> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(false);
        };

        buf.resize(self.frame_len, 0);
        let mut filled = 0usize;
        while filled < self.frame_len {
            let n = stdout.read(&mut buf[filled..]).map_err(|e| {
                WatermarkError::media(format!("failed to read frame from ffmpeg: {e}"))
            })?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            self.stdout = None;
            return Ok(false);
        }
        if filled != self.frame_len {
            return Err(WatermarkError::media(format!(
                "truncated frame from '{}': got {filled} bytes, expected {}",
                self.source_path.display(),
                self.frame_len
            )));
        }
        Ok(true)
    }

    pub fn finish(mut self) -> WatermarkResult<()> {
        drop(self.stdout.take());

        let (status, stderr) = self.proc.wait().map_err(|e| {
            WatermarkError::media(format!("failed to wait for ffmpeg decoder: {e}"))
        })?;
        if !status.success() {
            return Err(WatermarkError::media(format!(
                "ffmpeg video decode failed for '{}': {stderr}",
                self.source_path.display(),
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    const PROBE: &str = r#"{
        "streams": [
            {"codec_type": "video", "width": 640, "height": 360, "r_frame_rate": "30000/1001"},
            {"codec_type": "audio"}
        ],
        "format": {"duration": "5.005000"}
    }"#;

    /// Write an executable shell script standing in for ffmpeg.
    #[cfg(unix)]
    pub(crate) fn fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt as _;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    pub(crate) fn source(width: u32, height: u32) -> VideoSourceInfo {
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
    fn parses_probe_output() {
        let info = parse_probe_json(Path::new("clip.mp4"), PROBE.as_bytes()).unwrap();
        assert_eq!((info.width, info.height), (640, 360));
        assert_eq!((info.fps_num, info.fps_den), (30000, 1001));
        assert!((info.duration_sec - 5.005).abs() < 1e-9);
        assert!(info.has_audio);
        assert_eq!(info.rotation_deg, 0);
        assert_eq!(info.frame_len(), 640 * 360 * 4);
        assert!((info.source_fps() - 29.97).abs() < 0.01);
    }

    #[test]
    fn quarter_turn_side_data_swaps_dimensions() {
        let json = r#"{"streams": [{"codec_type": "video", "width": 1920, "height": 1080,
            "r_frame_rate": "30/1",
            "side_data_list": [{"side_data_type": "Display Matrix", "rotation": -90}]}]}"#;
        let info = parse_probe_json(Path::new("phone.mp4"), json.as_bytes()).unwrap();
        assert_eq!(info.rotation_deg, 270);
        assert_eq!((info.width, info.height), (1080, 1920));
    }

    #[test]
    fn legacy_rotate_tag_swaps_dimensions() {
        let json = r#"{"streams": [{"codec_type": "video", "width": 1280, "height": 720,
            "r_frame_rate": "30/1", "tags": {"rotate": "90"}}]}"#;
        let info = parse_probe_json(Path::new("phone.mp4"), json.as_bytes()).unwrap();
        assert_eq!(info.rotation_deg, 90);
        assert_eq!((info.width, info.height), (720, 1280));
    }

    #[test]
    fn half_turn_keeps_dimensions() {
        let json = r#"{"streams": [{"codec_type": "video", "width": 640, "height": 360,
            "r_frame_rate": "30/1", "side_data_list": [{"rotation": 180}]}]}"#;
        let info = parse_probe_json(Path::new("a.mp4"), json.as_bytes()).unwrap();
        assert_eq!(info.rotation_deg, 180);
        assert_eq!((info.width, info.height), (640, 360));
    }

    #[test]
    fn falls_back_to_stream_duration() {
        let json = r#"{"streams": [{"codec_type": "video", "width": 2, "height": 2,
            "r_frame_rate": "25/1", "duration": "1.5"}]}"#;
        let info = parse_probe_json(Path::new("a.mp4"), json.as_bytes()).unwrap();
        assert!((info.duration_sec - 1.5).abs() < 1e-9);
        assert!(!info.has_audio);
    }

    #[test]
    fn missing_video_stream_is_media_error() {
        let json = r#"{"streams": [{"codec_type": "audio"}]}"#;
        let err = parse_probe_json(Path::new("a.mp4"), json.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("no video stream"));
    }

    #[test]
    fn ratio_rejects_zero_denominator() {
        assert_eq!(parse_ff_ratio("30/1"), Some((30, 1)));
        assert_eq!(parse_ff_ratio("30/0"), None);
        assert_eq!(parse_ff_ratio("abc"), None);
    }

    #[cfg(unix)]
    #[test]
    fn decoder_survives_ffmpeg_flooding_stderr() {
        let dir = tempfile::tempdir().unwrap();
        // ~100 KiB of errors, more than a pipe buffer, before any frame bytes.
        let ffmpeg = fake_tool(
            dir.path(),
            "ffmpeg",
            r#"i=0
while [ $i -lt 3000 ]; do
  echo "[h264 @ 0x0] error while decoding MB $i 7, bytestream -5" >&2
  i=$((i+1))
done
head -c 128 /dev/zero"#,
        );

        let mut decoder = FrameDecoder::spawn_program(&ffmpeg, &source(4, 4)).unwrap();
        let mut buf = Vec::new();
        assert!(decoder.next_frame(&mut buf).unwrap());
        assert!(decoder.next_frame(&mut buf).unwrap());
        assert!(!decoder.next_frame(&mut buf).unwrap());
        decoder.finish().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn decoder_failure_carries_ffmpeg_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = fake_tool(
            dir.path(),
            "ffmpeg",
            "echo 'clip.mp4: Invalid data found when processing input' >&2\nexit 1",
        );

        let mut decoder = FrameDecoder::spawn_program(&ffmpeg, &source(4, 4)).unwrap();
        let mut buf = Vec::new();
        assert!(!decoder.next_frame(&mut buf).unwrap());
        let err = decoder.finish().unwrap_err();
        assert!(err.to_string().contains("Invalid data found"), "{err}");
    }

    #[cfg(unix)]
    #[test]
    fn dropping_decoder_early_reaps_child() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = fake_tool(dir.path(), "ffmpeg", "exec sleep 30");

        let started = std::time::Instant::now();
        let decoder = FrameDecoder::spawn_program(&ffmpeg, &source(4, 4)).unwrap();
        drop(decoder);
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }
}
