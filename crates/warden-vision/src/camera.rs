use anyhow::{Context, Result};
use std::process::Command;
use tracing::debug;

fn unix_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// One captured frame: 8-bit BGR, tight rows, with the capture timestamp
/// taken at read time. Copied by value into the pipeline.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub ts_unix_ms: i64,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn from_bgr(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            ts_unix_ms: unix_ms(),
            data,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CameraConfig {
    pub mode: String,   // "libcamera-jpeg" | "v4l2-mjpeg"
    pub device: String, // /dev/video0 (v4l2)
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Opaque producer of (frame, timestamp) pairs. Returns Ok(None) when the
/// driver had nothing; the capture stage retries after 1 ms.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Pragmatic capture through external tooling:
/// - libcamera-jpeg: `libcamera-still -n -t 1 ... -o -` gives one JPEG on stdout
/// - v4l2-mjpeg: one MJPEG frame grabbed with ffmpeg
/// Keeps the Rust dependency surface small on the Pi.
pub struct SubprocessCamera {
    cfg: CameraConfig,
}

impl SubprocessCamera {
    pub fn new(cfg: CameraConfig) -> Result<Self> {
        match cfg.mode.as_str() {
            "libcamera-jpeg" | "v4l2-mjpeg" => Ok(Self { cfg }),
            other => anyhow::bail!("unknown camera.mode: {}", other),
        }
    }

    fn capture_jpeg(&self) -> Result<Vec<u8>> {
        match self.cfg.mode.as_str() {
            "libcamera-jpeg" => {
                let mut cmd = Command::new("libcamera-still");
                cmd.args([
                    "-n",
                    "-t",
                    "1",
                    "--width",
                    &self.cfg.width.to_string(),
                    "--height",
                    &self.cfg.height.to_string(),
                    "-o",
                    "-",
                ]);
                debug!("capture: libcamera-still");
                let out = cmd.output().context("run libcamera-still")?;
                anyhow::ensure!(out.status.success(), "libcamera-still failed");
                Ok(out.stdout)
            }
            _ => {
                let mut cmd = Command::new("ffmpeg");
                cmd.args([
                    "-hide_banner",
                    "-loglevel",
                    "error",
                    "-f",
                    "video4linux2",
                    "-input_format",
                    "mjpeg",
                    "-video_size",
                    &format!("{}x{}", self.cfg.width, self.cfg.height),
                    "-i",
                    &self.cfg.device,
                    "-vframes",
                    "1",
                    "-f",
                    "image2pipe",
                    "-vcodec",
                    "mjpeg",
                    "-",
                ]);
                debug!("capture: ffmpeg v4l2");
                let out = cmd.output().context("run ffmpeg capture")?;
                anyhow::ensure!(out.status.success(), "ffmpeg capture failed");
                Ok(out.stdout)
            }
        }
    }
}

impl FrameSource for SubprocessCamera {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let jpeg = self.capture_jpeg()?;
        if jpeg.is_empty() {
            return Ok(None);
        }
        Ok(Some(decode_jpeg_bgr(&jpeg)?))
    }
}

/// Decode a JPEG into a BGR frame, timestamped at decode completion.
pub fn decode_jpeg_bgr(jpeg: &[u8]) -> Result<Frame> {
    let img = image::load_from_memory(jpeg).context("decode jpeg frame")?;
    let rgb = img.to_rgb8();
    let (w, h) = (rgb.width(), rgb.height());
    let mut bgr = Vec::with_capacity((w * h * 3) as usize);
    for px in rgb.pixels() {
        bgr.push(px.0[2]);
        bgr.push(px.0[1]);
        bgr.push(px.0[0]);
    }
    Ok(Frame::from_bgr(w, h, bgr))
}
