//! ffprobe / ffmpeg subprocess wrappers
//!
//! Two narrow jobs: classify a fetched image (is it already JPEG?) and
//! obtain a media duration from a URL when the extractor metadata lacks
//! one; plus the single ffmpeg conversion to JPEG. Children are killed if
//! their await is dropped, so a cancelled pipeline leaves no orphans.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde_json::Value;
use tokio::process::Command;
use tokio::time::timeout;

use crate::constants::subprocess::{FFMPEG_TIMEOUT, FFPROBE_TIMEOUT};
use crate::error::{FfmpegError, FfprobeError};

/// Codec name ffprobe reports for baseline JPEG streams.
const JPEG_CODEC: &str = "mjpeg";

#[derive(Debug, Clone)]
pub struct Ffprobe {
    binary: PathBuf,
}

impl Ffprobe {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Codec of the first video stream of a local image file.
    pub async fn image_codec(&self, path: &Path) -> Result<String, FfprobeError> {
        let value = self
            .probe_json(&[
                "-v",
                "error",
                "-print_format",
                "json",
                "-select_streams",
                "v:0",
                "-show_streams",
                &path.to_string_lossy(),
            ])
            .await?;
        value["streams"][0]["codec_name"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                FfprobeError::InvalidOutput(format!("no video stream in {}", path.display()))
            })
    }

    /// Whether the probed codec already is JPEG.
    pub fn is_jpeg(codec: &str) -> bool {
        codec.eq_ignore_ascii_case(JPEG_CODEC)
    }

    /// Container-level duration, in seconds, of a (possibly remote) media
    /// object. Used as a fallback when extractor metadata lacks one.
    pub async fn media_duration(&self, url: &str) -> Result<f64, FfprobeError> {
        let value = self
            .probe_json(&["-v", "error", "-print_format", "json", "-show_format", url])
            .await?;
        value["format"]["duration"]
            .as_str()
            .and_then(|raw| raw.parse::<f64>().ok())
            .ok_or_else(|| FfprobeError::InvalidOutput(format!("no duration for {url}")))
    }

    async fn probe_json(&self, args: &[&str]) -> Result<Value, FfprobeError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(FfprobeError::Spawn)?;
        let output = timeout(FFPROBE_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| FfprobeError::Timeout {
                seconds: FFPROBE_TIMEOUT.as_secs(),
            })?
            .map_err(FfprobeError::Spawn)?;

        if !output.status.success() {
            return Err(FfprobeError::NonZeroExit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| FfprobeError::InvalidOutput(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct Ffmpeg {
    binary: PathBuf,
}

impl Ffmpeg {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Convert any decodable image into a baseline JPEG at `output`.
    pub async fn convert_to_jpg(&self, input: &Path, output: &Path) -> Result<(), FfmpegError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-y")
            .args(["-v", "error"])
            .arg("-i")
            .arg(input)
            .args(["-frames:v", "1"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(FfmpegError::Spawn)?;
        let output_result = timeout(FFMPEG_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| FfmpegError::Timeout {
                seconds: FFMPEG_TIMEOUT.as_secs(),
            })?
            .map_err(FfmpegError::Spawn)?;

        if !output_result.status.success() {
            return Err(FfmpegError::NonZeroExit {
                code: output_result.status.code(),
                stderr: String::from_utf8_lossy(&output_result.stderr)
                    .trim()
                    .to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jpeg_codec_detection() {
        assert!(Ffprobe::is_jpeg("mjpeg"));
        assert!(Ffprobe::is_jpeg("MJPEG"));
        assert!(!Ffprobe::is_jpeg("png"));
        assert!(!Ffprobe::is_jpeg("webp"));
    }
}
