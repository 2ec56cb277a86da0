//! Thin wrappers around the external `ffmpeg` and `ffprobe` binaries.

use std::{
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
};

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Thumbnails are always rendered at this size.
pub const THUMBNAIL_SIZE: &str = "320x240";

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },
    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("unexpected ffprobe output {0:?}")]
    Parse(String),
}

/// Locations of the media tools, taken from configuration.
#[derive(Debug, Clone)]
pub struct MediaTools {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Default for MediaTools {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

impl MediaTools {
    /// Runs `<tool> -version` for both binaries so a missing install is
    /// reported at start-up instead of on the first upload.
    pub async fn check_available(&self) -> Result<(), ProbeError> {
        for tool in [&self.ffmpeg, &self.ffprobe] {
            let mut command = Command::new(tool);
            command.arg("-version");
            run(command, tool).await?;
        }
        Ok(())
    }

    /// Reads the container duration in seconds. Containers that do not
    /// declare one yield `None`.
    pub async fn probe_duration(&self, video: &Path) -> Result<Option<f64>, ProbeError> {
        let mut command = Command::new(&self.ffprobe);
        command
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(video);
        let stdout = run(command, &self.ffprobe).await?;
        parse_duration(&String::from_utf8_lossy(&stdout))
    }

    /// Grabs one frame at `at_seconds` and writes it to `output` as a
    /// [`THUMBNAIL_SIZE`] image whose format follows the output extension.
    pub async fn generate_thumbnail(
        &self,
        video: &Path,
        output: &Path,
        at_seconds: f64,
    ) -> Result<(), ProbeError> {
        let mut command = Command::new(&self.ffmpeg);
        command
            .args(["-y", "-loglevel", "error", "-ss"])
            .arg(format!("{at_seconds:.3}"))
            .arg("-i")
            .arg(video)
            .args(["-frames:v", "1", "-s", THUMBNAIL_SIZE])
            .arg(output);
        run(command, &self.ffmpeg).await?;
        Ok(())
    }
}

/// Frame used for the thumbnail: the middle of the video, or the first frame
/// when the duration is unknown.
pub fn thumbnail_timestamp(duration: Option<f64>) -> f64 {
    match duration {
        Some(seconds) if seconds.is_finite() && seconds > 0.0 => seconds / 2.0,
        _ => 0.0,
    }
}

/// Parses the single line `ffprobe` prints for `format=duration`.
pub fn parse_duration(output: &str) -> Result<Option<f64>, ProbeError> {
    let value = output.trim();
    if value.is_empty() || value == "N/A" {
        return Ok(None);
    }
    let seconds: f64 = value
        .parse()
        .map_err(|_| ProbeError::Parse(value.to_string()))?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(ProbeError::Parse(value.to_string()));
    }
    Ok(Some(seconds))
}

async fn run(mut command: Command, tool: &Path) -> Result<Vec<u8>, ProbeError> {
    let tool_name = tool.display().to_string();
    debug!(tool = %tool_name, "running media tool");
    let output = command
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ProbeError::Spawn {
            tool: tool_name.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(ProbeError::Failed {
            tool: tool_name,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}
